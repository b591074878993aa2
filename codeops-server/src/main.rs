//! codeops HTTP server: run requirements and watch progress.

mod routes;
mod sse;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use axum::routing::get;
use clap::Parser;
use codeops::io::config::load_with_env;
use codeops::runtime::Runtime;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::state::AppState;

#[derive(Parser)]
#[command(name = "codeops-server")]
#[command(about = "HTTP API for running requirements through the codeops pipeline")]
struct Args {
    /// Address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Port to listen on
    #[arg(long, default_value = "8080")]
    port: u16,

    /// TOML config file (defaults apply when missing)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("codeops_server=info".parse()?),
        )
        .init();

    let args = Args::parse();

    // The runtime owns blocking HTTP and process clients, so it is built
    // off the async executor.
    let config_path = args.config.clone();
    let runtime = tokio::task::spawn_blocking(move || {
        let config = load_with_env(config_path.as_deref())?;
        Runtime::from_config(config)
    })
    .await
    .context("runtime init task")??;
    info!(
        workspace_dir = %runtime.config().workspace_dir.display(),
        "runtime ready"
    );

    let state = AppState::new(Arc::new(runtime));
    sse::start_snapshot_watcher(state.clone());

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .merge(routes::router())
        .route("/events", get(sse::events_handler))
        .layer(cors)
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;
    info!(addr = %addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
