//! HTTP route handlers.

use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use codeops::io::search::SearchResult;
use codeops::observability::Snapshot;
use codeops::pipeline::{PipelineResult, run_pipeline};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::state::AppState;

/// `where` reported for failures of the HTTP layer itself.
const SERVER: &str = "server";

/// Build the router (without state).
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/run", post(run))
        .route("/search", get(search))
}

async fn health() -> &'static str {
    "ok"
}

/// GET /status - current tracker snapshot.
async fn status(State(state): State<AppState>) -> Json<Snapshot> {
    Json(state.runtime.observability().snapshot())
}

#[derive(Debug, Deserialize)]
struct RunRequest {
    requirement_source: String,
    #[serde(default)]
    verbose: bool,
}

/// POST /run - run the pipeline to completion on a blocking worker.
async fn run(
    State(state): State<AppState>,
    Json(body): Json<RunRequest>,
) -> (StatusCode, Json<PipelineResult>) {
    let Some(guard) = state.try_start_run() else {
        warn!("rejecting run: another run is active");
        return (
            StatusCode::CONFLICT,
            Json(PipelineResult::rejected(SERVER, "a run is already in progress")),
        );
    };

    let runtime = state.runtime.clone();
    info!(verbose = body.verbose, "starting pipeline run");
    let joined = tokio::task::spawn_blocking(move || {
        let _guard = guard;
        run_pipeline(&runtime, &body.requirement_source, body.verbose)
    })
    .await;

    match joined {
        Ok(result) => (StatusCode::OK, Json(result)),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(PipelineResult::rejected(SERVER, format!("run task failed: {err}"))),
        ),
    }
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    q: String,
    #[serde(default)]
    repo_dir: Option<String>,
}

/// GET /search?q=…&repo_dir=… - ripgrep snippets; defaults to the last
/// prepared workspace.
async fn search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<SearchResult>, (StatusCode, Json<Value>)> {
    let runtime = state.runtime.clone();
    let joined = tokio::task::spawn_blocking(move || {
        let dir = params.repo_dir.as_deref().map(std::path::Path::new);
        runtime.search(&params.q, dir)
    })
    .await;

    match joined {
        Ok(Ok(result)) => Ok(Json(result)),
        Ok(Err(err)) => Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": format!("{err:#}") })),
        )),
        Err(err) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": format!("search task failed: {err}") })),
        )),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::Request;
    use codeops::io::config::AppConfig;
    use codeops::runtime::Runtime;
    use codeops::test_support::{
        SAMPLE_REQUIREMENT_YAML, ScriptedBuild, ScriptedExecutor, ScriptedPullRequests,
        ScriptedVcs, happy_agent_outputs,
    };
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    pub(crate) fn test_state() -> AppState {
        let jobs = std::env::temp_dir().join(format!("codeops-server-test-{}", std::process::id()));
        let runtime = Runtime::builder(AppConfig::default())
            .agent(Arc::new(ScriptedExecutor::new(happy_agent_outputs())))
            .vcs(ScriptedVcs::new(jobs))
            .builds(ScriptedBuild::exit(Some(0)))
            .pull_requests(ScriptedPullRequests::new(None))
            .build()
            .expect("runtime");
        AppState::new(Arc::new(runtime))
    }

    async fn send(state: AppState, request: Request<Body>) -> (StatusCode, Value) {
        let response = router()
            .with_state(state)
            .oneshot(request)
            .await
            .expect("response");
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    fn run_request(source: &str) -> Request<Body> {
        Request::post("/run")
            .header("content-type", "application/json")
            .body(Body::from(
                json!({ "requirement_source": source, "verbose": true }).to_string(),
            ))
            .expect("request")
    }

    #[tokio::test]
    async fn health_is_ok() {
        let response = router()
            .with_state(test_state())
            .oneshot(Request::get("/health").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn status_starts_idle() {
        let (status, body) = send(
            test_state(),
            Request::get("/status").body(Body::empty()).expect("request"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "idle");
    }

    #[tokio::test]
    async fn run_returns_the_pipeline_result() {
        let state = test_state();
        let (status, body) = send(state.clone(), run_request(SAMPLE_REQUIREMENT_YAML)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "success", "{body}");
        assert!(body["timeline"].is_array());
        assert!(!state.is_busy());
        assert_eq!(state.runtime.observability().snapshot().status.as_str(), "success");
    }

    #[tokio::test]
    async fn invalid_requirement_is_a_structured_error() {
        let (status, body) = send(test_state(), run_request("id: [broken")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "error");
        assert_eq!(body["where"], "parse_requirement");
    }

    #[tokio::test]
    async fn second_run_while_busy_conflicts() {
        let state = test_state();
        let _held = state.try_start_run().expect("slot");
        let (status, body) = send(state.clone(), run_request(SAMPLE_REQUIREMENT_YAML)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["where"], "server");
        assert_eq!(body["status"], "error");
        assert!(body.get("validation_errors").is_some());
    }

    #[tokio::test]
    async fn search_without_workspace_is_bad_request() {
        let (status, body) = send(
            test_state(),
            Request::get("/search?q=greet").body(Body::empty()).expect("request"),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().expect("error").contains("no workspace"));
    }
}
