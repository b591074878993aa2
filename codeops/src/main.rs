//! `codeops`: run a requirement through the pipeline from the command line.
//!
//! Results are printed to stdout as JSON; diagnostics go to stderr.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use codeops::core::types::{FieldError, PipelineStatus};
use codeops::exit_codes;
use codeops::io::config::load_with_env;
use codeops::io::loader::load_requirement;
use codeops::pipeline::run_pipeline;
use codeops::runtime::Runtime;

#[derive(Parser)]
#[command(
    name = "codeops",
    version,
    about = "Turn a requirement into a tested branch and pull request"
)]
struct Cli {
    /// TOML config file. Missing files fall back to defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the full pipeline for a requirement file or inline YAML.
    Run {
        requirement: String,
        /// Stream agent events to disk and include the stage timeline.
        #[arg(long)]
        stream: bool,
    },
    /// Load and validate a requirement without running anything.
    Validate { requirement: String },
    /// Search a checkout with ripgrep.
    Search {
        query: String,
        #[arg(long)]
        repo_dir: PathBuf,
    },
}

#[derive(Serialize)]
struct ValidateReport {
    valid: bool,
    #[serde(rename = "where", skip_serializing_if = "Option::is_none")]
    location: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    validation_errors: Vec<FieldError>,
}

fn main() {
    codeops::logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            requirement,
            stream,
        } => cmd_run(cli.config.as_deref(), &requirement, stream),
        Command::Validate { requirement } => cmd_validate(&requirement),
        Command::Search { query, repo_dir } => cmd_search(cli.config.as_deref(), &query, &repo_dir),
    }
}

fn cmd_run(config: Option<&Path>, requirement: &str, stream: bool) -> Result<i32> {
    let config = load_with_env(config)?;
    let runtime = Runtime::from_config(config).context("initialize runtime")?;
    let result = run_pipeline(&runtime, requirement, stream);
    print_json(&result)?;
    Ok(match result.status {
        PipelineStatus::Success => exit_codes::OK,
        PipelineStatus::Error => exit_codes::RUN_FAILED,
    })
}

fn cmd_validate(requirement: &str) -> Result<i32> {
    let report = match load_requirement(requirement) {
        Ok(_) => ValidateReport {
            valid: true,
            location: None,
            message: None,
            validation_errors: Vec::new(),
        },
        Err(err) => ValidateReport {
            valid: false,
            location: Some(err.phase.stage_name()),
            message: Some(err.message),
            validation_errors: err.errors,
        },
    };
    print_json(&report)?;
    Ok(if report.valid {
        exit_codes::OK
    } else {
        exit_codes::INVALID
    })
}

fn cmd_search(config: Option<&Path>, query: &str, repo_dir: &Path) -> Result<i32> {
    let config = load_with_env(config)?;
    let runtime = Runtime::from_config(config).context("initialize runtime")?;
    let result = runtime.search(query, Some(repo_dir))?;
    print_json(&result)?;
    Ok(exit_codes::OK)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize result")?;
    println!("{payload}");
    Ok(())
}
