//! Requirement → pull request orchestration.
//!
//! [`run_pipeline`] never fails: every outcome, including unexpected errors,
//! comes back as a [`PipelineResult`] with the same set of keys.

use std::time::Instant;

use anyhow::Error;
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};

use crate::core::requirement::Requirement;
use crate::core::slots::{StageId, check_sequence};
use crate::core::types::{ApplySummary, BuildVerdict, FieldError, PipelineStatus};
use crate::invoker::{PipelineContext, StageOutput, bind, invoke};
use crate::io::docker::RunnerError;
use crate::io::executor::StructuredOutputError;
use crate::io::git::GitError;
use crate::io::loader::{LoadError, load_requirement};
use crate::observability::{RunStatus, TimelineEntry};
use crate::runtime::Runtime;

/// `where` for failures no stage claims.
pub const ORCHESTRATOR: &str = "orchestrator";

/// Outcome of one run. All fields serialize, `null` when unknown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
    pub status: PipelineStatus,
    pub branch: Option<String>,
    pub repo: Option<String>,
    pub pr_url: Option<String>,
    pub test_exit_code: Option<i32>,
    pub test_logs: String,
    pub applied: Option<ApplySummary>,
    pub elapsed_seconds: f64,
    #[serde(rename = "where")]
    pub location: Option<String>,
    pub message: Option<String>,
    pub validation_errors: Vec<FieldError>,
    /// Only filled for streamed (verbose) runs.
    pub timeline: Option<Vec<TimelineEntry>>,
}

impl PipelineResult {
    fn empty() -> Self {
        Self {
            status: PipelineStatus::Error,
            branch: None,
            repo: None,
            pr_url: None,
            test_exit_code: None,
            test_logs: String::new(),
            applied: None,
            elapsed_seconds: 0.0,
            location: None,
            message: None,
            validation_errors: Vec::new(),
            timeline: None,
        }
    }

    /// Error result for a failure outside any run (e.g. a busy server).
    pub fn rejected(location: &str, message: impl Into<String>) -> Self {
        Self {
            location: Some(location.to_string()),
            message: Some(message.into()),
            ..Self::empty()
        }
    }

    fn fail(&mut self, location: &str, message: impl Into<String>) {
        self.status = PipelineStatus::Error;
        self.location = Some(location.to_string());
        self.message = Some(message.into());
    }
}

/// A stage-level failure, tagged with the stage that raised it.
struct StageFailure {
    stage: &'static str,
    error: Error,
}

/// Run every stage for the requirement in `source` (a path or inline YAML).
#[instrument(skip_all, fields(stream = stream))]
pub fn run_pipeline(runtime: &Runtime, source: &str, stream: bool) -> PipelineResult {
    let obs = runtime.observability();
    obs.start_run();
    let started = Instant::now();

    let mut result = PipelineResult::empty();
    let mut ctx: Option<PipelineContext> = None;
    let outcome = run_stages(runtime, source, stream, &mut ctx);

    if let Some(ctx) = &ctx {
        fill_from_context(&mut result, ctx);
    }
    match outcome {
        Ok(()) => judge_build(&mut result, ctx.as_ref()),
        Err(failure) => classify(&mut result, failure),
    }

    if let (Some(location), Some(message)) = (&result.location, &result.message) {
        obs.add_message("system", &format!("error in {location}: {message}"));
    }
    obs.finish_run(match result.status {
        PipelineStatus::Success => RunStatus::Success,
        PipelineStatus::Error => RunStatus::Error,
    });
    result.elapsed_seconds = (started.elapsed().as_secs_f64() * 1000.0).round() / 1000.0;
    if stream {
        result.timeline = Some(obs.snapshot().timeline);
    }
    info!(
        status = ?result.status,
        location = ?result.location,
        elapsed_seconds = result.elapsed_seconds,
        "pipeline finished"
    );
    result
}

fn run_stages(
    runtime: &Runtime,
    source: &str,
    stream: bool,
    slot: &mut Option<PipelineContext>,
) -> Result<(), StageFailure> {
    let obs = runtime.observability();
    let req = load_stage(runtime, source)?;

    check_sequence(&StageId::PIPELINE).map_err(|err| StageFailure {
        stage: ORCHESTRATOR,
        error: err.into(),
    })?;
    let ctx = slot.insert(PipelineContext::new(req, stream));

    for stage in StageId::PIPELINE {
        obs.stage_start(stage.name());
        let output = bind(stage, ctx, runtime)
            .map_err(Error::from)
            .and_then(|input| invoke(runtime, input));
        match output {
            Ok(output) => {
                obs.stage_end(stage.name(), Some(&output.preview()));
                if let StageOutput::Tested(result) = &output
                    && result.status != Some(0)
                {
                    warn!(exit_code = ?result.status, "build did not pass");
                }
                ctx.record(output);
            }
            Err(error) => {
                obs.stage_end(stage.name(), Some(&format!("error: {error:#}")));
                return Err(StageFailure {
                    stage: stage.name(),
                    error,
                });
            }
        }
    }
    Ok(())
}

fn load_stage(runtime: &Runtime, source: &str) -> Result<Requirement, StageFailure> {
    let obs = runtime.observability();
    let name = "load_requirement";
    obs.stage_start(name);
    match load_requirement(source) {
        Ok(req) => {
            obs.stage_end(name, Some(&format!("{}: {}", req.id, req.title)));
            Ok(req)
        }
        Err(err) => {
            obs.stage_end(name, Some(&format!("error: {err}")));
            Err(StageFailure {
                stage: err.phase.stage_name(),
                error: err.into(),
            })
        }
    }
}

fn fill_from_context(result: &mut PipelineResult, ctx: &PipelineContext) {
    result.branch = Some(ctx.branch_name.clone());
    result.repo = Some(ctx.requirement.repo.url.clone());
    result.applied = ctx.applied.clone();
    result.pr_url = ctx.pr_url.clone();
    if let Some(test) = &ctx.test_result {
        result.test_exit_code = test.status;
        result.test_logs = test.logs.clone();
    }
}

/// Success iff the build exited 0.
fn judge_build(result: &mut PipelineResult, ctx: Option<&PipelineContext>) {
    let status = ctx.and_then(|c| c.test_result.as_ref()).and_then(|t| t.status);
    let has_result = ctx.is_some_and(|c| c.test_result.is_some());
    match (has_result, BuildVerdict::from_status(status)) {
        (true, BuildVerdict::Passed) => result.status = PipelineStatus::Success,
        (true, BuildVerdict::Failed(code)) => {
            result.fail(StageId::BuildAndTest.name(), format!("build exited with status {code}"));
        }
        (true, BuildVerdict::StatusUnknown) => result.fail(
            StageId::BuildAndTest.name(),
            "status unknown: the runner did not report an exit status",
        ),
        (false, _) => result.fail(ORCHESTRATOR, "pipeline finished without a build result"),
    }
}

fn find_cause<T: std::error::Error + 'static>(error: &Error) -> Option<&T> {
    error.chain().find_map(|cause| cause.downcast_ref::<T>())
}

fn classify(result: &mut PipelineResult, failure: StageFailure) {
    let StageFailure { stage, error } = failure;

    if let Some(err) = find_cause::<LoadError>(&error) {
        result.fail(err.phase.stage_name(), err.message.clone());
        result.validation_errors = err.errors.clone();
        warn!(location = err.phase.stage_name(), "requirement rejected");
        return;
    }
    if let Some(err) = find_cause::<StructuredOutputError>(&error) {
        result.fail(&err.stage, err.to_string());
        result.validation_errors = err.errors.clone();
        warn!(location = %err.stage, "agent output rejected");
        return;
    }
    if let Some(err) = find_cause::<RunnerError>(&error)
        && matches!(err, RunnerError::Timeout { .. } | RunnerError::MountDenied { .. })
    {
        result.fail(StageId::BuildAndTest.name(), err.to_string());
        if let Some(logs) = err.logs() {
            result.test_logs = logs;
        }
        warn!(err = %err, "build runner failed");
        return;
    }
    if let Some(err) = find_cause::<GitError>(&error)
        && matches!(err, GitError::PushRejected { .. })
    {
        result.fail(stage, err.to_string());
        warn!(stage, "push rejected");
        return;
    }

    error!(stage, err = %format!("{error:#}"), "unhandled pipeline failure");
    result.fail(ORCHESTRATOR, format!("{error:#}"));
}
