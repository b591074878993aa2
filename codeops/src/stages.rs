//! Pipeline stage bodies.
//!
//! Each function does one step against the runtime's collaborators. Binding
//! and bookkeeping live in [`crate::invoker`] and [`crate::pipeline`].

use std::fs;

use anyhow::Result;
use tracing::{debug, info, instrument, warn};

use crate::core::edits::{RawEditList, sanitize_edits};
use crate::core::requirement::Requirement;
use crate::core::text::{LOG_TRUNCATED, truncate_chars};
use crate::core::types::{ApplySummary, ChangePlan, CommitInfo, FileEdit, TestResult, WorkspaceInfo};
use crate::invoker::ToolContext;
use crate::io::apply::apply_edits;
use crate::io::docker::PullOutcome;
use crate::io::executor::{ExecRequest, structured_output};
use crate::io::github::PrTarget;
use crate::io::inventory::{DEFAULT_MAX_FILES, inventory_text};
use crate::io::schema::{CHANGE_PLAN, FILE_EDITS};
use crate::runtime::Runtime;

#[instrument(skip_all, fields(id = %req.id, branch = branch_name))]
pub fn prepare_workspace(
    runtime: &Runtime,
    req: &Requirement,
    branch_name: &str,
) -> Result<WorkspaceInfo> {
    let info = runtime
        .vcs()
        .prepare(&req.id, &req.repo.url, branch_name, &req.repo.default_branch)?;
    runtime.remember_workspace(&info);
    Ok(info)
}

#[instrument(skip_all, fields(id = %req.id))]
pub fn plan_changes(
    tool: ToolContext<'_>,
    req: &Requirement,
    ws: &WorkspaceInfo,
    stream: bool,
) -> Result<ChangePlan> {
    let inventory = inventory_text(&ws.repo_dir, DEFAULT_MAX_FILES);
    let prompt = tool.prompts.plan(req, &inventory)?;
    tool.obs.add_message("user", &prompt);

    let request = ExecRequest::for_stage(
        &ws.job_dir(),
        &ws.repo_dir,
        "plan_changes",
        prompt,
        tool.settings,
        stream,
    );
    let plan: ChangePlan = structured_output(tool.agent, &request, &CHANGE_PLAN, "plan_changes")?;
    tool.obs.add_message("assistant", &serde_json::to_string(&plan)?);
    info!(files = plan.touched_files.len(), "change plan ready");
    Ok(plan)
}

#[instrument(skip_all, fields(id = %req.id))]
pub fn generate_changes(
    tool: ToolContext<'_>,
    req: &Requirement,
    plan: &ChangePlan,
    ws: &WorkspaceInfo,
    stream: bool,
) -> Result<Vec<FileEdit>> {
    let prompt = tool.prompts.generate(req, plan, &ws.repo_dir)?;
    tool.obs.add_message("user", &prompt);

    let request = ExecRequest::for_stage(
        &ws.job_dir(),
        &ws.repo_dir,
        "generate_changes",
        prompt,
        tool.settings,
        stream,
    );
    let raw: RawEditList =
        structured_output(tool.agent, &request, &FILE_EDITS, "generate_changes")?;
    let (edits, dropped) = sanitize_edits(raw.edits);
    for edit in &dropped {
        warn!(action = %edit.action, path = %edit.path, reason = edit.reason, "dropping edit");
        tool.obs.add_message(
            "system",
            &format!("dropped edit {} {}: {}", edit.action, edit.path, edit.reason),
        );
    }
    tool.obs.add_message("assistant", &serde_json::to_string(&edits)?);
    info!(kept = edits.len(), dropped = dropped.len(), "edits generated");
    Ok(edits)
}

pub fn apply_changes(ws: &WorkspaceInfo, changes: &[FileEdit]) -> ApplySummary {
    apply_edits(&ws.repo_dir, changes)
}

/// Name of the untruncated build log inside the artifacts directory.
pub const BUILD_LOG: &str = "build.log";

/// Build and test in the runner. A non-zero exit is a result, not an error.
///
/// The returned logs are bounded; the full output is saved to
/// [`BUILD_LOG`] under the requirement's artifacts directory when possible.
#[instrument(skip_all, fields(id = %req.id, image = %req.build.container_image))]
pub fn build_and_test(runtime: &Runtime, req: &Requirement, ws: &WorkspaceInfo) -> Result<TestResult> {
    let out = runtime.builds().build_and_test(&req.build, &ws.repo_dir)?;
    let obs = runtime.observability();
    match &out.pull {
        PullOutcome::Skipped => {}
        PullOutcome::Pulled => obs.record_outcome("pull image", Ok(())),
        PullOutcome::Failed(reason) => obs.record_outcome("pull image", Err(reason.as_str())),
    }

    let dir = req.artifacts_path(&ws.job_dir());
    let log_path = dir.join(BUILD_LOG);
    match fs::create_dir_all(&dir).and_then(|()| fs::write(&log_path, &out.logs)) {
        Ok(()) => debug!(path = %log_path.display(), "saved build log"),
        Err(err) => obs.record_outcome("save build log", Err(err.to_string().as_str())),
    }

    Ok(TestResult {
        status: out.status,
        logs: truncate_chars(&out.logs, runtime.config().runner.log_limit_chars, LOG_TRUNCATED),
    })
}

#[instrument(skip_all, fields(id = %req.id))]
pub fn commit_and_push(runtime: &Runtime, req: &Requirement, ws: &WorkspaceInfo) -> Result<CommitInfo> {
    let message = format!("{}: {}", req.id, req.title);
    runtime.vcs().commit_and_push(&ws.repo_dir, &message)
}

/// Open the PR when the requirement asks for one and a credential exists.
#[instrument(skip_all, fields(id = %req.id))]
pub fn open_pull_request(
    runtime: &Runtime,
    req: &Requirement,
    ws: &WorkspaceInfo,
    commit: Option<&CommitInfo>,
) -> Result<Option<String>> {
    if !req.wants_pr() {
        info!("pull request not requested");
        return Ok(None);
    }
    let pulls = runtime.pull_requests();
    if !pulls.has_credentials() {
        info!("no GitHub credential configured, skipping pull request");
        return Ok(None);
    }
    let target = PrTarget {
        owner: &ws.owner,
        repo: &ws.repo_name,
        head_branch: &ws.branch,
        head_sha: commit.map(|c| c.last_commit.as_str()),
    };
    pulls.open_pr(req, &target, runtime.observability())
}
