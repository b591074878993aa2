//! Stage binding and dispatch.
//!
//! [`PipelineContext`] is the run's slot store. [`bind`] resolves a stage's
//! declared slots (see [`crate::core::slots`]) into a typed [`StageInput`];
//! [`invoke`] runs it and returns a [`StageOutput`] that
//! [`PipelineContext::record`] folds back into the store.

use anyhow::Result;

use crate::core::requirement::Requirement;
use crate::core::slots::{BindError, Slot, StageId};
use crate::core::text::{ELLIPSIS, truncate_chars};
use crate::core::types::{ApplySummary, ChangePlan, CommitInfo, FileEdit, TestResult, WorkspaceInfo};
use crate::io::config::AgentSettings;
use crate::io::executor::Executor;
use crate::io::prompt::PromptBuilder;
use crate::observability::Observability;
use crate::runtime::Runtime;
use crate::stages;

/// Everything produced so far in one run.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub requirement: Requirement,
    pub branch_name: String,
    pub stream: bool,
    pub workspace: Option<WorkspaceInfo>,
    pub plan: Option<ChangePlan>,
    pub changes: Option<Vec<FileEdit>>,
    pub applied: Option<ApplySummary>,
    pub test_result: Option<TestResult>,
    pub commit: Option<CommitInfo>,
    pub pr_url: Option<String>,
}

impl PipelineContext {
    pub fn new(requirement: Requirement, stream: bool) -> Self {
        Self {
            branch_name: requirement.branch_name(),
            requirement,
            stream,
            workspace: None,
            plan: None,
            changes: None,
            applied: None,
            test_result: None,
            commit: None,
            pr_url: None,
        }
    }

    /// Whether `slot` currently holds a value. `ToolContext` lives in the
    /// runtime, not here.
    pub fn has(&self, slot: Slot) -> bool {
        match slot {
            Slot::Requirement | Slot::BranchName | Slot::Stream => true,
            Slot::ToolContext => false,
            Slot::Workspace => self.workspace.is_some(),
            Slot::Plan => self.plan.is_some(),
            Slot::Changes => self.changes.is_some(),
            Slot::TestResult => self.test_result.is_some(),
            Slot::Commit => self.commit.is_some(),
        }
    }

    pub fn record(&mut self, output: StageOutput) {
        match output {
            StageOutput::Workspace(ws) => self.workspace = Some(ws),
            StageOutput::Plan(plan) => self.plan = Some(plan),
            StageOutput::Changes(changes) => self.changes = Some(changes),
            StageOutput::Applied(summary) => self.applied = Some(summary),
            StageOutput::Tested(result) => self.test_result = Some(result),
            StageOutput::Committed(commit) => self.commit = Some(commit),
            StageOutput::PullRequest(url) => self.pr_url = url,
        }
    }
}

/// Agent access for stages that talk to the model.
#[derive(Clone, Copy)]
pub struct ToolContext<'a> {
    pub agent: &'a (dyn Executor + Send + Sync),
    pub obs: &'a Observability,
    pub settings: &'a AgentSettings,
    pub prompts: &'a PromptBuilder,
}

/// A stage with its slots resolved.
pub enum StageInput<'a> {
    PrepareWorkspace {
        requirement: &'a Requirement,
        branch_name: &'a str,
    },
    PlanChanges {
        tool: ToolContext<'a>,
        requirement: &'a Requirement,
        workspace: &'a WorkspaceInfo,
        stream: bool,
    },
    GenerateChanges {
        tool: ToolContext<'a>,
        requirement: &'a Requirement,
        plan: &'a ChangePlan,
        workspace: &'a WorkspaceInfo,
        stream: bool,
    },
    ApplyChanges {
        workspace: &'a WorkspaceInfo,
        changes: &'a [FileEdit],
    },
    BuildAndTest {
        requirement: &'a Requirement,
        workspace: &'a WorkspaceInfo,
    },
    CommitAndPush {
        requirement: &'a Requirement,
        workspace: &'a WorkspaceInfo,
    },
    OpenPullRequest {
        requirement: &'a Requirement,
        workspace: &'a WorkspaceInfo,
        commit: Option<&'a CommitInfo>,
    },
}

/// What a stage hands back to the context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutput {
    Workspace(WorkspaceInfo),
    Plan(ChangePlan),
    Changes(Vec<FileEdit>),
    Applied(ApplySummary),
    Tested(TestResult),
    Committed(CommitInfo),
    PullRequest(Option<String>),
}

impl StageOutput {
    /// Short text for the stage timeline.
    pub fn preview(&self) -> String {
        let text = match self {
            Self::Workspace(ws) => format!("{} on {}", ws.repo_dir.display(), ws.branch),
            Self::Plan(plan) => format!("{} ({} files)", plan.summary, plan.touched_files.len()),
            Self::Changes(edits) => edits
                .iter()
                .map(|e| format!("{} {}", e.action.as_str(), e.path))
                .collect::<Vec<_>>()
                .join(", "),
            Self::Applied(s) => format!(
                "applied {} (deleted {}, skipped {})",
                s.applied_count,
                s.deleted_count,
                s.skipped_files.len()
            ),
            Self::Tested(result) => match result.status {
                Some(code) => format!("exit {code}"),
                None => "exit status unknown".to_string(),
            },
            Self::Committed(commit) if commit.changed => format!("pushed {}", commit.last_commit),
            Self::Committed(_) => "nothing to commit".to_string(),
            Self::PullRequest(Some(url)) => url.clone(),
            Self::PullRequest(None) => "skipped".to_string(),
        };
        truncate_chars(&text, PREVIEW_CHARS, ELLIPSIS)
    }
}

const PREVIEW_CHARS: usize = 200;

fn missing(stage: StageId, slot: Slot) -> BindError {
    BindError::MissingSlot {
        stage,
        slot,
        signature: stage.signature(),
    }
}

fn need<T: ?Sized>(stage: StageId, slot: Slot, value: Option<&T>) -> Result<&T, BindError> {
    value.ok_or_else(|| missing(stage, slot))
}

fn tool_context(stage: StageId, runtime: &Runtime) -> Result<ToolContext<'_>, BindError> {
    let agent = runtime.agent().ok_or_else(|| BindError::NoAgent {
        stage,
        signature: stage.signature(),
    })?;
    Ok(ToolContext {
        agent: &**agent,
        obs: runtime.observability(),
        settings: &runtime.config().agent,
        prompts: runtime.prompts(),
    })
}

/// Resolve `stage`'s declared slots from `ctx` and `runtime`.
///
/// Every required slot is checked against the declaration before the input
/// is built, so the error always names the first missing slot in declared
/// order.
pub fn bind<'a>(
    stage: StageId,
    ctx: &'a PipelineContext,
    runtime: &'a Runtime,
) -> Result<StageInput<'a>, BindError> {
    for spec in stage.slots().iter().filter(|spec| spec.required) {
        match spec.slot {
            Slot::ToolContext => {
                tool_context(stage, runtime)?;
            }
            slot if !ctx.has(slot) => return Err(missing(stage, slot)),
            _ => {}
        }
    }

    let req = &ctx.requirement;
    let ws = || need(stage, Slot::Workspace, ctx.workspace.as_ref());
    let input = match stage {
        StageId::PrepareWorkspace => StageInput::PrepareWorkspace {
            requirement: req,
            branch_name: &ctx.branch_name,
        },
        StageId::PlanChanges => StageInput::PlanChanges {
            tool: tool_context(stage, runtime)?,
            requirement: req,
            workspace: ws()?,
            stream: ctx.stream,
        },
        StageId::GenerateChanges => StageInput::GenerateChanges {
            tool: tool_context(stage, runtime)?,
            requirement: req,
            plan: need(stage, Slot::Plan, ctx.plan.as_ref())?,
            workspace: ws()?,
            stream: ctx.stream,
        },
        StageId::ApplyChanges => StageInput::ApplyChanges {
            workspace: ws()?,
            changes: need(stage, Slot::Changes, ctx.changes.as_deref())?,
        },
        StageId::BuildAndTest => StageInput::BuildAndTest {
            requirement: req,
            workspace: ws()?,
        },
        StageId::CommitAndPush => StageInput::CommitAndPush {
            requirement: req,
            workspace: ws()?,
        },
        StageId::OpenPullRequest => StageInput::OpenPullRequest {
            requirement: req,
            workspace: ws()?,
            commit: ctx.commit.as_ref(),
        },
    };
    Ok(input)
}

/// Run a bound stage.
pub fn invoke(runtime: &Runtime, input: StageInput<'_>) -> Result<StageOutput> {
    let output = match input {
        StageInput::PrepareWorkspace {
            requirement,
            branch_name,
        } => StageOutput::Workspace(stages::prepare_workspace(runtime, requirement, branch_name)?),
        StageInput::PlanChanges {
            tool,
            requirement,
            workspace,
            stream,
        } => StageOutput::Plan(stages::plan_changes(tool, requirement, workspace, stream)?),
        StageInput::GenerateChanges {
            tool,
            requirement,
            plan,
            workspace,
            stream,
        } => StageOutput::Changes(stages::generate_changes(
            tool,
            requirement,
            plan,
            workspace,
            stream,
        )?),
        StageInput::ApplyChanges { workspace, changes } => {
            StageOutput::Applied(stages::apply_changes(workspace, changes))
        }
        StageInput::BuildAndTest {
            requirement,
            workspace,
        } => StageOutput::Tested(stages::build_and_test(runtime, requirement, workspace)?),
        StageInput::CommitAndPush {
            requirement,
            workspace,
        } => StageOutput::Committed(stages::commit_and_push(runtime, requirement, workspace)?),
        StageInput::OpenPullRequest {
            requirement,
            workspace,
            commit,
        } => StageOutput::PullRequest(stages::open_pull_request(
            runtime,
            requirement,
            workspace,
            commit,
        )?),
    };
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::AppConfig;
    use crate::test_support::{ScriptedExecutor, sample_requirement};
    use std::path::PathBuf;
    use std::sync::Arc;

    fn workspace() -> WorkspaceInfo {
        WorkspaceInfo {
            repo_dir: PathBuf::from("/jobs/REQ-1/repo"),
            owner: "acme".to_string(),
            repo_name: "widgets".to_string(),
            branch: "feature/REQ-1".to_string(),
            base_branch: "main".to_string(),
        }
    }

    fn bare_runtime() -> Runtime {
        Runtime::builder(AppConfig::default()).build().expect("runtime")
    }

    fn runtime_with_agent() -> Runtime {
        Runtime::builder(AppConfig::default())
            .agent(Arc::new(ScriptedExecutor::silent()))
            .build()
            .expect("runtime")
    }

    #[test]
    fn prepare_binds_from_ambient_slots() {
        let rt = bare_runtime();
        let ctx = PipelineContext::new(sample_requirement(), false);
        let input = bind(StageId::PrepareWorkspace, &ctx, &rt).expect("bind");
        let StageInput::PrepareWorkspace { branch_name, .. } = input else {
            panic!("wrong variant");
        };
        assert_eq!(branch_name, "feature/REQ-1");
    }

    #[test]
    fn missing_required_slot_names_the_signature() {
        let rt = bare_runtime();
        let ctx = PipelineContext::new(sample_requirement(), false);
        let Err(err) = bind(StageId::ApplyChanges, &ctx, &rt) else {
            panic!("apply_changes should not bind without a workspace");
        };
        assert_eq!(
            err,
            BindError::MissingSlot {
                stage: StageId::ApplyChanges,
                slot: Slot::Workspace,
                signature: StageId::ApplyChanges.signature(),
            }
        );
        assert!(err.to_string().contains("apply_changes(workspace, changes)"));
    }

    #[test]
    fn tool_stage_without_agent_fails_immediately() {
        let rt = bare_runtime();
        let mut ctx = PipelineContext::new(sample_requirement(), false);
        ctx.workspace = Some(workspace());
        let Err(err) = bind(StageId::PlanChanges, &ctx, &rt) else {
            panic!("plan_changes should not bind without an agent");
        };
        assert!(matches!(err, BindError::NoAgent { stage: StageId::PlanChanges, .. }));
    }

    #[test]
    fn optional_commit_is_omitted_when_absent() {
        let rt = bare_runtime();
        let mut ctx = PipelineContext::new(sample_requirement(), true);
        ctx.workspace = Some(workspace());
        let input = bind(StageId::OpenPullRequest, &ctx, &rt).expect("bind");
        assert!(matches!(input, StageInput::OpenPullRequest { commit: None, .. }));
    }

    #[test]
    fn stream_flag_is_bound_by_slot() {
        let rt = runtime_with_agent();
        let mut ctx = PipelineContext::new(sample_requirement(), true);
        ctx.workspace = Some(workspace());
        let input = bind(StageId::PlanChanges, &ctx, &rt).expect("bind");
        assert!(matches!(input, StageInput::PlanChanges { stream: true, .. }));
    }

    #[test]
    fn record_fills_slots() {
        let mut ctx = PipelineContext::new(sample_requirement(), false);
        assert!(!ctx.has(Slot::Workspace));
        ctx.record(StageOutput::Workspace(workspace()));
        ctx.record(StageOutput::PullRequest(Some("https://github.com/acme/widgets/pull/7".into())));
        assert!(ctx.has(Slot::Workspace));
        assert_eq!(ctx.pr_url.as_deref(), Some("https://github.com/acme/widgets/pull/7"));
    }

    #[test]
    fn previews_are_short() {
        let preview = StageOutput::Tested(TestResult {
            status: None,
            logs: String::new(),
        })
        .preview();
        assert_eq!(preview, "exit status unknown");
        let long = StageOutput::Plan(ChangePlan {
            summary: "x".repeat(500),
            touched_files: Vec::new(),
        })
        .preview();
        assert_eq!(long.chars().count(), 201);
        assert!(long.ends_with(ELLIPSIS));
    }
}
