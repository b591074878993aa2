//! Static stage → context-slot table.
//!
//! Every pipeline stage declares which pieces of run context it consumes and
//! which one it produces. Binding is resolved from this table, so the whole
//! stage sequence can be checked before anything runs.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// A named piece of pipeline context a stage can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Slot {
    Requirement,
    BranchName,
    Stream,
    ToolContext,
    Workspace,
    Plan,
    Changes,
    TestResult,
    Commit,
}

impl Slot {
    pub fn name(self) -> &'static str {
        match self {
            Self::Requirement => "requirement",
            Self::BranchName => "branch_name",
            Self::Stream => "stream",
            Self::ToolContext => "tool_context",
            Self::Workspace => "workspace",
            Self::Plan => "plan",
            Self::Changes => "changes",
            Self::TestResult => "test_result",
            Self::Commit => "commit",
        }
    }

    /// Slots available from the moment a requirement is loaded.
    ///
    /// `ToolContext` counts as ambient here; whether an agent is actually
    /// registered is checked when binding.
    pub fn is_ambient(self) -> bool {
        matches!(
            self,
            Self::Requirement | Self::BranchName | Self::Stream | Self::ToolContext
        )
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One declared stage parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotSpec {
    pub slot: Slot,
    /// Optional slots are omitted when absent and the stage uses its default.
    pub required: bool,
}

const fn req(slot: Slot) -> SlotSpec {
    SlotSpec {
        slot,
        required: true,
    }
}

const fn opt(slot: Slot) -> SlotSpec {
    SlotSpec {
        slot,
        required: false,
    }
}

const PREPARE_WORKSPACE: &[SlotSpec] = &[req(Slot::Requirement), req(Slot::BranchName)];
const PLAN_CHANGES: &[SlotSpec] = &[
    req(Slot::ToolContext),
    req(Slot::Requirement),
    req(Slot::Workspace),
    opt(Slot::Stream),
];
const GENERATE_CHANGES: &[SlotSpec] = &[
    req(Slot::ToolContext),
    req(Slot::Requirement),
    req(Slot::Plan),
    req(Slot::Workspace),
    opt(Slot::Stream),
];
const APPLY_CHANGES: &[SlotSpec] = &[req(Slot::Workspace), req(Slot::Changes)];
const BUILD_AND_TEST: &[SlotSpec] = &[req(Slot::Requirement), req(Slot::Workspace)];
const COMMIT_AND_PUSH: &[SlotSpec] = &[req(Slot::Requirement), req(Slot::Workspace)];
const OPEN_PULL_REQUEST: &[SlotSpec] = &[
    req(Slot::Requirement),
    req(Slot::Workspace),
    opt(Slot::Commit),
];

/// The fixed pipeline steps after requirement loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    PrepareWorkspace,
    PlanChanges,
    GenerateChanges,
    ApplyChanges,
    BuildAndTest,
    CommitAndPush,
    OpenPullRequest,
}

impl StageId {
    /// Stage order for every run.
    pub const PIPELINE: [StageId; 7] = [
        Self::PrepareWorkspace,
        Self::PlanChanges,
        Self::GenerateChanges,
        Self::ApplyChanges,
        Self::BuildAndTest,
        Self::CommitAndPush,
        Self::OpenPullRequest,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::PrepareWorkspace => "prepare_workspace",
            Self::PlanChanges => "plan_changes",
            Self::GenerateChanges => "generate_changes",
            Self::ApplyChanges => "apply_changes",
            Self::BuildAndTest => "build_and_test",
            Self::CommitAndPush => "commit_and_push",
            Self::OpenPullRequest => "open_pull_request",
        }
    }

    /// Declared parameters, in signature order.
    pub fn slots(self) -> &'static [SlotSpec] {
        match self {
            Self::PrepareWorkspace => PREPARE_WORKSPACE,
            Self::PlanChanges => PLAN_CHANGES,
            Self::GenerateChanges => GENERATE_CHANGES,
            Self::ApplyChanges => APPLY_CHANGES,
            Self::BuildAndTest => BUILD_AND_TEST,
            Self::CommitAndPush => COMMIT_AND_PUSH,
            Self::OpenPullRequest => OPEN_PULL_REQUEST,
        }
    }

    /// Context slot filled by this stage's output, if any.
    pub fn produces(self) -> Option<Slot> {
        match self {
            Self::PrepareWorkspace => Some(Slot::Workspace),
            Self::PlanChanges => Some(Slot::Plan),
            Self::GenerateChanges => Some(Slot::Changes),
            Self::ApplyChanges => None,
            Self::BuildAndTest => Some(Slot::TestResult),
            Self::CommitAndPush => Some(Slot::Commit),
            Self::OpenPullRequest => None,
        }
    }

    /// Human-readable signature, e.g. `plan_changes(tool_context, requirement, workspace, stream?)`.
    pub fn signature(self) -> String {
        let params: Vec<String> = self
            .slots()
            .iter()
            .map(|spec| {
                if spec.required {
                    spec.slot.name().to_string()
                } else {
                    format!("{}?", spec.slot.name())
                }
            })
            .collect();
        format!("{}({})", self.name(), params.join(", "))
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BindError {
    #[error("cannot invoke {signature}: required context slot '{slot}' is not available")]
    MissingSlot {
        stage: StageId,
        slot: Slot,
        signature: String,
    },
    #[error(
        "cannot invoke {signature}: it needs a tool context but no agent is registered in the runtime"
    )]
    NoAgent { stage: StageId, signature: String },
}

/// Check that every required slot of every stage is ambient or produced by an
/// earlier stage in `stages`.
pub fn check_sequence(stages: &[StageId]) -> Result<(), BindError> {
    let mut produced: Vec<Slot> = Vec::new();
    for &stage in stages {
        for spec in stage.slots() {
            if spec.required && !spec.slot.is_ambient() && !produced.contains(&spec.slot) {
                return Err(BindError::MissingSlot {
                    stage,
                    slot: spec.slot,
                    signature: stage.signature(),
                });
            }
        }
        if let Some(slot) = stage.produces() {
            produced.push(slot);
        }
    }
    Ok(())
}
