//! Shared deterministic types for pipeline stages.
//!
//! These types are the contracts passed between stages. They carry no I/O
//! handles and serialize to the stable JSON shapes returned to callers.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A single field-level problem found while validating structured input.
///
/// `loc` is a JSON-pointer-like location (`/build/command`), empty for the
/// document root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub loc: String,
    pub msg: String,
}

impl FieldError {
    pub fn new(loc: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            loc: loc.into(),
            msg: msg.into(),
        }
    }
}

/// Render field errors as `loc: msg` lines for log and error messages.
pub fn describe_field_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|err| {
            if err.loc.is_empty() {
                err.msg.clone()
            } else {
                format!("{}: {}", err.loc, err.msg)
            }
        })
        .collect::<Vec<_>>()
        .join("; ")
}

/// Output of workspace preparation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceInfo {
    /// Local checkout (`<workspace_dir>/<run_id>/repo`).
    pub repo_dir: PathBuf,
    /// Repository owner parsed from the remote URL (empty when unknown).
    pub owner: String,
    /// Repository name parsed from the remote URL (empty when unknown).
    pub repo_name: String,
    /// Feature branch checked out for this run.
    pub branch: String,
    /// Branch the feature branch was created from.
    pub base_branch: String,
}

impl WorkspaceInfo {
    /// Directory holding the checkout and per-run artifacts.
    pub fn job_dir(&self) -> PathBuf {
        self.repo_dir
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.repo_dir.clone())
    }
}

/// Summary plus ordered list of files a plan intends to touch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangePlan {
    pub summary: String,
    #[serde(default)]
    pub touched_files: Vec<String>,
}

/// Kind of change carried by a [`FileEdit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EditAction {
    Create,
    Modify,
    Delete,
}

impl EditAction {
    /// Parse a model-provided action, case-insensitively.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "create" => Some(Self::Create),
            "modify" => Some(Self::Modify),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Modify => "modify",
            Self::Delete => "delete",
        }
    }
}

/// One atomic, validated change to the working tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEdit {
    pub action: EditAction,
    /// Repo-relative, `/`-separated path.
    pub path: String,
    /// New file contents. Ignored for deletes.
    #[serde(default)]
    pub content: String,
}

/// Counts and file lists produced by applying edits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplySummary {
    pub applied_count: usize,
    pub deleted_count: usize,
    pub applied_files: Vec<String>,
    pub deleted_files: Vec<String>,
    pub skipped_files: Vec<String>,
}

/// Outcome of the containerized build/test step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    /// Exit status of the build command. `None` when the runner could not
    /// determine one.
    pub status: Option<i32>,
    /// Combined stdout/stderr, bounded for transport.
    pub logs: String,
}

/// Result of committing and pushing the working tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    /// HEAD sha after the commit (or unchanged HEAD when nothing was dirty).
    pub last_commit: String,
    /// Whether a new commit was created and pushed.
    pub changed: bool,
}

/// Overall result status of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStatus {
    Success,
    Error,
}

/// Verdict derived from a [`TestResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildVerdict {
    Passed,
    Failed(i32),
    /// The runner did not report an exit status.
    StatusUnknown,
}

impl BuildVerdict {
    pub fn from_status(status: Option<i32>) -> Self {
        match status {
            Some(0) => Self::Passed,
            Some(code) => Self::Failed(code),
            None => Self::StatusUnknown,
        }
    }
}
