//! Requirement model: the validated description of one change request.
//!
//! Field defaults mirror the requirement YAML format. Structural checks live in
//! the JSON schema (`schemas/requirement.schema.json`); [`Requirement::check`]
//! covers the semantic rules a schema cannot express.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::types::FieldError;

/// Target language hint passed to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Node,
    Java,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoSpec {
    pub url: String,
    #[serde(default = "default_main")]
    pub default_branch: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchSpec {
    pub feature_id: String,
    #[serde(default = "default_name_template")]
    pub name_template: String,
}

impl BranchSpec {
    /// Render the feature branch name from the template.
    pub fn branch_name(&self) -> String {
        self.name_template.replace("{feature_id}", &self.feature_id)
    }
}

/// How to build and test the change inside a runner container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSpec {
    /// Build/test command run inside the container.
    pub command: String,
    /// Image used for the build/test step.
    pub container_image: String,
    #[serde(default = "default_workdir")]
    pub workdir: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub cpu_shares: Option<u32>,
    /// Docker memory limit, e.g. `4g`.
    #[serde(default)]
    pub mem_limit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitHubSpec {
    #[serde(default = "default_true")]
    pub create_pr: bool,
    #[serde(default = "default_main")]
    pub base: String,
    /// Users, or `org/team` slugs for team reviewers.
    #[serde(default)]
    pub reviewers: Vec<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub draft: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeInstruction {
    /// Natural-language instructions for the required change.
    pub description: String,
    #[serde(default)]
    pub test_expectations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub language: Option<Language>,
    pub repo: RepoSpec,
    pub branch: BranchSpec,
    pub build: BuildSpec,
    #[serde(default)]
    pub github: Option<GitHubSpec>,
    pub codegen: CodeInstruction,
    #[serde(default = "default_artifacts_dir")]
    pub artifacts_dir: String,
}

impl Requirement {
    pub fn branch_name(&self) -> String {
        self.branch.branch_name()
    }

    /// Base branch for the pull request.
    pub fn pr_base(&self) -> &str {
        match &self.github {
            Some(gh) => &gh.base,
            None => &self.repo.default_branch,
        }
    }

    /// True if the requirement asks for a pull request.
    pub fn wants_pr(&self) -> bool {
        self.github.as_ref().is_some_and(|gh| gh.create_pr)
    }

    /// Artifacts directory with `{id}` substituted.
    pub fn artifacts_dir(&self) -> String {
        self.artifacts_dir.replace("{id}", &self.id)
    }

    /// Where run artifacts such as full build logs go. Relative directories
    /// are placed under `job_dir`.
    pub fn artifacts_path(&self, job_dir: &Path) -> PathBuf {
        job_dir.join(self.artifacts_dir())
    }

    /// Semantic checks on an already schema-valid requirement.
    pub fn check(&self) -> Vec<FieldError> {
        let mut errors = Vec::new();
        if !is_safe_id(&self.id) {
            errors.push(FieldError::new(
                "/id",
                "must be non-empty and contain only letters, digits, '-', '_' or '.'",
            ));
        }
        if !(self.repo.url.starts_with("http://") || self.repo.url.starts_with("https://")) {
            errors.push(FieldError::new("/repo/url", "must be an http(s) URL"));
        }
        if !self.branch.name_template.contains("{feature_id}") {
            errors.push(FieldError::new(
                "/branch/name_template",
                "must contain the {feature_id} placeholder",
            ));
        }
        let branch = self.branch_name();
        if branch.trim().is_empty() || branch.contains(' ') || branch.contains("..") {
            errors.push(FieldError::new(
                "/branch",
                format!("rendered branch name '{branch}' is not a valid git ref"),
            ));
        }
        if self.build.timeout_seconds == 0 {
            errors.push(FieldError::new("/build/timeout_seconds", "must be > 0"));
        }
        if !self.build.workdir.starts_with('/') {
            errors.push(FieldError::new(
                "/build/workdir",
                "must be an absolute container path",
            ));
        }
        errors
    }
}

fn is_safe_id(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

fn default_main() -> String {
    "main".to_string()
}

fn default_name_template() -> String {
    "feature/{feature_id}".to_string()
}

fn default_workdir() -> String {
    "/workspace".to_string()
}

fn default_timeout_seconds() -> u64 {
    1800
}

fn default_true() -> bool {
    true
}

fn default_artifacts_dir() -> String {
    "/workspace/jobs/{id}".to_string()
}
