//! Thin wrapper around `git` subprocess calls.
//!
//! Arguments may carry a credential-bearing remote URL, so every message that
//! leaves this module passes through [`Git::redact`].

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// Git failures callers branch on.
#[derive(Debug, Error)]
pub enum GitError {
    #[error("git push of '{branch}' was rejected: {stderr}\n{hints}")]
    PushRejected {
        branch: String,
        stderr: String,
        hints: String,
    },
    #[error("git {args} failed: {stderr}")]
    Command { args: String, stderr: String },
}

pub const PUSH_HINTS: &str = "hints:\n\
    - check that GITHUB_TOKEN has the `repo` (or `public_repo`) scope and write access\n\
    - if you cannot push to this repository, fork it and point repo.url at the fork\n\
    - make sure the branch is not protected against direct pushes";

/// Git commands run in one working directory.
#[derive(Debug, Clone)]
pub struct Git {
    bin: String,
    workdir: PathBuf,
    secret: Option<String>,
}

impl Git {
    pub fn new(bin: impl Into<String>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            bin: bin.into(),
            workdir: workdir.into(),
            secret: None,
        }
    }

    /// Scrub `secret` from any command line or stderr this wrapper reports.
    pub fn with_secret(mut self, secret: Option<&str>) -> Self {
        self.secret = secret.filter(|s| !s.is_empty()).map(str::to_string);
        self
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// `git clone <url> <dest>`, run from `dest`'s parent.
    #[instrument(skip_all, fields(dest = %dest.display()))]
    pub fn clone_into(&self, url: &str, dest: &Path) -> Result<()> {
        let parent = dest.parent().unwrap_or(Path::new("."));
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
        let dest_arg = dest.to_string_lossy();
        let output = self.command_in(parent, &["clone", url, &dest_arg])?;
        self.check(&["clone", url, &dest_arg], output)?;
        debug!("clone complete");
        Ok(())
    }

    pub fn fetch(&self, remote: &str, refspec: &str) -> Result<()> {
        self.run_checked(&["fetch", remote, refspec]).map(drop)
    }

    pub fn pull(&self, remote: &str, branch: &str) -> Result<()> {
        self.run_checked(&["pull", remote, branch]).map(drop)
    }

    #[instrument(skip_all, fields(branch = branch))]
    pub fn checkout_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "checking out branch");
        self.run_checked(&["checkout", branch]).map(drop)
    }

    /// Create `branch` at HEAD, or switch to it if it already exists.
    #[instrument(skip_all, fields(branch = branch))]
    pub fn checkout_new_or_existing(&self, branch: &str) -> Result<()> {
        let created = self.run(&["checkout", "-b", branch])?;
        if created.status.success() {
            debug!(branch, "created branch");
            return Ok(());
        }
        debug!(branch, "branch exists, switching to it");
        self.checkout_branch(branch)
    }

    pub fn set_config(&self, key: &str, value: &str) -> Result<()> {
        self.run_checked(&["config", key, value]).map(drop)
    }

    pub fn set_remote_url(&self, remote: &str, url: &str) -> Result<()> {
        self.run_checked(&["remote", "set-url", remote, url]).map(drop)
    }

    /// Push `branch`, optionally setting upstream. Rejections become
    /// [`GitError::PushRejected`].
    #[instrument(skip_all, fields(branch = branch, set_upstream = set_upstream))]
    pub fn push(&self, remote: &str, branch: &str, set_upstream: bool) -> Result<()> {
        let mut args = vec!["push"];
        if set_upstream {
            args.push("-u");
        }
        args.extend([remote, branch]);
        let output = self.run(&args)?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = self.redact(String::from_utf8_lossy(&output.stderr).trim());
        warn!(branch, stderr = %stderr, "push rejected");
        Err(GitError::PushRejected {
            branch: branch.to_string(),
            stderr,
            hints: PUSH_HINTS.to_string(),
        }
        .into())
    }

    pub fn current_branch(&self) -> Result<String> {
        Ok(self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?.trim().to_string())
    }

    pub fn head_sha(&self) -> Result<String> {
        Ok(self.run_capture(&["rev-parse", "HEAD"])?.trim().to_string())
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"]).map(drop)
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run_checked(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Commit staged changes; returns `false` (and does nothing) when nothing
    /// is staged.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        self.run_checked(&["commit", "-m", message])?;
        Ok(true)
    }

    /// Replace the secret in `text` with `***`.
    pub fn redact(&self, text: &str) -> String {
        match &self.secret {
            Some(secret) => text.replace(secret.as_str(), "***"),
            None => text.to_string(),
        }
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        self.check(args, output)
    }

    fn check(&self, args: &[&str], output: Output) -> Result<Output> {
        if output.status.success() {
            return Ok(output);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(GitError::Command {
            args: self.redact(&args.join(" ")),
            stderr: self.redact(stderr.trim()),
        }
        .into())
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        self.command_in(&self.workdir, args)
    }

    fn command_in(&self, dir: &Path, args: &[&str]) -> Result<Output> {
        Command::new(&self.bin)
            .args(args)
            .current_dir(dir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()
            .with_context(|| format!("spawn git {}", self.redact(&args.join(" "))))
    }
}
