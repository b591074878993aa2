//! Test-only helpers: a sample requirement, scripted collaborators, and
//! throwaway git repositories and `docker` binaries.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use serde_json::{Value, json};
use tempfile::TempDir;

use crate::core::requirement::{BuildSpec, Requirement};
use crate::core::types::{CommitInfo, WorkspaceInfo};
use crate::io::docker::{BuildExecutor, PullOutcome, RunOutput, RunnerError};
use crate::io::executor::{ExecRequest, Executor};
use crate::io::git::{GitError, PUSH_HINTS};
use crate::io::github::{PrTarget, PullRequests};
use crate::io::loader::parse_requirement;
use crate::io::workspace::Vcs;
use crate::observability::Observability;

pub const SAMPLE_REQUIREMENT_YAML: &str = "\
id: REQ-1
title: Add greeting
language: python
repo:
  url: https://github.com/acme/widgets.git
  default_branch: main
branch:
  feature_id: REQ-1
build:
  command: pytest -q
  container_image: python:3.12-slim
  env:
    PYTHONDONTWRITEBYTECODE: \"1\"
github:
  create_pr: true
  base: main
  reviewers:
    - octocat
    - acme/reviewers
  labels:
    - codeops
codegen:
  description: Add a greet(name) function to src/app.py.
  test_expectations:
    - greet returns a greeting
artifacts_dir: artifacts
";

/// [`SAMPLE_REQUIREMENT_YAML`], parsed.
pub fn sample_requirement() -> Requirement {
    parse_requirement(SAMPLE_REQUIREMENT_YAML).expect("sample requirement is valid")
}

#[cfg(unix)]
pub fn make_executable(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path).expect("stat").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms).expect("chmod");
}

#[cfg(not(unix))]
pub fn make_executable(_path: &Path) {}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Agent outputs for a run that plans and creates one file.
pub fn happy_agent_outputs() -> Vec<Value> {
    vec![
        json!({
            "summary": "Add greet() with a test",
            "touched_files": ["src/app.py", "tests/test_app.py"]
        }),
        json!({
            "edits": [
                {"action": "create", "path": "./src/app.py", "content": "def greet(name):\n    return f'hello {name}'"},
                {"action": "create", "path": "tests/test_app.py", "content": "from src.app import greet\n\ndef test_greet():\n    assert greet('x') == 'hello x'"},
                {"action": "rename", "path": "README.md", "content": null}
            ]
        }),
    ]
}

/// Executor that writes queued JSON documents instead of running an agent.
#[derive(Clone, Default)]
pub struct ScriptedExecutor {
    outputs: Arc<Mutex<VecDeque<Value>>>,
    prompts: Arc<Mutex<Vec<String>>>,
}

impl ScriptedExecutor {
    pub fn new(outputs: Vec<Value>) -> Self {
        Self {
            outputs: Arc::new(Mutex::new(outputs.into())),
            prompts: Arc::default(),
        }
    }

    /// Executor that never writes output.
    pub fn silent() -> Self {
        Self::default()
    }

    pub fn prompts(&self) -> Vec<String> {
        lock(&self.prompts).clone()
    }
}

impl Executor for ScriptedExecutor {
    fn exec(&self, request: &ExecRequest) -> Result<()> {
        lock(&self.prompts).push(request.prompt.clone());
        let Some(output) = lock(&self.outputs).pop_front() else {
            return Ok(());
        };
        if let Some(parent) = request.output_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&request.output_path, serde_json::to_string_pretty(&output)?)?;
        Ok(())
    }
}

/// [`Vcs`] that creates empty checkouts under `root` and records calls.
#[derive(Clone)]
pub struct ScriptedVcs {
    root: PathBuf,
    reject_push: bool,
    calls: Arc<Mutex<Vec<String>>>,
}

impl ScriptedVcs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            reject_push: false,
            calls: Arc::default(),
        }
    }

    pub fn rejecting_push(mut self) -> Self {
        self.reject_push = true;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }
}

impl Vcs for ScriptedVcs {
    fn prepare(&self, run_id: &str, _repo_url: &str, branch: &str, base: &str) -> Result<WorkspaceInfo> {
        lock(&self.calls).push(format!("prepare {run_id} {branch} {base}"));
        let repo_dir = self.root.join(run_id).join("repo");
        fs::create_dir_all(&repo_dir)?;
        Ok(WorkspaceInfo {
            repo_dir,
            owner: "acme".to_string(),
            repo_name: "widgets".to_string(),
            branch: branch.to_string(),
            base_branch: base.to_string(),
        })
    }

    fn commit_and_push(&self, _repo_dir: &Path, message: &str) -> Result<CommitInfo> {
        lock(&self.calls).push(format!("commit {message}"));
        if self.reject_push {
            return Err(GitError::PushRejected {
                branch: "feature/REQ-1".to_string(),
                stderr: "remote: Permission denied".to_string(),
                hints: PUSH_HINTS.to_string(),
            }
            .into());
        }
        Ok(CommitInfo {
            last_commit: "0123abcd".to_string(),
            changed: true,
        })
    }
}

#[derive(Debug, Clone)]
enum BuildScript {
    Exit(Option<i32>),
    Timeout,
    MountDenied,
}

/// [`BuildExecutor`] returning a fixed outcome.
#[derive(Debug, Clone)]
pub struct ScriptedBuild {
    script: BuildScript,
    logs: String,
    commands: Arc<Mutex<Vec<String>>>,
}

impl ScriptedBuild {
    fn with_script(script: BuildScript) -> Self {
        Self {
            script,
            logs: "collected 1 item\n1 passed".to_string(),
            commands: Arc::default(),
        }
    }

    /// Build that finishes with `status`.
    pub fn exit(status: Option<i32>) -> Self {
        Self::with_script(BuildScript::Exit(status))
    }

    pub fn timeout() -> Self {
        Self::with_script(BuildScript::Timeout)
    }

    pub fn mount_denied() -> Self {
        Self::with_script(BuildScript::MountDenied)
    }

    pub fn with_logs(mut self, logs: &str) -> Self {
        self.logs = logs.to_string();
        self
    }

    pub fn commands(&self) -> Vec<String> {
        lock(&self.commands).clone()
    }
}

impl BuildExecutor for ScriptedBuild {
    fn build_and_test(&self, build: &BuildSpec, repo_dir: &Path) -> Result<RunOutput> {
        lock(&self.commands).push(build.command.clone());
        match &self.script {
            BuildScript::Exit(status) => Ok(RunOutput {
                status: *status,
                logs: self.logs.clone(),
                pull: PullOutcome::Pulled,
            }),
            BuildScript::Timeout => Err(RunnerError::Timeout {
                timeout_secs: build.timeout_seconds,
                logs: self.logs.clone(),
            }
            .into()),
            BuildScript::MountDenied => Err(RunnerError::MountDenied {
                message: "Mounts denied: path is not shared from the host".to_string(),
                bind_source: repo_dir.to_path_buf(),
                hint: "[HINT] share the workspace directory with the daemon".to_string(),
            }
            .into()),
        }
    }
}

/// [`PullRequests`] that records targets and returns a fixed URL.
#[derive(Debug, Clone)]
pub struct ScriptedPullRequests {
    url: Option<String>,
    credentials: bool,
    opened: Arc<Mutex<Vec<String>>>,
}

impl ScriptedPullRequests {
    pub fn new(url: Option<&str>) -> Self {
        Self {
            url: url.map(str::to_string),
            credentials: true,
            opened: Arc::default(),
        }
    }

    pub fn without_credentials(mut self) -> Self {
        self.credentials = false;
        self
    }

    /// `owner/repo branch sha` per opened PR.
    pub fn opened(&self) -> Vec<String> {
        lock(&self.opened).clone()
    }
}

impl PullRequests for ScriptedPullRequests {
    fn has_credentials(&self) -> bool {
        self.credentials
    }

    fn open_pr(
        &self,
        _req: &Requirement,
        target: &PrTarget<'_>,
        obs: &Observability,
    ) -> Result<Option<String>> {
        lock(&self.opened).push(format!(
            "{}/{} {} {}",
            target.owner,
            target.repo,
            target.head_branch,
            target.head_sha.unwrap_or("-")
        ));
        obs.record_outcome("request reviewers", Ok(()));
        Ok(self.url.clone())
    }
}

/// Shell snippets run by [`FakeDocker`] for each subcommand.
#[derive(Debug, Clone)]
pub struct FakeDockerScript {
    pub pull: String,
    pub run: String,
    pub wait: String,
    pub logs: String,
}

impl Default for FakeDockerScript {
    fn default() -> Self {
        Self {
            pull: "exit 0".to_string(),
            run: "echo 4f2c9e1d".to_string(),
            wait: "echo 0".to_string(),
            logs: "echo 'build output'; echo 'build warnings' >&2".to_string(),
        }
    }
}

/// A `docker` stand-in: a shell script that logs its arguments and runs the
/// scripted snippet for the subcommand.
pub struct FakeDocker {
    dir: TempDir,
}

impl FakeDocker {
    pub fn new(script: FakeDockerScript) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = dir.path().join("calls.log");
        let body = format!(
            "#!/bin/sh\n\
             echo \"$*\" >> '{log}'\n\
             case \"$1\" in\n\
             pull)\n{pull}\n;;\n\
             run)\n{run}\n;;\n\
             wait)\n{wait}\n;;\n\
             logs)\n{logs}\n;;\n\
             *)\nexit 0\n;;\n\
             esac\n",
            log = log.display(),
            pull = script.pull,
            run = script.run,
            wait = script.wait,
            logs = script.logs,
        );
        let bin = dir.path().join("docker");
        fs::write(&bin, body).expect("write fake docker");
        make_executable(&bin);
        Self { dir }
    }

    pub fn bin(&self) -> PathBuf {
        self.dir.path().join("docker")
    }

    /// Arguments of every invocation, in order.
    pub fn calls(&self) -> Vec<String> {
        fs::read_to_string(self.dir.path().join("calls.log"))
            .map(|text| text.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }

    pub fn rm_count(&self) -> usize {
        self.calls().iter().filter(|c| c.starts_with("rm ")).count()
    }
}

fn git(dir: &Path, args: &[&str]) -> String {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("spawn git");
    assert!(
        out.status.success(),
        "git {} failed: {}",
        args.join(" "),
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

fn init_work_repo(dir: &Path) {
    fs::create_dir_all(dir).expect("mkdir");
    git(dir, &["init", "-q"]);
    git(dir, &["symbolic-ref", "HEAD", "refs/heads/main"]);
    git(dir, &["config", "user.name", "Test"]);
    git(dir, &["config", "user.email", "test@example.com"]);
    git(dir, &["config", "commit.gpgsign", "false"]);
    fs::write(dir.join("README.md"), "# widgets\n").expect("write");
    git(dir, &["add", "-A"]);
    git(dir, &["commit", "-q", "-m", "initial"]);
}

/// A scratch git repository that lives as long as the value.
pub struct TestRepo {
    _dir: TempDir,
    path: PathBuf,
}

impl TestRepo {
    /// Working repository on `main` with one commit.
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("work");
        init_work_repo(&path);
        Self { _dir: dir, path }
    }

    /// Bare repository whose `main` has one commit, usable as a clone URL.
    pub fn bare_with_main() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("origin.git");
        fs::create_dir_all(&path).expect("mkdir");
        git(&path, &["init", "-q", "--bare"]);
        git(&path, &["symbolic-ref", "HEAD", "refs/heads/main"]);

        let seed = dir.path().join("seed");
        init_work_repo(&seed);
        let origin = path.display().to_string();
        git(&seed, &["push", "-q", &origin, "main"]);
        Self { _dir: dir, path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn url(&self) -> String {
        self.path.display().to_string()
    }

    pub fn has_branch(&self, name: &str) -> bool {
        Command::new("git")
            .args(["rev-parse", "--verify", "--quiet", &format!("refs/heads/{name}")])
            .current_dir(&self.path)
            .output()
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    pub fn branch_sha(&self, name: &str) -> String {
        git(&self.path, &["rev-parse", &format!("refs/heads/{name}")])
    }
}

impl Default for TestRepo {
    fn default() -> Self {
        Self::new()
    }
}
