//! Container runner: one build command in an ephemeral Docker container.
//!
//! Drives the `docker` CLI through [`crate::io::process`]. The repository is
//! bind-mounted read-write at the build workdir, after translating container
//! workspace paths to their host equivalents. Every container created here is
//! force-removed exactly once, whatever the outcome.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::path::{PathMapError, WorkspaceMapping};
use crate::core::requirement::BuildSpec;
use crate::io::config::RunnerSettings;
use crate::io::process::{CommandOutput, run_command_with_timeout};

/// Matched against the lowercased daemon message.
const MOUNT_DENIED_MARKERS: [&str; 2] = ["is not shared from the host", "mounts denied"];

static CONTAINER_SEQ: AtomicU64 = AtomicU64::new(0);

/// Failures the pipeline reports differently from a non-zero build exit.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    PathMap(#[from] PathMapError),
    #[error("build container did not finish within {timeout_secs}s")]
    Timeout { timeout_secs: u64, logs: String },
    #[error("docker refused to mount '{bind_source}': {message}")]
    MountDenied {
        message: String,
        bind_source: PathBuf,
        hint: String,
    },
    #[error("docker {op} failed: {message}")]
    Daemon { op: &'static str, message: String },
}

impl RunnerError {
    /// Output worth surfacing to the caller alongside the error.
    pub fn logs(&self) -> Option<String> {
        match self {
            Self::Timeout { logs, .. } => Some(logs.clone()),
            Self::MountDenied { message, hint, .. } => Some(format!("{message}\n\n{hint}")),
            _ => None,
        }
    }
}

/// What the container should run with. Built from the requirement's build
/// section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSpec {
    pub image: String,
    pub workdir: String,
    pub env: BTreeMap<String, String>,
    pub cpu_shares: Option<u32>,
    pub mem_limit: Option<String>,
    pub timeout: Duration,
}

impl RunSpec {
    pub fn from_build(build: &BuildSpec) -> Self {
        Self {
            image: build.container_image.clone(),
            workdir: build.workdir.clone(),
            env: build.env.clone(),
            cpu_shares: build.cpu_shares,
            mem_limit: build.mem_limit.clone(),
            timeout: Duration::from_secs(build.timeout_seconds),
        }
    }
}

/// Result of the best-effort image pull.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullOutcome {
    Skipped,
    Pulled,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutput {
    /// Container exit code; `None` if `docker wait` reported nothing usable.
    pub status: Option<i32>,
    /// Combined stdout and stderr, lossily decoded.
    pub logs: String,
    pub pull: PullOutcome,
}

pub struct DockerRunner {
    settings: RunnerSettings,
    mapping: WorkspaceMapping,
    spec: RunSpec,
}

impl DockerRunner {
    pub fn new(settings: RunnerSettings, mapping: WorkspaceMapping, spec: RunSpec) -> Self {
        Self {
            settings,
            mapping,
            spec,
        }
    }

    fn control_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.control_timeout_secs)
    }

    fn docker(&self) -> Command {
        Command::new(&self.settings.docker_bin)
    }

    /// Run `command` with `repo_dir` mounted at the build workdir.
    #[instrument(skip_all, fields(image = %self.spec.image, repo_dir = %repo_dir.display()))]
    pub fn run(&self, repo_dir: &Path, command: &str) -> Result<RunOutput, RunnerError> {
        let pull = self.pull();
        let bind_source = self.mapping.to_host_path(repo_dir)?;
        if self.settings.debug {
            info!(
                container_path = %repo_dir.display(),
                bind_source = %bind_source.display(),
                workdir = %self.spec.workdir,
                network = ?self.settings.network,
                "resolved runner bind mount"
            );
        } else {
            debug!(bind_source = %bind_source.display(), "resolved runner bind mount");
        }

        let guard = ContainerGuard {
            docker_bin: &self.settings.docker_bin,
            name: container_name(),
            timeout: self.control_timeout(),
        };

        let started = self.start(&guard.name, &bind_source, command)?;
        if !started.success() {
            return Err(self.classify_failure("run", &started, &bind_source));
        }

        let mut wait = self.docker();
        wait.arg("wait").arg(&guard.name);
        let waited = run_command_with_timeout(wait, None, self.spec.timeout, 4096)
            .map_err(|err| daemon("wait", format!("{err:#}")))?;
        if waited.timed_out {
            warn!(container = %guard.name, timeout_secs = self.spec.timeout.as_secs(), "build container timed out");
            let logs = self.logs(&guard.name).unwrap_or_default();
            return Err(RunnerError::Timeout {
                timeout_secs: self.spec.timeout.as_secs(),
                logs,
            });
        }
        if !waited.status.success() {
            return Err(self.classify_failure("wait", &waited, &bind_source));
        }
        let status = parse_status(&waited.stdout_lossy());
        if status.is_none() {
            warn!(output = %waited.stdout_lossy().trim(), "docker wait did not report an exit code");
        }

        let logs = self.logs(&guard.name)?;
        info!(container = %guard.name, exit_code = ?status, "build container finished");
        Ok(RunOutput { status, logs, pull })
    }

    fn pull(&self) -> PullOutcome {
        if !self.settings.pull_image {
            return PullOutcome::Skipped;
        }
        let mut cmd = self.docker();
        cmd.arg("pull").arg(&self.spec.image);
        match run_command_with_timeout(cmd, None, self.control_timeout(), 64 * 1024) {
            Ok(out) if out.success() => PullOutcome::Pulled,
            Ok(out) => {
                let reason = if out.timed_out {
                    "timed out".to_string()
                } else {
                    first_line(&out.stderr_lossy())
                };
                debug!(image = %self.spec.image, reason = %reason, "image pull failed; using local image");
                PullOutcome::Failed(reason)
            }
            Err(err) => PullOutcome::Failed(format!("{err:#}")),
        }
    }

    fn start(&self, name: &str, bind_source: &Path, command: &str) -> Result<CommandOutput, RunnerError> {
        let mut cmd = self.docker();
        cmd.args(["run", "-d", "--name", name, "-w", self.spec.workdir.as_str()]);
        for (key, value) in &self.spec.env {
            cmd.arg("-e").arg(format!("{key}={value}"));
        }
        cmd.arg("-v")
            .arg(format!("{}:{}:rw", bind_source.display(), self.spec.workdir));
        if let Some(network) = &self.settings.network {
            cmd.arg("--network").arg(network);
        }
        if let Some(shares) = self.spec.cpu_shares {
            cmd.arg("--cpu-shares").arg(shares.to_string());
        }
        if let Some(mem) = &self.spec.mem_limit {
            cmd.arg("--memory").arg(mem);
        }
        cmd.arg(&self.spec.image);
        cmd.args(&self.settings.shell);
        cmd.arg(command);

        run_command_with_timeout(cmd, None, self.control_timeout(), 64 * 1024)
            .map_err(|err| daemon("run", format!("{err:#}")))
    }

    fn logs(&self, name: &str) -> Result<String, RunnerError> {
        let mut cmd = self.docker();
        cmd.arg("logs").arg(name);
        let out = run_command_with_timeout(
            cmd,
            None,
            self.control_timeout(),
            self.settings.output_limit_bytes,
        )
        .map_err(|err| daemon("logs", format!("{err:#}")))?;
        if !out.success() {
            return Err(daemon("logs", first_line(&out.stderr_lossy())));
        }
        Ok(out.combined_lossy())
    }

    fn classify_failure(&self, op: &'static str, out: &CommandOutput, bind_source: &Path) -> RunnerError {
        let message = if out.timed_out {
            "timed out talking to the docker daemon".to_string()
        } else {
            out.stderr_lossy().trim().to_string()
        };
        let lowered = message.to_lowercase();
        if MOUNT_DENIED_MARKERS.iter().any(|m| lowered.contains(m)) {
            return RunnerError::MountDenied {
                hint: self.mount_hint(bind_source),
                bind_source: bind_source.to_path_buf(),
                message,
            };
        }
        RunnerError::Daemon { op, message }
    }

    fn mount_hint(&self, bind_source: &Path) -> String {
        let host = self
            .mapping
            .host_base
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(unset)".to_string());
        format!(
            "[HINT] the Docker daemon cannot see the bind source.\n\
             - Make sure HOST_WORKSPACE_DIR is under a directory shared with the daemon \
             (Docker Desktop: Settings > Resources > File sharing).\n\
             - WORKSPACE_DIR={}\n\
             - HOST_WORKSPACE_DIR={}\n\
             - Resolved bind source={}",
            self.mapping.container_base.display(),
            host,
            bind_source.display()
        )
    }
}

/// Build/test collaborator used by the pipeline.
pub trait BuildExecutor {
    /// Run `build.command` against `repo_dir`. Runner failures come back as
    /// [`RunnerError`] inside the `anyhow` error.
    fn build_and_test(&self, build: &BuildSpec, repo_dir: &Path) -> anyhow::Result<RunOutput>;
}

/// [`BuildExecutor`] that starts one [`DockerRunner`] per build.
#[derive(Debug, Clone)]
pub struct DockerBuild {
    settings: RunnerSettings,
    mapping: WorkspaceMapping,
}

impl DockerBuild {
    pub fn new(settings: RunnerSettings, mapping: WorkspaceMapping) -> Self {
        Self { settings, mapping }
    }
}

impl BuildExecutor for DockerBuild {
    fn build_and_test(&self, build: &BuildSpec, repo_dir: &Path) -> anyhow::Result<RunOutput> {
        let runner = DockerRunner::new(
            self.settings.clone(),
            self.mapping.clone(),
            RunSpec::from_build(build),
        );
        Ok(runner.run(repo_dir, &build.command)?)
    }
}

/// Removes the named container when dropped.
struct ContainerGuard<'a> {
    docker_bin: &'a str,
    name: String,
    timeout: Duration,
}

impl Drop for ContainerGuard<'_> {
    fn drop(&mut self) {
        let mut cmd = Command::new(self.docker_bin);
        cmd.args(["rm", "-f", self.name.as_str()]);
        match run_command_with_timeout(cmd, None, self.timeout, 16 * 1024) {
            Ok(out) if out.success() => debug!(container = %self.name, "container removed"),
            Ok(out) => warn!(container = %self.name, stderr = %out.stderr_lossy().trim(), "container removal failed"),
            Err(err) => warn!(container = %self.name, err = %err, "container removal failed"),
        }
    }
}

fn container_name() -> String {
    let seq = CONTAINER_SEQ.fetch_add(1, Ordering::Relaxed);
    format!(
        "codeops-{}-{}-{seq}",
        std::process::id(),
        Utc::now().timestamp_millis()
    )
}

fn parse_status(stdout: &str) -> Option<i32> {
    stdout.lines().rev().find_map(|line| line.trim().parse().ok())
}

fn first_line(text: &str) -> String {
    text.lines()
        .find(|line| !line.trim().is_empty())
        .unwrap_or("")
        .trim()
        .to_string()
}

fn daemon(op: &'static str, message: String) -> RunnerError {
    RunnerError::Daemon { op, message }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeDocker, FakeDockerScript};

    fn spec() -> RunSpec {
        RunSpec {
            image: "python:3.12".to_string(),
            workdir: "/workspace".to_string(),
            env: BTreeMap::from([("CI".to_string(), "1".to_string())]),
            cpu_shares: Some(512),
            mem_limit: Some("2g".to_string()),
            timeout: Duration::from_secs(10),
        }
    }

    fn runner(fake: &FakeDocker, mapping: WorkspaceMapping, spec: RunSpec) -> DockerRunner {
        let settings = RunnerSettings {
            docker_bin: fake.bin().display().to_string(),
            network: Some("ci-net".to_string()),
            control_timeout_secs: 10,
            ..RunnerSettings::default()
        };
        DockerRunner::new(settings, mapping, spec)
    }

    fn host_mapping() -> WorkspaceMapping {
        WorkspaceMapping::new("/workspace/jobs", Some(PathBuf::from("/host/jobs")))
    }

    #[test]
    fn success_returns_status_and_logs_and_removes_container() {
        let fake = FakeDocker::new(FakeDockerScript::default());
        let out = runner(&fake, host_mapping(), spec())
            .run(Path::new("/workspace/jobs/42/repo"), "pytest -q")
            .expect("run");

        assert_eq!(out.status, Some(0));
        assert!(out.logs.contains("build output"));
        assert!(out.logs.contains("build warnings"));
        assert_eq!(out.pull, PullOutcome::Pulled);

        let calls = fake.calls();
        let run = calls.iter().find(|c| c.starts_with("run ")).expect("run call");
        assert!(run.contains("-v /host/jobs/42/repo:/workspace:rw"));
        assert!(run.contains("-e CI=1"));
        assert!(run.contains("--network ci-net"));
        assert!(run.contains("--cpu-shares 512"));
        assert!(run.contains("--memory 2g"));
        assert!(run.ends_with("python:3.12 sh -c pytest -q"));
        assert_eq!(fake.rm_count(), 1);
    }

    #[test]
    fn nonzero_exit_is_returned_not_raised() {
        let fake = FakeDocker::new(FakeDockerScript {
            wait: "echo 1".to_string(),
            ..FakeDockerScript::default()
        });
        let out = runner(&fake, host_mapping(), spec())
            .run(Path::new("/srv/checkout"), "make test")
            .expect("run");
        assert_eq!(out.status, Some(1));
        assert_eq!(fake.rm_count(), 1);
        assert!(fake.calls().iter().any(|c| c.contains("-v /srv/checkout:/workspace:rw")));
    }

    #[test]
    fn missing_status_is_reported_as_none() {
        let fake = FakeDocker::new(FakeDockerScript {
            wait: "echo".to_string(),
            ..FakeDockerScript::default()
        });
        let out = runner(&fake, host_mapping(), spec())
            .run(Path::new("/srv/checkout"), "true")
            .expect("run");
        assert_eq!(out.status, None);
        assert_eq!(fake.rm_count(), 1);
    }

    #[test]
    fn timeout_is_distinct_and_still_cleans_up() {
        let fake = FakeDocker::new(FakeDockerScript {
            wait: "exec sleep 30".to_string(),
            ..FakeDockerScript::default()
        });
        let mut spec = spec();
        spec.timeout = Duration::from_millis(300);
        let err = runner(&fake, host_mapping(), spec)
            .run(Path::new("/srv/checkout"), "sleep 100")
            .unwrap_err();
        assert!(matches!(err, RunnerError::Timeout { .. }));
        assert!(err.logs().expect("logs").contains("build output"));
        assert_eq!(fake.rm_count(), 1);
    }

    #[test]
    fn mount_denial_carries_hint_and_cleans_up() {
        let fake = FakeDocker::new(FakeDockerScript {
            run: "echo 'docker: Error response from daemon: Mounts denied: path /host/jobs/1/repo is not shared from the host' >&2; exit 125".to_string(),
            ..FakeDockerScript::default()
        });
        let err = runner(&fake, host_mapping(), spec())
            .run(Path::new("/workspace/jobs/1/repo"), "true")
            .unwrap_err();
        let RunnerError::MountDenied { bind_source, hint, .. } = &err else {
            panic!("expected mount denial, got {err:?}");
        };
        assert_eq!(bind_source, &PathBuf::from("/host/jobs/1/repo"));
        assert!(hint.contains("WORKSPACE_DIR=/workspace/jobs"));
        assert!(hint.contains("HOST_WORKSPACE_DIR=/host/jobs"));
        assert!(hint.contains("Resolved bind source=/host/jobs/1/repo"));
        assert_eq!(fake.rm_count(), 1);
    }

    #[test]
    fn capitalized_mounts_denied_alone_is_a_mount_denial() {
        let fake = FakeDocker::new(FakeDockerScript {
            run: "echo 'docker: Error response from daemon: Mounts denied: /host/jobs/2/repo' >&2; exit 125".to_string(),
            ..FakeDockerScript::default()
        });
        let err = runner(&fake, host_mapping(), spec())
            .run(Path::new("/workspace/jobs/2/repo"), "true")
            .unwrap_err();
        assert!(
            matches!(err, RunnerError::MountDenied { .. }),
            "expected mount denial, got {err:?}"
        );
        assert_eq!(fake.rm_count(), 1);
    }

    #[test]
    fn daemon_error_is_raised_and_cleans_up() {
        let fake = FakeDocker::new(FakeDockerScript {
            run: "echo 'Cannot connect to the Docker daemon' >&2; exit 1".to_string(),
            ..FakeDockerScript::default()
        });
        let err = runner(&fake, host_mapping(), spec())
            .run(Path::new("/srv/checkout"), "true")
            .unwrap_err();
        assert!(matches!(err, RunnerError::Daemon { op: "run", .. }));
        assert_eq!(fake.rm_count(), 1);
    }

    #[test]
    fn pull_failure_is_swallowed() {
        let fake = FakeDocker::new(FakeDockerScript {
            pull: "echo 'manifest unknown' >&2; exit 1".to_string(),
            ..FakeDockerScript::default()
        });
        let out = runner(&fake, host_mapping(), spec())
            .run(Path::new("/srv/checkout"), "true")
            .expect("run");
        assert_eq!(out.pull, PullOutcome::Failed("manifest unknown".to_string()));
        assert_eq!(out.status, Some(0));
    }

    #[test]
    fn pull_can_be_disabled() {
        let fake = FakeDocker::new(FakeDockerScript::default());
        let settings = RunnerSettings {
            docker_bin: fake.bin().display().to_string(),
            pull_image: false,
            ..RunnerSettings::default()
        };
        let out = DockerRunner::new(settings, host_mapping(), spec())
            .run(Path::new("/srv/checkout"), "true")
            .expect("run");
        assert_eq!(out.pull, PullOutcome::Skipped);
        assert!(!fake.calls().iter().any(|c| c.starts_with("pull")));
    }

    #[test]
    fn missing_host_base_fails_before_creating_a_container() {
        let fake = FakeDocker::new(FakeDockerScript::default());
        let err = runner(&fake, WorkspaceMapping::new("/workspace/jobs", None), spec())
            .run(Path::new("/workspace/jobs/9/repo"), "true")
            .unwrap_err();
        assert!(matches!(err, RunnerError::PathMap(PathMapError::MissingHostBase { .. })));
        assert!(!fake.calls().iter().any(|c| c.starts_with("run")));
        assert_eq!(fake.rm_count(), 0);
    }

    #[test]
    fn parse_status_takes_last_numeric_line() {
        assert_eq!(parse_status("0\n"), Some(0));
        assert_eq!(parse_status("warning\n137\n"), Some(137));
        assert_eq!(parse_status(""), None);
    }
}
