//! Process configuration: TOML file plus environment overrides.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::path::WorkspaceMapping;

/// Top-level configuration (TOML).
///
/// Every field has a default, so an empty or missing file is a valid config.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    /// Base directory for per-run checkouts, as seen by this process.
    pub workspace_dir: PathBuf,
    /// Matching directory on the Docker host. Needed when this process runs
    /// inside a container and hands bind mounts to the host daemon.
    pub host_workspace_dir: Option<PathBuf>,
    pub runner: RunnerSettings,
    pub agent: AgentSettings,
    pub git: GitSettings,
    pub github: GitHubSettings,
    pub search: SearchSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunnerSettings {
    /// Docker CLI binary.
    pub docker_bin: String,
    /// Prefix used to run the build command string, e.g. `["sh", "-c"]`.
    pub shell: Vec<String>,
    /// Pull the image before each run (failures are ignored).
    pub pull_image: bool,
    pub network: Option<String>,
    /// Log the resolved bind mount at info level.
    pub debug: bool,
    /// Timeout for auxiliary docker calls (pull, logs, rm).
    pub control_timeout_secs: u64,
    /// Upper bound on captured container output held in memory.
    pub output_limit_bytes: usize,
    /// Test logs returned to callers are cut to this many characters.
    pub log_limit_chars: usize,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            docker_bin: "docker".to_string(),
            shell: vec!["sh".to_string(), "-c".to_string()],
            pull_image: true,
            network: None,
            debug: false,
            control_timeout_secs: 600,
            output_limit_bytes: 4_000_000,
            log_limit_chars: 20_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentSettings {
    /// Agent CLI invocation, e.g. `["codex", "exec"]`.
    pub command: Vec<String>,
    /// Extra arguments appended after the structured-output flags.
    pub extra_args: Vec<String>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
    /// Rendered prompts are trimmed to this many characters.
    pub prompt_budget_chars: usize,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            command: vec!["codex".to_string(), "exec".to_string()],
            extra_args: Vec::new(),
            timeout_secs: 15 * 60,
            output_limit_bytes: 100_000,
            prompt_budget_chars: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GitSettings {
    pub bin: String,
    pub user_name: String,
    pub user_email: String,
}

impl Default for GitSettings {
    fn default() -> Self {
        Self {
            bin: "git".to_string(),
            user_name: "codeops-bot".to_string(),
            user_email: "codeops-bot@users.noreply.github.com".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GitHubSettings {
    /// Usually supplied through `GITHUB_TOKEN` rather than the file.
    pub token: Option<String>,
    pub api_url: String,
    pub request_timeout_secs: u64,
}

impl Default for GitHubSettings {
    fn default() -> Self {
        Self {
            token: None,
            api_url: "https://api.github.com".to_string(),
            request_timeout_secs: 30,
        }
    }
}

impl GitHubSettings {
    /// The token, if set to something non-blank.
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref().filter(|t| !t.trim().is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SearchSettings {
    pub rg_bin: String,
    pub max_results: usize,
    pub max_chars: usize,
    pub context_lines: usize,
    pub timeout_secs: u64,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            rg_bin: "rg".to_string(),
            max_results: 20,
            max_chars: 8000,
            context_lines: 2,
            timeout_secs: 30,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            workspace_dir: PathBuf::from("/workspace/jobs"),
            host_workspace_dir: None,
            runner: RunnerSettings::default(),
            agent: AgentSettings::default(),
            git: GitSettings::default(),
            github: GitHubSettings::default(),
            search: SearchSettings::default(),
        }
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<()> {
        if self.workspace_dir.as_os_str().is_empty() {
            return Err(anyhow!("workspace_dir must be set"));
        }
        if let Some(host) = &self.host_workspace_dir
            && !host.is_absolute()
        {
            return Err(anyhow!(
                "host_workspace_dir must be an absolute path on the Docker host, got '{}'",
                host.display()
            ));
        }
        if is_blank_command(&self.runner.shell) {
            return Err(anyhow!("runner.shell must be a non-empty array"));
        }
        if self.runner.docker_bin.trim().is_empty() {
            return Err(anyhow!("runner.docker_bin must be set"));
        }
        if self.runner.control_timeout_secs == 0 {
            return Err(anyhow!("runner.control_timeout_secs must be > 0"));
        }
        if self.runner.output_limit_bytes == 0 || self.runner.log_limit_chars == 0 {
            return Err(anyhow!("runner output limits must be > 0"));
        }
        if is_blank_command(&self.agent.command) {
            return Err(anyhow!("agent.command must be a non-empty array"));
        }
        if self.agent.timeout_secs == 0 {
            return Err(anyhow!("agent.timeout_secs must be > 0"));
        }
        if self.agent.prompt_budget_chars == 0 {
            return Err(anyhow!("agent.prompt_budget_chars must be > 0"));
        }
        if self.search.max_results == 0 || self.search.max_chars == 0 {
            return Err(anyhow!("search limits must be > 0"));
        }
        Ok(())
    }

    /// Container → host mapping used for runner bind mounts.
    pub fn workspace_mapping(&self) -> WorkspaceMapping {
        WorkspaceMapping::new(self.workspace_dir.clone(), self.host_workspace_dir.clone())
    }

    /// Apply environment overrides read through `lookup`.
    ///
    /// Unset or blank variables leave the current value alone. Numeric
    /// variables that fail to parse are reported as errors.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(dir) = get("WORKSPACE_DIR") {
            self.workspace_dir = PathBuf::from(dir);
        }
        if let Some(dir) = get("HOST_WORKSPACE_DIR") {
            self.host_workspace_dir = Some(PathBuf::from(dir));
        }
        if let Some(pull) = get("RUNNER_IMAGE_PULL") {
            self.runner.pull_image = pull.trim() != "0";
        }
        if let Some(network) = get("RUNNER_DOCKER_NETWORK") {
            self.runner.network = Some(network);
        }
        if let Some(debug) = get("RUNNER_DEBUG") {
            self.runner.debug = debug.trim() == "1";
        }
        if let Some(token) = get("GITHUB_TOKEN") {
            self.github.token = Some(token);
        }
        if let Some(url) = get("GITHUB_API_URL") {
            self.github.api_url = url;
        }
        if let Some(raw) = get("SEARCH_CONTEXT_MAX_RESULTS") {
            self.search.max_results = parse_env("SEARCH_CONTEXT_MAX_RESULTS", &raw)?;
        }
        if let Some(raw) = get("SEARCH_CONTEXT_MAX_CHARS") {
            self.search.max_chars = parse_env("SEARCH_CONTEXT_MAX_CHARS", &raw)?;
        }
        if let Some(raw) = get("SEARCH_CONTEXT_LINES") {
            self.search.context_lines = parse_env("SEARCH_CONTEXT_LINES", &raw)?;
        }
        if let Some(raw) = get("CODEOPS_AGENT_COMMAND") {
            let command: Vec<String> = raw.split_whitespace().map(str::to_string).collect();
            if !command.is_empty() {
                self.agent.command = command;
            }
        }
        Ok(())
    }
}

fn is_blank_command(command: &[String]) -> bool {
    command.first().is_none_or(|first| first.trim().is_empty())
}

fn parse_env(key: &str, raw: &str) -> Result<usize> {
    raw.trim()
        .parse()
        .with_context(|| format!("{key} must be a non-negative integer, got '{raw}'"))
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `AppConfig::default()`.
pub fn load_config(path: &Path) -> Result<AppConfig> {
    if !path.exists() {
        let cfg = AppConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: AppConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Load `path` (or defaults), then apply process environment overrides.
pub fn load_with_env(path: Option<&Path>) -> Result<AppConfig> {
    let mut cfg = match path {
        Some(path) => load_config(path)?,
        None => AppConfig::default(),
    };
    cfg.apply_env(|key| std::env::var(key).ok())?;
    cfg.validate()?;
    Ok(cfg)
}
