//! Process-wide runtime context.
//!
//! Built once at startup and shared by every run: configuration, the
//! observability tracker, the registered agent, the git/build/PR
//! collaborators, and a cache of the most recently prepared workspace.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Result, anyhow};
use tracing::debug;

use crate::core::types::WorkspaceInfo;
use crate::io::config::AppConfig;
use crate::io::docker::{BuildExecutor, DockerBuild};
use crate::io::executor::{CliExecutor, Executor};
use crate::io::github::{GitHubClient, PullRequests};
use crate::io::prompt::PromptBuilder;
use crate::io::search::{SearchLimits, SearchResult, search_context};
use crate::io::workspace::{GitWorkspace, Vcs};
use crate::observability::{Limits, Observability};

pub type SharedAgent = Arc<dyn Executor + Send + Sync>;

pub struct Runtime {
    config: AppConfig,
    obs: Arc<Observability>,
    agent: Option<SharedAgent>,
    vcs: Box<dyn Vcs + Send + Sync>,
    builds: Box<dyn BuildExecutor + Send + Sync>,
    pulls: Box<dyn PullRequests + Send + Sync>,
    prompts: PromptBuilder,
    last_workspace: Mutex<Option<WorkspaceInfo>>,
}

impl Runtime {
    /// Runtime with the production collaborators and the CLI agent.
    pub fn from_config(config: AppConfig) -> Result<Self> {
        let agent: SharedAgent = Arc::new(CliExecutor::new(&config.agent));
        RuntimeBuilder::new(config).agent(agent).build()
    }

    pub fn builder(config: AppConfig) -> RuntimeBuilder {
        RuntimeBuilder::new(config)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn observability(&self) -> &Arc<Observability> {
        &self.obs
    }

    /// The registered agent, if any. Stages that need a tool context fail to
    /// bind without one.
    pub fn agent(&self) -> Option<&SharedAgent> {
        self.agent.as_ref()
    }

    pub fn vcs(&self) -> &dyn Vcs {
        self.vcs.as_ref()
    }

    pub fn builds(&self) -> &dyn BuildExecutor {
        self.builds.as_ref()
    }

    pub fn pull_requests(&self) -> &dyn PullRequests {
        self.pulls.as_ref()
    }

    pub fn prompts(&self) -> &PromptBuilder {
        &self.prompts
    }

    pub fn remember_workspace(&self, info: &WorkspaceInfo) {
        let mut slot = self
            .last_workspace
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *slot = Some(info.clone());
    }

    /// Most recently prepared workspace in this process.
    pub fn last_workspace(&self) -> Option<WorkspaceInfo> {
        self.last_workspace
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Snippet search in `repo_dir`, or in the last prepared checkout when
    /// no directory is given.
    pub fn search(&self, query: &str, repo_dir: Option<&Path>) -> Result<SearchResult> {
        let dir: PathBuf = match repo_dir {
            Some(dir) => dir.to_path_buf(),
            None => self
                .last_workspace()
                .map(|ws| ws.repo_dir)
                .ok_or_else(|| anyhow!("no repo_dir given and no workspace has been prepared yet"))?,
        };
        debug!(dir = %dir.display(), "searching workspace");
        search_context(
            &self.config.search,
            &dir,
            query,
            SearchLimits::from(&self.config.search),
        )
    }
}

/// Assembles a [`Runtime`]. Collaborators not set explicitly are built from
/// the configuration; no agent is registered unless one is given.
pub struct RuntimeBuilder {
    config: AppConfig,
    obs: Option<Arc<Observability>>,
    agent: Option<SharedAgent>,
    vcs: Option<Box<dyn Vcs + Send + Sync>>,
    builds: Option<Box<dyn BuildExecutor + Send + Sync>>,
    pulls: Option<Box<dyn PullRequests + Send + Sync>>,
}

impl RuntimeBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            obs: None,
            agent: None,
            vcs: None,
            builds: None,
            pulls: None,
        }
    }

    pub fn observability(mut self, obs: Arc<Observability>) -> Self {
        self.obs = Some(obs);
        self
    }

    pub fn agent(mut self, agent: SharedAgent) -> Self {
        self.agent = Some(agent);
        self
    }

    pub fn vcs(mut self, vcs: impl Vcs + Send + Sync + 'static) -> Self {
        self.vcs = Some(Box::new(vcs));
        self
    }

    pub fn builds(mut self, builds: impl BuildExecutor + Send + Sync + 'static) -> Self {
        self.builds = Some(Box::new(builds));
        self
    }

    pub fn pull_requests(mut self, pulls: impl PullRequests + Send + Sync + 'static) -> Self {
        self.pulls = Some(Box::new(pulls));
        self
    }

    pub fn build(self) -> Result<Runtime> {
        let config = self.config;
        let vcs = match self.vcs {
            Some(vcs) => vcs,
            None => Box::new(GitWorkspace::from_config(&config)),
        };
        let builds = match self.builds {
            Some(builds) => builds,
            None => Box::new(DockerBuild::new(
                config.runner.clone(),
                config.workspace_mapping(),
            )),
        };
        let pulls = match self.pulls {
            Some(pulls) => pulls,
            None => Box::new(GitHubClient::new(&config.github)?),
        };
        let prompts = PromptBuilder::new(config.agent.prompt_budget_chars)?;
        Ok(Runtime {
            obs: self
                .obs
                .unwrap_or_else(|| Arc::new(Observability::new(Limits::default()))),
            agent: self.agent,
            vcs,
            builds,
            pulls,
            prompts,
            last_workspace: Mutex::new(None),
            config,
        })
    }
}
