//! GitHub REST client for pull requests.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use reqwest::blocking::{Client, Response};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, instrument};

use crate::core::requirement::Requirement;
use crate::io::config::GitHubSettings;
use crate::observability::Observability;

/// Pull request collaborator used by the pipeline.
pub trait PullRequests {
    /// Whether a credential is configured at all.
    fn has_credentials(&self) -> bool;

    /// Open a PR for `branch` and return its URL. Reviewer and label
    /// requests are best-effort and recorded in `obs`.
    fn open_pr(
        &self,
        req: &Requirement,
        target: &PrTarget<'_>,
        obs: &Observability,
    ) -> Result<Option<String>>;
}

/// Where the pull request goes.
#[derive(Debug, Clone, Copy)]
pub struct PrTarget<'a> {
    pub owner: &'a str,
    pub repo: &'a str,
    pub head_branch: &'a str,
    pub head_sha: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct CreatedPull {
    number: u64,
    html_url: Option<String>,
}

pub struct GitHubClient {
    api_url: String,
    token: Option<String>,
    http: Client,
}

impl GitHubClient {
    pub fn new(settings: &GitHubSettings) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .user_agent(concat!("codeops/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("build GitHub HTTP client")?;
        Ok(Self {
            api_url: settings.api_url.trim_end_matches('/').to_string(),
            token: settings.token().map(str::to_string),
            http,
        })
    }

    fn post(&self, token: &str, path: &str, body: serde_json::Value) -> Result<Response> {
        let url = format!("{}{}", self.api_url, path);
        debug!(url = %url, "POST");
        let response = self
            .http
            .post(&url)
            .bearer_auth(token)
            .header("Accept", "application/vnd.github+json")
            .json(&body)
            .send()
            .with_context(|| format!("POST {path}"))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response.text().unwrap_or_default();
        Err(anyhow!("POST {path} returned {status}: {}", text.trim()))
    }

    fn request_reviewers(&self, token: &str, base: &str, number: u64, reviewers: &[String]) -> Result<()> {
        let (teams, users): (Vec<&String>, Vec<&String>) =
            reviewers.iter().partition(|r| r.contains('/'));
        let team_slugs: Vec<&str> = teams
            .iter()
            .filter_map(|t| t.split_once('/').map(|(_, slug)| slug))
            .collect();
        self.post(
            token,
            &format!("{base}/pulls/{number}/requested_reviewers"),
            json!({ "reviewers": users, "team_reviewers": team_slugs }),
        )
        .map(drop)
    }

    fn add_labels(&self, token: &str, base: &str, number: u64, labels: &[String]) -> Result<()> {
        self.post(
            token,
            &format!("{base}/issues/{number}/labels"),
            json!({ "labels": labels }),
        )
        .map(drop)
    }
}

impl PullRequests for GitHubClient {
    fn has_credentials(&self) -> bool {
        self.token.is_some()
    }

    #[instrument(skip_all, fields(owner = target.owner, repo = target.repo, head = target.head_branch))]
    fn open_pr(
        &self,
        req: &Requirement,
        target: &PrTarget<'_>,
        obs: &Observability,
    ) -> Result<Option<String>> {
        let Some(token) = self.token.as_deref() else {
            debug!("no GitHub token, skipping pull request");
            return Ok(None);
        };
        if target.owner.is_empty() || target.repo.is_empty() {
            return Err(anyhow!(
                "cannot open a pull request: owner/repo could not be parsed from {}",
                req.repo.url
            ));
        }
        let base_path = format!("/repos/{}/{}", target.owner, target.repo);
        let draft = req.github.as_ref().is_some_and(|gh| gh.draft);
        let created: CreatedPull = self
            .post(
                token,
                &format!("{base_path}/pulls"),
                json!({
                    "title": format!("{}: {}", req.id, req.title),
                    "head": target.head_branch,
                    "base": req.pr_base(),
                    "body": req.codegen.description,
                    "draft": draft,
                }),
            )?
            .json()
            .context("decode pull request response")?;
        info!(number = created.number, sha = ?target.head_sha, "pull request opened");

        if let Some(gh) = &req.github {
            if !gh.reviewers.is_empty() {
                obs.best_effort("request reviewers", || {
                    self.request_reviewers(token, &base_path, created.number, &gh.reviewers)
                });
            }
            if !gh.labels.is_empty() {
                obs.best_effort("add labels", || {
                    self.add_labels(token, &base_path, created.number, &gh.labels)
                });
            }
        }
        Ok(created.html_url)
    }
}
