//! CI status collaborator.
//!
//! The orchestrator only needs "block until CI for this repository is green"
//! and "block until the release workflow for this tag is green". The GitHub
//! Actions implementation answers both by polling the workflow-runs API.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::Deserialize;

use crate::git::VersionControl;
use crate::process::CancelToken;

pub trait CiStatus: Send + Sync {
    /// Wait for every workflow run on the current HEAD of `dir` to succeed.
    fn wait_for_ci_workflow(&self, dir: &Path, cancel: &CancelToken) -> Result<()>;

    /// Wait for the workflow runs triggered by pushing tag `version`.
    fn wait_for_release_workflow(
        &self,
        dir: &Path,
        version: &str,
        cancel: &CancelToken,
    ) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoSlug {
    pub owner: String,
    pub name: String,
}

/// Owner and repository from a GitHub remote URL.
///
/// Accepts `https://host/owner/repo(.git)`, `ssh://git@host/owner/repo.git`
/// and scp-style `git@host:owner/repo.git`.
pub fn parse_repo_slug(remote: &str) -> Option<RepoSlug> {
    let trimmed = remote.trim().trim_end_matches('/');
    let trimmed = trimmed.strip_suffix(".git").unwrap_or(trimmed);

    let path = if let Some((_, rest)) = trimmed.split_once("://") {
        rest.split_once('/')?.1
    } else {
        trimmed.split_once(':')?.1
    };

    let mut parts = path.rsplit('/').filter(|p| !p.is_empty());
    let name = parts.next()?;
    let owner = parts.next()?;
    Some(RepoSlug {
        owner: owner.to_string(),
        name: name.to_string(),
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowRuns {
    #[serde(default)]
    pub workflow_runs: Vec<WorkflowRun>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowRun {
    pub id: u64,
    #[serde(default)]
    pub name: Option<String>,
    pub status: String,
    #[serde(default)]
    pub conclusion: Option<String>,
    #[serde(default)]
    pub html_url: Option<String>,
}

impl WorkflowRun {
    fn label(&self) -> String {
        match (&self.name, &self.html_url) {
            (Some(name), Some(url)) => format!("{name} ({url})"),
            (Some(name), None) => name.clone(),
            (None, Some(url)) => url.clone(),
            (None, None) => format!("run {}", self.id),
        }
    }
}

/// One poll of the workflow runs endpoint.
#[derive(Debug, Clone)]
pub enum RunsPage {
    Runs(Vec<WorkflowRun>),
    /// Nothing usable this time; worth asking again.
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunsVerdict {
    /// No runs yet, or some still queued/in progress.
    Pending,
    Succeeded,
    Failed(String),
}

const PASSING_CONCLUSIONS: [&str; 3] = ["success", "skipped", "neutral"];

pub fn evaluate_runs(runs: &[WorkflowRun]) -> RunsVerdict {
    if runs.is_empty() {
        return RunsVerdict::Pending;
    }

    let failed: Vec<String> = runs
        .iter()
        .filter(|r| r.status == "completed")
        .filter(|r| {
            !r.conclusion
                .as_deref()
                .is_some_and(|c| PASSING_CONCLUSIONS.contains(&c))
        })
        .map(|r| {
            format!(
                "{} concluded {}",
                r.label(),
                r.conclusion.as_deref().unwrap_or("without a conclusion")
            )
        })
        .collect();
    if !failed.is_empty() {
        return RunsVerdict::Failed(failed.join("; "));
    }

    if runs.iter().all(|r| r.status == "completed") {
        RunsVerdict::Succeeded
    } else {
        RunsVerdict::Pending
    }
}

#[derive(Debug, Clone)]
pub struct CiTiming {
    pub poll_interval: Duration,
    pub ci_timeout: Duration,
    pub release_timeout: Duration,
}

impl Default for CiTiming {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(15),
            ci_timeout: Duration::from_secs(30 * 60),
            release_timeout: Duration::from_secs(60 * 60),
        }
    }
}

/// GitHub Actions over the REST API (blocking).
pub struct GithubActions {
    api_base: String,
    token: Option<String>,
    http: Client,
    vcs: Arc<dyn VersionControl>,
    timing: CiTiming,
}

impl GithubActions {
    pub fn new(
        api_base: impl Into<String>,
        token: Option<String>,
        vcs: Arc<dyn VersionControl>,
        timing: CiTiming,
    ) -> Result<Self> {
        let http = Client::builder()
            .user_agent(format!("convoy/{}", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            api_base: api_base.into(),
            token: token.filter(|t| !t.trim().is_empty()),
            http,
            vcs,
            timing,
        })
    }

    fn slug(&self, dir: &Path) -> Result<RepoSlug> {
        let remote = self.vcs.remote_url(dir)?;
        parse_repo_slug(&remote)
            .with_context(|| format!("cannot infer owner/repo from remote URL '{remote}'"))
    }

    /// One page of workflow runs matching `filter` (`head_sha=...` or `branch=...`).
    /// Network failures and transient API answers come back as
    /// [`RunsPage::Unavailable`]; only refusals the caller cannot wait out are errors.
    pub fn fetch_runs(&self, slug: &RepoSlug, filter: (&str, &str)) -> Result<RunsPage> {
        let url = format!(
            "{}/repos/{}/{}/actions/runs?{}={}&per_page=100",
            self.api_base.trim_end_matches('/'),
            slug.owner,
            slug.name,
            filter.0,
            filter.1.replace('+', "%2B")
        );
        let mut req = self
            .http
            .get(url)
            .header("Accept", "application/vnd.github+json");
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }

        let resp = match req.send() {
            Ok(resp) => resp,
            Err(e) => return Ok(RunsPage::Unavailable(format!("workflow runs request failed: {e}"))),
        };
        match resp.status() {
            StatusCode::OK => match resp.json::<WorkflowRuns>() {
                Ok(parsed) => Ok(RunsPage::Runs(parsed.workflow_runs)),
                Err(e) => Ok(RunsPage::Unavailable(format!(
                    "failed to parse workflow runs JSON: {e}"
                ))),
            },
            s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
                Ok(RunsPage::Unavailable(format!("CI API answered {s}")))
            }
            s @ (StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) => {
                bail!("CI API refused access to {}/{} ({s}); check the token", slug.owner, slug.name)
            }
            StatusCode::NOT_FOUND => {
                bail!("repository {}/{} not found on the CI API", slug.owner, slug.name)
            }
            s => bail!("unexpected status while listing workflow runs: {s}"),
        }
    }

    fn wait(
        &self,
        what: &str,
        slug: &RepoSlug,
        filter: (&str, &str),
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<()> {
        let started = Instant::now();
        let mut seen_runs = false;
        let mut last_error: Option<String> = None;

        loop {
            if cancel.is_cancelled() {
                bail!("cancelled while waiting for {what}");
            }

            match self.fetch_runs(slug, filter)? {
                RunsPage::Runs(runs) => {
                    last_error = None;
                    seen_runs |= !runs.is_empty();
                    match evaluate_runs(&runs) {
                        RunsVerdict::Succeeded => return Ok(()),
                        RunsVerdict::Failed(details) => bail!("{what} failed: {details}"),
                        RunsVerdict::Pending => {}
                    }
                }
                RunsPage::Unavailable(reason) => last_error = Some(reason),
            }

            if started.elapsed() >= timeout {
                let waited = humantime::format_duration(timeout);
                let mut message = if seen_runs {
                    format!("timed out after {waited} waiting for {what}")
                } else {
                    format!("no workflow runs appeared for {what} within {waited}")
                };
                if let Some(reason) = &last_error {
                    message.push_str(&format!(" (last error: {reason})"));
                }
                bail!(message);
            }
            if !cancel.sleep(self.timing.poll_interval) {
                bail!("cancelled while waiting for {what}");
            }
        }
    }
}

impl CiStatus for GithubActions {
    fn wait_for_ci_workflow(&self, dir: &Path, cancel: &CancelToken) -> Result<()> {
        let slug = self.slug(dir)?;
        let sha = self.vcs.head_sha(dir)?;
        let what = format!("CI of {}/{}@{}", slug.owner, slug.name, &sha[..sha.len().min(12)]);
        self.wait(&what, &slug, ("head_sha", sha.as_str()), self.timing.ci_timeout, cancel)
    }

    fn wait_for_release_workflow(
        &self,
        dir: &Path,
        version: &str,
        cancel: &CancelToken,
    ) -> Result<()> {
        let slug = self.slug(dir)?;
        let what = format!("release workflow of {}/{} {version}", slug.owner, slug.name);
        self.wait(&what, &slug, ("branch", version), self.timing.release_timeout, cancel)
    }
}
