//! Version-control adapter.
//!
//! [`VersionControl`] is the seam the planner and the orchestrator talk
//! through; [`GitCli`] is the one implementation that actually runs `git`.
//! Reads run once. Writes go through a shared retry path that retries only
//! when git reports another process holding the repository lock.

use std::env;
use std::path::Path;

use anyhow::{Context, Result, bail};

use crate::process::{CancelToken, CommandOptions, CommandResult, run_command};
use crate::retry::{RetryExecutor, RetryStrategyConfig};

pub trait VersionControl: Send + Sync {
    /// `git status --porcelain`
    fn status(&self, dir: &Path) -> Result<String>;

    fn is_clean(&self, dir: &Path) -> Result<bool> {
        Ok(self.status(dir)?.trim().is_empty())
    }

    /// Most recent tag reachable from HEAD. `include_prerelease = false`
    /// skips tags with a `-` (release candidates).
    fn latest_tag(&self, dir: &Path, include_prerelease: bool) -> Result<Option<String>>;

    /// Tag pointing exactly at HEAD, if any.
    fn exact_tag(&self, dir: &Path) -> Result<Option<String>>;

    /// Commits in `since..HEAD`, or all commits when `since` is `None`.
    fn commit_count(&self, dir: &Path, since: Option<&str>) -> Result<u32>;

    /// Subject lines of the commits in `since..HEAD`, newest first.
    fn log_subjects(&self, dir: &Path, since: Option<&str>) -> Result<Vec<String>>;

    fn short_head(&self, dir: &Path) -> Result<String>;

    fn tags(&self, dir: &Path, pattern: &str) -> Result<Vec<String>>;

    /// Files with uncommitted changes relative to HEAD.
    fn changed_files(&self, dir: &Path) -> Result<Vec<String>>;

    /// `(ahead, behind)` relative to the upstream branch; `(0, 0)` without one.
    fn ahead_behind(&self, dir: &Path) -> Result<(u32, u32)>;

    fn local_tag_exists(&self, dir: &Path, tag: &str) -> Result<bool>;

    fn remote_tag_exists(&self, dir: &Path, tag: &str) -> Result<bool>;

    fn remote_url(&self, dir: &Path) -> Result<String>;

    fn head_sha(&self, dir: &Path) -> Result<String>;

    fn add(&self, dir: &Path, paths: &[&str]) -> Result<()>;

    fn commit(&self, dir: &Path, message: &str) -> Result<()>;

    /// Annotated tag at HEAD.
    fn create_tag(&self, dir: &Path, tag: &str, message: &str) -> Result<()>;

    /// Push the current branch to its upstream.
    fn push(&self, dir: &Path) -> Result<()>;

    fn push_tag(&self, dir: &Path, tag: &str) -> Result<()>;

    /// Create or reset `branch` at HEAD and check it out.
    fn reset_branch(&self, dir: &Path, branch: &str) -> Result<()>;

    fn force_push_branch(&self, dir: &Path, branch: &str) -> Result<()>;
}

/// Markers of a transient local lock in git's output.
const LOCK_MARKERS: [&str; 4] = [
    "index.lock",
    "unable to create",
    "another git process",
    "cannot lock ref",
];

/// Whether git's combined output describes lock contention.
pub fn is_lock_contention(output: &str) -> bool {
    let lower = output.to_ascii_lowercase();
    LOCK_MARKERS.iter().any(|m| lower.contains(m))
}

/// Runs the `git` executable (or `CONVOY_GIT_BIN`).
#[derive(Debug, Clone)]
pub struct GitCli {
    program: String,
    remote: String,
    retry: RetryStrategyConfig,
    cancel: CancelToken,
}

impl Default for GitCli {
    fn default() -> Self {
        Self::new(git_program(None), "origin")
    }
}

impl GitCli {
    pub fn new(program: impl Into<String>, remote: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            remote: remote.into(),
            retry: RetryStrategyConfig::lock_contention(),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_retry(mut self, retry: RetryStrategyConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// `git --version`, trimmed. Runs in `dir` but reads no repository.
    pub fn version(&self, dir: &Path) -> Result<String> {
        Ok(self.read(dir, &["--version"])?.trim().to_string())
    }

    fn exec(&self, dir: &Path, args: &[&str]) -> Result<CommandResult> {
        let opts = CommandOptions::in_dir(dir).cancel(self.cancel.clone());
        let out = run_command(&self.program, args, &opts)
            .with_context(|| format!("failed to execute git {}; is git installed?", args.join(" ")))?;
        if out.cancelled {
            bail!("git {} cancelled", args.join(" "));
        }
        Ok(out)
    }

    fn read(&self, dir: &Path, args: &[&str]) -> Result<String> {
        let out = self.exec(dir, args)?;
        if !out.success {
            bail!(
                "git {} failed in {}: {}",
                args.join(" "),
                dir.display(),
                out.combined_output().trim()
            );
        }
        Ok(out.stdout)
    }

    /// Read that treats a non-zero exit as "nothing there".
    fn read_optional(&self, dir: &Path, args: &[&str]) -> Result<Option<String>> {
        let out = self.exec(dir, args)?;
        if !out.success {
            return Ok(None);
        }
        let trimmed = out.stdout.trim();
        Ok((!trimmed.is_empty()).then(|| trimmed.to_string()))
    }

    fn write(&self, dir: &Path, args: &[&str]) -> Result<()> {
        let cancel = self.cancel.clone();
        let executor = RetryExecutor::new(self.retry.clone()).with_sleep(move |d| {
            cancel.sleep(d);
        });

        executor
            .run_if(
                |_attempt| {
                    let out = self.exec(dir, args).map_err(WriteFailure::Spawn)?;
                    if out.success {
                        Ok(())
                    } else {
                        Err(WriteFailure::Exit(out.combined_output()))
                    }
                },
                |err| matches!(err, WriteFailure::Exit(output) if is_lock_contention(output)),
            )
            .map_err(|err| match err {
                WriteFailure::Spawn(e) => e,
                WriteFailure::Exit(output) => anyhow::anyhow!(
                    "git {} failed in {}: {}",
                    args.join(" "),
                    dir.display(),
                    output.trim()
                ),
            })
    }
}

enum WriteFailure {
    Spawn(anyhow::Error),
    Exit(String),
}

impl VersionControl for GitCli {
    fn status(&self, dir: &Path) -> Result<String> {
        self.read(dir, &["status", "--porcelain"])
    }

    fn latest_tag(&self, dir: &Path, include_prerelease: bool) -> Result<Option<String>> {
        let mut args = vec!["describe", "--tags", "--abbrev=0"];
        if !include_prerelease {
            args.extend(["--exclude", "*-*"]);
        }
        self.read_optional(dir, &args)
    }

    fn exact_tag(&self, dir: &Path) -> Result<Option<String>> {
        self.read_optional(dir, &["describe", "--tags", "--exact-match", "HEAD"])
    }

    fn commit_count(&self, dir: &Path, since: Option<&str>) -> Result<u32> {
        let range = match since {
            Some(tag) => format!("{tag}..HEAD"),
            None => "HEAD".to_string(),
        };
        let out = self.read(dir, &["rev-list", "--count", &range])?;
        out.trim()
            .parse()
            .with_context(|| format!("unexpected rev-list output: {}", out.trim()))
    }

    fn log_subjects(&self, dir: &Path, since: Option<&str>) -> Result<Vec<String>> {
        let range = match since {
            Some(tag) => format!("{tag}..HEAD"),
            None => "HEAD".to_string(),
        };
        let out = self.read(dir, &["log", "--format=%s", &range])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn short_head(&self, dir: &Path) -> Result<String> {
        Ok(self.read(dir, &["rev-parse", "--short", "HEAD"])?.trim().to_string())
    }

    fn tags(&self, dir: &Path, pattern: &str) -> Result<Vec<String>> {
        let out = self.read(dir, &["tag", "--list", pattern])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn changed_files(&self, dir: &Path) -> Result<Vec<String>> {
        let out = self.read(dir, &["diff", "--name-only", "HEAD"])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn ahead_behind(&self, dir: &Path) -> Result<(u32, u32)> {
        let Some(counts) =
            self.read_optional(dir, &["rev-list", "--left-right", "--count", "HEAD...@{upstream}"])?
        else {
            return Ok((0, 0));
        };
        let mut parts = counts.split_whitespace().map(str::parse::<u32>);
        match (parts.next(), parts.next()) {
            (Some(Ok(ahead)), Some(Ok(behind))) => Ok((ahead, behind)),
            _ => bail!("unexpected rev-list output: {counts}"),
        }
    }

    fn local_tag_exists(&self, dir: &Path, tag: &str) -> Result<bool> {
        let reference = format!("refs/tags/{tag}");
        Ok(self
            .read_optional(dir, &["rev-parse", "-q", "--verify", &reference])?
            .is_some())
    }

    fn remote_tag_exists(&self, dir: &Path, tag: &str) -> Result<bool> {
        let reference = format!("refs/tags/{tag}");
        let out = self.read(dir, &["ls-remote", "--tags", &self.remote, &reference])?;
        Ok(out
            .lines()
            .filter_map(|l| l.split_whitespace().nth(1))
            .any(|r| r == reference))
    }

    fn remote_url(&self, dir: &Path) -> Result<String> {
        Ok(self
            .read(dir, &["remote", "get-url", &self.remote])?
            .trim()
            .to_string())
    }

    fn head_sha(&self, dir: &Path) -> Result<String> {
        Ok(self.read(dir, &["rev-parse", "HEAD"])?.trim().to_string())
    }

    fn add(&self, dir: &Path, paths: &[&str]) -> Result<()> {
        let mut args = vec!["add", "--"];
        args.extend_from_slice(paths);
        self.write(dir, &args)
    }

    fn commit(&self, dir: &Path, message: &str) -> Result<()> {
        self.write(dir, &["commit", "-m", message])
    }

    fn create_tag(&self, dir: &Path, tag: &str, message: &str) -> Result<()> {
        self.write(dir, &["tag", "-a", tag, "-m", message])
    }

    fn push(&self, dir: &Path) -> Result<()> {
        self.write(dir, &["push", &self.remote, "HEAD"])
    }

    fn push_tag(&self, dir: &Path, tag: &str) -> Result<()> {
        let reference = format!("refs/tags/{tag}");
        self.write(dir, &["push", &self.remote, &reference])
    }

    fn reset_branch(&self, dir: &Path, branch: &str) -> Result<()> {
        self.write(dir, &["checkout", "-B", branch])
    }

    fn force_push_branch(&self, dir: &Path, branch: &str) -> Result<()> {
        let refspec = format!("{branch}:refs/heads/{branch}");
        self.write(dir, &["push", "--force", &self.remote, &refspec])
    }
}

/// `CONVOY_GIT_BIN`, else `configured`, else `git`.
pub fn git_program(configured: Option<&str>) -> String {
    if let Ok(bin) = env::var("CONVOY_GIT_BIN")
        && !bin.trim().is_empty()
    {
        return bin;
    }
    configured.unwrap_or("git").to_string()
}
