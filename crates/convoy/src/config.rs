//! Ecosystem configuration (`.convoy.toml`).
//!
//! The file is optional and lives at the ecosystem root. Every key has a
//! default; durations are humantime strings (`"15s"`, `"30m"`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::retry::RetryStrategyConfig;

pub const CONFIG_FILE: &str = ".convoy.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseSection {
    #[serde(default = "default_rc_branch")]
    pub rc_branch: String,
    #[serde(default = "default_changelog_file")]
    pub changelog_file: String,
    /// Pull transitive dependents of changed repositories into the release.
    #[serde(default = "default_true")]
    pub cascade_dependents: bool,
    #[serde(default = "default_tag_prefix")]
    pub tag_prefix: String,
}

impl Default for ReleaseSection {
    fn default() -> Self {
        Self {
            rc_branch: default_rc_branch(),
            changelog_file: default_changelog_file(),
            cascade_dependents: true,
            tag_prefix: default_tag_prefix(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CiSection {
    #[serde(default = "default_ci_api_base")]
    pub api_base: String,
    /// Environment variable holding the API token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_ci_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(default = "default_ci_timeout", with = "humantime_serde")]
    pub ci_timeout: Duration,
    #[serde(default = "default_release_timeout", with = "humantime_serde")]
    pub release_timeout: Duration,
}

impl Default for CiSection {
    fn default() -> Self {
        Self {
            api_base: default_ci_api_base(),
            token_env: default_token_env(),
            poll_interval: default_ci_poll_interval(),
            ci_timeout: default_ci_timeout(),
            release_timeout: default_release_timeout(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleIndexSection {
    #[serde(default = "default_proxy_url")]
    pub proxy_url: String,
    #[serde(default = "default_index_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(default = "default_index_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for ModuleIndexSection {
    fn default() -> Self {
        Self {
            proxy_url: default_proxy_url(),
            poll_interval: default_index_poll_interval(),
            timeout: default_index_timeout(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GitSection {
    /// Executable to run; `CONVOY_GIT_BIN` wins over this.
    #[serde(default)]
    pub program: Option<String>,
    #[serde(default = "default_remote")]
    pub remote: String,
    #[serde(default)]
    pub retry: RetryStrategyConfig,
}

impl Default for GitSection {
    fn default() -> Self {
        Self {
            program: None,
            remote: default_remote(),
            retry: RetryStrategyConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangelogSection {
    /// External generator: program followed by its arguments.
    #[serde(default)]
    pub command: Option<Vec<String>>,
    #[serde(default, with = "humantime_serde::option")]
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConvoyConfig {
    /// Member directories relative to the root. Discovered when empty.
    #[serde(default)]
    pub members: Vec<PathBuf>,
    #[serde(default)]
    pub release: ReleaseSection,
    #[serde(default)]
    pub ci: CiSection,
    #[serde(default)]
    pub module_index: ModuleIndexSection,
    #[serde(default)]
    pub git: GitSection,
    #[serde(default)]
    pub changelog: ChangelogSection,
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

fn default_rc_branch() -> String {
    "release-candidate".to_string()
}

fn default_changelog_file() -> String {
    "CHANGELOG.md".to_string()
}

fn default_tag_prefix() -> String {
    "v".to_string()
}

fn default_ci_api_base() -> String {
    "https://api.github.com".to_string()
}

fn default_token_env() -> String {
    "GITHUB_TOKEN".to_string()
}

fn default_ci_poll_interval() -> Duration {
    Duration::from_secs(15)
}

fn default_ci_timeout() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_release_timeout() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_proxy_url() -> String {
    "https://proxy.golang.org".to_string()
}

fn default_index_poll_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_index_timeout() -> Duration {
    Duration::from_secs(15 * 60)
}

fn default_remote() -> String {
    "origin".to_string()
}

impl ConvoyConfig {
    /// Load `.convoy.toml` from `root`; defaults when the file is absent.
    pub fn load_from_root(root: &Path) -> Result<Self> {
        let path = root.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load_from_file(&path)
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: ConvoyConfig = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config file: {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.release.rc_branch.trim().is_empty() {
            bail!("release.rc_branch cannot be empty");
        }
        if self.release.changelog_file.trim().is_empty() {
            bail!("release.changelog_file cannot be empty");
        }
        if self.release.tag_prefix != "v" {
            bail!("release.tag_prefix must be \"v\"; other prefixes are not supported");
        }
        if self.ci.poll_interval.is_zero() {
            bail!("ci.poll_interval must be greater than 0");
        }
        if self.ci.ci_timeout < self.ci.poll_interval {
            bail!("ci.ci_timeout must be at least ci.poll_interval");
        }
        if self.ci.release_timeout < self.ci.poll_interval {
            bail!("ci.release_timeout must be at least ci.poll_interval");
        }
        if self.module_index.poll_interval.is_zero() {
            bail!("module_index.poll_interval must be greater than 0");
        }
        if self.module_index.timeout < self.module_index.poll_interval {
            bail!("module_index.timeout must be at least module_index.poll_interval");
        }
        if self.git.remote.trim().is_empty() {
            bail!("git.remote cannot be empty");
        }
        if self.git.retry.max_attempts == 0 {
            bail!("git.retry.max_attempts must be greater than 0");
        }
        if self.git.retry.max_delay < self.git.retry.base_delay {
            bail!("git.retry.max_delay must be greater than or equal to git.retry.base_delay");
        }
        if !(0.0..=1.0).contains(&self.git.retry.jitter) {
            bail!("git.retry.jitter must be between 0.0 and 1.0");
        }
        if let Some(cmd) = &self.changelog.command
            && cmd.first().is_none_or(|p| p.trim().is_empty())
        {
            bail!("changelog.command must name a program");
        }
        for member in &self.members {
            if member.is_absolute() {
                bail!("members must be relative to the ecosystem root: {}", member.display());
            }
        }
        Ok(())
    }

    /// Member directories: the configured list, else discovered ones.
    pub fn member_dirs(&self, root: &Path) -> crate::error::ReleaseResult<Vec<PathBuf>> {
        if self.members.is_empty() {
            return crate::graph::discover_members(root);
        }
        Ok(self.members.iter().map(|m| root.join(m)).collect())
    }

    /// State directory: the explicit override, then the config, then the default.
    pub fn state_dir(&self, root: &Path, explicit: Option<&Path>) -> PathBuf {
        match (explicit, &self.state_dir) {
            (Some(dir), _) => dir.to_path_buf(),
            (None, Some(dir)) if dir.is_absolute() => dir.clone(),
            (None, Some(dir)) => root.join(dir),
            (None, None) => crate::store::default_state_dir(),
        }
    }

    pub fn default_toml_template() -> String {
        r#"# convoy configuration, placed at the ecosystem root as .convoy.toml

# Member repositories relative to this directory. When omitted, every
# subdirectory containing a .git entry is a member.
# members = ["base", "app"]

[release]
rc_branch = "release-candidate"
changelog_file = "CHANGELOG.md"
# Include transitive dependents of changed repositories with a patch bump
cascade_dependents = true

[ci]
api_base = "https://api.github.com"
token_env = "GITHUB_TOKEN"
poll_interval = "15s"
ci_timeout = "30m"
release_timeout = "60m"

[module_index]
proxy_url = "https://proxy.golang.org"
poll_interval = "10s"
timeout = "15m"

[git]
remote = "origin"

[git.retry]
strategy = "exponential"
max_attempts = 3
base_delay = "500ms"
max_delay = "8s"

[changelog]
# External generator: reads a prompt on stdin, prints JSON
# {"bump": "minor", "justification": "...", "changelog": "..."}
# command = ["changelog-gen", "--json"]
"#
        .to_string()
    }
}
