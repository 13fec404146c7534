use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Manifest flavour of a member repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectType {
    Go,
    Cargo,
    /// No recognised manifest: versioned and tagged, never rewritten.
    Generic,
}

impl fmt::Display for ProjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProjectType::Go => f.write_str("go"),
            ProjectType::Cargo => f.write_str("cargo"),
            ProjectType::Generic => f.write_str("generic"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseType {
    #[default]
    Full,
    ReleaseCandidate,
}

impl ReleaseType {
    pub fn is_rc(self) -> bool {
        matches!(self, ReleaseType::ReleaseCandidate)
    }
}

impl fmt::Display for ReleaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReleaseType::Full => f.write_str("full"),
            ReleaseType::ReleaseCandidate => f.write_str("release-candidate"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BumpKind {
    Patch,
    Minor,
    Major,
}

impl fmt::Display for BumpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BumpKind::Patch => f.write_str("patch"),
            BumpKind::Minor => f.write_str("minor"),
            BumpKind::Major => f.write_str("major"),
        }
    }
}

impl FromStr for BumpKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "patch" => Ok(BumpKind::Patch),
            "minor" => Ok(BumpKind::Minor),
            "major" => Ok(BumpKind::Major),
            other => Err(format!("unknown bump kind '{other}' (expected major, minor or patch)")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    #[default]
    PendingReview,
    Approved,
}

/// Working-tree facts captured at planning time. Display only; the release
/// state machine re-checks what it needs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitSnapshot {
    pub dirty: bool,
    pub ahead: u32,
    pub behind: u32,
    pub staged_files: u32,
    pub unstaged_files: u32,
    pub untracked_files: u32,
}

impl GitSnapshot {
    /// Build a snapshot from `git status --porcelain` output.
    pub fn from_porcelain(porcelain: &str, ahead: u32, behind: u32) -> Self {
        let mut snap = GitSnapshot {
            ahead,
            behind,
            ..Default::default()
        };
        for line in porcelain.lines() {
            let mut chars = line.chars();
            let (Some(x), Some(y)) = (chars.next(), chars.next()) else {
                continue;
            };
            if x == '?' && y == '?' {
                snap.untracked_files += 1;
                continue;
            }
            if x != ' ' {
                snap.staged_files += 1;
            }
            if y != ' ' {
                snap.unstaged_files += 1;
            }
        }
        snap.dirty = snap.staged_files + snap.unstaged_files + snap.untracked_files > 0;
        snap
    }
}

/// Durable record of which side effects already happened for one repository.
///
/// The booleans only ever go from `false` to `true` during a release attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseProgress {
    #[serde(default)]
    pub changelog_pushed: bool,
    #[serde(default)]
    pub ci_passed: bool,
    #[serde(default)]
    pub tag_pushed: bool,
    #[serde(default)]
    pub last_failed_operation: Option<String>,
}

impl ReleaseProgress {
    pub fn any(&self) -> bool {
        self.changelog_pushed || self.ci_passed || self.tag_pushed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoReleasePlan {
    pub name: String,
    pub dir: PathBuf,
    pub project_type: ProjectType,
    #[serde(default)]
    pub module_path: Option<String>,
    pub current_version: String,
    pub suggested_bump: BumpKind,
    pub selected_bump: BumpKind,
    pub next_version: String,
    pub selected: bool,
    pub approval: ApprovalStatus,
    /// Commits since `current_version` was tagged.
    pub commits_since_tag: u32,
    /// HEAD is exactly the commit `current_version` points at.
    pub head_tagged: bool,
    pub short_hash: String,
    /// Staged changelog draft, when one was generated during planning.
    #[serde(default)]
    pub changelog_path: Option<PathBuf>,
    #[serde(default)]
    pub snapshot: GitSnapshot,
    #[serde(default)]
    pub progress: ReleaseProgress,
}

impl RepoReleasePlan {
    pub fn has_changes(&self) -> bool {
        self.commits_since_tag > 0
    }

    /// Selected and actually moving to a new version.
    pub fn is_releasing(&self) -> bool {
        self.selected && self.next_version != self.current_version
    }
}

/// Calendar version of the ecosystem parent repository.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentVersion {
    pub current: Option<String>,
    pub proposed: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleasePlan {
    pub plan_id: String,
    pub created_at: DateTime<Utc>,
    pub release_type: ReleaseType,
    pub root: PathBuf,
    #[serde(default)]
    pub parent: ParentVersion,
    /// Repository names per level; every dependency of a level-k member is
    /// in a level below k.
    pub levels: Vec<Vec<String>>,
    pub repos: BTreeMap<String, RepoReleasePlan>,
}

impl ReleasePlan {
    pub fn repo(&self, name: &str) -> Option<&RepoReleasePlan> {
        self.repos.get(name)
    }

    /// Repositories that will actually be released, in level order.
    pub fn releasing(&self) -> impl Iterator<Item = &RepoReleasePlan> {
        self.levels
            .iter()
            .flatten()
            .filter_map(|name| self.repos.get(name))
            .filter(|r| r.is_releasing())
    }

    pub fn has_progress(&self) -> bool {
        self.repos.values().any(|r| r.progress.any())
    }

    /// A previous run left flags or a failure marker behind.
    pub fn is_resumable(&self) -> bool {
        self.repos
            .values()
            .any(|r| r.progress.any() || r.progress.last_failed_operation.is_some())
    }
}
