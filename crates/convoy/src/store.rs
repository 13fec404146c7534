//! Durable storage for the release plan.
//!
//! One JSON document per state directory. Writes go to a temp file that is
//! synced and renamed over the previous plan, so a crash mid-write leaves
//! the last good plan in place.

use std::env;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::error::{ReleaseError, ReleaseResult};
use crate::events::events_path;
use crate::types::ReleasePlan;

pub const PLAN_FILE: &str = "release-plan.json";

/// Directory name under the home directory when nothing else is configured.
pub const DEFAULT_STATE_DIR: &str = ".convoy";

pub fn plan_path(state_dir: &Path) -> PathBuf {
    state_dir.join(PLAN_FILE)
}

/// `CONVOY_STATE_DIR`, else `~/.convoy`, else `./.convoy`.
pub fn default_state_dir() -> PathBuf {
    if let Ok(dir) = env::var("CONVOY_STATE_DIR")
        && !dir.trim().is_empty()
    {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .map(|home| home.join(DEFAULT_STATE_DIR))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR))
}

pub trait PlanStore: Send + Sync {
    fn save(&self, plan: &ReleasePlan) -> ReleaseResult<()>;

    /// [`ReleaseError::PlanNotFound`] when no plan has been saved.
    fn load(&self) -> ReleaseResult<ReleasePlan>;

    /// Remove the plan and its event log. Clearing nothing is fine.
    fn clear(&self) -> ReleaseResult<()>;

    fn location(&self) -> String;
}

#[derive(Debug, Clone)]
pub struct FilePlanStore {
    state_dir: PathBuf,
}

impl FilePlanStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn path(&self) -> PathBuf {
        plan_path(&self.state_dir)
    }

    pub fn exists(&self) -> bool {
        self.path().is_file()
    }
}

impl PlanStore for FilePlanStore {
    fn save(&self, plan: &ReleasePlan) -> ReleaseResult<()> {
        save_plan(&self.state_dir, plan).map_err(persistence)
    }

    fn load(&self) -> ReleaseResult<ReleasePlan> {
        match load_plan(&self.state_dir).map_err(persistence)? {
            Some(plan) => Ok(plan),
            None => Err(ReleaseError::PlanNotFound { path: self.path() }),
        }
    }

    fn clear(&self) -> ReleaseResult<()> {
        for path in [self.path(), events_path(&self.state_dir)] {
            if path.exists() {
                fs::remove_file(&path)
                    .with_context(|| format!("failed to remove {}", path.display()))
                    .map_err(persistence)?;
            }
        }
        Ok(())
    }

    fn location(&self) -> String {
        self.path().display().to_string()
    }
}

fn persistence(err: anyhow::Error) -> ReleaseError {
    ReleaseError::Persistence(format!("{err:#}"))
}

pub fn load_plan(state_dir: &Path) -> Result<Option<ReleasePlan>> {
    let path = plan_path(state_dir);
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(&path)
        .with_context(|| format!("failed to read plan file {}", path.display()))?;
    let plan: ReleasePlan = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse plan JSON {}", path.display()))?;
    Ok(Some(plan))
}

pub fn save_plan(state_dir: &Path, plan: &ReleasePlan) -> Result<()> {
    fs::create_dir_all(state_dir)
        .with_context(|| format!("failed to create state dir {}", state_dir.display()))?;
    atomic_write_json(&plan_path(state_dir), plan)
}

fn fsync_parent_dir(path: &Path) {
    if let Some(parent) = path.parent()
        && let Ok(dir) = fs::File::open(parent)
    {
        let _ = dir.sync_all();
    }
}

fn atomic_write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let data = serde_json::to_vec_pretty(value).context("failed to serialize JSON")?;

    {
        let mut f = fs::File::create(&tmp)
            .with_context(|| format!("failed to create tmp file {}", tmp.display()))?;
        f.write_all(&data)
            .with_context(|| format!("failed to write tmp file {}", tmp.display()))?;
        f.sync_all().ok();
    }

    fs::rename(&tmp, path).with_context(|| {
        format!("failed to rename tmp file {} to {}", tmp.display(), path.display())
    })?;
    fsync_parent_dir(path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::{TimeZone, Utc};
    use serial_test::serial;
    use tempfile::tempdir;

    use super::*;
    use crate::types::{
        ApprovalStatus, BumpKind, GitSnapshot, ParentVersion, ProjectType, ReleaseProgress,
        ReleaseType, RepoReleasePlan,
    };

    fn repo(name: &str, progress: ReleaseProgress) -> RepoReleasePlan {
        RepoReleasePlan {
            name: name.to_string(),
            dir: PathBuf::from(format!("/eco/{name}")),
            project_type: ProjectType::Go,
            module_path: Some(format!("example.com/eco/{name}")),
            current_version: "v1.2.3".into(),
            suggested_bump: BumpKind::Minor,
            selected_bump: BumpKind::Patch,
            next_version: "v1.2.4".into(),
            selected: true,
            approval: ApprovalStatus::Approved,
            commits_since_tag: 3,
            head_tagged: false,
            short_hash: "abc1234".into(),
            changelog_path: Some(PathBuf::from(format!("/state/changelogs/{name}.md"))),
            snapshot: GitSnapshot {
                dirty: true,
                ahead: 1,
                behind: 0,
                staged_files: 1,
                unstaged_files: 2,
                untracked_files: 3,
            },
            progress,
        }
    }

    fn sample_plan() -> ReleasePlan {
        let done = ReleaseProgress {
            changelog_pushed: true,
            ci_passed: true,
            tag_pushed: true,
            last_failed_operation: Some("ReleaseWorkflowWaited".into()),
        };
        let mut repos = BTreeMap::new();
        repos.insert("base".to_string(), repo("base", done));
        repos.insert("app".to_string(), repo("app", ReleaseProgress::default()));
        ReleasePlan {
            plan_id: "0f1e".into(),
            created_at: Utc.with_ymd_and_hms(2026, 3, 4, 5, 6, 7).single().expect("date"),
            release_type: ReleaseType::Full,
            root: PathBuf::from("/eco"),
            parent: ParentVersion {
                current: Some("v2026.03.01".into()),
                proposed: Some("v2026.03.04".into()),
            },
            levels: vec![vec!["base".into()], vec!["app".into()]],
            repos,
        }
    }

    #[test]
    fn round_trip_preserves_everything() {
        let td = tempdir().expect("tempdir");
        let store = FilePlanStore::new(td.path());
        let plan = sample_plan();

        store.save(&plan).expect("save");
        let loaded = store.load().expect("load");
        assert_eq!(loaded, plan);
        assert!(!td.path().join("release-plan.tmp").exists());
    }

    #[test]
    fn missing_plan_is_not_found() {
        let td = tempdir().expect("tempdir");
        let store = FilePlanStore::new(td.path().join("never-created"));
        let err = store.load().expect_err("must fail");
        assert!(matches!(err, ReleaseError::PlanNotFound { .. }));
    }

    #[test]
    fn corrupt_plan_is_a_persistence_error() {
        let td = tempdir().expect("tempdir");
        fs::write(plan_path(td.path()), "{\"plan_id\":").expect("write");
        let err = FilePlanStore::new(td.path()).load().expect_err("must fail");
        assert!(matches!(err, ReleaseError::Persistence(_)));
    }

    #[test]
    fn save_overwrites_previous_plan() {
        let td = tempdir().expect("tempdir");
        let store = FilePlanStore::new(td.path());
        let mut plan = sample_plan();
        store.save(&plan).expect("save");

        plan.repos.get_mut("app").expect("app").progress.changelog_pushed = true;
        store.save(&plan).expect("save again");
        assert!(store.load().expect("load").repos["app"].progress.changelog_pushed);
    }

    #[test]
    fn clear_removes_plan_and_events() {
        let td = tempdir().expect("tempdir");
        let store = FilePlanStore::new(td.path());
        store.save(&sample_plan()).expect("save");
        fs::write(events_path(td.path()), "").expect("events");

        store.clear().expect("clear");
        assert!(!store.exists());
        assert!(!events_path(td.path()).exists());
        store.clear().expect("clearing twice is fine");
    }

    #[test]
    #[serial]
    fn state_dir_env_override() {
        temp_env::with_var("CONVOY_STATE_DIR", Some("/tmp/convoy-state"), || {
            assert_eq!(default_state_dir(), PathBuf::from("/tmp/convoy-state"));
        });
        temp_env::with_var("CONVOY_STATE_DIR", None::<&str>, || {
            assert!(default_state_dir().ends_with(DEFAULT_STATE_DIR));
        });
    }
}
