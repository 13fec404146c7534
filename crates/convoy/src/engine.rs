//! Per-repository release state machine.
//!
//! `RepoRunner` drives one repository from its resume point to
//! [`ReleaseStep::Done`], saving the plan after every progress flag it sets.
//! The level-by-level scheduling around it lives in
//! [`crate::engine_parallel`].

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use anyhow::{Context, Result, bail};
use chrono::{NaiveDate, Utc};
use serde::Serialize;

use crate::changelog::{self, ChangelogGenerator, ChangelogRequest};
use crate::ci::CiStatus;
use crate::error::StepFailure;
use crate::events::{self, EventType, ReleaseEvent};
use crate::git::VersionControl;
use crate::graph::DependencyGraph;
use crate::index::ModuleIndex;
use crate::manifest::ManifestHandlers;
use crate::process::CancelToken;
use crate::steps::{self, ReleaseStep};
use crate::store::PlanStore;
use crate::types::{ReleasePlan, ReleaseProgress, ReleaseType, RepoReleasePlan};

pub trait Reporter {
    fn info(&mut self, msg: &str);
    fn warn(&mut self, msg: &str);
    fn error(&mut self, msg: &str);
}

/// Everything a release run may vary, passed in by value.
#[derive(Debug, Clone)]
pub struct OrchestrationConfig {
    /// Report what would run; execute nothing, write nothing.
    pub dry_run: bool,
    /// Release even with a dirty working tree.
    pub force: bool,
    /// Push branches and tags and wait on remote systems.
    pub push: bool,
    pub skip_ci: bool,
    /// Continue a partially completed plan.
    pub resume: bool,
    pub rc_branch: String,
    pub changelog_file: String,
    /// Date written into changelog headings.
    pub today: NaiveDate,
    pub cancel: CancelToken,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            force: false,
            push: true,
            skip_ci: false,
            resume: false,
            rc_branch: "release-candidate".to_string(),
            changelog_file: "CHANGELOG.md".to_string(),
            today: Utc::now().date_naive(),
            cancel: CancelToken::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RepoOutcome {
    Released { version: String },
    /// Tag already pushed and verified on the remote.
    AlreadyReleased { version: String },
    /// Dry run: the steps that would execute.
    Planned { steps: Vec<ReleaseStep> },
    Failed { step: ReleaseStep, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepoReport {
    pub repo: String,
    #[serde(flatten)]
    pub outcome: RepoOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LevelReport {
    pub index: usize,
    pub outcomes: Vec<RepoReport>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OrchestrationReport {
    pub levels: Vec<LevelReport>,
}

impl OrchestrationReport {
    pub fn outcomes(&self) -> impl Iterator<Item = &RepoReport> {
        self.levels.iter().flat_map(|l| l.outcomes.iter())
    }

    pub fn outcome(&self, repo: &str) -> Option<&RepoOutcome> {
        self.outcomes().find(|r| r.repo == repo).map(|r| &r.outcome)
    }

    pub fn released(&self) -> usize {
        self.outcomes()
            .filter(|r| matches!(r.outcome, RepoOutcome::Released { .. }))
            .count()
    }

    pub fn already_released(&self) -> usize {
        self.outcomes()
            .filter(|r| matches!(r.outcome, RepoOutcome::AlreadyReleased { .. }))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes()
            .filter(|r| matches!(r.outcome, RepoOutcome::Failed { .. }))
            .count()
    }
}

/// Lock a mutex, recovering the data if another task panicked while holding it.
pub(crate) fn lock<T: ?Sized>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Collaborators and shared state for one run.
pub(crate) struct RunContext<'a> {
    pub vcs: &'a dyn VersionControl,
    pub ci: &'a dyn CiStatus,
    pub index: &'a dyn ModuleIndex,
    pub changelog: &'a dyn ChangelogGenerator,
    pub handlers: &'a ManifestHandlers,
    pub store: &'a dyn PlanStore,
    pub graph: &'a DependencyGraph,
    pub config: &'a OrchestrationConfig,
    pub plan: &'a Mutex<ReleasePlan>,
    pub reporter: &'a Mutex<&'a mut (dyn Reporter + Send)>,
    pub events_path: &'a Path,
    pub release_type: ReleaseType,
    /// Set after the first failed append so the log problem is reported once.
    pub events_broken: AtomicBool,
}

impl RunContext<'_> {
    pub fn info(&self, msg: &str) {
        lock(self.reporter).info(msg);
    }

    pub fn warn(&self, msg: &str) {
        lock(self.reporter).warn(msg);
    }

    pub fn error(&self, msg: &str) {
        lock(self.reporter).error(msg);
    }

    pub fn event(&self, repo: &str, event_type: EventType) {
        if self.config.dry_run {
            return;
        }
        if let Err(e) = events::append_event(self.events_path, ReleaseEvent::now(repo, event_type))
            && !self.events_broken.swap(true, Ordering::Relaxed)
        {
            self.warn(&format!(
                "event log {} is not being written: {e:#}",
                self.events_path.display()
            ));
        }
    }

    pub fn repo(&self, name: &str) -> Option<RepoReleasePlan> {
        lock(self.plan).repos.get(name).cloned()
    }
}

/// What one repository's run starts from.
#[derive(Debug, Clone)]
pub(crate) struct StartPoint {
    pub step: ReleaseStep,
    pub tag_on_remote: bool,
}

/// Drives one repository through the release state machine.
pub(crate) struct RepoRunner<'c, 'a> {
    ctx: &'c RunContext<'a>,
    name: String,
    dir: PathBuf,
    version: String,
    deps_changed: bool,
}

impl<'c, 'a> RepoRunner<'c, 'a> {
    pub fn new(ctx: &'c RunContext<'a>, repo: &RepoReleasePlan) -> Self {
        Self {
            ctx,
            name: repo.name.clone(),
            dir: repo.dir.clone(),
            version: repo.next_version.clone(),
            deps_changed: false,
        }
    }

    fn failure(&self, step: ReleaseStep, message: impl Into<String>) -> StepFailure {
        StepFailure {
            repo: self.name.clone(),
            step,
            message: message.into(),
        }
    }

    fn snapshot(&self) -> Result<RepoReleasePlan> {
        self.ctx
            .repo(&self.name)
            .with_context(|| format!("{} is not part of the plan", self.name))
    }

    /// Where to pick up, re-verifying a recorded tag push against the remote.
    pub fn start_point(&self) -> Result<StartPoint, StepFailure> {
        let repo = self
            .snapshot()
            .map_err(|e| self.failure(ReleaseStep::Start, format!("{e:#}")))?;
        let tag_on_remote = if repo.progress.tag_pushed {
            self.ctx
                .vcs
                .remote_tag_exists(&self.dir, &self.version)
                .map_err(|e| self.failure(ReleaseStep::Start, format!("{e:#}")))?
        } else {
            false
        };
        if repo.progress.tag_pushed && !tag_on_remote {
            self.ctx.warn(&format!(
                "{}: tag {} recorded as pushed but missing on the remote; pushing again",
                self.name, self.version
            ));
        }
        Ok(StartPoint {
            step: steps::resume_from(&repo.progress, self.ctx.release_type, tag_on_remote),
            tag_on_remote,
        })
    }

    /// Dry-run prediction of the remaining steps.
    pub fn planned_steps(&self, from: ReleaseStep) -> Vec<ReleaseStep> {
        let plan = lock(self.ctx.plan);
        let deps_changed = self
            .ctx
            .graph
            .dependencies_of(&self.name)
            .iter()
            .any(|d| plan.repos.get(d).is_some_and(RepoReleasePlan::is_releasing));
        steps::path_from(from, self.ctx.release_type, deps_changed)
    }

    /// Run from `start` to `Done`.
    pub fn run(mut self, start: ReleaseStep) -> Result<RepoOutcome, StepFailure> {
        let mut step = start;
        while step != ReleaseStep::Done {
            if self.ctx.config.cancel.is_cancelled() {
                return Err(self.fail(step, "cancelled".to_string()));
            }

            self.ctx.event(&self.name, EventType::StepStarted { step });
            let started = Instant::now();
            if let Err(e) = self.execute(step) {
                return Err(self.fail(step, format!("{e:#}")));
            }
            self.ctx.event(
                &self.name,
                EventType::StepCompleted {
                    step,
                    duration_ms: started.elapsed().as_millis() as u64,
                },
            );

            match steps::successor(step, self.ctx.release_type, self.deps_changed) {
                Some(next) => step = next,
                None => break,
            }
        }

        self.update(|p| p.last_failed_operation = None)
            .map_err(|e| self.failure(ReleaseStep::Done, format!("{e:#}")))?;
        self.ctx.event(
            &self.name,
            EventType::RepoReleased {
                version: self.version.clone(),
            },
        );
        self.ctx.info(&format!("{}: released {}", self.name, self.version));
        Ok(RepoOutcome::Released {
            version: self.version.clone(),
        })
    }

    /// Record `step` as the failed operation, persist, and build the failure.
    fn fail(&self, step: ReleaseStep, message: String) -> StepFailure {
        let name = step.to_string();
        if let Err(e) = self.update(|p| p.last_failed_operation = Some(name)) {
            self.ctx.warn(&format!("{}: could not record failure: {e:#}", self.name));
        }
        self.ctx.event(
            &self.name,
            EventType::StepFailed {
                step,
                message: message.clone(),
            },
        );
        self.ctx.error(&format!("{}: {step} failed: {message}", self.name));
        self.failure(step, message)
    }

    /// Mutate this repository's progress and save the whole plan.
    fn update(&self, f: impl FnOnce(&mut ReleaseProgress)) -> Result<()> {
        let mut plan = lock(self.ctx.plan);
        let repo = plan
            .repos
            .get_mut(&self.name)
            .with_context(|| format!("{} is not part of the plan", self.name))?;
        f(&mut repo.progress);
        self.ctx.store.save(&plan)?;
        Ok(())
    }

    fn skip(&self, step: ReleaseStep, why: &str) {
        self.ctx.info(&format!("{}: {step} skipped ({why})", self.name));
    }

    fn execute(&mut self, step: ReleaseStep) -> Result<()> {
        let ctx = self.ctx;
        let config = ctx.config;
        let cancel = &config.cancel;
        let dir = self.dir.as_path();

        match step {
            ReleaseStep::Start => {
                if !config.force && !ctx.vcs.is_clean(dir)? {
                    bail!(
                        "working tree of {} has uncommitted changes (use --force to release anyway)",
                        dir.display()
                    );
                }
            }
            ReleaseStep::BranchReset => ctx.vcs.reset_branch(dir, &config.rc_branch)?,
            ReleaseStep::DependenciesUpdated => {
                let committed = self.update_dependencies()?;
                let (ahead, _) = ctx.vcs.ahead_behind(dir)?;
                self.deps_changed = committed || ahead > 0;
            }
            ReleaseStep::DependencyPushed => {
                if !config.push {
                    self.skip(step, "push disabled");
                } else if ctx.release_type.is_rc() {
                    ctx.vcs.force_push_branch(dir, &config.rc_branch)?;
                } else {
                    ctx.vcs.push(dir)?;
                }
            }
            ReleaseStep::DependencyCiWaited => {
                if !config.push {
                    self.skip(step, "push disabled");
                } else if config.skip_ci {
                    self.skip(step, "CI skipped");
                } else {
                    ctx.ci.wait_for_ci_workflow(dir, cancel)?;
                    if ctx.release_type.is_rc() {
                        self.update(|p| p.ci_passed = true)?;
                    }
                }
            }
            ReleaseStep::ChangelogCommitted => self.commit_changelog()?,
            ReleaseStep::ChangelogPushed => {
                if !config.push {
                    self.skip(step, "push disabled");
                } else {
                    // Ahead counts read 0 without an upstream; push HEAD regardless.
                    ctx.vcs.push(dir)?;
                    self.update(|p| p.changelog_pushed = true)?;
                }
            }
            ReleaseStep::CiWaitedAfterChangelog => {
                if !config.push {
                    self.skip(step, "push disabled");
                } else if config.skip_ci {
                    self.skip(step, "CI skipped");
                } else {
                    ctx.ci.wait_for_ci_workflow(dir, cancel)?;
                    self.update(|p| p.ci_passed = true)?;
                }
            }
            ReleaseStep::TagCreated => {
                if ctx.vcs.local_tag_exists(dir, &self.version)? {
                    ctx.info(&format!("{}: tag {} already exists locally", self.name, self.version));
                } else {
                    let message = format!("Release {} {}", self.name, self.version);
                    ctx.vcs.create_tag(dir, &self.version, &message)?;
                }
            }
            ReleaseStep::TagPushed => {
                if !config.push {
                    self.skip(step, "push disabled");
                } else {
                    if !ctx.vcs.remote_tag_exists(dir, &self.version)? {
                        ctx.vcs.push_tag(dir, &self.version)?;
                    }
                    self.update(|p| p.tag_pushed = true)?;
                }
            }
            ReleaseStep::BranchPushed => {
                if !config.push {
                    self.skip(step, "push disabled");
                } else {
                    ctx.vcs.force_push_branch(dir, &config.rc_branch)?;
                }
            }
            ReleaseStep::ReleaseWorkflowWaited => {
                if !config.push {
                    self.skip(step, "push disabled");
                } else if config.skip_ci {
                    self.skip(step, "CI skipped");
                } else {
                    ctx.ci.wait_for_release_workflow(dir, &self.version, cancel)?;
                }
            }
            ReleaseStep::ModuleAvailabilityWaited => {
                let repo = self.snapshot()?;
                match &repo.module_path {
                    _ if !config.push => self.skip(step, "push disabled"),
                    Some(module) if ctx.handlers.publishes_to_index(repo.project_type) => {
                        ctx.index.wait_for_module(module, &self.version, cancel)?;
                    }
                    _ => self.skip(step, "not published to a module index"),
                }
            }
            ReleaseStep::Done => {}
        }
        Ok(())
    }

    /// Point every releasing intra-ecosystem dependency at its new version.
    /// Returns whether a commit was made.
    fn update_dependencies(&self) -> Result<bool> {
        let ctx = self.ctx;
        let repo = self.snapshot()?;
        // Ordering edges first, then members tagged in earlier levels that the
        // manifest may still mention outside them (Cargo dev-dependencies).
        let targets: Vec<(String, String)> = {
            let plan = lock(ctx.plan);
            let edges = ctx.graph.dependencies_of(&self.name);
            let own_level = plan
                .levels
                .iter()
                .position(|level| level.contains(&self.name))
                .unwrap_or(0);
            let earlier = plan
                .levels
                .iter()
                .take(own_level)
                .flatten()
                .filter(|name| !edges.contains(*name));
            edges
                .iter()
                .chain(earlier)
                .filter_map(|dep| plan.repos.get(dep))
                .filter(|dep| dep.is_releasing())
                .filter_map(|dep| {
                    dep.module_path
                        .clone()
                        .map(|module| (module, dep.next_version.clone()))
                })
                .collect()
        };

        let mut changed: Vec<String> = Vec::new();
        for (module, version) in &targets {
            let rewritten = ctx
                .handlers
                .rewrite_in_dir(&self.dir, repo.project_type, module, version)
                .with_context(|| format!("failed to update {module} to {version}"))?;
            if let Some(path) = rewritten {
                ctx.info(&format!("{}: {module} -> {version}", self.name));
                let rel = relative_to(&path, &self.dir);
                if !changed.contains(&rel) {
                    changed.push(rel);
                }
            }
        }

        if changed.is_empty() {
            return Ok(false);
        }
        let paths: Vec<&str> = changed.iter().map(String::as_str).collect();
        ctx.vcs.add(&self.dir, &paths)?;
        ctx.vcs.commit(
            &self.dir,
            &format!("chore: update ecosystem dependencies for {}", self.version),
        )?;
        Ok(true)
    }

    /// Prepend the staged (or freshly generated) changelog entry and commit
    /// it when the file changed.
    fn commit_changelog(&self) -> Result<()> {
        let ctx = self.ctx;
        let repo = self.snapshot()?;

        let staged = repo.changelog_path.as_ref().filter(|p| p.is_file());
        let body = match staged {
            Some(path) => std::fs::read_to_string(path)
                .with_context(|| format!("failed to read staged changelog {}", path.display()))?,
            None => {
                let since = ctx
                    .vcs
                    .local_tag_exists(&self.dir, &repo.current_version)?
                    .then_some(repo.current_version.as_str());
                let request = ChangelogRequest {
                    repo: self.name.clone(),
                    current_version: repo.current_version.clone(),
                    next_version: self.version.clone(),
                    commits: ctx.vcs.log_subjects(&self.dir, since)?,
                };
                ctx.changelog.generate(&request, &ctx.config.cancel)?.changelog
            }
        };

        let file = &ctx.config.changelog_file;
        let path = self.dir.join(file);
        if !changelog::prepend_entry(&path, &self.version, ctx.config.today, &body)? {
            ctx.info(&format!("{}: {file} already has {}", self.name, self.version));
            return Ok(());
        }
        ctx.vcs.add(&self.dir, &[file.as_str()])?;
        ctx.vcs.commit(&self.dir, &format!("docs: changelog for {}", self.version))?;
        Ok(())
    }
}

fn relative_to(path: &Path, base: &Path) -> String {
    path.strip_prefix(base)
        .unwrap_or(path)
        .to_string_lossy()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_counts() {
        let report = OrchestrationReport {
            levels: vec![
                LevelReport {
                    index: 0,
                    outcomes: vec![
                        RepoReport {
                            repo: "base".into(),
                            outcome: RepoOutcome::AlreadyReleased {
                                version: "v1.0.0".into(),
                            },
                        },
                        RepoReport {
                            repo: "tool".into(),
                            outcome: RepoOutcome::Released {
                                version: "v0.2.0".into(),
                            },
                        },
                    ],
                },
                LevelReport {
                    index: 1,
                    outcomes: vec![RepoReport {
                        repo: "app".into(),
                        outcome: RepoOutcome::Failed {
                            step: ReleaseStep::TagPushed,
                            message: "rejected".into(),
                        },
                    }],
                },
            ],
        };
        assert_eq!(report.released(), 1);
        assert_eq!(report.already_released(), 1);
        assert_eq!(report.failed(), 1);
        assert!(matches!(report.outcome("app"), Some(RepoOutcome::Failed { .. })));
        assert_eq!(report.outcome("ghost"), None);
    }

    #[test]
    fn report_json_shape() {
        let report = RepoReport {
            repo: "base".into(),
            outcome: RepoOutcome::Planned {
                steps: vec![ReleaseStep::TagCreated, ReleaseStep::Done],
            },
        };
        let json = serde_json::to_value(&report).expect("json");
        assert_eq!(json["repo"], "base");
        assert_eq!(json["outcome"], "planned");
        assert_eq!(json["steps"][0], "TagCreated");
    }

    #[test]
    fn default_config_pushes() {
        let config = OrchestrationConfig::default();
        assert!(config.push);
        assert!(!config.dry_run);
        assert_eq!(config.rc_branch, "release-candidate");
    }

    #[test]
    fn relative_paths() {
        assert_eq!(relative_to(Path::new("/eco/app/go.mod"), Path::new("/eco/app")), "go.mod");
        assert_eq!(relative_to(Path::new("/x/go.mod"), Path::new("/eco/app")), "/x/go.mod");
    }
}
