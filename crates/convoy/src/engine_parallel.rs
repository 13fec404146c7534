//! Level-by-level orchestration.
//!
//! Levels run strictly in order. Inside a level every releasing repository
//! gets its own thread; the level is a barrier that collects every outcome
//! before deciding whether the next level may start.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::thread;

use crate::changelog::{ChangelogGenerator, CommitSummaryGenerator};
use crate::ci::CiStatus;
use crate::engine::{
    LevelReport, OrchestrationConfig, OrchestrationReport, RepoOutcome, RepoReport, RepoRunner,
    Reporter, RunContext, lock,
};
use crate::error::{ReleaseError, ReleaseResult, StepFailure};
use crate::events::EventType;
use crate::git::VersionControl;
use crate::graph::DependencyGraph;
use crate::index::ModuleIndex;
use crate::manifest::ManifestHandlers;
use crate::steps::ReleaseStep;
use crate::store::PlanStore;
use crate::types::{ReleasePlan, RepoReleasePlan};

/// Applies a reviewed [`ReleasePlan`] across the dependency levels.
pub struct Orchestrator {
    vcs: Arc<dyn VersionControl>,
    ci: Arc<dyn CiStatus>,
    index: Arc<dyn ModuleIndex>,
    changelog: Arc<dyn ChangelogGenerator>,
    store: Arc<dyn PlanStore>,
    handlers: ManifestHandlers,
    events_path: PathBuf,
    config: OrchestrationConfig,
}

impl Orchestrator {
    pub fn new(
        vcs: Arc<dyn VersionControl>,
        ci: Arc<dyn CiStatus>,
        index: Arc<dyn ModuleIndex>,
        store: Arc<dyn PlanStore>,
        events_path: impl Into<PathBuf>,
        config: OrchestrationConfig,
    ) -> Self {
        Self {
            vcs,
            ci,
            index,
            changelog: Arc::new(CommitSummaryGenerator),
            store,
            handlers: ManifestHandlers::default(),
            events_path: events_path.into(),
            config,
        }
    }

    /// Generator used when a repository has no staged changelog draft.
    pub fn with_changelog(mut self, generator: Arc<dyn ChangelogGenerator>) -> Self {
        self.changelog = generator;
        self
    }

    pub fn with_handlers(mut self, handlers: ManifestHandlers) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn config(&self) -> &OrchestrationConfig {
        &self.config
    }

    /// Release every selected repository of `plan`, level by level.
    ///
    /// Returns [`ReleaseError::LevelFailed`] naming every repository that
    /// failed in the first level with a failure; later levels never start.
    /// The persisted plan keeps the progress made so far.
    pub fn run(
        &self,
        graph: &DependencyGraph,
        plan: ReleasePlan,
        reporter: &mut (dyn Reporter + Send),
    ) -> ReleaseResult<OrchestrationReport> {
        let config = &self.config;
        if config.resume && !plan.is_resumable() {
            return Err(ReleaseError::NothingToResume {
                plan_id: plan.plan_id.clone(),
            });
        }
        let release_type = plan.release_type;
        let levels = plan.levels.clone();
        let plan_id = plan.plan_id.clone();
        let plan = Mutex::new(plan);
        let reporter: &mut (dyn Reporter + Send) = &mut *reporter;
        let reporter = Mutex::new(reporter);

        let ctx = RunContext {
            vcs: self.vcs.as_ref(),
            ci: self.ci.as_ref(),
            index: self.index.as_ref(),
            changelog: self.changelog.as_ref(),
            handlers: &self.handlers,
            store: self.store.as_ref(),
            graph,
            config,
            plan: &plan,
            reporter: &reporter,
            events_path: &self.events_path,
            release_type,
            events_broken: AtomicBool::new(false),
        };

        let mode = if config.dry_run { " (dry run)" } else { "" };
        ctx.info(&format!(
            "releasing plan {plan_id}: {} levels, {release_type}{mode}",
            levels.len()
        ));
        ctx.event(
            "",
            EventType::RunStarted {
                plan_id,
                dry_run: config.dry_run,
            },
        );

        let mut report = OrchestrationReport::default();
        for (index, names) in levels.iter().enumerate() {
            if config.cancel.is_cancelled() {
                ctx.warn(&format!("cancelled before level {index}"));
                return Err(ReleaseError::Cancelled);
            }

            let eligible: Vec<RepoReleasePlan> = {
                let plan = lock(&plan);
                names
                    .iter()
                    .filter_map(|name| plan.repos.get(name))
                    .filter(|repo| repo.is_releasing())
                    .cloned()
                    .collect()
            };
            if eligible.is_empty() {
                continue;
            }

            let repo_names: Vec<String> = eligible.iter().map(|r| r.name.clone()).collect();
            ctx.info(&format!("level {index}: {}", repo_names.join(", ")));
            ctx.event(
                "",
                EventType::LevelStarted {
                    level: index,
                    repos: repo_names,
                },
            );

            let outcomes = run_level(&ctx, &eligible);
            let failures: Vec<StepFailure> = outcomes
                .iter()
                .filter_map(|r| match &r.outcome {
                    RepoOutcome::Failed { step, message } => Some(StepFailure {
                        repo: r.repo.clone(),
                        step: *step,
                        message: message.clone(),
                    }),
                    _ => None,
                })
                .collect();
            report.levels.push(LevelReport { index, outcomes });

            if !failures.is_empty() {
                ctx.event(
                    "",
                    EventType::LevelFailed {
                        level: index,
                        failed: failures.iter().map(|f| f.repo.clone()).collect(),
                    },
                );
                ctx.error(&format!(
                    "level {index} failed; later levels were not started"
                ));
                return Err(ReleaseError::LevelFailed {
                    level: index,
                    failures,
                });
            }
        }

        let released = report.released();
        ctx.event("", EventType::RunCompleted { released });
        ctx.info(&format!(
            "{released} released, {} already released",
            report.already_released()
        ));

        if !config.dry_run && config.push {
            let staged: Vec<PathBuf> = lock(&plan)
                .repos
                .values()
                .filter_map(|r| r.changelog_path.clone())
                .collect();
            self.store.clear()?;
            for path in staged {
                let _ = std::fs::remove_file(path);
            }
            ctx.info(&format!("release complete; cleared {}", self.store.location()));
        }

        Ok(report)
    }
}

/// One thread per repository; waits for all of them.
fn run_level(ctx: &RunContext<'_>, repos: &[RepoReleasePlan]) -> Vec<RepoReport> {
    thread::scope(|s| {
        let handles: Vec<_> = repos
            .iter()
            .map(|repo| (repo.name.clone(), s.spawn(move || release_repo(ctx, repo))))
            .collect();

        handles
            .into_iter()
            .map(|(name, handle)| {
                handle.join().unwrap_or_else(|_| {
                    ctx.error(&format!("{name}: release task panicked"));
                    RepoReport {
                        repo: name,
                        outcome: RepoOutcome::Failed {
                            step: ReleaseStep::Start,
                            message: "release task panicked".to_string(),
                        },
                    }
                })
            })
            .collect()
    })
}

fn release_repo(ctx: &RunContext<'_>, repo: &RepoReleasePlan) -> RepoReport {
    let runner = RepoRunner::new(ctx, repo);
    let version = repo.next_version.clone();

    let outcome = match runner.start_point() {
        Err(f) => RepoOutcome::Failed {
            step: f.step,
            message: f.message,
        },
        Ok(start) if start.step == ReleaseStep::Done => {
            ctx.info(&format!("{}: {version} already released", repo.name));
            ctx.event(
                &repo.name,
                EventType::RepoAlreadyReleased {
                    version: version.clone(),
                },
            );
            RepoOutcome::AlreadyReleased { version }
        }
        Ok(start) if ctx.config.dry_run => {
            let steps = runner.planned_steps(start.step);
            let names: Vec<String> = steps.iter().map(ToString::to_string).collect();
            ctx.info(&format!("{}: would run {}", repo.name, names.join(" -> ")));
            RepoOutcome::Planned { steps }
        }
        Ok(start) => {
            if start.step != ReleaseStep::Start {
                ctx.info(&format!("{}: resuming at {}", repo.name, start.step));
            } else if ctx.config.resume {
                ctx.info(&format!("{}: no checkpoint recorded; starting over", repo.name));
            }
            match runner.run(start.step) {
                Ok(outcome) => outcome,
                Err(f) => RepoOutcome::Failed {
                    step: f.step,
                    message: f.message,
                },
            }
        }
    };

    RepoReport {
        repo: repo.name.clone(),
        outcome,
    }
}
