use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};

use convoy::changelog::{ChangelogGenerator, CommandGenerator, CommitSummaryGenerator};
use convoy::ci::{CiTiming, GithubActions};
use convoy::config::{CONFIG_FILE, ConvoyConfig};
use convoy::engine::{OrchestrationConfig, OrchestrationReport, RepoOutcome, Reporter};
use convoy::engine_parallel::Orchestrator;
use convoy::error::ReleaseError;
use convoy::events::{self, EventLog, EventType};
use convoy::git::{GitCli, VersionControl, git_program};
use convoy::graph::DependencyGraph;
use convoy::index::GoProxy;
use convoy::manifest::ManifestHandlers;
use convoy::planner::{PlanOptions, Planner};
use convoy::process::CancelToken;
use convoy::store::{FilePlanStore, PlanStore};
use convoy::types::{ApprovalStatus, BumpKind, ReleasePlan, ReleaseType, RepoReleasePlan};

#[derive(Parser, Debug)]
#[command(name = "convoy", version)]
#[command(about = "Dependency-ordered, resumable releases for multi-repository ecosystems")]
struct Cli {
    /// Ecosystem root holding the member repositories
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    /// Directory for the release plan and event log (default: ~/.convoy)
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Analyse every member and write a fresh release plan.
    Plan {
        /// Plan a release candidate instead of a full release.
        #[arg(long)]
        rc: bool,
        /// Release requested repositories even without new commits.
        #[arg(long)]
        force: bool,
        /// Request a repository explicitly (repeatable).
        #[arg(long = "repo")]
        repos: Vec<String>,
        /// Do not pull in dependents of changed repositories.
        #[arg(long)]
        no_cascade: bool,
    },
    /// Print the persisted plan.
    Show {
        #[arg(long)]
        json: bool,
    },
    /// Override the version bump of one repository.
    Bump { repo: String, bump: BumpKind },
    /// Approve repositories for release.
    Approve {
        repos: Vec<String>,
        #[arg(long)]
        all: bool,
    },
    /// Include a repository in the release.
    Select { repo: String },
    /// Leave a repository out of the release.
    Deselect { repo: String },
    /// Execute the plan level by level (honours recorded progress).
    Release {
        /// Print what would run without touching anything.
        #[arg(long)]
        dry_run: bool,
        /// Commit and tag locally; never push or wait on remote systems.
        #[arg(long)]
        no_push: bool,
        /// Do not wait for CI workflows.
        #[arg(long)]
        skip_ci: bool,
        /// Require a partially completed plan and continue it.
        #[arg(long)]
        resume: bool,
        /// Release even with uncommitted changes.
        #[arg(long)]
        force: bool,
        /// Approve everything still pending review.
        #[arg(long)]
        yes: bool,
        /// Give up after this long (e.g. 45m, 2h).
        #[arg(long)]
        deadline: Option<String>,
    },
    /// Show release progress of the persisted plan.
    Status,
    /// Delete the plan, event log and staged changelog drafts.
    Clear,
    /// Print environment diagnostics.
    Doctor,
    /// Write a commented .convoy.toml to the ecosystem root.
    Init {
        #[arg(long)]
        force: bool,
    },
}

struct CliReporter;

impl Reporter for CliReporter {
    fn info(&mut self, msg: &str) {
        eprintln!("[info] {msg}");
    }

    fn warn(&mut self, msg: &str) {
        eprintln!("[warn] {msg}");
    }

    fn error(&mut self, msg: &str) {
        eprintln!("[error] {msg}");
    }
}

/// Everything a subcommand needs to know about the ecosystem on disk.
struct Workspace {
    root: PathBuf,
    config: ConvoyConfig,
    state_dir: PathBuf,
    store: FilePlanStore,
}

impl Workspace {
    fn open(root: &Path, state_dir: Option<&Path>) -> Result<Self> {
        let root = root
            .canonicalize()
            .with_context(|| format!("ecosystem root {} does not exist", root.display()))?;
        let config = ConvoyConfig::load_from_root(&root)?;
        let state_dir = config.state_dir(&root, state_dir);
        Ok(Self {
            store: FilePlanStore::new(&state_dir),
            root,
            config,
            state_dir,
        })
    }

    fn graph(&self) -> Result<DependencyGraph> {
        let members = self.config.member_dirs(&self.root)?;
        Ok(DependencyGraph::build(
            &self.root,
            &members,
            &ManifestHandlers::default(),
        )?)
    }

    fn git(&self, cancel: &CancelToken) -> GitCli {
        GitCli::new(
            git_program(self.config.git.program.as_deref()),
            self.config.git.remote.clone(),
        )
        .with_retry(self.config.git.retry.clone())
        .with_cancel(cancel.clone())
    }

    fn changelog(&self) -> Result<Arc<dyn ChangelogGenerator>> {
        Ok(match &self.config.changelog.command {
            Some(command) => Arc::new(
                CommandGenerator::from_command_line(command)?
                    .with_timeout(self.config.changelog.timeout),
            ),
            None => Arc::new(CommitSummaryGenerator),
        })
    }

    fn load_plan(&self) -> Result<ReleasePlan> {
        Ok(self.store.load()?)
    }

    fn save_plan(&self, plan: &ReleasePlan) -> Result<()> {
        Ok(self.store.save(plan)?)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut reporter = CliReporter;

    if let Commands::Init { force } = cli.cmd {
        return run_init(&cli.root, force);
    }

    let ws = Workspace::open(&cli.root, cli.state_dir.as_deref())?;

    match cli.cmd {
        Commands::Plan {
            rc,
            force,
            repos,
            no_cascade,
        } => {
            let release_type = if rc {
                ReleaseType::ReleaseCandidate
            } else {
                ReleaseType::Full
            };
            let opts = PlanOptions {
                release_type,
                force,
                requested: repos,
                cascade_dependents: ws.config.release.cascade_dependents && !no_cascade,
                today: Utc::now().date_naive(),
            };
            let plan = run_plan(&ws, &opts, &mut reporter)?;
            print_plan(&plan);
        }
        Commands::Show { json } => {
            let plan = ws.load_plan()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&plan)?);
            } else {
                print_plan(&plan);
            }
        }
        Commands::Bump { repo, bump } => {
            let mut plan = ws.load_plan()?;
            let updated = plan.set_bump(&repo, bump)?;
            println!(
                "{repo}: {} -> {} ({bump})",
                updated.current_version, updated.next_version
            );
            plan.relevel(&ws.graph()?)?;
            ws.save_plan(&plan)?;
        }
        Commands::Approve { repos, all } => {
            let mut plan = ws.load_plan()?;
            if all {
                let n = plan.approve_all();
                println!("approved {n} repositories");
            } else if repos.is_empty() {
                bail!("name the repositories to approve, or pass --all");
            } else {
                for repo in &repos {
                    plan.approve(repo)?;
                    println!("{repo}: approved");
                }
            }
            ws.save_plan(&plan)?;
        }
        Commands::Select { repo } => {
            let mut plan = ws.load_plan()?;
            plan.set_selected(&repo, true)?;
            plan.relevel(&ws.graph()?)?;
            ws.save_plan(&plan)?;
            println!("{repo}: selected");
        }
        Commands::Deselect { repo } => {
            let mut plan = ws.load_plan()?;
            plan.set_selected(&repo, false)?;
            plan.relevel(&ws.graph()?)?;
            ws.save_plan(&plan)?;
            println!("{repo}: deselected");
        }
        Commands::Release {
            dry_run,
            no_push,
            skip_ci,
            resume,
            force,
            yes,
            deadline,
        } => {
            let cancel = match deadline {
                Some(d) => CancelToken::with_deadline(parse_duration(&d)?),
                None => CancelToken::new(),
            };
            let config = OrchestrationConfig {
                dry_run,
                force,
                push: !no_push,
                skip_ci,
                resume,
                rc_branch: ws.config.release.rc_branch.clone(),
                changelog_file: ws.config.release.changelog_file.clone(),
                today: Utc::now().date_naive(),
                cancel,
            };
            run_release(&ws, config, yes, &mut reporter)?;
        }
        Commands::Status => run_status(&ws, &mut reporter)?,
        Commands::Clear => {
            ws.store.clear()?;
            let drafts = ws.state_dir.join("changelogs");
            if drafts.exists() {
                fs::remove_dir_all(&drafts)
                    .with_context(|| format!("failed to remove {}", drafts.display()))?;
            }
            println!("cleared {}", ws.state_dir.display());
        }
        Commands::Doctor => run_doctor(&ws, &mut reporter)?,
        Commands::Init { .. } => {}
    }

    Ok(())
}

fn parse_duration(s: &str) -> Result<Duration> {
    humantime::parse_duration(s).with_context(|| format!("invalid duration: {s}"))
}

fn run_plan(ws: &Workspace, opts: &PlanOptions, reporter: &mut dyn Reporter) -> Result<ReleasePlan> {
    match ws.store.load() {
        Ok(existing) if existing.has_progress() => bail!(
            "plan {} is partially released; finish it with `convoy release --resume` or discard it with `convoy clear`",
            existing.plan_id
        ),
        Ok(_) | Err(ReleaseError::PlanNotFound { .. }) => {}
        Err(e) => {
            return Err(e).context("existing plan is unreadable; run `convoy clear` first");
        }
    }

    let graph = ws.graph()?;
    reporter.info(&format!(
        "analysing {} repositories under {}",
        graph.len(),
        ws.root.display()
    ));

    let cancel = CancelToken::new();
    let planner = Planner::new(Arc::new(ws.git(&cancel)), &ws.state_dir).with_changelog(ws.changelog()?);
    let plan = planner.plan(&ws.root, &graph, opts, &cancel)?;

    ws.store.clear()?;
    ws.save_plan(&plan)?;
    reporter.info(&format!("plan written to {}", ws.store.location()));
    Ok(plan)
}

fn run_release(
    ws: &Workspace,
    config: OrchestrationConfig,
    yes: bool,
    reporter: &mut CliReporter,
) -> Result<()> {
    let mut plan = ws.load_plan()?;
    if !config.resume && plan.has_progress() {
        reporter.info("plan has recorded progress; continuing from it");
    }

    let pending: Vec<String> = plan
        .pending_review()
        .into_iter()
        .map(str::to_string)
        .collect();
    if !pending.is_empty() {
        if !yes {
            bail!(
                "pending review: {}; run `convoy approve` or pass --yes",
                pending.join(", ")
            );
        }
        plan.approve_all();
        if !config.dry_run {
            ws.save_plan(&plan)?;
        }
    }

    if plan.releasing().next().is_none() {
        reporter.warn("nothing is selected for release");
        return Ok(());
    }

    let graph = ws.graph()?;
    let vcs: Arc<dyn VersionControl> = Arc::new(ws.git(&config.cancel));
    let token = env::var(&ws.config.ci.token_env)
        .ok()
        .filter(|t| !t.trim().is_empty());
    let ci = GithubActions::new(
        &ws.config.ci.api_base,
        token,
        Arc::clone(&vcs),
        CiTiming {
            poll_interval: ws.config.ci.poll_interval,
            ci_timeout: ws.config.ci.ci_timeout,
            release_timeout: ws.config.ci.release_timeout,
        },
    )?;
    let index = GoProxy::new(
        &ws.config.module_index.proxy_url,
        ws.config.module_index.poll_interval,
        ws.config.module_index.timeout,
    )?;

    let orchestrator = Orchestrator::new(
        vcs,
        Arc::new(ci),
        Arc::new(index),
        Arc::new(FilePlanStore::new(&ws.state_dir)),
        events::events_path(&ws.state_dir),
        config,
    )
    .with_changelog(ws.changelog()?);

    match orchestrator.run(&graph, plan, reporter) {
        Ok(report) => {
            print_report(&report);
            Ok(())
        }
        Err(e @ ReleaseError::LevelFailed { .. }) => {
            reporter.error("progress was saved; fix the failure and run `convoy release --resume`");
            Err(e.into())
        }
        Err(e) => Err(e.into()),
    }
}

fn run_status(ws: &Workspace, reporter: &mut dyn Reporter) -> Result<()> {
    let plan = ws.load_plan()?;
    let log = EventLog::read_from_file(&events::events_path(&ws.state_dir))?;
    let vcs = ws.git(&CancelToken::new());

    println!("plan_id: {}", plan.plan_id);
    println!("release_type: {}", plan.release_type);
    println!("events: {}", log.len());
    println!();

    for repo in plan.releasing() {
        let p = &repo.progress;
        let remote = if !p.tag_pushed {
            "-"
        } else {
            match vcs.remote_tag_exists(&repo.dir, &repo.next_version) {
                Ok(true) => "verified",
                Ok(false) => "missing",
                Err(e) => {
                    reporter.warn(&format!("{}: cannot check remote tag: {e:#}", repo.name));
                    "unknown"
                }
            }
        };
        println!(
            "{}@{}: changelog_pushed={} ci_passed={} tag_pushed={} remote_tag={remote}",
            repo.name, repo.next_version, p.changelog_pushed, p.ci_passed, p.tag_pushed
        );

        if let Some(op) = &p.last_failed_operation {
            let message = log
                .events_for_repo(&repo.name)
                .into_iter()
                .rev()
                .find_map(|e| match &e.event_type {
                    EventType::StepFailed { message, .. } => Some(message.as_str()),
                    _ => None,
                });
            match message {
                Some(m) => println!("  last failure: {op}: {m}"),
                None => println!("  last failure: {op}"),
            }
        }
    }

    Ok(())
}

fn run_doctor(ws: &Workspace, reporter: &mut dyn Reporter) -> Result<()> {
    println!("root: {}", ws.root.display());
    let config_path = ws.root.join(CONFIG_FILE);
    let config_state = if config_path.exists() { "found" } else { "defaults" };
    println!("config: {} ({config_state})", config_path.display());
    println!("state_dir: {}", ws.state_dir.display());
    println!("plan: {}", if ws.store.exists() { "present" } else { "absent" });

    match ws.graph() {
        Ok(graph) => {
            let names: Vec<&str> = graph.nodes().iter().map(|n| n.name.as_str()).collect();
            println!("members: {} ({})", names.len(), names.join(", "));
        }
        Err(e) => reporter.warn(&format!("cannot build dependency graph: {e:#}")),
    }

    let token_env = &ws.config.ci.token_env;
    let token = env::var(token_env).is_ok_and(|t| !t.trim().is_empty());
    println!("ci_token ({token_env}): {}", if token { "detected" } else { "missing" });

    let changelog = match &ws.config.changelog.command {
        Some(command) => command.join(" "),
        None => "built-in commit summary".to_string(),
    };
    println!("changelog: {changelog}");
    println!();

    let git = ws.git(&CancelToken::new());
    match git.version(&ws.root) {
        Ok(version) => println!("git: {version}"),
        Err(e) => reporter.warn(&format!("unable to run {} --version: {e:#}", git.program())),
    }

    Ok(())
}

fn run_init(root: &Path, force: bool) -> Result<()> {
    let path = root.join(CONFIG_FILE);
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    fs::write(&path, ConvoyConfig::default_toml_template())
        .with_context(|| format!("failed to write {}", path.display()))?;
    println!("wrote {}", path.display());
    Ok(())
}

fn approval_label(repo: &RepoReleasePlan) -> &'static str {
    match repo.approval {
        ApprovalStatus::Approved => "approved",
        ApprovalStatus::PendingReview => "pending review",
    }
}

fn print_plan(plan: &ReleasePlan) {
    println!("plan_id: {}", plan.plan_id);
    println!("release_type: {}", plan.release_type);
    println!("root: {}", plan.root.display());
    if let Some(proposed) = &plan.parent.proposed
        && plan.parent.current.as_ref() != Some(proposed)
    {
        let from = plan.parent.current.as_deref().unwrap_or("untagged");
        println!("parent: {proposed} (from {from})");
    }

    let width = plan.repos.keys().map(String::len).max().unwrap_or(0);
    for (idx, level) in plan.levels.iter().enumerate() {
        println!();
        println!("level {idx}:");
        for repo in level.iter().filter_map(|name| plan.repo(name)) {
            println!(
                "  {:<width$}  {} -> {}  {}  {}",
                repo.name,
                repo.current_version,
                repo.next_version,
                repo.selected_bump,
                approval_label(repo)
            );
        }
    }

    let idle: Vec<&RepoReleasePlan> = plan.repos.values().filter(|r| !r.is_releasing()).collect();
    if !idle.is_empty() {
        println!();
        println!("not releasing:");
        for repo in idle {
            println!("  {:<width$}  {}", repo.name, repo.current_version);
        }
    }
}

fn print_report(report: &OrchestrationReport) {
    for level in &report.levels {
        println!("level {}:", level.index);
        for r in &level.outcomes {
            match &r.outcome {
                RepoOutcome::Released { version } => println!("  {}: released {version}", r.repo),
                RepoOutcome::AlreadyReleased { version } => {
                    println!("  {}: already released {version}", r.repo)
                }
                RepoOutcome::Planned { steps } => {
                    let steps: Vec<String> = steps.iter().map(ToString::to_string).collect();
                    println!("  {}: would run {}", r.repo, steps.join(" -> "))
                }
                RepoOutcome::Failed { step, message } => {
                    println!("  {}: failed at {step}: {message}", r.repo)
                }
            }
        }
    }
    println!();
    println!(
        "released: {}, already released: {}, failed: {}",
        report.released(),
        report.already_released(),
        report.failed()
    );
}
