//! Planning pass: graph + repository analysis + versions → [`ReleasePlan`].

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use semver::Version;
use sha2::{Digest, Sha256};

use crate::changelog::{self, ChangelogGenerator, ChangelogRequest};
use crate::error::{ReleaseError, ReleaseResult};
use crate::git::VersionControl;
use crate::graph::{DependencyGraph, RepositoryNode};
use crate::levels::compute_levels;
use crate::process::CancelToken;
use crate::types::{
    ApprovalStatus, BumpKind, GitSnapshot, ParentVersion, ReleasePlan, ReleaseProgress,
    ReleaseType, RepoReleasePlan,
};
use crate::version::{self, VersionInputs};

#[derive(Debug, Clone)]
pub struct PlanOptions {
    pub release_type: ReleaseType,
    /// Release requested repositories even without new commits. With no
    /// explicit request, every member is requested.
    pub force: bool,
    /// Repositories to release regardless of changes.
    pub requested: Vec<String>,
    pub cascade_dependents: bool,
    pub today: NaiveDate,
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self {
            release_type: ReleaseType::Full,
            force: false,
            requested: Vec::new(),
            cascade_dependents: true,
            today: Utc::now().date_naive(),
        }
    }
}

/// What the version-control adapter says about one repository.
#[derive(Debug, Clone)]
struct RepoFacts {
    current_tag: Option<String>,
    commits_since_tag: u32,
    head_tagged: bool,
    short_hash: String,
    subjects: Vec<String>,
    snapshot: GitSnapshot,
}

pub struct Planner {
    vcs: Arc<dyn VersionControl>,
    changelog: Option<Arc<dyn ChangelogGenerator>>,
    state_dir: PathBuf,
}

impl Planner {
    pub fn new(vcs: Arc<dyn VersionControl>, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            vcs,
            changelog: None,
            state_dir: state_dir.into(),
        }
    }

    /// Draft changelogs (and bump suggestions) with `generator`.
    pub fn with_changelog(mut self, generator: Arc<dyn ChangelogGenerator>) -> Self {
        self.changelog = Some(generator);
        self
    }

    pub fn plan(
        &self,
        root: &Path,
        graph: &DependencyGraph,
        opts: &PlanOptions,
        cancel: &CancelToken,
    ) -> ReleaseResult<ReleasePlan> {
        for name in &opts.requested {
            if graph.node(name).is_none() {
                return Err(ReleaseError::UnknownRepository(name.clone()));
            }
        }

        let mut facts = Vec::with_capacity(graph.len());
        for node in graph.nodes() {
            if cancel.is_cancelled() {
                return Err(ReleaseError::Cancelled);
            }
            facts.push(self.analyse(node, opts.release_type)?);
        }

        let changed: BTreeSet<&str> = graph
            .nodes()
            .iter()
            .zip(&facts)
            .filter(|(_, f)| f.commits_since_tag > 0)
            .map(|(n, _)| n.name.as_str())
            .collect();
        let requested: BTreeSet<&str> = if opts.force && opts.requested.is_empty() {
            graph.nodes().iter().map(|n| n.name.as_str()).collect()
        } else {
            opts.requested.iter().map(String::as_str).collect()
        };
        let mut cascaded: BTreeSet<String> = BTreeSet::new();
        if opts.cascade_dependents {
            for name in changed.union(&requested) {
                cascaded.extend(graph.transitive_dependents(name));
            }
        }

        let mut repos = std::collections::BTreeMap::new();
        for (node, facts) in graph.nodes().iter().zip(facts) {
            if cancel.is_cancelled() {
                return Err(ReleaseError::Cancelled);
            }
            let name = node.name.as_str();
            let explicit = changed.contains(name) || requested.contains(name);
            let cascade_only = !explicit && cascaded.contains(name);
            let repo = self.plan_repo(node, facts, opts, explicit, cascade_only, cancel)?;
            repos.insert(node.name.clone(), repo);
        }

        let levels = compute_levels(graph, |name| {
            repos.get(name).is_some_and(RepoReleasePlan::is_releasing)
        })?;
        let any_release = repos.values().any(RepoReleasePlan::is_releasing);
        let parent = self.parent_version(root, opts.today, any_release)?;

        Ok(ReleasePlan {
            plan_id: compute_plan_id(opts.release_type, &repos),
            created_at: Utc::now(),
            release_type: opts.release_type,
            root: root.to_path_buf(),
            parent,
            levels,
            repos,
        })
    }

    fn analyse(&self, node: &RepositoryNode, release_type: ReleaseType) -> ReleaseResult<RepoFacts> {
        let dir = &node.dir;
        let vcs_err = |e: anyhow::Error| {
            ReleaseError::VersionCalculation(format!("{}: {e:#}", node.name))
        };

        let current_tag = self
            .vcs
            .latest_tag(dir, release_type.is_rc())
            .map_err(vcs_err)?;
        let since = current_tag.as_deref();
        let commits_since_tag = self.vcs.commit_count(dir, since).map_err(vcs_err)?;
        let head_tagged = self.vcs.exact_tag(dir).map_err(vcs_err)?.is_some();
        let short_hash = self.vcs.short_head(dir).map_err(vcs_err)?;
        let subjects = if commits_since_tag > 0 {
            self.vcs.log_subjects(dir, since).map_err(vcs_err)?
        } else {
            Vec::new()
        };
        let porcelain = self.vcs.status(dir).map_err(vcs_err)?;
        let (ahead, behind) = self.vcs.ahead_behind(dir).map_err(vcs_err)?;

        Ok(RepoFacts {
            current_tag,
            commits_since_tag,
            head_tagged,
            short_hash,
            subjects,
            snapshot: GitSnapshot::from_porcelain(&porcelain, ahead, behind),
        })
    }

    fn plan_repo(
        &self,
        node: &RepositoryNode,
        facts: RepoFacts,
        opts: &PlanOptions,
        explicit: bool,
        cascade_only: bool,
        cancel: &CancelToken,
    ) -> ReleaseResult<RepoReleasePlan> {
        let current_version =
            version::current_label(facts.current_tag.as_deref(), &Version::new(0, 0, 0));
        let mut suggested = if cascade_only {
            BumpKind::Patch
        } else {
            changelog::suggest_bump(&facts.subjects)
        };

        let compute = |bump: BumpKind| {
            version::next_version(&VersionInputs {
                current_tag: facts.current_tag.as_deref(),
                bump,
                release_type: opts.release_type,
                short_hash: &facts.short_hash,
                commits_since_tag: facts.commits_since_tag,
                head_tagged: facts.head_tagged,
                force: opts.force || cascade_only,
            })
        };

        let included = explicit || cascade_only;
        let mut next_version = if included {
            compute(suggested)?
        } else {
            current_version.clone()
        };

        let mut changelog_path = None;
        if included
            && facts.commits_since_tag > 0
            && !opts.release_type.is_rc()
            && let Some(generator) = &self.changelog
        {
            let request = ChangelogRequest {
                repo: node.name.clone(),
                current_version: current_version.clone(),
                next_version: next_version.clone(),
                commits: facts.subjects.clone(),
            };
            let draft = generator.generate(&request, cancel).map_err(|e| {
                ReleaseError::VersionCalculation(format!("{}: changelog draft: {e:#}", node.name))
            })?;
            let path = changelog::stage_draft(&self.state_dir, &node.name, &draft.changelog)
                .map_err(|e| ReleaseError::Persistence(format!("{e:#}")))?;
            changelog_path = Some(path);
            if draft.bump != suggested {
                suggested = draft.bump;
                next_version = compute(suggested)?;
            }
        }

        let selected = included && next_version != current_version;
        Ok(RepoReleasePlan {
            name: node.name.clone(),
            dir: node.dir.clone(),
            project_type: node.project_type,
            module_path: node.module_path.clone(),
            current_version,
            suggested_bump: suggested,
            selected_bump: suggested,
            next_version,
            selected,
            approval: ApprovalStatus::PendingReview,
            commits_since_tag: facts.commits_since_tag,
            head_tagged: facts.head_tagged,
            short_hash: facts.short_hash,
            changelog_path,
            snapshot: facts.snapshot,
            progress: ReleaseProgress::default(),
        })
    }

    /// Calendar version of the ecosystem root, when the root is itself a
    /// repository.
    fn parent_version(&self, root: &Path, today: NaiveDate, any_release: bool) -> ReleaseResult<ParentVersion> {
        if !root.join(".git").exists() {
            return Ok(ParentVersion::default());
        }
        let tags = self
            .vcs
            .tags(root, &format!("{}*", version::TAG_PREFIX))
            .map_err(|e| ReleaseError::VersionCalculation(format!("ecosystem root: {e:#}")))?;
        let current = version::latest_calendar_tag(&tags);
        let proposed = version::next_calendar_version(current.as_deref(), today, &tags, any_release);
        Ok(ParentVersion { current, proposed })
    }
}

/// sha256 over the release type and every releasing `name@version`.
pub fn compute_plan_id(
    release_type: ReleaseType,
    repos: &std::collections::BTreeMap<String, RepoReleasePlan>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(release_type.to_string().as_bytes());
    hasher.update(b"\n");
    for repo in repos.values().filter(|r| r.is_releasing()) {
        hasher.update(repo.name.as_bytes());
        hasher.update(b"@");
        hasher.update(repo.next_version.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}
