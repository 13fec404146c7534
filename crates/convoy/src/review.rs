//! Review-step mutations of a persisted plan.
//!
//! The CLI applies one of these, re-levels the plan against the current
//! graph, and saves it before doing anything else.

use crate::error::{ReleaseError, ReleaseResult};
use crate::graph::DependencyGraph;
use crate::levels::compute_levels;
use crate::planner::compute_plan_id;
use crate::types::{ApprovalStatus, BumpKind, ReleasePlan, RepoReleasePlan};
use crate::version::{self, VersionInputs};

impl ReleasePlan {
    fn repo_mut(&mut self, name: &str) -> ReleaseResult<&mut RepoReleasePlan> {
        self.repos
            .get_mut(name)
            .ok_or_else(|| ReleaseError::UnknownRepository(name.to_string()))
    }

    /// Override the bump for `name` and recompute its next version.
    ///
    /// An explicit bump always moves the version, so the repository becomes
    /// selected again. Its approval is reset since the version changed.
    pub fn set_bump(&mut self, name: &str, bump: BumpKind) -> ReleaseResult<&RepoReleasePlan> {
        let release_type = self.release_type;
        let repo = self.repo_mut(name)?;
        // An untagged repository shows as v0.0.0, which parses to the same base.
        let next = version::next_version(&VersionInputs {
            current_tag: Some(repo.current_version.as_str()),
            bump,
            release_type,
            short_hash: &repo.short_hash,
            commits_since_tag: repo.commits_since_tag,
            head_tagged: repo.head_tagged,
            force: true,
        })?;

        if next != repo.next_version || bump != repo.selected_bump {
            repo.approval = ApprovalStatus::PendingReview;
        }
        repo.selected_bump = bump;
        repo.next_version = next;
        repo.selected = repo.next_version != repo.current_version;
        Ok(repo)
    }

    pub fn approve(&mut self, name: &str) -> ReleaseResult<()> {
        self.repo_mut(name)?.approval = ApprovalStatus::Approved;
        Ok(())
    }

    /// Approve every selected repository; returns how many changed.
    pub fn approve_all(&mut self) -> usize {
        let mut changed = 0;
        for repo in self.repos.values_mut().filter(|r| r.selected) {
            if repo.approval != ApprovalStatus::Approved {
                repo.approval = ApprovalStatus::Approved;
                changed += 1;
            }
        }
        changed
    }

    pub fn set_selected(&mut self, name: &str, selected: bool) -> ReleaseResult<()> {
        let repo = self.repo_mut(name)?;
        if selected && repo.next_version == repo.current_version {
            return Err(ReleaseError::InvalidSelection {
                repo: name.to_string(),
                reason: format!(
                    "next version equals current version {}; set a bump first",
                    repo.current_version
                ),
            });
        }
        repo.selected = selected;
        Ok(())
    }

    /// Selected repositories still waiting for approval, in level order.
    pub fn pending_review(&self) -> Vec<&str> {
        self.releasing()
            .filter(|r| r.approval == ApprovalStatus::PendingReview)
            .map(|r| r.name.as_str())
            .collect()
    }

    /// Recompute levels and plan id after the selection changed.
    pub fn relevel(&mut self, graph: &DependencyGraph) -> ReleaseResult<()> {
        let repos = &self.repos;
        self.levels = compute_levels(graph, |name| {
            repos.get(name).is_some_and(RepoReleasePlan::is_releasing)
        })?;
        self.plan_id = compute_plan_id(self.release_type, &self.repos);
        Ok(())
    }
}
