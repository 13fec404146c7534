//! The per-repository release state machine.
//!
//! A release is a fixed walk through [`ReleaseStep`]s. Which walk depends on
//! the release type and on whether dependency rewriting produced a commit.
//! Resuming never jumps around inside [`crate::engine`]: [`resume_from`]
//! maps the persisted progress flags to a starting step and the normal walk
//! continues from there.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{ReleaseProgress, ReleaseType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReleaseStep {
    Start,
    /// Release candidates only: point the RC branch at HEAD and check it out.
    BranchReset,
    DependenciesUpdated,
    DependencyPushed,
    DependencyCiWaited,
    ChangelogCommitted,
    ChangelogPushed,
    CiWaitedAfterChangelog,
    TagCreated,
    TagPushed,
    /// Release candidates only: force-push the RC branch.
    BranchPushed,
    ReleaseWorkflowWaited,
    ModuleAvailabilityWaited,
    Done,
}

impl fmt::Display for ReleaseStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The step after `step`, or `None` once `Done` is reached.
///
/// `deps_changed` only matters when leaving `DependenciesUpdated`: without a
/// dependency commit there is nothing to push or wait for.
pub fn successor(step: ReleaseStep, kind: ReleaseType, deps_changed: bool) -> Option<ReleaseStep> {
    use ReleaseStep::*;

    let rc = kind.is_rc();
    let next = match step {
        Start if rc => BranchReset,
        Start | BranchReset => DependenciesUpdated,
        DependenciesUpdated if deps_changed => DependencyPushed,
        DependenciesUpdated | DependencyCiWaited if rc => TagCreated,
        DependenciesUpdated | DependencyCiWaited => ChangelogCommitted,
        DependencyPushed => DependencyCiWaited,
        ChangelogCommitted => ChangelogPushed,
        ChangelogPushed => CiWaitedAfterChangelog,
        CiWaitedAfterChangelog => TagCreated,
        TagCreated => TagPushed,
        TagPushed if rc => BranchPushed,
        TagPushed | BranchPushed => ReleaseWorkflowWaited,
        ReleaseWorkflowWaited => ModuleAvailabilityWaited,
        ModuleAvailabilityWaited => Done,
        Done => return None,
    };
    Some(next)
}

/// The full walk from `from` to `Done`, inclusive on both ends.
pub fn path_from(from: ReleaseStep, kind: ReleaseType, deps_changed: bool) -> Vec<ReleaseStep> {
    let mut out = vec![from];
    let mut cur = from;
    while let Some(next) = successor(cur, kind, deps_changed) {
        out.push(next);
        cur = next;
    }
    out
}

/// Where a repository's release should (re)start.
///
/// `tag_on_remote` is the result of independently checking the remote for the
/// release tag; a set `tag_pushed` flag alone is never taken as proof.
pub fn resume_from(progress: &ReleaseProgress, kind: ReleaseType, tag_on_remote: bool) -> ReleaseStep {
    if progress.tag_pushed && tag_on_remote {
        return ReleaseStep::Done;
    }
    if progress.ci_passed || progress.tag_pushed {
        return ReleaseStep::TagCreated;
    }
    if progress.changelog_pushed && !kind.is_rc() {
        return ReleaseStep::CiWaitedAfterChangelog;
    }
    ReleaseStep::Start
}

#[cfg(test)]
mod tests {
    use super::*;
    use ReleaseStep::*;

    #[test]
    fn full_release_with_dependency_changes() {
        assert_eq!(
            path_from(Start, ReleaseType::Full, true),
            vec![
                Start,
                DependenciesUpdated,
                DependencyPushed,
                DependencyCiWaited,
                ChangelogCommitted,
                ChangelogPushed,
                CiWaitedAfterChangelog,
                TagCreated,
                TagPushed,
                ReleaseWorkflowWaited,
                ModuleAvailabilityWaited,
                Done,
            ]
        );
    }

    #[test]
    fn full_release_without_dependency_changes_skips_dependency_push() {
        let path = path_from(Start, ReleaseType::Full, false);
        assert!(!path.contains(&DependencyPushed));
        assert!(!path.contains(&DependencyCiWaited));
        assert_eq!(path[2], ChangelogCommitted);
    }

    #[test]
    fn release_candidate_skips_changelog_and_adds_branch_steps() {
        assert_eq!(
            path_from(Start, ReleaseType::ReleaseCandidate, true),
            vec![
                Start,
                BranchReset,
                DependenciesUpdated,
                DependencyPushed,
                DependencyCiWaited,
                TagCreated,
                TagPushed,
                BranchPushed,
                ReleaseWorkflowWaited,
                ModuleAvailabilityWaited,
                Done,
            ]
        );
        let quiet = path_from(Start, ReleaseType::ReleaseCandidate, false);
        assert_eq!(&quiet[..4], &[Start, BranchReset, DependenciesUpdated, TagCreated]);
    }

    #[test]
    fn done_has_no_successor() {
        assert_eq!(successor(Done, ReleaseType::Full, true), None);
        assert_eq!(path_from(Done, ReleaseType::Full, false), vec![Done]);
    }

    #[test]
    fn resume_mapping() {
        let none = ReleaseProgress::default();
        assert_eq!(resume_from(&none, ReleaseType::Full, false), Start);

        let changelog = ReleaseProgress {
            changelog_pushed: true,
            ..Default::default()
        };
        assert_eq!(resume_from(&changelog, ReleaseType::Full, false), CiWaitedAfterChangelog);

        let ci = ReleaseProgress {
            changelog_pushed: true,
            ci_passed: true,
            ..Default::default()
        };
        assert_eq!(resume_from(&ci, ReleaseType::Full, false), TagCreated);
        assert_eq!(resume_from(&ci, ReleaseType::ReleaseCandidate, false), TagCreated);
    }

    #[test]
    fn tag_flag_needs_remote_confirmation() {
        let pushed = ReleaseProgress {
            changelog_pushed: true,
            ci_passed: true,
            tag_pushed: true,
            last_failed_operation: None,
        };
        assert_eq!(resume_from(&pushed, ReleaseType::Full, true), Done);
        assert_eq!(resume_from(&pushed, ReleaseType::Full, false), TagCreated);
    }

    #[test]
    fn display_matches_variant_name() {
        assert_eq!(TagPushed.to_string(), "TagPushed");
        assert_eq!(CiWaitedAfterChangelog.to_string(), "CiWaitedAfterChangelog");
    }
}
