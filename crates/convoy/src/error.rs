//! Error taxonomy for planning and orchestration.
//!
//! Adapters talk `anyhow`; everything that crosses the library boundary is
//! one of these variants so callers can tell "no plan yet" from "the level
//! failed" without string matching.

use std::path::PathBuf;

use thiserror::Error;

use crate::steps::ReleaseStep;

/// One repository's state-machine transition that did not complete.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{repo}: {step} failed: {message}")]
pub struct StepFailure {
    pub repo: String,
    pub step: ReleaseStep,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum ReleaseError {
    /// A manifest could not be read or parsed.
    #[error("failed to build dependency graph: {0}")]
    GraphBuild(String),

    #[error("dependency cycle detected: {}", .cycle.join(" -> "))]
    Cycle { cycle: Vec<String> },

    /// An existing tag does not parse under a policy that needs strict semver.
    #[error("version calculation failed: {0}")]
    VersionCalculation(String),

    #[error("release plan persistence failed: {0}")]
    Persistence(String),

    #[error("no release plan found at {}", .path.display())]
    PlanNotFound { path: PathBuf },

    #[error(transparent)]
    Step(#[from] StepFailure),

    #[error("level {level} failed for {}", describe_failures(.failures))]
    LevelFailed {
        level: usize,
        failures: Vec<StepFailure>,
    },

    #[error("release cancelled")]
    Cancelled,

    #[error("nothing to resume: plan {plan_id} has no recorded progress or failure")]
    NothingToResume { plan_id: String },

    #[error("unknown repository: {0}")]
    UnknownRepository(String),

    #[error("cannot select {repo}: {reason}")]
    InvalidSelection { repo: String, reason: String },
}

impl ReleaseError {
    /// Names of the repositories a level failure reported.
    pub fn failed_repos(&self) -> Vec<&str> {
        match self {
            ReleaseError::LevelFailed { failures, .. } => {
                failures.iter().map(|f| f.repo.as_str()).collect()
            }
            ReleaseError::Step(f) => vec![f.repo.as_str()],
            _ => Vec::new(),
        }
    }
}

fn describe_failures(failures: &[StepFailure]) -> String {
    let noun = if failures.len() == 1 { "repository" } else { "repositories" };
    let details = failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ");
    format!("{} {noun}: {details}", failures.len())
}

pub type ReleaseResult<T> = std::result::Result<T, ReleaseError>;
