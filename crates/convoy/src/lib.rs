//! # Convoy
//!
//! Dependency-ordered, resumable releases for ecosystems made of many
//! repositories.
//!
//! Each member repository is versioned and tagged on its own, but members
//! depend on each other through their manifests (`go.mod`, `Cargo.toml`).
//! Convoy releases them as a convoy: dependencies first, dependents after
//! their manifests were pointed at the freshly tagged versions.
//!
//! ## Pipeline
//!
//! The core flow is **plan → review → release → (resume if interrupted)**:
//!
//! 1. [`graph::DependencyGraph::build`] scans every member manifest and keeps
//!    the edges between members.
//! 2. [`planner::Planner::plan`] asks version control what changed, computes
//!    next versions (semantic, release-candidate, or calendar for the
//!    ecosystem parent) and groups releasing repositories into levels.
//! 3. The plan is persisted through a [`store::PlanStore`] and adjusted with
//!    the review operations on [`types::ReleasePlan`] (bump, select, approve).
//! 4. [`engine_parallel::Orchestrator::run`] walks the levels; within a level
//!    every repository runs the release state machine on its own thread and
//!    checkpoints the plan after each durable side effect.
//!
//! ## Modules
//!
//! - [`graph`] / [`levels`] — Member discovery, dependency edges, leveling
//! - [`version`] — Semantic, release-candidate and calendar versions
//! - [`planner`] / [`review`] — Building and adjusting a release plan
//! - [`store`] — Atomic plan persistence
//! - [`steps`] — Release state machine transitions and resume rules
//! - [`engine`] / [`engine_parallel`] — Per-repository runner and level orchestration
//! - [`git`] — The only code that runs `git`
//! - [`ci`] / [`index`] / [`changelog`] — CI, module index and changelog collaborators
//! - [`manifest`] — Pluggable manifest handlers
//! - [`config`] — `.convoy.toml` loading
//! - [`events`] — Append-only JSONL event log

pub mod changelog;
pub mod ci;
pub mod config;
pub mod engine;
pub mod engine_parallel;
pub mod error;
pub mod events;
pub mod git;
pub mod graph;
pub mod index;
pub mod levels;
pub mod manifest;
pub mod planner;
pub mod review;
pub mod steps;
pub mod store;
pub mod types;
pub mod version;

pub use convoy_process as process;
pub use convoy_retry as retry;

#[cfg(test)]
mod test_support;
