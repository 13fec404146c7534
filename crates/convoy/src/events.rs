//! Append-only JSONL log of what a release run did.
//!
//! The log lives next to the plan file and is cleared together with it.
//! Each event is appended as soon as it happens so an interrupted run still
//! leaves a trail.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::steps::ReleaseStep;

pub const EVENTS_FILE: &str = "events.jsonl";

pub fn events_path(state_dir: &Path) -> PathBuf {
    state_dir.join(EVENTS_FILE)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventType {
    RunStarted {
        plan_id: String,
        dry_run: bool,
    },
    LevelStarted {
        level: usize,
        repos: Vec<String>,
    },
    StepStarted {
        step: ReleaseStep,
    },
    StepCompleted {
        step: ReleaseStep,
        duration_ms: u64,
    },
    StepFailed {
        step: ReleaseStep,
        message: String,
    },
    RepoReleased {
        version: String,
    },
    RepoAlreadyReleased {
        version: String,
    },
    LevelFailed {
        level: usize,
        failed: Vec<String>,
    },
    RunCompleted {
        released: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseEvent {
    pub timestamp: DateTime<Utc>,
    /// Repository the event concerns; empty for run- and level-wide events.
    #[serde(default)]
    pub repo: String,
    pub event_type: EventType,
}

impl ReleaseEvent {
    pub fn now(repo: impl Into<String>, event_type: EventType) -> Self {
        Self {
            timestamp: Utc::now(),
            repo: repo.into(),
            event_type,
        }
    }

    pub fn run(event_type: EventType) -> Self {
        Self::now(String::new(), event_type)
    }
}

#[derive(Debug, Default)]
pub struct EventLog {
    events: Vec<ReleaseEvent>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, event: ReleaseEvent) {
        self.events.push(event);
    }

    /// Append every recorded event to `path`, creating it if needed.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create events dir {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open events file {}", path.display()))?;
        let mut writer = BufWriter::new(file);

        for event in &self.events {
            let line = serde_json::to_string(event).context("failed to serialize event to JSON")?;
            writeln!(writer, "{line}").context("failed to write event line")?;
        }
        writer.flush().context("failed to flush events file")?;
        Ok(())
    }

    /// Read a log back. A missing file is an empty log.
    pub fn read_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }

        let file = File::open(path)
            .with_context(|| format!("failed to open events file {}", path.display()))?;
        let mut events = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line
                .with_context(|| format!("failed to read events file {}", path.display()))?;
            if line.trim().is_empty() {
                continue;
            }
            let event: ReleaseEvent = serde_json::from_str(&line)
                .with_context(|| format!("failed to parse event JSON from line: {line}"))?;
            events.push(event);
        }
        Ok(Self { events })
    }

    pub fn events_for_repo(&self, repo: &str) -> Vec<&ReleaseEvent> {
        self.events.iter().filter(|e| e.repo == repo).collect()
    }

    pub fn all_events(&self) -> &[ReleaseEvent] {
        &self.events
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Append a single event to the log at `path`.
pub fn append_event(path: &Path, event: ReleaseEvent) -> Result<()> {
    let mut log = EventLog::new();
    log.record(event);
    log.write_to_file(path)
}
