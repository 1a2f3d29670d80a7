//! Append-only JSONL audit log of bot actions.
//!
//! Every consequential action (PR opened, migration failed, tracker
//! transition) is appended to `events.jsonl` beside the store, one JSON
//! object per line, so operators can reconstruct what a run did without
//! replaying it.

use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const EVENTS_FILE: &str = ".gardener/events.jsonl";

pub fn events_path(store_root: &Path) -> PathBuf {
    store_root.join(EVENTS_FILE)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotEvent {
    pub timestamp: DateTime<Utc>,
    pub package: String,
    #[serde(flatten)]
    pub kind: BotEventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BotEventKind {
    RunStarted { command: String },
    RunFinished { command: String, ok: bool },
    PrOpened { migrator: String, number: u64 },
    MigrationFailed { migrator: String, reason: String },
    PrStateChanged { number: u64, state: String },
    RecordCorrupt { key: String },
}

/// In-memory buffer of events, flushed to the JSONL file in batches.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Vec<BotEvent>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, package: &str, kind: BotEventKind) {
        self.events.push(BotEvent {
            timestamp: Utc::now(),
            package: package.to_string(),
            kind,
        });
    }

    pub fn all_events(&self) -> &[BotEvent] {
        &self.events
    }

    /// Append buffered events to the log file and clear the buffer.
    pub fn flush_to(&mut self, path: &Path) -> Result<()> {
        if self.events.is_empty() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create event log dir {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .with_context(|| format!("failed to open event log {}", path.display()))?;
        for event in &self.events {
            let line = serde_json::to_string(event).context("failed to serialize event")?;
            writeln!(file, "{line}")
                .with_context(|| format!("failed to append event to {}", path.display()))?;
        }
        self.events.clear();
        Ok(())
    }

    /// Read back a full event log. Unparseable lines are skipped; a partial
    /// final line from a crashed writer must not poison the history.
    pub fn read_from(path: &Path) -> Result<Vec<BotEvent>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read event log {}", path.display()))?;
        Ok(content
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}
