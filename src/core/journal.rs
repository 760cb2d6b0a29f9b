//! Migration journal
//!
//! Append-only record of what a run did, in order:
//! - Stage transitions with microsecond timestamps
//! - Store-level actions (backup, apply, save)
//! - Failures, with the stage they happened in
//!
//! The journal is attached to every migration report.

use crate::core::record::format_timestamp;
use chrono::{Local, NaiveDateTime};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Kind of journal entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalEvent {
    /// Engine entered a new stage
    Stage,
    /// A store was backed up
    Backup,
    /// A mapping was applied to a store
    Apply,
    /// A store was written to disk
    Save,
    /// A stage failed
    Failure,
}

/// Single journal entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub timestamp: String,
    pub event: JournalEvent,
    /// Stage the engine was in
    pub stage: String,
    pub detail: String,
}

/// Thread-safe ordered journal
#[derive(Debug)]
pub struct MigrationJournal {
    entries: Mutex<Vec<JournalEntry>>,
    clock: fn() -> NaiveDateTime,
}

fn local_now() -> NaiveDateTime {
    Local::now().naive_local()
}

impl Default for MigrationJournal {
    fn default() -> Self {
        Self::new()
    }
}

impl MigrationJournal {
    pub fn new() -> Self {
        Self::with_clock(local_now)
    }

    /// Journal with an injected clock
    pub fn with_clock(clock: fn() -> NaiveDateTime) -> Self {
        MigrationJournal {
            entries: Mutex::new(Vec::new()),
            clock,
        }
    }

    pub fn record(&self, event: JournalEvent, stage: &str, detail: impl Into<String>) {
        let entry = JournalEntry {
            timestamp: format_timestamp((self.clock)()),
            event,
            stage: stage.to_string(),
            detail: detail.into(),
        };
        self.entries.lock().push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Copy of all entries so far
    pub fn entries(&self) -> Vec<JournalEntry> {
        self.entries.lock().clone()
    }

    /// Drain the journal
    pub fn take(&self) -> Vec<JournalEntry> {
        std::mem::take(&mut *self.entries.lock())
    }
}
