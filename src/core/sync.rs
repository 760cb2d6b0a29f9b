//! Keeping the slotted store in step with the primary store
//!
//! Migration rewrites identifiers; these helpers cover the other direction of
//! drift, where the primary store gains records or its question text, answer,
//! round or `LAYER2` change after the slotted entries were created.

use crate::core::record::{format_timestamp, PrimaryRecord};
use crate::core::store::SlottedStore;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// What a parent sync changed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentSync {
    /// Parents that received a fresh 8-slot entry
    pub created: Vec<String>,

    /// Parents whose mirrored metadata was rewritten
    pub refreshed: Vec<String>,

    /// Slotted entries with no primary record
    pub orphans: Vec<String>,
}

impl ParentSync {
    pub fn changed(&self) -> bool {
        !self.created.is_empty() || !self.refreshed.is_empty()
    }
}

/// Give every primary record an entry in the slotted store
///
/// Returns the identifiers that got a new, empty entry.
pub fn ensure_slot_parents(
    primary: &[PrimaryRecord],
    slotted: &mut SlottedStore,
    now: NaiveDateTime,
) -> Vec<String> {
    let mut created = Vec::new();
    for record in primary {
        if record.qcode.trim().is_empty() {
            continue;
        }
        if slotted.insert_parent(record, now) {
            debug!("Created slot entry for {}", record.qcode);
            created.push(record.qcode.clone());
        }
    }
    created
}

/// Copy question, answer, round and `LAYER2` from the primary records into
/// the matching slotted entries
///
/// Returns the parents whose metadata changed.
pub fn refresh_parent_metadata(
    primary: &[PrimaryRecord],
    slotted: &mut SlottedStore,
    now: NaiveDateTime,
) -> Vec<String> {
    let mut refreshed = Vec::new();
    for record in primary {
        let Ok(entry) = slotted.entry_mut(&record.qcode) else {
            continue;
        };
        if entry.metadata.mirror(record) {
            entry.metadata.last_updated = Some(format_timestamp(now));
            refreshed.push(record.qcode.clone());
        }
    }
    refreshed
}

/// Slotted entries whose parent is not in the primary store
pub fn orphan_parents(primary: &[PrimaryRecord], slotted: &SlottedStore) -> Vec<String> {
    let known: BTreeSet<&str> = primary.iter().map(|r| r.qcode.as_str()).collect();
    slotted
        .entries()
        .keys()
        .filter(|parent| !known.contains(parent.as_str()))
        .cloned()
        .collect()
}

/// Create missing entries, refresh metadata, and report orphans
///
/// Orphans are reported, never deleted.
pub fn sync_parents(
    primary: &[PrimaryRecord],
    slotted: &mut SlottedStore,
    now: NaiveDateTime,
) -> ParentSync {
    let created = ensure_slot_parents(primary, slotted, now);
    let refreshed = refresh_parent_metadata(primary, slotted, now);
    let orphans = orphan_parents(primary, slotted);

    for orphan in &orphans {
        warn!("Slot entry {} has no primary record", orphan);
    }
    info!(
        "Parent sync: {} created, {} refreshed, {} orphaned",
        created.len(),
        refreshed.len(),
        orphans.len()
    );

    ParentSync {
        created,
        refreshed,
        orphans,
    }
}
