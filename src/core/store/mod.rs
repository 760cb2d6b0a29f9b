//! Persisted question stores
//!
//! The corpus lives in several files that must agree with each other:
//!
//! - [`ListStore`]: ordered question list (the master file)
//! - [`DictStore`]: questions keyed by identifier
//! - [`SlottedStore`]: eight derived-question slots per primary identifier
//! - [`TabularStore`]: sheet-shaped export with a `QCODE` column
//!
//! Every store implements [`QuestionStore`], and every read-side check works
//! on the [`StoreSnapshot`] a store produces rather than on the store itself.

mod dict;
mod list;
mod set;
mod slotted;
mod tabular;

pub use dict::DictStore;
pub use list::ListStore;
pub use set::StoreSet;
pub use slotted::{ParentMetadata, SlottedEntry, SlottedStore};
pub use tabular::TabularStore;

use crate::core::backup::{BackupManager, BackupRecord};
use crate::core::error::Result;
use crate::core::mapping::IdentifierMapping;
use crate::core::record::PrimaryRecord;
use crate::core::scheme::SchemeVersion;
use chrono::NaiveDateTime;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::core::error::QcodeError;

/// On-disk shape of a store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    List,
    Dict,
    Slotted,
    Tabular,
}

impl StoreKind {
    /// Whether this kind can be the authoritative primary store
    pub fn holds_primary_records(self) -> bool {
        matches!(self, StoreKind::List | StoreKind::Dict)
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StoreKind::List => "list",
            StoreKind::Dict => "dict",
            StoreKind::Slotted => "slotted",
            StoreKind::Tabular => "tabular",
        };
        f.write_str(s)
    }
}

impl FromStr for StoreKind {
    type Err = QcodeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "list" => Ok(StoreKind::List),
            "dict" => Ok(StoreKind::Dict),
            "slotted" => Ok(StoreKind::Slotted),
            "tabular" => Ok(StoreKind::Tabular),
            _ => Err(QcodeError::Config(format!(
                "Invalid store kind '{}'. Valid options: list, dict, slotted, tabular",
                s
            ))),
        }
    }
}

/// How much of the corpus a store is expected to hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Coverage {
    /// One entry per primary question
    #[default]
    Full,
    /// Any subset of the primary questions, but nothing else
    Subset,
}

/// Read-side view of a store: identifier → comparable fields
///
/// Identifier and timestamp fields are never part of the field map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub name: String,
    pub kind: StoreKind,
    pub coverage: Coverage,

    /// Entries in the store, duplicates included
    pub record_count: usize,

    pub records: BTreeMap<String, BTreeMap<String, String>>,

    /// Identifiers held by more than one entry
    pub duplicates: Vec<String>,
}

impl StoreSnapshot {
    pub fn new(name: impl Into<String>, kind: StoreKind, coverage: Coverage) -> Self {
        StoreSnapshot {
            name: name.into(),
            kind,
            coverage,
            record_count: 0,
            records: BTreeMap::new(),
            duplicates: Vec::new(),
        }
    }

    /// Snapshot of primary records, in the order given
    pub fn from_records(
        name: impl Into<String>,
        kind: StoreKind,
        coverage: Coverage,
        records: &[PrimaryRecord],
    ) -> Self {
        let mut snapshot = StoreSnapshot::new(name, kind, coverage);
        for record in records {
            snapshot.insert(record.qcode.clone(), record.comparable_fields());
        }
        snapshot
    }

    /// Add one entry, tracking duplicate identifiers
    pub fn insert(&mut self, identifier: String, fields: BTreeMap<String, String>) {
        self.record_count += 1;
        if self.records.contains_key(&identifier) && !self.duplicates.contains(&identifier) {
            self.duplicates.push(identifier.clone());
        }
        self.records.insert(identifier, fields);
    }

    pub fn identifiers(&self) -> BTreeSet<&str> {
        self.records.keys().map(String::as_str).collect()
    }

    /// The same snapshot with identifiers rewritten through `mapping`
    pub fn remap(&self, mapping: &IdentifierMapping) -> StoreSnapshot {
        let mut remapped = StoreSnapshot::new(self.name.clone(), self.kind, self.coverage);
        for (identifier, fields) in &self.records {
            remapped.insert(mapping.apply(identifier).to_string(), fields.clone());
        }
        remapped.record_count = self.record_count;
        for id in &self.duplicates {
            let id = mapping.apply(id).to_string();
            if !remapped.duplicates.contains(&id) {
                remapped.duplicates.push(id);
            }
        }
        remapped
    }
}

/// A persisted representation of the question corpus
pub trait QuestionStore: Send {
    fn name(&self) -> &str;

    fn kind(&self) -> StoreKind;

    fn coverage(&self) -> Coverage {
        Coverage::Full
    }

    /// File backing the store
    fn path(&self) -> &Path;

    /// Replace in-memory state with the file's contents
    fn load(&mut self) -> Result<()>;

    /// Persist in-memory state (temp file, then rename)
    fn save(&self) -> Result<()>;

    /// Verified copy of the backing file
    fn backup(&self, manager: &BackupManager) -> Result<BackupRecord> {
        manager.backup_file(self.name(), self.path())
    }

    fn snapshot(&self) -> StoreSnapshot;

    /// Primary identifiers held, in store order
    fn identifiers(&self) -> Vec<String>;

    /// Derived identifiers held (slotted stores only)
    fn derived_identifiers(&self) -> Vec<String> {
        Vec::new()
    }

    /// Full records, for stores that can act as the primary
    fn primary_records(&self) -> Option<&[PrimaryRecord]> {
        None
    }

    fn primary_records_mut(&mut self) -> Option<&mut [PrimaryRecord]> {
        None
    }

    /// Rewrite identifiers in memory; returns how many entries changed
    fn apply_mapping(&mut self, mapping: &IdentifierMapping, now: NaiveDateTime) -> Result<usize>;

    /// Record the scheme the identifiers now follow, where the format has room for it
    fn stamp_scheme(&mut self, _scheme: SchemeVersion, _now: NaiveDateTime) {}

    fn as_slotted(&self) -> Option<&SlottedStore> {
        None
    }

    fn as_slotted_mut(&mut self) -> Option<&mut SlottedStore> {
        None
    }
}

/// Open a store of the given kind and load it
pub fn open_store(
    kind: StoreKind,
    name: &str,
    path: impl AsRef<Path>,
    coverage: Coverage,
) -> Result<Box<dyn QuestionStore>> {
    let path = path.as_ref();
    let mut store: Box<dyn QuestionStore> = match kind {
        StoreKind::List => Box::new(ListStore::new(name, path).with_coverage(coverage)),
        StoreKind::Dict => Box::new(DictStore::new(name, path).with_coverage(coverage)),
        StoreKind::Slotted => Box::new(SlottedStore::new(name, path).with_coverage(coverage)),
        StoreKind::Tabular => Box::new(TabularStore::new(name, path).with_coverage(coverage)),
    };
    store.load()?;
    Ok(store)
}

pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = std::fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Write pretty JSON next to `path` and rename it into place
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut tmp = PathBuf::from(path);
    let file_name = path
        .file_name()
        .map(|n| format!("{}.tmp", n.to_string_lossy()))
        .unwrap_or_else(|| "store.json.tmp".to_string());
    tmp.set_file_name(file_name);

    let mut body = serde_json::to_vec_pretty(value)?;
    body.push(b'\n');
    std::fs::write(&tmp, &body)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Identifiers held by more than one record, in first-seen order
pub(crate) fn duplicate_qcodes(records: &[PrimaryRecord]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut duplicates = Vec::new();
    for record in records {
        if !seen.insert(record.qcode.as_str()) && !duplicates.contains(&record.qcode) {
            duplicates.push(record.qcode.clone());
        }
    }
    duplicates
}

/// Rewrite primary record identifiers, returning how many changed
pub(crate) fn remap_records(
    records: &mut [PrimaryRecord],
    mapping: &IdentifierMapping,
    now: NaiveDateTime,
) -> usize {
    let mut changed = 0;
    for record in records.iter_mut() {
        if let Some(new) = mapping.get(&record.qcode) {
            if new != record.qcode {
                record.qcode = new.to_string();
                record.touch(now);
                changed += 1;
            }
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_tracks_duplicates() {
        let records = vec![
            PrimaryRecord::sample("ABAA-01", "관계법령", 20),
            PrimaryRecord::sample("ABAA-01", "관계법령", 21),
            PrimaryRecord::sample("ABBA-01", "손보1부", 20),
        ];
        let snapshot = StoreSnapshot::from_records("master", StoreKind::List, Coverage::Full, &records);

        assert_eq!(snapshot.record_count, 3);
        assert_eq!(snapshot.records.len(), 2);
        assert_eq!(snapshot.duplicates, vec!["ABAA-01"]);
        assert_eq!(duplicate_qcodes(&records), vec!["ABAA-01"]);
    }

    #[test]
    fn test_remap_keeps_fields() {
        let records = vec![PrimaryRecord::sample("ABAA-01", "관계법령", 20)];
        let snapshot = StoreSnapshot::from_records("master", StoreKind::List, Coverage::Full, &records);
        let mapping =
            IdentifierMapping::from_pairs(vec![("ABAA-01".to_string(), "AB20AA-01".to_string())]).unwrap();

        let remapped = snapshot.remap(&mapping);
        assert_eq!(remapped.identifiers().into_iter().collect::<Vec<_>>(), vec!["AB20AA-01"]);
        assert_eq!(remapped.records["AB20AA-01"], snapshot.records["ABAA-01"]);
    }

    #[test]
    fn test_remap_carries_duplicates() {
        let records = vec![
            PrimaryRecord::sample("ABAA-01", "관계법령", 20),
            PrimaryRecord::sample("ABAA-01", "관계법령", 21),
            PrimaryRecord::sample("ABBA-01", "손보1부", 20),
        ];
        let snapshot = StoreSnapshot::from_records("master", StoreKind::List, Coverage::Full, &records);
        let mapping = IdentifierMapping::from_pairs(vec![
            ("ABAA-01".to_string(), "AB20AA-01".to_string()),
            ("ABBA-01".to_string(), "AB20BA-01".to_string()),
        ])
        .unwrap();

        let remapped = snapshot.remap(&mapping);
        assert_eq!(remapped.record_count, 3);
        assert_eq!(remapped.duplicates, vec!["AB20AA-01"]);
    }

    #[test]
    fn test_store_kind_parse() {
        assert_eq!("Slotted".parse::<StoreKind>().unwrap(), StoreKind::Slotted);
        assert!("csv".parse::<StoreKind>().is_err());
        assert!(StoreKind::Dict.holds_primary_records());
        assert!(!StoreKind::Tabular.holds_primary_records());
    }
}
