use super::{read_json, write_json_atomic, Coverage, QuestionStore, StoreKind, StoreSnapshot};
use crate::core::error::{QcodeError, Result};
use crate::core::mapping::IdentifierMapping;
use crate::core::record::{fields, format_timestamp, normalize_round, normalize_value, PrimaryRecord};
use crate::core::slots::{derived_identifier, SlotAllocator, SlotCounters, SlotSet};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Parent question fields mirrored into the slotted store
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ParentMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_question: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_answer: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_round: Option<Value>,

    /// Parent's `LAYER2`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_layer: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ParentMetadata {
    /// Mirror the parent's fields; returns true if anything changed
    pub fn mirror(&mut self, parent: &PrimaryRecord) -> bool {
        let question = Some(parent.question.clone());
        let answer = parent.answer.clone();
        let round = parent.eround.clone();
        let layer = Some(parent.layer2.clone());

        let changed = self.master_question != question
            || self.master_answer != answer
            || self.master_round != round
            || self.master_layer != layer;

        self.master_question = question;
        self.master_answer = answer;
        self.master_round = round;
        self.master_layer = layer;
        changed
    }
}

/// Slots of one primary question
///
/// Slot counters are written on save and ignored on load.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "EntryDocument", into = "EntryDocument")]
pub struct SlottedEntry {
    pub source_qcode: String,
    pub slots: SlotSet,
    pub metadata: ParentMetadata,
    pub extra: Map<String, Value>,
}

impl SlottedEntry {
    /// Fresh entry with eight empty slots
    pub fn empty(parent: &PrimaryRecord, now: NaiveDateTime) -> Self {
        let mut metadata = ParentMetadata {
            last_updated: Some(format_timestamp(now)),
            ..Default::default()
        };
        metadata.mirror(parent);

        SlottedEntry {
            source_qcode: parent.qcode.clone(),
            slots: SlotAllocator.create_empty_slots(),
            metadata,
            extra: Map::new(),
        }
    }

    pub fn counters(&self) -> SlotCounters {
        self.slots.counters()
    }

    fn comparable_fields(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        let meta = &self.metadata;
        if let Some(layer) = &meta.master_layer {
            out.insert(fields::LAYER2.to_string(), layer.clone());
        }
        if meta.master_round.is_some() {
            out.insert(fields::EROUND.to_string(), normalize_round(meta.master_round.as_ref()));
        }
        if let Some(question) = &meta.master_question {
            out.insert(fields::QUESTION.to_string(), question.clone());
        }
        if meta.master_answer.is_some() {
            out.insert(fields::ANSWER.to_string(), normalize_value(meta.master_answer.as_ref()));
        }
        out
    }
}

#[derive(Serialize, Deserialize)]
struct EntryMetadataDocument {
    #[serde(default)]
    total_slots: usize,
    #[serde(default)]
    filled_slots: usize,
    #[serde(flatten)]
    parent: ParentMetadata,
}

#[derive(Serialize, Deserialize)]
struct EntryDocument {
    #[serde(default)]
    source_qcode: String,
    #[serde(default)]
    slots: SlotSet,
    #[serde(default = "empty_metadata_document")]
    metadata: EntryMetadataDocument,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

fn empty_metadata_document() -> EntryMetadataDocument {
    EntryMetadataDocument {
        total_slots: 0,
        filled_slots: 0,
        parent: ParentMetadata::default(),
    }
}

impl From<EntryDocument> for SlottedEntry {
    fn from(doc: EntryDocument) -> Self {
        SlottedEntry {
            source_qcode: doc.source_qcode,
            slots: doc.slots,
            metadata: doc.metadata.parent,
            extra: doc.extra,
        }
    }
}

impl From<SlottedEntry> for EntryDocument {
    fn from(entry: SlottedEntry) -> Self {
        let counters = entry.slots.counters();
        EntryDocument {
            source_qcode: entry.source_qcode,
            slots: entry.slots,
            metadata: EntryMetadataDocument {
                total_slots: counters.total_slots,
                filled_slots: counters.filled_slots,
                parent: entry.metadata,
            },
            extra: entry.extra,
        }
    }
}

#[derive(Deserialize)]
struct SlottedDocument {
    #[serde(default)]
    metadata: Map<String, Value>,
    #[serde(default)]
    questions: BTreeMap<String, SlottedEntry>,
}

/// Eight derived-question slots per primary identifier
#[derive(Debug)]
pub struct SlottedStore {
    name: String,
    path: PathBuf,
    coverage: Coverage,
    metadata: Map<String, Value>,
    entries: BTreeMap<String, SlottedEntry>,
}

impl SlottedStore {
    pub fn new(name: impl Into<String>, path: impl AsRef<Path>) -> Self {
        SlottedStore {
            name: name.into(),
            path: path.as_ref().to_path_buf(),
            coverage: Coverage::Full,
            metadata: Map::new(),
            entries: BTreeMap::new(),
        }
    }

    pub fn with_coverage(mut self, coverage: Coverage) -> Self {
        self.coverage = coverage;
        self
    }

    pub fn entries(&self) -> &BTreeMap<String, SlottedEntry> {
        &self.entries
    }

    pub fn entry(&self, parent: &str) -> Option<&SlottedEntry> {
        self.entries.get(parent)
    }

    /// Mutable entry, or `UnknownParent`
    pub fn entry_mut(&mut self, parent: &str) -> Result<&mut SlottedEntry> {
        self.entries
            .get_mut(parent)
            .ok_or_else(|| QcodeError::UnknownParent(parent.to_string()))
    }

    /// Add an empty entry for `parent`; false if one already exists
    pub fn insert_parent(&mut self, parent: &PrimaryRecord, now: NaiveDateTime) -> bool {
        if self.entries.contains_key(&parent.qcode) {
            return false;
        }
        self.entries
            .insert(parent.qcode.clone(), SlottedEntry::empty(parent, now));
        true
    }

    /// Store-wide filled/total counts
    pub fn totals(&self) -> SlotCounters {
        self.entries.values().fold(
            SlotCounters {
                total_slots: 0,
                filled_slots: 0,
            },
            |acc, entry| {
                let c = entry.counters();
                SlotCounters {
                    total_slots: acc.total_slots + c.total_slots,
                    filled_slots: acc.filled_slots + c.filled_slots,
                }
            },
        )
    }
}

impl QuestionStore for SlottedStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StoreKind {
        StoreKind::Slotted
    }

    fn coverage(&self) -> Coverage {
        self.coverage
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn load(&mut self) -> Result<()> {
        let doc: SlottedDocument = read_json(&self.path)?;
        self.metadata = doc.metadata;
        self.entries = doc.questions;
        debug!("Loaded {} parents from slotted store {}", self.entries.len(), self.name);
        Ok(())
    }

    fn save(&self) -> Result<()> {
        let totals = self.totals();
        let mut metadata = self.metadata.clone();
        metadata.insert("total_questions".to_string(), Value::from(self.entries.len()));
        metadata.insert("total_slots".to_string(), Value::from(totals.total_slots));
        metadata.insert("filled_slots".to_string(), Value::from(totals.filled_slots));

        #[derive(Serialize)]
        struct Borrowed<'a> {
            metadata: &'a Map<String, Value>,
            questions: &'a BTreeMap<String, SlottedEntry>,
        }

        write_json_atomic(
            &self.path,
            &Borrowed {
                metadata: &metadata,
                questions: &self.entries,
            },
        )?;
        debug!("Saved {} parents to slotted store {}", self.entries.len(), self.name);
        Ok(())
    }

    fn snapshot(&self) -> StoreSnapshot {
        let mut snapshot = StoreSnapshot::new(&self.name, StoreKind::Slotted, self.coverage);
        for (parent, entry) in &self.entries {
            snapshot.insert(parent.clone(), entry.comparable_fields());
        }
        snapshot
    }

    fn identifiers(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    fn derived_identifiers(&self) -> Vec<String> {
        self.entries
            .iter()
            .flat_map(|(parent, entry)| {
                entry
                    .slots
                    .filled_tags()
                    .into_iter()
                    .map(move |tag| derived_identifier(parent, tag))
            })
            .collect()
    }

    /// Rekey parents and rewrite `source_qcode` and slot `original_qcode`
    fn apply_mapping(&mut self, mapping: &IdentifierMapping, now: NaiveDateTime) -> Result<usize> {
        let mut targets = BTreeSet::new();
        for parent in self.entries.keys() {
            let target = mapping.apply(parent);
            if !targets.insert(target) {
                return Err(QcodeError::DuplicateIdentifiers {
                    store: self.name.clone(),
                    identifiers: vec![target.to_string()],
                });
            }
        }

        let stamp = format_timestamp(now);
        let mut rekeyed = BTreeMap::new();
        let mut changed = 0;

        for (parent, mut entry) in std::mem::take(&mut self.entries) {
            let new_parent = mapping.apply(&parent).to_string();
            let mut touched = new_parent != parent;

            if entry.source_qcode.is_empty() {
                entry.source_qcode = new_parent.clone();
            } else {
                let source = mapping.apply(&entry.source_qcode).to_string();
                touched |= source != entry.source_qcode;
                entry.source_qcode = source;
            }

            for (_, slot) in entry.slots.iter_mut() {
                if let Some(original) = &slot.original_qcode {
                    if let Some(rewritten) = mapping.apply_derived(original) {
                        if &rewritten != original {
                            slot.original_qcode = Some(rewritten);
                            touched = true;
                        }
                    }
                }
            }

            if touched {
                entry.metadata.last_updated = Some(stamp.clone());
                changed += 1;
            }
            rekeyed.insert(new_parent, entry);
        }

        self.entries = rekeyed;
        Ok(changed)
    }

    fn as_slotted(&self) -> Option<&SlottedStore> {
        Some(self)
    }

    fn as_slotted_mut(&mut self) -> Option<&mut SlottedStore> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::slots::SlotTag;
    use serde_json::json;
    use tempfile::TempDir;

    fn now() -> NaiveDateTime {
        chrono::NaiveDate::from_ymd_opt(2025, 1, 17)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap()
    }

    fn write_fixture(path: &Path) {
        std::fs::write(
            path,
            serde_json::to_vec(&json!({
                "metadata": {"description": "derived questions"},
                "questions": {
                    "ABAA-01": {
                        "source_qcode": "ABAA-01",
                        "slots": {
                            "B1": {"question": "q", "answer": "O", "exists": true, "original_qcode": "ABAA-01"},
                            "B2": {"question": "q2", "answer": "X", "exists": true, "original_qcode": "ABAA-01-B2"}
                        },
                        "metadata": {"total_slots": 3, "filled_slots": 7, "master_layer": "보험업법"}
                    }
                }
            }))
            .unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn test_stored_counters_are_ignored() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("slots.json");
        write_fixture(&path);

        let mut store = SlottedStore::new("slots", &path);
        store.load().unwrap();
        let entry = store.entry("ABAA-01").unwrap();
        assert_eq!(entry.counters(), SlotCounters { total_slots: 8, filled_slots: 2 });

        store.save().unwrap();
        let raw: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["questions"]["ABAA-01"]["metadata"]["total_slots"], json!(8));
        assert_eq!(raw["questions"]["ABAA-01"]["metadata"]["filled_slots"], json!(2));
        assert_eq!(raw["metadata"]["filled_slots"], json!(2));
    }

    #[test]
    fn test_apply_mapping_rewrites_parent_references() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("slots.json");
        write_fixture(&path);

        let mut store = SlottedStore::new("slots", &path);
        store.load().unwrap();
        let mapping =
            IdentifierMapping::from_pairs(vec![("ABAA-01".to_string(), "AB20AA-01".to_string())]).unwrap();

        assert_eq!(store.apply_mapping(&mapping, now()).unwrap(), 1);

        let entry = store.entry("AB20AA-01").unwrap();
        assert_eq!(entry.source_qcode, "AB20AA-01");
        assert_eq!(entry.slots.get(SlotTag::B1).original_qcode.as_deref(), Some("AB20AA-01"));
        assert_eq!(entry.slots.get(SlotTag::B2).original_qcode.as_deref(), Some("AB20AA-01-B2"));
        assert_eq!(
            store.derived_identifiers(),
            vec!["AB20AA-01-B1".to_string(), "AB20AA-01-B2".to_string()]
        );
        assert!(store.entry("ABAA-01").is_none());
    }

    #[test]
    fn test_snapshot_only_has_mirrored_fields() {
        let mut store = SlottedStore::new("slots", "unused.json");
        let parent = PrimaryRecord::sample("ABAA-01", "관계법령", 20);
        assert!(store.insert_parent(&parent, now()));
        assert!(!store.insert_parent(&parent, now()));

        let snapshot = store.snapshot();
        let fields: Vec<_> = snapshot.records["ABAA-01"].keys().cloned().collect();
        assert_eq!(fields, vec!["ANSWER", "EROUND", "LAYER2", "QUESTION"]);
        assert_eq!(snapshot.records["ABAA-01"]["EROUND"], "20");
    }

    #[test]
    fn test_unknown_parent() {
        let mut store = SlottedStore::new("slots", "unused.json");
        assert!(matches!(
            store.entry_mut("ABAA-09"),
            Err(QcodeError::UnknownParent(_))
        ));
    }
}
