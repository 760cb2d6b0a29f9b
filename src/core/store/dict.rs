use super::{
    duplicate_qcodes, read_json, remap_records, write_json_atomic, Coverage, QuestionStore,
    StoreKind, StoreSnapshot,
};
use crate::core::error::{QcodeError, Result};
use crate::core::mapping::IdentifierMapping;
use crate::core::record::{format_timestamp, PrimaryRecord};
use crate::core::scheme::SchemeVersion;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Default, Deserialize)]
struct DictDocument {
    #[serde(default)]
    metadata: Map<String, Value>,
    #[serde(default)]
    questions: BTreeMap<String, PrimaryRecord>,
}

/// Questions keyed by identifier
///
/// The `QCODE` field is authoritative. Keys are rebuilt from it on every
/// save, so a rewrite of the field is all a migration needs.
#[derive(Debug)]
pub struct DictStore {
    name: String,
    path: PathBuf,
    coverage: Coverage,
    metadata: Map<String, Value>,
    records: Vec<PrimaryRecord>,
}

impl DictStore {
    pub fn new(name: impl Into<String>, path: impl AsRef<Path>) -> Self {
        DictStore {
            name: name.into(),
            path: path.as_ref().to_path_buf(),
            coverage: Coverage::Full,
            metadata: Map::new(),
            records: Vec::new(),
        }
    }

    pub fn from_records(
        name: impl Into<String>,
        path: impl AsRef<Path>,
        records: Vec<PrimaryRecord>,
    ) -> Self {
        let mut store = DictStore::new(name, path);
        store.records = records;
        store
    }

    pub fn with_coverage(mut self, coverage: Coverage) -> Self {
        self.coverage = coverage;
        self
    }

    pub fn records(&self) -> &[PrimaryRecord] {
        &self.records
    }

    pub fn get(&self, qcode: &str) -> Option<&PrimaryRecord> {
        self.records.iter().find(|r| r.qcode == qcode)
    }
}

impl QuestionStore for DictStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StoreKind {
        StoreKind::Dict
    }

    fn coverage(&self) -> Coverage {
        self.coverage
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn load(&mut self) -> Result<()> {
        let doc: DictDocument = read_json(&self.path)?;
        self.metadata = doc.metadata;
        self.records = doc
            .questions
            .into_iter()
            .map(|(key, mut record)| {
                if record.qcode.trim().is_empty() {
                    record.qcode = key;
                } else if record.qcode != key {
                    warn!(
                        "Dict store {}: key {} disagrees with QCODE {}",
                        self.name, key, record.qcode
                    );
                }
                record
            })
            .collect();
        debug!("Loaded {} records from dict store {}", self.records.len(), self.name);
        Ok(())
    }

    fn save(&self) -> Result<()> {
        let duplicates = duplicate_qcodes(&self.records);
        if !duplicates.is_empty() {
            return Err(QcodeError::DuplicateIdentifiers {
                store: self.name.clone(),
                identifiers: duplicates,
            });
        }

        let questions: BTreeMap<&str, &PrimaryRecord> =
            self.records.iter().map(|r| (r.qcode.as_str(), r)).collect();
        let mut metadata = self.metadata.clone();
        metadata.insert("total_questions".to_string(), Value::from(questions.len()));

        #[derive(Serialize)]
        struct Borrowed<'a> {
            metadata: &'a Map<String, Value>,
            questions: &'a BTreeMap<&'a str, &'a PrimaryRecord>,
        }

        write_json_atomic(
            &self.path,
            &Borrowed {
                metadata: &metadata,
                questions: &questions,
            },
        )?;
        debug!("Saved {} records to dict store {}", questions.len(), self.name);
        Ok(())
    }

    fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot::from_records(&self.name, StoreKind::Dict, self.coverage, &self.records)
    }

    fn identifiers(&self) -> Vec<String> {
        self.records.iter().map(|r| r.qcode.clone()).collect()
    }

    fn primary_records(&self) -> Option<&[PrimaryRecord]> {
        Some(&self.records)
    }

    fn primary_records_mut(&mut self) -> Option<&mut [PrimaryRecord]> {
        Some(&mut self.records)
    }

    fn apply_mapping(&mut self, mapping: &IdentifierMapping, now: NaiveDateTime) -> Result<usize> {
        Ok(remap_records(&mut self.records, mapping, now))
    }

    fn stamp_scheme(&mut self, scheme: SchemeVersion, now: NaiveDateTime) {
        self.metadata
            .insert("qcode_scheme".to_string(), Value::String(scheme.to_string()));
        self.metadata.insert(
            "qcode_update_date".to_string(),
            Value::String(format_timestamp(now)),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_keys_follow_qcode_field() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("questions.json");
        std::fs::write(
            &path,
            serde_json::to_vec(&json!({
                "questions": {
                    "ABAA-01": {"QCODE": "ABAA-01", "QUESTION": "q1"},
                    "ABAA-02": {"QUESTION": "q2"}
                }
            }))
            .unwrap(),
        )
        .unwrap();

        let mut store = DictStore::new("questions", &path);
        store.load().unwrap();
        assert_eq!(store.get("ABAA-02").map(|r| r.question.as_str()), Some("q2"));

        let mapping = IdentifierMapping::from_pairs(vec![
            ("ABAA-01".to_string(), "AB20AA-01".to_string()),
            ("ABAA-02".to_string(), "AB21AA-01".to_string()),
        ])
        .unwrap();
        let now = chrono::NaiveDate::from_ymd_opt(2025, 1, 17)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap();
        assert_eq!(store.apply_mapping(&mapping, now).unwrap(), 2);
        store.save().unwrap();

        let raw: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["questions"]["AB20AA-01"]["QCODE"], json!("AB20AA-01"));
        assert_eq!(raw["questions"]["AB21AA-01"]["QUESTION"], json!("q2"));
        assert!(raw["questions"].get("ABAA-01").is_none());
    }

    #[test]
    fn test_save_rejects_duplicate_identifiers() {
        let temp_dir = TempDir::new().unwrap();
        let store = DictStore::from_records(
            "questions",
            temp_dir.path().join("questions.json"),
            vec![
                PrimaryRecord::sample("ABAA-01", "관계법령", 20),
                PrimaryRecord::sample("ABAA-01", "관계법령", 21),
            ],
        );

        assert!(matches!(
            store.save(),
            Err(QcodeError::DuplicateIdentifiers { .. })
        ));
        assert!(!temp_dir.path().join("questions.json").exists());
    }
}
