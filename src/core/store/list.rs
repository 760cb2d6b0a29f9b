use super::{
    duplicate_qcodes, read_json, remap_records, write_json_atomic, Coverage, QuestionStore,
    StoreKind, StoreSnapshot,
};
use crate::core::error::Result;
use crate::core::mapping::IdentifierMapping;
use crate::core::record::{format_timestamp, PrimaryRecord};
use crate::core::scheme::SchemeVersion;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Default, Serialize, Deserialize)]
struct ListDocument {
    #[serde(default)]
    metadata: Map<String, Value>,
    #[serde(default)]
    questions: Vec<PrimaryRecord>,
}

/// Ordered question list; the identifier is a field, not a key
#[derive(Debug)]
pub struct ListStore {
    name: String,
    path: PathBuf,
    coverage: Coverage,
    metadata: Map<String, Value>,
    records: Vec<PrimaryRecord>,
}

impl ListStore {
    pub fn new(name: impl Into<String>, path: impl AsRef<Path>) -> Self {
        ListStore {
            name: name.into(),
            path: path.as_ref().to_path_buf(),
            coverage: Coverage::Full,
            metadata: Map::new(),
            records: Vec::new(),
        }
    }

    /// A store backed by `path` holding `records`, not yet saved
    pub fn from_records(
        name: impl Into<String>,
        path: impl AsRef<Path>,
        records: Vec<PrimaryRecord>,
    ) -> Self {
        let mut store = ListStore::new(name, path);
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

    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    pub fn duplicates(&self) -> Vec<String> {
        duplicate_qcodes(&self.records)
    }
}

impl QuestionStore for ListStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StoreKind {
        StoreKind::List
    }

    fn coverage(&self) -> Coverage {
        self.coverage
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn load(&mut self) -> Result<()> {
        let doc: ListDocument = read_json(&self.path)?;
        self.metadata = doc.metadata;
        self.records = doc.questions;
        debug!("Loaded {} records from list store {}", self.records.len(), self.name);
        Ok(())
    }

    fn save(&self) -> Result<()> {
        let mut metadata = self.metadata.clone();
        metadata.insert("total_questions".to_string(), Value::from(self.records.len()));

        #[derive(Serialize)]
        struct Borrowed<'a> {
            metadata: &'a Map<String, Value>,
            questions: &'a [PrimaryRecord],
        }

        write_json_atomic(
            &self.path,
            &Borrowed {
                metadata: &metadata,
                questions: &self.records,
            },
        )?;
        debug!("Saved {} records to list store {}", self.records.len(), self.name);
        Ok(())
    }

    fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot::from_records(&self.name, StoreKind::List, self.coverage, &self.records)
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
