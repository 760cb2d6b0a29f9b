use super::{read_json, write_json_atomic, Coverage, QuestionStore, StoreKind, StoreSnapshot};
use crate::core::error::{QcodeError, Result};
use crate::core::mapping::IdentifierMapping;
use crate::core::record::{fields, normalize_round, normalize_value};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Default, Serialize, Deserialize)]
struct SheetDocument {
    #[serde(default)]
    sheet: String,
    #[serde(default)]
    columns: Vec<String>,
    #[serde(default)]
    rows: Vec<Map<String, Value>>,
}

/// Sheet-shaped export with a `QCODE` column
#[derive(Debug)]
pub struct TabularStore {
    name: String,
    path: PathBuf,
    coverage: Coverage,
    doc: SheetDocument,
}

impl TabularStore {
    pub fn new(name: impl Into<String>, path: impl AsRef<Path>) -> Self {
        TabularStore {
            name: name.into(),
            path: path.as_ref().to_path_buf(),
            coverage: Coverage::Full,
            doc: SheetDocument::default(),
        }
    }

    pub fn with_coverage(mut self, coverage: Coverage) -> Self {
        self.coverage = coverage;
        self
    }

    pub fn sheet(&self) -> &str {
        &self.doc.sheet
    }

    pub fn columns(&self) -> &[String] {
        &self.doc.columns
    }

    pub fn rows(&self) -> &[Map<String, Value>] {
        &self.doc.rows
    }

    fn row_qcode(row: &Map<String, Value>) -> String {
        row.get(fields::QCODE)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }

    fn row_fields(row: &Map<String, Value>) -> BTreeMap<String, String> {
        row.iter()
            .filter(|(column, _)| !fields::UNCOMPARED.contains(&column.as_str()))
            .map(|(column, value)| {
                let text = if column == fields::EROUND {
                    normalize_round(Some(value))
                } else {
                    normalize_value(Some(value))
                };
                (column.clone(), text)
            })
            .collect()
    }
}

impl QuestionStore for TabularStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StoreKind {
        StoreKind::Tabular
    }

    fn coverage(&self) -> Coverage {
        self.coverage
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn load(&mut self) -> Result<()> {
        let doc: SheetDocument = read_json(&self.path)?;
        if !doc.columns.iter().any(|c| c == fields::QCODE) {
            return Err(QcodeError::UnsupportedStore {
                store: self.name.clone(),
                reason: format!("sheet '{}' has no {} column", doc.sheet, fields::QCODE),
            });
        }
        self.doc = doc;
        debug!("Loaded {} rows from tabular store {}", self.doc.rows.len(), self.name);
        Ok(())
    }

    fn save(&self) -> Result<()> {
        write_json_atomic(&self.path, &self.doc)?;
        debug!("Saved {} rows to tabular store {}", self.doc.rows.len(), self.name);
        Ok(())
    }

    fn snapshot(&self) -> StoreSnapshot {
        let mut snapshot = StoreSnapshot::new(&self.name, StoreKind::Tabular, self.coverage);
        for row in &self.doc.rows {
            snapshot.insert(Self::row_qcode(row), Self::row_fields(row));
        }
        snapshot
    }

    fn identifiers(&self) -> Vec<String> {
        self.doc.rows.iter().map(Self::row_qcode).collect()
    }

    fn apply_mapping(&mut self, mapping: &IdentifierMapping, _now: NaiveDateTime) -> Result<usize> {
        let mut changed = 0;
        for row in &mut self.doc.rows {
            let old = Self::row_qcode(row);
            if let Some(new) = mapping.get(&old) {
                if new != old {
                    row.insert(fields::QCODE.to_string(), Value::String(new.to_string()));
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }
}
