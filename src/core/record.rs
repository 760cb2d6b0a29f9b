//! Primary question records
//!
//! Field names follow the master spreadsheet columns. The engine only ever
//! rewrites `QCODE` and the timestamp fields; `QUESTION` text is carried
//! through byte-for-byte.

use crate::core::category::CategoryValues;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Column names shared by every store view
pub mod fields {
    pub const QCODE: &str = "QCODE";
    pub const ETITLE: &str = "ETITLE";
    pub const ECLASS: &str = "ECLASS";
    pub const LAYER1: &str = "LAYER1";
    pub const LAYER2: &str = "LAYER2";
    pub const QTYPE: &str = "QTYPE";
    pub const EROUND: &str = "EROUND";
    pub const QNUM: &str = "QNUM";
    pub const QUESTION: &str = "QUESTION";
    pub const ANSWER: &str = "ANSWER";
    pub const DIFFICULTY: &str = "DIFFICULTY";
    pub const CREATED_DATE: &str = "CREATED_DATE";
    pub const MODIFIED_DATE: &str = "MODIFIED_DATE";

    /// Columns that never take part in value comparisons
    pub const UNCOMPARED: [&str; 3] = [QCODE, CREATED_DATE, MODIFIED_DATE];
}

/// One exam question
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PrimaryRecord {
    #[serde(rename = "QCODE", default)]
    pub qcode: String,

    /// Exam type
    #[serde(rename = "ETITLE", default)]
    pub etitle: String,

    /// Exam class
    #[serde(rename = "ECLASS", default)]
    pub eclass: String,

    /// Top-level subject
    #[serde(rename = "LAYER1", default)]
    pub layer1: String,

    /// Subject subdivision
    #[serde(rename = "LAYER2", default)]
    pub layer2: String,

    /// Question kind
    #[serde(rename = "QTYPE", default)]
    pub qtype: String,

    /// Exam round, as stored (`20`, `"20"` or `"20.0"`)
    #[serde(rename = "EROUND", default, skip_serializing_if = "Option::is_none")]
    pub eround: Option<Value>,

    /// Question number within the round
    #[serde(rename = "QNUM", default, skip_serializing_if = "Option::is_none")]
    pub qnum: Option<Value>,

    #[serde(rename = "QUESTION", default)]
    pub question: String,

    #[serde(rename = "ANSWER", default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<Value>,

    #[serde(rename = "DIFFICULTY", default, skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<Value>,

    #[serde(rename = "CREATED_DATE", default, skip_serializing_if = "Option::is_none")]
    pub created_date: Option<String>,

    #[serde(rename = "MODIFIED_DATE", default, skip_serializing_if = "Option::is_none")]
    pub modified_date: Option<String>,

    /// Columns the engine does not interpret
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PrimaryRecord {
    /// Parsed category values for identifier generation
    pub fn category_values(&self) -> CategoryValues {
        CategoryValues::parse(&self.etitle, &self.eclass, &self.layer1, &self.qtype)
    }

    /// Exam round as an integer, if the stored value is one
    pub fn round(&self) -> Option<u32> {
        self.eround.as_ref().and_then(parse_round)
    }

    /// Stamp the modification time
    pub fn touch(&mut self, now: NaiveDateTime) {
        self.modified_date = Some(format_timestamp(now));
    }

    /// Comparable field values (identifier and timestamps excluded)
    pub fn comparable_fields(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        out.insert(fields::ETITLE.to_string(), self.etitle.clone());
        out.insert(fields::ECLASS.to_string(), self.eclass.clone());
        out.insert(fields::LAYER1.to_string(), self.layer1.clone());
        out.insert(fields::LAYER2.to_string(), self.layer2.clone());
        out.insert(fields::QTYPE.to_string(), self.qtype.clone());
        out.insert(fields::EROUND.to_string(), normalize_round(self.eround.as_ref()));
        out.insert(fields::QNUM.to_string(), normalize_value(self.qnum.as_ref()));
        out.insert(fields::QUESTION.to_string(), self.question.clone());
        out.insert(fields::ANSWER.to_string(), normalize_value(self.answer.as_ref()));
        out.insert(fields::DIFFICULTY.to_string(), normalize_value(self.difficulty.as_ref()));
        out
    }

    #[cfg(test)]
    pub(crate) fn sample(qcode: &str, layer1: &str, round: u32) -> Self {
        PrimaryRecord {
            qcode: qcode.to_string(),
            etitle: "보험중개사".to_string(),
            eclass: "손해보험".to_string(),
            layer1: layer1.to_string(),
            layer2: "보험업법".to_string(),
            qtype: "A".to_string(),
            eround: Some(Value::String(round.to_string())),
            question: format!("{} 문제 ({}회)", layer1, round),
            answer: Some(Value::from(1)),
            ..Default::default()
        }
    }
}

/// ISO-8601 local timestamp with microseconds
pub fn format_timestamp(now: NaiveDateTime) -> String {
    now.format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

/// Parse a stored round value (`20`, `20.0`, `"20"`, `"20.0"`, `"20회"`)
pub fn parse_round(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0 && *f >= 0.0).map(|f| f as u64))
            .and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => {
            let s = s.trim().trim_end_matches('회');
            s.parse::<u32>().ok().or_else(|| {
                s.parse::<f64>()
                    .ok()
                    .filter(|f| f.fract() == 0.0 && *f >= 0.0)
                    .map(|f| f as u32)
            })
        }
        _ => None,
    }
}

/// Render a stored value as comparable text
///
/// Strings are returned untouched; integral floats lose their `.0` so that
/// spreadsheet-sourced numbers compare equal to their JSON counterparts.
pub fn normalize_value(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => match n.as_f64() {
            Some(f) if n.is_f64() && f.fract() == 0.0 => format!("{}", f as i64),
            _ => n.to_string(),
        },
        Some(other) => other.to_string(),
    }
}

/// Round value as comparable text, normalised when it parses
pub fn normalize_round(value: Option<&Value>) -> String {
    match value.and_then(parse_round) {
        Some(round) => round.to_string(),
        None => normalize_value(value),
    }
}
