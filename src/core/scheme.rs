//! Identifier schemes and format validation
//!
//! Two primary-identifier schemes coexist in the corpus:
//!
//! - **v1**: `ABAA-01` (four category codes, sequence)
//! - **v2**: `AB20AA-01` (exam + class codes, round, subject + kind codes, sequence)
//!
//! Derived (slot) identifiers append `-B1`..`-B8` to a primary identifier.

use crate::core::category::SENTINEL_CODE;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use crate::core::error::QcodeError;

/// Highest sequence number a prefix can hold (two digits)
pub const MAX_SEQUENCE: u8 = 99;

/// Highest round number that fits the v2 round token
pub const MAX_ROUND: u32 = 99;

/// Primary identifier scheme version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemeVersion {
    /// Four category characters, no round disambiguation
    V1,
    /// Round number embedded between the exam/class and subject/kind blocks
    V2,
}

impl SchemeVersion {
    /// Pattern for primary identifiers of this version
    const fn primary_pattern(self) -> &'static str {
        match self {
            SchemeVersion::V1 => r"^[A-Z]{4}-[0-9]{2}$",
            SchemeVersion::V2 => r"^[A-Z]{2}[0-9]{1,2}[A-Z]{2}-[0-9]{2}$",
        }
    }

    /// Pattern for derived slot identifiers under this version
    const fn slot_pattern(self) -> &'static str {
        match self {
            SchemeVersion::V1 => r"^[A-Z]{4}-[0-9]{2}-B[1-8]$",
            SchemeVersion::V2 => r"^[A-Z]{2}[0-9]{1,2}[A-Z]{2}-[0-9]{2}-B[1-8]$",
        }
    }

    fn primary_regex(self) -> &'static Regex {
        static V1: OnceLock<Regex> = OnceLock::new();
        static V2: OnceLock<Regex> = OnceLock::new();
        let cell = match self {
            SchemeVersion::V1 => &V1,
            SchemeVersion::V2 => &V2,
        };
        cell.get_or_init(|| Regex::new(self.primary_pattern()).expect("static primary pattern"))
    }

    fn slot_regex(self) -> &'static Regex {
        static V1: OnceLock<Regex> = OnceLock::new();
        static V2: OnceLock<Regex> = OnceLock::new();
        let cell = match self {
            SchemeVersion::V1 => &V1,
            SchemeVersion::V2 => &V2,
        };
        cell.get_or_init(|| Regex::new(self.slot_pattern()).expect("static slot pattern"))
    }

    /// Format scheme for derived identifiers under this version
    pub fn slot(self) -> FormatScheme {
        FormatScheme::Slot(self)
    }

    /// Format scheme for primary identifiers under this version
    pub fn primary(self) -> FormatScheme {
        FormatScheme::Primary(self)
    }
}

impl fmt::Display for SchemeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemeVersion::V1 => write!(f, "v1"),
            SchemeVersion::V2 => write!(f, "v2"),
        }
    }
}

impl FromStr for SchemeVersion {
    type Err = QcodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "v1" | "1" => Ok(SchemeVersion::V1),
            "v2" | "2" => Ok(SchemeVersion::V2),
            _ => Err(QcodeError::Config(format!(
                "Invalid scheme version '{}'. Valid options: v1, v2",
                s
            ))),
        }
    }
}

/// What a format check validates against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FormatScheme {
    Primary(SchemeVersion),
    Slot(SchemeVersion),
}

impl FormatScheme {
    /// Check an identifier against this scheme's fixed pattern
    pub fn matches(self, identifier: &str) -> bool {
        match self {
            FormatScheme::Primary(version) => version.primary_regex().is_match(identifier),
            FormatScheme::Slot(version) => version.slot_regex().is_match(identifier),
        }
    }
}

/// Components of an identifier parsed under either scheme
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedQcode {
    /// Everything before the sequence (`ABAA`, `AB20AA`)
    pub prefix: String,
    /// Embedded round (v2 only)
    pub round: Option<u32>,
    /// Two-digit sequence
    pub sequence: u8,
    /// Slot tag number for derived identifiers
    pub slot: Option<u8>,
    /// Version whose pattern matched
    pub version: SchemeVersion,
}

impl ParsedQcode {
    /// The primary identifier (slot suffix removed)
    pub fn primary(&self) -> String {
        compose(&self.prefix, self.sequence)
    }

    /// True when no category code is the sentinel
    pub fn is_fully_mapped(&self) -> bool {
        !self
            .prefix
            .chars()
            .filter(|c| c.is_ascii_alphabetic())
            .any(|c| c == SENTINEL_CODE)
    }
}

/// Compose `{prefix}-{sequence:02}`
pub fn compose(prefix: &str, sequence: u8) -> String {
    format!("{}-{:02}", prefix, sequence)
}

/// Parse a primary or slot identifier under whichever scheme it matches
pub fn parse_qcode(identifier: &str) -> Option<ParsedQcode> {
    let version = [SchemeVersion::V2, SchemeVersion::V1]
        .into_iter()
        .find(|v| v.primary().matches(identifier) || v.slot().matches(identifier))?;

    let mut parts = identifier.split('-');
    let prefix = parts.next()?.to_string();
    let sequence = parts.next()?.parse::<u8>().ok()?;
    let slot = match parts.next() {
        Some(tag) => Some(tag.strip_prefix('B')?.parse::<u8>().ok()?),
        None => None,
    };

    let round = match version {
        SchemeVersion::V1 => None,
        SchemeVersion::V2 => prefix
            .chars()
            .filter(|c| c.is_ascii_digit())
            .collect::<String>()
            .parse::<u32>()
            .ok(),
    };

    Some(ParsedQcode {
        prefix,
        round,
        sequence,
        slot,
        version,
    })
}
