//! Identifier generation
//!
//! Builds a candidate identifier from a record's category values (and round,
//! for v2) and asks the [`UniquenessResolver`] for the sequence suffix. The
//! generator never registers what it returns; callers do that, so two
//! `generate` calls without a `register` in between yield the same identifier.

use crate::core::category::{CategoryCodeTable, CategoryValues, UnmappedCategory};
use crate::core::error::{QcodeError, Result};
use crate::core::record::PrimaryRecord;
use crate::core::resolver::{UniquenessResolver, UsedSet};
use crate::core::scheme::{compose, SchemeVersion, MAX_ROUND};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

/// An identifier plus the data-quality warnings raised while building it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedQcode {
    pub identifier: String,
    pub prefix: String,
    pub unmapped: Vec<UnmappedCategory>,
}

/// Derives identifiers under one scheme version
#[derive(Debug, Clone, Copy)]
pub struct IdentifierGenerator {
    version: SchemeVersion,
    table: CategoryCodeTable,
    resolver: UniquenessResolver,
}

impl IdentifierGenerator {
    pub fn new(version: SchemeVersion) -> Self {
        Self {
            version,
            table: CategoryCodeTable,
            resolver: UniquenessResolver,
        }
    }

    pub fn version(&self) -> SchemeVersion {
        self.version
    }

    /// Non-sequence part of the identifier
    ///
    /// v1 concatenates the four codes; v2 splices the round between the
    /// exam/class block and the subject/kind block (`AB` + `20` + `AA`).
    pub fn prefix(
        &self,
        values: &CategoryValues,
        round: Option<u32>,
    ) -> Result<(String, Vec<UnmappedCategory>)> {
        let (codes, unmapped) = self.table.lookup(values);

        let prefix = match self.version {
            SchemeVersion::V1 => format!("{}{}", codes.head(), codes.tail()),
            SchemeVersion::V2 => {
                let round = round.ok_or_else(|| QcodeError::MissingRound(self.version.to_string()))?;
                if round == 0 || round > MAX_ROUND {
                    return Err(QcodeError::InvalidRound(round.to_string()));
                }
                format!("{}{}{}", codes.head(), round, codes.tail())
            }
        };

        Ok((prefix, unmapped))
    }

    /// Generate the next free identifier for these categories
    pub fn generate(
        &self,
        values: &CategoryValues,
        round: Option<u32>,
        used: &UsedSet,
    ) -> Result<GeneratedQcode> {
        let (prefix, unmapped) = self.prefix(values, round)?;
        let sequence = self.resolver.next_suffix(&prefix, used)?;
        let identifier = compose(&prefix, sequence.value());
        debug!("Generated {} (scheme {})", identifier, self.version);

        Ok(GeneratedQcode {
            identifier,
            prefix,
            unmapped,
        })
    }

    /// Generate for a stored record, reading its categories and round
    pub fn generate_for(&self, record: &PrimaryRecord, used: &UsedSet) -> Result<GeneratedQcode> {
        self.generate(&record.category_values(), record.round(), used)
    }
}

/// Which records `assign_identifiers` touches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AssignMode {
    /// Only records with a blank or duplicated identifier
    MissingOnly,
    /// Every record gets a fresh identifier
    Renumber,
}

/// One position whose identifier was (re)issued
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub index: usize,
    pub old_qcode: String,
    pub new_qcode: String,
}

/// Result of a first-time or corrective assignment pass
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssignmentReport {
    pub scheme: Option<SchemeVersion>,
    pub total_records: usize,
    pub assignments: Vec<Assignment>,
    pub unmapped: Vec<UnmappedCategory>,
    /// Records per prefix after assignment
    pub prefix_distribution: BTreeMap<String, usize>,
}

/// Issue identifiers for a record list in order
///
/// Every identifier issued is registered in `used`, which the caller must
/// have seeded from all stores. In `MissingOnly` mode the first holder of a
/// duplicated identifier keeps it and later holders are reissued.
pub fn assign_identifiers(
    generator: &IdentifierGenerator,
    records: &mut [PrimaryRecord],
    mode: AssignMode,
    used: &mut UsedSet,
) -> Result<AssignmentReport> {
    let resolver = UniquenessResolver;
    let mut report = AssignmentReport {
        scheme: Some(generator.version()),
        total_records: records.len(),
        ..Default::default()
    };

    let mut seen: HashMap<String, usize> = HashMap::new();

    for (index, record) in records.iter_mut().enumerate() {
        let needs_new = match mode {
            AssignMode::Renumber => true,
            AssignMode::MissingOnly => {
                let blank = record.qcode.trim().is_empty();
                let duplicate = !blank && seen.contains_key(&record.qcode);
                blank || duplicate
            }
        };

        if needs_new {
            let generated = generator.generate_for(record, used)?;
            resolver.register(generated.identifier.clone(), used);
            report.unmapped.extend(generated.unmapped);
            report.assignments.push(Assignment {
                index,
                old_qcode: std::mem::replace(&mut record.qcode, generated.identifier.clone()),
                new_qcode: generated.identifier,
            });
        } else {
            resolver.register(record.qcode.clone(), used);
        }

        *seen.entry(record.qcode.clone()).or_default() += 1;
        let prefix = record.qcode.split('-').next().unwrap_or_default().to_string();
        *report.prefix_distribution.entry(prefix).or_default() += 1;
    }

    info!(
        "Assigned {} of {} identifiers ({:?}, scheme {})",
        report.assignments.len(),
        report.total_records,
        mode,
        generator.version()
    );

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broker_values() -> CategoryValues {
        CategoryValues::parse("보험중개사", "손해보험", "관계법령", "A")
    }

    #[test]
    fn test_v2_scenario() {
        let generator = IdentifierGenerator::new(SchemeVersion::V2);
        let mut used = UsedSet::new();

        let first = generator.generate(&broker_values(), Some(20), &used).unwrap();
        assert_eq!(first.identifier, "AB20AA-01");
        UniquenessResolver.register(first.identifier, &mut used);

        let second = generator.generate(&broker_values(), Some(20), &used).unwrap();
        assert_eq!(second.identifier, "AB20AA-02");
    }

    #[test]
    fn test_generate_without_register_repeats() {
        let generator = IdentifierGenerator::new(SchemeVersion::V1);
        let used = UsedSet::new();

        let a = generator.generate(&broker_values(), None, &used).unwrap();
        let b = generator.generate(&broker_values(), None, &used).unwrap();
        assert_eq!(a.identifier, "ABAA-01");
        assert_eq!(a, b);
    }

    #[test]
    fn test_v2_round_required_and_bounded() {
        let generator = IdentifierGenerator::new(SchemeVersion::V2);
        let used = UsedSet::new();

        assert!(matches!(
            generator.generate(&broker_values(), None, &used),
            Err(QcodeError::MissingRound(_))
        ));
        assert!(matches!(
            generator.generate(&broker_values(), Some(100), &used),
            Err(QcodeError::InvalidRound(_))
        ));
        assert!(matches!(
            generator.generate(&broker_values(), Some(0), &used),
            Err(QcodeError::InvalidRound(_))
        ));
    }

    #[test]
    fn test_unmapped_categories_are_warnings() {
        let generator = IdentifierGenerator::new(SchemeVersion::V1);
        let values = CategoryValues::parse("보험계리사", "손해보험", "관계법령", "A");

        let generated = generator.generate(&values, None, &UsedSet::new()).unwrap();
        assert_eq!(generated.identifier, "XBAA-01");
        assert_eq!(generated.unmapped.len(), 1);
    }

    #[test]
    fn test_assign_missing_only_fixes_duplicates() {
        let generator = IdentifierGenerator::new(SchemeVersion::V1);
        let mut records = vec![
            PrimaryRecord::sample("ABAA-01", "관계법령", 20),
            PrimaryRecord::sample("ABAA-01", "관계법령", 21),
            PrimaryRecord::sample("", "손보1부", 20),
        ];
        let mut used = UsedSet::seed_from(records.iter().map(|r| r.qcode.clone()).filter(|q| !q.is_empty()));

        let report = assign_identifiers(&generator, &mut records, AssignMode::MissingOnly, &mut used).unwrap();

        assert_eq!(report.assignments.len(), 2);
        assert_eq!(records[0].qcode, "ABAA-01");
        assert_eq!(records[1].qcode, "ABAA-02");
        assert_eq!(records[2].qcode, "ABBA-01");
        assert_eq!(report.prefix_distribution.get("ABAA"), Some(&2));
    }

    #[test]
    fn test_assign_renumber_v2() {
        let generator = IdentifierGenerator::new(SchemeVersion::V2);
        let mut records = vec![
            PrimaryRecord::sample("ABAA-01", "관계법령", 20),
            PrimaryRecord::sample("ABAA-01", "관계법령", 21),
            PrimaryRecord::sample("ABAA-02", "관계법령", 20),
        ];
        let mut used = UsedSet::new();

        let report = assign_identifiers(&generator, &mut records, AssignMode::Renumber, &mut used).unwrap();

        assert_eq!(report.assignments.len(), 3);
        let ids: Vec<_> = records.iter().map(|r| r.qcode.as_str()).collect();
        assert_eq!(ids, ["AB20AA-01", "AB21AA-01", "AB20AA-02"]);
    }
}
