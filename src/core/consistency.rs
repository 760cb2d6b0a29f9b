//! Read-side consistency checks
//!
//! Nothing in here mutates a store. Every check works on [`StoreSnapshot`]s
//! (or, for slot audits, on a borrowed [`SlottedStore`]).

use crate::core::scheme::{parse_qcode, FormatScheme, SchemeVersion};
use crate::core::slots::{SlotTag, SlotViolation};
use crate::core::store::{Coverage, QuestionStore, SlottedStore, StoreSet, StoreSnapshot};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Whether `identifier` matches the fixed pattern of `scheme`
pub fn validate_format(identifier: &str, scheme: FormatScheme) -> bool {
    scheme.matches(identifier)
}

/// Pattern match plus no sentinel category code
pub fn is_compliant(identifier: &str, scheme: FormatScheme) -> bool {
    scheme.matches(identifier)
        && parse_qcode(identifier)
            .map(|parsed| parsed.is_fully_mapped())
            .unwrap_or(false)
}

/// One field that differs between two stores for the same identifier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMismatch {
    pub field: String,
    pub left: String,
    pub right: String,
}

/// Differences between two store snapshots, joined on identifier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreDiff {
    pub left: String,
    pub right: String,

    /// Coverage the right-hand store is expected to have
    pub right_coverage: Coverage,

    /// In `right` but not in `left`
    pub missing_in_left: Vec<String>,

    /// In `left` but not in `right`
    pub missing_in_right: Vec<String>,

    pub left_count: usize,
    pub right_count: usize,
    pub count_mismatch: bool,

    pub value_mismatches: BTreeMap<String, Vec<FieldMismatch>>,
}

impl StoreDiff {
    /// All signals clear
    pub fn is_empty(&self) -> bool {
        self.missing_in_left.is_empty()
            && self.missing_in_right.is_empty()
            && !self.count_mismatch
            && self.value_mismatches.is_empty()
    }

    /// Clear under the right-hand store's coverage
    ///
    /// A subset store may lack primary identifiers, but it may not hold
    /// identifiers the left store lacks, nor disagree on values.
    pub fn is_synchronized(&self) -> bool {
        match self.right_coverage {
            Coverage::Full => self.is_empty(),
            Coverage::Subset => self.missing_in_left.is_empty() && self.value_mismatches.is_empty(),
        }
    }

    /// Whether the key sets line up (values aside)
    pub fn is_aligned(&self) -> bool {
        match self.right_coverage {
            Coverage::Full => self.missing_in_left.is_empty() && self.missing_in_right.is_empty(),
            Coverage::Subset => self.missing_in_left.is_empty(),
        }
    }

    pub fn mismatch_count(&self) -> usize {
        self.value_mismatches.values().map(Vec::len).sum()
    }

    /// This diff minus value mismatches already present in `baseline`
    pub fn excluding(&self, baseline: &StoreDiff) -> StoreDiff {
        let mut out = self.clone();
        out.value_mismatches = self
            .value_mismatches
            .iter()
            .filter_map(|(id, mismatches)| {
                let known = baseline.value_mismatches.get(id);
                let fresh: Vec<FieldMismatch> = mismatches
                    .iter()
                    .filter(|m| !known.map(|k| k.contains(m)).unwrap_or(false))
                    .cloned()
                    .collect();
                (!fresh.is_empty()).then(|| (id.clone(), fresh))
            })
            .collect();
        out
    }
}

impl fmt::Display for StoreDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} vs {}: {} missing in {}, {} missing in {}, counts {}/{}, {} field mismatches",
            self.left,
            self.right,
            self.missing_in_left.len(),
            self.left,
            self.missing_in_right.len(),
            self.right,
            self.left_count,
            self.right_count,
            self.mismatch_count()
        )
    }
}

/// Diff two snapshots
///
/// Only fields present on both sides are compared, so a slotted store's
/// mirrored parent fields are checked against the primary without flagging
/// the columns it does not carry.
pub fn diff(left: &StoreSnapshot, right: &StoreSnapshot) -> StoreDiff {
    let missing_in_left = right
        .records
        .keys()
        .filter(|id| !left.records.contains_key(*id))
        .cloned()
        .collect();
    let missing_in_right = left
        .records
        .keys()
        .filter(|id| !right.records.contains_key(*id))
        .cloned()
        .collect();

    let mut value_mismatches = BTreeMap::new();
    for (id, left_fields) in &left.records {
        let Some(right_fields) = right.records.get(id) else {
            continue;
        };
        let mismatches: Vec<FieldMismatch> = left_fields
            .iter()
            .filter_map(|(field, left_value)| {
                let right_value = right_fields.get(field)?;
                (left_value != right_value).then(|| FieldMismatch {
                    field: field.clone(),
                    left: left_value.clone(),
                    right: right_value.clone(),
                })
            })
            .collect();
        if !mismatches.is_empty() {
            value_mismatches.insert(id.clone(), mismatches);
        }
    }

    StoreDiff {
        left: left.name.clone(),
        right: right.name.clone(),
        right_coverage: right.coverage,
        missing_in_left,
        missing_in_right,
        left_count: left.record_count,
        right_count: right.record_count,
        count_mismatch: left.record_count != right.record_count,
        value_mismatches,
    }
}

/// Diff every secondary snapshot against the primary one
pub fn alignment(primary: &StoreSnapshot, secondaries: &[StoreSnapshot]) -> Vec<StoreDiff> {
    secondaries.iter().map(|s| diff(primary, s)).collect()
}

/// Identifier population of one store measured against a scheme
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceReport {
    pub store: String,
    pub scheme: SchemeVersion,
    pub total: usize,
    pub primary_count: usize,
    pub slot_count: usize,

    /// Identifiers matching neither the primary nor the slot pattern
    pub invalid: Vec<String>,

    /// Well-formed identifiers carrying the `X` sentinel
    pub non_compliant: Vec<String>,

    pub round_distribution: BTreeMap<u32, usize>,
    pub prefix_distribution: BTreeMap<String, usize>,
}

impl ComplianceReport {
    pub fn is_compliant(&self) -> bool {
        self.invalid.is_empty() && self.non_compliant.is_empty()
    }
}

/// Check a set of identifiers against `scheme`
pub fn compliance<'a, I>(store: &str, identifiers: I, scheme: SchemeVersion) -> ComplianceReport
where
    I: IntoIterator<Item = &'a str>,
{
    let mut report = ComplianceReport {
        store: store.to_string(),
        scheme,
        total: 0,
        primary_count: 0,
        slot_count: 0,
        invalid: Vec::new(),
        non_compliant: Vec::new(),
        round_distribution: BTreeMap::new(),
        prefix_distribution: BTreeMap::new(),
    };

    for id in identifiers {
        report.total += 1;
        let is_primary = scheme.primary().matches(id);
        let is_slot = !is_primary && scheme.slot().matches(id);
        if !is_primary && !is_slot {
            report.invalid.push(id.to_string());
            continue;
        }

        if is_primary {
            report.primary_count += 1;
        } else {
            report.slot_count += 1;
        }

        // Both patterns guarantee a parse.
        if let Some(parsed) = parse_qcode(id) {
            if !parsed.is_fully_mapped() {
                report.non_compliant.push(id.to_string());
            }
            if is_primary {
                *report.prefix_distribution.entry(parsed.prefix.clone()).or_default() += 1;
                if let Some(round) = parsed.round {
                    *report.round_distribution.entry(round).or_default() += 1;
                }
            }
        }
    }

    report
}

/// Duplicate analysis of one store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateReport {
    pub store: String,
    pub record_count: usize,
    pub unique_count: usize,
    pub duplicates: Vec<String>,
}

pub fn duplicates(snapshot: &StoreSnapshot) -> DuplicateReport {
    DuplicateReport {
        store: snapshot.name.clone(),
        record_count: snapshot.record_count,
        unique_count: snapshot.records.len(),
        duplicates: snapshot.duplicates.clone(),
    }
}

/// A slot breaking the exists/text invariant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotIssue {
    pub parent: String,
    pub tag: SlotTag,
    pub violation: SlotViolation,
}

/// Slot-level health of a slotted store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotAudit {
    pub store: String,
    pub parents: usize,
    pub total_slots: usize,
    pub filled_slots: usize,
    pub issues: Vec<SlotIssue>,
}

impl SlotAudit {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

pub fn audit_slots(store: &SlottedStore) -> SlotAudit {
    let totals = store.totals();
    let issues = store
        .entries()
        .iter()
        .flat_map(|(parent, entry)| {
            entry
                .slots
                .violations()
                .into_iter()
                .map(move |(tag, violation)| SlotIssue {
                    parent: parent.clone(),
                    tag,
                    violation,
                })
        })
        .collect();

    SlotAudit {
        store: store.name().to_string(),
        parents: store.entries().len(),
        total_slots: totals.total_slots,
        filled_slots: totals.filled_slots,
        issues,
    }
}

/// Everything `check` looks at, for one store set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckReport {
    pub scheme: SchemeVersion,
    pub compliance: Vec<ComplianceReport>,
    pub duplicates: Vec<DuplicateReport>,
    pub alignment: Vec<StoreDiff>,
    pub slot_audit: Option<SlotAudit>,
}

impl CheckReport {
    pub fn is_healthy(&self) -> bool {
        self.compliance.iter().all(ComplianceReport::is_compliant)
            && self.duplicates.iter().all(|d| d.duplicates.is_empty())
            && self.alignment.iter().all(StoreDiff::is_synchronized)
            && self.slot_audit.as_ref().map(SlotAudit::is_clean).unwrap_or(true)
    }
}

impl fmt::Display for CheckReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Scheme {}", self.scheme)?;
        for c in &self.compliance {
            writeln!(
                f,
                "  {}: {} ids ({} primary, {} slot), {} invalid, {} non-compliant",
                c.store,
                c.total,
                c.primary_count,
                c.slot_count,
                c.invalid.len(),
                c.non_compliant.len()
            )?;
        }
        for d in self.duplicates.iter().filter(|d| !d.duplicates.is_empty()) {
            writeln!(f, "  {}: duplicate ids {:?}", d.store, d.duplicates)?;
        }
        for a in &self.alignment {
            let status = if a.is_synchronized() { "ok" } else { "OUT OF SYNC" };
            writeln!(f, "  {} [{}]", a, status)?;
        }
        if let Some(audit) = &self.slot_audit {
            writeln!(
                f,
                "  {}: {}/{} slots filled, {} issues",
                audit.store,
                audit.filled_slots,
                audit.total_slots,
                audit.issues.len()
            )?;
        }
        write!(f, "Healthy: {}", self.is_healthy())
    }
}

/// Run every read-side check over a store set
pub fn check(stores: &StoreSet, scheme: SchemeVersion) -> CheckReport {
    let snapshots = stores.snapshots();

    let compliance = stores
        .iter()
        .map(|store| {
            let mut ids = store.identifiers();
            ids.extend(store.derived_identifiers());
            compliance(store.name(), ids.iter().map(String::as_str), scheme)
        })
        .collect();

    let alignment = match snapshots.split_first() {
        Some((primary, secondaries)) => alignment(primary, secondaries),
        None => Vec::new(),
    };

    CheckReport {
        scheme,
        compliance,
        duplicates: snapshots.iter().map(duplicates).collect(),
        alignment,
        slot_audit: stores.slotted().map(audit_slots),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::record::PrimaryRecord;
    use crate::core::store::StoreKind;

    fn snapshot(name: &str, coverage: Coverage, records: &[PrimaryRecord]) -> StoreSnapshot {
        StoreSnapshot::from_records(name, StoreKind::List, coverage, records)
    }

    fn corpus() -> Vec<PrimaryRecord> {
        vec![
            PrimaryRecord::sample("ABAA-01", "관계법령", 20),
            PrimaryRecord::sample("ABAA-02", "관계법령", 21),
            PrimaryRecord::sample("ABBA-01", "손보1부", 20),
        ]
    }

    #[test]
    fn test_validate_format_slot_scenario() {
        let slot = SchemeVersion::V2.slot();
        assert!(validate_format("AB20AA-01-B1", slot));
        assert!(!validate_format("AB20AA-01-B9", slot));
        assert!(is_compliant("AB20AA-01", SchemeVersion::V2.primary()));
        assert!(!is_compliant("XB20AA-01", SchemeVersion::V2.primary()));
    }

    #[test]
    fn test_diff_with_itself_is_empty() {
        let a = snapshot("master", Coverage::Full, &corpus());
        let d = diff(&a, &a);
        assert!(d.is_empty());
        assert!(d.is_synchronized());
    }

    #[test]
    fn test_diff_reports_all_three_signals() {
        let left = corpus();
        let mut right = corpus();
        right.remove(2);
        right[0].layer2 = "상법".to_string();
        right.push(PrimaryRecord::sample("ABCA-01", "손보2부", 20));
        right.push(PrimaryRecord::sample("ABCA-02", "손보2부", 20));

        let d = diff(
            &snapshot("master", Coverage::Full, &left),
            &snapshot("questions", Coverage::Full, &right),
        );

        assert_eq!(d.missing_in_left, vec!["ABCA-01", "ABCA-02"]);
        assert_eq!(d.missing_in_right, vec!["ABBA-01"]);
        assert!(d.count_mismatch);
        assert_eq!(
            d.value_mismatches["ABAA-01"],
            vec![FieldMismatch {
                field: "LAYER2".to_string(),
                left: "보험업법".to_string(),
                right: "상법".to_string(),
            }]
        );
        assert!(!d.is_synchronized());
    }

    #[test]
    fn test_subset_coverage() {
        let left = corpus();
        let subset = snapshot("slots", Coverage::Subset, &left[..1]);
        let d = diff(&snapshot("master", Coverage::Full, &left), &subset);
        assert!(!d.is_empty());
        assert!(d.is_synchronized());

        let orphan = snapshot(
            "slots",
            Coverage::Subset,
            &[PrimaryRecord::sample("ZZAA-01", "관계법령", 20)],
        );
        assert!(!diff(&snapshot("master", Coverage::Full, &left), &orphan).is_synchronized());
    }

    #[test]
    fn test_excluding_baseline() {
        let left = corpus();
        let mut right = corpus();
        right[1].layer2 = "상법".to_string();
        let baseline = diff(
            &snapshot("master", Coverage::Full, &left),
            &snapshot("questions", Coverage::Full, &right),
        );
        assert_eq!(baseline.mismatch_count(), 1);
        assert!(baseline.excluding(&baseline).is_empty());
    }

    #[test]
    fn test_compliance_report() {
        let ids = ["AB20AA-01", "AB20AA-02", "AB21AA-01", "XB20AA-01", "AB20AA-01-B1", "ABAA-01", ""];
        let report = compliance("master", ids, SchemeVersion::V2);

        assert_eq!(report.total, 7);
        assert_eq!(report.primary_count, 4);
        assert_eq!(report.slot_count, 1);
        assert_eq!(report.invalid, vec!["ABAA-01", ""]);
        assert_eq!(report.non_compliant, vec!["XB20AA-01"]);
        assert_eq!(report.round_distribution.get(&20), Some(&3));
        assert_eq!(report.prefix_distribution.get("AB20AA"), Some(&2));
        assert!(!report.is_compliant());
    }
}
