//! Property-based tests for identifier generation and migration mappings
//!
//! Uses proptest to check uniqueness and format invariants across many
//! random corpora, including categories with no code.

use proptest::prelude::*;
use qcode_sync::core::consistency::diff;
use qcode_sync::core::generator::assign_identifiers;
use qcode_sync::core::scheme::{compose, parse_qcode};
use qcode_sync::core::store::{Coverage, StoreSnapshot};
use qcode_sync::{
    AssignMode, IdentifierGenerator, IdentifierMapping, MappingStrategy, PrimaryRecord,
    SchemeUpgrade, SchemeVersion, SequencePolicy, StoreKind, UniquenessResolver, UsedSet,
};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde_json::Value;
use std::collections::HashSet;

const EXAMS: [&str; 4] = ["보험중개사", "보험심사역", "손해사정사", "보험계리사"];
const CLASSES: [&str; 3] = ["생명보험", "손해보험", "제3보험"];
const SUBJECTS: [&str; 4] = ["관계법령", "손보1부", "손보2부", "회계"];
const KINDS: [&str; 2] = ["A", "진위형"];

fn record(spec: (usize, usize, usize, usize, u32)) -> PrimaryRecord {
    let (exam, class, subject, kind, round) = spec;
    PrimaryRecord {
        etitle: EXAMS[exam].to_string(),
        eclass: CLASSES[class].to_string(),
        layer1: SUBJECTS[subject].to_string(),
        qtype: KINDS[kind].to_string(),
        eround: Some(Value::from(round)),
        question: format!("{}-{}-{}-{}-{}", exam, class, subject, kind, round),
        ..Default::default()
    }
}

fn record_specs(max: usize) -> impl Strategy<Value = Vec<(usize, usize, usize, usize, u32)>> {
    prop::collection::vec((0usize..4, 0usize..3, 0usize..4, 0usize..2, 1u32..=30), 1..max)
}

proptest! {
    #[test]
    fn prop_assigned_identifiers_are_unique_and_well_formed(
        specs in record_specs(150),
        v2 in any::<bool>(),
    ) {
        let version = if v2 { SchemeVersion::V2 } else { SchemeVersion::V1 };
        let generator = IdentifierGenerator::new(version);
        let mut records: Vec<_> = specs.into_iter().map(record).collect();
        let mut used = UsedSet::new();

        // Small corpora over few prefixes can exceed 99 per prefix only in v1.
        let report = match assign_identifiers(&generator, &mut records, AssignMode::MissingOnly, &mut used) {
            Ok(report) => report,
            Err(_) => return Ok(()),
        };

        prop_assert_eq!(report.assignments.len(), records.len());
        let mut seen = HashSet::new();
        for r in &records {
            prop_assert!(version.primary().matches(&r.qcode), "{} is not {}", r.qcode, version);
            prop_assert!(seen.insert(r.qcode.clone()), "{} issued twice", r.qcode);
            prop_assert!(used.contains(&r.qcode));

            let parsed = parse_qcode(&r.qcode).unwrap();
            if version == SchemeVersion::V2 {
                prop_assert_eq!(parsed.round, r.round());
            }
        }
    }

    #[test]
    fn prop_upgrade_mapping_is_bijective(
        specs in record_specs(120),
        seed in any::<u64>(),
        renumber in any::<bool>(),
    ) {
        let mut records: Vec<_> = specs.into_iter().map(record).collect();
        let v1 = IdentifierGenerator::new(SchemeVersion::V1);
        if assign_identifiers(&v1, &mut records, AssignMode::MissingOnly, &mut UsedSet::new()).is_err() {
            return Ok(());
        }
        records.shuffle(&mut StdRng::seed_from_u64(seed));

        let policy = if renumber { SequencePolicy::Renumber } else { SequencePolicy::Preserve };
        let strategy = SchemeUpgrade::new(SchemeVersion::V2, policy);
        let proposed = match strategy.propose(&records, &mut UsedSet::new()) {
            Ok(proposed) => proposed,
            Err(_) => return Ok(()),
        };

        let mapping = IdentifierMapping::from_pairs(proposed.pairs).unwrap();
        prop_assert_eq!(mapping.len(), records.len());
        prop_assert_eq!(mapping.targets().len(), records.len());
        for r in &records {
            let new = mapping.get(&r.qcode).unwrap();
            prop_assert!(SchemeVersion::V2.primary().matches(new));
            prop_assert_eq!(parse_qcode(new).unwrap().round, r.round());
        }
    }

    #[test]
    fn prop_next_suffix_is_smallest_free(taken in prop::collection::btree_set(1u8..=99, 0..99)) {
        let used = UsedSet::seed_from(taken.iter().map(|s| compose("AB20AA", *s)));
        let expected = (1u8..=99).find(|s| !taken.contains(s));

        match UniquenessResolver.next_suffix("AB20AA", &used) {
            Ok(seq) => prop_assert_eq!(Some(seq.value()), expected),
            Err(_) => prop_assert_eq!(expected, None),
        }
    }

    #[test]
    fn prop_store_has_no_diff_with_itself(specs in record_specs(80), identify in any::<bool>()) {
        let mut records: Vec<_> = specs.into_iter().map(record).collect();
        if identify {
            let v2 = IdentifierGenerator::new(SchemeVersion::V2);
            assign_identifiers(&v2, &mut records, AssignMode::MissingOnly, &mut UsedSet::new()).unwrap();
        }

        let snapshot = StoreSnapshot::from_records("master", StoreKind::List, Coverage::Full, &records);
        let same = diff(&snapshot, &snapshot);
        prop_assert!(same.is_empty(), "{:?}", same);
    }
}
