//! Frozen old → new identifier mapping
//!
//! Built once per migration and then applied, unchanged, to every store.
//! Construction rejects anything that is not a bijection over its domain.

use crate::core::error::{QcodeError, Result};
use crate::core::scheme::parse_qcode;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Old identifier → new identifier
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifierMapping {
    entries: BTreeMap<String, String>,
}

impl IdentifierMapping {
    /// Build a mapping, refusing duplicate sources and colliding targets
    ///
    /// # Errors
    ///
    /// - `DuplicateIdentifiers` if the same old identifier appears twice
    /// - `NonBijectiveMapping` if two old identifiers share a new one
    pub fn from_pairs<I>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut entries = BTreeMap::new();
        let mut duplicates = BTreeSet::new();
        let mut by_target: BTreeMap<String, Vec<String>> = BTreeMap::new();

        for (old, new) in pairs {
            if entries.contains_key(&old) {
                duplicates.insert(old);
                continue;
            }
            by_target.entry(new.clone()).or_default().push(old.clone());
            entries.insert(old, new);
        }

        if !duplicates.is_empty() {
            return Err(QcodeError::DuplicateIdentifiers {
                store: "mapping".to_string(),
                identifiers: duplicates.into_iter().collect(),
            });
        }

        if let Some((target, sources)) = by_target.into_iter().find(|(_, s)| s.len() > 1) {
            return Err(QcodeError::NonBijectiveMapping { target, sources });
        }

        Ok(IdentifierMapping { entries })
    }

    /// New identifier for `old`, if it is in the domain
    pub fn get(&self, old: &str) -> Option<&str> {
        self.entries.get(old).map(String::as_str)
    }

    /// Map an identifier, leaving unknown ones untouched
    pub fn apply<'a>(&'a self, identifier: &'a str) -> &'a str {
        self.get(identifier).unwrap_or(identifier)
    }

    /// Map a derived identifier by rewriting its parent part
    ///
    /// Handles both a bare primary identifier and `{primary}-B#`.
    pub fn apply_derived(&self, identifier: &str) -> Option<String> {
        if let Some(new) = self.get(identifier) {
            return Some(new.to_string());
        }
        let parsed = parse_qcode(identifier)?;
        let tag = parsed.slot?;
        self.get(&parsed.primary())
            .map(|parent| format!("{}-B{}", parent, tag))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries whose identifier actually changes
    pub fn changed(&self) -> usize {
        self.entries.iter().filter(|(k, v)| k != v).count()
    }

    pub fn targets(&self) -> BTreeSet<&str> {
        self.entries.values().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(raw: &[(&str, &str)]) -> Vec<(String, String)> {
        raw.iter().map(|(a, b)| (a.to_string(), b.to_string())).collect()
    }

    #[test]
    fn test_bijective_mapping() {
        let mapping = IdentifierMapping::from_pairs(pairs(&[
            ("ABAA-01", "AB20AA-01"),
            ("ABAA-02", "AB21AA-01"),
            ("AB22AA-01", "AB22AA-01"),
        ]))
        .unwrap();

        assert_eq!(mapping.len(), 3);
        assert_eq!(mapping.changed(), 2);
        assert_eq!(mapping.apply("ABAA-02"), "AB21AA-01");
        assert_eq!(mapping.apply("ZZZZ-01"), "ZZZZ-01");
    }

    #[test]
    fn test_colliding_targets_rejected() {
        let err = IdentifierMapping::from_pairs(pairs(&[
            ("ABAA-01", "AB20AA-01"),
            ("ABAA-02", "AB20AA-01"),
        ]))
        .unwrap_err();

        match err {
            QcodeError::NonBijectiveMapping { target, sources } => {
                assert_eq!(target, "AB20AA-01");
                assert_eq!(sources, vec!["ABAA-01", "ABAA-02"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_duplicate_sources_rejected() {
        let err = IdentifierMapping::from_pairs(pairs(&[
            ("ABAA-01", "AB20AA-01"),
            ("ABAA-01", "AB21AA-01"),
        ]))
        .unwrap_err();
        assert!(matches!(err, QcodeError::DuplicateIdentifiers { .. }));
    }

    #[test]
    fn test_apply_derived() {
        let mapping = IdentifierMapping::from_pairs(pairs(&[("ABAA-01", "AB20AA-01")])).unwrap();

        assert_eq!(mapping.apply_derived("ABAA-01").as_deref(), Some("AB20AA-01"));
        assert_eq!(mapping.apply_derived("ABAA-01-B3").as_deref(), Some("AB20AA-01-B3"));
        assert_eq!(mapping.apply_derived("ABAA-02-B3"), None);
        assert_eq!(mapping.apply_derived("free text"), None);
    }
}
