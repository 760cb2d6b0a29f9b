//! Sequence suffix resolution
//!
//! The resolver owns no state of its own: the set of identifiers already
//! issued is an explicit [`UsedSet`] that the caller seeds from every store at
//! the start of a run and threads through each call.

use crate::core::error::{QcodeError, Result};
use crate::core::scheme::{compose, MAX_SEQUENCE};
use std::collections::BTreeSet;

/// Identifiers already issued in the current run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsedSet(BTreeSet<String>);

impl UsedSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from any identifier population (store contents, prior runs)
    pub fn seed_from<I, S>(identifiers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        UsedSet(identifiers.into_iter().map(Into::into).collect())
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.0.contains(identifier)
    }

    /// Add more identifiers to the set
    pub fn extend<I, S>(&mut self, identifiers: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.0.extend(identifiers.into_iter().map(Into::into));
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.0.iter()
    }

    fn insert(&mut self, identifier: String) -> bool {
        self.0.insert(identifier)
    }
}

/// Two-digit sequence suffix
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Sequence(u8);

impl Sequence {
    pub fn value(self) -> u8 {
        self.0
    }

    /// Zero-padded two-digit form
    pub fn as_suffix(self) -> String {
        format!("{:02}", self.0)
    }
}

/// Finds the smallest free sequence for a prefix
#[derive(Debug, Clone, Copy, Default)]
pub struct UniquenessResolver;

impl UniquenessResolver {
    /// Smallest sequence in 1..=99 such that `{prefix}-{seq:02}` is unused
    ///
    /// # Errors
    ///
    /// Returns `SequenceCapacityExceeded` when all 99 sequences are taken.
    pub fn next_suffix(&self, prefix: &str, used: &UsedSet) -> Result<Sequence> {
        (1..=MAX_SEQUENCE)
            .find(|seq| !used.contains(&compose(prefix, *seq)))
            .map(Sequence)
            .ok_or_else(|| QcodeError::SequenceCapacityExceeded {
                prefix: prefix.to_string(),
                max: MAX_SEQUENCE,
            })
    }

    /// Record an identifier as issued; returns false if it already was
    pub fn register(&self, identifier: impl Into<String>, used: &mut UsedSet) -> bool {
        used.insert(identifier.into())
    }
}
