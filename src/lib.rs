//! # qcode-sync - Question Identifiers Across Many Stores
//!
//! `qcode-sync` generates, validates and migrates the QCODE identifiers of an
//! exam question bank whose questions live in several JSON stores at once:
//!
//! - **Generation**: identifiers composed from category codes, optionally the
//!   exam round, and a collision-free two-digit sequence
//! - **Derived slots**: eight true/false slots (`-B1`..`-B8`) per question
//! - **Consistency**: format compliance, duplicate analysis, cross-store diffs
//! - **Migration**: a staged, backed-up, verified rewrite of every store when
//!   the identifier scheme changes
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use qcode_sync::{QcodeSync, Result};
//!
//! # fn main() -> Result<()> {
//! let mut sync = QcodeSync::open_file("qcode-sync.toml")?;
//!
//! let health = sync.check()?;
//! println!("{}", health);
//!
//! let plan = sync.plan();
//! println!("{}", plan);
//! # Ok(())
//! # }
//! ```
//!
//! ## Builder
//!
//! ```rust,no_run
//! use qcode_sync::{QcodeSyncBuilder, Result, SchemeVersion, StoreKind};
//!
//! # fn main() -> Result<()> {
//! let mut sync = QcodeSyncBuilder::new()
//!     .primary("master", StoreKind::List, "data/questions_master.json")
//!     .secondary("slots", StoreKind::Slotted, "data/derived_slots.json")
//!     .current(SchemeVersion::V1)
//!     .target(SchemeVersion::V2)
//!     .backup_dir("backups")
//!     .build()?;
//!
//! let report = sync.migrate();
//! assert!(report.is_success(), "{}", report);
//! # Ok(())
//! # }
//! ```

pub mod core;

pub use crate::core::{
    backup::{BackupManager, BackupRecord},
    category::{CategoryCodeTable, CategoryValues, UnmappedCategory},
    config::{StoreSpec, SyncConfig},
    consistency::{CheckReport, ComplianceReport, StoreDiff},
    error::{QcodeError, Result},
    generator::{AssignMode, AssignmentReport, IdentifierGenerator},
    lock::RunLock,
    mapping::IdentifierMapping,
    migration::{
        FixedMapping, MappingStrategy, MigrationEngine, MigrationFailure, MigrationOutcome,
        MigrationReport, MigrationStage, SchemeUpgrade, SequencePolicy,
    },
    record::PrimaryRecord,
    resolver::{UniquenessResolver, UsedSet},
    scheme::{FormatScheme, SchemeVersion},
    slots::{FillOutcome, Slot, SlotAllocator, SlotTag},
    store::{Coverage, QuestionStore, StoreKind, StoreSet},
    sync::ParentSync,
};

use crate::core::consistency;
use crate::core::generator::assign_identifiers;
use crate::core::record::format_timestamp;
use crate::core::store::SlottedStore;
use chrono::{Local, NaiveDateTime};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

fn local_now() -> NaiveDateTime {
    Local::now().naive_local()
}

/// A locked, loaded store set plus its configuration
///
/// Holding a `QcodeSync` holds the run lock; a second `open` over the same
/// stores fails with [`QcodeError::StoreLocked`] until this one is dropped.
pub struct QcodeSync {
    config: SyncConfig,
    stores: StoreSet,
    backups: BackupManager,
    lock: RunLock,
    clock: fn() -> NaiveDateTime,
}

impl QcodeSync {
    /// Lock and load the stores a config names
    pub fn open(config: SyncConfig) -> Result<Self> {
        Self::open_with_clock(config, local_now)
    }

    /// Open from a TOML config file
    pub fn open_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open(SyncConfig::from_file(path)?)
    }

    fn open_with_clock(config: SyncConfig, clock: fn() -> NaiveDateTime) -> Result<Self> {
        config.check()?;
        let lock = RunLock::acquire(config.lock_path(), "qcode-sync")?;
        let backups = config.backup_manager()?;
        let stores = config.open_stores()?;

        info!(
            "Opened {} stores ({} -> {})",
            stores.len(),
            config
                .scheme
                .current
                .map(|v| v.to_string())
                .unwrap_or_else(|| "?".to_string()),
            config.scheme.target
        );

        Ok(QcodeSync {
            config,
            stores,
            backups,
            lock,
            clock,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn stores(&self) -> &StoreSet {
        &self.stores
    }

    pub fn lock(&self) -> &RunLock {
        &self.lock
    }

    /// Scheme the stores are expected to be in right now
    pub fn active_scheme(&self) -> SchemeVersion {
        self.config.scheme.current.unwrap_or(self.config.scheme.target)
    }

    /// Reload and check against the active scheme
    pub fn check(&mut self) -> Result<CheckReport> {
        self.check_against(self.active_scheme())
    }

    pub fn check_against(&mut self, scheme: SchemeVersion) -> Result<CheckReport> {
        self.stores.load_all()?;
        Ok(consistency::check(&self.stores, scheme))
    }

    fn engine(&self) -> MigrationEngine {
        let strategy = SchemeUpgrade::new(self.config.scheme.target, self.config.scheme.sequence_policy);
        MigrationEngine::new(strategy)
            .with_backups(self.backups.clone())
            .with_clock(self.clock)
    }

    /// Dry run: load, validate and map without touching any file
    pub fn plan(&mut self) -> MigrationReport {
        let engine = self.engine();
        engine.plan(&mut self.stores)
    }

    /// Migrate every store to the target scheme
    pub fn migrate(&mut self) -> MigrationReport {
        let engine = self.engine();
        engine.run(&mut self.stores)
    }

    /// Migrate with a custom mapping strategy
    pub fn migrate_with(&mut self, strategy: impl MappingStrategy + 'static) -> MigrationReport {
        let engine = MigrationEngine::new(strategy)
            .with_backups(self.backups.clone())
            .with_clock(self.clock);
        engine.run(&mut self.stores)
    }

    /// Issue identifiers in the primary store under the active scheme
    ///
    /// `MissingOnly` never moves an identifier another store can refer to
    /// (the first holder of a duplicate keeps it), so only the primary store
    /// is written, after a backup. New identifiers reach the slotted store
    /// through [`QcodeSync::sync_parents`].
    ///
    /// `Renumber` with secondary stores configured runs the renumbering
    /// through the [`MigrationEngine`], so every store is backed up,
    /// rewritten and verified together. It is refused with
    /// [`QcodeError::AmbiguousRenumber`] while the primary holds blank or
    /// duplicated identifiers, since those cannot be matched to secondary
    /// entries.
    pub fn assign(&mut self, mode: AssignMode) -> Result<AssignmentReport> {
        self.stores.load_all()?;
        let generator = IdentifierGenerator::new(self.active_scheme());
        let now = (self.clock)();

        let primary_ids: BTreeSet<String> = self.stores.primary().identifiers().into_iter().collect();
        let mut used = match mode {
            AssignMode::MissingOnly => UsedSet::seed_from(self.stores.all_identifiers()),
            AssignMode::Renumber => UsedSet::seed_from(
                self.stores
                    .all_identifiers()
                    .into_iter()
                    .filter(|id| !primary_ids.contains(id)),
            ),
        };

        let name = self.stores.primary().name().to_string();
        let mut records = self
            .stores
            .primary()
            .primary_records()
            .map(<[PrimaryRecord]>::to_vec)
            .ok_or_else(|| QcodeError::UnsupportedStore {
                store: name.clone(),
                reason: "store holds no primary records".to_string(),
            })?;

        // Work on a copy; the store is only changed once the backup exists.
        let report = assign_identifiers(&generator, &mut records, mode, &mut used)?;
        if report.assignments.is_empty() {
            debug!("No identifiers to assign in {}", name);
            return Ok(report);
        }

        if mode == AssignMode::Renumber && !self.stores.secondaries().is_empty() {
            return self.renumber_all_stores(report);
        }

        let primary = self.stores.primary_mut();
        primary.backup(&self.backups)?;
        if let Some(stored) = primary.primary_records_mut() {
            for assignment in &report.assignments {
                if let Some(record) = stored.get_mut(assignment.index) {
                    record.qcode = assignment.new_qcode.clone();
                    record.touch(now);
                }
            }
        }
        primary.save()?;
        info!("Assigned {} identifiers in {}", report.assignments.len(), name);
        Ok(report)
    }

    /// Carry a renumbering into every store as one verified migration
    fn renumber_all_stores(&mut self, report: AssignmentReport) -> Result<AssignmentReport> {
        let mut holders: BTreeMap<&str, usize> = BTreeMap::new();
        for assignment in &report.assignments {
            *holders.entry(assignment.old_qcode.as_str()).or_default() += 1;
        }
        let ambiguous: Vec<String> = holders
            .iter()
            .filter(|(id, count)| id.trim().is_empty() || **count > 1)
            .map(|(id, _)| id.to_string())
            .collect();
        if !ambiguous.is_empty() {
            return Err(QcodeError::AmbiguousRenumber {
                stores: self
                    .stores
                    .secondaries()
                    .iter()
                    .map(|s| s.name().to_string())
                    .collect(),
                identifiers: ambiguous,
            });
        }

        let pairs = report
            .assignments
            .iter()
            .map(|a| (a.old_qcode.clone(), a.new_qcode.clone()))
            .collect();
        let engine = MigrationEngine::new(FixedMapping::new(self.active_scheme(), pairs))
            .with_backups(self.backups.clone())
            .with_clock(self.clock);
        let migration = engine.run(&mut self.stores).into_result()?;

        info!(
            "Renumbered {} identifiers across {} stores",
            migration.remapped,
            migration.applied.len()
        );
        Ok(report)
    }

    fn parent_record(&self, parent: &str) -> Result<PrimaryRecord> {
        self.stores
            .primary()
            .primary_records()
            .and_then(|records| records.iter().find(|r| r.qcode == parent))
            .cloned()
            .ok_or_else(|| QcodeError::UnknownParent(parent.to_string()))
    }

    fn slotted_mut(&mut self) -> Result<&mut SlottedStore> {
        self.stores
            .slotted_mut()
            .ok_or_else(|| QcodeError::UnsupportedStore {
                store: "slotted".to_string(),
                reason: "no slotted store is configured".to_string(),
            })
    }

    /// Fill one slot of `parent` and save the slotted store
    ///
    /// Overwriting a filled slot succeeds; the previous content comes back in
    /// [`FillOutcome::Overwrote`].
    pub fn fill_slot(&mut self, parent: &str, tag: &str, question: &str, answer: &str) -> Result<FillOutcome> {
        let record = self.parent_record(parent)?;
        let now = (self.clock)();
        let slotted = self.slotted_mut()?;

        slotted.insert_parent(&record, now);
        let entry = slotted.entry_mut(parent)?;
        let outcome = SlotAllocator.fill(&mut entry.slots, tag, question, answer, now)?;
        entry.metadata.last_updated = Some(format_timestamp(now));

        slotted.save()?;
        Ok(outcome)
    }

    /// Clear one slot of `parent`, returning what it held
    pub fn clear_slot(&mut self, parent: &str, tag: &str) -> Result<Slot> {
        self.parent_record(parent)?;
        let now = (self.clock)();
        let slotted = self.slotted_mut()?;

        let entry = slotted.entry_mut(parent)?;
        let previous = SlotAllocator.clear(&mut entry.slots, tag)?;
        entry.metadata.last_updated = Some(format_timestamp(now));

        slotted.save()?;
        Ok(previous)
    }

    /// Create missing slotted entries and refresh mirrored parent metadata
    pub fn sync_parents(&mut self) -> Result<ParentSync> {
        self.stores.load_all()?;
        let records: Vec<PrimaryRecord> = self
            .stores
            .primary()
            .primary_records()
            .map(<[PrimaryRecord]>::to_vec)
            .unwrap_or_default();
        let now = (self.clock)();
        let slotted = self.slotted_mut()?;

        let report = crate::core::sync::sync_parents(&records, slotted, now);
        if report.changed() {
            slotted.save()?;
        }
        Ok(report)
    }

    /// Existing backups per store, oldest first
    pub fn backups(&self) -> Result<BTreeMap<String, Vec<PathBuf>>> {
        let mut out = BTreeMap::new();
        for store in self.stores.iter() {
            out.insert(store.name().to_string(), self.backups.list_backups(store.path())?);
        }
        Ok(out)
    }

    /// Delete all but the newest `keep` backups of each store
    ///
    /// `None` uses the configured `backup.keep`.
    pub fn prune_backups(&self, keep: Option<usize>) -> Result<Vec<PathBuf>> {
        let keep = keep.unwrap_or(self.config.backup.keep);
        let mut removed = Vec::new();
        for store in self.stores.iter() {
            removed.extend(self.backups.prune(store.path(), keep)?);
        }
        Ok(removed)
    }
}

/// Builder for [`QcodeSync`] without a config file
///
/// # Examples
///
/// ```rust,no_run
/// use qcode_sync::{QcodeSyncBuilder, SchemeVersion, StoreKind};
///
/// let sync = QcodeSyncBuilder::new()
///     .primary("master", StoreKind::List, "questions_master.json")
///     .target(SchemeVersion::V2)
///     .build()
///     .unwrap();
/// ```
pub struct QcodeSyncBuilder {
    primary: Option<StoreSpec>,
    secondaries: Vec<StoreSpec>,
    current: Option<SchemeVersion>,
    target: SchemeVersion,
    policy: SequencePolicy,
    backup_dir: Option<String>,
    keep: Option<usize>,
    lock_path: Option<String>,
    clock: fn() -> NaiveDateTime,
}

impl QcodeSyncBuilder {
    pub fn new() -> Self {
        Self {
            primary: None,
            secondaries: Vec::new(),
            current: None,
            target: SchemeVersion::V2,
            policy: SequencePolicy::default(),
            backup_dir: None,
            keep: None,
            lock_path: None,
            clock: local_now,
        }
    }

    pub fn primary<S: Into<String>, P: Into<String>>(mut self, name: S, kind: StoreKind, path: P) -> Self {
        self.primary = Some(StoreSpec::new(name, kind, path));
        self
    }

    pub fn secondary<S: Into<String>, P: Into<String>>(mut self, name: S, kind: StoreKind, path: P) -> Self {
        self.secondaries.push(StoreSpec::new(name, kind, path));
        self
    }

    /// Secondary store that may hold a subset of the primary identifiers
    pub fn subset_secondary<S: Into<String>, P: Into<String>>(
        mut self,
        name: S,
        kind: StoreKind,
        path: P,
    ) -> Self {
        self.secondaries
            .push(StoreSpec::new(name, kind, path).with_coverage(Coverage::Subset));
        self
    }

    pub fn current(mut self, scheme: SchemeVersion) -> Self {
        self.current = Some(scheme);
        self
    }

    pub fn target(mut self, scheme: SchemeVersion) -> Self {
        self.target = scheme;
        self
    }

    pub fn sequence_policy(mut self, policy: SequencePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn backup_dir<P: Into<String>>(mut self, dir: P) -> Self {
        self.backup_dir = Some(dir.into());
        self
    }

    pub fn keep_backups(mut self, keep: usize) -> Self {
        self.keep = Some(keep);
        self
    }

    pub fn lock_path<P: Into<String>>(mut self, path: P) -> Self {
        self.lock_path = Some(path.into());
        self
    }

    /// Clock used for record and slot timestamps
    pub fn clock(mut self, clock: fn() -> NaiveDateTime) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> Result<SyncConfig> {
        let primary = self
            .primary
            .clone()
            .ok_or_else(|| QcodeError::Config("a primary store is required".to_string()))?;

        let mut config = SyncConfig::new(primary, self.target);
        config.scheme.current = self.current;
        config.scheme.sequence_policy = self.policy;
        config.stores.secondary = self.secondaries.clone();
        config.backup.dir = self.backup_dir.clone();
        if let Some(keep) = self.keep {
            config.backup.keep = keep;
        }
        config.lock.path = self.lock_path.clone();
        Ok(config)
    }

    pub fn build(self) -> Result<QcodeSync> {
        let config = self.config()?;
        QcodeSync::open_with_clock(config, self.clock)
    }
}

impl Default for QcodeSyncBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn fixed_now() -> NaiveDateTime {
        chrono::NaiveDate::from_ymd_opt(2025, 1, 17)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap()
    }

    fn question(qcode: &str, round: u32) -> serde_json::Value {
        json!({
            "QCODE": qcode,
            "ETITLE": "보험중개사",
            "ECLASS": "손해보험",
            "LAYER1": "관계법령",
            "LAYER2": "보험업법",
            "QTYPE": "A",
            "EROUND": round.to_string(),
            "QUESTION": format!("{} 문제", qcode),
            "ANSWER": 1
        })
    }

    fn write_master(dir: &TempDir, questions: Vec<serde_json::Value>) -> String {
        let path = dir.path().join("questions_master.json");
        let doc = json!({ "metadata": {}, "questions": questions });
        std::fs::write(&path, serde_json::to_vec_pretty(&doc).unwrap()).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn builder(dir: &TempDir, master: String) -> QcodeSyncBuilder {
        let slots = dir.path().join("derived_slots.json");
        std::fs::write(&slots, r#"{"metadata": {}, "questions": {}}"#).unwrap();

        QcodeSyncBuilder::new()
            .primary("master", StoreKind::List, master)
            .subset_secondary("slots", StoreKind::Slotted, slots.to_string_lossy())
            .current(SchemeVersion::V2)
            .target(SchemeVersion::V2)
            .clock(fixed_now)
    }

    #[test]
    fn test_builder_requires_primary() {
        let err = QcodeSyncBuilder::new().build().err().unwrap();
        assert!(matches!(err, QcodeError::Config(_)));
    }

    #[test]
    fn test_second_open_is_locked_out() {
        let dir = TempDir::new().unwrap();
        let master = write_master(&dir, vec![question("AB20AA-01", 20)]);

        let first = builder(&dir, master.clone()).build().unwrap();
        let err = builder(&dir, master.clone()).build().err().unwrap();
        assert!(matches!(err, QcodeError::StoreLocked(_)));

        drop(first);
        assert!(builder(&dir, master).build().is_ok());
    }

    #[test]
    fn test_assign_fills_blank_identifiers() {
        let dir = TempDir::new().unwrap();
        let master = write_master(&dir, vec![question("AB20AA-01", 20), question("", 20), question("", 21)]);
        let mut sync = builder(&dir, master).build().unwrap();

        let report = sync.assign(AssignMode::MissingOnly).unwrap();
        let issued: Vec<_> = report.assignments.iter().map(|a| a.new_qcode.as_str()).collect();
        assert_eq!(issued, ["AB20AA-02", "AB21AA-01"]);

        let check = sync.check().unwrap();
        assert!(check.compliance.iter().all(|c| c.invalid.is_empty()));
        assert_eq!(sync.backups().unwrap()["master"].len(), 1);
    }

    #[test]
    fn test_assign_leaves_records_alone_when_backup_fails() {
        let dir = TempDir::new().unwrap();
        let master = write_master(&dir, vec![question("AB20AA-01", 20), question("", 20)]);
        let backup_dir = dir.path().join("backups");
        let mut sync = builder(&dir, master)
            .backup_dir(backup_dir.to_string_lossy())
            .build()
            .unwrap();

        // A plain file where the backup directory should be.
        std::fs::remove_dir_all(&backup_dir).unwrap();
        std::fs::write(&backup_dir, b"not a directory").unwrap();

        let err = sync.assign(AssignMode::MissingOnly).unwrap_err();
        assert!(matches!(err, QcodeError::BackupFailure { .. }), "{}", err);
        assert_eq!(sync.stores().primary().identifiers(), vec!["AB20AA-01", ""]);
    }

    #[test]
    fn test_fill_and_clear_slot() {
        let dir = TempDir::new().unwrap();
        let master = write_master(&dir, vec![question("AB20AA-01", 20)]);
        let mut sync = builder(&dir, master).build().unwrap();

        let outcome = sync
            .fill_slot("AB20AA-01", "B3", "보험업법은 ... 이다", "O")
            .unwrap();
        assert_eq!(outcome, FillOutcome::Filled);

        let again = sync.fill_slot("AB20AA-01", "B3", "수정된 문제", "X").unwrap();
        assert!(matches!(again, FillOutcome::Overwrote(_)));

        let err = sync.fill_slot("AB20AA-09", "B1", "q", "a").unwrap_err();
        assert!(matches!(err, QcodeError::UnknownParent(_)));
        let err = sync.fill_slot("AB20AA-01", "B9", "q", "a").unwrap_err();
        assert!(matches!(err, QcodeError::InvalidSlot(_)));

        let previous = sync.clear_slot("AB20AA-01", "B3").unwrap();
        assert_eq!(previous.answer, "X");

        let check = sync.check().unwrap();
        assert!(check.is_healthy(), "{}", check);
    }

    #[test]
    fn test_sync_parents_creates_entries() {
        let dir = TempDir::new().unwrap();
        let master = write_master(&dir, vec![question("AB20AA-01", 20), question("AB20AA-02", 20)]);
        let mut sync = builder(&dir, master).build().unwrap();

        let report = sync.sync_parents().unwrap();
        assert_eq!(report.created, vec!["AB20AA-01", "AB20AA-02"]);

        let again = sync.sync_parents().unwrap();
        assert!(!again.changed());
        assert_eq!(sync.stores().slotted().unwrap().entries().len(), 2);
    }
}
