//! Scheme migration across the store set
//!
//! A run walks a fixed state machine:
//!
//! ```text
//! LOADED → MAPPED → BACKED_UP → APPLIED → VERIFIED
//!    ╰────────┴──────────┴──────────┴─────────┴──→ FAILED
//! ```
//!
//! - **LOADED**: every store is read; counts, duplicates and key alignment
//!   are checked before anything else happens
//! - **MAPPED**: one frozen old → new [`IdentifierMapping`] is built and
//!   proven bijective
//! - **BACKED_UP**: every store file gets a verified copy
//! - **APPLIED**: the mapping is written to each store, primary first
//! - **VERIFIED**: stores are reloaded from disk and diffed pairwise
//!
//! Failures before APPLIED leave every file untouched. A failure after the
//! first store is written is reported as a partial migration; there is no
//! automatic rollback, the backups taken in BACKED_UP are the recovery path.

use crate::core::backup::{BackupManager, BackupRecord};
use crate::core::category::UnmappedCategory;
use crate::core::consistency::{alignment, diff, StoreDiff};
use crate::core::error::{QcodeError, Result};
use crate::core::generator::IdentifierGenerator;
use crate::core::journal::{JournalEntry, JournalEvent, MigrationJournal};
use crate::core::mapping::IdentifierMapping;
use crate::core::record::PrimaryRecord;
use crate::core::resolver::{UniquenessResolver, UsedSet};
use crate::core::scheme::{compose, parse_qcode, SchemeVersion, MAX_SEQUENCE};
use crate::core::store::{Coverage, QuestionStore, StoreSet, StoreSnapshot};
use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Migration state machine stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStage {
    Loaded,
    Mapped,
    BackedUp,
    Applied,
    Verified,
    Failed,
}

impl MigrationStage {
    pub fn as_str(self) -> &'static str {
        match self {
            MigrationStage::Loaded => "loaded",
            MigrationStage::Mapped => "mapped",
            MigrationStage::BackedUp => "backed_up",
            MigrationStage::Applied => "applied",
            MigrationStage::Verified => "verified",
            MigrationStage::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, MigrationStage::Verified | MigrationStage::Failed)
    }

    /// Legal transitions; `None` is a run that has not loaded yet
    pub fn can_follow(self, from: Option<MigrationStage>) -> bool {
        use MigrationStage::*;
        match (from, self) {
            (None, Loaded) | (None, Failed) => true,
            (Some(from), Failed) => !from.is_terminal(),
            (Some(Loaded), Mapped)
            | (Some(Mapped), BackedUp)
            | (Some(BackedUp), Applied)
            | (Some(Applied), Verified) => true,
            _ => false,
        }
    }
}

impl fmt::Display for MigrationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str().to_uppercase())
    }
}

/// What happens to an old sequence number when the prefix changes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SequencePolicy {
    /// Keep the old two-digit sequence when it is free under the new prefix
    #[default]
    Preserve,
    /// Number every new prefix from 01 in record order
    Renumber,
}

impl FromStr for SequencePolicy {
    type Err = QcodeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "preserve" => Ok(SequencePolicy::Preserve),
            "renumber" => Ok(SequencePolicy::Renumber),
            _ => Err(QcodeError::Config(format!(
                "Invalid sequence policy '{}'. Valid options: preserve, renumber",
                s
            ))),
        }
    }
}

/// Candidate old → new pairs, before the bijection check
#[derive(Debug, Clone, Default)]
pub struct ProposedMapping {
    pub pairs: Vec<(String, String)>,
    pub warnings: Vec<UnmappedCategory>,
}

/// Computes the old → new pairs for a run
pub trait MappingStrategy: Send + Sync {
    /// Scheme the new identifiers follow
    fn target(&self) -> SchemeVersion;

    /// Propose a new identifier for every record
    ///
    /// `used` is pre-seeded with every identifier any store already holds
    /// under the target scheme; each identifier issued must be registered.
    fn propose(&self, records: &[PrimaryRecord], used: &mut UsedSet) -> Result<ProposedMapping>;
}

/// Default strategy: regenerate identifiers under a target scheme
#[derive(Debug, Clone, Copy)]
pub struct SchemeUpgrade {
    generator: IdentifierGenerator,
    policy: SequencePolicy,
}

impl SchemeUpgrade {
    pub fn new(target: SchemeVersion, policy: SequencePolicy) -> Self {
        SchemeUpgrade {
            generator: IdentifierGenerator::new(target),
            policy,
        }
    }

    pub fn policy(&self) -> SequencePolicy {
        self.policy
    }
}

impl MappingStrategy for SchemeUpgrade {
    fn target(&self) -> SchemeVersion {
        self.generator.version()
    }

    fn propose(&self, records: &[PrimaryRecord], used: &mut UsedSet) -> Result<ProposedMapping> {
        let target = self.target().primary();
        let resolver = UniquenessResolver;
        let mut warnings = Vec::new();

        let mut prefixes = Vec::with_capacity(records.len());
        for record in records {
            let (prefix, unmapped) = self
                .generator
                .prefix(&record.category_values(), record.round())?;
            warnings.extend(unmapped);
            prefixes.push(prefix);
        }

        let mut assigned: Vec<Option<String>> = vec![None; records.len()];

        // Already in the target scheme with the right prefix: keep as is.
        for (i, record) in records.iter().enumerate() {
            let conforms = target.matches(&record.qcode)
                && parse_qcode(&record.qcode)
                    .map(|parsed| parsed.prefix == prefixes[i])
                    .unwrap_or(false);
            if conforms {
                resolver.register(record.qcode.clone(), used);
                assigned[i] = Some(record.qcode.clone());
            }
        }

        if self.policy == SequencePolicy::Preserve {
            for (i, record) in records.iter().enumerate() {
                if assigned[i].is_some() {
                    continue;
                }
                let Some(parsed) = parse_qcode(&record.qcode) else {
                    continue;
                };
                if parsed.sequence == 0 || parsed.sequence > MAX_SEQUENCE {
                    continue;
                }
                let candidate = compose(&prefixes[i], parsed.sequence);
                if !used.contains(&candidate) {
                    resolver.register(candidate.clone(), used);
                    assigned[i] = Some(candidate);
                }
            }
        }

        for (i, slot) in assigned.iter_mut().enumerate() {
            if slot.is_none() {
                let sequence = resolver.next_suffix(&prefixes[i], used)?;
                let identifier = compose(&prefixes[i], sequence.value());
                resolver.register(identifier.clone(), used);
                *slot = Some(identifier);
            }
        }

        let pairs = records
            .iter()
            .zip(assigned)
            .filter_map(|(record, new)| new.map(|new| (record.qcode.clone(), new)))
            .collect();

        Ok(ProposedMapping { pairs, warnings })
    }
}

/// Strategy that replays pairs computed elsewhere (a renumbering pass)
///
/// Records the pairs do not mention map to themselves.
#[derive(Debug, Clone)]
pub struct FixedMapping {
    target: SchemeVersion,
    pairs: Vec<(String, String)>,
}

impl FixedMapping {
    pub fn new(target: SchemeVersion, pairs: Vec<(String, String)>) -> Self {
        FixedMapping { target, pairs }
    }
}

impl MappingStrategy for FixedMapping {
    fn target(&self) -> SchemeVersion {
        self.target
    }

    fn propose(&self, records: &[PrimaryRecord], used: &mut UsedSet) -> Result<ProposedMapping> {
        let given: BTreeMap<&str, &str> = self
            .pairs
            .iter()
            .map(|(old, new)| (old.as_str(), new.as_str()))
            .collect();

        let pairs = records
            .iter()
            .map(|record| {
                let new = given.get(record.qcode.as_str()).copied().unwrap_or(record.qcode.as_str());
                UniquenessResolver.register(new.to_string(), used);
                (record.qcode.clone(), new.to_string())
            })
            .collect();

        Ok(ProposedMapping {
            pairs,
            warnings: Vec::new(),
        })
    }
}

/// Serialisable reason a run ended in FAILED
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MigrationFailure {
    CountMismatch {
        left: String,
        left_count: usize,
        right: String,
        right_count: usize,
    },
    DuplicateIdentifiers {
        store: String,
        identifiers: Vec<String>,
    },
    Misaligned {
        reason: String,
    },
    NonBijectiveMapping {
        target: String,
        sources: Vec<String>,
    },
    SequenceCapacityExceeded {
        prefix: String,
        max: u8,
    },
    BackupFailure {
        store: String,
        reason: String,
    },
    ApplyFailed {
        store: String,
        reason: String,
    },
    PartialMigration {
        applied: Vec<String>,
        failed: String,
        reason: String,
    },
    DriftDetected {
        summary: String,
    },
    Other {
        message: String,
    },
}

impl MigrationFailure {
    /// Equivalent error, for callers that want `?`
    pub fn into_error(self) -> QcodeError {
        match self {
            MigrationFailure::CountMismatch {
                left,
                left_count,
                right,
                right_count,
            } => QcodeError::CountMismatch {
                left,
                left_count,
                right,
                right_count,
            },
            MigrationFailure::DuplicateIdentifiers { store, identifiers } => {
                QcodeError::DuplicateIdentifiers { store, identifiers }
            }
            MigrationFailure::Misaligned { reason } => QcodeError::Misaligned(reason),
            MigrationFailure::NonBijectiveMapping { target, sources } => {
                QcodeError::NonBijectiveMapping { target, sources }
            }
            MigrationFailure::SequenceCapacityExceeded { prefix, max } => {
                QcodeError::SequenceCapacityExceeded { prefix, max }
            }
            MigrationFailure::BackupFailure { store, reason } => {
                QcodeError::BackupFailure { store, reason }
            }
            MigrationFailure::ApplyFailed { store, reason } => QcodeError::ApplyFailed { store, reason },
            MigrationFailure::PartialMigration {
                applied,
                failed,
                reason,
            } => QcodeError::PartialMigration {
                applied,
                failed,
                reason,
            },
            MigrationFailure::DriftDetected { summary } => QcodeError::DriftDetected(summary),
            MigrationFailure::Other { message } => QcodeError::Aborted(message),
        }
    }
}

impl From<QcodeError> for MigrationFailure {
    fn from(err: QcodeError) -> Self {
        match err {
            QcodeError::CountMismatch {
                left,
                left_count,
                right,
                right_count,
            } => MigrationFailure::CountMismatch {
                left,
                left_count,
                right,
                right_count,
            },
            QcodeError::DuplicateIdentifiers { store, identifiers } => {
                MigrationFailure::DuplicateIdentifiers { store, identifiers }
            }
            QcodeError::Misaligned(reason) => MigrationFailure::Misaligned { reason },
            QcodeError::NonBijectiveMapping { target, sources } => {
                MigrationFailure::NonBijectiveMapping { target, sources }
            }
            QcodeError::SequenceCapacityExceeded { prefix, max } => {
                MigrationFailure::SequenceCapacityExceeded { prefix, max }
            }
            QcodeError::BackupFailure { store, reason } => {
                MigrationFailure::BackupFailure { store, reason }
            }
            QcodeError::ApplyFailed { store, reason } => MigrationFailure::ApplyFailed { store, reason },
            QcodeError::PartialMigration {
                applied,
                failed,
                reason,
            } => MigrationFailure::PartialMigration {
                applied,
                failed,
                reason,
            },
            QcodeError::DriftDetected(summary) => MigrationFailure::DriftDetected { summary },
            other => MigrationFailure::Other {
                message: other.to_string(),
            },
        }
    }
}

impl fmt::Display for MigrationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.clone().into_error())
    }
}

/// How a run ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MigrationOutcome {
    /// Dry run stopped after MAPPED
    Planned,
    Completed,
    Failed {
        /// Stage being attempted when the run failed
        stage: MigrationStage,
        failure: MigrationFailure,
    },
}

/// Store that received the mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedStore {
    pub store: String,
    pub changed: usize,
}

/// Structured summary of a run, returned whatever the outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationReport {
    pub target: SchemeVersion,
    pub dry_run: bool,

    /// Final state: MAPPED for a plan, VERIFIED or FAILED for a run
    pub stage: MigrationStage,

    /// Last stage completed before the run ended
    pub reached: Option<MigrationStage>,

    pub outcome: MigrationOutcome,
    pub store_counts: BTreeMap<String, usize>,
    pub remapped: usize,
    pub unchanged: usize,
    pub mapping: IdentifierMapping,
    pub backups: Vec<BackupRecord>,
    pub applied: Vec<AppliedStore>,
    pub diffs: Vec<StoreDiff>,
    pub format_violations: Vec<String>,
    pub warnings: Vec<String>,
    pub journal: Vec<JournalEntry>,
}

impl MigrationReport {
    fn new(target: SchemeVersion, dry_run: bool) -> Self {
        MigrationReport {
            target,
            dry_run,
            stage: MigrationStage::Failed,
            reached: None,
            outcome: MigrationOutcome::Planned,
            store_counts: BTreeMap::new(),
            remapped: 0,
            unchanged: 0,
            mapping: IdentifierMapping::default(),
            backups: Vec::new(),
            applied: Vec::new(),
            diffs: Vec::new(),
            format_violations: Vec::new(),
            warnings: Vec::new(),
            journal: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self.outcome, MigrationOutcome::Failed { .. })
    }

    pub fn failure(&self) -> Option<&MigrationFailure> {
        match &self.outcome {
            MigrationOutcome::Failed { failure, .. } => Some(failure),
            _ => None,
        }
    }

    /// Stage the run failed in, if it failed
    pub fn failed_stage(&self) -> Option<MigrationStage> {
        match &self.outcome {
            MigrationOutcome::Failed { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    pub fn into_result(self) -> Result<MigrationReport> {
        match self.failure() {
            Some(failure) => Err(failure.clone().into_error()),
            None => Ok(self),
        }
    }
}

impl fmt::Display for MigrationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = if self.dry_run { "Plan" } else { "Migration" };
        writeln!(f, "{} to scheme {}: {}", mode, self.target, self.stage)?;

        let counts: Vec<String> = self
            .store_counts
            .iter()
            .map(|(store, count)| format!("{}={}", store, count))
            .collect();
        writeln!(f, "  records: {}", counts.join(", "))?;
        writeln!(f, "  remapped {}, unchanged {}", self.remapped, self.unchanged)?;

        for backup in &self.backups {
            writeln!(f, "  backup {} -> {}", backup.store, backup.backup_path.display())?;
        }
        for applied in &self.applied {
            writeln!(f, "  applied {} ({} changed)", applied.store, applied.changed)?;
        }
        for warning in &self.warnings {
            writeln!(f, "  warning: {}", warning)?;
        }
        for d in &self.diffs {
            writeln!(f, "  drift: {}", d)?;
            for (id, mismatches) in &d.value_mismatches {
                for m in mismatches {
                    writeln!(f, "    {} {}: {:?} != {:?}", id, m.field, m.left, m.right)?;
                }
            }
        }
        for id in &self.format_violations {
            writeln!(f, "  format violation: {}", id)?;
        }

        match &self.outcome {
            MigrationOutcome::Planned => write!(f, "Planned (no files touched)"),
            MigrationOutcome::Completed => write!(f, "Completed"),
            MigrationOutcome::Failed { stage, failure } => {
                write!(f, "FAILED in {}: {}", stage, failure)
            }
        }
    }
}

/// In-flight run state
struct Run {
    attempting: MigrationStage,
    journal: MigrationJournal,
    report: MigrationReport,
}

impl Run {
    fn new(target: SchemeVersion, dry_run: bool, clock: fn() -> NaiveDateTime) -> Self {
        Run {
            attempting: MigrationStage::Loaded,
            journal: MigrationJournal::with_clock(clock),
            report: MigrationReport::new(target, dry_run),
        }
    }

    fn attempt(&mut self, stage: MigrationStage) {
        self.attempting = stage;
        debug!("Attempting {}", stage);
    }

    fn enter(&mut self, stage: MigrationStage) -> std::result::Result<(), MigrationFailure> {
        if !stage.can_follow(self.report.reached) {
            return Err(QcodeError::InvalidTransition {
                from: self
                    .report
                    .reached
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "START".to_string()),
                to: stage.to_string(),
            }
            .into());
        }
        self.report.reached = Some(stage);
        self.report.stage = stage;
        self.journal.record(JournalEvent::Stage, stage.as_str(), "entered");
        info!("Migration stage {}", stage);
        Ok(())
    }

    fn warn(&mut self, message: String) {
        warn!("{}", message);
        self.report.warnings.push(message);
    }

    fn finish(mut self) -> MigrationReport {
        self.report.outcome = if self.report.dry_run {
            MigrationOutcome::Planned
        } else {
            MigrationOutcome::Completed
        };
        self.report.journal = self.journal.take();
        self.report
    }

    fn fail(mut self, failure: MigrationFailure) -> MigrationReport {
        let stage = self.attempting;
        self.journal
            .record(JournalEvent::Failure, stage.as_str(), failure.to_string());
        warn!("Migration failed in {}: {}", stage, failure);

        self.report.stage = MigrationStage::Failed;
        self.report.outcome = MigrationOutcome::Failed { stage, failure };
        self.report.journal = self.journal.take();
        self.report
    }
}

/// What LOADED hands to later stages
struct LoadedState {
    snapshots: Vec<StoreSnapshot>,
}

fn local_now() -> NaiveDateTime {
    Local::now().naive_local()
}

/// Drives one migration (or plan) over a [`StoreSet`]
pub struct MigrationEngine {
    strategy: Box<dyn MappingStrategy>,
    backups: BackupManager,
    clock: fn() -> NaiveDateTime,
}

impl MigrationEngine {
    pub fn new(strategy: impl MappingStrategy + 'static) -> Self {
        MigrationEngine {
            strategy: Box::new(strategy),
            backups: BackupManager::new(),
            clock: local_now,
        }
    }

    pub fn with_backups(mut self, backups: BackupManager) -> Self {
        self.backups = backups;
        self
    }

    /// Inject the clock used for timestamps
    pub fn with_clock(mut self, clock: fn() -> NaiveDateTime) -> Self {
        self.clock = clock;
        self
    }

    pub fn target(&self) -> SchemeVersion {
        self.strategy.target()
    }

    /// Dry run through MAPPED; nothing is written
    pub fn plan(&self, stores: &mut StoreSet) -> MigrationReport {
        self.execute(stores, true)
    }

    /// Full run through VERIFIED
    pub fn run(&self, stores: &mut StoreSet) -> MigrationReport {
        self.execute(stores, false)
    }

    fn execute(&self, stores: &mut StoreSet, dry_run: bool) -> MigrationReport {
        let mut run = Run::new(self.target(), dry_run, self.clock);
        info!(
            "{} to scheme {} over {:?}",
            if dry_run { "Planning migration" } else { "Migrating" },
            self.target(),
            stores
        );

        match self.drive(stores, &mut run) {
            Ok(()) => run.finish(),
            Err(failure) => run.fail(failure),
        }
    }

    fn drive(&self, stores: &mut StoreSet, run: &mut Run) -> std::result::Result<(), MigrationFailure> {
        run.attempt(MigrationStage::Loaded);
        let loaded = self.load(stores, run)?;
        run.enter(MigrationStage::Loaded)?;

        run.attempt(MigrationStage::Mapped);
        let mapping = self.map(stores, run)?;
        run.enter(MigrationStage::Mapped)?;

        if run.report.dry_run {
            return Ok(());
        }

        run.attempt(MigrationStage::BackedUp);
        self.back_up(stores, run)?;
        run.enter(MigrationStage::BackedUp)?;

        run.attempt(MigrationStage::Applied);
        self.apply(stores, &mapping, run)?;
        run.enter(MigrationStage::Applied)?;

        run.attempt(MigrationStage::Verified);
        self.verify(stores, &mapping, &loaded, run)?;
        run.enter(MigrationStage::Verified)?;

        Ok(())
    }

    fn load(
        &self,
        stores: &mut StoreSet,
        run: &mut Run,
    ) -> std::result::Result<LoadedState, MigrationFailure> {
        stores.load_all()?;
        let snapshots = stores.snapshots();
        for snapshot in &snapshots {
            run.report
                .store_counts
                .insert(snapshot.name.clone(), snapshot.record_count);
        }

        let Some((primary, secondaries)) = snapshots.split_first() else {
            return Err(MigrationFailure::Other {
                message: "no stores to migrate".to_string(),
            });
        };

        for secondary in secondaries.iter().filter(|s| s.coverage == Coverage::Full) {
            if secondary.record_count != primary.record_count {
                return Err(MigrationFailure::CountMismatch {
                    left: primary.name.clone(),
                    left_count: primary.record_count,
                    right: secondary.name.clone(),
                    right_count: secondary.record_count,
                });
            }
        }

        let blank = primary.records.keys().filter(|id| id.trim().is_empty()).count();
        if blank > 0 {
            return Err(MigrationFailure::Misaligned {
                reason: format!(
                    "{} has records without an identifier; assign identifiers first",
                    primary.name
                ),
            });
        }

        for snapshot in &snapshots {
            if !snapshot.duplicates.is_empty() {
                return Err(MigrationFailure::DuplicateIdentifiers {
                    store: snapshot.name.clone(),
                    identifiers: snapshot.duplicates.clone(),
                });
            }
        }

        for d in alignment(primary, secondaries) {
            if !d.is_aligned() {
                return Err(MigrationFailure::Misaligned {
                    reason: d.to_string(),
                });
            }
            if !d.value_mismatches.is_empty() {
                run.warn(format!(
                    "{} field mismatches between {} and {} before migration",
                    d.mismatch_count(),
                    d.left,
                    d.right
                ));
            }
        }

        Ok(LoadedState { snapshots })
    }

    fn map(
        &self,
        stores: &StoreSet,
        run: &mut Run,
    ) -> std::result::Result<IdentifierMapping, MigrationFailure> {
        let target = self.target();
        let records = stores.primary().primary_records().unwrap_or_default();

        let mut used = UsedSet::seed_from(
            stores
                .all_identifiers()
                .into_iter()
                .filter(|id| target.primary().matches(id)),
        );
        debug!("Seeded used set with {} target-scheme identifiers", used.len());

        let proposed = self.strategy.propose(records, &mut used)?;
        for warning in &proposed.warnings {
            run.warn(format!("unmapped category: {}", warning));
        }

        let mapping = IdentifierMapping::from_pairs(proposed.pairs)?;

        let uncovered: Vec<String> = records
            .iter()
            .filter(|r| mapping.get(&r.qcode).is_none())
            .map(|r| r.qcode.clone())
            .collect();
        if !uncovered.is_empty() {
            return Err(MigrationFailure::Misaligned {
                reason: format!("mapping does not cover {:?}", uncovered),
            });
        }

        run.report.remapped = mapping.changed();
        run.report.unchanged = mapping.len() - mapping.changed();
        run.report.mapping = mapping.clone();
        info!(
            "Mapped {} identifiers ({} change)",
            mapping.len(),
            mapping.changed()
        );

        Ok(mapping)
    }

    fn back_up(&self, stores: &StoreSet, run: &mut Run) -> std::result::Result<(), MigrationFailure> {
        for target in stores.iter() {
            let record = target.backup(&self.backups).map_err(|e| match e {
                QcodeError::BackupFailure { store, reason } => {
                    MigrationFailure::BackupFailure { store, reason }
                }
                other => MigrationFailure::BackupFailure {
                    store: target.name().to_string(),
                    reason: other.to_string(),
                },
            })?;
            run.journal.record(
                JournalEvent::Backup,
                MigrationStage::BackedUp.as_str(),
                format!("{} -> {}", record.store, record.backup_path.display()),
            );
            run.report.backups.push(record);
        }
        Ok(())
    }

    fn apply(
        &self,
        stores: &mut StoreSet,
        mapping: &IdentifierMapping,
        run: &mut Run,
    ) -> std::result::Result<(), MigrationFailure> {
        let now = (self.clock)();
        let target = self.target();
        let mut applied: Vec<String> = Vec::new();

        for index in stores.apply_order() {
            let Some(store) = stores.get_mut(index) else {
                continue;
            };
            let name = store.name().to_string();

            match apply_one(store, mapping, target, now) {
                Ok(changed) => {
                    run.journal.record(
                        JournalEvent::Apply,
                        MigrationStage::Applied.as_str(),
                        format!("{}: {} changed", name, changed),
                    );
                    debug!("Applied mapping to {} ({} changed)", name, changed);
                    run.report.applied.push(AppliedStore {
                        store: name.clone(),
                        changed,
                    });
                    applied.push(name);
                }
                Err(e) if applied.is_empty() => {
                    return Err(MigrationFailure::ApplyFailed {
                        store: name,
                        reason: e.to_string(),
                    });
                }
                Err(e) => {
                    return Err(MigrationFailure::PartialMigration {
                        applied,
                        failed: name,
                        reason: e.to_string(),
                    });
                }
            }
        }

        Ok(())
    }

    fn verify(
        &self,
        stores: &mut StoreSet,
        mapping: &IdentifierMapping,
        loaded: &LoadedState,
        run: &mut Run,
    ) -> std::result::Result<(), MigrationFailure> {
        stores.load_all()?;
        let after = stores.snapshots();
        let expected: Vec<StoreSnapshot> = loaded.snapshots.iter().map(|s| s.remap(mapping)).collect();

        let mut drift = Vec::new();

        // Each store must equal its own pre-migration state with ids remapped.
        for (before, now) in expected.iter().zip(&after) {
            let d = diff(before, now);
            if !d.is_empty() {
                drift.push(d);
            }
        }

        // Pairwise against the primary, ignoring mismatches that predate the run.
        if let (Some((post_primary, post_rest)), Some((pre_primary, pre_rest))) =
            (after.split_first(), expected.split_first())
        {
            let baseline = alignment(pre_primary, pre_rest);
            for (post, pre) in alignment(post_primary, post_rest).iter().zip(&baseline) {
                let fresh = post.excluding(pre);
                if !fresh.is_synchronized() {
                    drift.push(fresh);
                }
            }
        }

        let target = self.target();
        for store in stores.iter() {
            let primary_bad = store
                .identifiers()
                .into_iter()
                .filter(|id| !target.primary().matches(id));
            let slot_bad = store
                .derived_identifiers()
                .into_iter()
                .filter(|id| !target.slot().matches(id));
            run.report.format_violations.extend(primary_bad.chain(slot_bad));
        }

        if drift.is_empty() && run.report.format_violations.is_empty() {
            return Ok(());
        }

        let summary = format!(
            "{} diffs, {} identifiers outside scheme {}",
            drift.len(),
            run.report.format_violations.len(),
            target
        );
        run.report.diffs = drift;
        Err(MigrationFailure::DriftDetected { summary })
    }
}

fn apply_one(
    store: &mut dyn QuestionStore,
    mapping: &IdentifierMapping,
    target: SchemeVersion,
    now: NaiveDateTime,
) -> Result<usize> {
    let changed = store.apply_mapping(mapping, now)?;
    store.stamp_scheme(target, now);
    store.save()?;
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_transitions() {
        use MigrationStage::*;
        assert!(Loaded.can_follow(None));
        assert!(Mapped.can_follow(Some(Loaded)));
        assert!(Verified.can_follow(Some(Applied)));
        assert!(Failed.can_follow(Some(BackedUp)));
        assert!(!Applied.can_follow(Some(Loaded)));
        assert!(!Failed.can_follow(Some(Verified)));
        assert!(!Mapped.can_follow(None));
    }

    #[test]
    fn test_scheme_upgrade_preserves_sequences() {
        let records = vec![
            PrimaryRecord::sample("ABAA-01", "관계법령", 20),
            PrimaryRecord::sample("ABAA-02", "관계법령", 21),
            PrimaryRecord::sample("ABAA-03", "관계법령", 20),
            PrimaryRecord::sample("ABBA-07", "손보1부", 20),
        ];
        let strategy = SchemeUpgrade::new(SchemeVersion::V2, SequencePolicy::Preserve);
        let proposed = strategy.propose(&records, &mut UsedSet::new()).unwrap();

        let new: Vec<_> = proposed.pairs.iter().map(|(_, n)| n.as_str()).collect();
        assert_eq!(new, ["AB20AA-01", "AB21AA-02", "AB20AA-03", "AB20BA-07"]);
    }

    #[test]
    fn test_scheme_upgrade_renumber() {
        let records = vec![
            PrimaryRecord::sample("ABAA-01", "관계법령", 20),
            PrimaryRecord::sample("ABAA-02", "관계법령", 21),
            PrimaryRecord::sample("ABAA-03", "관계법령", 20),
        ];
        let strategy = SchemeUpgrade::new(SchemeVersion::V2, SequencePolicy::Renumber);
        let proposed = strategy.propose(&records, &mut UsedSet::new()).unwrap();

        let new: Vec<_> = proposed.pairs.iter().map(|(_, n)| n.as_str()).collect();
        assert_eq!(new, ["AB20AA-01", "AB21AA-01", "AB20AA-02"]);
    }

    #[test]
    fn test_conforming_identifiers_map_to_themselves() {
        let records = vec![
            PrimaryRecord::sample("AB20AA-05", "관계법령", 20),
            PrimaryRecord::sample("ABAA-05", "관계법령", 20),
        ];
        let strategy = SchemeUpgrade::new(SchemeVersion::V2, SequencePolicy::Preserve);
        let mut used = UsedSet::seed_from(["AB20AA-05"]);
        let proposed = strategy.propose(&records, &mut used).unwrap();

        assert_eq!(proposed.pairs[0], ("AB20AA-05".to_string(), "AB20AA-05".to_string()));
        assert_eq!(proposed.pairs[1], ("ABAA-05".to_string(), "AB20AA-01".to_string()));
    }

    #[test]
    fn test_failure_round_trips_through_error() {
        let failure = MigrationFailure::from(QcodeError::CountMismatch {
            left: "master".to_string(),
            left_count: 1440,
            right: "slots".to_string(),
            right_count: 1438,
        });
        assert!(matches!(failure, MigrationFailure::CountMismatch { left_count: 1440, .. }));
        assert!(matches!(
            failure.into_error(),
            QcodeError::CountMismatch { right_count: 1438, .. }
        ));
    }
}
