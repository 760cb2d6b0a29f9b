use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QcodeError {
    #[error("Sequence capacity exceeded: more than {max} identifiers share prefix '{prefix}'")]
    SequenceCapacityExceeded { prefix: String, max: u8 },

    #[error("Invalid slot tag: {0} (expected one of B1..B8)")]
    InvalidSlot(String),

    #[error("Slot {0} cannot be filled with empty question or answer text")]
    EmptySlotContent(String),

    #[error("Record count mismatch: {left} has {left_count} records, {right} has {right_count}")]
    CountMismatch {
        left: String,
        left_count: usize,
        right: String,
        right_count: usize,
    },

    #[error("Identifier mapping is not a bijection: {target} is produced by {sources:?}")]
    NonBijectiveMapping {
        target: String,
        sources: Vec<String>,
    },

    #[error("Duplicate identifiers in {store}: {identifiers:?}")]
    DuplicateIdentifiers {
        store: String,
        identifiers: Vec<String>,
    },

    #[error("Backup of store '{store}' failed: {reason}")]
    BackupFailure { store: String, reason: String },

    #[error("Applying the mapping to '{store}' failed before any store was written: {reason}")]
    ApplyFailed { store: String, reason: String },

    #[error("Partial migration: applied to {applied:?}, failed on '{failed}': {reason}")]
    PartialMigration {
        applied: Vec<String>,
        failed: String,
        reason: String,
    },

    #[error("Migration aborted: {0}")]
    Aborted(String),

    #[error("Cannot renumber while {stores:?} reference the primary store: {identifiers:?} are blank or duplicated there; assign missing identifiers first")]
    AmbiguousRenumber {
        stores: Vec<String>,
        identifiers: Vec<String>,
    },

    #[error("Stores drifted after migration: {0}")]
    DriftDetected(String),

    #[error("Stores are not aligned: {0}")]
    Misaligned(String),

    #[error("Round number is required by scheme {0}")]
    MissingRound(String),

    #[error("Invalid round number: {0} (must be 1..=99)")]
    InvalidRound(String),

    #[error("Unknown parent identifier: {0}")]
    UnknownParent(String),

    #[error("Store '{store}' cannot be used here: {reason}")]
    UnsupportedStore { store: String, reason: String },

    #[error("Stores are locked by another run: {0}")]
    StoreLocked(PathBuf),

    #[error("Unsupported config version: {0} (expected ^1)")]
    UnsupportedConfigVersion(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid migration stage transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, QcodeError>;
