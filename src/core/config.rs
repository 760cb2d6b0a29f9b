//! Run configuration
//!
//! A `qcode-sync.toml` names the scheme transition and the store files:
//!
//! ```toml
//! config_version = "1.0.0"
//!
//! [scheme]
//! current = "v1"
//! target = "v2"
//! sequence_policy = "preserve"
//!
//! [stores.primary]
//! name = "master"
//! kind = "list"
//! path = "data/questions_master.json"
//!
//! [[stores.secondary]]
//! name = "slots"
//! kind = "slotted"
//! path = "data/derived_slots.json"
//!
//! [backup]
//! dir = "backups"
//! keep = 10
//! ```
//!
//! Relative paths resolve against the directory holding the config file.

use crate::core::backup::BackupManager;
use crate::core::error::{QcodeError, Result};
use crate::core::migration::SequencePolicy;
use crate::core::scheme::SchemeVersion;
use crate::core::store::{open_store, Coverage, StoreKind, StoreSet};
use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::debug;
use validator::Validate;

/// Config documents this build understands
pub const SUPPORTED_CONFIG_VERSION: &str = "^1";

/// Lock file name used when `[lock]` gives no path
pub const DEFAULT_LOCK_FILE: &str = ".qcode-sync.lock";

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SyncConfig {
    pub config_version: Version,

    #[validate(nested)]
    pub scheme: SchemeSection,

    #[validate(nested)]
    pub stores: StoresSection,

    #[serde(default)]
    #[validate(nested)]
    pub backup: BackupSection,

    #[serde(default)]
    #[validate(nested)]
    pub lock: LockSection,

    /// Directory relative paths resolve against
    #[serde(skip)]
    base_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SchemeSection {
    /// Scheme the stores are in now; checked, not required
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<SchemeVersion>,

    pub target: SchemeVersion,

    #[serde(default)]
    pub sequence_policy: SequencePolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct StoresSection {
    #[validate(nested)]
    pub primary: StoreSpec,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[validate(nested)]
    pub secondary: Vec<StoreSpec>,
}

/// One store file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct StoreSpec {
    #[validate(length(min = 1, max = 64))]
    pub name: String,

    pub kind: StoreKind,

    #[validate(length(min = 1))]
    pub path: String,

    #[serde(default)]
    pub coverage: Coverage,
}

impl StoreSpec {
    pub fn new(name: impl Into<String>, kind: StoreKind, path: impl Into<String>) -> Self {
        StoreSpec {
            name: name.into(),
            kind,
            path: path.into(),
            coverage: Coverage::Full,
        }
    }

    pub fn with_coverage(mut self, coverage: Coverage) -> Self {
        self.coverage = coverage;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct BackupSection {
    /// Backup directory; next to each store file when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(min = 1))]
    pub dir: Option<String>,

    /// Backups kept per store by `prune`
    #[serde(default = "default_keep")]
    #[validate(range(min = 1, max = 100))]
    pub keep: usize,
}

fn default_keep() -> usize {
    10
}

impl Default for BackupSection {
    fn default() -> Self {
        BackupSection {
            dir: None,
            keep: default_keep(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct LockSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(min = 1))]
    pub path: Option<String>,
}

impl SyncConfig {
    /// Minimal config: one primary store and a target scheme
    pub fn new(primary: StoreSpec, target: SchemeVersion) -> Self {
        SyncConfig {
            config_version: Version::new(1, 0, 0),
            scheme: SchemeSection {
                current: None,
                target,
                sequence_policy: SequencePolicy::default(),
            },
            stores: StoresSection {
                primary,
                secondary: Vec::new(),
            },
            backup: BackupSection::default(),
            lock: LockSection::default(),
            base_dir: None,
        }
    }

    /// Parse and check a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: SyncConfig = toml::from_str(text)?;
        config.check()?;
        Ok(config)
    }

    /// Load from a file; relative store paths resolve next to it
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&text)?;
        config.base_dir = path.parent().map(Path::to_path_buf);
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| QcodeError::Config(e.to_string()))
    }

    pub fn with_base_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.base_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Version gate, field validation, and cross-field rules
    pub fn check(&self) -> Result<()> {
        let supported = VersionReq::parse(SUPPORTED_CONFIG_VERSION)
            .map_err(|e| QcodeError::Config(e.to_string()))?;
        if !supported.matches(&self.config_version) {
            return Err(QcodeError::UnsupportedConfigVersion(
                self.config_version.to_string(),
            ));
        }

        self.validate()
            .map_err(|e| QcodeError::Config(e.to_string()))?;

        let primary = &self.stores.primary;
        if !primary.kind.holds_primary_records() {
            return Err(QcodeError::Config(format!(
                "primary store '{}' must be a list or dict store, not {}",
                primary.name, primary.kind
            )));
        }

        let mut names = BTreeSet::new();
        for spec in self.store_specs() {
            if !names.insert(spec.name.as_str()) {
                return Err(QcodeError::Config(format!(
                    "store name '{}' is used more than once",
                    spec.name
                )));
            }
        }

        Ok(())
    }

    /// Primary spec first, then secondaries in file order
    pub fn store_specs(&self) -> impl Iterator<Item = &StoreSpec> {
        std::iter::once(&self.stores.primary).chain(self.stores.secondary.iter())
    }

    pub fn resolve<P: AsRef<Path>>(&self, path: P) -> PathBuf {
        let path = path.as_ref();
        match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }

    /// Open and load every configured store
    pub fn open_stores(&self) -> Result<StoreSet> {
        let primary = &self.stores.primary;
        let mut set = StoreSet::new(open_store(
            primary.kind,
            &primary.name,
            self.resolve(&primary.path),
            primary.coverage,
        )?)?;

        for spec in &self.stores.secondary {
            set.push(open_store(
                spec.kind,
                &spec.name,
                self.resolve(&spec.path),
                spec.coverage,
            )?);
        }
        Ok(set)
    }

    pub fn backup_manager(&self) -> Result<BackupManager> {
        match &self.backup.dir {
            Some(dir) => BackupManager::with_dir(self.resolve(dir)),
            None => Ok(BackupManager::new()),
        }
    }

    /// Configured lock path, or a lock file beside the primary store
    pub fn lock_path(&self) -> PathBuf {
        match &self.lock.path {
            Some(path) => self.resolve(path),
            None => {
                let primary = self.resolve(&self.stores.primary.path);
                primary
                    .parent()
                    .map(|dir| dir.join(DEFAULT_LOCK_FILE))
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_LOCK_FILE))
            }
        }
    }
}
