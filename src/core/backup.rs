//! Timestamped pre-mutation backups of store files
//!
//! Every store file is copied before the engine writes to it:
//!
//! - Name: `{stem}_backup_{YYYYmmdd_HHMMSS}.{ext}` (a `_{n}` counter is added
//!   if that name is taken)
//! - Location: next to the source, or in a configured backup directory
//! - Verification: SHA-256 of the copy must equal SHA-256 of the source,
//!   otherwise the backup is rejected before anything destructive happens

use crate::core::error::{QcodeError, Result};
use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// A verified backup copy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    /// Store the backup belongs to
    pub store: String,

    /// File that was copied
    pub source: PathBuf,

    /// Where the copy lives
    pub backup_path: PathBuf,

    /// When the copy was taken
    pub created_at: NaiveDateTime,

    /// Hex SHA-256 of the copied bytes
    pub sha256: String,

    /// Copy size in bytes
    pub size_bytes: u64,
}

/// Creates, lists, restores and prunes backups
#[derive(Debug, Clone, Default)]
pub struct BackupManager {
    /// Backup directory; `None` places backups next to their source
    backup_dir: Option<PathBuf>,
}

impl BackupManager {
    /// Backups next to each source file
    pub fn new() -> Self {
        Self::default()
    }

    /// Backups collected in one directory (created if missing)
    pub fn with_dir<P: AsRef<Path>>(backup_dir: P) -> Result<Self> {
        let backup_dir = backup_dir.as_ref().to_path_buf();
        if !backup_dir.exists() {
            std::fs::create_dir_all(&backup_dir)?;
        }
        Ok(BackupManager {
            backup_dir: Some(backup_dir),
        })
    }

    fn target_dir(&self, source: &Path) -> PathBuf {
        match &self.backup_dir {
            Some(dir) => dir.clone(),
            None => source
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
        }
    }

    fn stem_and_ext(source: &Path) -> (String, String) {
        let stem = source
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("store")
            .to_string();
        let ext = source
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or("json")
            .to_string();
        (stem, ext)
    }

    /// Copy `source` to a fresh timestamped name and verify the copy
    ///
    /// # Errors
    ///
    /// Any failure is reported as `BackupFailure` for `store`.
    pub fn backup_file(&self, store: &str, source: &Path) -> Result<BackupRecord> {
        let failure = |reason: String| QcodeError::BackupFailure {
            store: store.to_string(),
            reason,
        };

        if !source.is_file() {
            return Err(failure(format!("source {:?} does not exist", source)));
        }

        let now = Local::now().naive_local();
        let (stem, ext) = Self::stem_and_ext(source);
        let dir = self.target_dir(source);
        let base = format!("{}_backup_{}", stem, now.format("%Y%m%d_%H%M%S"));

        let mut backup_path = dir.join(format!("{}.{}", base, ext));
        let mut counter = 1;
        while backup_path.exists() {
            backup_path = dir.join(format!("{}_{}.{}", base, counter, ext));
            counter += 1;
        }

        let size_bytes = std::fs::copy(source, &backup_path)
            .map_err(|e| failure(format!("copy to {:?} failed: {}", backup_path, e)))?;

        let source_digest = file_digest(source).map_err(|e| failure(e.to_string()))?;
        let backup_digest = file_digest(&backup_path).map_err(|e| failure(e.to_string()))?;
        if source_digest != backup_digest {
            return Err(failure(format!(
                "checksum mismatch between {:?} and {:?}",
                source, backup_path
            )));
        }

        info!("Backed up {} to {:?}", store, backup_path);

        Ok(BackupRecord {
            store: store.to_string(),
            source: source.to_path_buf(),
            backup_path,
            created_at: now,
            sha256: source_digest,
            size_bytes,
        })
    }

    /// Existing backups of `source`, oldest first
    pub fn list_backups(&self, source: &Path) -> Result<Vec<PathBuf>> {
        let (stem, ext) = Self::stem_and_ext(source);
        let prefix = format!("{}_backup_", stem);
        let suffix = format!(".{}", ext);
        let dir = self.target_dir(source);

        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut backups: Vec<PathBuf> = std::fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with(&prefix) && n.ends_with(&suffix))
                    .unwrap_or(false)
            })
            .collect();

        // Timestamped names sort chronologically.
        backups.sort();
        Ok(backups)
    }

    /// Copy a backup back over its source, verifying the result
    pub fn restore(&self, record: &BackupRecord) -> Result<()> {
        let digest = file_digest(&record.backup_path)?;
        if digest != record.sha256 {
            return Err(QcodeError::BackupFailure {
                store: record.store.clone(),
                reason: format!("backup {:?} no longer matches its checksum", record.backup_path),
            });
        }

        std::fs::copy(&record.backup_path, &record.source)?;
        info!("Restored {} from {:?}", record.store, record.backup_path);
        Ok(())
    }

    /// Delete all but the `keep` most recent backups of `source`
    pub fn prune(&self, source: &Path, keep: usize) -> Result<Vec<PathBuf>> {
        let backups = self.list_backups(source)?;
        let excess = backups.len().saturating_sub(keep);

        let mut deleted = Vec::new();
        for path in backups.into_iter().take(excess) {
            std::fs::remove_file(&path)?;
            debug!("Pruned backup {:?}", path);
            deleted.push(path);
        }

        Ok(deleted)
    }
}

/// Hex SHA-256 of a file's contents
pub fn file_digest(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}
