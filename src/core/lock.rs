//! Run-level lock over the store files
//!
//! Only one generation or migration run may touch the stores at a time.
//! The lock is a file created with `create_new`, so acquiring it is atomic
//! on every platform; it is removed when the [`RunLock`] is dropped.

use crate::core::error::{QcodeError, Result};
use crate::core::record::format_timestamp;
use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Contents of the lock file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub acquired_at: String,
    pub purpose: String,
}

/// Exclusive hold on the store triad
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    info: LockInfo,
}

impl RunLock {
    /// Take the lock, failing with `StoreLocked` if another run holds it
    pub fn acquire<P: AsRef<Path>>(path: P, purpose: &str) -> Result<Self> {
        Self::acquire_at(path, purpose, Local::now().naive_local())
    }

    pub fn acquire_at<P: AsRef<Path>>(path: P, purpose: &str, now: NaiveDateTime) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if let Some(holder) = Self::holder(&path) {
                    warn!(
                        "Lock {:?} held by pid {} since {} ({})",
                        path, holder.pid, holder.acquired_at, holder.purpose
                    );
                }
                return Err(QcodeError::StoreLocked(path));
            }
            Err(e) => return Err(e.into()),
        };

        let info = LockInfo {
            pid: std::process::id(),
            acquired_at: format_timestamp(now),
            purpose: purpose.to_string(),
        };
        file.write_all(&serde_json::to_vec_pretty(&info)?)?;
        debug!("Acquired run lock {:?} for {}", path, purpose);

        Ok(RunLock { path, info })
    }

    /// Who holds the lock at `path`, if it exists and is readable
    pub fn holder<P: AsRef<Path>>(path: P) -> Option<LockInfo> {
        let bytes = std::fs::read(path).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn info(&self) -> &LockInfo {
        &self.info
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Failed to release run lock {:?}: {}", self.path, e);
        } else {
            debug!("Released run lock {:?}", self.path);
        }
    }
}
