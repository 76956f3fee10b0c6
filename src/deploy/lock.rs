// ABOUTME: Run lock preventing two orchestrators from mutating the same run's state.
// ABOUTME: Uses atomic file creation next to the state file, with stale-lock breaking.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use super::DeployError;
use crate::types::RunId;

/// Information about who holds a run lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    /// Hostname of the machine that holds the lock.
    pub holder: String,
    /// Process ID of the lock holder.
    pub pid: u32,
    /// When the lock was acquired.
    pub started_at: DateTime<Utc>,
    /// Run being orchestrated.
    pub run_id: String,
}

impl LockInfo {
    /// Create new lock info for the current process.
    pub fn new(run_id: &RunId) -> Self {
        Self {
            holder: gethostname::gethostname().to_string_lossy().into_owned(),
            pid: std::process::id(),
            started_at: Utc::now(),
            run_id: run_id.to_string(),
        }
    }

    /// Check if this lock is stale (older than 1 hour).
    pub fn is_stale(&self) -> bool {
        let age = Utc::now() - self.started_at;
        age.num_hours() >= 1
    }

    /// Path to the lock file for a run.
    pub fn lock_path(state_dir: &Path, run_id: &RunId) -> PathBuf {
        state_dir.join(format!("{}.lock", run_id))
    }
}

/// A held run lock that releases on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    released: bool,
}

impl RunLock {
    /// Acquire the lock for `run_id` under `state_dir`.
    ///
    /// Uses create-new semantics for atomic acquisition. Auto-breaks stale
    /// locks (>1 hour) and corrupted lock files with a warning; `force` breaks
    /// any lock.
    pub fn acquire(state_dir: &Path, run_id: &RunId, force: bool) -> Result<Self, DeployError> {
        fs::create_dir_all(state_dir)
            .map_err(|e| DeployError::Lock(format!("failed to create state directory: {}", e)))?;

        let path = LockInfo::lock_path(state_dir, run_id);
        let info = LockInfo::new(run_id);

        if Self::try_create(&path, &info)? {
            return Ok(Self {
                path,
                released: false,
            });
        }

        if !Self::should_break(&path, force)? {
            return match Self::read_info(&path) {
                Some(existing) => Err(DeployError::LockHeld {
                    holder: existing.holder,
                    pid: existing.pid,
                    since: existing.started_at,
                }),
                None => Err(DeployError::Lock("lock held by another process".to_string())),
            };
        }

        tracing::debug!("Removing stale/forced lock at {}", path.display());
        let _ = fs::remove_file(&path);

        if !Self::try_create(&path, &info)? {
            return Err(DeployError::Lock(
                "lock acquired by another process during break".to_string(),
            ));
        }

        Ok(Self {
            path,
            released: false,
        })
    }

    fn try_create(path: &Path, info: &LockInfo) -> Result<bool, DeployError> {
        let json = serde_json::to_string(info)
            .map_err(|e| DeployError::Lock(format!("failed to serialize lock: {}", e)))?;

        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                file.write_all(json.as_bytes())
                    .map_err(|e| DeployError::Lock(format!("failed to write lock: {}", e)))?;
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(DeployError::Lock(format!("failed to acquire lock: {}", e))),
        }
    }

    fn read_info(path: &Path) -> Option<LockInfo> {
        fs::read_to_string(path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
    }

    /// Check if an existing lock should be broken (stale, forced, or corrupted).
    fn should_break(path: &Path, force: bool) -> Result<bool, DeployError> {
        match Self::read_info(path) {
            Some(existing) if force => {
                tracing::warn!(
                    "Breaking lock held by {} (pid {}) since {}",
                    existing.holder,
                    existing.pid,
                    existing.started_at
                );
                Ok(true)
            }
            Some(existing) if existing.is_stale() => {
                tracing::warn!(
                    "Auto-breaking stale lock held by {} (pid {}) since {}",
                    existing.holder,
                    existing.pid,
                    existing.started_at
                );
                Ok(true)
            }
            Some(_) => Ok(false),
            None => {
                tracing::warn!("Lock info unreadable or corrupted, breaking lock");
                Ok(true)
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the lock.
    pub fn release(mut self) -> Result<(), DeployError> {
        self.released = true;
        fs::remove_file(&self.path)
            .map_err(|e| DeployError::Lock(format!("failed to release lock: {}", e)))
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if !self.released {
            let _ = fs::remove_file(&self.path);
        }
    }
}
