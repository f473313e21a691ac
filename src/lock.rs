//! Persistent rollback locks.
//!
//! A lock file blocks every further guarded apply until an operator removes
//! it. The guarded apply path writes locks but never clears them.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Why a lock was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LockReason {
    /// The diff could not be applied.
    ApplyFailed,
    /// The diff adds credential-like values.
    SecretScanFailed,
    /// A validation gate failed.
    GateFailed,
}

impl LockReason {
    /// Wire name of the reason.
    pub fn as_str(&self) -> &'static str {
        match self {
            LockReason::ApplyFailed => "apply-failed",
            LockReason::SecretScanFailed => "secret-scan-failed",
            LockReason::GateFailed => "gate-failed",
        }
    }
}

impl fmt::Display for LockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Contents of a lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    /// Why the lock was written.
    pub reason: LockReason,
    /// Gate that failed, for gate failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_gate: Option<String>,
    /// When the lock was written.
    pub created_at: DateTime<Utc>,
    /// Revision the repository was rolled back to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head: Option<String>,
    /// Guarded apply run that wrote the lock.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    /// Short human-readable detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl LockRecord {
    /// Creates a record stamped with the current time.
    pub fn new(reason: LockReason) -> Self {
        Self {
            reason,
            failed_gate: None,
            created_at: Utc::now(),
            head: None,
            run_id: None,
            detail: None,
        }
    }

    /// Sets the failed gate.
    pub fn with_failed_gate(mut self, gate: impl Into<String>) -> Self {
        self.failed_gate = Some(gate.into());
        self
    }

    /// Sets the rolled-back revision.
    pub fn with_head(mut self, head: impl Into<String>) -> Self {
        self.head = Some(head.into());
        self
    }

    /// Sets the run id.
    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    /// Sets the detail message.
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Lock file location and access for one repository.
#[derive(Debug, Clone)]
pub struct LockStore {
    path: PathBuf,
}

impl LockStore {
    /// Lock store at `<repo>/<control_dir>/locks/rollback.lock`.
    pub fn new(repo: &Path, control_dir: &str) -> Self {
        Self {
            path: Self::lock_file_path(repo, control_dir),
        }
    }

    /// Well-known lock path for a repository.
    pub fn lock_file_path(repo: &Path, control_dir: &str) -> PathBuf {
        repo.join(control_dir).join("locks").join("rollback.lock")
    }

    /// Returns the lock file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Presence of the file is the lock; its contents are informational.
    pub fn is_locked(&self) -> bool {
        self.path.exists()
    }

    /// Fails with [`Error::LockActive`] if a lock is present.
    pub fn ensure_unlocked(&self) -> Result<()> {
        if self.is_locked() {
            return Err(Error::LockActive(self.path.clone()));
        }
        Ok(())
    }

    /// Reads the current lock, if any.
    pub fn read(&self) -> Result<Option<LockRecord>> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Writes a new lock atomically. An existing lock is never replaced.
    pub fn write(&self, record: &LockRecord) -> Result<()> {
        self.ensure_unlocked()?;

        let dir = self
            .path
            .parent()
            .ok_or_else(|| Error::Config(format!("invalid lock path {}", self.path.display())))?;
        std::fs::create_dir_all(dir)?;

        let tmp = dir.join(format!(".rollback.lock.{}", uuid::Uuid::new_v4().simple()));
        std::fs::write(&tmp, serde_json::to_string_pretty(record)?)?;
        if let Err(e) = std::fs::rename(&tmp, &self.path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }

        tracing::warn!(
            path = ?self.path,
            reason = %record.reason,
            failed_gate = record.failed_gate.as_deref().unwrap_or(""),
            "rollback lock written"
        );
        Ok(())
    }

    /// Removes the lock. Operator action only.
    ///
    /// Returns true if a lock was removed.
    pub fn clear(&self) -> Result<bool> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::info!(path = ?self.path, "rollback lock cleared");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
