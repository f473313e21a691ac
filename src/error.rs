//! Error types for patch-fortress.

use std::path::PathBuf;
use thiserror::Error;

use crate::sandbox::QuotaKind;

/// Top-level error type for sandbox, gate, apply and rerank operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A sandboxed command exceeded its wall-clock budget and was killed.
    #[error("sandboxed command timed out after {timeout_s} seconds")]
    SandboxTimeout { timeout_s: u64 },

    /// A sandboxed command hit a CPU or memory ceiling.
    #[error("sandboxed command exceeded its {kind} quota")]
    SandboxQuotaExceeded { kind: QuotaKind },

    /// A sandboxed command tried to reach the network while it was disabled.
    #[error("network disabled: command attempted network access")]
    NetworkDisabledViolation,

    /// The diff could not be applied to the working tree.
    #[error("failed to apply diff: {0}")]
    DiffApply(String),

    /// A validation gate failed.
    #[error("gate '{0}' failed")]
    GateFailure(String),

    /// The secret scanner found credential-like values in added lines.
    #[error("secret scan found {0} violation(s)")]
    SecretScanViolation(usize),

    /// A rollback lock is present; no apply was attempted.
    #[error("workspace locked by rollback: {0}")]
    LockActive(PathBuf),

    /// A candidate generator failed or produced an unusable diff.
    #[error("invalid candidate: {0}")]
    InvalidCandidate(String),

    /// Git operation failed.
    #[error("git operation failed: {0}")]
    Git(String),

    /// Restoring the snapshot failed; the workspace needs manual attention.
    #[error("rollback failed: {0}")]
    Rollback(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Failed to serialize or deserialize a persisted record.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Stable reason code carried by result objects.
    pub fn code(&self) -> &'static str {
        match self {
            Error::SandboxTimeout { .. } => "sandbox-timeout",
            Error::SandboxQuotaExceeded { .. } => "sandbox-quota-exceeded",
            Error::NetworkDisabledViolation => "network-disabled",
            Error::DiffApply(_) => "apply-failed",
            Error::GateFailure(_) => "gate-failed",
            Error::SecretScanViolation(_) => "secret-scan-failed",
            Error::LockActive(_) => "locked",
            Error::InvalidCandidate(_) => "invalid-candidate",
            Error::Git(_) => "git",
            Error::Rollback(_) => "rollback-failed",
            Error::Io(_) => "io",
            Error::Config(_) => "config",
            Error::Serialization(_) => "serialization",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Result type alias for patch-fortress operations.
pub type Result<T> = std::result::Result<T, Error>;
