//! Patch Fortress - guarded application and reranking of machine-generated patches
//!
//! This library applies untrusted diffs to a git repository behind a
//! sandboxed gate pipeline and a mandatory secret scan, rolling back
//! byte-for-byte and locking the repository on failure. It also evaluates
//! competing candidate patches in disposable worktrees and picks a
//! deterministic winner.

pub mod config;
pub mod diff;
pub mod error;
pub mod gates;
pub mod git;
pub mod guard;
pub mod lock;
pub mod rerank;
pub mod sandbox;
pub mod secrets;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::{FortressConfig, Validate, ValidationResult};
pub use error::{Error, Result};
pub use gates::{GateReport, GateResult, GateRunner, GateSpec};
pub use guard::{ApplyResult, ApplyState, GuardedApply};
pub use lock::{LockReason, LockRecord, LockStore};
pub use rerank::{
    Candidate, CandidateEvaluator, CandidateGenerator, EvaluationReport, GateCheck, RerankConfig,
    RerankResult, Reranker, WorkspaceEvaluator,
};
pub use sandbox::{
    CommandExecutor, Outcome, ProcessSandbox, Quota, QuotaKind, SandboxConfig, SandboxOutput,
};
pub use secrets::{SecretScanner, Violation};
