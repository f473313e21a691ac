//! The guarded apply state machine.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::config::FortressConfig;
use crate::diff;
use crate::error::{Error, Result};
use crate::gates::{GateResult, GateRunner};
use crate::git;
use crate::lock::{LockReason, LockRecord, LockStore};
use crate::sandbox::CommandExecutor;
use crate::secrets::{self, Violation};

use super::snapshot::{in_control_dir, Snapshot};
use super::state::{ApplyState, StateMachine};

/// Structured outcome of one guarded apply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyResult {
    /// True only if the patch was applied, passed every check and was accepted.
    pub ok: bool,
    /// True if the repository was restored to its pre-call state.
    pub rolled_back: bool,
    /// True if the call was refused because a lock already existed.
    pub locked: bool,
    /// Reason of the lock written by this call, if any.
    pub lock_reason: Option<LockReason>,
    /// First failing gate.
    pub failed_gate: Option<String>,
    /// Machine-readable failure code.
    pub error_code: Option<String>,
    /// Human-readable failure detail.
    pub message: Option<String>,
    /// Gate results in run order.
    pub gates: Vec<GateResult>,
    /// Secret scan findings (redacted).
    pub violations: Vec<Violation>,
    /// `HEAD` before the call.
    pub head_before: Option<String>,
    /// `HEAD` after the call.
    pub head_after: Option<String>,
    /// States visited.
    pub transitions: Vec<ApplyState>,
    /// Unique id of this call, also stored in any lock it writes.
    pub run_id: String,
    /// Wall-clock duration.
    pub duration_ms: u64,
}

impl ApplyResult {
    fn new(run_id: &str) -> Self {
        Self {
            ok: false,
            rolled_back: false,
            locked: false,
            lock_reason: None,
            failed_gate: None,
            error_code: None,
            message: None,
            gates: Vec::new(),
            violations: Vec::new(),
            head_before: None,
            head_after: None,
            transitions: Vec::new(),
            run_id: run_id.to_string(),
            duration_ms: 0,
        }
    }
}

/// Why a run is being rolled back.
struct Failure {
    error: Error,
    lock_reason: Option<LockReason>,
    failed_gate: Option<String>,
}

/// Applies diffs to one repository under the guard.
pub struct GuardedApply {
    repo: PathBuf,
    config: FortressConfig,
    gates: GateRunner,
    locks: LockStore,
}

impl GuardedApply {
    /// Creates a guard for `repo` that runs gates through `executor`.
    pub fn new(
        repo: impl Into<PathBuf>,
        config: FortressConfig,
        executor: Arc<dyn CommandExecutor>,
    ) -> Self {
        let repo = repo.into();
        let locks = LockStore::new(&repo, &config.control_dir);
        Self {
            repo,
            config,
            gates: GateRunner::new(executor),
            locks,
        }
    }

    /// Repository this guard mutates.
    pub fn repo(&self) -> &Path {
        &self.repo
    }

    /// Lock store for the repository.
    pub fn lock_store(&self) -> &LockStore {
        &self.locks
    }

    /// Runs `LOCK_CHECK → APPLYING → SCANNING → GATING → COMMIT | ROLLBACK`.
    ///
    /// Every guarded failure is reported in the returned [`ApplyResult`].
    /// `Err` means the repository is unusable (not a git repository) or the
    /// rollback itself could not restore the snapshot.
    pub async fn apply(&self, diff_text: &str) -> Result<ApplyResult> {
        let started = Instant::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        let mut machine = StateMachine::new(run_id.clone());
        let mut result = ApplyResult::new(&run_id);

        machine.advance(ApplyState::LockCheck);
        let repo = self.repo.clone();
        if !git::unblock(move || Ok(git::is_repository(&repo))).await? {
            return Err(Error::Git(format!(
                "{} is not a git repository",
                self.repo.display()
            )));
        }
        if self.locks.is_locked() {
            let error = Error::LockActive(self.locks.path().to_path_buf());
            tracing::warn!(run_id = %run_id, path = ?self.locks.path(), "apply refused: repository locked");
            machine.advance(ApplyState::Idle);
            result.locked = true;
            result.error_code = Some(error.code().to_string());
            result.message = Some(error.to_string());
            return Ok(self.finish(result, machine, started));
        }

        machine.advance(ApplyState::Applying);
        let touched = diff::touched_paths(diff_text);
        let path_check = self.check_paths(&touched);
        let snapshot_paths: Vec<String> = if path_check.is_ok() {
            touched.clone()
        } else {
            Vec::new()
        };
        let snapshot = {
            let repo = self.repo.clone();
            let control_dir = self.config.control_dir.clone();
            git::unblock(move || Snapshot::capture(&repo, &snapshot_paths, &control_dir)).await?
        };
        result.head_before = Some(snapshot.head().to_string());
        tracing::info!(
            run_id = %run_id,
            head = %snapshot.head(),
            files = touched.len(),
            "applying diff"
        );

        let applied = match path_check {
            Ok(()) => {
                let repo = self.repo.clone();
                let text = diff_text.to_string();
                git::unblock(move || git::apply(&repo, &text)).await
            }
            Err(e) => Err(e),
        };
        if let Err(error) = applied {
            let lock_reason = self
                .config
                .lock_on_apply_failure
                .then_some(LockReason::ApplyFailed);
            let failure = Failure {
                error,
                lock_reason,
                failed_gate: None,
            };
            return self
                .roll_back(failure, snapshot, result, machine, started)
                .await;
        }

        machine.advance(ApplyState::Scanning);
        let violations = secrets::scan(diff_text);
        if !violations.is_empty() {
            tracing::warn!(run_id = %run_id, count = violations.len(), "secrets detected, skipping gates");
            let failure = Failure {
                error: Error::SecretScanViolation(violations.len()),
                lock_reason: Some(LockReason::SecretScanFailed),
                failed_gate: None,
            };
            result.violations = violations;
            return self
                .roll_back(failure, snapshot, result, machine, started)
                .await;
        }

        machine.advance(ApplyState::Gating);
        let report = self
            .gates
            .run_gates(&self.config.gates, &self.repo, &self.config.quota)
            .await;
        let failed_gate = report.failed_gate().map(str::to_string);
        result.gates = report.results;
        if let Some(gate) = failed_gate {
            let failure = Failure {
                error: Error::GateFailure(gate.clone()),
                lock_reason: Some(LockReason::GateFailed),
                failed_gate: Some(gate),
            };
            return self
                .roll_back(failure, snapshot, result, machine, started)
                .await;
        }

        machine.advance(ApplyState::Commit);
        if let Err(error) = self.commit(touched).await {
            tracing::error!(run_id = %run_id, error = %error, "commit failed");
            let failure = Failure {
                error,
                lock_reason: None,
                failed_gate: None,
            };
            return self
                .roll_back(failure, snapshot, result, machine, started)
                .await;
        }

        result.ok = true;
        let repo = self.repo.clone();
        result.head_after = Some(git::unblock(move || git::head(&repo)).await?);
        tracing::info!(
            run_id = %run_id,
            head = result.head_after.as_deref().unwrap_or(""),
            "patch accepted"
        );
        machine.advance(ApplyState::Idle);
        Ok(self.finish(result, machine, started))
    }

    /// Rejects paths that escape the repository or touch the control directory.
    fn check_paths(&self, touched: &[String]) -> Result<()> {
        for path in touched {
            let p = Path::new(path);
            if p.is_absolute()
                || p.components()
                    .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
            {
                return Err(Error::DiffApply(format!(
                    "diff touches a path outside the repository: {}",
                    path
                )));
            }
            if in_control_dir(path, &self.config.control_dir) {
                return Err(Error::DiffApply(format!(
                    "diff touches the control directory: {}",
                    path
                )));
            }
        }
        Ok(())
    }

    async fn commit(&self, touched: Vec<String>) -> Result<()> {
        if !self.config.commit {
            return Ok(());
        }
        let repo = self.repo.clone();
        let message = self.config.commit_message.clone();
        git::unblock(move || {
            let paths: Vec<String> = touched
                .into_iter()
                .filter(|p| repo.join(p).exists() || git::is_tracked(&repo, p))
                .collect();
            git::add(&repo, &paths)?;
            git::commit(&repo, &message, &paths)?;
            Ok(())
        })
        .await
    }

    async fn roll_back(
        &self,
        failure: Failure,
        snapshot: Snapshot,
        mut result: ApplyResult,
        mut machine: StateMachine,
        started: Instant,
    ) -> Result<ApplyResult> {
        let run_id = result.run_id.clone();
        machine.advance(ApplyState::Rollback);
        tracing::warn!(
            run_id = %run_id,
            code = failure.error.code(),
            error = %failure.error,
            "rolling back"
        );

        let head = snapshot.head().to_string();
        let repo = self.repo.clone();
        let restored =
            git::unblock(move || snapshot.restore(&repo).and_then(|_| snapshot.verify(&repo))).await;

        if let Some(reason) = failure.lock_reason {
            machine.advance(ApplyState::LockSet);
            let mut record = LockRecord::new(reason)
                .with_head(&head)
                .with_run_id(&run_id)
                .with_detail(failure.error.to_string());
            if let Some(gate) = &failure.failed_gate {
                record = record.with_failed_gate(gate);
            }
            self.locks.write(&record)?;
        }

        if let Err(e) = restored {
            tracing::error!(run_id = %run_id, error = %e, "rollback did not restore the snapshot");
            return Err(e);
        }

        result.rolled_back = true;
        result.lock_reason = failure.lock_reason;
        result.failed_gate = failure.failed_gate;
        result.error_code = Some(failure.error.code().to_string());
        result.message = Some(failure.error.to_string());
        result.head_after = Some(head);
        machine.advance(ApplyState::Idle);
        Ok(self.finish(result, machine, started))
    }

    fn finish(&self, mut result: ApplyResult, machine: StateMachine, started: Instant) -> ApplyResult {
        result.transitions = machine.into_history();
        result.duration_ms = started.elapsed().as_millis() as u64;
        result
    }
}
