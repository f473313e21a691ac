//! Guarded apply states and transition tracking.

use std::fmt;

use serde::{Deserialize, Serialize};

/// States of one guarded apply invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApplyState {
    /// Not running.
    Idle,
    /// Checking for an existing rollback lock.
    LockCheck,
    /// Snapshotting and applying the diff.
    Applying,
    /// Scanning added lines for secrets.
    Scanning,
    /// Running gates in short-circuit mode.
    Gating,
    /// Accepting the patched tree.
    Commit,
    /// Restoring the snapshot.
    Rollback,
    /// Writing the rollback lock.
    LockSet,
}

impl ApplyState {
    /// Upper-case name as used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplyState::Idle => "IDLE",
            ApplyState::LockCheck => "LOCK_CHECK",
            ApplyState::Applying => "APPLYING",
            ApplyState::Scanning => "SCANNING",
            ApplyState::Gating => "GATING",
            ApplyState::Commit => "COMMIT",
            ApplyState::Rollback => "ROLLBACK",
            ApplyState::LockSet => "LOCK_SET",
        }
    }

    /// Whether `next` may follow `self`.
    pub fn can_transition_to(self, next: ApplyState) -> bool {
        use ApplyState::*;
        matches!(
            (self, next),
            (Idle, LockCheck)
                | (LockCheck, Applying)
                | (LockCheck, Idle)
                | (Applying, Scanning)
                | (Applying, Rollback)
                | (Scanning, Gating)
                | (Scanning, Rollback)
                | (Gating, Commit)
                | (Gating, Rollback)
                | (Commit, Idle)
                | (Commit, Rollback)
                | (Rollback, LockSet)
                | (Rollback, Idle)
                | (LockSet, Idle)
        )
    }
}

impl fmt::Display for ApplyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current state plus the path taken to reach it.
#[derive(Debug, Clone)]
pub struct StateMachine {
    run_id: String,
    current: ApplyState,
    history: Vec<ApplyState>,
}

impl StateMachine {
    /// Starts in [`ApplyState::Idle`].
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            current: ApplyState::Idle,
            history: vec![ApplyState::Idle],
        }
    }

    /// Current state.
    pub fn current(&self) -> ApplyState {
        self.current
    }

    /// Every state visited, in order.
    pub fn history(&self) -> &[ApplyState] {
        &self.history
    }

    /// Moves to `next` and records it.
    pub fn advance(&mut self, next: ApplyState) {
        if !self.current.can_transition_to(next) {
            tracing::error!(
                run_id = %self.run_id,
                from = %self.current,
                to = %next,
                "unexpected guarded apply transition"
            );
            debug_assert!(false, "invalid transition {} -> {}", self.current, next);
        }
        tracing::debug!(run_id = %self.run_id, from = %self.current, to = %next, "transition");
        self.current = next;
        self.history.push(next);
    }

    /// Consumes the machine and returns the visited states.
    pub fn into_history(self) -> Vec<ApplyState> {
        self.history
    }
}
