//! Guarded apply: apply, scan, gate, then commit or roll back.
//!
//! A call ends in exactly one of two repository states: the patch committed,
//! or the tree restored byte-for-byte to the pre-call snapshot. Secret and
//! gate failures (and, by default, unapplicable diffs) leave a rollback lock
//! that refuses every later call until an operator clears it.

mod apply;
mod snapshot;
mod state;

pub use apply::{ApplyResult, GuardedApply};
pub use snapshot::Snapshot;
pub use state::{ApplyState, StateMachine};
