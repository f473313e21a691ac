//! Sandboxed execution and disposable workspaces.
//!
//! [`CommandExecutor`] is the single `run(command, quota)` capability used by
//! the gate runner; [`ProcessSandbox`] implements it with OS processes.
//! [`WorkspaceProvider`] hands out isolated repository copies for reranking.

mod executor;
mod limits;
pub mod network;
mod provider;
mod quota;
mod worktree;

pub use executor::{
    CommandExecutor, Outcome, ProcessSandbox, SandboxOutput, QUOTA_EXIT_CODE, TIMEOUT_EXIT_CODE,
};
pub use network::{NETWORK_DENIED_EXIT_CODE, NETWORK_DISABLED_MARKER};
pub use provider::{Workspace, WorkspaceProvider};
pub use quota::{Quota, QuotaKind, SandboxConfig};
pub use worktree::{WorktreeProvider, WorktreeWorkspace};
