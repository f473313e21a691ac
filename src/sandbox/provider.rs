//! Disposable workspace provider traits.

use std::path::{Path, PathBuf};

use crate::error::Result;

/// An isolated, disposable copy of a repository.
///
/// Evaluations mutate the workspace freely; the original tree is never touched.
pub trait Workspace: Send + Sync {
    /// Returns the root directory of the workspace.
    fn path(&self) -> &Path;

    /// Removes the workspace and all of its resources.
    fn cleanup(&mut self) -> Result<()>;
}

/// Provider for disposable workspaces derived from one repository.
pub trait WorkspaceProvider: Send + Sync {
    /// The type of workspace this provider creates.
    type Workspace: Workspace + 'static;

    /// Creates a fresh workspace at the repository's current revision.
    fn create(&self) -> Result<Self::Workspace>;

    /// Returns the path to the source repository.
    fn repo_path(&self) -> &PathBuf;
}
