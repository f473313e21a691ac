//! Git worktree-based disposable workspaces.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::git;

use super::provider::{Workspace, WorkspaceProvider};

/// A detached git worktree used for one candidate evaluation.
///
/// Removed on [`cleanup`](Workspace::cleanup) or drop.
pub struct WorktreeWorkspace {
    /// Path to the worktree directory.
    path: PathBuf,
    /// Path to the parent git repository.
    repo_path: PathBuf,
    /// Whether the worktree has been removed.
    cleaned_up: bool,
    /// Serializes worktree bookkeeping in the parent repository.
    git_lock: Arc<Mutex<()>>,
}

impl Workspace for WorktreeWorkspace {
    fn path(&self) -> &Path {
        &self.path
    }

    fn cleanup(&mut self) -> Result<()> {
        if self.cleaned_up {
            return Ok(());
        }

        // Must run from the parent repo
        let _guard = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());
        let output = Command::new("git")
            .current_dir(&self.repo_path)
            .args(["worktree", "remove", "--force"])
            .arg(&self.path)
            .output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Git(format!(
                "git worktree remove {} failed: {}",
                self.path.display(),
                stderr.trim()
            )));
        }

        self.cleaned_up = true;
        tracing::debug!(path = ?self.path, "removed evaluation worktree");
        Ok(())
    }
}

impl Drop for WorktreeWorkspace {
    fn drop(&mut self) {
        if !self.cleaned_up {
            if let Err(e) = self.cleanup() {
                tracing::error!(error = %e, path = ?self.path, "failed to cleanup worktree on drop");
            }
        }
    }
}

/// Provider that creates detached worktrees mirroring the working tree.
///
/// Each worktree starts at HEAD and then receives the repository's
/// uncommitted and untracked files, so candidates see the same tree a
/// guarded apply would patch.
#[derive(Clone)]
pub struct WorktreeProvider {
    /// Path to the git repository.
    repo_path: PathBuf,
    /// Base directory for worktrees. If None, uses a temp directory.
    base_dir: Option<PathBuf>,
    /// Repository-relative directories never mirrored into a worktree.
    excluded: Vec<String>,
    /// Counter for unique directory names (shared across clones).
    counter: Arc<AtomicU64>,
    /// Held while git updates `.git/worktrees`.
    git_lock: Arc<Mutex<()>>,
}

impl WorktreeProvider {
    /// Creates a provider for `repo_path`.
    ///
    /// Worktrees go under `base_dir` if given, otherwise under the system temp directory.
    pub fn new(repo_path: PathBuf, base_dir: Option<PathBuf>) -> Self {
        Self {
            repo_path,
            base_dir,
            excluded: Vec::new(),
            counter: Arc::new(AtomicU64::new(0)),
            git_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Skips `dir` (e.g. the control directory) when mirroring local changes.
    pub fn with_excluded(mut self, dir: impl Into<String>) -> Self {
        let dir = dir.into();
        let dir = dir.trim_end_matches('/');
        if !dir.is_empty() {
            self.excluded.push(dir.to_string());
        }
        self
    }

    fn is_excluded(&self, path: &str) -> bool {
        self.excluded.iter().any(|dir| {
            path == dir
                || path
                    .strip_prefix(dir.as_str())
                    .is_some_and(|rest| rest.starts_with('/'))
        })
    }

    /// Copies every dirty or untracked path of the repository into `worktree`.
    fn mirror_local_changes(&self, worktree: &Path) -> Result<usize> {
        let mut mirrored = 0;
        for rel in git::dirty_paths(&self.repo_path)? {
            if self.is_excluded(&rel) {
                continue;
            }
            let source = self.repo_path.join(&rel);
            let target = worktree.join(&rel);

            let meta = match std::fs::symlink_metadata(&source) {
                Ok(meta) => meta,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    match std::fs::remove_file(&target) {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                    mirrored += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            if meta.is_dir() {
                continue;
            }

            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            if std::fs::symlink_metadata(&target).is_ok() {
                std::fs::remove_file(&target)?;
            }
            if meta.file_type().is_symlink() {
                copy_symlink(&source, &target)?;
            } else {
                std::fs::copy(&source, &target)?;
            }
            mirrored += 1;
        }
        Ok(mirrored)
    }

    fn generate_name(&self) -> String {
        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        let short = uuid::Uuid::new_v4().simple().to_string();
        format!("rerank-{}-{}", &short[..8], id)
    }

    fn worktree_path(&self, name: &str) -> Result<PathBuf> {
        let base = match &self.base_dir {
            Some(dir) => dir.clone(),
            None => std::env::temp_dir().join("patch-fortress-workspaces"),
        };
        std::fs::create_dir_all(&base)?;
        Ok(base.join(name))
    }
}

impl WorkspaceProvider for WorktreeProvider {
    type Workspace = WorktreeWorkspace;

    fn repo_path(&self) -> &PathBuf {
        &self.repo_path
    }

    fn create(&self) -> Result<Self::Workspace> {
        let name = self.generate_name();
        let path = self.worktree_path(&name)?;

        let output = {
            let _guard = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());
            Command::new("git")
                .current_dir(&self.repo_path)
                .args(["worktree", "add", "--detach"])
                .arg(&path)
                .arg("HEAD")
                .output()?
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Git(format!(
                "git worktree add failed: {}",
                stderr.trim()
            )));
        }

        let mut workspace = WorktreeWorkspace {
            path,
            repo_path: self.repo_path.clone(),
            cleaned_up: false,
            git_lock: Arc::clone(&self.git_lock),
        };

        match self.mirror_local_changes(&workspace.path) {
            Ok(mirrored) => {
                tracing::debug!(path = ?workspace.path, mirrored, "created evaluation worktree");
                Ok(workspace)
            }
            Err(e) => {
                if let Err(cleanup) = workspace.cleanup() {
                    tracing::warn!(error = %cleanup, "failed to remove half-built worktree");
                }
                Err(e)
            }
        }
    }
}

#[cfg(unix)]
fn copy_symlink(source: &Path, target: &Path) -> Result<()> {
    let link = std::fs::read_link(source)?;
    std::os::unix::fs::symlink(link, target)?;
    Ok(())
}

#[cfg(not(unix))]
fn copy_symlink(source: &Path, target: &Path) -> Result<()> {
    std::fs::copy(source, target)?;
    Ok(())
}
