//! Pre-apply repository snapshots.
//!
//! A snapshot holds `HEAD` plus the exact bytes of every path the diff
//! touches and every path that was already dirty or untracked. Restoring
//! hard-resets to `HEAD`, deletes files that appeared since the capture and
//! rewrites the captured bytes, so the working tree ends byte-identical.
//! Ignored files and the control directory are outside the snapshot.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::git;

/// State of one path at capture time.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Entry {
    Missing,
    File { bytes: Vec<u8>, mode: u32 },
    Symlink(PathBuf),
    /// Directories and special files are left alone.
    Other,
}

impl Entry {
    fn read(path: &Path) -> Result<Self> {
        let meta = match std::fs::symlink_metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Entry::Missing),
            Err(e) => return Err(e.into()),
        };

        let kind = meta.file_type();
        if kind.is_symlink() {
            Ok(Entry::Symlink(std::fs::read_link(path)?))
        } else if kind.is_file() {
            Ok(Entry::File {
                bytes: std::fs::read(path)?,
                mode: file_mode(&meta),
            })
        } else {
            Ok(Entry::Other)
        }
    }

    fn write(&self, path: &Path) -> Result<()> {
        if matches!(self, Entry::Other) {
            return Ok(());
        }
        remove_path(path)?;

        match self {
            Entry::Missing | Entry::Other => Ok(()),
            Entry::File { bytes, mode } => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(path, bytes)?;
                set_file_mode(path, *mode)
            }
            Entry::Symlink(target) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                make_symlink(target, path)
            }
        }
    }
}

/// Captured pre-apply state of a repository.
#[derive(Debug, Clone)]
pub struct Snapshot {
    head: String,
    entries: BTreeMap<String, Entry>,
    control_dir: String,
}

impl Snapshot {
    /// Captures `HEAD`, the touched paths and every dirty path.
    pub fn capture(repo: &Path, touched: &[String], control_dir: &str) -> Result<Self> {
        let head = git::head(repo)?;

        let mut paths: BTreeSet<String> = touched.iter().cloned().collect();
        paths.extend(git::dirty_paths(repo)?);
        paths.retain(|p| !in_control_dir(p, control_dir));

        let mut entries = BTreeMap::new();
        for path in paths {
            let entry = Entry::read(&repo.join(&path))?;
            entries.insert(path, entry);
        }

        tracing::debug!(head = %head, paths = entries.len(), "snapshot captured");
        Ok(Self {
            head,
            entries,
            control_dir: control_dir.to_string(),
        })
    }

    /// Revision captured.
    pub fn head(&self) -> &str {
        &self.head
    }

    /// Number of paths whose bytes were captured.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no path bytes were captured.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Puts the repository back to the captured state.
    pub fn restore(&self, repo: &Path) -> Result<()> {
        git::reset_hard(repo, &self.head)
            .map_err(|e| Error::Rollback(format!("reset to {} failed: {}", self.head, e)))?;

        // after the reset only untracked files can still be dirty
        for path in git::dirty_paths(repo)? {
            if in_control_dir(&path, &self.control_dir) || self.entries.contains_key(&path) {
                continue;
            }
            let full = repo.join(&path);
            remove_path(&full)?;
            prune_empty_parents(repo, &full);
        }

        for (path, entry) in &self.entries {
            let full = repo.join(path);
            entry
                .write(&full)
                .map_err(|e| Error::Rollback(format!("restoring {} failed: {}", path, e)))?;
            if matches!(entry, Entry::Missing) {
                prune_empty_parents(repo, &full);
            }
        }

        tracing::info!(head = %self.head, paths = self.entries.len(), "snapshot restored");
        Ok(())
    }

    /// Checks that `HEAD` and every captured path match the snapshot and
    /// that nothing else is dirty.
    pub fn verify(&self, repo: &Path) -> Result<()> {
        let head = git::head(repo)?;
        if head != self.head {
            return Err(Error::Rollback(format!(
                "HEAD is {} but snapshot was {}",
                head, self.head
            )));
        }

        for (path, expected) in &self.entries {
            if Entry::read(&repo.join(path))? != *expected {
                return Err(Error::Rollback(format!("{} differs from snapshot", path)));
            }
        }

        if let Some(stray) = git::dirty_paths(repo)?
            .into_iter()
            .find(|p| !in_control_dir(p, &self.control_dir) && !self.entries.contains_key(p))
        {
            return Err(Error::Rollback(format!("{} changed after rollback", stray)));
        }

        Ok(())
    }
}

/// Returns true if `path` is the control directory or inside it.
pub(crate) fn in_control_dir(path: &str, control_dir: &str) -> bool {
    let control = control_dir.trim_end_matches('/');
    let path = path.strip_prefix("./").unwrap_or(path);
    path == control || path.starts_with(&format!("{}/", control))
}

fn remove_path(path: &Path) -> Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Ok(std::fs::remove_file(path)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Removes now-empty directories between `path` and the repository root.
fn prune_empty_parents(repo: &Path, path: &Path) {
    let mut dir = path.parent();
    while let Some(d) = dir {
        if d == repo || !d.starts_with(repo) {
            break;
        }
        // fails on non-empty directories, which ends the walk
        if std::fs::remove_dir(d).is_err() {
            break;
        }
        dir = d.parent();
    }
}

#[cfg(unix)]
fn file_mode(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode()
}

#[cfg(not(unix))]
fn file_mode(_meta: &std::fs::Metadata) -> u32 {
    0
}

#[cfg(unix)]
fn set_file_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_file_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn make_symlink(target: &Path, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link)?;
    Ok(())
}

#[cfg(not(unix))]
fn make_symlink(target: &Path, link: &Path) -> Result<()> {
    Err(Error::Rollback(format!(
        "cannot restore symlink {} -> {} on this platform",
        link.display(),
        target.display()
    )))
}
