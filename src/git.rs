//! Thin wrappers over the `git` CLI.

use std::io::Write;
use std::path::Path;
use std::process::{Command, Output, Stdio};

use crate::error::{Error, Result};

/// Runs blocking git or filesystem work on tokio's blocking pool.
pub async fn unblock<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| Error::Git(format!("blocking git task did not complete: {}", e)))?
}

fn git(repo: &Path, args: &[&str]) -> Result<Output> {
    let output = Command::new("git")
        .current_dir(repo)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| Error::Git(format!("failed to run git {}: {}", args.join(" "), e)))?;
    Ok(output)
}

fn git_ok(repo: &Path, args: &[&str]) -> Result<String> {
    let output = git(repo, args)?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Git(format!(
            "git {} failed: {}",
            args.join(" "),
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn git_with_stdin(repo: &Path, args: &[&str], input: &str) -> Result<Output> {
    let mut child = Command::new("git")
        .current_dir(repo)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::Git(format!("failed to run git {}: {}", args.join(" "), e)))?;

    if let Some(mut stdin) = child.stdin.take() {
        // git may exit early on a malformed patch and close the pipe
        if let Err(e) = stdin.write_all(input.as_bytes()) {
            tracing::debug!(error = %e, "git closed stdin early");
        }
    }

    Ok(child.wait_with_output()?)
}

/// Returns true if `path` is inside a git work tree.
pub fn is_repository(path: &Path) -> bool {
    git(path, &["rev-parse", "--is-inside-work-tree"])
        .map(|o| o.status.success() && String::from_utf8_lossy(&o.stdout).trim() == "true")
        .unwrap_or(false)
}

/// Returns the full id of `HEAD`.
pub fn head(repo: &Path) -> Result<String> {
    git_ok(repo, &["rev-parse", "HEAD"])
}

/// Checks that `diff` applies cleanly without touching the tree.
pub fn apply_check(repo: &Path, diff: &str) -> Result<()> {
    run_apply(repo, diff, true)
}

/// Applies `diff` to the working tree. `git apply` is all-or-nothing.
pub fn apply(repo: &Path, diff: &str) -> Result<()> {
    run_apply(repo, diff, false)
}

fn run_apply(repo: &Path, diff: &str, check_only: bool) -> Result<()> {
    let mut args = vec!["apply", "--whitespace=nowarn"];
    if check_only {
        args.push("--check");
    }
    args.push("-");

    let output = git_with_stdin(repo, &args, diff)?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::DiffApply(stderr.trim().to_string()));
    }
    Ok(())
}

/// Stages the given paths, including deletions.
pub fn add(repo: &Path, paths: &[String]) -> Result<()> {
    if paths.is_empty() {
        return Ok(());
    }
    let mut args = vec!["add", "-A", "--"];
    args.extend(paths.iter().map(String::as_str));
    git_ok(repo, &args).map(|_| ())
}

/// Commits exactly `paths` (or the whole index when empty) and returns the new `HEAD`.
pub fn commit(repo: &Path, message: &str, paths: &[String]) -> Result<String> {
    let mut args = vec!["commit", "--no-verify", "-q", "-m", message];
    if !paths.is_empty() {
        args.push("--only");
        args.push("--");
        args.extend(paths.iter().map(String::as_str));
    }
    git_ok(repo, &args)?;
    head(repo)
}

/// Moves `HEAD`, index and tracked files to `rev`.
pub fn reset_hard(repo: &Path, rev: &str) -> Result<()> {
    git_ok(repo, &["reset", "--hard", "-q", rev]).map(|_| ())
}

/// Returns true if `path` is in the index.
pub fn is_tracked(repo: &Path, path: &str) -> bool {
    git(repo, &["ls-files", "--error-unmatch", "--", path])
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Paths with staged, unstaged or untracked changes (ignored files excluded).
///
/// Both sides of a rename are reported.
pub fn dirty_paths(repo: &Path) -> Result<Vec<String>> {
    let output = git(repo, &["status", "--porcelain=v1", "-z", "--untracked-files=all"])?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Git(format!("git status failed: {}", stderr.trim())));
    }
    Ok(parse_porcelain_z(&String::from_utf8_lossy(&output.stdout)))
}

fn parse_porcelain_z(raw: &str) -> Vec<String> {
    let mut paths = Vec::new();
    let mut records = raw.split('\0').filter(|r| !r.is_empty());
    while let Some(record) = records.next() {
        let Some(path) = record.get(3..) else {
            continue;
        };
        paths.push(path.to_string());
        // renames and copies are followed by the original path
        if record.starts_with('R') || record.starts_with('C') {
            if let Some(orig) = records.next() {
                paths.push(orig.to_string());
            }
        }
    }
    paths
}
