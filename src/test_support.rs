//! Shared fixtures for unit tests.

use std::collections::HashSet;
use std::path::Path;
use std::process::Command;
use std::sync::Mutex;

use async_trait::async_trait;
use tempfile::TempDir;

use crate::error::Result;
use crate::gates::GateSpec;
use crate::sandbox::{CommandExecutor, Outcome, Quota, SandboxOutput};

/// Creates a temporary git repository with a single commit of `README.md`.
pub fn create_temp_git_repo() -> TempDir {
    let temp_dir = TempDir::new().expect("failed to create temp dir");

    run_git(temp_dir.path(), &["init", "-q"]);
    run_git(temp_dir.path(), &["config", "user.email", "test@test.com"]);
    run_git(temp_dir.path(), &["config", "user.name", "Test User"]);
    run_git(temp_dir.path(), &["config", "commit.gpgsign", "false"]);

    std::fs::write(temp_dir.path().join("README.md"), "# Test Repo\n")
        .expect("failed to write README");

    run_git(temp_dir.path(), &["add", "."]);
    run_git(temp_dir.path(), &["commit", "-q", "-m", "Initial commit"]);

    temp_dir
}

fn run_git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("failed to run git");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
}

/// Diff that retitles the fixture README.
pub fn readme_diff(title: &str) -> String {
    format!(
        "diff --git a/README.md b/README.md\n\
         --- a/README.md\n\
         +++ b/README.md\n\
         @@ -1 +1 @@\n\
         -# Test Repo\n\
         +# {}\n",
        title
    )
}

/// Diff that creates `path` with the given lines.
pub fn new_file_diff(path: &str, lines: &[&str]) -> String {
    let mut diff = format!(
        "diff --git a/{path} b/{path}\nnew file mode 100644\n--- /dev/null\n+++ b/{path}\n@@ -0,0 +1,{} @@\n",
        lines.len()
    );
    for line in lines {
        diff.push('+');
        diff.push_str(line);
        diff.push('\n');
    }
    diff
}

/// Gates whose command is `gate <name>`, for use with [`RecordingExecutor`].
pub fn named_gates(names: &[&str]) -> Vec<GateSpec> {
    names
        .iter()
        .map(|name| GateSpec::new(*name, ["gate", name]))
        .collect()
}

/// Executor double that records every command and fails selected gates.
///
/// The gate name is taken from the last word of the command.
#[derive(Default)]
pub struct RecordingExecutor {
    failing: HashSet<String>,
    calls: Mutex<Vec<Vec<String>>>,
}

impl RecordingExecutor {
    /// Every command succeeds.
    pub fn passing() -> Self {
        Self::default()
    }

    /// Commands ending in one of `names` exit 1.
    pub fn failing<'a, I>(names: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        Self {
            failing: names.into_iter().map(str::to_string).collect(),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Number of commands run for gate `name`.
    pub fn calls_for(&self, name: &str) -> usize {
        self.calls
            .lock()
            .expect("lock poisoned")
            .iter()
            .filter(|c| c.last().map(String::as_str) == Some(name))
            .count()
    }

    /// Total number of commands run.
    pub fn total_calls(&self) -> usize {
        self.calls.lock().expect("lock poisoned").len()
    }
}

#[async_trait]
impl CommandExecutor for RecordingExecutor {
    async fn run(
        &self,
        command: &[String],
        _workdir: &Path,
        _quota: &Quota,
    ) -> Result<SandboxOutput> {
        self.calls
            .lock()
            .expect("lock poisoned")
            .push(command.to_vec());

        let name = command.last().cloned().unwrap_or_default();
        let failed = self.failing.contains(&name);
        Ok(SandboxOutput {
            exit_code: if failed { 1 } else { 0 },
            stdout: format!("{} ran\n", name),
            stderr: if failed {
                format!("{} failed\n", name)
            } else {
                String::new()
            },
            outcome: Outcome::Exited,
            duration_ms: 1,
        })
    }
}
