//! End-to-end guarded apply against real repositories and sandboxed gates.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use tempfile::TempDir;

use patch_fortress::{
    FortressConfig, GateSpec, GuardedApply, LockReason, LockStore, ProcessSandbox, Quota,
};

/// Helper to create a temp git repo with a small project.
fn create_temp_git_repo() -> TempDir {
    let temp_dir = TempDir::new().expect("failed to create temp dir");

    git(temp_dir.path(), &["init", "-q"]);
    git(temp_dir.path(), &["config", "user.email", "test@test.com"]);
    git(temp_dir.path(), &["config", "user.name", "Test User"]);
    git(temp_dir.path(), &["config", "commit.gpgsign", "false"]);

    std::fs::write(temp_dir.path().join("README.md"), "# Test Repo\n")
        .expect("failed to create readme");
    std::fs::create_dir_all(temp_dir.path().join("src")).expect("failed to create src");
    std::fs::write(temp_dir.path().join("src/app.txt"), "value=1\nstatus=ok\n")
        .expect("failed to create app");

    git(temp_dir.path(), &["add", "."]);
    git(temp_dir.path(), &["commit", "-q", "-m", "initial"]);

    temp_dir
}

fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("failed to run git");
    assert!(output.status.success(), "git {:?} failed", args);
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// Every file under `root` except git metadata, with its bytes.
fn tree_bytes(root: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
    fn walk(root: &Path, dir: &Path, out: &mut BTreeMap<PathBuf, Vec<u8>>) {
        for entry in std::fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            let rel = path.strip_prefix(root).unwrap().to_path_buf();
            if rel.starts_with(".git") || rel.starts_with(".patch-fortress") {
                continue;
            }
            if path.is_dir() {
                walk(root, &path, out);
            } else {
                out.insert(rel, std::fs::read(&path).unwrap());
            }
        }
    }
    let mut out = BTreeMap::new();
    walk(root, root, &mut out);
    out
}

/// A gate that records its run in `markers` and exits with `code`.
fn marker_gate(name: &str, markers: &Path, code: i32) -> GateSpec {
    let script = format!("touch '{}/{}'; exit {}", markers.display(), name, code);
    GateSpec::new(name, ["sh".to_string(), "-c".to_string(), script])
}

fn app_diff(from: &str, to: &str) -> String {
    format!(
        "diff --git a/src/app.txt b/src/app.txt\n--- a/src/app.txt\n+++ b/src/app.txt\n@@ -1,2 +1,2 @@\n-{}\n+{}\n status=ok\n",
        from, to
    )
}

fn guard(repo: &Path, gates: Vec<GateSpec>) -> GuardedApply {
    let config = FortressConfig::default()
        .with_gates(gates)
        .with_quota(Quota::default().with_timeout_s(20));
    GuardedApply::new(repo, config, Arc::new(ProcessSandbox::new()))
}

#[tokio::test]
async fn passing_patch_is_committed_with_real_gates() {
    let repo = create_temp_git_repo();
    let gates = vec![
        GateSpec::new("lint", ["grep", "-q", "value=2", "src/app.txt"]),
        GateSpec::new("tests", ["sh", "-c", "test \"$(wc -l < src/app.txt)\" -eq 2"]),
    ];

    let result = guard(repo.path(), gates)
        .apply(&app_diff("value=1", "value=2"))
        .await
        .unwrap();

    assert!(result.ok, "{:?}", result);
    assert_eq!(result.gates.len(), 2);
    assert_eq!(git(repo.path(), &["log", "-1", "--format=%s"]), "patch-fortress: apply guarded patch");
    assert_eq!(git(repo.path(), &["status", "--porcelain"]), "");
}

#[tokio::test]
async fn gate_short_circuit_stops_at_types() {
    let repo = create_temp_git_repo();
    let markers = TempDir::new().unwrap();
    let gates = vec![
        marker_gate("lint", markers.path(), 0),
        marker_gate("types", markers.path(), 1),
        marker_gate("tests", markers.path(), 0),
        marker_gate("build", markers.path(), 0),
    ];
    let before = tree_bytes(repo.path());
    let head = git(repo.path(), &["rev-parse", "HEAD"]);

    let result = guard(repo.path(), gates)
        .apply(&app_diff("value=1", "value=2"))
        .await
        .unwrap();

    assert!(!result.ok);
    assert!(result.rolled_back);
    assert_eq!(result.failed_gate.as_deref(), Some("types"));
    assert_eq!(result.lock_reason, Some(LockReason::GateFailed));
    assert!(markers.path().join("lint").exists());
    assert!(markers.path().join("types").exists());
    assert!(!markers.path().join("tests").exists());
    assert!(!markers.path().join("build").exists());

    assert_eq!(tree_bytes(repo.path()), before);
    assert_eq!(git(repo.path(), &["rev-parse", "HEAD"]), head);
}

#[tokio::test]
async fn secret_diff_never_reaches_a_gate() {
    let repo = create_temp_git_repo();
    let markers = TempDir::new().unwrap();
    let gates = vec![
        marker_gate("lint", markers.path(), 0),
        marker_gate("build", markers.path(), 0),
    ];
    let before = tree_bytes(repo.path());

    let diff = "diff --git a/src/config.ts b/src/config.ts\nnew file mode 100644\n--- /dev/null\n+++ b/src/config.ts\n@@ -0,0 +1 @@\n+const api_key = \"sk-1234567890123456789012345678\";\n";
    let result = guard(repo.path(), gates).apply(diff).await.unwrap();

    assert!(result.rolled_back);
    assert_eq!(result.lock_reason, Some(LockReason::SecretScanFailed));
    assert!(!result.violations.is_empty());
    assert_eq!(std::fs::read_dir(markers.path()).unwrap().count(), 0);
    assert_eq!(tree_bytes(repo.path()), before);
}

#[tokio::test]
async fn rollback_is_exact_for_many_edits() {
    let repo = create_temp_git_repo();
    std::fs::write(repo.path().join("local.env"), "UNTRACKED=1\n").unwrap();
    let before = tree_bytes(repo.path());
    let head = git(repo.path(), &["rev-parse", "HEAD"]);

    let diff = format!(
        "{}{}{}",
        app_diff("value=1", "value=3"),
        "diff --git a/README.md b/README.md\ndeleted file mode 100644\n--- a/README.md\n+++ /dev/null\n@@ -1 +0,0 @@\n-# Test Repo\n",
        "diff --git a/lib/new/mod.txt b/lib/new/mod.txt\nnew file mode 100644\n--- /dev/null\n+++ b/lib/new/mod.txt\n@@ -0,0 +1,2 @@\n+a\n+b\n",
    );
    let gates = vec![GateSpec::new(
        "build",
        ["sh", "-c", "mkdir -p dist && echo bundle > dist/out.js && exit 2"],
    )];

    let result = guard(repo.path(), gates).apply(&diff).await.unwrap();

    assert!(result.rolled_back, "{:?}", result);
    assert_eq!(result.gates[0].exit_code, 2);
    assert_eq!(tree_bytes(repo.path()), before);
    assert_eq!(git(repo.path(), &["rev-parse", "HEAD"]), head);
    assert!(!repo.path().join("lib").exists());
    assert!(!repo.path().join("dist").exists());
}

#[tokio::test]
async fn lock_persists_until_operator_clears_it() {
    let repo = create_temp_git_repo();
    let markers = TempDir::new().unwrap();
    let failing = guard(repo.path(), vec![marker_gate("tests", markers.path(), 1)]);

    let first = failing.apply(&app_diff("value=1", "value=2")).await.unwrap();
    assert_eq!(first.lock_reason, Some(LockReason::GateFailed));

    let lock_path = LockStore::lock_file_path(repo.path(), ".patch-fortress");
    let lock: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&lock_path).unwrap()).unwrap();
    assert_eq!(lock["reason"], "gate-failed");
    assert_eq!(lock["failed_gate"], "tests");
    assert!(lock["created_at"].is_string());

    std::fs::remove_file(markers.path().join("tests")).unwrap();
    let passing = guard(repo.path(), vec![marker_gate("tests", markers.path(), 0)]);
    for _ in 0..3 {
        let result = passing.apply(&app_diff("value=1", "value=9")).await.unwrap();
        assert!(result.locked);
        assert_eq!(result.error_code.as_deref(), Some("locked"));
    }
    assert!(!markers.path().join("tests").exists());

    LockStore::new(repo.path(), ".patch-fortress").clear().unwrap();
    let result = passing.apply(&app_diff("value=1", "value=9")).await.unwrap();
    assert!(result.ok);
}

#[tokio::test]
async fn timed_out_gate_rolls_back() {
    let repo = create_temp_git_repo();
    let config = FortressConfig::default()
        .with_gates(vec![GateSpec::new("tests", ["sh", "-c", "echo started; sleep 30"])])
        .with_quota(Quota::default().with_timeout_s(1));
    let guard = GuardedApply::new(repo.path(), config, Arc::new(ProcessSandbox::new()));

    let result = guard.apply(&app_diff("value=1", "value=2")).await.unwrap();

    assert!(result.rolled_back);
    assert_eq!(result.failed_gate.as_deref(), Some("tests"));
    assert_eq!(result.gates[0].exit_code, 124);
    assert!(result.gates[0].stdout_tail.contains("started"));
    assert!(result.duration_ms < 20_000);
}
