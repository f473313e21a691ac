//! Sandbox behaviour observed through the public executor API.

use std::time::Instant;

use tempfile::TempDir;

use patch_fortress::sandbox::{NETWORK_DISABLED_MARKER, TIMEOUT_EXIT_CODE};
use patch_fortress::{CommandExecutor, Error, Outcome, ProcessSandbox, Quota};

fn cmd(words: &[&str]) -> Vec<String> {
    words.iter().map(|w| w.to_string()).collect()
}

#[tokio::test]
async fn network_fetch_is_denied_when_disabled() {
    let dir = TempDir::new().unwrap();
    let sandbox = ProcessSandbox::new();

    let out = sandbox
        .run(
            &cmd(&["curl", "-sS", "https://example.com"]),
            dir.path(),
            &Quota::default(),
        )
        .await
        .unwrap();

    assert_ne!(out.exit_code, 0);
    assert!(out.stderr.contains(NETWORK_DISABLED_MARKER), "{}", out.stderr);
    assert_eq!(out.outcome, Outcome::NetworkDenied);
    assert!(matches!(
        out.check(&Quota::default()),
        Err(Error::NetworkDisabledViolation)
    ));
}

#[tokio::test]
async fn network_mechanism_is_absent_when_enabled() {
    let dir = TempDir::new().unwrap();
    let sandbox = ProcessSandbox::new();
    let env_check = cmd(&[
        "sh",
        "-c",
        "echo \"no_net=${PATCH_FORTRESS_NO_NET:-unset} proxy=${HTTPS_PROXY:-unset}\"",
    ]);

    let open = sandbox
        .run(&env_check, dir.path(), &Quota::default().with_network(true))
        .await
        .unwrap();
    assert!(open.stdout.contains("no_net=unset"), "{}", open.stdout);
    assert!(!open.stderr.contains(NETWORK_DISABLED_MARKER));

    let closed = sandbox.run(&env_check, dir.path(), &Quota::default()).await.unwrap();
    assert!(closed.stdout.contains("no_net=1"));
    assert!(closed.stdout.contains("proxy=http://127.0.0.1:9"));
}

#[tokio::test]
async fn offline_commands_are_unaffected() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("input.txt"), "hello\n").unwrap();

    let out = ProcessSandbox::new()
        .run(&cmd(&["cat", "input.txt"]), dir.path(), &Quota::default())
        .await
        .unwrap();

    assert!(out.success());
    assert_eq!(out.stdout, "hello\n");
}

#[tokio::test]
async fn timeout_kills_the_whole_process_group() {
    let dir = TempDir::new().unwrap();
    let quota = Quota::default().with_timeout_s(1);
    let started = Instant::now();

    let out = ProcessSandbox::new()
        .run(
            &cmd(&["sh", "-c", "echo partial; (sleep 60 &); sleep 60"]),
            dir.path(),
            &quota,
        )
        .await
        .unwrap();

    assert_eq!(out.exit_code, TIMEOUT_EXIT_CODE);
    assert_eq!(out.outcome, Outcome::TimedOut);
    assert!(out.stdout.contains("partial"));
    assert!(started.elapsed().as_secs() < 10);
    assert!(matches!(
        out.check(&quota),
        Err(Error::SandboxTimeout { timeout_s: 1 })
    ));
}
