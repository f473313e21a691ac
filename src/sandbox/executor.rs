//! Sandboxed command execution.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

use super::limits;
use super::network::{self, NetworkShim, NETWORK_DISABLED_MARKER};
use super::quota::{Quota, QuotaKind, SandboxConfig};

/// Exit code reported when the wall-clock budget is exceeded.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Exit code reported when a CPU or memory ceiling kills the command.
pub const QUOTA_EXIT_CODE: i32 = 137;

const ALLOCATION_FAILURES: &[&str] = &[
    "cannot allocate memory",
    "out of memory",
    "memory allocation failed",
    "memory allocation of",
    "memoryerror",
    "std::bad_alloc",
    "javascript heap out of memory",
    "fatal process oom",
];

/// How a sandboxed command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "kind", content = "quota")]
pub enum Outcome {
    /// The command ran to completion; `exit_code` is its own.
    Exited,
    /// The wall-clock budget ran out and the process group was killed.
    TimedOut,
    /// A CPU or memory ceiling terminated the command.
    QuotaExceeded(QuotaKind),
    /// The command tried to reach the network while it was disabled.
    NetworkDenied,
}

/// Captured result of one sandboxed command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxOutput {
    /// Exit code (distinguished values for timeout and quota kills).
    pub exit_code: i32,
    /// Captured stdout (possibly partial).
    pub stdout: String,
    /// Captured stderr (possibly partial).
    pub stderr: String,
    /// How the command ended.
    pub outcome: Outcome,
    /// Wall-clock duration.
    pub duration_ms: u64,
}

impl SandboxOutput {
    /// Returns true if the command exited normally with code 0.
    pub fn success(&self) -> bool {
        self.outcome == Outcome::Exited && self.exit_code == 0
    }

    /// Converts sandbox-level failures into the matching error.
    ///
    /// A plain non-zero exit is not an error here; that is the caller's verdict.
    pub fn check(&self, quota: &Quota) -> Result<&Self> {
        match self.outcome {
            Outcome::Exited => Ok(self),
            Outcome::TimedOut => Err(Error::SandboxTimeout {
                timeout_s: quota.timeout_s,
            }),
            Outcome::QuotaExceeded(kind) => Err(Error::SandboxQuotaExceeded { kind }),
            Outcome::NetworkDenied => Err(Error::NetworkDisabledViolation),
        }
    }
}

/// Capability to run one command under a quota.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Runs `command` (program followed by arguments) in `workdir`.
    ///
    /// Returns `Err` only if the command could not be started at all.
    /// Single attempt, never retried.
    async fn run(&self, command: &[String], workdir: &Path, quota: &Quota)
        -> Result<SandboxOutput>;
}

/// Executor backed by OS processes with rlimits and process-group kills.
#[derive(Debug, Clone, Default)]
pub struct ProcessSandbox {
    config: SandboxConfig,
}

impl ProcessSandbox {
    /// Creates a sandbox with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a sandbox with explicit settings.
    pub fn with_config(config: SandboxConfig) -> Self {
        Self { config }
    }

    /// Returns the sandbox settings.
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }
}

#[async_trait]
impl CommandExecutor for ProcessSandbox {
    async fn run(
        &self,
        command: &[String],
        workdir: &Path,
        quota: &Quota,
    ) -> Result<SandboxOutput> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| Error::Config("empty command".to_string()))?;

        // Held until the child is gone; dropping removes the shim directory.
        let shim = if quota.network_enabled {
            None
        } else {
            Some(NetworkShim::install(&self.config.blocked_network_tools)?)
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(shim) = &shim {
            shim.configure(&mut cmd);
        }
        limits::configure(&mut cmd, quota, &self.config);

        tracing::debug!(
            program = %program,
            workdir = ?workdir,
            cpu_seconds = quota.cpu_seconds,
            mem_mb = quota.mem_mb,
            timeout_s = quota.timeout_s,
            network = quota.network_enabled,
            "spawning sandboxed command"
        );

        let start = Instant::now();
        let cpu_before = limits::children_cpu_time();
        let mut child = cmd.spawn()?;
        let pid = child.id();

        let stdout_buf = Arc::new(Mutex::new(Vec::new()));
        let stderr_buf = Arc::new(Mutex::new(Vec::new()));
        let cap = self.config.output_cap_bytes;
        let mut stdout_task = child
            .stdout
            .take()
            .map(|pipe| tokio::spawn(drain(pipe, Arc::clone(&stdout_buf), cap)));
        let mut stderr_task = child
            .stderr
            .take()
            .map(|pipe| tokio::spawn(drain(pipe, Arc::clone(&stderr_buf), cap)));

        let (status, timed_out) = match tokio::time::timeout(quota.timeout(), child.wait()).await
        {
            Ok(status) => (Some(status?), false),
            Err(_) => {
                tracing::warn!(program = %program, timeout_s = quota.timeout_s, "sandboxed command timed out, killing process group");
                if let Some(pid) = pid {
                    limits::kill_group(pid);
                }
                let _ = child.start_kill();
                (child.wait().await.ok(), true)
            }
        };

        // Background grandchildren may still hold the pipes open.
        let grace = Duration::from_millis(self.config.drain_grace_ms);
        let drained = tokio::time::timeout(grace, async {
            join(&mut stdout_task).await;
            join(&mut stderr_task).await;
        })
        .await;
        if drained.is_err() {
            if let Some(pid) = pid {
                limits::kill_group(pid);
            }
            for task in [stdout_task, stderr_task].into_iter().flatten() {
                task.abort();
            }
        }

        let usage = Usage {
            cpu: limits::children_cpu_time().saturating_sub(cpu_before),
            wall: start.elapsed(),
        };
        let stdout = take_lossy(&stdout_buf);
        let mut stderr = take_lossy(&stderr_buf);
        let (exit_code, outcome) = classify(status, timed_out, &stderr, quota, usage);

        if outcome == Outcome::NetworkDenied && !stderr.contains(NETWORK_DISABLED_MARKER) {
            if !stderr.is_empty() && !stderr.ends_with('\n') {
                stderr.push('\n');
            }
            stderr.push_str(NETWORK_DISABLED_MARKER);
            stderr.push('\n');
        }
        if timed_out && stderr.is_empty() {
            stderr.push_str("timeout\n");
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        tracing::debug!(program = %program, exit_code, ?outcome, duration_ms, "sandboxed command finished");

        drop(shim);
        Ok(SandboxOutput {
            exit_code,
            stdout,
            stderr,
            outcome,
            duration_ms,
        })
    }
}

async fn drain<R: AsyncRead + Unpin>(mut reader: R, sink: Arc<Mutex<Vec<u8>>>, cap: usize) {
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let mut sink = sink.lock().unwrap_or_else(|p| p.into_inner());
                let room = cap.saturating_sub(sink.len());
                sink.extend_from_slice(&buf[..n.min(room)]);
            }
        }
    }
}

async fn join(task: &mut Option<JoinHandle<()>>) {
    if let Some(handle) = task.as_mut() {
        let _ = handle.await;
        *task = None;
    }
}

fn take_lossy(buf: &Arc<Mutex<Vec<u8>>>) -> String {
    let bytes = buf.lock().unwrap_or_else(|p| p.into_inner());
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Resources a finished command consumed.
#[derive(Debug, Clone, Copy, Default)]
struct Usage {
    /// CPU time charged to children reaped during the run.
    cpu: Duration,
    wall: Duration,
}

impl Usage {
    /// True if the command could have hit its CPU ceiling.
    ///
    /// The children counter is process-wide, so the wall clock bounds it.
    fn reached_cpu_limit(&self, quota: &Quota) -> bool {
        let limit = Duration::from_secs(quota.cpu_seconds);
        self.cpu >= limit && self.wall >= limit
    }
}

/// Maps the raw exit status onto an exit code and outcome category.
fn classify(
    status: Option<ExitStatus>,
    timed_out: bool,
    stderr: &str,
    quota: &Quota,
    usage: Usage,
) -> (i32, Outcome) {
    if timed_out {
        return (TIMEOUT_EXIT_CODE, Outcome::TimedOut);
    }

    let Some(status) = status else {
        return (-1, Outcome::Exited);
    };

    if let Some(signal) = exit_signal(&status) {
        if is_cpu_signal(signal, usage, quota) {
            return (QUOTA_EXIT_CODE, Outcome::QuotaExceeded(QuotaKind::Cpu));
        }
        if allocation_failed(stderr) {
            return (QUOTA_EXIT_CODE, Outcome::QuotaExceeded(QuotaKind::Memory));
        }
        return (128 + signal, Outcome::Exited);
    }

    let code = status.code().unwrap_or(-1);
    if code == 0 {
        return (0, Outcome::Exited);
    }
    if allocation_failed(stderr) {
        return (QUOTA_EXIT_CODE, Outcome::QuotaExceeded(QuotaKind::Memory));
    }
    if !quota.network_enabled && network::looks_like_network_denial(stderr) {
        return (code, Outcome::NetworkDenied);
    }
    (code, Outcome::Exited)
}

fn allocation_failed(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    ALLOCATION_FAILURES.iter().any(|m| lower.contains(m))
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

/// SIGXCPU is the soft RLIMIT_CPU; SIGKILL counts only once the budget is spent.
#[cfg(unix)]
fn is_cpu_signal(signal: i32, usage: Usage, quota: &Quota) -> bool {
    signal == libc::SIGXCPU || (signal == libc::SIGKILL && usage.reached_cpu_limit(quota))
}

#[cfg(not(unix))]
fn is_cpu_signal(_signal: i32, _usage: Usage, _quota: &Quota) -> bool {
    false
}
