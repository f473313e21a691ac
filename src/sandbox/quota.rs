//! Resource quotas and sandbox-wide settings.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Per-invocation resource ceilings for one sandboxed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
    /// CPU time ceiling in seconds.
    #[serde(default = "default_cpu_seconds")]
    pub cpu_seconds: u64,
    /// Data-segment (heap and anonymous mapping) ceiling in megabytes.
    #[serde(default = "default_mem_mb")]
    pub mem_mb: u64,
    /// Wall-clock ceiling in seconds.
    #[serde(default = "default_timeout_s")]
    pub timeout_s: u64,
    /// Whether the command may reach the network.
    #[serde(default)]
    pub network_enabled: bool,
}

fn default_cpu_seconds() -> u64 {
    10
}

fn default_mem_mb() -> u64 {
    512
}

fn default_timeout_s() -> u64 {
    30
}

impl Default for Quota {
    fn default() -> Self {
        Self {
            cpu_seconds: default_cpu_seconds(),
            mem_mb: default_mem_mb(),
            timeout_s: default_timeout_s(),
            network_enabled: false,
        }
    }
}

impl Quota {
    /// Sets the CPU ceiling.
    pub fn with_cpu_seconds(mut self, cpu_seconds: u64) -> Self {
        self.cpu_seconds = cpu_seconds;
        self
    }

    /// Sets the memory ceiling.
    pub fn with_mem_mb(mut self, mem_mb: u64) -> Self {
        self.mem_mb = mem_mb;
        self
    }

    /// Sets the wall-clock ceiling.
    pub fn with_timeout_s(mut self, timeout_s: u64) -> Self {
        self.timeout_s = timeout_s;
        self
    }

    /// Enables or disables network access.
    pub fn with_network(mut self, enabled: bool) -> Self {
        self.network_enabled = enabled;
        self
    }

    /// Wall-clock budget as a duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_s)
    }

    /// Memory ceiling in bytes.
    pub fn mem_bytes(&self) -> u64 {
        self.mem_mb.saturating_mul(1024 * 1024)
    }
}

/// Which resource ceiling a command ran into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaKind {
    Cpu,
    Memory,
}

impl fmt::Display for QuotaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuotaKind::Cpu => write!(f, "cpu"),
            QuotaKind::Memory => write!(f, "memory"),
        }
    }
}

/// Settings shared by every invocation of a [`ProcessSandbox`](super::ProcessSandbox).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Network clients shadowed by failing shims when the network is disabled.
    #[serde(default = "default_blocked_tools")]
    pub blocked_network_tools: Vec<String>,
    /// Open file descriptor ceiling.
    #[serde(default = "default_max_open_files")]
    pub max_open_files: u64,
    /// Maximum bytes captured per output stream.
    #[serde(default = "default_output_cap")]
    pub output_cap_bytes: usize,
    /// How long to wait for output pipes to drain after the child exits.
    #[serde(default = "default_drain_grace_ms")]
    pub drain_grace_ms: u64,
}

fn default_blocked_tools() -> Vec<String> {
    [
        "curl", "wget", "nc", "ncat", "netcat", "telnet", "ssh", "scp", "sftp", "ftp", "rsync",
        "http", "https",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_max_open_files() -> u64 {
    1024
}

fn default_output_cap() -> usize {
    1024 * 1024
}

fn default_drain_grace_ms() -> u64 {
    1000
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            blocked_network_tools: default_blocked_tools(),
            max_open_files: default_max_open_files(),
            output_cap_bytes: default_output_cap(),
            drain_grace_ms: default_drain_grace_ms(),
        }
    }
}
