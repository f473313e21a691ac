//! Best-effort network denial for sandboxed commands.
//!
//! Network clients are shadowed on `PATH` by shims that fail with a fixed
//! marker, proxies are pointed at a closed port, and connection failures on
//! stderr are tagged with the same marker so callers can always tell a
//! network denial apart from an ordinary failure.

use std::path::{Path, PathBuf};

use tokio::process::Command;

use crate::error::Result;

/// Marker written to stderr whenever a network attempt is denied.
pub const NETWORK_DISABLED_MARKER: &str = "network disabled by sandbox";

/// Exit code used by the shims (ECONNREFUSED).
pub const NETWORK_DENIED_EXIT_CODE: i32 = 111;

/// Environment flag exported to sandboxed commands when the network is off.
pub const NO_NET_ENV: &str = "PATCH_FORTRESS_NO_NET";

const DEAD_PROXY: &str = "http://127.0.0.1:9";

const PROXY_VARS: &[&str] = &[
    "HTTP_PROXY",
    "HTTPS_PROXY",
    "ALL_PROXY",
    "http_proxy",
    "https_proxy",
    "all_proxy",
];

const CONNECTION_FAILURES: &[&str] = &[
    "could not resolve host",
    "temporary failure in name resolution",
    "name or service not known",
    "network is unreachable",
    "failed to connect to 127.0.0.1 port 9",
    "connection refused",
    "unable to resolve host",
];

/// A temporary directory of failing network-client shims.
///
/// Removed when dropped.
pub struct NetworkShim {
    dir: PathBuf,
}

impl NetworkShim {
    /// Writes one shim per blocked tool into a fresh temp directory.
    pub fn install(tools: &[String]) -> Result<Self> {
        let dir = std::env::temp_dir().join(format!(
            "patch-fortress-no-net-{}",
            uuid::Uuid::new_v4().simple()
        ));
        std::fs::create_dir_all(&dir)?;

        let script = format!(
            "#!/bin/sh\necho '{}: {{0}} blocked' >&2\nexit {}\n",
            NETWORK_DISABLED_MARKER, NETWORK_DENIED_EXIT_CODE
        );

        for tool in tools {
            let path = dir.join(tool);
            std::fs::write(&path, script.replace("{0}", tool))?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
            }
        }

        tracing::debug!(dir = ?dir, tools = tools.len(), "installed network shims");
        Ok(Self { dir })
    }

    /// Returns the shim directory.
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Puts the shims first on `PATH` and disables proxies for `cmd`.
    pub fn configure(&self, cmd: &mut Command) {
        let inherited = std::env::var("PATH").unwrap_or_default();
        let path = if inherited.is_empty() {
            self.dir.display().to_string()
        } else {
            format!("{}:{}", self.dir.display(), inherited)
        };
        cmd.env("PATH", path);
        for var in PROXY_VARS {
            cmd.env(var, DEAD_PROXY);
        }
        cmd.env("NO_PROXY", "localhost,127.0.0.1,::1");
        cmd.env("no_proxy", "localhost,127.0.0.1,::1");
        cmd.env(NO_NET_ENV, "1");
    }
}

impl Drop for NetworkShim {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.dir) {
            tracing::warn!(error = %e, dir = ?self.dir, "failed to remove network shim directory");
        }
    }
}

/// Returns true if `stderr` shows a denied or failed network attempt.
pub fn looks_like_network_denial(stderr: &str) -> bool {
    if stderr.contains(NETWORK_DISABLED_MARKER) {
        return true;
    }
    let lower = stderr.to_lowercase();
    CONNECTION_FAILURES.iter().any(|p| lower.contains(p))
}
