//! OS-level resource limits and process-group control.

use std::time::Duration;

use tokio::process::Command;

use super::quota::{Quota, SandboxConfig};

/// Puts the child in its own process group and applies rlimits before exec.
#[cfg(unix)]
pub fn configure(cmd: &mut Command, quota: &Quota, config: &SandboxConfig) {
    let cpu = quota.cpu_seconds;
    let mem = quota.mem_bytes();
    let nofile = config.max_open_files;

    // SAFETY: the closure only calls async-signal-safe libc functions.
    unsafe {
        cmd.pre_exec(move || apply(cpu, mem, nofile));
    }
}

#[cfg(not(unix))]
pub fn configure(_cmd: &mut Command, _quota: &Quota, _config: &SandboxConfig) {}

#[cfg(unix)]
macro_rules! set_limit {
    ($resource:expr, $soft:expr, $hard:expr) => {{
        let mut current = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        if libc::getrlimit($resource, &mut current) != 0 {
            return Err(std::io::Error::last_os_error());
        }
        // Never try to raise a hard limit we were already given.
        let ceiling = current.rlim_max;
        let lim = libc::rlimit {
            rlim_cur: ($soft as libc::rlim_t).min(ceiling),
            rlim_max: ($hard as libc::rlim_t).min(ceiling),
        };
        if libc::setrlimit($resource, &lim) != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }};
}

#[cfg(unix)]
fn apply(cpu_seconds: u64, mem_bytes: u64, nofile: u64) -> std::io::Result<()> {
    unsafe {
        if libc::setpgid(0, 0) != 0 {
            return Err(std::io::Error::last_os_error());
        }

        // Soft limit raises SIGXCPU, the hard limit one second later is SIGKILL.
        set_limit!(libc::RLIMIT_CPU, cpu_seconds, cpu_seconds.saturating_add(1));
        // Not RLIMIT_AS: V8 reserves gigabytes of address space at startup.
        set_limit!(libc::RLIMIT_DATA, mem_bytes, mem_bytes);
        set_limit!(libc::RLIMIT_NOFILE, nofile, nofile);
        set_limit!(libc::RLIMIT_CORE, 0u64, 0u64);
    }
    Ok(())
}

/// Sends SIGKILL to every process in the group led by `pid`.
#[cfg(unix)]
pub fn kill_group(pid: u32) {
    let rc = unsafe { libc::kill(-(pid as libc::pid_t), libc::SIGKILL) };
    if rc != 0 {
        tracing::debug!(
            pid,
            error = %std::io::Error::last_os_error(),
            "process group already gone"
        );
    }
}

#[cfg(not(unix))]
pub fn kill_group(_pid: u32) {}

/// CPU time (user + system) consumed so far by reaped children of this process.
#[cfg(unix)]
pub fn children_cpu_time() -> Duration {
    let mut usage = std::mem::MaybeUninit::<libc::rusage>::zeroed();
    // SAFETY: getrusage only writes into the provided struct.
    let rc = unsafe { libc::getrusage(libc::RUSAGE_CHILDREN, usage.as_mut_ptr()) };
    if rc != 0 {
        return Duration::ZERO;
    }
    // SAFETY: initialised by the successful call above.
    let usage = unsafe { usage.assume_init() };
    timeval(usage.ru_utime) + timeval(usage.ru_stime)
}

#[cfg(unix)]
fn timeval(tv: libc::timeval) -> Duration {
    Duration::from_secs(tv.tv_sec.max(0) as u64) + Duration::from_micros(tv.tv_usec.max(0) as u64)
}

#[cfg(not(unix))]
pub fn children_cpu_time() -> Duration {
    Duration::ZERO
}
