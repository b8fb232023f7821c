//! Process liveness, identity and termination by pid.
//!
//! Works on bare pids so that mounts recorded by a previous run of the
//! application can still be checked and stopped. A recorded pid may have been
//! reused by the OS since, so callers check [`serves_mount`] before treating
//! it as a driver.

use std::path::Path;
use std::time::Duration;

use tokio::time::{sleep, timeout};

use crate::engine::error::{EngineError, EngineResult};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const KILL_CONFIRM_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    AlreadyExited,
    Graceful,
    Killed,
}

/// Check if a process with the given PID is alive.
#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    // Signal 0 only checks for existence
    kill(Pid::from_raw(raw), None).is_ok()
}

#[cfg(windows)]
pub fn is_process_alive(pid: u32) -> bool {
    std::process::Command::new("tasklist")
        .args(["/FI", &format!("PID eq {}", pid), "/NH"])
        .output()
        .map(|o| {
            let stdout = String::from_utf8_lossy(&o.stdout);
            !stdout.contains("No tasks") && stdout.contains(&pid.to_string())
        })
        .unwrap_or(false)
}

#[cfg(not(any(unix, windows)))]
pub fn is_process_alive(_pid: u32) -> bool {
    true
}

/// Arguments of a running process, where the platform exposes them.
#[cfg(target_os = "linux")]
fn command_line(pid: u32) -> Option<Vec<std::ffi::OsString>> {
    use std::os::unix::ffi::OsStrExt;

    let raw = std::fs::read(format!("/proc/{}/cmdline", pid)).ok()?;
    Some(
        raw.split(|byte| *byte == 0)
            .filter(|arg| !arg.is_empty())
            .map(|arg| std::ffi::OsStr::from_bytes(arg).to_os_string())
            .collect(),
    )
}

#[cfg(not(target_os = "linux"))]
fn command_line(_pid: u32) -> Option<Vec<std::ffi::OsString>> {
    None
}

/// Whether `pid` is alive and is the process serving `local_path`.
///
/// The driver is launched with the mount point as an argument, so where the
/// command line is readable it decides. Elsewhere the path must currently be
/// a mount point.
pub fn serves_mount(pid: u32, local_path: &Path) -> bool {
    if !is_process_alive(pid) {
        return false;
    }
    match command_line(pid) {
        Some(args) => args.iter().any(|arg| Path::new(arg) == local_path),
        None => is_mount_point(local_path),
    }
}

/// A directory is a mount point when it sits on a different device than its
/// parent.
#[cfg(unix)]
pub fn is_mount_point(path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    let Some(parent) = path.parent() else {
        return false;
    };
    match (std::fs::metadata(path), std::fs::metadata(parent)) {
        (Ok(own), Ok(up)) => own.dev() != up.dev(),
        _ => false,
    }
}

#[cfg(not(unix))]
pub fn is_mount_point(path: &Path) -> bool {
    std::fs::read_dir(path).is_ok()
}

#[cfg(unix)]
fn send_signal(pid: u32, force: bool) -> EngineResult<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid)
        .map_err(|_| EngineError::internal(format!("Invalid pid {}", pid)))?;
    let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
    match kill(Pid::from_raw(raw), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(EngineError::internal(format!(
            "Failed to send {} to {}: {}",
            signal, pid, e
        ))),
    }
}

#[cfg(not(unix))]
fn send_signal(pid: u32, force: bool) -> EngineResult<()> {
    let mut cmd = std::process::Command::new("taskkill");
    cmd.args(["/PID", &pid.to_string()]);
    if force {
        cmd.arg("/F");
    }
    cmd.output()
        .map(|_| ())
        .map_err(|e| EngineError::io("Failed to run taskkill", e))
}

async fn wait_for_exit(pid: u32, within: Duration) -> bool {
    let exited = async {
        while is_process_alive(pid) {
            sleep(POLL_INTERVAL).await;
        }
    };
    timeout(within, exited).await.is_ok()
}

/// Sends SIGTERM, waits up to `grace`, then SIGKILLs.
pub async fn terminate(pid: u32, grace: Duration) -> EngineResult<TerminateOutcome> {
    if !is_process_alive(pid) {
        return Ok(TerminateOutcome::AlreadyExited);
    }

    send_signal(pid, false)?;
    if wait_for_exit(pid, grace).await {
        tracing::debug!(pid, "Process exited gracefully");
        return Ok(TerminateOutcome::Graceful);
    }

    tracing::warn!(pid, grace_ms = grace.as_millis() as u64, "Grace period elapsed, killing process");
    send_signal(pid, true)?;
    if wait_for_exit(pid, KILL_CONFIRM_TIMEOUT).await {
        Ok(TerminateOutcome::Killed)
    } else {
        Err(EngineError::internal(format!(
            "Process {} did not exit after SIGKILL",
            pid
        )))
    }
}
