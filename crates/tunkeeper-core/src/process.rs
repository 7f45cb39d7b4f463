//! Process liveness probes and signal delivery.
//!
//! Liveness follows `kill(pid, 0)` semantics with two refinements: `EPERM`
//! means the process exists (it is just not ours), and zombies are reported as
//! dead because nobody can address them any more.

use std::process::Command;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tracing::{debug, warn};

/// Grace period between SIGTERM and SIGKILL.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(3);

/// Polling step while waiting for a signalled process to go away.
pub const TERMINATE_POLL: Duration = Duration::from_millis(100);

fn to_pid(pid: u32) -> Option<Pid> {
    match i32::try_from(pid) {
        Ok(raw) if raw > 0 => Some(Pid::from_raw(raw)),
        _ => None,
    }
}

/// True iff a process with this pid exists and is not a zombie.
pub fn is_alive(pid: u32) -> bool {
    let Some(target) = to_pid(pid) else {
        return false;
    };
    match signal::kill(target, None) {
        Ok(()) | Err(Errno::EPERM) => !is_zombie(pid),
        Err(_) => false,
    }
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    // The command name may contain spaces and parens; the state follows the last ')'.
    stat.rsplit_once(')')
        .and_then(|(_, rest)| rest.trim_start().chars().next())
        .is_some_and(|state| state == 'Z')
}

#[cfg(not(target_os = "linux"))]
fn is_zombie(pid: u32) -> bool {
    Command::new("ps")
        .args(["-o", "stat=", "-p", &pid.to_string()])
        .output()
        .is_ok_and(|out| String::from_utf8_lossy(&out.stdout).trim().starts_with('Z'))
}

/// Send `sig` to `pid`. A process that is already gone is not an error.
pub fn send_signal(pid: u32, sig: Signal) -> bool {
    let Some(target) = to_pid(pid) else {
        return false;
    };
    match signal::kill(target, sig) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(e) => {
            warn!(pid, signal = %sig, error = %e, "Failed to send signal");
            false
        }
    }
}

/// SIGTERM, wait up to `grace` polling every [`TERMINATE_POLL`], then SIGKILL.
///
/// Returns `true` when the process is gone afterwards.
pub async fn terminate(pid: u32, grace: Duration) -> bool {
    if !is_alive(pid) {
        return true;
    }
    send_signal(pid, Signal::SIGTERM);
    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if !is_alive(pid) {
            debug!(pid, "Process exited after SIGTERM");
            return true;
        }
        tokio::time::sleep(TERMINATE_POLL).await;
    }
    warn!(pid, "Timeout waiting for graceful exit, killing");
    send_signal(pid, Signal::SIGKILL);
    tokio::time::sleep(TERMINATE_POLL).await;
    !is_alive(pid)
}

/// Blocking variant of [`terminate`] for teardown paths that cannot await.
pub fn terminate_blocking(pid: u32, grace: Duration) -> bool {
    if !is_alive(pid) {
        return true;
    }
    send_signal(pid, Signal::SIGTERM);
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if !is_alive(pid) {
            return true;
        }
        std::thread::sleep(TERMINATE_POLL);
    }
    warn!(pid, "Timeout waiting for graceful exit, killing");
    send_signal(pid, Signal::SIGKILL);
    std::thread::sleep(TERMINATE_POLL);
    !is_alive(pid)
}

/// Full command line of a process, space separated.
pub fn command_line(pid: u32) -> Option<String> {
    if pid == 0 {
        return None;
    }
    if let Ok(raw) = std::fs::read(format!("/proc/{pid}/cmdline")) {
        let joined = raw
            .split(|b| *b == 0)
            .filter(|part| !part.is_empty())
            .map(String::from_utf8_lossy)
            .collect::<Vec<_>>()
            .join(" ");
        if !joined.is_empty() {
            return Some(joined);
        }
    }
    let output = Command::new("ps")
        .args(["-p", &pid.to_string(), "-o", "command="])
        .output()
        .ok()?;
    let command = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if command.is_empty() {
        return None;
    }
    Some(command)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn own_process_is_alive() {
        assert!(is_alive(std::process::id()));
    }

    #[test]
    fn pid_zero_is_never_alive() {
        assert!(!is_alive(0));
        assert!(!send_signal(0, Signal::SIGTERM));
    }

    #[test]
    fn out_of_range_pid_is_not_alive() {
        assert!(!is_alive(u32::MAX));
    }

    #[test]
    fn reaped_child_is_not_alive() {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        assert!(!is_alive(pid));
    }

    #[test]
    fn unreaped_child_counts_as_dead() {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        // Give it time to exit without reaping it.
        std::thread::sleep(Duration::from_millis(300));
        assert!(!is_alive(pid));
        child.wait().unwrap();
    }

    #[test]
    fn command_line_of_own_process() {
        let line = command_line(std::process::id()).unwrap();
        assert!(!line.is_empty());
    }

    #[tokio::test]
    async fn terminate_stops_sleeping_process() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        let waiter = tokio::spawn(async move { child.wait().await });
        assert!(terminate(pid, Duration::from_secs(2)).await);
        let status = waiter.await.unwrap().unwrap();
        assert!(!status.success());
    }

    #[tokio::test]
    async fn terminate_missing_process_is_noop() {
        assert!(terminate(0, Duration::from_millis(10)).await);
    }
}
