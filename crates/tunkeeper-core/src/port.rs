//! Port reconciliation: who listens on the tunnel port, and reclaiming it.
//!
//! Nothing here is cached. Every question is answered from the live system,
//! since a listener can appear or vanish between any two calls.

use std::collections::BTreeSet;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::launcher::TunnelLauncher;
use crate::process;

/// How long a connect probe may take before the port counts as free.
const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// A process listening on the target port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Listener {
    pub pid: u32,
    /// Empty when the command line could not be read.
    pub command_line: String,
}

impl std::fmt::Display for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.command_line.is_empty() {
            write!(f, "pid {}", self.pid)
        } else {
            write!(f, "pid {}: {}", self.pid, self.command_line)
        }
    }
}

/// Decides whether a listener may be reclaimed.
pub trait IdentityCheck: Send + Sync {
    fn matches(&self, listener: &Listener) -> bool;
}

impl<F> IdentityCheck for F
where
    F: Fn(&Listener) -> bool + Send + Sync,
{
    fn matches(&self, listener: &Listener) -> bool {
        self(listener)
    }
}

/// "Is this the tunnel we would spawn?"
///
/// A pid we recorded ourselves is the structural answer; matching the command
/// line against the launcher is the fallback for tunnels whose record is lost.
#[derive(Clone)]
pub struct TunnelIdentity {
    launcher: Arc<dyn TunnelLauncher>,
    known_pids: BTreeSet<u32>,
}

impl TunnelIdentity {
    pub fn new(launcher: Arc<dyn TunnelLauncher>) -> Self {
        Self {
            launcher,
            known_pids: BTreeSet::new(),
        }
    }

    /// Treat `pid` as ours regardless of its command line.
    #[must_use]
    pub fn with_known_pid(mut self, pid: Option<u32>) -> Self {
        self.known_pids.extend(pid);
        self
    }
}

impl IdentityCheck for TunnelIdentity {
    fn matches(&self, listener: &Listener) -> bool {
        self.known_pids.contains(&listener.pid)
            || self.launcher.matches_command_line(&listener.command_line)
    }
}

/// Outcome of [`PortReconciler::reclaim`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    /// Listeners that were signalled and are gone.
    pub terminated: Vec<Listener>,
    /// Listeners that were signalled but survived SIGKILL.
    pub survived: Vec<Listener>,
    /// Listeners that failed the identity check and were left alone.
    pub skipped: Vec<Listener>,
}

/// Inspects and reclaims one local TCP port.
#[derive(Debug, Clone)]
pub struct PortReconciler {
    host: String,
    port: u16,
    grace: Duration,
}

impl PortReconciler {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            grace: process::TERMINATE_GRACE,
        }
    }

    /// Override the SIGTERM grace period.
    #[must_use]
    pub const fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Wildcard binds are probed through loopback.
    fn probe_host(&self) -> &str {
        match self.host.as_str() {
            "" | "0.0.0.0" | "*" => "127.0.0.1",
            "::" | "[::]" => "::1",
            host => host.trim_start_matches('[').trim_end_matches(']'),
        }
    }

    /// True iff something accepts TCP connections on the port.
    pub async fn is_port_bound(&self) -> bool {
        let target = (self.probe_host(), self.port);
        match tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(target)).await {
            Ok(Ok(_stream)) => true,
            Ok(Err(e)) => {
                debug!(port = self.port, error = %e, "Port probe refused");
                false
            }
            Err(_) => {
                debug!(port = self.port, "Port probe timed out");
                false
            }
        }
    }

    /// Processes listening on the port. Empty when none, or when neither
    /// `lsof` nor `ss` is available.
    pub async fn listening_processes(&self) -> Vec<Listener> {
        let port = self.port;
        tokio::task::spawn_blocking(move || {
            listener_pids(port)
                .into_iter()
                .map(|pid| Listener {
                    pid,
                    command_line: process::command_line(pid).unwrap_or_default(),
                })
                .collect()
        })
        .await
        .unwrap_or_default()
    }

    /// Terminate every listener that passes `identity`; leave the rest alone.
    ///
    /// Best effort: the port may still be bound afterwards, by a listener we
    /// skipped or by one that raced in, so callers re-check.
    pub async fn reclaim(&self, identity: &dyn IdentityCheck) -> ReclaimReport {
        let mut report = ReclaimReport::default();
        for listener in self.listening_processes().await {
            if listener.pid == std::process::id() || !identity.matches(&listener) {
                info!(port = self.port, %listener, "Leaving foreign listener alone");
                report.skipped.push(listener);
                continue;
            }
            info!(port = self.port, %listener, "Reclaiming port from listener");
            if process::terminate(listener.pid, self.grace).await {
                report.terminated.push(listener);
            } else {
                warn!(port = self.port, %listener, "Listener survived SIGKILL");
                report.survived.push(listener);
            }
        }
        report
    }
}

fn listener_pids(port: u16) -> BTreeSet<u32> {
    let pids = first_non_empty(lsof_pids(port), || ss_pids(port));
    if pids.is_empty() {
        debug!(port, "No listener pids found");
    }
    pids
}

/// lsof may run yet see nothing (sockets of other users), so an empty
/// answer falls through to the next source as well.
fn first_non_empty(
    primary: Option<BTreeSet<u32>>,
    fallback: impl FnOnce() -> Option<BTreeSet<u32>>,
) -> BTreeSet<u32> {
    match primary {
        Some(pids) if !pids.is_empty() => pids,
        _ => fallback().unwrap_or_default(),
    }
}

/// `None` when lsof cannot run; lsof exits 1 with no output when nothing matches.
fn lsof_pids(port: u16) -> Option<BTreeSet<u32>> {
    let output = Command::new("lsof")
        .args(["-nP", &format!("-iTCP:{port}"), "-sTCP:LISTEN", "-t"])
        .output()
        .ok()?;
    Some(parse_pid_lines(&String::from_utf8_lossy(&output.stdout)))
}

fn ss_pids(port: u16) -> Option<BTreeSet<u32>> {
    let output = Command::new("ss")
        .args(["-Hltnp", &format!("sport = :{port}")])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    Some(parse_ss_users(&String::from_utf8_lossy(&output.stdout)))
}

fn parse_pid_lines(text: &str) -> BTreeSet<u32> {
    text.lines()
        .filter_map(|line| line.trim().parse().ok())
        .filter(|pid| *pid > 0)
        .collect()
}

/// Extract every `pid=N` from `ss -p` output (`users:(("ssh",pid=12,fd=4))`).
fn parse_ss_users(text: &str) -> BTreeSet<u32> {
    text.split("pid=")
        .skip(1)
        .filter_map(|rest| {
            let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
            digits.parse().ok()
        })
        .filter(|pid| *pid > 0)
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn parses_lsof_output() {
        let pids = parse_pid_lines("123\n456\n123\n\nnot-a-pid\n0\n");
        assert_eq!(pids.into_iter().collect::<Vec<_>>(), vec![123, 456]);
    }

    #[test]
    fn parses_ss_output() {
        let text = "LISTEN 0 128 127.0.0.1:1080 0.0.0.0:* users:((\"ssh\",pid=4242,fd=5))\n\
                    LISTEN 0 128 [::1]:1080 [::]:* users:((\"ssh\",pid=4242,fd=6),(\"ssh\",pid=77,fd=3))\n";
        let pids = parse_ss_users(text);
        assert_eq!(pids.into_iter().collect::<Vec<_>>(), vec![77, 4242]);
    }

    #[test]
    fn empty_lsof_answer_falls_back() {
        let from_ss = || Some(BTreeSet::from([7]));
        assert_eq!(first_non_empty(Some(BTreeSet::new()), from_ss), BTreeSet::from([7]));
        assert_eq!(first_non_empty(None, from_ss), BTreeSet::from([7]));
        assert_eq!(
            first_non_empty(Some(BTreeSet::from([3])), || panic!("not consulted")),
            BTreeSet::from([3])
        );
        assert!(first_non_empty(None, || None).is_empty());
    }

    #[test]
    fn listener_display() {
        let listener = Listener {
            pid: 9,
            command_line: String::new(),
        };
        assert_eq!(listener.to_string(), "pid 9");
    }

    #[test]
    fn wildcard_hosts_probe_loopback() {
        assert_eq!(PortReconciler::new("0.0.0.0", 1).probe_host(), "127.0.0.1");
        assert_eq!(PortReconciler::new("::", 1).probe_host(), "::1");
        assert_eq!(PortReconciler::new("[::1]", 1).probe_host(), "::1");
        assert_eq!(PortReconciler::new("localhost", 1).probe_host(), "localhost");
    }

    #[test]
    fn closures_are_identity_checks() {
        let only_42 = |listener: &Listener| listener.pid == 42;
        let check: &dyn IdentityCheck = &only_42;
        assert!(check.matches(&Listener {
            pid: 42,
            command_line: String::new()
        }));
        assert!(!check.matches(&Listener {
            pid: 43,
            command_line: String::new()
        }));
    }

    #[test]
    fn identity_trusts_recorded_pid_then_command_line() {
        let config = crate::config::TunnelConfig::new("bastion", "/tmp/tk");
        let launcher = Arc::new(crate::launcher::SshLauncher::new(config));
        let identity = TunnelIdentity::new(launcher).with_known_pid(Some(500));

        let recorded = Listener {
            pid: 500,
            command_line: "something else".into(),
        };
        let lookalike = Listener {
            pid: 501,
            command_line: "ssh -N -D 127.0.0.1:1080 bastion".into(),
        };
        let stranger = Listener {
            pid: 502,
            command_line: "python3 -m http.server 1080".into(),
        };
        assert!(identity.matches(&recorded));
        assert!(identity.matches(&lookalike));
        assert!(!identity.matches(&stranger));
    }

    #[tokio::test]
    async fn bound_and_free_ports() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let reconciler = PortReconciler::new("127.0.0.1", port);
        assert!(reconciler.is_port_bound().await);
        drop(listener);
        assert!(!reconciler.is_port_bound().await);
    }

    #[tokio::test]
    async fn reclaim_terminates_matching_listener() {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let script = format!(
            "import socket, time\n\
             s = socket.socket()\n\
             s.setsockopt(socket.SOL_SOCKET, socket.SO_REUSEADDR, 1)\n\
             s.bind(('127.0.0.1', {port}))\n\
             s.listen()\n\
             time.sleep(60)\n"
        );
        let mut holder = std::process::Command::new("python3")
            .args(["-c", &script])
            .spawn()
            .unwrap();
        let holder_pid = holder.id();
        let reconciler =
            PortReconciler::new("127.0.0.1", port).with_grace(Duration::from_secs(2));
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while !reconciler.is_port_bound().await {
            assert!(std::time::Instant::now() < deadline, "listener never bound");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let only_holder = move |listener: &Listener| listener.pid == holder_pid;
        let report = reconciler.reclaim(&only_holder).await;

        assert_eq!(
            report.terminated.iter().map(|l| l.pid).collect::<Vec<_>>(),
            vec![holder_pid]
        );
        assert!(report.survived.is_empty());
        assert!(!reconciler.is_port_bound().await);
        assert!(!holder.wait().unwrap().success());
    }

    #[tokio::test]
    async fn reclaim_never_touches_own_process() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let reconciler = PortReconciler::new("127.0.0.1", port);
        let everything = |_: &Listener| true;
        let report = reconciler.reclaim(&everything).await;
        assert!(report.terminated.is_empty());
        assert!(reconciler.is_port_bound().await);
    }
}
