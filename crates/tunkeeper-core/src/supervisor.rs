//! The supervisor run loop.
//!
//! One `Supervisor` owns one tunnel child at a time. It registers itself in
//! the [`ProcessRegistry`], launches the child whenever the port is free,
//! waits for it to exit, backs off, and launches again until a stop is
//! requested either in-process (the shutdown channel, fed by SIGINT/SIGTERM)
//! or across processes (the stop flag raised by `stop`).
//!
//! Teardown lives in [`TeardownGuard`], installed once at loop entry, so the
//! records are cleared on every way out of [`Supervisor::run`].

use std::sync::Arc;
use std::time::Duration;

use tokio::process::Child;
use tokio::sync::watch;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::backoff::BackoffPolicy;
use crate::config::TunnelConfig;
use crate::error::Result;
use crate::launcher::TunnelLauncher;
use crate::port::PortReconciler;
use crate::process;
use crate::registry::{ProcessRegistry, Record, RecordKind};

/// Wait between checks while someone else holds the port.
pub const PORT_BUSY_WAIT: Duration = Duration::from_secs(2);

/// How often the stop flag is checked while the loop is suspended.
pub const STOP_POLL: Duration = Duration::from_millis(200);

/// Where the loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorPhase {
    Idle,
    Launching,
    WaitingOnChild,
    Backoff,
    Terminating,
}

impl std::fmt::Display for SupervisorPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Launching => write!(f, "launching"),
            Self::WaitingOnChild => write!(f, "waiting-on-child"),
            Self::Backoff => write!(f, "backoff"),
            Self::Terminating => write!(f, "terminating"),
        }
    }
}

/// State owned by one running supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorState {
    pub pid: u32,
    /// Unix seconds.
    pub started_at: u64,
    /// Last backoff delay applied; never reset during a run.
    pub backoff: Duration,
    /// Number of launch attempts, successful spawns or not.
    pub launches: u32,
    pub phase: SupervisorPhase,
}

impl SupervisorState {
    fn new(record: &Record) -> Self {
        Self {
            pid: record.pid,
            started_at: record.started_at,
            backoff: Duration::ZERO,
            launches: 0,
            phase: SupervisorPhase::Idle,
        }
    }
}

/// Timings used by the loop. Tests shrink these.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorTimings {
    pub backoff: BackoffPolicy,
    pub port_busy_wait: Duration,
    pub stop_poll: Duration,
    pub terminate_grace: Duration,
}

impl Default for SupervisorTimings {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            port_busy_wait: PORT_BUSY_WAIT,
            stop_poll: STOP_POLL,
            terminate_grace: process::TERMINATE_GRACE,
        }
    }
}

/// Clears the registry when dropped.
///
/// A child still on record is terminated first (SIGTERM, grace, SIGKILL).
/// Runs on normal return, early `?` return and unwinding alike.
pub struct TeardownGuard {
    registry: ProcessRegistry,
    grace: Duration,
}

impl TeardownGuard {
    pub const fn new(registry: ProcessRegistry, grace: Duration) -> Self {
        Self { registry, grace }
    }
}

impl Drop for TeardownGuard {
    fn drop(&mut self) {
        // The normal path reaps the child and clears its record first, so this
        // only blocks (at most `grace`) when unwinding past a live child, at
        // teardown, when nothing else runs on this worker.
        if let Some(pid) = self.registry.pid(RecordKind::Child) {
            if process::is_alive(pid) {
                warn!(pid, "Child still running at teardown, terminating");
                process::terminate_blocking(pid, self.grace);
            }
        }
        self.registry.clear_all();
        info!("Supervisor records cleared");
    }
}

/// Why a wait ended.
enum Wake {
    Elapsed,
    Stop,
}

/// The run loop.
pub struct Supervisor {
    config: TunnelConfig,
    registry: ProcessRegistry,
    reconciler: PortReconciler,
    launcher: Arc<dyn TunnelLauncher>,
    timings: SupervisorTimings,
}

impl Supervisor {
    pub fn new(
        config: TunnelConfig,
        registry: ProcessRegistry,
        launcher: Arc<dyn TunnelLauncher>,
    ) -> Self {
        let reconciler = PortReconciler::new(config.listen_host.clone(), config.listen_port);
        Self {
            config,
            registry,
            reconciler,
            launcher,
            timings: SupervisorTimings::default(),
        }
    }

    #[must_use]
    pub const fn with_timings(mut self, timings: SupervisorTimings) -> Self {
        self.timings = timings;
        self
    }

    /// Run until stopped. Returns the final state.
    ///
    /// Fails only if the supervisor record cannot be written; every child
    /// failure is retried.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<SupervisorState> {
        let span = info_span!(
            "supervisor",
            listen = %self.config.listen_addr(),
            remote = %self.config.remote_endpoint(),
            keepalive = %self.config.keepalive(),
        );
        self.run_inner(shutdown).instrument(span).await
    }

    async fn run_inner(self, mut shutdown: watch::Receiver<bool>) -> Result<SupervisorState> {
        let record = Record::current();
        self.registry.write(RecordKind::Supervisor, &record)?;
        let _guard = TeardownGuard::new(self.registry.clone(), self.timings.terminate_grace);
        self.registry.clear_stop()?;

        let mut state = SupervisorState::new(&record);
        info!(pid = state.pid, "Supervisor started");

        loop {
            if self.stopping(&shutdown) {
                break;
            }

            if self.reconciler.is_port_bound().await {
                info!(
                    port = self.config.listen_port,
                    wait_ms = self.timings.port_busy_wait.as_millis(),
                    "Port already bound, waiting"
                );
                match self.sleep_or_stop(self.timings.port_busy_wait, &mut shutdown).await {
                    Wake::Elapsed => continue,
                    Wake::Stop => break,
                }
            }

            self.transition(&mut state, SupervisorPhase::Launching);
            state.launches = state.launches.saturating_add(1);
            match self.launcher.command().spawn() {
                Ok(child) => {
                    if let Wake::Stop = self.watch_child(child, &mut state, &mut shutdown).await {
                        break;
                    }
                }
                Err(e) => {
                    error!(attempt = state.launches, error = %e, "Failed to spawn tunnel");
                }
            }

            if self.stopping(&shutdown) {
                break;
            }

            state.backoff = self.timings.backoff.next(state.backoff);
            self.transition(&mut state, SupervisorPhase::Backoff);
            info!(
                delay_ms = state.backoff.as_millis(),
                attempt = state.launches,
                "Restarting tunnel after backoff"
            );
            if let Wake::Stop = self.sleep_or_stop(state.backoff, &mut shutdown).await {
                break;
            }
        }

        self.transition(&mut state, SupervisorPhase::Terminating);
        info!(launches = state.launches, "Supervisor stopping");
        Ok(state)
    }

    /// Record the child, wait for it to exit or for a stop, and clean up.
    async fn watch_child(
        &self,
        mut child: Child,
        state: &mut SupervisorState,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Wake {
        let Some(pid) = child.id() else {
            warn!("Tunnel exited before its pid could be recorded");
            return Wake::Elapsed;
        };
        if let Err(e) = self.registry.write(RecordKind::Child, &Record::now(pid)) {
            warn!(pid, error = %e, "Failed to record child pid");
        }
        self.transition(state, SupervisorPhase::WaitingOnChild);
        info!(pid, attempt = state.launches, "Tunnel launched");

        let wake = tokio::select! {
            status = child.wait() => {
                match status {
                    Ok(status) => info!(pid, code = ?status.code(), %status, "Tunnel exited"),
                    Err(e) => warn!(pid, error = %e, "Failed to wait for tunnel"),
                }
                Wake::Elapsed
            }
            () = self.stop_requested(shutdown) => {
                info!(pid, "Stop requested, terminating tunnel");
                self.terminate_child(&mut child, pid).await;
                Wake::Stop
            }
        };

        if let Err(e) = self.registry.clear(RecordKind::Child) {
            warn!(pid, error = %e, "Failed to clear child record");
        }
        wake
    }

    /// SIGTERM, bounded wait, then SIGKILL; reaps the child either way.
    async fn terminate_child(&self, child: &mut Child, pid: u32) {
        process::send_signal(pid, nix::sys::signal::Signal::SIGTERM);
        match tokio::time::timeout(self.timings.terminate_grace, child.wait()).await {
            Ok(Ok(status)) => info!(pid, %status, "Tunnel exited gracefully"),
            Ok(Err(e)) => {
                warn!(pid, error = %e, "Error waiting for tunnel");
                child.kill().await.ok();
            }
            Err(_) => {
                warn!(pid, "Timeout waiting for graceful shutdown, killing");
                child.kill().await.ok();
            }
        }
    }

    fn stopping(&self, shutdown: &watch::Receiver<bool>) -> bool {
        *shutdown.borrow() || self.registry.stop_requested()
    }

    /// Resolves on an in-process shutdown or once the stop flag is raised.
    async fn stop_requested(&self, shutdown: &mut watch::Receiver<bool>) {
        let in_process = async {
            let signalled = shutdown.wait_for(|stop| *stop).await.is_ok();
            if !signalled {
                // Sender gone: only the stop flag can end the loop now.
                std::future::pending::<()>().await;
            }
        };
        tokio::select! {
            () = in_process => {}
            () = self.registry.wait_for_stop(self.timings.stop_poll) => {}
        }
    }

    async fn sleep_or_stop(
        &self,
        duration: Duration,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Wake {
        tokio::select! {
            () = tokio::time::sleep(duration) => Wake::Elapsed,
            () = self.stop_requested(shutdown) => {
                debug!("Stop requested while sleeping");
                Wake::Stop
            }
        }
    }

    fn transition(&self, state: &mut SupervisorState, next: SupervisorPhase) {
        debug!(from = %state.phase, to = %next, "Phase change");
        state.phase = next;
    }
}

/// Feed SIGINT and SIGTERM into the shutdown channel.
pub fn spawn_signal_listener(
    shutdown_tx: watch::Sender<bool>,
) -> std::io::Result<tokio::task::JoinHandle<()>> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    Ok(tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
        let _ = shutdown_tx.send(true);
    }))
}
