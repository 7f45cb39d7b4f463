//! Start, stop, status and restart.
//!
//! These run in short-lived CLI invocations and talk to the long-lived
//! supervisor only through the [`ProcessRegistry`] and the operating system.
//! Nothing is locked; every step re-verifies what it read, so two racing
//! invocations degrade to an extra retry instead of corrupted state.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::TunnelConfig;
use crate::detach::SupervisorSpawner;
use crate::error::{Error, Result};
use crate::launcher::TunnelLauncher;
use crate::port::{Listener, PortReconciler, ReclaimReport, TunnelIdentity};
use crate::process;
use crate::registry::{ProcessRegistry, Record, RecordKind};

/// Bounded waits used by the controller.
#[derive(Debug, Clone, Copy)]
pub struct ControlTimings {
    /// How long start waits for the supervisor record, and then for the port.
    pub start_timeout: Duration,
    /// Step between checks while waiting.
    pub poll: Duration,
    /// SIGTERM grace period for the child and the supervisor.
    pub terminate_grace: Duration,
}

impl Default for ControlTimings {
    fn default() -> Self {
        Self {
            start_timeout: Duration::from_secs(4),
            poll: Duration::from_millis(100),
            terminate_grace: process::TERMINATE_GRACE,
        }
    }
}

/// Result of a start request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// A live supervisor was already registered.
    AlreadyRunning { pid: u32 },
    /// A new supervisor registered itself. `listening` tells whether the
    /// tunnel bound the port within the start timeout.
    Started { pid: u32, listening: bool },
}

/// Result of a stop request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    /// No live supervisor was registered. `reclaimed` counts orphaned
    /// listeners that were terminated anyway.
    AlreadyStopped { reclaimed: usize },
    Stopped { pid: u32 },
}

/// Point-in-time view of the tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub running: bool,
    pub supervisor: Option<Record>,
    /// A supervisor record exists but its process is gone.
    pub stale: bool,
    pub child: Option<Record>,
    pub listen: String,
    pub remote: String,
    pub port_bound: bool,
    pub listeners: Vec<Listener>,
}

impl StatusReport {
    /// Disagreement between the registry and the port, if any.
    pub fn warning(&self) -> Option<String> {
        match (self.running, self.port_bound) {
            (true, false) => Some(format!(
                "supervisor is running but nothing listens on {}",
                self.listen
            )),
            (false, true) => Some(format!(
                "{} is bound but no supervisor is running",
                self.listen
            )),
            _ => None,
        }
    }
}

/// Orchestrates the lifecycle verbs against one state directory.
pub struct Controller {
    config: TunnelConfig,
    registry: ProcessRegistry,
    reconciler: PortReconciler,
    launcher: Arc<dyn TunnelLauncher>,
    timings: ControlTimings,
}

impl Controller {
    pub fn new(
        config: TunnelConfig,
        registry: ProcessRegistry,
        launcher: Arc<dyn TunnelLauncher>,
    ) -> Self {
        let timings = ControlTimings::default();
        let reconciler = PortReconciler::new(config.listen_host.clone(), config.listen_port)
            .with_grace(timings.terminate_grace);
        Self {
            config,
            registry,
            reconciler,
            launcher,
            timings,
        }
    }

    #[must_use]
    pub fn with_timings(mut self, timings: ControlTimings) -> Self {
        self.timings = timings;
        self.reconciler = self.reconciler.with_grace(timings.terminate_grace);
        self
    }

    pub const fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    pub const fn reconciler(&self) -> &PortReconciler {
        &self.reconciler
    }

    /// `known_child` must be read before anything clears the child record.
    fn identity(&self, known_child: Option<u32>) -> TunnelIdentity {
        TunnelIdentity::new(Arc::clone(&self.launcher)).with_known_pid(known_child)
    }

    /// Start a supervisor unless one is already running.
    pub async fn start(&self, spawner: &dyn SupervisorSpawner) -> Result<StartOutcome> {
        self.config.validate()?;

        if let Some(record) = self.registry.read_live(RecordKind::Supervisor) {
            info!(pid = record.pid, "Supervisor already running");
            return Ok(StartOutcome::AlreadyRunning { pid: record.pid });
        }
        if let Some(stale) = self.registry.read(RecordKind::Supervisor) {
            warn!(pid = stale.pid, "Clearing stale supervisor record");
            self.registry.clear(RecordKind::Supervisor)?;
        }
        let known_child = self.registry.pid(RecordKind::Child);
        self.reap_orphaned_child().await?;

        if self.reconciler.is_port_bound().await {
            if self.config.reclaim_port {
                let report = self.reconciler.reclaim(&self.identity(known_child)).await;
                log_reclaim(&report);
            }
            if self.reconciler.is_port_bound().await {
                return Err(Error::PortOccupied {
                    port: self.config.listen_port,
                    listeners: self.reconciler.listening_processes().await,
                });
            }
        }

        self.registry.clear_stop()?;
        let spawned = spawner.spawn_supervisor()?;
        let record = self.wait_for_supervisor(spawned).await?;
        info!(pid = record.pid, "Supervisor registered");

        let listening = self
            .within_start_timeout(self.until(move || self.reconciler.is_port_bound()))
            .await;
        if !listening {
            warn!(
                listen = %self.config.listen_addr(),
                "Tunnel not listening yet; check the log"
            );
        }
        Ok(StartOutcome::Started {
            pid: record.pid,
            listening,
        })
    }

    /// Stop the supervisor and its child and make sure the port is free.
    pub async fn stop(&self) -> Result<StopOutcome> {
        let Some(supervisor) = self.registry.read_live(RecordKind::Supervisor) else {
            return Ok(self.stop_orphans().await);
        };
        let pid = supervisor.pid;
        info!(pid, "Stopping supervisor");
        self.registry.request_stop()?;

        // The child first: the port frees up as soon as it is gone.
        let known_child = self.registry.pid(RecordKind::Child);
        if let Some(child) = known_child.filter(|pid| process::is_alive(*pid)) {
            info!(pid = child, "Terminating tunnel");
            process::terminate(child, self.timings.terminate_grace).await;
        }

        let exited = tokio::time::timeout(
            self.timings.terminate_grace,
            self.until(move || async move { !self.is_registered(pid) }),
        )
        .await
        .is_ok();
        if !exited && pid != std::process::id() {
            warn!(pid, "Supervisor ignored stop flag, terminating");
            process::terminate(pid, self.timings.terminate_grace).await;
        }

        if self.config.reclaim_port && self.reconciler.is_port_bound().await {
            let report = self.reconciler.reclaim(&self.identity(known_child)).await;
            log_reclaim(&report);
        }
        self.registry.clear_all();

        if self.reconciler.is_port_bound().await {
            return Err(Error::PortStillBound {
                port: self.config.listen_port,
                listeners: self.reconciler.listening_processes().await,
            });
        }
        info!(pid, "Supervisor stopped");
        Ok(StopOutcome::Stopped { pid })
    }

    /// Report whether the supervisor runs and whether the port is bound.
    pub async fn status(&self) -> StatusReport {
        let supervisor = self.registry.read(RecordKind::Supervisor);
        let running = supervisor.as_ref().is_some_and(Record::is_alive);
        let port_bound = self.reconciler.is_port_bound().await;
        let listeners = if port_bound {
            self.reconciler.listening_processes().await
        } else {
            Vec::new()
        };
        StatusReport {
            running,
            stale: supervisor.is_some() && !running,
            supervisor,
            child: self.registry.read_live(RecordKind::Child),
            listen: self.config.listen_addr(),
            remote: self.config.remote_endpoint(),
            port_bound,
            listeners,
        }
    }

    /// Best-effort stop followed by start.
    pub async fn restart(&self, spawner: &dyn SupervisorSpawner) -> Result<StartOutcome> {
        match self.stop().await {
            Ok(outcome) => debug!(?outcome, "Stopped before restart"),
            Err(e) => warn!(error = %e, "Stop before restart failed, starting anyway"),
        }
        self.start(spawner).await
    }

    /// Nothing supervises the tunnel: clean up whatever a crashed run left.
    async fn stop_orphans(&self) -> StopOutcome {
        let known_child = self.registry.pid(RecordKind::Child);
        if let Err(e) = self.reap_orphaned_child().await {
            warn!(error = %e, "Failed to clear orphaned child record");
        }
        let mut reclaimed = 0;
        if self.config.reclaim_port && self.reconciler.is_port_bound().await {
            let report = self.reconciler.reclaim(&self.identity(known_child)).await;
            log_reclaim(&report);
            reclaimed = report.terminated.len();
        }
        self.registry.clear_all();
        if self.reconciler.is_port_bound().await {
            warn!(
                listen = %self.config.listen_addr(),
                "Port still bound by a process we do not own"
            );
        }
        StopOutcome::AlreadyStopped { reclaimed }
    }

    /// Terminate a child left behind by a supervisor that is gone.
    ///
    /// The recorded pid alone is not trusted, since pids get reused: the
    /// command line must still look like our tunnel.
    async fn reap_orphaned_child(&self) -> Result<()> {
        let Some(child) = self.registry.read(RecordKind::Child) else {
            return Ok(());
        };
        if child.is_alive() {
            let ours = process::command_line(child.pid)
                .is_some_and(|line| self.launcher.matches_command_line(&line));
            if ours {
                warn!(pid = child.pid, "Terminating orphaned tunnel");
                process::terminate(child.pid, self.timings.terminate_grace).await;
            } else {
                debug!(pid = child.pid, "Recorded child pid now belongs to another process");
            }
        }
        self.registry.clear(RecordKind::Child)
    }

    fn is_registered(&self, pid: u32) -> bool {
        self.registry.pid(RecordKind::Supervisor) == Some(pid) && process::is_alive(pid)
    }

    async fn wait_for_supervisor(&self, spawned: u32) -> Result<Record> {
        let wait = async {
            loop {
                if let Some(record) = self.registry.read_live(RecordKind::Supervisor) {
                    return Ok(record);
                }
                if !process::is_alive(spawned) {
                    return Err(Error::Spawn(format!(
                        "supervisor (pid {spawned}) exited during startup, see {}",
                        self.registry.log_path().display()
                    )));
                }
                tokio::time::sleep(self.timings.poll).await;
            }
        };
        tokio::time::timeout(self.timings.start_timeout, wait)
            .await
            .map_err(|_| Error::StartTimeout {
                waited: self.timings.start_timeout,
            })?
    }

    /// Resolves once `check` returns true, checking every poll step.
    async fn until<F, Fut>(&self, mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        while !check().await {
            tokio::time::sleep(self.timings.poll).await;
        }
    }

    async fn within_start_timeout(&self, fut: impl Future<Output = ()>) -> bool {
        tokio::time::timeout(self.timings.start_timeout, fut)
            .await
            .is_ok()
    }
}

fn log_reclaim(report: &ReclaimReport) {
    for listener in &report.terminated {
        info!(%listener, "Reclaimed port");
    }
    for listener in &report.survived {
        warn!(%listener, "Listener survived reclaim");
    }
    for listener in &report.skipped {
        warn!(%listener, "Port held by a foreign process");
    }
}
