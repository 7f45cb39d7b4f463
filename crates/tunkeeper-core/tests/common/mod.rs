//! Shared fixtures: a stand-in tunnel, fast timings, free ports.

#![allow(dead_code, clippy::unwrap_used)]

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use tunkeeper_core::backoff::BackoffPolicy;
use tunkeeper_core::control::ControlTimings;
use tunkeeper_core::detach::SupervisorSpawner;
use tunkeeper_core::supervisor::SupervisorTimings;
use tunkeeper_core::{
    ProcessRegistry, Result, Supervisor, SupervisorState, TunnelConfig, TunnelLauncher,
};

/// Runs a fixed program in place of ssh and never claims foreign listeners.
pub struct FakeTunnel {
    program: &'static str,
    args: Vec<&'static str>,
}

impl FakeTunnel {
    /// A tunnel that stays up until killed.
    pub fn long_lived() -> Arc<Self> {
        Arc::new(Self {
            program: "sleep",
            args: vec!["30"],
        })
    }

    /// A tunnel that dies as soon as it starts.
    pub fn crashing() -> Arc<Self> {
        Arc::new(Self {
            program: "false",
            args: Vec::new(),
        })
    }
}

impl TunnelLauncher for FakeTunnel {
    fn command(&self) -> Command {
        let mut cmd = Command::new(self.program);
        cmd.args(&self.args);
        cmd
    }

    fn matches_command_line(&self, _command_line: &str) -> bool {
        false
    }
}

/// A separate process listening on `127.0.0.1:port`, returned once the port
/// accepts connections. The caller reaps it.
pub async fn spawn_listener(port: u16) -> std::process::Child {
    let script = format!(
        "import socket, time\n\
         s = socket.socket()\n\
         s.setsockopt(socket.SOL_SOCKET, socket.SO_REUSEADDR, 1)\n\
         s.bind(('127.0.0.1', {port}))\n\
         s.listen()\n\
         time.sleep(60)\n"
    );
    let child = std::process::Command::new("python3")
        .args(["-c", &script])
        .spawn()
        .unwrap();
    eventually(Duration::from_secs(10), || {
        std::net::TcpStream::connect(("127.0.0.1", port)).ok()
    })
    .await;
    child
}

/// A port nothing listens on (bound, read, released).
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

pub fn config(state_dir: &Path, port: u16) -> TunnelConfig {
    let mut config = TunnelConfig::new("bastion.invalid", state_dir);
    config.listen_port = port;
    config
}

pub fn fast_supervisor_timings() -> SupervisorTimings {
    SupervisorTimings {
        backoff: BackoffPolicy::new(Duration::from_millis(10), Duration::from_millis(40)),
        port_busy_wait: Duration::from_millis(50),
        stop_poll: Duration::from_millis(20),
        terminate_grace: Duration::from_secs(2),
    }
}

pub fn fast_control_timings() -> ControlTimings {
    ControlTimings {
        start_timeout: Duration::from_millis(500),
        poll: Duration::from_millis(20),
        terminate_grace: Duration::from_secs(5),
    }
}

/// Poll `check` until it yields a value or `timeout` passes.
pub async fn eventually<T>(timeout: Duration, mut check: impl FnMut() -> Option<T>) -> T {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(value) = check() {
            return value;
        }
        assert!(Instant::now() < deadline, "condition not met within {timeout:?}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Runs the supervisor as a task in the test process instead of detaching.
pub struct InProcessSpawner {
    config: TunnelConfig,
    registry: ProcessRegistry,
    launcher: Arc<FakeTunnel>,
    shutdown: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<Result<SupervisorState>>>>,
    pub spawned: Mutex<u32>,
}

impl InProcessSpawner {
    pub fn new(config: TunnelConfig, registry: ProcessRegistry, launcher: Arc<FakeTunnel>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            registry,
            launcher,
            shutdown,
            handle: Mutex::new(None),
            spawned: Mutex::new(0),
        }
    }

    pub fn spawn_count(&self) -> u32 {
        *self.spawned.lock().unwrap()
    }

    /// Wait for the most recently spawned supervisor to return.
    pub async fn join(&self) -> SupervisorState {
        let handle = self.handle.lock().unwrap().take().unwrap();
        tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap()
    }
}

impl SupervisorSpawner for InProcessSpawner {
    fn spawn_supervisor(&self) -> Result<u32> {
        let supervisor = Supervisor::new(
            self.config.clone(),
            self.registry.clone(),
            self.launcher.clone(),
        )
        .with_timings(fast_supervisor_timings());
        let handle = tokio::spawn(supervisor.run(self.shutdown.subscribe()));
        *self.handle.lock().unwrap() = Some(handle);
        *self.spawned.lock().unwrap() += 1;
        Ok(std::process::id())
    }
}
