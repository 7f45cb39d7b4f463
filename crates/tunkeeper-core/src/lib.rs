//! `tunkeeper` Core Library
//!
//! Keeps one ssh dynamic-forward tunnel alive:
//! - Pid records and the stop flag in a state directory
//! - Port inspection and reclamation from stale tunnels
//! - Restart backoff
//! - The supervisor run loop and its teardown guarantees
//! - Start/stop/status orchestration for short-lived CLI invocations

pub mod backoff;
pub mod config;
pub mod control;
pub mod detach;
pub mod error;
pub mod launcher;
pub mod port;
pub mod process;
pub mod registry;
pub mod supervisor;
pub mod tracing_init;

pub use backoff::BackoffPolicy;
pub use config::TunnelConfig;
pub use control::{Controller, StartOutcome, StatusReport, StopOutcome};
pub use error::{Error, Result};
pub use launcher::{SshLauncher, TunnelLauncher};
pub use port::{Listener, PortReconciler};
pub use registry::{ProcessRegistry, Record, RecordKind};
pub use supervisor::{Supervisor, SupervisorState};
