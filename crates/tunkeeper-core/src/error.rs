//! Error types for the `tunkeeper` core library.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::port::Listener;

/// Result type alias using the core [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for tunnel supervision.
#[derive(Debug, Error)]
pub enum Error {
    /// The state directory could not be created or written.
    #[error("state directory {} is not writable: {source}", path.display())]
    StateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Something foreign holds the port and could not be reclaimed.
    #[error("port {port} is held by another process{}", format_listeners(listeners))]
    PortOccupied { port: u16, listeners: Vec<Listener> },

    /// The port is still bound after stop finished its cleanup.
    #[error("port {port} is still bound after stop{}", format_listeners(listeners))]
    PortStillBound { port: u16, listeners: Vec<Listener> },

    /// The detached supervisor did not register itself in time.
    #[error("supervisor did not come up within {}ms", waited.as_millis())]
    StartTimeout { waited: Duration },

    /// The supervisor process could not be launched at all.
    #[error("failed to launch supervisor: {0}")]
    Spawn(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn format_listeners(listeners: &[Listener]) -> String {
    if listeners.is_empty() {
        return String::new();
    }
    let listed = listeners
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ");
    format!(" ({listed})")
}
