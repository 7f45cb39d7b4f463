//! Shared tracing/logging initialization.
//!
//! The interactive verbs and the detached supervisor use the same pattern for
//! setting up `tracing_subscriber` with an env-filter and optional JSON output.
//! Everything is written to stderr; for the detached supervisor stderr is the
//! append-only log file in the state directory.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialise the global tracing subscriber.
///
/// * `default_filter` -- default `RUST_LOG` value when the env-var is not set
///   (e.g. `"tunkeeper=info"`).
/// * `log_json` -- when `true`, emit structured JSON log lines instead of the
///   human-readable format.
/// * `ansi` -- colourise the human-readable format; off when stderr is a file.
pub fn init_tracing(default_filter: &str, log_json: bool, ansi: bool) {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
    );
    if log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(ansi)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

/// Build the default filter for a log level, covering both crates.
pub fn default_filter(level: &str) -> String {
    format!("tunkeeper={level},tunkeeper_core={level}")
}
