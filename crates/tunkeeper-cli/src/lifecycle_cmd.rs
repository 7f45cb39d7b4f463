//! The lifecycle verbs: start, stop, status, restart and the hidden
//! `supervise` verb that runs the loop in the foreground.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::info;

use tunkeeper_core::control::StatusReport;
use tunkeeper_core::detach::DetachedSpawner;
use tunkeeper_core::supervisor::spawn_signal_listener;
use tunkeeper_core::{
    Controller, ProcessRegistry, SshLauncher, StartOutcome, StopOutcome, Supervisor, TunnelConfig,
};

use crate::args::ConfigArgs;

fn controller(config: &TunnelConfig) -> Result<Controller> {
    let registry = ProcessRegistry::open(&config.state_dir)?;
    let launcher = Arc::new(SshLauncher::new(config.clone()));
    Ok(Controller::new(config.clone(), registry, launcher))
}

fn spawner(
    args: &ConfigArgs,
    config: &TunnelConfig,
    registry: &ProcessRegistry,
) -> Result<DetachedSpawner> {
    DetachedSpawner::current_exe(args.supervise_args(config), registry.log_path())
        .context("Failed to locate the tunkeeper binary")
}

/// `tunkeeper start`
pub async fn start(args: &ConfigArgs) -> Result<()> {
    let config = args.to_config()?;
    let controller = controller(&config)?;
    let spawner = spawner(args, &config, controller.registry())?;
    let outcome = controller.start(&spawner).await?;
    print_start(&outcome, &config, controller.registry());
    Ok(())
}

/// `tunkeeper restart`
pub async fn restart(args: &ConfigArgs) -> Result<()> {
    let config = args.to_config()?;
    let controller = controller(&config)?;
    let spawner = spawner(args, &config, controller.registry())?;
    let outcome = controller.restart(&spawner).await?;
    print_start(&outcome, &config, controller.registry());
    Ok(())
}

/// `tunkeeper stop`
#[allow(clippy::print_stdout)]
pub async fn stop(args: &ConfigArgs) -> Result<()> {
    let config = args.to_config()?;
    match controller(&config)?.stop().await? {
        StopOutcome::Stopped { pid } => println!("tunkeeper stopped (pid {pid})"),
        StopOutcome::AlreadyStopped { reclaimed: 0 } => println!("tunkeeper is not running"),
        StopOutcome::AlreadyStopped { reclaimed } => {
            println!("tunkeeper is not running (terminated {reclaimed} stale tunnel(s))");
        }
    }
    Ok(())
}

/// `tunkeeper status`. STOPPED maps to exit code 1.
#[allow(clippy::print_stdout, clippy::print_stderr)]
pub async fn status(args: &ConfigArgs, json: bool) -> Result<ExitCode> {
    let config = args.to_config()?;
    let report = controller(&config)?.status().await;
    if json {
        let value = status_json(&report).context("Failed to serialize status")?;
        println!(
            "{}",
            serde_json::to_string_pretty(&value).context("Failed to serialize status")?
        );
    } else {
        for line in render_status(&report, unix_now()) {
            println!("{line}");
        }
        if let Some(warning) = report.warning() {
            eprintln!("warning: {warning}");
        }
    }
    Ok(if report.running {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// `tunkeeper supervise`: the run loop in the foreground.
///
/// Tracing is already initialised; stderr is the log file when detached.
pub async fn supervise(args: &ConfigArgs) -> Result<()> {
    let config = args.to_config()?;
    config.validate()?;
    let registry = ProcessRegistry::open(&config.state_dir)?;
    let launcher = Arc::new(SshLauncher::new(config.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let signals =
        spawn_signal_listener(shutdown_tx).context("Failed to install signal handlers")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        state_dir = %config.state_dir.display(),
        "Starting supervisor"
    );
    let state = Supervisor::new(config, registry, launcher)
        .run(shutdown_rx)
        .await?;
    signals.abort();

    info!(
        pid = state.pid,
        launches = state.launches,
        last_backoff_ms = state.backoff.as_millis(),
        "Supervisor exited"
    );
    Ok(())
}

#[allow(clippy::print_stdout)]
fn print_start(outcome: &StartOutcome, config: &TunnelConfig, registry: &ProcessRegistry) {
    match outcome {
        StartOutcome::AlreadyRunning { pid } => {
            println!("tunkeeper is already running (pid {pid})");
        }
        StartOutcome::Started {
            pid,
            listening: true,
        } => {
            println!(
                "tunkeeper started (pid {pid}), SOCKS proxy on {} via {}",
                config.listen_addr(),
                config.remote_endpoint()
            );
        }
        StartOutcome::Started {
            pid,
            listening: false,
        } => {
            println!(
                "tunkeeper started (pid {pid}), but {} is not listening yet; see {}",
                config.listen_addr(),
                registry.log_path().display()
            );
        }
    }
}

/// The report as JSON, with the registry/port mismatch as `warning`.
pub fn status_json(report: &StatusReport) -> serde_json::Result<serde_json::Value> {
    let mut value = serde_json::to_value(report)?;
    if let Some(fields) = value.as_object_mut() {
        fields.insert("warning".to_string(), report.warning().into());
    }
    Ok(value)
}

/// Human-readable status lines.
pub fn render_status(report: &StatusReport, now: u64) -> Vec<String> {
    let mut lines = Vec::new();
    match (&report.supervisor, report.running) {
        (Some(record), true) => lines.push(format!(
            "RUNNING (pid {}, up {})",
            record.pid,
            format_uptime(now.saturating_sub(record.started_at))
        )),
        (Some(record), false) => {
            lines.push(format!("STOPPED (stale record for pid {})", record.pid));
        }
        (None, _) => lines.push("STOPPED".to_string()),
    }
    if let Some(child) = &report.child {
        lines.push(format!(
            "  tunnel:  pid {}, up {}",
            child.pid,
            format_uptime(now.saturating_sub(child.started_at))
        ));
    }
    lines.push(format!("  remote:  {}", report.remote));
    let bound = if report.port_bound { "bound" } else { "free" };
    lines.push(format!("  listen:  {} ({bound})", report.listen));
    for listener in &report.listeners {
        lines.push(format!("    {listener}"));
    }
    lines
}

fn format_uptime(secs: u64) -> String {
    let (days, rest) = (secs / 86_400, secs % 86_400);
    let (hours, rest) = (rest / 3600, rest % 3600);
    let (minutes, seconds) = (rest / 60, rest % 60);
    if days > 0 {
        format!("{days}d {hours}h")
    } else if hours > 0 {
        format!("{hours}h {minutes}m")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
