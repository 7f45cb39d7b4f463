//! tunkeeper
//!
//! Keeps an `ssh -N -D` SOCKS tunnel alive in the background: restarts it
//! with backoff when it dies and keeps stale tunnels off its port.

use std::io::IsTerminal;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use tunkeeper_cli::args::ConfigArgs;
use tunkeeper_cli::{lifecycle_cmd, logs_cmd};
use tunkeeper_core::tracing_init::{default_filter, init_tracing};

/// Log level for the interactive verbs; the supervisor uses `--log-level`.
const VERB_LOG_LEVEL: &str = "warn";

#[derive(Parser, Debug)]
#[command(name = "tunkeeper")]
#[command(version, about = "Keep an ssh SOCKS tunnel alive", long_about = None)]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the supervisor in the background
    Start,
    /// Stop the supervisor and its tunnel
    Stop,
    /// Show whether the tunnel is running (exit code 1 when stopped)
    Status {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Stop, then start
    Restart,
    /// Print the supervisor log
    Logs {
        /// Number of trailing lines to print
        #[arg(short = 'n', long, default_value_t = 50)]
        lines: usize,

        /// Keep printing lines as they are appended
        #[arg(short, long)]
        follow: bool,
    },
    /// Run the supervisor loop in the foreground
    #[command(hide = true)]
    Supervise,
}

#[tokio::main]
#[allow(clippy::print_stderr)]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if matches!(cli.command, Command::Supervise) {
        init_tracing(
            &default_filter(&cli.config.log_level),
            cli.config.log_json,
            false,
        );
    } else {
        init_tracing(
            &default_filter(VERB_LOG_LEVEL),
            cli.config.log_json,
            std::io::stderr().is_terminal(),
        );
    }

    let result = match cli.command {
        Command::Start => lifecycle_cmd::start(&cli.config)
            .await
            .map(|()| ExitCode::SUCCESS),
        Command::Stop => lifecycle_cmd::stop(&cli.config)
            .await
            .map(|()| ExitCode::SUCCESS),
        Command::Status { json } => lifecycle_cmd::status(&cli.config, json).await,
        Command::Restart => lifecycle_cmd::restart(&cli.config)
            .await
            .map(|()| ExitCode::SUCCESS),
        Command::Logs { lines, follow } => logs_cmd::run(&cli.config, lines, follow)
            .await
            .map(|()| ExitCode::SUCCESS),
        Command::Supervise => lifecycle_cmd::supervise(&cli.config)
            .await
            .map(|()| ExitCode::SUCCESS),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("tunkeeper: {e:#}");
            ExitCode::FAILURE
        }
    }
}
