//! Tunnel configuration flags, shared by every verb.

use std::ffi::OsString;
use std::path::PathBuf;

use anyhow::Result;
use clap::{ArgAction, Args};

use tunkeeper_core::TunnelConfig;
use tunkeeper_core::config::{
    DEFAULT_KEEPALIVE_INTERVAL, DEFAULT_KEEPALIVE_MAX_MISSED, DEFAULT_LISTEN_PORT,
    default_state_dir,
};

/// Flags describing the tunnel. Each one is backed by an environment variable
/// and may appear before or after the verb.
#[derive(Args, Debug, Clone)]
pub struct ConfigArgs {
    /// Remote ssh host (required for start, restart and supervise)
    #[arg(long, env = "TUNKEEPER_REMOTE_HOST", global = true)]
    pub remote_host: Option<String>,

    /// Remote login name (ssh's default when unset)
    #[arg(long, env = "TUNKEEPER_REMOTE_USER", global = true)]
    pub remote_user: Option<String>,

    /// Remote ssh port
    #[arg(long, default_value_t = 22, env = "TUNKEEPER_REMOTE_PORT", global = true)]
    pub remote_port: u16,

    /// Local address the SOCKS listener binds to
    #[arg(
        long,
        default_value = "127.0.0.1",
        env = "TUNKEEPER_LISTEN_HOST",
        global = true
    )]
    pub listen_host: String,

    /// Local port the SOCKS listener binds to
    #[arg(
        long,
        default_value_t = DEFAULT_LISTEN_PORT,
        env = "TUNKEEPER_LISTEN_PORT",
        global = true
    )]
    pub listen_port: u16,

    /// Seconds between ssh keep-alive probes
    #[arg(
        long,
        default_value_t = DEFAULT_KEEPALIVE_INTERVAL,
        env = "TUNKEEPER_KEEPALIVE_INTERVAL",
        global = true
    )]
    pub keepalive_interval: u32,

    /// Missed keep-alives before ssh drops the connection
    #[arg(
        long,
        default_value_t = DEFAULT_KEEPALIVE_MAX_MISSED,
        env = "TUNKEEPER_KEEPALIVE_MAX_MISSED",
        global = true
    )]
    pub keepalive_max_missed: u32,

    /// Directory for pid records, the stop flag and the log
    /// (default: `$XDG_STATE_HOME/tunkeeper` or `~/.tunkeeper`)
    #[arg(long, env = "TUNKEEPER_STATE_DIR", global = true)]
    pub state_dir: Option<PathBuf>,

    /// Terminate stale tunnels that still hold the listen port
    #[arg(
        long,
        default_value_t = true,
        action = ArgAction::Set,
        env = "TUNKEEPER_RECLAIM_PORT",
        global = true
    )]
    pub reclaim_port: bool,

    /// Path to the ssh binary
    #[arg(long, default_value = "ssh", env = "TUNKEEPER_SSH_BIN", global = true)]
    pub ssh_bin: PathBuf,

    /// Identity file passed to ssh as `-i`
    #[arg(long, env = "TUNKEEPER_IDENTITY_FILE", global = true)]
    pub identity_file: Option<PathBuf>,

    /// Extra ssh `-o` option, e.g. `Compression=yes` (repeatable)
    #[arg(
        long = "ssh-option",
        env = "TUNKEEPER_SSH_OPTIONS",
        value_delimiter = ',',
        global = true
    )]
    pub ssh_options: Vec<String>,

    /// Log level filter for the supervisor (e.g. "info", "debug", "warn")
    #[arg(long, default_value = "info", env = "TUNKEEPER_LOG_LEVEL", global = true)]
    pub log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "TUNKEEPER_LOG_JSON", global = true)]
    pub log_json: bool,
}

impl ConfigArgs {
    /// Build the core config. The remote host may be empty here; verbs that
    /// need it validate the result.
    pub fn to_config(&self) -> Result<TunnelConfig> {
        let state_dir = match &self.state_dir {
            Some(dir) => dir.clone(),
            None => default_state_dir()?,
        };
        let remote_host = self.remote_host.clone().unwrap_or_default();
        let mut config = TunnelConfig::new(remote_host, state_dir);
        config.remote_user.clone_from(&self.remote_user);
        config.remote_port = self.remote_port;
        config.listen_host.clone_from(&self.listen_host);
        config.listen_port = self.listen_port;
        config.keepalive_interval = self.keepalive_interval;
        config.keepalive_max_missed = self.keepalive_max_missed;
        config.reclaim_port = self.reclaim_port;
        config.ssh_bin.clone_from(&self.ssh_bin);
        config.identity_file.clone_from(&self.identity_file);
        config.ssh_options.clone_from(&self.ssh_options);
        Ok(config)
    }

    /// Arguments that re-invoke this binary as the detached supervisor.
    pub fn supervise_args(&self, config: &TunnelConfig) -> Vec<OsString> {
        let mut args = config.to_args();
        args.push("--log-level".into());
        args.push(self.log_level.clone().into());
        if self.log_json {
            args.push("--log-json".into());
        }
        args.push("supervise".into());
        args
    }
}
