//! Tunnel configuration.
//!
//! Values arrive from CLI flags and their environment variables; this is the
//! validated, typed form consumed read-only by the supervisor and controller.

use std::ffi::OsString;
use std::path::PathBuf;

use crate::error::{Error, Result};

/// Default local SOCKS port.
pub const DEFAULT_LISTEN_PORT: u16 = 1080;
/// Default keep-alive interval in seconds.
pub const DEFAULT_KEEPALIVE_INTERVAL: u32 = 30;
/// Default number of missed keep-alives before ssh gives up.
pub const DEFAULT_KEEPALIVE_MAX_MISSED: u32 = 3;

/// Everything needed to launch and supervise one tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    /// Remote ssh host.
    pub remote_host: String,
    /// Remote login name; ssh's own default when unset.
    pub remote_user: Option<String>,
    /// Remote ssh port.
    pub remote_port: u16,
    /// Local address the dynamic forward binds to.
    pub listen_host: String,
    /// Local port the dynamic forward binds to.
    pub listen_port: u16,
    /// `ServerAliveInterval`, in seconds.
    pub keepalive_interval: u32,
    /// `ServerAliveCountMax`.
    pub keepalive_max_missed: u32,
    /// Directory holding the records, stop flag and log.
    pub state_dir: PathBuf,
    /// Whether foreign listeners that look like our tunnel may be killed.
    pub reclaim_port: bool,
    /// The ssh binary.
    pub ssh_bin: PathBuf,
    /// Optional `-i` identity file.
    pub identity_file: Option<PathBuf>,
    /// Extra `-o` options, passed through verbatim.
    pub ssh_options: Vec<String>,
}

impl TunnelConfig {
    /// A config with defaults for everything but the remote host and state dir.
    pub fn new(remote_host: impl Into<String>, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            remote_host: remote_host.into(),
            remote_user: None,
            remote_port: 22,
            listen_host: "127.0.0.1".to_string(),
            listen_port: DEFAULT_LISTEN_PORT,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            keepalive_max_missed: DEFAULT_KEEPALIVE_MAX_MISSED,
            state_dir: state_dir.into(),
            reclaim_port: true,
            ssh_bin: PathBuf::from("ssh"),
            identity_file: None,
            ssh_options: Vec::new(),
        }
    }

    /// Reject configurations the tunnel cannot possibly run with.
    pub fn validate(&self) -> Result<()> {
        if self.remote_host.trim().is_empty() {
            return Err(Error::Config("remote host is required".into()));
        }
        if self.listen_host.trim().is_empty() {
            return Err(Error::Config("listen host must not be empty".into()));
        }
        if self.listen_port == 0 {
            return Err(Error::Config("listen port must be non-zero".into()));
        }
        if self.remote_port == 0 {
            return Err(Error::Config("remote port must be non-zero".into()));
        }
        if self.keepalive_interval == 0 {
            return Err(Error::Config("keep-alive interval must be non-zero".into()));
        }
        Ok(())
    }

    /// `host:port` the tunnel listens on; IPv6 hosts are bracketed.
    pub fn listen_addr(&self) -> String {
        if self.listen_host.contains(':') {
            format!("[{}]:{}", self.listen_host, self.listen_port)
        } else {
            format!("{}:{}", self.listen_host, self.listen_port)
        }
    }

    /// `user@host` destination as ssh expects it.
    pub fn destination(&self) -> String {
        match &self.remote_user {
            Some(user) if !user.is_empty() => format!("{user}@{}", self.remote_host),
            _ => self.remote_host.clone(),
        }
    }

    /// `user@host:port`, for logs.
    pub fn remote_endpoint(&self) -> String {
        format!("{}:{}", self.destination(), self.remote_port)
    }

    /// Keep-alive parameters, for logs.
    pub fn keepalive(&self) -> String {
        format!("{}s x{}", self.keepalive_interval, self.keepalive_max_missed)
    }

    /// Render the config as CLI flags, for re-invoking the binary detached.
    pub fn to_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "--remote-host".into(),
            self.remote_host.clone().into(),
            "--remote-port".into(),
            self.remote_port.to_string().into(),
            "--listen-host".into(),
            self.listen_host.clone().into(),
            "--listen-port".into(),
            self.listen_port.to_string().into(),
            "--keepalive-interval".into(),
            self.keepalive_interval.to_string().into(),
            "--keepalive-max-missed".into(),
            self.keepalive_max_missed.to_string().into(),
            "--state-dir".into(),
            self.state_dir.clone().into(),
            "--reclaim-port".into(),
            self.reclaim_port.to_string().into(),
            "--ssh-bin".into(),
            self.ssh_bin.clone().into(),
        ];
        if let Some(user) = &self.remote_user {
            args.push("--remote-user".into());
            args.push(user.into());
        }
        if let Some(identity) = &self.identity_file {
            args.push("--identity-file".into());
            args.push(identity.into());
        }
        for option in &self.ssh_options {
            args.push("--ssh-option".into());
            args.push(option.into());
        }
        args
    }
}

/// Default state directory: `$XDG_STATE_HOME/tunkeeper`, else `~/.tunkeeper`.
pub fn default_state_dir() -> Result<PathBuf> {
    if let Some(state) = dirs::state_dir() {
        return Ok(state.join("tunkeeper"));
    }
    let home = dirs::home_dir()
        .ok_or_else(|| Error::Config("cannot determine home directory".into()))?;
    Ok(home.join(".tunkeeper"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn config() -> TunnelConfig {
        TunnelConfig::new("bastion.example.com", "/tmp/tk")
    }

    #[test]
    fn defaults() {
        let config = config();
        assert_eq!(config.remote_port, 22);
        assert_eq!(config.listen_addr(), "127.0.0.1:1080");
        assert_eq!(config.keepalive(), "30s x3");
        assert!(config.reclaim_port);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn destination_with_and_without_user() {
        let mut config = config();
        assert_eq!(config.destination(), "bastion.example.com");
        config.remote_user = Some("deploy".into());
        config.remote_port = 2222;
        assert_eq!(config.destination(), "deploy@bastion.example.com");
        assert_eq!(config.remote_endpoint(), "deploy@bastion.example.com:2222");
    }

    #[test]
    fn ipv6_listen_addr_is_bracketed() {
        let mut config = config();
        config.listen_host = "::1".into();
        assert_eq!(config.listen_addr(), "[::1]:1080");
    }

    #[test]
    fn validate_rejects_missing_host_and_zero_ports() {
        let mut config = config();
        config.remote_host = "  ".into();
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = TunnelConfig::new("h", "/tmp");
        config.listen_port = 0;
        assert!(config.validate().is_err());

        let mut config = TunnelConfig::new("h", "/tmp");
        config.keepalive_interval = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn to_args_carries_optional_fields() {
        let mut config = config();
        config.remote_user = Some("deploy".into());
        config.ssh_options = vec!["Compression=yes".into()];
        let args: Vec<String> = config
            .to_args()
            .into_iter()
            .map(|a| a.into_string().unwrap())
            .collect();
        let pos = args.iter().position(|a| a == "--remote-user").unwrap();
        assert_eq!(args[pos + 1], "deploy");
        let pos = args.iter().position(|a| a == "--ssh-option").unwrap();
        assert_eq!(args[pos + 1], "Compression=yes");
        assert!(!args.contains(&"--identity-file".to_string()));
    }
}
