//! The tunnel launcher: builds the child command the supervisor keeps alive.
//!
//! The supervisor never looks inside the tunnel. It only needs a command to
//! spawn and a way to recognise that command's processes when reclaiming the
//! port from a previous, crashed run.

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;

use crate::config::TunnelConfig;

/// Produces the child process for each launch attempt.
pub trait TunnelLauncher: Send + Sync {
    /// A fresh command for one launch.
    fn command(&self) -> Command;

    /// Whether a foreign command line looks like one of our launches.
    fn matches_command_line(&self, command_line: &str) -> bool;
}

/// Launches `ssh -N -D <listen>` against the configured remote.
#[derive(Debug, Clone)]
pub struct SshLauncher {
    config: TunnelConfig,
}

impl SshLauncher {
    pub const fn new(config: TunnelConfig) -> Self {
        Self { config }
    }

    /// Arguments passed to ssh, in order.
    pub fn args(&self) -> Vec<String> {
        let config = &self.config;
        let mut args = vec![
            "-N".to_string(),
            "-D".to_string(),
            config.listen_addr(),
            "-p".to_string(),
            config.remote_port.to_string(),
            "-o".to_string(),
            format!("ServerAliveInterval={}", config.keepalive_interval),
            "-o".to_string(),
            format!("ServerAliveCountMax={}", config.keepalive_max_missed),
            "-o".to_string(),
            "ExitOnForwardFailure=yes".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
        ];
        if let Some(identity) = &config.identity_file {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        for option in &config.ssh_options {
            args.push("-o".to_string());
            args.push(option.clone());
        }
        args.push(config.destination());
        args
    }

    fn program_name(&self) -> Option<&str> {
        self.config.ssh_bin.file_name().and_then(|n| n.to_str())
    }
}

impl TunnelLauncher for SshLauncher {
    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.config.ssh_bin);
        cmd.args(self.args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            // stderr stays inherited so ssh diagnostics land in the log.
            .stderr(Stdio::inherit())
            .kill_on_drop(false);
        cmd
    }

    fn matches_command_line(&self, command_line: &str) -> bool {
        let mut tokens = command_line.split_whitespace();
        let Some(program) = tokens.next() else {
            return false;
        };
        let basename = Path::new(program)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(program);
        if Some(basename) != self.program_name() {
            return false;
        }
        let port = self.config.listen_port.to_string();
        let rest: Vec<&str> = tokens.collect();
        rest.iter().enumerate().any(|(i, token)| {
            let spec = if *token == "-D" {
                rest.get(i + 1).copied()
            } else {
                token.strip_prefix("-D").filter(|s| !s.is_empty())
            };
            spec.is_some_and(|spec| forwards_port(spec, &port))
        })
    }
}

/// `-D` accepts `port`, `host:port` or `[v6]:port`.
fn forwards_port(spec: &str, port: &str) -> bool {
    spec == port || spec.rsplit_once(':').is_some_and(|(_, p)| p == port)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn launcher() -> SshLauncher {
        let mut config = TunnelConfig::new("bastion.example.com", "/tmp/tk");
        config.remote_user = Some("deploy".into());
        SshLauncher::new(config)
    }

    #[test]
    fn args_build_dynamic_forward() {
        let args = launcher().args();
        assert_eq!(&args[..3], ["-N", "-D", "127.0.0.1:1080"]);
        assert!(args.contains(&"ServerAliveInterval=30".to_string()));
        assert!(args.contains(&"ServerAliveCountMax=3".to_string()));
        assert!(args.contains(&"ExitOnForwardFailure=yes".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("deploy@bastion.example.com"));
    }

    #[test]
    fn args_include_identity_and_extra_options() {
        let mut config = TunnelConfig::new("h", "/tmp/tk");
        config.identity_file = Some("/home/me/.ssh/tunnel".into());
        config.ssh_options = vec!["Compression=yes".into()];
        let args = SshLauncher::new(config).args();
        let i = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[i + 1], "/home/me/.ssh/tunnel");
        assert!(args.contains(&"Compression=yes".to_string()));
    }

    #[test]
    fn matches_own_command_line() {
        let launcher = launcher();
        let line = format!("ssh {}", launcher.args().join(" "));
        assert!(launcher.matches_command_line(&line));
        assert!(launcher.matches_command_line("/usr/bin/ssh -N -D 1080 other-host"));
        assert!(launcher.matches_command_line("ssh -fN -D1080 other-host"));
        assert!(launcher.matches_command_line("ssh -N -D [::1]:1080 h"));
    }

    #[test]
    fn rejects_other_programs_and_ports() {
        let launcher = launcher();
        assert!(!launcher.matches_command_line(""));
        assert!(!launcher.matches_command_line("nginx: master process"));
        assert!(!launcher.matches_command_line("python3 -m http.server 1080"));
        assert!(!launcher.matches_command_line("ssh -N -D 127.0.0.1:9050 h"));
        assert!(!launcher.matches_command_line("ssh -L 1080:localhost:80 h"));
        assert!(!launcher.matches_command_line("sshd: deploy@pts/0 -D 1080"));
    }
}
