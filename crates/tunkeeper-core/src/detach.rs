//! Launching the supervisor as a detached background process.

use std::ffi::OsString;
use std::fs::OpenOptions;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use tracing::{debug, info};

use crate::error::{Error, Result};

/// Something that can bring up a supervisor instance.
///
/// Returns the pid of the launched process; the supervisor itself confirms
/// it is up by writing its record.
pub trait SupervisorSpawner {
    fn spawn_supervisor(&self) -> Result<u32>;
}

/// Re-executes a binary in its own process group with stdio on the log file.
#[derive(Debug, Clone)]
pub struct DetachedSpawner {
    exe: PathBuf,
    args: Vec<OsString>,
    log_path: PathBuf,
}

impl DetachedSpawner {
    pub const fn new(exe: PathBuf, args: Vec<OsString>, log_path: PathBuf) -> Self {
        Self {
            exe,
            args,
            log_path,
        }
    }

    /// Re-execute the running binary with `args`.
    pub fn current_exe(args: Vec<OsString>, log_path: PathBuf) -> Result<Self> {
        let exe = std::env::current_exe()?;
        Ok(Self::new(exe, args, log_path))
    }
}

impl SupervisorSpawner for DetachedSpawner {
    fn spawn_supervisor(&self) -> Result<u32> {
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .map_err(|source| Error::StateDir {
                path: self.log_path.clone(),
                source,
            })?;
        let log_err = log.try_clone()?;

        debug!(exe = %self.exe.display(), args = ?self.args, "exec (detached)");
        // A fresh process group keeps terminal signals aimed at the caller
        // away from the supervisor.
        let child = Command::new(&self.exe)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(log)
            .stderr(log_err)
            .process_group(0)
            .spawn()
            .map_err(|e| Error::Spawn(format!("{}: {e}", self.exe.display())))?;
        let pid = child.id();
        info!(pid, log = %self.log_path.display(), "Supervisor detached");
        Ok(pid)
    }
}
