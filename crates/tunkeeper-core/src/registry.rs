//! Persistent pid records and the stop flag.
//!
//! The state directory holds one JSON record per [`RecordKind`] plus an
//! existence-only stop flag. Records are replaced atomically (temp file in the
//! same directory, then rename) so a concurrent reader sees either the old or
//! the new record, never a torn one. There is no locking: callers re-verify
//! liveness before acting on what they read.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::process;

/// File name of the supervisor record.
pub const SUPERVISOR_FILE: &str = "supervisor.pid";
/// File name of the child record.
pub const CHILD_FILE: &str = "child.pid";
/// File name of the stop flag.
pub const STOP_FILE: &str = "stop";
/// File name of the append-only log.
pub const LOG_FILE: &str = "tunkeeper.log";

/// Which process a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Supervisor,
    Child,
}

impl RecordKind {
    const fn file_name(self) -> &'static str {
        match self {
            Self::Supervisor => SUPERVISOR_FILE,
            Self::Child => CHILD_FILE,
        }
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Supervisor => write!(f, "supervisor"),
            Self::Child => write!(f, "child"),
        }
    }
}

/// A persisted process identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub pid: u32,
    /// Unix seconds at which the record was written.
    pub started_at: u64,
}

impl Record {
    /// A record for `pid` stamped with the current time.
    pub fn now(pid: u32) -> Self {
        Self {
            pid,
            started_at: unix_now(),
        }
    }

    /// A record for the calling process.
    pub fn current() -> Self {
        Self::now(std::process::id())
    }

    /// Whether the recorded process is still alive.
    pub fn is_alive(&self) -> bool {
        process::is_alive(self.pid)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// File-backed registry rooted at a state directory.
#[derive(Debug, Clone)]
pub struct ProcessRegistry {
    dir: PathBuf,
}

impl ProcessRegistry {
    /// Open the registry, creating the state directory if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|source| Error::StateDir {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    /// The state directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the append-only log file.
    pub fn log_path(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }

    fn path(&self, kind: RecordKind) -> PathBuf {
        self.dir.join(kind.file_name())
    }

    /// Read a record. Missing or unparseable files read as absent.
    pub fn read(&self, kind: RecordKind) -> Option<Record> {
        let path = self.path(kind);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(%kind, path = %path.display(), error = %e, "Failed to read record");
                return None;
            }
        };
        match serde_json::from_str(&content) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(%kind, path = %path.display(), error = %e, "Ignoring corrupt record");
                None
            }
        }
    }

    /// Pid stored for `kind`, if any.
    pub fn pid(&self, kind: RecordKind) -> Option<u32> {
        self.read(kind).map(|record| record.pid)
    }

    /// Read a record and drop it when its process is gone.
    pub fn read_live(&self, kind: RecordKind) -> Option<Record> {
        self.read(kind).filter(Record::is_alive)
    }

    /// Atomically replace the record for `kind`.
    pub fn write(&self, kind: RecordKind, record: &Record) -> Result<()> {
        let json = serde_json::to_vec(record)?;
        let state_dir_err = |source| Error::StateDir {
            path: self.dir.clone(),
            source,
        };
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir).map_err(state_dir_err)?;
        tmp.write_all(&json).map_err(state_dir_err)?;
        tmp.as_file().sync_all().map_err(state_dir_err)?;
        tmp.persist(self.path(kind))
            .map_err(|e| state_dir_err(e.error))?;
        debug!(%kind, pid = record.pid, "Record written");
        Ok(())
    }

    /// Remove the record for `kind`. Removing an absent record is fine.
    pub fn clear(&self, kind: RecordKind) -> Result<()> {
        remove_if_exists(&self.path(kind))?;
        debug!(%kind, "Record cleared");
        Ok(())
    }

    /// Raise the stop flag.
    pub fn request_stop(&self) -> Result<()> {
        std::fs::write(self.dir.join(STOP_FILE), b"").map_err(|source| Error::StateDir {
            path: self.dir.clone(),
            source,
        })
    }

    /// Whether the stop flag is raised.
    pub fn stop_requested(&self) -> bool {
        self.dir.join(STOP_FILE).exists()
    }

    /// Lower the stop flag. Idempotent.
    pub fn clear_stop(&self) -> Result<()> {
        remove_if_exists(&self.dir.join(STOP_FILE))
    }

    /// Resolves once the stop flag is raised, checking every `poll`.
    pub async fn wait_for_stop(&self, poll: Duration) {
        let mut ticker = tokio::time::interval(poll);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if self.stop_requested() {
                return;
            }
        }
    }

    /// Clear both records and the stop flag, logging rather than failing.
    pub fn clear_all(&self) {
        for kind in [RecordKind::Child, RecordKind::Supervisor] {
            if let Err(e) = self.clear(kind) {
                warn!(%kind, error = %e, "Failed to clear record");
            }
        }
        if let Err(e) = self.clear_stop() {
            warn!(error = %e, "Failed to clear stop flag");
        }
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
