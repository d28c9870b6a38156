//! One daemon per state directory.
//!
//! An exclusive `flock` on the lock file makes check-then-claim atomic between
//! racing starters; the PID marker records who holds it. A marker naming a dead
//! process is stale and gets overwritten.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};
use tracing::{info, warn};

use crate::error::SingletonError;
use crate::process::is_pid_alive;

pub struct SingletonGuard {
    pid_file: PathBuf,
    _lock: Flock<File>,
    released: bool,
}

impl SingletonGuard {
    pub fn acquire(pid_file: &Path, lock_file: &Path) -> Result<Self, SingletonError> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(lock_file)?;
        let lock = Flock::lock(file, FlockArg::LockExclusiveNonblock)
            .map_err(|_| SingletonError::Locked(lock_file.to_path_buf()))?;

        match read_pid_file(pid_file) {
            Ok(Some(pid)) if is_pid_alive(pid) => {
                warn!(target = "fleetd::singleton", pid, path = %pid_file.display(), "daemon already running");
                return Err(SingletonError::AlreadyRunning(pid));
            }
            Ok(Some(pid)) => {
                warn!(target = "fleetd::singleton", pid, path = %pid_file.display(), "stale PID file found, reclaiming");
            }
            Ok(None) => {}
            Err(SingletonError::InvalidPidFile(contents)) => {
                warn!(target = "fleetd::singleton", contents = %contents, path = %pid_file.display(), "unreadable PID file, reclaiming");
            }
            Err(e) => return Err(e),
        }

        write_pid_file(pid_file)?;
        Ok(Self {
            pid_file: pid_file.to_path_buf(),
            _lock: lock,
            released: false,
        })
    }

    /// Remove the marker. The lock itself goes away when the guard drops.
    pub fn release(mut self) -> Result<(), SingletonError> {
        self.released = true;
        remove_pid_file(&self.pid_file)
    }
}

impl Drop for SingletonGuard {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = remove_pid_file(&self.pid_file) {
                warn!(target = "fleetd::singleton", error = %e, "failed removing PID file");
            }
        }
    }
}

pub fn read_pid_file(path: &Path) -> Result<Option<u32>, SingletonError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => contents
            .trim()
            .parse::<u32>()
            .map(Some)
            .map_err(|_| SingletonError::InvalidPidFile(contents.trim().to_string())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn write_pid_file(path: &Path) -> Result<(), SingletonError> {
    let pid = std::process::id();
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    write!(tmp, "{pid}")?;
    tmp.persist(path).map_err(|e| e.error)?;
    info!(target = "fleetd::singleton", pid, path = %path.display(), "wrote PID file");
    Ok(())
}

/// Only removes the marker if it still names this process.
fn remove_pid_file(path: &Path) -> Result<(), SingletonError> {
    match read_pid_file(path) {
        Ok(Some(pid)) if pid != std::process::id() => Ok(()),
        Ok(None) => Ok(()),
        _ => match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        },
    }
}
