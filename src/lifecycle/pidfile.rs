//! Lock file gate and the `--signal` control command.
//!
//! The lock file holds one line with the running daemon's pid. It keeps a
//! second daemon from starting and lets `--signal` find the first one.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use thiserror::Error;

use crate::config::ControlSignal;

#[derive(Debug, Error)]
pub enum PidFileError {
    #[error("already running as pid {pid} (lock file {path})")]
    AlreadyRunning { path: PathBuf, pid: i32 },

    #[error("no running instance recorded in {path}")]
    Missing { path: PathBuf },

    #[error("lock file {path} does not contain a pid")]
    Invalid { path: PathBuf },

    #[error("failed to read lock file {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to write lock file {path}: {source}")]
    Write { path: PathBuf, source: io::Error },

    #[error("failed to signal pid {pid}: {source}")]
    Signal { pid: i32, source: Errno },
}

/// Read the recorded pid. A missing file is `Ok(None)`.
pub fn read_pid(path: &Path) -> Result<Option<i32>, PidFileError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(PidFileError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    contents
        .trim()
        .parse::<i32>()
        .ok()
        .filter(|pid| *pid > 0)
        .map(Some)
        .ok_or_else(|| PidFileError::Invalid {
            path: path.to_path_buf(),
        })
}

fn is_alive(pid: i32) -> bool {
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        // Exists but belongs to someone else.
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Whether the lock file names a live process.
pub fn already_running(path: &Path) -> bool {
    matches!(read_pid(path), Ok(Some(pid)) if is_alive(pid))
}

/// Record the current process id.
pub fn write_pid(path: &Path) -> Result<(), PidFileError> {
    fs::write(path, format!("{}\n", std::process::id())).map_err(|source| PidFileError::Write {
        path: path.to_path_buf(),
        source,
    })
}

/// Remove the lock file. Missing files are fine.
pub fn delete_pidfile(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "Lock file removed"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove lock file"),
    }
}

/// Ownership of the lock file path for one daemon run.
///
/// Acquired before any socket is bound. The file is removed when the gate
/// drops, which covers both the orderly shutdown and the startup abort paths.
#[derive(Debug)]
pub struct Gate {
    path: PathBuf,
    recorded: bool,
}

impl Gate {
    pub fn acquire(path: &Path) -> Result<Self, PidFileError> {
        if let Ok(Some(pid)) = read_pid(path) {
            if is_alive(pid) {
                return Err(PidFileError::AlreadyRunning {
                    path: path.to_path_buf(),
                    pid,
                });
            }
            tracing::debug!(path = %path.display(), pid, "Stale lock file");
        }
        Ok(Self {
            path: path.to_path_buf(),
            recorded: false,
        })
    }

    /// Write our pid. Called once every listener is up.
    pub fn record(&mut self) -> Result<(), PidFileError> {
        write_pid(&self.path)?;
        self.recorded = true;
        tracing::debug!(path = %self.path.display(), pid = std::process::id(), "Lock file written");
        Ok(())
    }

    pub fn is_recorded(&self) -> bool {
        self.recorded
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Gate {
    fn drop(&mut self) {
        delete_pidfile(&self.path);
    }
}

impl ControlSignal {
    fn os_signal(&self) -> Signal {
        match self {
            ControlSignal::Quit => Signal::SIGQUIT,
            ControlSignal::Stop => Signal::SIGTERM,
        }
    }
}

/// Deliver `signal` to the process recorded at `path`.
///
/// Returns the signalled pid. Nothing is sent when no pid can be read.
pub fn signal_process(signal: ControlSignal, path: &Path) -> Result<i32, PidFileError> {
    let pid = read_pid(path)?.ok_or_else(|| PidFileError::Missing {
        path: path.to_path_buf(),
    })?;
    kill(Pid::from_raw(pid), signal.os_signal()).map_err(|source| PidFileError::Signal { pid, source })?;
    Ok(pid)
}
