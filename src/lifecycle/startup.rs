//! Startup decisions made before any socket exists.
//!
//! # Responsibilities
//! - Choose single-loop or multi-worker mode from the configuration
//! - Detach from the terminal when daemonized
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Mode is decided once and never revisited
//! - Detaching happens before any runtime or thread is created

use std::fmt;

use thiserror::Error;

/// How the supervisor runs its workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// One loop on the calling thread, shared with signal watching.
    Single,
    /// `n` worker threads plus a signal-watching loop on the calling thread.
    Multi(usize),
}

impl Mode {
    /// Worker counts of zero or one select single-loop mode.
    pub fn select(workers: usize) -> Self {
        if workers <= 1 {
            Mode::Single
        } else {
            Mode::Multi(workers)
        }
    }

    pub fn workers(&self) -> usize {
        match self {
            Mode::Single => 1,
            Mode::Multi(n) => *n,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Single => write!(f, "single"),
            Mode::Multi(n) => write!(f, "multi({n})"),
        }
    }
}

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to detach from terminal: {0}")]
    Detach(#[from] nix::Error),

    #[error("daemon mode is not supported on this platform")]
    Unsupported,
}

/// Detach into the background, keeping the working directory.
///
/// Must run before any thread or runtime is created.
#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd", target_os = "netbsd", target_os = "openbsd"))]
pub fn daemonize() -> Result<(), StartupError> {
    nix::unistd::daemon(true, false)?;
    Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd", target_os = "netbsd", target_os = "openbsd")))]
pub fn daemonize() -> Result<(), StartupError> {
    Err(StartupError::Unsupported)
}
