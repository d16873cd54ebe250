//! Worker subsystem.
//!
//! # Data Flow
//! ```text
//! Supervisor thread:
//!     WorkerContext::new(index, pre-bound sockets, &Config, shared services)
//!     → moved into the worker thread (or run inline in single mode)
//!
//! Worker loop:
//!     start()  register sockets, attach resolver and UDP relay
//!     serve()  accept until the wake token fires
//!              → close listener, shut down resolver, close relay
//!              → drain in-flight connections
//!              → return a WorkerOutcome for the shutdown barrier
//! ```
//!
//! # Design Decisions
//! - A context borrows the Config; scoped threads make teardown wait for it
//! - Connections never leave the loop that accepted them
//! - Accept errors back off and retry rather than ending the worker

pub mod context;

use thiserror::Error;

use crate::net::ListenerError;

pub use context::{ActiveWorker, Shared, WorkerContext};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to build event loop: {0}")]
    Runtime(std::io::Error),

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error("failed to start UDP relay: {0}")]
    Relay(std::io::Error),

    #[error("worker exited before reporting ready")]
    Exited,
}
