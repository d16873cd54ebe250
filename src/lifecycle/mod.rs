//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs, supervisor.rs):
//!     Validate config → Init crypto → Acquire lock file gate
//!     → Pick mode → Bind sockets → Start workers → Record pid
//!
//! Signals (signals.rs):
//!     SIGINT/SIGQUIT → graceful: wake every worker once
//!     SIGTERM        → forced: remove lock file, exit 0
//!
//! Shutdown (shutdown.rs):
//!     Wake token → Stop accepting → Drain connections
//!     → Post completion → Barrier full → Global teardown
//!
//! Control (pidfile.rs):
//!     --signal quit|stop → read pid → SIGQUIT|SIGTERM
//! ```
//!
//! # Design Decisions
//! - Ordered startup: nothing touches the network before config and crypto
//! - No partial success: one failed worker stops the others
//! - Teardown waits for every completion; scoped threads enforce it
//! - Drain is unbounded unless a drain timeout is configured

pub mod pidfile;
pub mod shutdown;
pub mod signals;
pub mod startup;
pub mod supervisor;

pub use pidfile::{already_running, signal_process, Gate, PidFileError};
pub use shutdown::{Completion, ShutdownBarrier, WorkerOutcome};
pub use signals::{SignalRouter, StopRequest};
pub use startup::{daemonize, Mode, StartupError};
pub use supervisor::{ShutdownReport, Supervisor, SupervisorError, SupervisorHandle};
