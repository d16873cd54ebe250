//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Supervisor thread:
//!     socket.rs (create, SO_REUSEPORT, bind, listen)
//!     → BoundSockets moved into the owning worker
//!
//! Worker thread:
//!     → listener.rs (register with the loop, accept, connection limits)
//!     → connection.rs (ids, in-flight tracking for drain)
//!     → hand off to the connection acceptor
//! ```
//!
//! # Design Decisions
//! - Sockets are fully bound before any worker thread starts
//! - Bounded accept prevents resource exhaustion
//! - Each connection tracked for graceful shutdown

pub mod connection;
pub mod listener;
pub mod socket;

pub use connection::{ConnectionGuard, ConnectionId, ConnectionTracker};
pub use listener::{ConnectionPermit, Listener, ListenerError};
pub use socket::{bind_shared, BoundSockets};
