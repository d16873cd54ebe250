//! xsocksd: encrypted SOCKS-style tunnel daemon library.

pub mod config;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod service;
pub mod worker;

pub use config::schema::{Config, ServerConfig};
pub use lifecycle::{ShutdownReport, Supervisor, SupervisorError, SupervisorHandle};
pub use service::{ConnectionAcceptor, ConnectionContext, Socks5Acceptor};
