//! Services attached to each worker's event loop.
//!
//! # Data Flow
//! ```text
//! Supervisor (once per process):
//!     crypto.rs   SharedSecret::init(secret)     fails startup on error
//!     relay.rs    RelayTable::new()              dropped after the barrier
//!
//! Worker (once per loop):
//!     resolver.rs Resolver::new(worker, mode, nameservers)
//!     relay.rs    UdpRelay::start(worker, udp socket, ...)
//!
//! Per accepted connection:
//!     ConnectionAcceptor::accept(stream, peer, ConnectionContext)
//! ```
//!
//! # Design Decisions
//! - The worker only knows the `ConnectionAcceptor` trait, never the protocol
//! - Acceptor errors end the connection, never the loop
//! - Every collaborator has an explicit shutdown or close call

pub mod crypto;
pub mod relay;
pub mod resolver;
pub mod socks5;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::net::TcpStream;
use tokio::sync::watch;

use crate::net::ConnectionId;

pub use crypto::{CryptoError, SharedSecret};
pub use relay::{RelayTable, UdpRelay};
pub use resolver::{ResolveMode, Resolver};
pub use socks5::Socks5Acceptor;

/// Error type returned by connection acceptors.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Per-connection view of the owning worker's services.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    pub id: ConnectionId,
    pub resolver: Resolver,
    pub secret: Arc<SharedSecret>,
    /// Address of the worker's UDP relay.
    pub relay_addr: SocketAddr,
    pub relay_table: Arc<RelayTable>,
    /// Errors on `changed()` once the worker has closed its relay.
    pub relay_closed: watch::Receiver<()>,
    pub idle_timeout: Duration,
}

/// Handles one accepted inbound connection.
///
/// Invoked on the worker thread that accepted the connection. The returned
/// future runs on that worker's loop and never crosses threads.
pub trait ConnectionAcceptor: Send + Sync + 'static {
    fn accept(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        ctx: ConnectionContext,
    ) -> BoxFuture<'static, Result<(), BoxError>>;
}
