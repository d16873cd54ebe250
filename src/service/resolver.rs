//! Per-loop name resolution.
//!
//! Each worker owns one `Resolver`. Lookups go through the system resolver;
//! the configured nameserver list is carried for collaborators that speak DNS
//! directly.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;

/// Address family preference for lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResolveMode {
    #[default]
    Ipv4,
    Ipv6,
    Any,
}

impl ResolveMode {
    fn accepts(&self, addr: &SocketAddr) -> bool {
        match self {
            ResolveMode::Ipv4 => addr.is_ipv4(),
            ResolveMode::Ipv6 => addr.is_ipv6(),
            ResolveMode::Any => true,
        }
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("resolver is shut down")]
    Shutdown,

    #[error("no usable address for {0}")]
    NotFound(String),

    #[error("lookup failed: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug)]
struct Inner {
    worker: usize,
    mode: ResolveMode,
    nameservers: Vec<SocketAddr>,
    shut_down: AtomicBool,
}

/// Resolver handle bound to one worker's loop. Clones share state.
#[derive(Debug, Clone)]
pub struct Resolver {
    inner: Arc<Inner>,
}

impl Resolver {
    pub fn new(worker: usize, mode: ResolveMode, nameservers: Vec<SocketAddr>) -> Self {
        tracing::debug!(worker, ?mode, nameservers = nameservers.len(), "Resolver attached");
        Self {
            inner: Arc::new(Inner {
                worker,
                mode,
                nameservers,
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// Resolve `host:port`. IP literals bypass the lookup.
    pub async fn lookup(&self, host: &str, port: u16) -> Result<SocketAddr, ResolveError> {
        if self.is_shut_down() {
            return Err(ResolveError::Shutdown);
        }
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, port));
        }

        let mode = self.inner.mode;
        tokio::net::lookup_host((host, port))
            .await?
            .find(|addr| mode.accepts(addr))
            .ok_or_else(|| ResolveError::NotFound(host.to_string()))
    }

    /// Reject further lookups. In-flight lookups finish normally.
    pub fn shutdown(&self) {
        if !self.inner.shut_down.swap(true, Ordering::SeqCst) {
            tracing::debug!(worker = self.inner.worker, "Resolver shut down");
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    pub fn nameservers(&self) -> &[SocketAddr] {
        &self.inner.nameservers
    }

    pub fn mode(&self) -> ResolveMode {
        self.inner.mode
    }
}
