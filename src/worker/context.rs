//! One worker: its sockets, its services and its accept loop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::lifecycle::shutdown::{WakeListener, WorkerOutcome};
use crate::net::{BoundSockets, ConnectionTracker, Listener, ListenerError};
use crate::observability::metrics;
use crate::service::{ConnectionAcceptor, ConnectionContext, RelayTable, ResolveMode, Resolver, SharedSecret, UdpRelay};
use crate::worker::WorkerError;

/// Pause after a failed accept so a persistent error cannot spin the loop.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Process-wide pieces every worker borrows or shares.
#[derive(Clone)]
pub struct Shared {
    pub secret: Arc<SharedSecret>,
    pub relay_table: Arc<RelayTable>,
    pub acceptor: Arc<dyn ConnectionAcceptor>,
}

/// A worker before it has a loop: pre-bound sockets plus borrowed config.
///
/// Built on the supervisor thread and moved into the owning worker thread.
pub struct WorkerContext<'a> {
    index: usize,
    sockets: BoundSockets,
    config: &'a Config,
    shared: Shared,
}

impl<'a> WorkerContext<'a> {
    pub fn new(index: usize, sockets: BoundSockets, config: &'a Config, shared: Shared) -> Self {
        Self {
            index,
            sockets,
            config,
            shared,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Register the sockets with the current runtime and attach services.
    ///
    /// Must be called from inside the worker's own runtime.
    pub fn start(self) -> Result<ActiveWorker<'a>, WorkerError> {
        let Self {
            index,
            sockets,
            config,
            shared,
        } = self;

        let listener = Listener::from_std(sockets.tcp, config.max_connections)?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| WorkerError::Listener(ListenerError::Register(e)))?;
        let udp = tokio::net::UdpSocket::from_std(sockets.udp).map_err(WorkerError::Relay)?;

        let resolver = Resolver::new(index, ResolveMode::default(), config.nameservers.clone());
        let relay = UdpRelay::start(
            index,
            udp,
            resolver.clone(),
            Arc::clone(&shared.relay_table),
            config.idle_timeout,
        )
        .map_err(WorkerError::Relay)?;

        Ok(ActiveWorker {
            index,
            local_addr,
            listener,
            resolver,
            relay,
            tracker: ConnectionTracker::new(index),
            config,
            shared,
        })
    }
}

/// A worker attached to its loop, ready to serve.
pub struct ActiveWorker<'a> {
    index: usize,
    local_addr: SocketAddr,
    listener: Listener,
    resolver: Resolver,
    relay: UdpRelay,
    tracker: ConnectionTracker,
    config: &'a Config,
    shared: Shared,
}

impl ActiveWorker<'_> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections until `stop` fires, then drain.
    ///
    /// Per-connection errors are logged and never end the loop.
    pub async fn serve(self, stop: WakeListener) -> WorkerOutcome {
        let Self {
            index,
            local_addr,
            listener,
            resolver,
            relay,
            tracker,
            config,
            shared,
        } = self;

        tracing::info!(worker = index, address = %local_addr, "Worker started");
        metrics::record_worker_up(index, true);

        let stop = stop.wait();
        tokio::pin!(stop);

        loop {
            let accepted = tokio::select! {
                _ = &mut stop => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer, permit)) => {
                    let guard = tracker.track();
                    let ctx = ConnectionContext {
                        id: guard.id(),
                        resolver: resolver.clone(),
                        secret: Arc::clone(&shared.secret),
                        relay_addr: relay.local_addr(),
                        relay_table: Arc::clone(&shared.relay_table),
                        relay_closed: relay.closed(),
                        idle_timeout: config.idle_timeout,
                    };
                    let connection = shared.acceptor.accept(stream, peer, ctx);
                    tokio::spawn(async move {
                        let _permit = permit;
                        if let Err(e) = connection.await {
                            tracing::debug!(
                                connection_id = %guard.id(),
                                peer = %peer,
                                error = %e,
                                "Connection closed with error"
                            );
                        }
                        drop(guard);
                    });
                }
                Err(ListenerError::Closed) => break,
                Err(e) => {
                    tracing::warn!(worker = index, error = %e, "Accept failed");
                    metrics::record_accept_error(index);
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }

        // Stop accepting before anything else so the kernel routes new
        // connections to siblings still listening.
        drop(listener);
        resolver.shutdown();
        relay.close();

        tracing::info!(
            worker = index,
            active = tracker.active_count(),
            "Worker stopping, draining connections"
        );

        let outcome = match config.drain_timeout {
            None => {
                tracker.wait_idle().await;
                WorkerOutcome::Drained {
                    served: tracker.served(),
                }
            }
            Some(limit) => match tokio::time::timeout(limit, tracker.wait_idle()).await {
                Ok(()) => WorkerOutcome::Drained {
                    served: tracker.served(),
                },
                Err(_) => {
                    let abandoned = tracker.active_count();
                    tracing::warn!(worker = index, abandoned, "Drain timeout expired");
                    WorkerOutcome::TimedOut {
                        served: tracker.served(),
                        abandoned,
                    }
                }
            },
        };

        metrics::record_worker_up(index, false);
        tracing::info!(worker = index, outcome = ?outcome, "Worker stopped");
        outcome
    }
}
