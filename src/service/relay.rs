//! UDP relay (RFC 1928 section 7).
//!
//! Every worker runs one relay task on its UDP socket. A client gets one
//! upstream socket per address family, so a reply is matched to its client by
//! the socket it arrives on, never by the target's address. Which client IPs
//! may use the relay is process-wide: the control connection can land on a
//! different worker than the datagrams.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::observability::metrics;
use crate::service::resolver::Resolver;
use crate::service::socks5::{ProtocolError, TargetAddr};
use crate::service::BoxError;

const MAX_DATAGRAM: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("datagram header too short")]
    Truncated,

    #[error("fragmented datagrams are not supported")]
    Fragmented,

    #[error("malformed target: {0}")]
    Target(#[from] ProtocolError),
}

#[derive(Debug)]
struct Client {
    associations: usize,
    last_seen: Instant,
}

/// Process-wide relay state shared by all workers.
///
/// Created before any worker starts and dropped after the shutdown barrier.
#[derive(Debug, Default)]
pub struct RelayTable {
    clients: DashMap<IpAddr, Client>,
}

impl RelayTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow datagrams from `client` while the returned guard lives.
    pub fn associate(self: &Arc<Self>, client: IpAddr) -> Association {
        let mut entry = self.clients.entry(client).or_insert(Client {
            associations: 0,
            last_seen: Instant::now(),
        });
        entry.associations += 1;
        entry.last_seen = Instant::now();
        drop(entry);

        Association {
            table: Arc::clone(self),
            client,
        }
    }

    pub fn is_associated(&self, client: &IpAddr) -> bool {
        self.clients.contains_key(client)
    }

    /// Record relay traffic for `client`.
    pub fn touch(&self, client: &IpAddr) {
        if let Some(mut entry) = self.clients.get_mut(client) {
            entry.last_seen = Instant::now();
        }
    }

    /// Time since `client` last moved a datagram. `None` when not associated.
    pub fn idle_for(&self, client: &IpAddr) -> Option<Duration> {
        self.clients.get(client).map(|entry| entry.last_seen.elapsed())
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }
}

/// Keeps a client's UDP association open. Released on drop.
#[derive(Debug)]
pub struct Association {
    table: Arc<RelayTable>,
    client: IpAddr,
}

impl Drop for Association {
    fn drop(&mut self) {
        self.table.clients.remove_if_mut(&self.client, |_, entry| {
            entry.associations -= 1;
            entry.associations == 0
        });
    }
}

/// Relay task bound to one worker's UDP socket.
#[derive(Debug)]
pub struct UdpRelay {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
    closed: watch::Sender<()>,
}

impl UdpRelay {
    /// Start relaying on `socket`. Must be called inside the worker's runtime.
    pub fn start(
        worker: usize,
        socket: UdpSocket,
        resolver: Resolver,
        table: Arc<RelayTable>,
        idle: Duration,
    ) -> io::Result<Self> {
        let local_addr = socket.local_addr()?;
        let (resolved_tx, resolved_rx) = mpsc::unbounded_channel();
        let relay = RelayLoop {
            worker,
            socket: Arc::new(socket),
            resolver,
            table,
            idle,
            epoch: Instant::now(),
            sessions: HashMap::new(),
            resolved_tx,
        };
        let task = tokio::spawn(relay.run(resolved_rx));
        let (closed, _) = watch::channel(());
        tracing::debug!(worker, address = %local_addr, "UDP relay started");
        Ok(Self {
            local_addr,
            task,
            closed,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Fires (with an error) once the relay is closed.
    pub fn closed(&self) -> watch::Receiver<()> {
        self.closed.subscribe()
    }

    /// Stop the relay, its sessions and release every socket.
    pub fn close(self) {
        self.task.abort();
        tracing::debug!(address = %self.local_addr, "UDP relay closed");
    }
}

/// Datagram whose domain target finished resolving.
struct Resolved {
    client: SocketAddr,
    dest: SocketAddr,
    payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SessionKey {
    client: SocketAddr,
    ipv6: bool,
}

/// One client's upstream socket and the task relaying its replies.
struct Session {
    upstream: Arc<UdpSocket>,
    last_active: Arc<AtomicU64>,
    replies: JoinHandle<()>,
}

impl Drop for Session {
    fn drop(&mut self) {
        self.replies.abort();
    }
}

struct RelayLoop {
    worker: usize,
    socket: Arc<UdpSocket>,
    resolver: Resolver,
    table: Arc<RelayTable>,
    idle: Duration,
    epoch: Instant,
    sessions: HashMap<SessionKey, Session>,
    resolved_tx: mpsc::UnboundedSender<Resolved>,
}

impl RelayLoop {
    async fn run(mut self, mut resolved: mpsc::UnboundedReceiver<Resolved>) {
        let socket = Arc::clone(&self.socket);
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut sweep = tokio::time::interval(self.idle);
        sweep.tick().await;

        loop {
            tokio::select! {
                received = socket.recv_from(&mut buf) => {
                    let (len, from) = match received {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::debug!(worker = self.worker, error = %e, "UDP receive failed");
                            continue;
                        }
                    };
                    if let Err(e) = self.on_client_datagram(&buf[..len], from).await {
                        tracing::debug!(worker = self.worker, peer = %from, error = %e, "Dropped datagram");
                    }
                }
                Some(r) = resolved.recv() => {
                    if let Err(e) = self.send_upstream(r.client, r.dest, &r.payload).await {
                        tracing::debug!(worker = self.worker, peer = %r.client, error = %e, "Dropped datagram");
                    }
                }
                _ = sweep.tick() => {
                    let removed = self.expire();
                    if removed > 0 {
                        tracing::trace!(worker = self.worker, removed, "Expired UDP sessions");
                    }
                }
            }
        }
    }

    async fn on_client_datagram(&mut self, datagram: &[u8], from: SocketAddr) -> Result<(), BoxError> {
        if !self.table.is_associated(&from.ip()) {
            tracing::trace!(worker = self.worker, peer = %from, "Datagram from unassociated peer");
            return Ok(());
        }

        let (target, payload) = parse_datagram(datagram)?;
        match target {
            TargetAddr::Ip(dest) => self.send_upstream(from, dest, payload).await?,
            TargetAddr::Domain(host, port) => {
                // Resolve off the receive path; the loop sends once it's done.
                let resolver = self.resolver.clone();
                let resolved = self.resolved_tx.clone();
                let payload = payload.to_vec();
                let worker = self.worker;
                tokio::spawn(async move {
                    match resolver.lookup(&host, port).await {
                        Ok(dest) => {
                            let _ = resolved.send(Resolved {
                                client: from,
                                dest,
                                payload,
                            });
                        }
                        Err(e) => tracing::debug!(worker, host = %host, error = %e, "Dropped datagram"),
                    }
                });
            }
        }
        Ok(())
    }

    async fn send_upstream(&mut self, client: SocketAddr, dest: SocketAddr, payload: &[u8]) -> io::Result<()> {
        let key = SessionKey {
            client,
            ipv6: dest.is_ipv6(),
        };
        let session = match self.sessions.entry(key) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let session = open_session(
                    self.worker,
                    key,
                    Arc::clone(&self.socket),
                    Arc::clone(&self.table),
                    self.epoch,
                )?;
                entry.insert(session)
            }
        };
        session.last_active.store(millis_since(self.epoch), Ordering::Relaxed);
        let upstream = Arc::clone(&session.upstream);

        self.table.touch(&client.ip());
        upstream.send_to(payload, dest).await?;
        metrics::record_relay_datagram("outbound");
        Ok(())
    }

    /// Drop sessions idle for longer than `idle` or whose client went away.
    fn expire(&mut self) -> usize {
        let before = self.sessions.len();
        let now = millis_since(self.epoch);
        let idle = self.idle.as_millis() as u64;
        let table = &self.table;
        self.sessions.retain(|key, session| {
            now.saturating_sub(session.last_active.load(Ordering::Relaxed)) < idle
                && table.is_associated(&key.client.ip())
        });
        before - self.sessions.len()
    }
}

fn open_session(
    worker: usize,
    key: SessionKey,
    downstream: Arc<UdpSocket>,
    table: Arc<RelayTable>,
    epoch: Instant,
) -> io::Result<Session> {
    let bind = if key.ipv6 {
        SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
    } else {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
    };
    let socket = std::net::UdpSocket::bind(bind)?;
    socket.set_nonblocking(true)?;
    let upstream = Arc::new(UdpSocket::from_std(socket)?);
    let last_active = Arc::new(AtomicU64::new(millis_since(epoch)));

    let replies = tokio::spawn(relay_replies(
        key.client,
        Arc::clone(&upstream),
        downstream,
        table,
        Arc::clone(&last_active),
        epoch,
    ));
    tracing::debug!(worker, client = %key.client, "UDP session opened");

    Ok(Session {
        upstream,
        last_active,
        replies,
    })
}

/// Wrap every datagram arriving on `upstream` and hand it to `client`.
async fn relay_replies(
    client: SocketAddr,
    upstream: Arc<UdpSocket>,
    downstream: Arc<UdpSocket>,
    table: Arc<RelayTable>,
    last_active: Arc<AtomicU64>,
    epoch: Instant,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, origin) = match upstream.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!(client = %client, error = %e, "UDP upstream receive failed");
                continue;
            }
        };
        last_active.store(millis_since(epoch), Ordering::Relaxed);
        table.touch(&client.ip());

        let datagram = encode_datagram(&TargetAddr::Ip(origin), &buf[..len]);
        match downstream.send_to(&datagram, client).await {
            Ok(_) => metrics::record_relay_datagram("inbound"),
            Err(e) => tracing::debug!(client = %client, error = %e, "Dropped reply"),
        }
    }
}

fn millis_since(epoch: Instant) -> u64 {
    epoch.elapsed().as_millis() as u64
}

/// Split a client datagram into its target and payload.
pub fn parse_datagram(datagram: &[u8]) -> Result<(TargetAddr, &[u8]), RelayError> {
    if datagram.len() < 4 {
        return Err(RelayError::Truncated);
    }
    if datagram[2] != 0 {
        return Err(RelayError::Fragmented);
    }
    let (target, used) = TargetAddr::decode(&datagram[3..])?;
    Ok((target, &datagram[3 + used..]))
}

/// Wrap a reply payload with the header naming its origin.
pub fn encode_datagram(origin: &TargetAddr, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 22);
    out.extend_from_slice(&[0, 0, 0]);
    origin.encode(&mut out);
    out.extend_from_slice(payload);
    out
}
