//! Connection lifecycle tracking.
//!
//! # Responsibilities
//! - Generate per-worker connection IDs for tracing
//! - Count in-flight connections so a stopped worker can drain
//! - Collect per-connection metrics

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

use crate::observability::metrics;

/// Identifier for a connection, unique within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    worker: usize,
    seq: u64,
}

impl ConnectionId {
    /// Worker that accepted the connection.
    pub fn worker(&self) -> usize {
        self.worker
    }

    /// Sequence number within the worker.
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "w{}-conn-{}", self.worker, self.seq)
    }
}

/// Tracks active connections of one worker.
///
/// The active count lives in a watch channel so draining can await zero
/// instead of polling.
#[derive(Debug)]
pub struct ConnectionTracker {
    worker: usize,
    next_seq: AtomicU64,
    active: Arc<watch::Sender<u64>>,
}

impl ConnectionTracker {
    /// Create a tracker for the given worker.
    pub fn new(worker: usize) -> Self {
        let (tx, _) = watch::channel(0);
        Self {
            worker,
            next_seq: AtomicU64::new(1),
            active: Arc::new(tx),
        }
    }

    /// Record a new active connection. Returns a guard that decrements on drop.
    pub fn track(&self) -> ConnectionGuard {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.active.send_modify(|count| *count += 1);
        metrics::record_connection_opened(self.worker);
        ConnectionGuard {
            active: Arc::clone(&self.active),
            id: ConnectionId {
                worker: self.worker,
                seq,
            },
        }
    }

    /// Get current active connection count.
    pub fn active_count(&self) -> u64 {
        *self.active.borrow()
    }

    /// Total connections handed out so far.
    pub fn served(&self) -> u64 {
        self.next_seq.load(Ordering::Relaxed) - 1
    }

    /// Wait until every tracked connection has closed.
    pub async fn wait_idle(&self) {
        let mut rx = self.active.subscribe();
        // The sender is owned by self, so the channel cannot close here.
        let _ = rx.wait_for(|count| *count == 0).await;
    }
}

/// Guard that tracks a connection's lifetime.
/// Decrements active count when dropped.
#[derive(Debug)]
pub struct ConnectionGuard {
    active: Arc<watch::Sender<u64>>,
    id: ConnectionId,
}

impl ConnectionGuard {
    /// Get this connection's ID.
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active.send_modify(|count| *count -= 1);
        metrics::record_connection_closed(self.id.worker);
        tracing::trace!(connection_id = %self.id, "Connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn connection_ids_unique_per_worker() {
        let tracker = ConnectionTracker::new(3);
        let a = tracker.track();
        let b = tracker.track();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.id().worker(), 3);
        assert_eq!(b.id().seq(), 2);
        assert_eq!(a.id().to_string(), "w3-conn-1");
    }

    #[test]
    fn connection_tracker_counts() {
        let tracker = ConnectionTracker::new(0);
        assert_eq!(tracker.active_count(), 0);

        let guard1 = tracker.track();
        assert_eq!(tracker.active_count(), 1);

        let guard2 = tracker.track();
        assert_eq!(tracker.active_count(), 2);

        drop(guard1);
        assert_eq!(tracker.active_count(), 1);

        drop(guard2);
        assert_eq!(tracker.active_count(), 0);
        assert_eq!(tracker.served(), 2);
    }

    #[tokio::test]
    async fn wait_idle_returns_when_last_guard_drops() {
        let tracker = ConnectionTracker::new(0);
        let guard = tracker.track();

        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(guard);
        });

        tokio::time::timeout(Duration::from_secs(2), tracker.wait_idle())
            .await
            .expect("drain should complete");
        release.await.unwrap();
    }

    #[tokio::test]
    async fn wait_idle_is_immediate_without_connections() {
        let tracker = ConnectionTracker::new(0);
        tokio::time::timeout(Duration::from_millis(100), tracker.wait_idle())
            .await
            .unwrap();
    }
}
