//! Per-forward traffic counters

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Snapshot of a forward's statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardStats {
    /// Total connections handled
    pub connection_count: u64,
    /// Connections open right now
    pub active_connections: u64,
    /// Bytes sent toward the far side of the tunnel
    pub bytes_sent: u64,
    /// Bytes received from the far side of the tunnel
    pub bytes_received: u64,
}

/// Lock-free counters updated from connection tasks
#[derive(Debug, Default)]
pub struct StatsCounters {
    connection_count: AtomicU64,
    active_connections: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl StatsCounters {
    pub fn snapshot(&self) -> ForwardStats {
        ForwardStats {
            connection_count: self.connection_count.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }

    pub fn add_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_received(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
    }

    /// Count a new connection; it stays active until the guard drops
    pub fn open_connection(self: &Arc<Self>) -> ConnectionGuard {
        self.connection_count.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard(self.clone())
    }
}

pub struct ConnectionGuard(Arc<StatsCounters>);

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_tracks_active() {
        let counters = Arc::new(StatsCounters::default());
        let a = counters.open_connection();
        let b = counters.open_connection();
        counters.add_sent(10);
        drop(a);

        let stats = counters.snapshot();
        assert_eq!(stats.connection_count, 2);
        assert_eq!(stats.active_connections, 1);
        assert_eq!(stats.bytes_sent, 10);
        drop(b);
        assert_eq!(counters.snapshot().active_connections, 0);
    }
}
