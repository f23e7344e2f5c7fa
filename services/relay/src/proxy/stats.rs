//! Relay counters.
//!
//! Written only by the event-loop thread, read by the administrative service.

use std::sync::atomic::{AtomicU64, Ordering};

/// Statistics for a relay.
#[derive(Debug, Default)]
pub struct RelayStats {
    /// Total connections accepted (including rejected ones).
    pub connections_accepted: AtomicU64,
    /// Connections currently holding a slot.
    pub connections_active: AtomicU64,
    /// Connections torn down after holding a slot.
    pub connections_closed: AtomicU64,
    /// Connections rejected because the slot table was full.
    pub connections_rejected: AtomicU64,
    /// Origin connects that failed.
    pub origin_connect_failed: AtomicU64,
    /// Bytes relayed from clients to the origin.
    pub bytes_to_origin: AtomicU64,
    /// Bytes relayed from the origin to clients.
    pub bytes_to_client: AtomicU64,
}

/// Point-in-time copy of [`RelayStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStatsSnapshot {
    pub connections_accepted: u64,
    pub connections_active: u64,
    pub connections_closed: u64,
    pub connections_rejected: u64,
    pub origin_connect_failed: u64,
    pub bytes_to_origin: u64,
    pub bytes_to_client: u64,
}

impl RelayStatsSnapshot {
    /// Bytes relayed in both directions.
    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_to_origin.saturating_add(self.bytes_to_client)
    }
}

impl RelayStats {
    pub fn snapshot(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            origin_connect_failed: self.origin_connect_failed.load(Ordering::Relaxed),
            bytes_to_origin: self.bytes_to_origin.load(Ordering::Relaxed),
            bytes_to_client: self.bytes_to_client.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_accepted(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_opened(&self) {
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Account for every live slot closed at once on shutdown.
    pub(crate) fn record_shutdown(&self, closed: usize) {
        let closed = closed as u64;
        self.connections_active.fetch_sub(closed, Ordering::Relaxed);
        self.connections_closed.fetch_add(closed, Ordering::Relaxed);
    }

    pub(crate) fn record_connect_failed(&self) {
        self.origin_connect_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_to_origin(&self, bytes: usize) {
        self.bytes_to_origin.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_to_client(&self, bytes: usize) {
        self.bytes_to_client.fetch_add(bytes as u64, Ordering::Relaxed);
    }
}
