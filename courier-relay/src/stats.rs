//! Relay counters, lock-free on the hot path.

use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of [`RelayStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub frames_received: u64,
    /// Frames that were malformed, unknown, or failed in a handler
    pub frames_dropped: u64,
    pub live_deliveries: u64,
    pub queued_deliveries: u64,
}

#[derive(Debug, Default)]
pub struct RelayStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    frames_received: AtomicU64,
    frames_dropped: AtomicU64,
    live_deliveries: AtomicU64,
    queued_deliveries: AtomicU64,
}

impl RelayStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn live_delivery(&self) {
        self.live_deliveries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn queued_delivery(&self) {
        self.queued_deliveries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ServerStats {
        ServerStats {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            live_deliveries: self.live_deliveries.load(Ordering::Relaxed),
            queued_deliveries: self.queued_deliveries.load(Ordering::Relaxed),
        }
    }
}
