//! Server counters.
//!
//! Plain atomics updated by the reactor and the dispatch workers. Reads are
//! relaxed snapshots.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

#[derive(Debug, Default)]
pub struct ServerStats {
    accepts: AtomicU64,
    handshake_failures: AtomicU64,
    active_connections: AtomicUsize,
    requests: AtomicU64,
    processor_errors: AtomicU64,
    responses_written: AtomicU64,
    closes: AtomicU64,
}

/// Point-in-time copy of [`ServerStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub accepts: u64,
    pub handshake_failures: u64,
    pub active_connections: usize,
    pub requests: u64,
    pub processor_errors: u64,
    pub responses_written: u64,
    pub closes: u64,
}

impl ServerStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn inc_accepts(&self) {
        self.accepts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_handshake_failures(&self) {
        self.handshake_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a close of an established connection.
    #[inline]
    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
        self.closes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_requests(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_processor_errors(&self) {
        self.processor_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_responses_written(&self) {
        self.responses_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepts: self.accepts.load(Ordering::Relaxed),
            handshake_failures: self.handshake_failures.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
            processor_errors: self.processor_errors.load(Ordering::Relaxed),
            responses_written: self.responses_written.load(Ordering::Relaxed),
            closes: self.closes.load(Ordering::Relaxed),
        }
    }
}
