//! Relay statistics tracking.
//!
//! Counters are lock-free and shared between a coordinator and its session
//! tasks.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Thread-safe relay statistics
#[derive(Debug, Default)]
pub struct RelayStats {
    /// Sessions that completed their handshake
    opened: AtomicU64,
    /// Sessions refused at the concurrency cap
    rejected: AtomicU64,
    /// Sessions that reached `Disconnected` after cleanup
    closed: AtomicU64,
    /// Sessions that ended in `Fatal`
    fatal: AtomicU64,
    /// Command/response exchanges completed
    commands: AtomicU64,
    /// INQUIRE reply blocks forwarded
    inquiries: AtomicU64,
    /// Bytes received from peers
    bytes_in: AtomicU64,
    /// Bytes sent to peers
    bytes_out: AtomicU64,
}

impl RelayStats {
    /// Create new stats tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed handshake
    pub fn record_opened(&self) {
        self.opened.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection refused at capacity
    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a session ending, cleanly or not
    pub fn record_closed(&self, fatal: bool) {
        if fatal {
            self.fatal.fetch_add(1, Ordering::Relaxed);
        } else {
            self.closed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a finished exchange
    pub fn record_command(&self, bytes_in: usize, bytes_out: usize) {
        self.commands.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes_in as u64, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes_out as u64, Ordering::Relaxed);
    }

    /// Record a forwarded INQUIRE reply block
    pub fn record_inquiry(&self) {
        self.inquiries.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of all counters
    pub fn summary(&self) -> StatsSummary {
        StatsSummary {
            opened: self.opened.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
            fatal: self.fatal.load(Ordering::Relaxed),
            commands: self.commands.load(Ordering::Relaxed),
            inquiries: self.inquiries.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of [`RelayStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSummary {
    /// Sessions that completed their handshake
    pub opened: u64,
    /// Sessions refused at the concurrency cap
    pub rejected: u64,
    /// Sessions cleaned up successfully
    pub closed: u64,
    /// Sessions that ended in `Fatal`
    pub fatal: u64,
    /// Exchanges completed
    pub commands: u64,
    /// INQUIRE reply blocks forwarded
    pub inquiries: u64,
    /// Bytes received
    pub bytes_in: u64,
    /// Bytes sent
    pub bytes_out: u64,
}

impl StatsSummary {
    /// Sessions opened but not yet ended
    pub fn active(&self) -> u64 {
        self.opened.saturating_sub(self.closed + self.fatal)
    }
}
