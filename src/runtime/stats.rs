//! Server-wide counters, readable from any thread.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters, updated by the event loop with relaxed atomics.
#[derive(Debug, Default)]
pub struct Stats {
    accepted: AtomicU64,
    closed: AtomicU64,
    reads: AtomicU64,
    replies: AtomicU64,
    errors: AtomicU64,
}

impl Stats {
    pub fn record_accept(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_close(&self) {
        self.closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_read(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reply(&self) {
        self.replies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of the counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            replies: self.replies.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Server statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Connections accepted since startup
    pub accepted: u64,
    /// Connections closed since startup
    pub closed: u64,
    /// Non-empty reads delivered to the observer
    pub reads: u64,
    /// Replies written
    pub replies: u64,
    /// Per-event I/O errors
    pub errors: u64,
}

impl StatsSnapshot {
    /// Connections currently open.
    pub fn active(&self) -> u64 {
        self.accepted.saturating_sub(self.closed)
    }
}
