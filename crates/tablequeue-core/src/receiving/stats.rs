//! Counters for pump activity.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters shared by the polling loop and every receive task
#[derive(Debug, Default)]
pub struct PumpStats {
    /// Peek attempts, successful or not
    pub peeks: AtomicU64,
    /// Rows received as valid messages
    pub received: AtomicU64,
    /// Messages handed to the application callback successfully
    pub delivered: AtomicU64,
    /// Poison rows moved to the error queue
    pub poison: AtomicU64,
    /// Delayed messages forwarded to another queue
    pub forwarded: AtomicU64,
    /// Expired messages dropped without delivery
    pub expired: AtomicU64,
    /// Deliveries that failed and went through recoverability
    pub failed: AtomicU64,
}

impl PumpStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn increment(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Read every counter at once
    pub fn snapshot(&self) -> PumpStatsSnapshot {
        PumpStatsSnapshot {
            peeks: self.peeks.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            poison: self.poison.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`PumpStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PumpStatsSnapshot {
    pub peeks: u64,
    pub received: u64,
    pub delivered: u64,
    pub poison: u64,
    pub forwarded: u64,
    pub expired: u64,
    pub failed: u64,
}
