//! Attempt tracking for messages whose receive was rolled back.
//!
//! A rolled-back row is received again as a fresh message, so the attempt
//! count has to live outside the message. Entries are keyed by transport id
//! and evicted oldest-first once the table is full.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Default number of messages tracked at once
pub const DEFAULT_MAX_TRACKED_MESSAGES: usize = 1000;

/// Bounded map from transport id to failed processing attempts
#[derive(Debug)]
pub struct FailureInfoStorage {
    max_entries: usize,
    inner: Mutex<FailureInfo>,
}

#[derive(Debug, Default)]
struct FailureInfo {
    attempts: HashMap<String, u32>,
    insertion_order: VecDeque<String>,
}

impl FailureInfoStorage {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries: max_entries.max(1),
            inner: Mutex::new(FailureInfo::default()),
        }
    }

    /// Record a failed attempt and return the attempts so far, this one included
    pub fn record_failure(&self, transport_id: &str) -> u32 {
        let mut inner = self.lock();

        if let Some(attempts) = inner.attempts.get_mut(transport_id) {
            *attempts += 1;
            return *attempts;
        }

        while inner.attempts.len() >= self.max_entries {
            let Some(oldest) = inner.insertion_order.pop_front() else {
                break;
            };
            inner.attempts.remove(&oldest);
        }

        inner.attempts.insert(transport_id.to_string(), 1);
        inner.insertion_order.push_back(transport_id.to_string());
        1
    }

    /// Failed attempts recorded for a message
    pub fn attempts(&self, transport_id: &str) -> u32 {
        self.lock().attempts.get(transport_id).copied().unwrap_or(0)
    }

    /// Forget a message once its outcome is final
    pub fn clear(&self, transport_id: &str) {
        let mut inner = self.lock();
        if inner.attempts.remove(transport_id).is_some() {
            inner.insertion_order.retain(|id| id != transport_id);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().attempts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, FailureInfo> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for FailureInfoStorage {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TRACKED_MESSAGES)
    }
}

#[cfg(test)]
#[path = "failure_info_tests.rs"]
mod tests;
