//! Lock-free circuit breaker keyed on the age of a failure streak.
//!
//! The whole streak lives in one `AtomicU64`:
//!
//! | bits   | meaning                                               |
//! | ------ | ----------------------------------------------------- |
//! | 63     | the trigger already fired for this streak             |
//! | 40..63 | failures in the streak, saturating                    |
//! | 0..40  | streak start, milliseconds since the breaker was made |
//!
//! `NO_STREAK` marks the disarmed state. Every transition is a single swap
//! or compare-and-swap of that word, so the failure count can never disagree
//! with the streak it belongs to.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

use super::CircuitBreakerState;
use crate::error::TransportError;

const NO_STREAK: u64 = u64::MAX;
const TRIGGERED_BIT: u64 = 1 << 63;
const COUNT_SHIFT: u32 = 40;
const COUNT_MAX: u64 = (1 << 23) - 1;
const COUNT_MASK: u64 = COUNT_MAX << COUNT_SHIFT;
const START_MASK: u64 = (1 << COUNT_SHIFT) - 1;

type Trigger = Box<dyn Fn(&TransportError) + Send + Sync>;

fn streak_start(word: u64) -> u64 {
    word & START_MASK
}

fn streak_failures(word: u64) -> u64 {
    (word & COUNT_MASK) >> COUNT_SHIFT
}

fn is_triggered(word: u64) -> bool {
    word & TRIGGERED_BIT != 0
}

/// Circuit breaker that fires once a failure streak outlives a threshold.
///
/// `success` clears the streak. `failure` starts a streak if none is open
/// and fires the trigger, once per streak, when the streak is at least
/// `time_to_wait` old.
pub struct RepeatedFailuresOverTimeCircuitBreaker {
    name: String,
    time_to_wait: Duration,
    trigger: Trigger,
    epoch: Instant,
    streak: AtomicU64,
}

impl RepeatedFailuresOverTimeCircuitBreaker {
    /// Create a disarmed breaker.
    pub fn new<F>(name: impl Into<String>, time_to_wait: Duration, trigger: F) -> Self
    where
        F: Fn(&TransportError) + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            time_to_wait,
            trigger: Box::new(trigger),
            epoch: Instant::now(),
            streak: AtomicU64::new(NO_STREAK),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Failures reported since the last success, saturating at 2^23 - 1
    pub fn failure_count(&self) -> u64 {
        match self.streak.load(Ordering::Acquire) {
            NO_STREAK => 0,
            word => streak_failures(word),
        }
    }

    pub fn state(&self) -> CircuitBreakerState {
        match self.streak.load(Ordering::Acquire) {
            NO_STREAK => CircuitBreakerState::Disarmed,
            word if is_triggered(word) => CircuitBreakerState::Triggered,
            _ => CircuitBreakerState::Armed,
        }
    }

    /// Report a successful operation, ending any failure streak.
    pub fn success(&self) {
        if self.streak.load(Ordering::Acquire) == NO_STREAK {
            return;
        }

        let previous = self.streak.swap(NO_STREAK, Ordering::AcqRel);
        if previous == NO_STREAK {
            return;
        }

        let failures = streak_failures(previous);
        if is_triggered(previous) {
            info!(breaker = %self.name, failures, "The circuit breaker for {} has recovered", self.name);
        } else {
            info!(breaker = %self.name, failures, "The circuit breaker for {} is now disarmed", self.name);
        }
    }

    /// Report a failed operation.
    pub fn failure(&self, cause: &TransportError) {
        let now = self.now_ms();
        let mut current = self.streak.load(Ordering::Acquire);

        loop {
            let mut next = if current == NO_STREAK {
                (1 << COUNT_SHIFT) | now
            } else {
                let failures = (streak_failures(current) + 1).min(COUNT_MAX);
                (current & !COUNT_MASK) | (failures << COUNT_SHIFT)
            };

            let streak_age = Duration::from_millis(now.saturating_sub(streak_start(next)));
            let fire = !is_triggered(next) && streak_age >= self.time_to_wait;
            if fire {
                next |= TRIGGERED_BIT;
            }

            match self
                .streak
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    if current == NO_STREAK {
                        warn!(
                            breaker = %self.name,
                            error = %cause,
                            "The circuit breaker for {} is now in the armed state",
                            self.name
                        );
                    }

                    if fire {
                        error!(
                            breaker = %self.name,
                            failures = streak_failures(next),
                            streak_age = ?streak_age,
                            error = %cause,
                            "The circuit breaker for {} will now be triggered",
                            self.name
                        );
                        (self.trigger)(cause);
                    }
                    return;
                }
                Err(actual) => current = actual,
            }
        }
    }

    fn now_ms(&self) -> u64 {
        let elapsed = self.epoch.elapsed().as_millis();
        u64::try_from(elapsed).unwrap_or(START_MASK).min(START_MASK)
    }
}

impl std::fmt::Debug for RepeatedFailuresOverTimeCircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepeatedFailuresOverTimeCircuitBreaker")
            .field("name", &self.name)
            .field("time_to_wait", &self.time_to_wait)
            .field("state", &self.state())
            .field("failure_count", &self.failure_count())
            .finish()
    }
}

#[cfg(test)]
#[path = "breaker_tests.rs"]
mod tests;
