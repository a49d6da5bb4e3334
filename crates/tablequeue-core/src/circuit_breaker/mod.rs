//! Failure absorption for the peek and receive paths.
//!
//! A degraded database makes every peek or receive fail. Restarting on the
//! first failure would turn a short outage into a crash loop, so failures are
//! absorbed and the operator is only signalled once failures have persisted,
//! without a single success, for a configured amount of time.
//!
//! # Breaker States
//!
//! - **Disarmed**: the last reported outcome was a success
//! - **Armed**: failures are being reported, the streak is younger than the threshold
//! - **Triggered**: the streak outlived the threshold and the trigger has fired
//!
//! A triggered breaker keeps absorbing failures without firing again and
//! reports recovery on the next success.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use tablequeue_core::circuit_breaker::{CircuitBreakerState, RepeatedFailuresOverTimeCircuitBreaker};
//!
//! let breaker = RepeatedFailuresOverTimeCircuitBreaker::new(
//!     "SqlPeek",
//!     Duration::from_secs(30),
//!     |cause| eprintln!("peek keeps failing: {}", cause),
//! );
//!
//! breaker.success();
//! assert_eq!(breaker.state(), CircuitBreakerState::Disarmed);
//! ```

use serde::{Deserialize, Serialize};

mod breaker;
pub use breaker::RepeatedFailuresOverTimeCircuitBreaker;

/// Observable state of a circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitBreakerState {
    /// No failure since the last success
    Disarmed,
    /// Failing, but not for long enough to trigger
    Armed,
    /// Failing for longer than the threshold; the trigger has fired
    Triggered,
}

impl CircuitBreakerState {
    /// Check if the breaker is tracking a failure streak
    pub fn is_failing(&self) -> bool {
        matches!(self, Self::Armed | Self::Triggered)
    }
}
