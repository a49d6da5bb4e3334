//! The receive pipeline.
//!
//! - [`MessagePump`] owns the polling loop and bounds the receives in flight
//! - [`QueuePeeker`] counts waiting rows inside its own transaction
//! - [`ReceiveStrategy`] implementations receive and settle one message each
//! - [`FailureInfoStorage`] remembers attempts across rolled-back receives

use std::time::Duration;
use tokio_util::sync::CancellationToken;

mod failure_info;
mod no_transaction;
mod peeker;
mod pump;
mod stats;
mod strategy;
mod transactional;

#[cfg(test)]
mod test_support;

pub use failure_info::{FailureInfoStorage, DEFAULT_MAX_TRACKED_MESSAGES};
pub use no_transaction::NoTransactionReceiveStrategy;
pub use peeker::QueuePeeker;
pub use pump::{MessagePump, PumpState, DRAIN_TIMEOUT};
pub use stats::{PumpStats, PumpStatsSnapshot};
pub use strategy::{ReceiveCore, ReceiveStrategy, FORWARD_DESTINATION_HEADER};
pub use transactional::TransactionalReceiveStrategy;

/// Sleep unless cancelled first; returns `true` if cancelled
pub(crate) async fn delay(duration: Duration, cancellation: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancellation.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}
