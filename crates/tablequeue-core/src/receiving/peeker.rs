//! Peek in a dedicated transaction with an explicit isolation level.

use super::delay;
use crate::circuit_breaker::RepeatedFailuresOverTimeCircuitBreaker;
use crate::config::QueuePeekerOptions;
use crate::error::TransportError;
use crate::message::QueueAddress;
use crate::storage::QueueStorage;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Counts the rows waiting in a queue
///
/// Never fails: every outcome other than a count is reported to the circuit
/// breaker (or ignored on cancellation) and turned into zero. After an empty
/// or failed peek it waits the configured delay before returning.
pub struct QueuePeeker<S: QueueStorage> {
    storage: Arc<S>,
    options: QueuePeekerOptions,
}

impl<S: QueueStorage> QueuePeeker<S> {
    pub fn new(storage: Arc<S>, options: QueuePeekerOptions) -> Self {
        Self { storage, options }
    }

    pub fn options(&self) -> &QueuePeekerOptions {
        &self.options
    }

    pub async fn peek(
        &self,
        queue: &QueueAddress,
        circuit_breaker: &RepeatedFailuresOverTimeCircuitBreaker,
        cancellation: &CancellationToken,
    ) -> u64 {
        if cancellation.is_cancelled() {
            return 0;
        }

        match self.count(queue).await {
            Ok(count) => {
                circuit_breaker.success();

                if count == 0 {
                    debug!(queue = %queue, "Blocking for messages");
                    delay(self.options.delay(), cancellation).await;
                    return 0;
                }

                debug!(queue = %queue, count, "Messages waiting");
                self.options
                    .max_records_to_peek
                    .map_or(count, |max| count.min(max))
            }
            Err(error) if cancellation.is_cancelled() => {
                debug!(queue = %queue, error = %error, "Peek interrupted by shutdown");
                0
            }
            Err(error) => {
                warn!(queue = %queue, error = %error, "Sql peek operation failed");
                circuit_breaker.failure(&error);
                delay(self.options.delay(), cancellation).await;
                0
            }
        }
    }

    async fn count(&self, queue: &QueueAddress) -> Result<u64, TransportError> {
        let mut transaction = self.storage.begin(self.options.isolation_level).await?;

        match self.storage.peek(queue, Some(&mut transaction)).await {
            Ok(count) => {
                self.storage.commit(transaction).await?;
                Ok(count)
            }
            Err(error) => {
                if let Err(rollback_error) = self.storage.rollback(transaction).await {
                    debug!(queue = %queue, error = %rollback_error, "Failed to roll back peek transaction");
                }
                Err(error)
            }
        }
    }
}

#[cfg(test)]
#[path = "peeker_tests.rs"]
mod tests;
