//! Receive and deliver inside one storage transaction.

use super::failure_info::FailureInfoStorage;
use super::strategy::{ReceiveCore, ReceiveStrategy};
use crate::config::{TransactionOptions, TransportTransactionMode};
use crate::error::TransportError;
use crate::pipeline::{ErrorHandleResult, TransportTransaction};
use crate::storage::QueueStorage;
use async_trait::async_trait;
use std::sync::OnceLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Keeps the receive transaction open while the message is delivered
///
/// A successful delivery, or a failure the recoverability policy handled,
/// commits. A retry verdict rolls back so the row becomes visible again.
/// A receive that outlives the transaction timeout is rolled back and counts
/// as one failed attempt for the message it was delivering, without asking
/// the recoverability policy. Used for both `ReceiveOnly` and
/// `SendsAtomicWithReceive`.
pub struct TransactionalReceiveStrategy<S: QueueStorage> {
    core: ReceiveCore<S>,
    mode: TransportTransactionMode,
    options: TransactionOptions,
    failure_info: FailureInfoStorage,
}

impl<S: QueueStorage> TransactionalReceiveStrategy<S> {
    pub fn new(core: ReceiveCore<S>, mode: TransportTransactionMode, options: TransactionOptions) -> Self {
        Self {
            core,
            mode,
            options,
            failure_info: FailureInfoStorage::default(),
        }
    }

    /// Attempts recorded for messages whose receive was rolled back
    pub fn failure_info(&self) -> &FailureInfoStorage {
        &self.failure_info
    }

    async fn receive_in_transaction(
        &self,
        cancellation: &CancellationToken,
        in_flight: &OnceLock<String>,
    ) -> Result<(), TransportError> {
        let storage = self.core.storage();
        let isolation_level = self.options.isolation_level;
        let mut transaction = storage.begin(isolation_level).await?;

        let received = match self.core.try_receive(&mut transaction, cancellation).await {
            Ok(received) => received,
            Err(error) => {
                self.core.abort(transaction).await;
                return Err(error);
            }
        };

        let Some(mut message) = received else {
            return storage.commit(transaction).await;
        };
        let _ = in_flight.set(message.transport_id().to_string());

        let transport_transaction = TransportTransaction::within(self.mode, isolation_level);
        let error = match self.core.try_process(&mut message, &transport_transaction).await {
            Ok(()) => {
                storage.commit(transaction).await?;
                self.failure_info.clear(message.transport_id());
                return Ok(());
            }
            Err(error) => error,
        };

        let attempts = self.failure_info.record_failure(message.transport_id());
        let verdict = self
            .core
            .handle_error(error, &mut message, &transport_transaction, attempts)
            .await;

        match verdict {
            ErrorHandleResult::Handled => {
                storage.commit(transaction).await?;
                self.failure_info.clear(message.transport_id());
            }
            ErrorHandleResult::RetryRequired => {
                debug!(
                    queue = %self.core.input_queue(),
                    message_id = %message.transport_id(),
                    attempts,
                    "Rolling back receive for retry"
                );
                self.core.abort(transaction).await;
            }
        }

        Ok(())
    }
}

#[async_trait]
impl<S: QueueStorage> ReceiveStrategy for TransactionalReceiveStrategy<S> {
    async fn receive_message(&self, cancellation: &CancellationToken) -> Result<(), TransportError> {
        let Some(limit) = self.options.timeout() else {
            return self.receive_in_transaction(cancellation, &OnceLock::new()).await;
        };

        let in_flight = OnceLock::new();
        match tokio::time::timeout(limit, self.receive_in_transaction(cancellation, &in_flight)).await {
            Ok(result) => result,
            Err(_) => {
                let message_id = in_flight.get().map(String::as_str);
                let attempts = message_id.map(|id| self.failure_info.record_failure(id));
                warn!(
                    queue = %self.core.input_queue(),
                    timeout = ?limit,
                    message_id = ?message_id,
                    attempts = ?attempts,
                    "Receive transaction timed out and was rolled back"
                );
                Err(TransportError::TransactionTimeout { duration: limit })
            }
        }
    }
}

#[cfg(test)]
#[path = "transactional_tests.rs"]
mod tests;
