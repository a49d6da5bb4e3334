//! Receive without a transaction around delivery.

use super::strategy::{ReceiveCore, ReceiveStrategy};
use crate::error::TransportError;
use crate::pipeline::{ErrorHandleResult, TransportTransaction};
use crate::storage::{IsolationLevel, QueueStorage};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Deletes the row in a short transaction, then delivers
///
/// The row is gone before the callback runs, so a failed delivery cannot be
/// retried; the recoverability policy is still consulted, with one attempt.
pub struct NoTransactionReceiveStrategy<S: QueueStorage> {
    core: ReceiveCore<S>,
    isolation_level: IsolationLevel,
}

impl<S: QueueStorage> NoTransactionReceiveStrategy<S> {
    pub fn new(core: ReceiveCore<S>, isolation_level: IsolationLevel) -> Self {
        Self {
            core,
            isolation_level,
        }
    }
}

#[async_trait]
impl<S: QueueStorage> ReceiveStrategy for NoTransactionReceiveStrategy<S> {
    async fn receive_message(&self, cancellation: &CancellationToken) -> Result<(), TransportError> {
        let storage = self.core.storage();
        let mut transaction = storage.begin(self.isolation_level).await?;

        let received = match self.core.try_receive(&mut transaction, cancellation).await {
            Ok(received) => received,
            Err(error) => {
                self.core.abort(transaction).await;
                return Err(error);
            }
        };
        storage.commit(transaction).await?;

        let Some(mut message) = received else {
            return Ok(());
        };

        let transport_transaction = TransportTransaction::none();
        if let Err(error) = self.core.try_process(&mut message, &transport_transaction).await {
            let verdict = self
                .core
                .handle_error(error, &mut message, &transport_transaction, 1)
                .await;

            if verdict == ErrorHandleResult::RetryRequired {
                warn!(
                    queue = %self.core.input_queue(),
                    message_id = %message.transport_id(),
                    "Retry requested for a message received without a transaction; the message cannot be retried"
                );
            }
        }

        Ok(())
    }
}

#[cfg(test)]
#[path = "no_transaction_tests.rs"]
mod tests;
