//! Per-message receive protocol shared by every transaction mode.

use super::stats::PumpStats;
use crate::error::TransportError;
use crate::message::{Message, OutgoingMessage, QueueAddress, ReceiveOutcome};
use crate::pipeline::{
    ContextBag, CriticalCause, CriticalError, ErrorContext, ErrorHandleResult, MessageContext,
    OnError, OnMessage, TransportTransaction,
};
use crate::storage::QueueStorage;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Header naming the queue a delayed message must be forwarded to
pub const FORWARD_DESTINATION_HEADER: &str = "NServiceBus.SqlServer.ForwardDestination";

/// Receives and processes exactly one message
///
/// `cancellation` is the token owned by this receive. It is cancelled when
/// the queue turns out to be empty; storage calls are never aborted by it.
#[async_trait]
pub trait ReceiveStrategy: Send + Sync {
    async fn receive_message(&self, cancellation: &CancellationToken) -> Result<(), TransportError>;
}

/// Steps shared by the receive strategies
pub struct ReceiveCore<S: QueueStorage> {
    storage: Arc<S>,
    input_queue: QueueAddress,
    error_queue: QueueAddress,
    on_message: Arc<dyn OnMessage>,
    on_error: Arc<dyn OnError>,
    critical_error: Arc<dyn CriticalError>,
    stats: Arc<PumpStats>,
}

impl<S: QueueStorage> ReceiveCore<S> {
    pub fn new(
        storage: Arc<S>,
        input_queue: QueueAddress,
        error_queue: QueueAddress,
        on_message: Arc<dyn OnMessage>,
        on_error: Arc<dyn OnError>,
        critical_error: Arc<dyn CriticalError>,
        stats: Arc<PumpStats>,
    ) -> Self {
        Self {
            storage,
            input_queue,
            error_queue,
            on_message,
            on_error,
            critical_error,
            stats,
        }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn input_queue(&self) -> &QueueAddress {
        &self.input_queue
    }

    /// Receive one row and settle everything that does not need the callback
    ///
    /// Returns the message to deliver, or `None` when the row was dead-lettered,
    /// forwarded, or the queue was empty.
    pub async fn try_receive(
        &self,
        transaction: &mut S::Transaction,
        cancellation: &CancellationToken,
    ) -> Result<Option<Message>, TransportError> {
        match self.storage.receive(&self.input_queue, transaction).await? {
            ReceiveOutcome::Poison(poison) => {
                warn!(
                    queue = %self.input_queue,
                    error_queue = %self.error_queue,
                    message_id = %poison.row.id,
                    reason = %poison.reason,
                    "Moving poison message to the error queue"
                );
                self.storage
                    .dead_letter(&self.error_queue, &poison, transaction)
                    .await?;
                PumpStats::increment(&self.stats.poison);
                Ok(None)
            }
            ReceiveOutcome::Empty => {
                debug!(queue = %self.input_queue, "No message to receive");
                cancellation.cancel();
                Ok(None)
            }
            ReceiveOutcome::Successful(mut message) => {
                PumpStats::increment(&self.stats.received);
                if self.try_forward(&mut message, transaction).await? {
                    return Ok(None);
                }
                Ok(Some(message))
            }
        }
    }

    /// Forward a delayed message to its destination queue
    ///
    /// The forward header is always removed. Returns `false` when the message
    /// must be delivered locally.
    async fn try_forward(
        &self,
        message: &mut Message,
        transaction: &mut S::Transaction,
    ) -> Result<bool, TransportError> {
        let Some(destination) = message.headers_mut().remove(FORWARD_DESTINATION_HEADER) else {
            return Ok(false);
        };

        if destination == self.input_queue.as_str() {
            return Ok(false);
        }

        let destination = QueueAddress::new(destination)?;
        let outgoing = OutgoingMessage::from(&*message);
        self.storage
            .send(&destination, &outgoing, None, transaction)
            .await?;

        debug!(
            queue = %self.input_queue,
            destination = %destination,
            message_id = %message.transport_id(),
            "Forwarded delayed message"
        );
        PumpStats::increment(&self.stats.forwarded);
        Ok(true)
    }

    /// Deliver a message to the application unless it has expired
    pub async fn try_process(
        &self,
        message: &mut Message,
        transport_transaction: &TransportTransaction,
    ) -> anyhow::Result<()> {
        if message.is_expired() {
            debug!(
                queue = %self.input_queue,
                message_id = %message.transport_id(),
                "Dropping expired message"
            );
            PumpStats::increment(&self.stats.expired);
            return Ok(());
        }

        let (message_id, headers, body) = message.parts_mut();
        let context = MessageContext {
            message_id,
            headers,
            body,
            transport_transaction,
            extensions: ContextBag::new(),
        };
        self.on_message.on_message(context).await?;

        PumpStats::increment(&self.stats.delivered);
        Ok(())
    }

    /// Run the recoverability policy for a failed delivery
    ///
    /// A failing policy raises a critical error and forces a retry. Headers
    /// are restored before the policy runs and again before returning.
    pub async fn handle_error(
        &self,
        error: anyhow::Error,
        message: &mut Message,
        transport_transaction: &TransportTransaction,
        processing_attempts: u32,
    ) -> ErrorHandleResult {
        PumpStats::increment(&self.stats.failed);
        message.reset_headers();

        let mut headers = message.headers().clone();
        headers.remove(FORWARD_DESTINATION_HEADER);

        let context = ErrorContext {
            error: Arc::new(error),
            message_id: message.transport_id().to_string(),
            headers,
            body: message.body().clone(),
            transport_transaction: transport_transaction.clone(),
            processing_attempts,
        };

        let verdict = match self.on_error.on_error(context).await {
            Ok(verdict) => verdict,
            Err(policy_error) => {
                let cause: &CriticalCause = policy_error.as_ref();
                self.critical_error.raise(
                    &format!(
                        "Failed to execute recoverability policy for message with native ID: `{}`",
                        message.transport_id()
                    ),
                    cause,
                );
                ErrorHandleResult::RetryRequired
            }
        };

        message.reset_headers();
        verdict
    }

    /// Roll back a transaction, logging rather than returning a failure
    pub async fn abort(&self, transaction: S::Transaction) {
        if let Err(error) = self.storage.rollback(transaction).await {
            warn!(queue = %self.input_queue, error = %error, "Failed to roll back receive transaction");
        }
    }
}

#[cfg(test)]
#[path = "strategy_tests.rs"]
mod tests;
