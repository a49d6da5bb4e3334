//! Handlers and seed data used by the `run` command.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use tablequeue_core::{
    ErrorContext, ErrorHandleResult, Headers, InMemoryStorage, MessageContext, MessageRow,
    OnError, OnMessage, OutgoingMessage, QueueAddress, TransportError,
};
use tracing::{debug, info, warn};

/// Header carrying the logical message id of seeded messages
pub const MESSAGE_ID_HEADER: &str = "NServiceBus.MessageId";

/// Fill `queue` with `messages` valid messages followed by `poison` malformed rows
pub fn seed(
    storage: &InMemoryStorage,
    queue: &QueueAddress,
    messages: usize,
    poison: usize,
) -> Result<(), TransportError> {
    for sequence in 0..messages {
        let id = uuid::Uuid::new_v4().to_string();
        let mut headers = Headers::new();
        headers.insert(MESSAGE_ID_HEADER.to_string(), id.clone());
        let body = Bytes::from(format!("{{\"sequence\":{}}}", sequence));
        storage.enqueue(queue, &OutgoingMessage::new(id, headers, body), None)?;
    }

    for _ in 0..poison {
        storage.insert_row(
            queue,
            MessageRow {
                id: uuid::Uuid::new_v4().to_string(),
                headers: "{not json".to_string(),
                body: Bytes::from_static(b"poison"),
                expired: false,
            },
        )?;
    }

    Ok(())
}

/// Logs each delivery and fails every `fail_every`-th one
pub struct DemoHandler {
    fail_every: Option<u64>,
    deliveries: AtomicU64,
}

impl DemoHandler {
    pub fn new(fail_every: Option<u64>) -> Self {
        Self {
            fail_every,
            deliveries: AtomicU64::new(0),
        }
    }

    pub fn deliveries(&self) -> u64 {
        self.deliveries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OnMessage for DemoHandler {
    async fn on_message(&self, context: MessageContext<'_>) -> anyhow::Result<()> {
        let delivery = self.deliveries.fetch_add(1, Ordering::SeqCst) + 1;

        if let Some(every) = self.fail_every {
            if every > 0 && delivery % every == 0 {
                anyhow::bail!("simulated failure on delivery {}", delivery);
            }
        }

        debug!(
            message_id = %context.message_id,
            body_len = context.body.len(),
            "Processed message"
        );
        Ok(())
    }
}

/// Asks for a retry until a message has failed `max_attempts` times
pub struct DemoRecoverability {
    max_attempts: u32,
}

impl DemoRecoverability {
    pub fn new(max_attempts: u32) -> Self {
        Self { max_attempts }
    }
}

impl Default for DemoRecoverability {
    fn default() -> Self {
        Self::new(3)
    }
}

#[async_trait]
impl OnError for DemoRecoverability {
    async fn on_error(&self, context: ErrorContext) -> anyhow::Result<ErrorHandleResult> {
        if context.processing_attempts < self.max_attempts {
            warn!(
                message_id = %context.message_id,
                attempts = context.processing_attempts,
                error = %context.error,
                "Delivery failed, retrying"
            );
            return Ok(ErrorHandleResult::RetryRequired);
        }

        info!(
            message_id = %context.message_id,
            attempts = context.processing_attempts,
            error = %context.error,
            "Delivery failed too often, giving up"
        );
        Ok(ErrorHandleResult::Handled)
    }
}
