//! Hand-written handlers and fixtures shared by the receiving tests.

use super::stats::PumpStats;
use super::strategy::ReceiveCore;
use crate::message::{Headers, OutgoingMessage, QueueAddress};
use crate::pipeline::{
    CriticalCause, CriticalError, ErrorContext, ErrorHandleResult, MessageContext, OnError,
    OnMessage, TransportTransaction,
};
use crate::providers::memory::InMemoryStorage;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

// ============================================================================
// Fixtures
// ============================================================================

pub fn queue(name: &str) -> QueueAddress {
    QueueAddress::new(name).unwrap()
}

pub fn headers(pairs: &[(&str, &str)]) -> Headers {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

/// Storage with `orders`, `error` and `audit` tables
pub fn storage() -> Arc<InMemoryStorage> {
    Arc::new(InMemoryStorage::with_queues(&[
        queue("orders"),
        queue("error"),
        queue("audit"),
    ]))
}

pub fn enqueue(storage: &InMemoryStorage, id: &str, message_headers: Headers) {
    storage
        .enqueue(
            &queue("orders"),
            &OutgoingMessage::new(id, message_headers, Bytes::from(format!("body-{}", id))),
            None,
        )
        .unwrap();
}

pub fn receive_core(
    storage: Arc<InMemoryStorage>,
    handler: Arc<RecordingHandler>,
    policy: Arc<RecordingPolicy>,
    critical: Arc<CriticalSink>,
    stats: Arc<PumpStats>,
) -> ReceiveCore<InMemoryStorage> {
    ReceiveCore::new(
        storage,
        queue("orders"),
        queue("error"),
        handler,
        policy,
        critical,
        stats,
    )
}

/// Poll a condition on the tokio clock, failing after a minute
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "Condition not met within 60 seconds"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ============================================================================
// Message Handler
// ============================================================================

/// What the handler saw of one delivery
#[derive(Debug, Clone)]
pub struct Delivered {
    pub message_id: String,
    pub headers: Headers,
    pub body: Bytes,
    pub transport_transaction: TransportTransaction,
}

/// Records deliveries; can fail, block on a gate, take time or mutate headers
#[derive(Default)]
pub struct RecordingHandler {
    delivered: Mutex<Vec<Delivered>>,
    failure: Option<String>,
    gate: Option<Arc<Semaphore>>,
    processing_time: Option<Duration>,
    mutate_headers: bool,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(message: &str) -> Self {
        Self {
            failure: Some(message.to_string()),
            ..Self::default()
        }
    }

    /// Each delivery waits for a permit on `gate`
    pub fn gated(gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }

    pub fn slow(processing_time: Duration) -> Self {
        Self {
            processing_time: Some(processing_time),
            ..Self::default()
        }
    }

    pub fn mutating_headers(mut self) -> Self {
        self.mutate_headers = true;
        self
    }

    pub fn delivered(&self) -> Vec<Delivered> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn delivered_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .delivered()
            .into_iter()
            .map(|delivered| delivered.message_id)
            .collect();
        ids.sort();
        ids
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OnMessage for RecordingHandler {
    async fn on_message(&self, context: MessageContext<'_>) -> anyhow::Result<()> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        if let Some(gate) = &self.gate {
            let _permit = gate.acquire().await?;
        }

        if let Some(processing_time) = self.processing_time {
            tokio::time::sleep(processing_time).await;
        }

        if self.mutate_headers {
            context
                .headers
                .insert("handler.mutated".to_string(), "true".to_string());
        }

        self.delivered.lock().unwrap().push(Delivered {
            message_id: context.message_id.to_string(),
            headers: context.headers.clone(),
            body: context.body.clone(),
            transport_transaction: context.transport_transaction.clone(),
        });
        self.active.fetch_sub(1, Ordering::SeqCst);

        match &self.failure {
            Some(message) => Err(anyhow::anyhow!(message.clone())),
            None => Ok(()),
        }
    }
}

// ============================================================================
// Recoverability Policy
// ============================================================================

/// Records error contexts and answers with a fixed verdict, or fails
pub struct RecordingPolicy {
    verdict: Option<ErrorHandleResult>,
    contexts: Mutex<Vec<ErrorContext>>,
}

impl RecordingPolicy {
    pub fn returning(verdict: ErrorHandleResult) -> Self {
        Self {
            verdict: Some(verdict),
            contexts: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            verdict: None,
            contexts: Mutex::new(Vec::new()),
        }
    }

    pub fn contexts(&self) -> Vec<ErrorContext> {
        self.contexts.lock().unwrap().clone()
    }
}

#[async_trait]
impl OnError for RecordingPolicy {
    async fn on_error(&self, context: ErrorContext) -> anyhow::Result<ErrorHandleResult> {
        self.contexts.lock().unwrap().push(context);
        self.verdict
            .ok_or_else(|| anyhow::anyhow!("recoverability policy exploded"))
    }
}

// ============================================================================
// Critical Error Sink
// ============================================================================

/// Collects raised critical errors as `(description, cause)` pairs
#[derive(Default)]
pub struct CriticalSink {
    raised: Mutex<Vec<(String, String)>>,
}

impl CriticalSink {
    pub fn raised(&self) -> Vec<(String, String)> {
        self.raised.lock().unwrap().clone()
    }

    pub fn descriptions(&self) -> Vec<String> {
        self.raised()
            .into_iter()
            .map(|(description, _)| description)
            .collect()
    }
}

impl CriticalError for CriticalSink {
    fn raise(&self, description: &str, cause: &CriticalCause) {
        self.raised
            .lock()
            .unwrap()
            .push((description.to_string(), cause.to_string()));
    }
}
