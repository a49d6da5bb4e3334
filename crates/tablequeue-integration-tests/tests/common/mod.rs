//! Common test utilities for tablequeue integration tests
//!
//! This module provides:
//! - Mock implementations of the pipeline traits (OnMessage, OnError, CriticalError)
//! - Helper functions for creating storages, settings and pumps
//! - Polling helpers for asserting on asynchronous progress

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tablequeue_core::{
    CriticalCause, CriticalError, ErrorContext, ErrorHandleResult, Headers, InMemoryStorage,
    MessageContext, MessagePump, OnError, OnMessage, OutgoingMessage, QueueAddress,
    TransportSettings,
};
use tokio::sync::Semaphore;
use tokio::time::{sleep, Duration, Instant};

pub const INPUT_QUEUE: &str = "orders";
pub const ERROR_QUEUE: &str = "error";
pub const AUDIT_QUEUE: &str = "audit";

// ============================================================================
// Mock Message Handler
// ============================================================================

/// Mock application handler recording every delivery it sees
#[derive(Clone, Default)]
#[allow(dead_code)]
pub struct MockMessageHandler {
    deliveries: Arc<Mutex<Vec<(String, Headers)>>>,
    failure: Arc<Mutex<Option<String>>>,
    gate: Arc<Mutex<Option<Arc<Semaphore>>>>,
    mutate_headers: Arc<Mutex<bool>>,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
}

impl MockMessageHandler {
    #[allow(dead_code)]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every delivery with the given message
    #[allow(dead_code)]
    pub fn set_failure(&self, message: &str) {
        *self.failure.lock().unwrap() = Some(message.to_string());
    }

    /// Make every delivery wait for a permit on `gate` before completing
    #[allow(dead_code)]
    pub fn set_gate(&self, gate: Arc<Semaphore>) {
        *self.gate.lock().unwrap() = Some(gate);
    }

    /// Add a header to the message before the handler returns
    #[allow(dead_code)]
    pub fn set_header_mutation(&self, enabled: bool) {
        *self.mutate_headers.lock().unwrap() = enabled;
    }

    #[allow(dead_code)]
    pub fn deliveries(&self) -> Vec<(String, Headers)> {
        self.deliveries.lock().unwrap().clone()
    }

    #[allow(dead_code)]
    pub fn delivery_count(&self) -> usize {
        self.deliveries.lock().unwrap().len()
    }

    #[allow(dead_code)]
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    #[allow(dead_code)]
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OnMessage for MockMessageHandler {
    async fn on_message(&self, context: MessageContext<'_>) -> anyhow::Result<()> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            let _permit = gate.acquire().await?;
        }

        if *self.mutate_headers.lock().unwrap() {
            context
                .headers
                .insert("test.mutated".to_string(), "true".to_string());
        }

        self.deliveries
            .lock()
            .unwrap()
            .push((context.message_id.to_string(), context.headers.clone()));
        self.active.fetch_sub(1, Ordering::SeqCst);

        let failure = self.failure.lock().unwrap().clone();
        match failure {
            Some(message) => Err(anyhow::anyhow!(message)),
            None => Ok(()),
        }
    }
}

// ============================================================================
// Mock Recoverability Policy
// ============================================================================

type VerdictFactory = Box<dyn Fn(&ErrorContext) -> anyhow::Result<ErrorHandleResult> + Send + Sync>;

/// Mock recoverability policy with a configurable verdict
#[derive(Clone)]
#[allow(dead_code)]
pub struct MockRecoverabilityPolicy {
    calls: Arc<Mutex<Vec<ErrorContext>>>,
    verdict_factory: Arc<Mutex<VerdictFactory>>,
}

impl MockRecoverabilityPolicy {
    /// Policy that handles every failure
    #[allow(dead_code)]
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            verdict_factory: Arc::new(Mutex::new(Box::new(|_| Ok(ErrorHandleResult::Handled)))),
        }
    }

    /// Ask for a retry until a message has failed `attempts` times
    #[allow(dead_code)]
    pub fn set_retry_until(&self, attempts: u32) {
        *self.verdict_factory.lock().unwrap() = Box::new(move |context| {
            if context.processing_attempts < attempts {
                Ok(ErrorHandleResult::RetryRequired)
            } else {
                Ok(ErrorHandleResult::Handled)
            }
        });
    }

    /// Make the policy itself fail
    #[allow(dead_code)]
    pub fn set_error(&self, message: &str) {
        let message = message.to_string();
        *self.verdict_factory.lock().unwrap() =
            Box::new(move |_| Err(anyhow::anyhow!(message.clone())));
    }

    #[allow(dead_code)]
    pub fn get_calls(&self) -> Vec<ErrorContext> {
        self.calls.lock().unwrap().clone()
    }

    #[allow(dead_code)]
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl OnError for MockRecoverabilityPolicy {
    async fn on_error(&self, context: ErrorContext) -> anyhow::Result<ErrorHandleResult> {
        let verdict = {
            let factory = self.verdict_factory.lock().unwrap();
            (*factory)(&context)
        };
        self.calls.lock().unwrap().push(context);
        verdict
    }
}

// ============================================================================
// Mock Critical Error Sink
// ============================================================================

/// Collects every critical error raised by the pump
#[derive(Clone, Default)]
#[allow(dead_code)]
pub struct MockCriticalErrorSink {
    raised: Arc<Mutex<Vec<(String, String)>>>,
}

impl MockCriticalErrorSink {
    #[allow(dead_code)]
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(dead_code)]
    pub fn descriptions(&self) -> Vec<String> {
        self.raised
            .lock()
            .unwrap()
            .iter()
            .map(|(description, _)| description.clone())
            .collect()
    }

    #[allow(dead_code)]
    pub fn causes(&self) -> Vec<String> {
        self.raised
            .lock()
            .unwrap()
            .iter()
            .map(|(_, cause)| cause.clone())
            .collect()
    }

    #[allow(dead_code)]
    pub fn count(&self) -> usize {
        self.raised.lock().unwrap().len()
    }
}

impl CriticalError for MockCriticalErrorSink {
    fn raise(&self, description: &str, cause: &CriticalCause) {
        self.raised
            .lock()
            .unwrap()
            .push((description.to_string(), cause.to_string()));
    }
}

// ============================================================================
// Test Fixtures
// ============================================================================

/// Handler, policy and sink wired into one pump
#[allow(dead_code)]
pub struct TestPump {
    pub pump: MessagePump<InMemoryStorage>,
    pub storage: Arc<InMemoryStorage>,
    pub handler: MockMessageHandler,
    pub policy: MockRecoverabilityPolicy,
    pub critical: MockCriticalErrorSink,
}

#[allow(dead_code)]
pub fn queue(name: &str) -> QueueAddress {
    QueueAddress::new(name).expect("valid queue name")
}

#[allow(dead_code)]
pub fn headers(pairs: &[(&str, &str)]) -> Headers {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

/// Storage with the input, error and audit tables created
#[allow(dead_code)]
pub fn create_storage() -> Arc<InMemoryStorage> {
    Arc::new(InMemoryStorage::with_queues(&[
        queue(INPUT_QUEUE),
        queue(ERROR_QUEUE),
        queue(AUDIT_QUEUE),
    ]))
}

/// Settings with short delays so tests do not wait on defaults
#[allow(dead_code)]
pub fn create_test_settings() -> TransportSettings {
    let mut settings = TransportSettings::for_queue(INPUT_QUEUE);
    settings.error_queue = ERROR_QUEUE.to_string();
    settings.peek.delay_ms = 100;
    settings.circuit_breaker.failure_backoff_ms = 100;
    settings.circuit_breaker.time_to_wait_before_triggering_seconds = 5;
    settings
}

#[allow(dead_code)]
pub fn enqueue(storage: &InMemoryStorage, id: &str, message_headers: Headers) {
    storage
        .enqueue(
            &queue(INPUT_QUEUE),
            &OutgoingMessage::new(id, message_headers, Bytes::from(format!("body-{}", id))),
            None,
        )
        .expect("enqueue test message");
}

/// Build and initialize a pump over `storage`
#[allow(dead_code)]
pub async fn create_test_pump(storage: Arc<InMemoryStorage>, settings: TransportSettings) -> TestPump {
    let handler = MockMessageHandler::new();
    let policy = MockRecoverabilityPolicy::new();
    let critical = MockCriticalErrorSink::new();

    let mut pump = MessagePump::new(Arc::clone(&storage));
    pump.initialize(
        Arc::new(handler.clone()),
        Arc::new(policy.clone()),
        Arc::new(critical.clone()),
        settings,
    )
    .await
    .expect("initialize pump");

    TestPump {
        pump,
        storage,
        handler,
        policy,
        critical,
    }
}

/// Poll `condition` every 10ms, panicking after `limit`
#[allow(dead_code)]
pub async fn wait_for(limit: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + limit;
    while !condition() {
        assert!(Instant::now() < deadline, "Condition not met within {:?}", limit);
        sleep(Duration::from_millis(10)).await;
    }
}
