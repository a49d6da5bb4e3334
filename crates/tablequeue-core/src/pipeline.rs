//! Contract between the receive pipeline and the hosting framework.
//!
//! The pipeline hands every deliverable message to an [`OnMessage`]
//! implementation and asks an [`OnError`] implementation (the recoverability
//! policy) what to do when delivery fails. Conditions an operator must react
//! to are reported through [`CriticalError`].

use crate::config::TransportTransactionMode;
use crate::message::Headers;
use crate::storage::IsolationLevel;
use async_trait::async_trait;
use bytes::Bytes;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::error::Error as StdError;
use std::sync::Arc;
use tracing::error;

/// Error type accepted by [`CriticalError::raise`]
pub type CriticalCause = dyn StdError + Send + Sync + 'static;

// ============================================================================
// Contexts
// ============================================================================

/// Type-keyed extension storage carried alongside a message
#[derive(Default)]
pub struct ContextBag {
    values: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl ContextBag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value, replacing any previous value of the same type
    pub fn set<T: Any + Send + Sync>(&mut self, value: T) {
        self.values.insert(TypeId::of::<T>(), Box::new(value));
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.values
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    pub fn remove<T: Any + Send + Sync>(&mut self) -> Option<T> {
        self.values
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast::<T>().ok())
            .map(|value| *value)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl std::fmt::Debug for ContextBag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextBag")
            .field("entries", &self.values.len())
            .finish()
    }
}

/// Description of the storage transaction a message was received under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportTransaction {
    /// Transaction mode the receive ran with
    pub mode: TransportTransactionMode,

    /// Isolation level of the receive transaction, if one is still open
    pub isolation_level: Option<IsolationLevel>,

    /// Whether outgoing sends may enlist in the receive transaction
    pub sends_enlisted: bool,
}

impl TransportTransaction {
    /// Delivery after the receive transaction has already committed
    pub fn none() -> Self {
        Self {
            mode: TransportTransactionMode::None,
            isolation_level: None,
            sends_enlisted: false,
        }
    }

    /// Delivery inside an open receive transaction
    pub fn within(mode: TransportTransactionMode, isolation_level: IsolationLevel) -> Self {
        Self {
            mode,
            isolation_level: Some(isolation_level),
            sends_enlisted: mode == TransportTransactionMode::SendsAtomicWithReceive,
        }
    }
}

/// Everything the application sees of a message being delivered
///
/// Header changes made through `headers` are visible to the pipeline and are
/// discarded by a header reset if delivery fails.
pub struct MessageContext<'a> {
    pub message_id: &'a str,
    pub headers: &'a mut Headers,
    pub body: &'a Bytes,
    pub transport_transaction: &'a TransportTransaction,
    pub extensions: ContextBag,
}

/// Everything the recoverability policy sees of a failed delivery
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub error: Arc<anyhow::Error>,
    pub message_id: String,
    pub headers: Headers,
    pub body: Bytes,
    pub transport_transaction: TransportTransaction,
    /// Number of delivery attempts that failed, including this one
    pub processing_attempts: u32,
}

/// Verdict of the recoverability policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorHandleResult {
    /// The message has been dealt with (for example moved to an error queue)
    Handled,
    /// The message must be delivered again
    RetryRequired,
}

// ============================================================================
// Callbacks
// ============================================================================

/// Application callback invoked once per deliverable message
#[async_trait]
pub trait OnMessage: Send + Sync {
    async fn on_message(&self, context: MessageContext<'_>) -> anyhow::Result<()>;
}

/// Recoverability policy; may be called concurrently from many receives
#[async_trait]
pub trait OnError: Send + Sync {
    async fn on_error(&self, context: ErrorContext) -> anyhow::Result<ErrorHandleResult>;
}

/// Fire-and-forget notification of a condition an operator must react to
pub trait CriticalError: Send + Sync {
    fn raise(&self, description: &str, cause: &CriticalCause);
}

impl<F> CriticalError for F
where
    F: Fn(&str, &CriticalCause) + Send + Sync,
{
    fn raise(&self, description: &str, cause: &CriticalCause) {
        self(description, cause)
    }
}

/// Critical error sink that only logs
#[derive(Debug, Clone, Copy, Default)]
pub struct LogCriticalError;

impl CriticalError for LogCriticalError {
    fn raise(&self, description: &str, cause: &CriticalCause) {
        error!(error = %cause, "Critical error: {}", description);
    }
}

#[cfg(test)]
#[path = "pipeline_tests.rs"]
mod tests;
