//! # Table Queue Core
//!
//! Receive pipeline for message queues stored in relational tables. Each
//! queue is a table: enqueue is an insert, dequeue is a locking
//! read-and-delete, and visibility comes from transaction isolation.
//!
//! This library provides:
//! - A bounded-concurrency message pump with graceful, time-bounded shutdown
//! - Poison message isolation into an error queue
//! - Forwarding of delayed messages to their destination queue
//! - Circuit breakers that turn persistent storage failures into critical errors
//! - An in-memory storage engine for tests and development
//!
//! ## Module Organization
//!
//! - [`error`] - Error types for storage and pump operations
//! - [`message`] - Queue addresses, messages and raw rows
//! - [`storage`] - The storage engine contract
//! - [`pipeline`] - Callbacks and contexts exchanged with the host framework
//! - [`config`] - Transport settings
//! - [`circuit_breaker`] - Failure absorption for peek and receive
//! - [`receiving`] - Message pump, queue peeker and receive strategies
//! - [`providers`] - Storage engine implementations
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use tablequeue_core::{
//!     ErrorContext, ErrorHandleResult, InMemoryStorage, LogCriticalError, MessageContext,
//!     MessagePump, OnError, OnMessage, QueueAddress, TransportSettings,
//! };
//!
//! struct PrintHandler;
//!
//! #[async_trait]
//! impl OnMessage for PrintHandler {
//!     async fn on_message(&self, context: MessageContext<'_>) -> anyhow::Result<()> {
//!         println!("received {}", context.message_id);
//!         Ok(())
//!     }
//! }
//!
//! struct MoveToErrorQueue;
//!
//! #[async_trait]
//! impl OnError for MoveToErrorQueue {
//!     async fn on_error(&self, _context: ErrorContext) -> anyhow::Result<ErrorHandleResult> {
//!         Ok(ErrorHandleResult::Handled)
//!     }
//! }
//!
//! # tokio_test::block_on(async {
//! let orders = QueueAddress::new("orders")?;
//! let error = QueueAddress::new("error")?;
//! let storage = Arc::new(InMemoryStorage::with_queues([&orders, &error]));
//!
//! let mut pump = MessagePump::new(storage);
//! pump.initialize(
//!     Arc::new(PrintHandler),
//!     Arc::new(MoveToErrorQueue),
//!     Arc::new(LogCriticalError),
//!     TransportSettings::for_queue("orders"),
//! )
//! .await?;
//!
//! pump.start(8)?;
//! pump.stop().await;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # }).unwrap();
//! ```

pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod message;
pub mod pipeline;
pub mod providers;
pub mod receiving;
pub mod storage;

// Re-export commonly used types at crate root for convenience
pub use circuit_breaker::{CircuitBreakerState, RepeatedFailuresOverTimeCircuitBreaker};
pub use config::{
    CircuitBreakerSettings, QueuePeekerOptions, TransactionOptions, TransportSettings,
    TransportTransactionMode,
};
pub use error::{ConfigurationError, TransportError, ValidationError};
pub use message::{
    Headers, Message, MessageRow, OutgoingMessage, PoisonMessage, QueueAddress, ReceiveOutcome,
};
pub use pipeline::{
    ContextBag, CriticalCause, CriticalError, ErrorContext, ErrorHandleResult, LogCriticalError,
    MessageContext, OnError, OnMessage, TransportTransaction,
};
pub use providers::{InMemoryStorage, InMemoryTransaction};
pub use receiving::{
    MessagePump, PumpState, PumpStatsSnapshot, QueuePeeker, ReceiveStrategy, DRAIN_TIMEOUT,
    FORWARD_DESTINATION_HEADER,
};
pub use storage::{IsolationLevel, QueueStorage};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
