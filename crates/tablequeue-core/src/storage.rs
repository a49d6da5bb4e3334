//! Storage contract the receive pipeline needs from a table-backed queue engine.
//!
//! The pipeline never issues SQL itself. A storage engine implements
//! [`QueueStorage`] and decides how a peek, a locking read-and-delete, a
//! dead-letter move and an insert map onto its tables.

use crate::error::TransportError;
use crate::message::{OutgoingMessage, PoisonMessage, QueueAddress, ReceiveOutcome};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Transaction isolation levels a storage engine may be asked for
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadUncommitted,
    #[default]
    ReadCommitted,
    RepeatableRead,
    Snapshot,
    Serializable,
}

impl std::fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::ReadUncommitted => "read uncommitted",
            Self::ReadCommitted => "read committed",
            Self::RepeatableRead => "repeatable read",
            Self::Snapshot => "snapshot",
            Self::Serializable => "serializable",
        };
        write!(f, "{}", name)
    }
}

/// Interface implemented by table-backed queue engines
///
/// Dropping a transaction that was neither committed nor rolled back must roll
/// it back; the pipeline relies on this when a transaction timeout fires.
#[async_trait]
pub trait QueueStorage: Send + Sync + 'static {
    /// Engine-specific transaction handle
    type Transaction: Send + 'static;

    /// Open a new transaction at the given isolation level
    async fn begin(&self, isolation: IsolationLevel) -> Result<Self::Transaction, TransportError>;

    /// Commit a transaction
    async fn commit(&self, transaction: Self::Transaction) -> Result<(), TransportError>;

    /// Roll back a transaction
    async fn rollback(&self, transaction: Self::Transaction) -> Result<(), TransportError>;

    /// Count the rows ready to be received, outside or inside a transaction
    async fn peek(
        &self,
        queue: &QueueAddress,
        transaction: Option<&mut Self::Transaction>,
    ) -> Result<u64, TransportError>;

    /// Read and delete one row under the given transaction
    async fn receive(
        &self,
        queue: &QueueAddress,
        transaction: &mut Self::Transaction,
    ) -> Result<ReceiveOutcome, TransportError>;

    /// Move a poison row, unchanged, into the given error queue
    async fn dead_letter(
        &self,
        queue: &QueueAddress,
        poison: &PoisonMessage,
        transaction: &mut Self::Transaction,
    ) -> Result<(), TransportError>;

    /// Insert a message; `None` as time-to-live means it never expires
    async fn send(
        &self,
        queue: &QueueAddress,
        message: &OutgoingMessage,
        time_to_live: Option<Duration>,
        transaction: &mut Self::Transaction,
    ) -> Result<(), TransportError>;

    /// Delete every row of a queue, returning the number of rows removed
    async fn purge(&self, queue: &QueueAddress) -> Result<u64, TransportError>;
}
