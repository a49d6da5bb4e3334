//! In-memory table storage for testing and development.
//!
//! This module provides a [`QueueStorage`] implementation that:
//! - Keeps one ordered row list per queue table
//! - Stores headers in serialized form so malformed rows surface as poison
//! - Tracks per-row expiry from the send time-to-live
//! - Gives every transaction rollback-on-drop semantics
//! - Lets tests inject peek/receive failures and slow receives
//!
//! Received rows are removed immediately and restored on rollback, which
//! mirrors a locking read-and-delete. Inserts made inside a transaction only
//! become visible when it commits.

use crate::error::TransportError;
use crate::message::{MessageRow, OutgoingMessage, PoisonMessage, QueueAddress, ReceiveOutcome};
use crate::storage::{IsolationLevel, QueueStorage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockWriteGuard};
use std::time::Duration;
use tracing::{debug, warn};

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

// ============================================================================
// Internal Storage Structures
// ============================================================================

/// State shared by the storage handle and its open transactions
#[derive(Default)]
struct StorageState {
    tables: HashMap<QueueAddress, VecDeque<StoredRow>>,
    next_sequence: u64,
    open_transactions: usize,
}

impl StorageState {
    fn table_mut(&mut self, queue: &QueueAddress) -> Result<&mut VecDeque<StoredRow>, TransportError> {
        self.tables
            .get_mut(queue)
            .ok_or_else(|| TransportError::QueueNotFound {
                queue_name: queue.to_string(),
            })
    }

    fn append(&mut self, queue: &QueueAddress, row: MessageRow, expires_at: Option<DateTime<Utc>>) -> Result<(), TransportError> {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.table_mut(queue)?.push_back(StoredRow {
            sequence,
            row,
            expires_at,
        });
        Ok(())
    }

    /// Put a received row back at its original position
    fn restore(&mut self, queue: &QueueAddress, stored: StoredRow) {
        let table = self.tables.entry(queue.clone()).or_default();
        let position = table
            .iter()
            .position(|existing| existing.sequence > stored.sequence)
            .unwrap_or(table.len());
        table.insert(position, stored);
    }
}

/// A row with its insertion order and expiry
#[derive(Clone)]
struct StoredRow {
    sequence: u64,
    row: MessageRow,
    expires_at: Option<DateTime<Utc>>,
}

impl StoredRow {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }
}

/// Insert buffered until commit
struct PendingInsert {
    queue: QueueAddress,
    row: MessageRow,
    expires_at: Option<DateTime<Utc>>,
}

/// Switches used by tests to simulate a degraded database
#[derive(Default)]
struct FaultInjection {
    fail_peek: AtomicBool,
    fail_receive: AtomicBool,
    receive_delay_ms: AtomicU64,
}

// ============================================================================
// InMemoryStorage
// ============================================================================

/// In-memory table storage
#[derive(Clone, Default)]
pub struct InMemoryStorage {
    state: Arc<RwLock<StorageState>>,
    faults: Arc<FaultInjection>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create storage with the given (empty) tables
    pub fn with_queues<'a>(queues: impl IntoIterator<Item = &'a QueueAddress>) -> Self {
        let storage = Self::new();
        for queue in queues {
            storage.create_queue(queue);
        }
        storage
    }

    /// Create an empty table; an existing table is left untouched
    pub fn create_queue(&self, queue: &QueueAddress) {
        if let Ok(mut state) = self.state.write() {
            state.tables.entry(queue.clone()).or_default();
        }
    }

    /// Insert a message outside of any transaction
    pub fn enqueue(
        &self,
        queue: &QueueAddress,
        message: &OutgoingMessage,
        time_to_live: Option<Duration>,
    ) -> Result<(), TransportError> {
        let row = message.to_row()?;
        let expires_at = expiry_from(time_to_live)?;
        self.lock()?.append(queue, row, expires_at)
    }

    /// Insert a raw row, bypassing header serialization
    ///
    /// Used to place malformed (poison) or pre-expired rows in a table.
    pub fn insert_row(&self, queue: &QueueAddress, row: MessageRow) -> Result<(), TransportError> {
        self.lock()?.append(queue, row, None)
    }

    /// Snapshot of the committed rows of a table, in receive order
    pub fn rows(&self, queue: &QueueAddress) -> Vec<MessageRow> {
        self.state
            .read()
            .ok()
            .and_then(|state| {
                state
                    .tables
                    .get(queue)
                    .map(|table| table.iter().map(|stored| stored.row.clone()).collect())
            })
            .unwrap_or_default()
    }

    /// Number of committed rows in a table
    pub fn depth(&self, queue: &QueueAddress) -> usize {
        self.state
            .read()
            .ok()
            .and_then(|state| state.tables.get(queue).map(VecDeque::len))
            .unwrap_or(0)
    }

    /// Transactions begun and not yet committed, rolled back or dropped
    pub fn open_transactions(&self) -> usize {
        self.state
            .read()
            .map(|state| state.open_transactions)
            .unwrap_or(0)
    }

    /// Make every peek fail until cleared
    pub fn set_peek_failure(&self, fail: bool) {
        self.faults.fail_peek.store(fail, Ordering::SeqCst);
    }

    /// Make every receive fail until cleared
    pub fn set_receive_failure(&self, fail: bool) {
        self.faults.fail_receive.store(fail, Ordering::SeqCst);
    }

    /// Delay every receive by the given duration (`None` removes the delay)
    pub fn set_receive_delay(&self, delay: Option<Duration>) {
        let millis = delay.map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
        self.faults.receive_delay_ms.store(millis, Ordering::SeqCst);
    }

    fn lock(&self) -> Result<RwLockWriteGuard<'_, StorageState>, TransportError> {
        self.state
            .write()
            .map_err(|_| TransportError::storage("POISONED", "storage lock poisoned"))
    }

    fn finish(&self, mut transaction: InMemoryTransaction, commit: bool) -> Result<(), TransportError> {
        let mut state = self.lock()?;
        transaction.completed = true;
        state.open_transactions = state.open_transactions.saturating_sub(1);

        if commit {
            for pending in transaction.pending.drain(..) {
                state.append(&pending.queue, pending.row, pending.expires_at)?;
            }
        } else {
            for (queue, stored) in transaction.received.drain(..) {
                state.restore(&queue, stored);
            }
        }

        debug!(
            transaction_id = transaction.id,
            commit,
            "In-memory transaction completed"
        );
        Ok(())
    }
}

impl std::fmt::Debug for InMemoryStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStorage")
            .field("open_transactions", &self.open_transactions())
            .finish()
    }
}

fn expiry_from(time_to_live: Option<Duration>) -> Result<Option<DateTime<Utc>>, TransportError> {
    time_to_live
        .map(|ttl| {
            chrono::Duration::from_std(ttl)
                .map(|ttl| Utc::now() + ttl)
                .map_err(|e| TransportError::storage("INVALID_TTL", e.to_string()))
        })
        .transpose()
}

// ============================================================================
// InMemoryTransaction
// ============================================================================

/// Transaction over [`InMemoryStorage`]
///
/// Dropping the transaction without committing restores every received row
/// and discards every buffered insert.
pub struct InMemoryTransaction {
    id: u64,
    isolation: IsolationLevel,
    state: Arc<RwLock<StorageState>>,
    received: Vec<(QueueAddress, StoredRow)>,
    pending: Vec<PendingInsert>,
    completed: bool,
}

impl InMemoryTransaction {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }
}

impl std::fmt::Debug for InMemoryTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryTransaction")
            .field("id", &self.id)
            .field("isolation", &self.isolation)
            .field("received", &self.received.len())
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl Drop for InMemoryTransaction {
    fn drop(&mut self) {
        if self.completed {
            return;
        }

        match self.state.write() {
            Ok(mut state) => {
                state.open_transactions = state.open_transactions.saturating_sub(1);
                for (queue, stored) in self.received.drain(..) {
                    state.restore(&queue, stored);
                }
                debug!(transaction_id = self.id, "In-memory transaction rolled back on drop");
            }
            Err(_) => {
                warn!(transaction_id = self.id, "Storage lock poisoned; dropped transaction not rolled back");
            }
        }
    }
}

#[async_trait]
impl QueueStorage for InMemoryStorage {
    type Transaction = InMemoryTransaction;

    async fn begin(&self, isolation: IsolationLevel) -> Result<Self::Transaction, TransportError> {
        let mut state = self.lock()?;
        state.open_transactions += 1;
        let id = state.next_sequence;
        state.next_sequence += 1;

        Ok(InMemoryTransaction {
            id,
            isolation,
            state: Arc::clone(&self.state),
            received: Vec::new(),
            pending: Vec::new(),
            completed: false,
        })
    }

    async fn commit(&self, transaction: Self::Transaction) -> Result<(), TransportError> {
        self.finish(transaction, true)
    }

    async fn rollback(&self, transaction: Self::Transaction) -> Result<(), TransportError> {
        self.finish(transaction, false)
    }

    async fn peek(
        &self,
        queue: &QueueAddress,
        _transaction: Option<&mut Self::Transaction>,
    ) -> Result<u64, TransportError> {
        if self.faults.fail_peek.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionFailed {
                message: format!("injected peek failure on {}", queue),
            });
        }

        let mut state = self.lock()?;
        Ok(state.table_mut(queue)?.len() as u64)
    }

    async fn receive(
        &self,
        queue: &QueueAddress,
        transaction: &mut Self::Transaction,
    ) -> Result<ReceiveOutcome, TransportError> {
        let delay = self.faults.receive_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        if self.faults.fail_receive.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionFailed {
                message: format!("injected receive failure on {}", queue),
            });
        }

        let mut state = self.lock()?;
        let Some(stored) = state.table_mut(queue)?.pop_front() else {
            return Ok(ReceiveOutcome::Empty);
        };

        let mut row = stored.row.clone();
        row.expired = row.expired || stored.is_expired(Utc::now());
        transaction.received.push((queue.clone(), stored));

        Ok(row.into_outcome())
    }

    async fn dead_letter(
        &self,
        queue: &QueueAddress,
        poison: &PoisonMessage,
        transaction: &mut Self::Transaction,
    ) -> Result<(), TransportError> {
        self.lock()?.table_mut(queue)?;
        transaction.pending.push(PendingInsert {
            queue: queue.clone(),
            row: poison.row.clone(),
            expires_at: None,
        });
        Ok(())
    }

    async fn send(
        &self,
        queue: &QueueAddress,
        message: &OutgoingMessage,
        time_to_live: Option<Duration>,
        transaction: &mut Self::Transaction,
    ) -> Result<(), TransportError> {
        self.lock()?.table_mut(queue)?;
        transaction.pending.push(PendingInsert {
            queue: queue.clone(),
            row: message.to_row()?,
            expires_at: expiry_from(time_to_live)?,
        });
        Ok(())
    }

    async fn purge(&self, queue: &QueueAddress) -> Result<u64, TransportError> {
        let mut state = self.lock()?;
        let table = state.table_mut(queue)?;
        let purged = table.len() as u64;
        table.clear();
        Ok(purged)
    }
}
