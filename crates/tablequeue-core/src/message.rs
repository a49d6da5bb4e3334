//! Message types for table-backed queues including core domain identifiers.

use crate::error::ValidationError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

/// Header map carried by every message
pub type Headers = HashMap<String, String>;

// ============================================================================
// Core Domain Identifiers
// ============================================================================

/// Validated, schema-qualified address of a queue table
///
/// Accepts plain table names (`orders`), bracketed names (`[dbo].[orders]`)
/// and the `table@schema` form. Equality is by string value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueAddress(String);

impl QueueAddress {
    /// Create new queue address with validation
    pub fn new(name: impl Into<String>) -> Result<Self, ValidationError> {
        let name = name.into();

        if name.is_empty() || name.len() > 260 {
            return Err(ValidationError::OutOfRange {
                field: "queue_address".to_string(),
                message: "must be 1-260 characters".to_string(),
            });
        }

        if !name.chars().all(|c| {
            c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@' | '[' | ']')
        }) {
            return Err(ValidationError::InvalidFormat {
                field: "queue_address".to_string(),
                message: "only ASCII alphanumeric and '-', '_', '.', '@', '[', ']' allowed"
                    .to_string(),
            });
        }

        if name.starts_with('@') || name.ends_with('@') || name.matches('@').count() > 1 {
            return Err(ValidationError::InvalidFormat {
                field: "queue_address".to_string(),
                message: "schema separator '@' must join a table and a schema".to_string(),
            });
        }

        Ok(Self(name))
    }

    /// Get queue address as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for QueueAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for QueueAddress {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

// ============================================================================
// Message Types
// ============================================================================

/// A message dequeued from a table
///
/// Headers may be mutated while the message is processed. The headers read
/// from the row are kept aside so [`Message::reset_headers`] can restore them
/// before a retry or a recoverability decision.
#[derive(Debug, Clone)]
pub struct Message {
    transport_id: String,
    headers: Headers,
    original_headers: Headers,
    body: Bytes,
    expired: bool,
}

impl Message {
    /// Create a message from its transport id, headers and body
    pub fn new(transport_id: impl Into<String>, headers: Headers, body: Bytes) -> Self {
        Self {
            transport_id: transport_id.into(),
            original_headers: headers.clone(),
            headers,
            body,
            expired: false,
        }
    }

    /// Mark the message as expired (its time-to-be-received has passed)
    pub fn with_expired(mut self, expired: bool) -> Self {
        self.expired = expired;
        self
    }

    /// Transport-assigned id, unique per physical row
    pub fn transport_id(&self) -> &str {
        &self.transport_id
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn is_expired(&self) -> bool {
        self.expired
    }

    /// Borrow the id and body alongside mutable headers, for delivery
    pub fn parts_mut(&mut self) -> (&str, &mut Headers, &Bytes) {
        (&self.transport_id, &mut self.headers, &self.body)
    }

    /// Restore the header set read from the row, discarding every mutation
    pub fn reset_headers(&mut self) {
        self.headers = self.original_headers.clone();
    }
}

/// A row as stored in a queue table
///
/// Headers are kept in their serialized (JSON object) form until the row is
/// parsed; a row whose headers cannot be parsed is poison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRow {
    pub id: String,
    pub headers: String,
    pub body: Bytes,
    pub expired: bool,
}

impl MessageRow {
    /// Build a row from a message id, a header map and a body
    pub fn new(id: impl Into<String>, headers: &Headers, body: Bytes) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: id.into(),
            headers: serde_json::to_string(headers)?,
            body,
            expired: false,
        })
    }

    /// Classify the row as a valid message or as poison
    pub fn into_outcome(self) -> ReceiveOutcome {
        if self.id.trim().is_empty() {
            return ReceiveOutcome::Poison(PoisonMessage {
                row: self,
                reason: "row has no message id".to_string(),
            });
        }

        match serde_json::from_str::<Headers>(&self.headers) {
            Ok(headers) => ReceiveOutcome::Successful(
                Message::new(self.id, headers, self.body).with_expired(self.expired),
            ),
            Err(e) => ReceiveOutcome::Poison(PoisonMessage {
                reason: format!("headers could not be deserialized: {}", e),
                row: self,
            }),
        }
    }
}

/// A row that could not be turned into a [`Message`]
///
/// The row is kept unchanged so it can be moved to the error queue as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoisonMessage {
    pub row: MessageRow,
    pub reason: String,
}

/// Result of a single receive against a queue table
#[derive(Debug, Clone)]
pub enum ReceiveOutcome {
    /// A valid message was dequeued
    Successful(Message),
    /// A row was dequeued but could not be parsed
    Poison(PoisonMessage),
    /// The queue had no row available
    Empty,
}

/// A message about to be inserted into a queue table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub message_id: String,
    pub headers: Headers,
    pub body: Bytes,
}

impl OutgoingMessage {
    pub fn new(message_id: impl Into<String>, headers: Headers, body: Bytes) -> Self {
        Self {
            message_id: message_id.into(),
            headers,
            body,
        }
    }

    /// Convert into the row representation used by storage engines
    pub fn to_row(&self) -> Result<MessageRow, serde_json::Error> {
        MessageRow::new(self.message_id.clone(), &self.headers, self.body.clone())
    }
}

impl From<&Message> for OutgoingMessage {
    fn from(message: &Message) -> Self {
        Self::new(
            message.transport_id(),
            message.headers().clone(),
            message.body().clone(),
        )
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
