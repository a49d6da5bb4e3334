//! Error types for the receive pipeline and its storage contract.

use std::time::Duration;
use thiserror::Error;

/// Error type for every storage and pump operation
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Queue not found: {queue_name}")]
    QueueNotFound { queue_name: String },

    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Lock request on '{queue_name}' timed out")]
    LockTimeout { queue_name: String },

    #[error("Transaction timed out after {duration:?}")]
    TransactionTimeout { duration: Duration },

    #[error("Storage error ({code}): {message}")]
    Storage { code: String, message: String },

    #[error("Cannot {operation} while the pump is {state}")]
    InvalidState { operation: String, state: String },

    #[error("Serialization failed: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    ConfigurationError(#[from] ConfigurationError),

    #[error("Validation error: {0}")]
    ValidationError(#[from] ValidationError),
}

impl TransportError {
    /// Check if error is transient and the operation may succeed when repeated
    pub fn is_transient(&self) -> bool {
        match self {
            Self::QueueNotFound { .. } => false,
            Self::ConnectionFailed { .. } => true,
            Self::LockTimeout { .. } => true,
            Self::TransactionTimeout { .. } => true,
            Self::Storage { .. } => true, // Storage engines mostly report transient faults
            Self::InvalidState { .. } => false,
            Self::SerializationError(_) => false,
            Self::ConfigurationError(_) => false,
            Self::ValidationError(_) => false,
        }
    }

    /// Shorthand for a storage error with a code
    pub fn storage(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Storage {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },
}

/// Validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    Required { field: String },

    #[error("Invalid format for {field}: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Value out of range for {field}: {message}")]
    OutOfRange { field: String, message: String },
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
