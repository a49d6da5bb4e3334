//! Transport settings and their defaults.
//!
//! Every field carries a serde default so a partially specified file (or none
//! at all) still deserializes; [`TransportSettings::validate`] then rejects
//! settings the pump cannot run with.

use crate::error::{ConfigurationError, TransportError};
use crate::message::QueueAddress;
use crate::storage::IsolationLevel;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How a receive relates to the storage transaction around it
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportTransactionMode {
    /// The row is deleted in a short transaction committed before delivery
    None,
    /// Receive and delivery share one transaction; a retry rolls it back
    #[default]
    ReceiveOnly,
    /// Like `ReceiveOnly`, and outgoing sends may enlist in the same transaction
    SendsAtomicWithReceive,
}

impl std::fmt::Display for TransportTransactionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::ReceiveOnly => "receive_only",
            Self::SendsAtomicWithReceive => "sends_atomic_with_receive",
        };
        write!(f, "{}", name)
    }
}

/// Transport configuration consumed by the message pump
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// Table the pump receives from
    pub input_queue: String,

    /// Table poison rows are moved to
    pub error_queue: String,

    /// Delete every row of the input queue once during initialization
    pub purge_on_startup: bool,

    /// Transaction handling for each receive
    pub transaction_mode: TransportTransactionMode,

    /// Maximum number of receives in flight at once
    pub max_concurrency: usize,

    /// Circuit breaker settings shared by the peek and receive breakers
    pub circuit_breaker: CircuitBreakerSettings,

    /// Peek behavior
    pub peek: QueuePeekerOptions,

    /// Receive transaction options
    pub transaction: TransactionOptions,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            input_queue: String::new(),
            error_queue: "error".to_string(),
            purge_on_startup: false,
            transaction_mode: TransportTransactionMode::default(),
            max_concurrency: 8,
            circuit_breaker: CircuitBreakerSettings::default(),
            peek: QueuePeekerOptions::default(),
            transaction: TransactionOptions::default(),
        }
    }
}

impl TransportSettings {
    /// Create settings for an input queue with all other values defaulted
    pub fn for_queue(input_queue: impl Into<String>) -> Self {
        Self {
            input_queue: input_queue.into(),
            ..Default::default()
        }
    }

    /// Check that the settings can drive a pump
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.input_queue.is_empty() {
            return Err(ConfigurationError::Missing {
                key: "input_queue".to_string(),
            }
            .into());
        }

        if self.error_queue.is_empty() {
            return Err(ConfigurationError::Missing {
                key: "error_queue".to_string(),
            }
            .into());
        }

        self.input_queue_address()?;
        self.error_queue_address()?;

        if self.input_queue == self.error_queue {
            return Err(ConfigurationError::Invalid {
                message: "input_queue and error_queue must differ".to_string(),
            }
            .into());
        }

        if self.max_concurrency == 0 {
            return Err(ConfigurationError::Invalid {
                message: "max_concurrency must be at least 1".to_string(),
            }
            .into());
        }

        if self.circuit_breaker.time_to_wait_before_triggering_seconds == 0 {
            return Err(ConfigurationError::Invalid {
                message: "circuit_breaker.time_to_wait_before_triggering_seconds must be positive"
                    .to_string(),
            }
            .into());
        }

        if self.peek.delay_ms == 0 {
            return Err(ConfigurationError::Invalid {
                message: "peek.delay_ms must be positive".to_string(),
            }
            .into());
        }

        if self.peek.max_records_to_peek == Some(0) {
            return Err(ConfigurationError::Invalid {
                message: "peek.max_records_to_peek must be positive when set".to_string(),
            }
            .into());
        }

        if self.transaction.timeout_seconds == Some(0) {
            return Err(ConfigurationError::Invalid {
                message: "transaction.timeout_seconds must be positive when set".to_string(),
            }
            .into());
        }

        Ok(())
    }

    pub fn input_queue_address(&self) -> Result<QueueAddress, TransportError> {
        Ok(QueueAddress::new(self.input_queue.clone())?)
    }

    pub fn error_queue_address(&self) -> Result<QueueAddress, TransportError> {
        Ok(QueueAddress::new(self.error_queue.clone())?)
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    /// How long failures must persist without a success before the breaker fires
    pub time_to_wait_before_triggering_seconds: u64,

    /// Pause after a failed peek or receive before the next attempt
    pub failure_backoff_ms: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            time_to_wait_before_triggering_seconds: 30,
            failure_backoff_ms: 1000,
        }
    }
}

impl CircuitBreakerSettings {
    pub fn time_to_wait_before_triggering(&self) -> Duration {
        Duration::from_secs(self.time_to_wait_before_triggering_seconds)
    }

    pub fn failure_backoff(&self) -> Duration {
        Duration::from_millis(self.failure_backoff_ms)
    }
}

/// Peek configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueuePeekerOptions {
    /// Wait after a peek that found nothing
    pub delay_ms: u64,

    /// Upper bound on the count a single peek reports
    pub max_records_to_peek: Option<u64>,

    /// Run each peek in its own transaction instead of a bare count query
    pub isolated: bool,

    /// Isolation level of the isolated peek transaction
    pub isolation_level: IsolationLevel,
}

impl Default for QueuePeekerOptions {
    fn default() -> Self {
        Self {
            delay_ms: 1000,
            max_records_to_peek: None,
            isolated: false,
            isolation_level: IsolationLevel::ReadCommitted,
        }
    }
}

impl QueuePeekerOptions {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// Receive transaction configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionOptions {
    /// Isolation level of the receive transaction
    pub isolation_level: IsolationLevel,

    /// Upper bound on a whole receive unit of work; unbounded when absent
    pub timeout_seconds: Option<u64>,
}

impl TransactionOptions {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_seconds.map(Duration::from_secs)
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
