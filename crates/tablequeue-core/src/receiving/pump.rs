//! Bounded-concurrency polling loop over one input queue.
//!
//! The loop peeks for a count, then launches one receive task per counted
//! row, each holding a semaphore permit for its lifetime. Peek and receive
//! failures feed two independent circuit breakers; a tripped breaker raises
//! a critical error but never stops the loop.
//!
//! Shutdown cancels the root token, which interrupts every permit wait,
//! empty-queue delay and failure backoff, then waits for the loop and every
//! receive in flight for at most [`DRAIN_TIMEOUT`].

use super::delay;
use super::no_transaction::NoTransactionReceiveStrategy;
use super::peeker::QueuePeeker;
use super::stats::{PumpStats, PumpStatsSnapshot};
use super::strategy::{ReceiveCore, ReceiveStrategy};
use super::transactional::TransactionalReceiveStrategy;
use crate::circuit_breaker::RepeatedFailuresOverTimeCircuitBreaker;
use crate::config::{TransportSettings, TransportTransactionMode};
use crate::error::{ConfigurationError, TransportError};
use crate::message::QueueAddress;
use crate::pipeline::{CriticalError, OnError, OnMessage};
use crate::storage::QueueStorage;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Upper bound on how long `stop` waits for outstanding work
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

const PEEK_BREAKER_NAME: &str = "SqlPeek";
const RECEIVE_BREAKER_NAME: &str = "ReceiveText";

/// Lifecycle of a [`MessagePump`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpState {
    Created,
    Initialized,
    Running,
    Stopping,
    Stopped,
}

impl std::fmt::Display for PumpState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Initialized => "initialized",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        write!(f, "{}", name)
    }
}

/// Everything the polling loop and receive tasks share, fixed at initialization
struct PumpRuntime<S: QueueStorage> {
    storage: Arc<S>,
    input_queue: QueueAddress,
    strategy: Arc<dyn ReceiveStrategy>,
    peeker: Option<QueuePeeker<S>>,
    peek_breaker: RepeatedFailuresOverTimeCircuitBreaker,
    receive_breaker: RepeatedFailuresOverTimeCircuitBreaker,
    peek_delay: Duration,
    failure_backoff: Duration,
    stats: Arc<PumpStats>,
}

/// Handles owned by a started pump
struct RunningPump {
    root: CancellationToken,
    limiter: Arc<Semaphore>,
    in_flight: Arc<InFlightRegistry>,
    polling_loop: JoinHandle<()>,
}

/// Receive tasks that have been launched and not yet finished
#[derive(Default)]
struct InFlightRegistry {
    next_id: AtomicU64,
    tasks: Mutex<HashMap<u64, JoinHandle<()>>>,
}

impl InFlightRegistry {
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn len(&self) -> usize {
        self.lock().len()
    }

    fn drain(&self) -> Vec<JoinHandle<()>> {
        self.lock().drain().map(|(_, handle)| handle).collect()
    }

    fn clear(&self) {
        self.lock().clear();
    }
}

/// Removes a receive task from the registry when the task ends, panics included
struct InFlightGuard {
    registry: Arc<InFlightRegistry>,
    id: u64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.id);
    }
}

/// Pulls messages from one input queue and hands them to a receive strategy
pub struct MessagePump<S: QueueStorage> {
    storage: Arc<S>,
    state: PumpState,
    runtime: Option<Arc<PumpRuntime<S>>>,
    running: Option<RunningPump>,
    stats: Arc<PumpStats>,
}

impl<S: QueueStorage> MessagePump<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self {
            storage,
            state: PumpState::Created,
            runtime: None,
            running: None,
            stats: Arc::new(PumpStats::new()),
        }
    }

    pub fn state(&self) -> PumpState {
        self.state
    }

    pub fn stats(&self) -> PumpStatsSnapshot {
        self.stats.snapshot()
    }

    /// Receive tasks currently running
    pub fn in_flight(&self) -> usize {
        self.running
            .as_ref()
            .map_or(0, |running| running.in_flight.len())
    }

    /// Wire the pump to the host pipeline and resolve its queues
    ///
    /// The receive strategy is chosen here from the transaction mode and
    /// never changes afterwards.
    pub async fn initialize(
        &mut self,
        on_message: Arc<dyn OnMessage>,
        on_error: Arc<dyn OnError>,
        critical_error: Arc<dyn CriticalError>,
        settings: TransportSettings,
    ) -> Result<(), TransportError> {
        if self.state != PumpState::Created {
            return Err(self.invalid_state("initialize"));
        }

        settings.validate()?;
        let input_queue = settings.input_queue_address()?;
        let error_queue = settings.error_queue_address()?;
        let time_to_wait = settings.circuit_breaker.time_to_wait_before_triggering();

        let peek_critical = Arc::clone(&critical_error);
        let peek_description = format!("Failed to peek {}", input_queue);
        let peek_breaker = RepeatedFailuresOverTimeCircuitBreaker::new(
            PEEK_BREAKER_NAME,
            time_to_wait,
            move |cause| peek_critical.raise(&peek_description, cause),
        );

        let receive_critical = Arc::clone(&critical_error);
        let receive_description = format!("Failed to receive from {}", input_queue);
        let receive_breaker = RepeatedFailuresOverTimeCircuitBreaker::new(
            RECEIVE_BREAKER_NAME,
            time_to_wait,
            move |cause| receive_critical.raise(&receive_description, cause),
        );

        let core = ReceiveCore::new(
            Arc::clone(&self.storage),
            input_queue.clone(),
            error_queue,
            on_message,
            on_error,
            critical_error,
            Arc::clone(&self.stats),
        );
        let strategy: Arc<dyn ReceiveStrategy> = match settings.transaction_mode {
            TransportTransactionMode::None => Arc::new(NoTransactionReceiveStrategy::new(
                core,
                settings.transaction.isolation_level,
            )),
            mode => Arc::new(TransactionalReceiveStrategy::new(
                core,
                mode,
                settings.transaction.clone(),
            )),
        };

        let peeker = settings
            .peek
            .isolated
            .then(|| QueuePeeker::new(Arc::clone(&self.storage), settings.peek.clone()));

        if settings.purge_on_startup {
            let purged = self.storage.purge(&input_queue).await?;
            info!(
                queue = %input_queue,
                purged,
                "{} messages was purged from table {}",
                purged,
                input_queue
            );
        }

        info!(
            queue = %input_queue,
            transaction_mode = %settings.transaction_mode,
            isolated_peek = settings.peek.isolated,
            "Message pump initialized"
        );

        self.runtime = Some(Arc::new(PumpRuntime {
            storage: Arc::clone(&self.storage),
            input_queue,
            strategy,
            peeker,
            peek_breaker,
            receive_breaker,
            peek_delay: settings.peek.delay(),
            failure_backoff: settings.circuit_breaker.failure_backoff(),
            stats: Arc::clone(&self.stats),
        }));
        self.state = PumpState::Initialized;
        Ok(())
    }

    /// Start the polling loop with at most `max_concurrency` receives in flight
    ///
    /// A stopped pump may be started again.
    pub fn start(&mut self, max_concurrency: usize) -> Result<(), TransportError> {
        if !matches!(self.state, PumpState::Initialized | PumpState::Stopped) {
            return Err(self.invalid_state("start"));
        }

        if max_concurrency == 0 || max_concurrency > Semaphore::MAX_PERMITS {
            return Err(ConfigurationError::Invalid {
                message: format!(
                    "max_concurrency must be between 1 and {}, got {}",
                    Semaphore::MAX_PERMITS,
                    max_concurrency
                ),
            }
            .into());
        }

        let runtime = self
            .runtime
            .clone()
            .ok_or_else(|| self.invalid_state("start"))?;

        let root = CancellationToken::new();
        let limiter = Arc::new(Semaphore::new(max_concurrency));
        let in_flight = Arc::new(InFlightRegistry::default());

        let polling_loop = tokio::spawn(process_messages(
            Arc::clone(&runtime),
            root.clone(),
            Arc::clone(&limiter),
            Arc::clone(&in_flight),
        ));

        info!(queue = %runtime.input_queue, max_concurrency, "Message pump started");

        self.running = Some(RunningPump {
            root,
            limiter,
            in_flight,
            polling_loop,
        });
        self.state = PumpState::Running;
        Ok(())
    }

    /// Stop polling and wait, bounded by [`DRAIN_TIMEOUT`], for work in flight
    ///
    /// Does nothing unless the pump is running.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            debug!(state = %self.state, "Stop requested for a pump that is not running");
            return;
        };

        self.state = PumpState::Stopping;
        info!("Message pump stopping");

        let RunningPump {
            root,
            limiter,
            in_flight,
            polling_loop,
        } = running;

        root.cancel();

        let drain = async {
            if let Err(e) = polling_loop.await {
                error!(error = %e, "Message pump polling loop terminated abnormally");
            }

            let receives = in_flight.drain();
            for result in join_all(receives).await {
                if let Err(e) = result {
                    warn!(error = %e, "Receive task terminated abnormally");
                }
            }
        };

        if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
            error!(
                timeout = ?DRAIN_TIMEOUT,
                "The message pump failed to stop within the time allowed ({}s)",
                DRAIN_TIMEOUT.as_secs()
            );
        }

        limiter.close();
        in_flight.clear();
        self.state = PumpState::Stopped;
        info!("Message pump stopped");
    }

    fn invalid_state(&self, operation: &str) -> TransportError {
        TransportError::InvalidState {
            operation: operation.to_string(),
            state: self.state.to_string(),
        }
    }
}

impl<S: QueueStorage> std::fmt::Debug for MessagePump<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagePump")
            .field("state", &self.state)
            .field("in_flight", &self.in_flight())
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}

// ============================================================================
// Polling Loop
// ============================================================================

async fn process_messages<S: QueueStorage>(
    runtime: Arc<PumpRuntime<S>>,
    root: CancellationToken,
    limiter: Arc<Semaphore>,
    in_flight: Arc<InFlightRegistry>,
) {
    while !root.is_cancelled() {
        let count = runtime.peek(&root).await;

        if root.is_cancelled() {
            break;
        }

        for _ in 0..count {
            let permit = tokio::select! {
                biased;
                _ = root.cancelled() => break,
                permit = Arc::clone(&limiter).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            launch_receive(&runtime, &root, &in_flight, permit);
        }
    }

    debug!(queue = %runtime.input_queue, "Message pump polling loop exited");
}

fn launch_receive<S: QueueStorage>(
    runtime: &Arc<PumpRuntime<S>>,
    root: &CancellationToken,
    in_flight: &Arc<InFlightRegistry>,
    permit: OwnedSemaphorePermit,
) {
    let id = in_flight.next_id.fetch_add(1, Ordering::Relaxed);
    let guard = InFlightGuard {
        registry: Arc::clone(in_flight),
        id,
    };
    let runtime = Arc::clone(runtime);
    let root = root.clone();
    let operation = root.child_token();

    // Held across spawn and insert so the guard cannot remove the entry first.
    let mut tasks = in_flight.lock();
    let handle = tokio::spawn(async move {
        let _guard = guard;
        let _permit = permit;
        runtime.receive(&operation, &root).await;
    });
    tasks.insert(id, handle);
}

impl<S: QueueStorage> PumpRuntime<S> {
    /// Count waiting rows; every failure has already been absorbed when this returns
    async fn peek(&self, root: &CancellationToken) -> u64 {
        PumpStats::increment(&self.stats.peeks);

        if let Some(peeker) = &self.peeker {
            return peeker.peek(&self.input_queue, &self.peek_breaker, root).await;
        }

        let result = tokio::select! {
            biased;
            _ = root.cancelled() => return 0,
            result = self.storage.peek(&self.input_queue, None) => result,
        };

        match result {
            Ok(count) => {
                self.peek_breaker.success();
                if count == 0 {
                    debug!(queue = %self.input_queue, "Input queue empty");
                    delay(self.peek_delay, root).await;
                }
                count
            }
            Err(e) => {
                warn!(queue = %self.input_queue, error = %e, "Sql peek operation failed");
                self.peek_breaker.failure(&e);
                delay(self.failure_backoff, root).await;
                0
            }
        }
    }

    async fn receive(&self, operation: &CancellationToken, root: &CancellationToken) {
        match self.strategy.receive_message(operation).await {
            Ok(()) => self.receive_breaker.success(),
            Err(e) => {
                warn!(queue = %self.input_queue, error = %e, "Sql receive operation failed");
                self.receive_breaker.failure(&e);
                delay(self.failure_backoff, root).await;
            }
        }
    }
}

#[cfg(test)]
#[path = "pump_tests.rs"]
mod tests;
