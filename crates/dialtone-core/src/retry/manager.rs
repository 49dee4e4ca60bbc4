//! Retry executor with exponential backoff, jitter and per-operation cancellation

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Instant};
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::RetryConfig;
use crate::error::CallError;
use crate::events::{EventEmitter, EventStream, DEFAULT_EVENT_CAPACITY};

/// Lifecycle of one retryable operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RetryStatus {
    /// Registered, no attempt started yet
    Idle,
    /// Sleeping before the next attempt
    Waiting,
    /// An attempt is in flight
    Attempting,
    /// The operation succeeded
    Succeeded,
    /// Attempts exhausted or a non-retryable error occurred
    Failed,
    /// Cancelled by [`RetryManager::cancel`] or by a superseding run
    Cancelled,
}

impl RetryStatus {
    /// Whether the operation has reached a final status
    pub fn is_terminal(&self) -> bool {
        matches!(self, RetryStatus::Succeeded | RetryStatus::Failed | RetryStatus::Cancelled)
    }
}

impl fmt::Display for RetryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RetryStatus::Idle => "idle",
            RetryStatus::Waiting => "waiting",
            RetryStatus::Attempting => "attempting",
            RetryStatus::Succeeded => "succeeded",
            RetryStatus::Failed => "failed",
            RetryStatus::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// Observable state of one in-flight operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryState {
    pub operation_id: String,
    pub status: RetryStatus,
    pub current_attempt: u32,
    pub max_attempts: u32,
    pub next_retry_in: Option<Duration>,
    pub last_error: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl RetryState {
    fn new(operation_id: &str, max_attempts: u32) -> Self {
        Self {
            operation_id: operation_id.to_string(),
            status: RetryStatus::Idle,
            current_attempt: 0,
            max_attempts,
            next_retry_in: None,
            last_error: None,
            started_at: Utc::now(),
        }
    }

    fn with_status(mut self, status: RetryStatus) -> Self {
        self.status = status;
        if status != RetryStatus::Waiting {
            self.next_retry_in = None;
        }
        self
    }

    fn with_attempt(mut self, attempt: u32) -> Self {
        self.current_attempt = attempt;
        self.with_status(RetryStatus::Attempting)
    }

    fn with_error(mut self, error: &impl fmt::Display) -> Self {
        self.last_error = Some(error.to_string());
        self
    }

    fn waiting(mut self, delay: Duration) -> Self {
        self.status = RetryStatus::Waiting;
        self.next_retry_in = Some(delay);
        self
    }
}

/// Outcome of [`RetryManager::execute`]
#[derive(Debug, Clone)]
pub struct RetryResult<T, E> {
    pub success: bool,
    pub data: Option<T>,
    /// The error that stopped the run, if any
    pub error: Option<E>,
    /// Actual invocations of the operation
    pub total_attempts: u32,
    pub total_duration: Duration,
    /// One entry per failed attempt, oldest first
    pub attempt_errors: Vec<E>,
    pub cancelled: bool,
}

impl<T, E> RetryResult<T, E> {
    /// Collapse into a plain `Result`
    ///
    /// Cancellation becomes [`CallError::UserCancelled`].
    pub fn into_result(self) -> Result<T, E>
    where
        E: From<CallError>,
    {
        match (self.data, self.error) {
            (Some(data), _) if self.success => Ok(data),
            _ if self.cancelled => Err(CallError::UserCancelled.into()),
            (_, Some(error)) => Err(error),
            _ => Err(CallError::internal("retry finished without result").into()),
        }
    }
}

type RetryPredicate<'a, E> = Box<dyn Fn(&E) -> bool + Send + Sync + 'a>;
type RetryCallback<'a, E> = Box<dyn Fn(u32, Duration, &E) + Send + Sync + 'a>;

/// Optional hooks for one execution
pub struct RetryHooks<'a, E> {
    is_retryable: Option<RetryPredicate<'a, E>>,
    on_retry: Option<RetryCallback<'a, E>>,
}

impl<'a, E> RetryHooks<'a, E> {
    pub fn new() -> Self {
        Self {
            is_retryable: None,
            on_retry: None,
        }
    }

    /// Only retry errors accepted by `predicate` (default: retry everything)
    pub fn retry_if(mut self, predicate: impl Fn(&E) -> bool + Send + Sync + 'a) -> Self {
        self.is_retryable = Some(Box::new(predicate));
        self
    }

    /// Called after each backoff wait, before the next attempt
    pub fn on_retry(mut self, callback: impl Fn(u32, Duration, &E) + Send + Sync + 'a) -> Self {
        self.on_retry = Some(Box::new(callback));
        self
    }

    fn should_retry(&self, error: &E) -> bool {
        self.is_retryable.as_ref().map_or(true, |predicate| predicate(error))
    }
}

impl<'a> RetryHooks<'a, CallError> {
    /// Retry only what the error taxonomy marks as retryable
    pub fn taxonomy() -> Self {
        Self::new().retry_if(CallError::is_retryable)
    }
}

impl<'a, E> Default for RetryHooks<'a, E> {
    fn default() -> Self {
        Self::new()
    }
}

struct OperationEntry {
    run_id: u64,
    token: CancellationToken,
    state: RetryState,
}

/// Generic exponential-backoff executor
///
/// Each execution is keyed by an operation id. Executions under distinct ids
/// run independently and are cancelled independently.
///
/// # Examples
///
/// ```rust
/// use dialtone_core::retry::{RetryConfig, RetryManager};
/// use dialtone_core::CallError;
/// use std::sync::atomic::{AtomicU32, Ordering};
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() {
/// let manager = RetryManager::new();
/// let config = RetryConfig::new(5, Duration::from_millis(1), Duration::from_millis(5), 1.0).unwrap();
/// let calls = AtomicU32::new(0);
///
/// let result = manager
///     .execute("register", &config, || async {
///         if calls.fetch_add(1, Ordering::SeqCst) < 2 {
///             Err(CallError::transient("registrar busy"))
///         } else {
///             Ok("registered")
///         }
///     })
///     .await;
///
/// assert!(result.success);
/// assert_eq!(result.total_attempts, 3);
/// # }
/// ```
pub struct RetryManager {
    operations: DashMap<String, OperationEntry>,
    next_run: AtomicU64,
    events: EventEmitter<RetryState>,
}

impl RetryManager {
    pub fn new() -> Self {
        Self::with_event_capacity(DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_event_capacity(capacity: usize) -> Self {
        Self {
            operations: DashMap::new(),
            next_run: AtomicU64::new(1),
            events: EventEmitter::new(capacity),
        }
    }

    /// Run `operation` with the default hooks (every error is retryable)
    pub async fn execute<T, E, F, Fut>(
        &self,
        operation_id: impl Into<String>,
        config: &RetryConfig,
        operation: F,
    ) -> RetryResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Clone + fmt::Display,
    {
        self.execute_with(operation_id, config, RetryHooks::new(), operation)
            .await
    }

    /// Run `operation` until success, exhaustion or cancellation
    pub async fn execute_with<T, E, F, Fut>(
        &self,
        operation_id: impl Into<String>,
        config: &RetryConfig,
        hooks: RetryHooks<'_, E>,
        mut operation: F,
    ) -> RetryResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Clone + fmt::Display,
    {
        let operation_id = operation_id.into();
        let started = Instant::now();
        let run_id = self.next_run.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let mut state = RetryState::new(&operation_id, config.max_attempts());

        let previous = self.operations.insert(
            operation_id.clone(),
            OperationEntry {
                run_id,
                token: token.clone(),
                state: state.clone(),
            },
        );
        if let Some(previous) = previous {
            warn!(
                operation = %operation_id,
                "Operation id already in flight, superseding previous run"
            );
            previous.token.cancel();
        }
        self.events.emit(state.clone());

        let _guard = RunGuard {
            manager: self,
            operation_id: &operation_id,
            run_id,
        };

        let mut attempt_errors: Vec<E> = Vec::new();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            state = state.with_attempt(attempt);
            self.publish(&operation_id, run_id, &state);
            debug!(
                operation = %operation_id,
                attempt = attempt,
                max_attempts = config.max_attempts(),
                "Attempting operation"
            );

            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                result = operation() => Some(result),
            };

            let error = match outcome {
                None => {
                    return self.finish_cancelled(&operation_id, run_id, state, attempt, started, attempt_errors);
                }
                Some(Ok(data)) => {
                    if attempt > 1 {
                        info!(operation = %operation_id, attempt = attempt, "Operation succeeded after retries");
                    }
                    self.finish(&operation_id, run_id, state.with_status(RetryStatus::Succeeded));
                    return RetryResult {
                        success: true,
                        data: Some(data),
                        error: None,
                        total_attempts: attempt,
                        total_duration: started.elapsed(),
                        attempt_errors,
                        cancelled: false,
                    };
                }
                Some(Err(error)) => error,
            };

            state = state.with_error(&error);
            attempt_errors.push(error.clone());

            let retryable = hooks.should_retry(&error);
            if !retryable || attempt >= config.max_attempts() {
                if retryable {
                    error!(operation = %operation_id, attempts = attempt, error = %error, "Operation failed after all retry attempts");
                } else {
                    error!(operation = %operation_id, attempt = attempt, error = %error, "Non-retryable error, not retrying");
                }
                self.finish(&operation_id, run_id, state.with_status(RetryStatus::Failed));
                return RetryResult {
                    success: false,
                    data: None,
                    error: Some(error),
                    total_attempts: attempt,
                    total_duration: started.elapsed(),
                    attempt_errors,
                    cancelled: false,
                };
            }

            let delay = {
                let mut rng = rand::thread_rng();
                config.jittered_delay(attempt, &mut rng)
            };
            state = state.waiting(delay);
            self.publish(&operation_id, run_id, &state);
            warn!(
                operation = %operation_id,
                attempt = attempt,
                error = %error,
                next_delay_ms = delay.as_millis() as u64,
                "Retryable error, will retry"
            );

            let cancelled = tokio::select! {
                biased;
                _ = token.cancelled() => true,
                _ = sleep(delay) => false,
            };
            if cancelled {
                return self.finish_cancelled(&operation_id, run_id, state, attempt, started, attempt_errors);
            }

            if let Some(on_retry) = hooks.on_retry.as_ref() {
                on_retry(attempt, delay, &error);
            }
        }
    }

    /// Cancel an in-flight operation
    ///
    /// Aborts the pending wait or the attempt in flight. Returns `false` when no
    /// operation is registered under `operation_id`.
    pub fn cancel(&self, operation_id: &str) -> bool {
        match self.operations.get(operation_id) {
            Some(entry) => {
                info!(operation = %operation_id, attempt = entry.state.current_attempt, "Cancelling operation");
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every in-flight operation
    pub fn cancel_all(&self) {
        for entry in self.operations.iter() {
            entry.token.cancel();
        }
    }

    /// Snapshot of an in-flight operation
    pub fn state(&self, operation_id: &str) -> Option<RetryState> {
        self.operations.get(operation_id).map(|entry| entry.state.clone())
    }

    /// Ids of every in-flight operation
    pub fn active_operations(&self) -> Vec<String> {
        self.operations.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Every state change of every operation
    pub fn subscribe(&self) -> EventStream<RetryState> {
        self.events.subscribe()
    }

    /// State changes of one operation id
    pub fn subscribe_operation(
        &self,
        operation_id: impl Into<String>,
    ) -> impl Stream<Item = RetryState> + Send + 'static {
        let operation_id = operation_id.into();
        self.events.subscribe().filter_map(move |item| match item {
            Ok(state) if state.operation_id == operation_id => Some(state),
            _ => None,
        })
    }

    fn publish(&self, operation_id: &str, run_id: u64, state: &RetryState) {
        match self.operations.get_mut(operation_id) {
            Some(mut entry) if entry.run_id == run_id => entry.state = state.clone(),
            // Superseded runs stay silent
            _ => return,
        }
        self.events.emit(state.clone());
    }

    fn finish(&self, operation_id: &str, run_id: u64, state: RetryState) {
        let removed = self
            .operations
            .remove_if(operation_id, |_, entry| entry.run_id == run_id)
            .is_some();
        if removed {
            self.events.emit(state);
        }
    }

    fn finish_cancelled<T, E>(
        &self,
        operation_id: &str,
        run_id: u64,
        state: RetryState,
        attempts: u32,
        started: Instant,
        attempt_errors: Vec<E>,
    ) -> RetryResult<T, E>
    where
        E: Clone,
    {
        info!(operation = %operation_id, attempts = attempts, "Operation cancelled");
        self.finish(operation_id, run_id, state.with_status(RetryStatus::Cancelled));
        RetryResult {
            success: false,
            data: None,
            error: attempt_errors.last().cloned(),
            total_attempts: attempts,
            total_duration: started.elapsed(),
            attempt_errors,
            cancelled: true,
        }
    }
}

impl Default for RetryManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RetryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryManager")
            .field("active_operations", &self.operations.len())
            .finish()
    }
}

/// Removes the entry if the execution future is dropped before finishing
struct RunGuard<'a> {
    manager: &'a RetryManager,
    operation_id: &'a str,
    run_id: u64,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        let run_id = self.run_id;
        if let Some((_, entry)) = self
            .manager
            .operations
            .remove_if(self.operation_id, |_, entry| entry.run_id == run_id)
        {
            debug!(operation = %self.operation_id, "Execution dropped before completion");
            self.manager
                .events
                .emit(entry.state.with_status(RetryStatus::Cancelled));
        }
    }
}
