//! Retry and recovery for network-facing operations
//!
//! [`RetryManager`] hardens SIP registration, call setup and reconnection with
//! exponential backoff and jitter. The manager has no wall-clock deadline of
//! its own; wrap an execution in [`with_timeout`] when one is needed.
//!
//! # Backoff Strategy
//!
//! The delay after failed attempt `n` is
//! `min(max_delay, initial_delay * backoff_multiplier^(n-1))`, multiplied by
//! `1 + uniform(-jitter_factor, +jitter_factor)` when jitter is enabled.

mod config;
mod manager;

pub use config::{RetryConfig, RetryConfigRepr, MAX_RETRY_DELAY};
pub use manager::{RetryHooks, RetryManager, RetryResult, RetryState, RetryStatus};

use std::future::Future;
use std::time::Duration;

use tracing::error;

use crate::error::{CallError, CallResult};

/// Helper to add operation timeout with proper error context
///
/// # Examples
///
/// ```rust
/// use dialtone_core::retry::with_timeout;
/// use dialtone_core::CallError;
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() {
/// let result: Result<(), CallError> = with_timeout(
///     "slow_operation",
///     Duration::from_millis(10),
///     async {
///         tokio::time::sleep(Duration::from_secs(1)).await;
///         Ok(())
///     },
/// )
/// .await;
///
/// assert_eq!(result, Err(CallError::OperationTimeout { duration_ms: 10 }));
/// # }
/// ```
pub async fn with_timeout<T, F>(operation_name: &str, timeout: Duration, future: F) -> CallResult<T>
where
    F: Future<Output = CallResult<T>>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => {
            error!(
                operation = operation_name,
                timeout_ms = timeout.as_millis() as u64,
                "Operation timed out"
            );
            Err(CallError::OperationTimeout {
                duration_ms: timeout.as_millis() as u64,
            })
        }
    }
}
