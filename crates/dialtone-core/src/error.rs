//! Error types for the call-session core
//!
//! Every fallible operation in this crate returns [`CallResult`]. The variants
//! follow the recovery taxonomy the rest of the crate relies on:
//!
//! - **Retryable** - [`CallError::TransientNetwork`], [`CallError::MediaNegotiation`]
//!   and [`CallError::OperationTimeout`] are fed back into the
//!   [`RetryManager`](crate::retry::RetryManager)
//! - **Fatal** - [`CallError::Authentication`] is never retried and ends call setup
//! - **Recoverable warnings** - [`CallError::PlatformAudio`] surfaces on the
//!   snapshot while the call continues
//! - **Swallowed** - [`CallError::LoggingFailure`] is logged and never unwinds a
//!   user-facing action
//! - **Terminal, not an error** - [`CallError::UserCancelled`]

use thiserror::Error;
use tracing::error;

/// Result type for call-core operations
pub type CallResult<T> = Result<T, CallError>;

/// Errors that can occur while orchestrating a call
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CallError {
    /// Network hiccup; the operation may succeed if attempted again
    #[error("Transient network error: {reason}")]
    TransientNetwork { reason: String },

    /// Credentials rejected by the telephony backend
    #[error("Authentication failed: {reason}")]
    Authentication { reason: String },

    /// SDP/codec negotiation failed
    #[error("Media negotiation failed: {reason}")]
    MediaNegotiation { reason: String },

    /// The user (or the owning component) cancelled the operation
    #[error("Operation cancelled by user")]
    UserCancelled,

    /// The audio platform refused a routing/mode change
    #[error("Platform audio error: {reason}")]
    PlatformAudio { reason: String },

    /// The call-history collaborator failed to persist a record
    #[error("Call history logging failed: {reason}")]
    LoggingFailure { reason: String },

    /// A command arrived in a phase that does not accept it
    #[error("Invalid state for {operation}: call is {actual}")]
    InvalidState { operation: String, actual: String },

    /// DTMF digit outside `0-9`, `A-D`, `*`, `#`
    #[error("Invalid DTMF digit: {digit:?}")]
    InvalidDtmfDigit { digit: char },

    /// Configuration value out of range
    #[error("Invalid configuration for {field}: {reason}")]
    InvalidConfiguration { field: String, reason: String },

    /// An outer deadline elapsed
    #[error("Operation timed out after {duration_ms}ms")]
    OperationTimeout { duration_ms: u64 },

    /// Internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl CallError {
    /// Create a transient network error
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::TransientNetwork {
            reason: reason.into(),
        }
    }

    /// Create an authentication error
    pub fn authentication(reason: impl Into<String>) -> Self {
        Self::Authentication {
            reason: reason.into(),
        }
    }

    /// Create a media negotiation error
    pub fn media_negotiation(reason: impl Into<String>) -> Self {
        Self::MediaNegotiation {
            reason: reason.into(),
        }
    }

    /// Create a platform audio error
    pub fn platform_audio(reason: impl Into<String>) -> Self {
        Self::PlatformAudio {
            reason: reason.into(),
        }
    }

    /// Create a logging failure
    pub fn logging(reason: impl Into<String>) -> Self {
        Self::LoggingFailure {
            reason: reason.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(operation: impl Into<String>, actual: impl std::fmt::Display) -> Self {
        Self::InvalidState {
            operation: operation.into(),
            actual: actual.to_string(),
        }
    }

    /// Create a configuration error
    pub fn config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether a retry of the same operation may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CallError::TransientNetwork { .. }
                | CallError::MediaNegotiation { .. }
                | CallError::OperationTimeout { .. }
        )
    }

    /// Whether this error must end call setup immediately
    pub fn is_fatal(&self) -> bool {
        matches!(self, CallError::Authentication { .. })
    }

    /// Short category label used in structured logs
    pub fn category(&self) -> &'static str {
        match self {
            CallError::TransientNetwork { .. } | CallError::OperationTimeout { .. } => "network",
            CallError::Authentication { .. } => "authentication",
            CallError::MediaNegotiation { .. } => "media",
            CallError::UserCancelled => "cancelled",
            CallError::PlatformAudio { .. } => "audio",
            CallError::LoggingFailure { .. } => "logging",
            CallError::InvalidState { .. } | CallError::InvalidDtmfDigit { .. } => "state",
            CallError::InvalidConfiguration { .. } => "configuration",
            CallError::Internal { .. } => "internal",
        }
    }
}

/// Context-aware error wrapper
///
/// Adds the failing operation to the error message and logs it with its
/// category. The variant is kept so retry classification still works on the
/// wrapped error.
pub trait ErrorContext<T> {
    /// Add context to the error
    fn context(self, context: &str) -> CallResult<T>;

    /// Add context with lazy evaluation
    fn with_context<F>(self, f: F) -> CallResult<T>
    where
        F: FnOnce() -> String;
}

impl<T> ErrorContext<T> for CallResult<T> {
    fn context(self, context: &str) -> CallResult<T> {
        self.with_context(|| context.to_string())
    }

    fn with_context<F>(self, f: F) -> CallResult<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| {
            let context = f();
            error!(
                error = %e,
                context = %context,
                category = e.category(),
                "Operation failed with context"
            );
            prefix_reason(e, &context)
        })
    }
}

fn prefix_reason(error: CallError, context: &str) -> CallError {
    let wrap = |reason: String| format!("{}: {}", context, reason);
    match error {
        CallError::TransientNetwork { reason } => CallError::TransientNetwork { reason: wrap(reason) },
        CallError::Authentication { reason } => CallError::Authentication { reason: wrap(reason) },
        CallError::MediaNegotiation { reason } => CallError::MediaNegotiation { reason: wrap(reason) },
        CallError::PlatformAudio { reason } => CallError::PlatformAudio { reason: wrap(reason) },
        CallError::LoggingFailure { reason } => CallError::LoggingFailure { reason: wrap(reason) },
        CallError::Internal { message } => CallError::Internal { message: wrap(message) },
        other => other,
    }
}
