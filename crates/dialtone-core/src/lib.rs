//! # dialtone-core
//!
//! Call-session orchestration for a mobile calling client. The crate owns the
//! lifecycle of the device's single call and hardens it against flaky
//! networks; the telephony SDK, the call-history store and the native audio
//! stack are injected through traits.
//!
//! ## Components
//!
//! - [`CallSessionStateMachine`] - phases, commands, duration tick, archiving
//! - [`RetryManager`] - exponential backoff with jitter, cancellable by id
//! - [`ConnectionQualityMonitor`] - 2 s sampling, scoring, degradation alerts
//! - [`AudioRouteController`] - mute, loudspeaker and output routing
//! - [`events`] - broadcast streams every component publishes on
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dialtone_core::{CallSessionBuilder, EndReason, TelephonySession};
//! use std::sync::Arc;
//! use tokio_stream::StreamExt;
//!
//! # async fn run(transport: Arc<dyn TelephonySession>) -> dialtone_core::CallResult<()> {
//! let machine = CallSessionBuilder::new().with_transport(transport).build()?;
//! machine.register().await?;
//! machine.attach_transport_events();
//!
//! let mut states = machine.subscribe();
//! while let Some(Ok(state)) = states.next().await {
//!     println!("{} (seq {})", state.phase, state.sequence);
//!     if state.phase.is_terminal() {
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod audio;
pub mod call;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod quality;
pub mod retry;
pub mod timer;
pub mod transport;

pub use audio::{AudioMode, AudioOutput, AudioPlatformBridge, AudioRouteController, AudioRouteState};
pub use call::{
    CallDirection, CallPhase, CallRecord, CallSession, CallSessionBuilder, CallSessionState,
    CallSessionStateMachine, CallStatus, EndReason, OptimisticFlag,
};
pub use config::{CallConfig, CoreConfig, QualityConfig, RetryPresets};
pub use error::{CallError, CallResult, ErrorContext};
pub use events::{EventEmitter, EventStream};
pub use logging::{setup_logging, LogFormat, LoggingConfig};
pub use quality::{
    ConnectionQualityMonitor, ConnectionQualitySample, DegradedQualityAlert, QualityAssessment,
    QualityLevel,
};
pub use retry::{RetryConfig, RetryManager, RetryResult, RetryState, RetryStatus};
pub use transport::{CallHistoryRepository, TelephonySession, TransportEvent, TransportStats};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
