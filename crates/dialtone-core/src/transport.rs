//! External collaborators consumed by the core
//!
//! The telephony SDK, the call-history store and the platform audio stack live
//! outside this crate. The core talks to them only through these traits, which
//! the embedding application implements and injects.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────┐
//! │   CallSessionStateMachine    │
//! └──────┬───────────────┬───────┘
//!        │ commands      │ records
//! ┌──────▼───────┐ ┌─────▼──────────────┐
//! │ Telephony    │ │ CallHistory        │
//! │ Session      │ │ Repository         │
//! └──────┬───────┘ └────────────────────┘
//!        │ events / stats
//!        ▼
//!   TransportEvent stream
//! ```

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::call::{CallRecord, EndReason};
use crate::error::CallResult;

/// Raw statistics reported by the media transport for one call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransportStats {
    pub round_trip_time_ms: Option<f64>,
    pub jitter_ms: Option<f64>,
    pub packet_loss_percent: Option<f64>,
    pub audio_bitrate_kbps: Option<f64>,
    /// ICE candidate type in use locally (host, srflx, relay...)
    pub local_candidate_type: Option<String>,
    pub remote_candidate_type: Option<String>,
}

/// Events pushed by the transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A remote party is calling
    IncomingCall {
        call_id: String,
        caller_number: String,
        caller_name: Option<String>,
    },
    /// The remote party answered our outgoing call
    RemoteAnswered { call_id: String },
    /// The call ended on the transport side
    CallEnded { call_id: String, reason: EndReason },
    /// Media/signaling connectivity dropped mid-call
    ConnectionLost { call_id: String },
    /// Statistics pushed by the transport, outside the regular polling
    QualityReport { call_id: String, stats: TransportStats },
}

impl TransportEvent {
    /// Call this event refers to
    pub fn call_id(&self) -> &str {
        match self {
            TransportEvent::IncomingCall { call_id, .. }
            | TransportEvent::RemoteAnswered { call_id }
            | TransportEvent::CallEnded { call_id, .. }
            | TransportEvent::ConnectionLost { call_id }
            | TransportEvent::QualityReport { call_id, .. } => call_id,
        }
    }
}

/// Abstract telephony/WebRTC transport
#[async_trait]
pub trait TelephonySession: Send + Sync {
    /// Register with the telephony backend (or re-establish a dropped connection)
    async fn connect(&self) -> CallResult<()>;

    /// Place a call; returns the transport-assigned call id
    async fn make_call(&self, to: &str) -> CallResult<String>;

    async fn answer(&self, call_id: &str) -> CallResult<()>;

    async fn decline(&self, call_id: &str, reason: &str) -> CallResult<()>;

    async fn hangup(&self, call_id: &str) -> CallResult<()>;

    async fn hold(&self, call_id: &str) -> CallResult<()>;

    async fn unhold(&self, call_id: &str) -> CallResult<()>;

    async fn send_dtmf(&self, call_id: &str, digit: char) -> CallResult<()>;

    /// Current media statistics for a call
    async fn stats(&self, call_id: &str) -> CallResult<TransportStats>;

    /// Stream of transport-side events
    fn events(&self) -> BoxStream<'static, TransportEvent>;
}

/// Call history persistence
///
/// Fire-and-forget from the core's perspective: failures are logged and never
/// fail a user-visible call action.
#[async_trait]
pub trait CallHistoryRepository: Send + Sync {
    async fn save_call_record(&self, record: CallRecord) -> CallResult<()>;
}

/// History sink that drops every record
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCallHistory;

#[async_trait]
impl CallHistoryRepository for NoopCallHistory {
    async fn save_call_record(&self, _record: CallRecord) -> CallResult<()> {
        Ok(())
    }
}
