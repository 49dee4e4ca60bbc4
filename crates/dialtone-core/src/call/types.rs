//! Call data model: phases, reasons, the live session and its archived record

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CallError;

/// Lifecycle phase of the call
///
/// `Idle → {Incoming, Outgoing} → Active ⇄ Held → Ended`; any live phase may
/// end in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CallPhase {
    #[default]
    Idle,
    /// Remote party is calling us
    Incoming,
    /// We are calling the remote party
    Outgoing,
    /// Media is flowing
    Active,
    /// Call is on hold
    Held,
    Ended,
    Failed,
}

impl CallPhase {
    /// A session exists and can still change
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            CallPhase::Incoming | CallPhase::Outgoing | CallPhase::Active | CallPhase::Held
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CallPhase::Ended | CallPhase::Failed)
    }

    /// Answered and not yet ended
    pub fn is_connected(&self) -> bool {
        matches!(self, CallPhase::Active | CallPhase::Held)
    }
}

impl fmt::Display for CallPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CallPhase::Idle => "idle",
            CallPhase::Incoming => "incoming",
            CallPhase::Outgoing => "outgoing",
            CallPhase::Active => "active",
            CallPhase::Held => "held",
            CallPhase::Ended => "ended",
            CallPhase::Failed => "failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallDirection {
    Incoming,
    Outgoing,
}

impl fmt::Display for CallDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallDirection::Incoming => f.write_str("incoming"),
            CallDirection::Outgoing => f.write_str("outgoing"),
        }
    }
}

/// Why a call ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EndReason {
    Declined,
    NoAnswer,
    NetworkError,
    ConnectionFailed,
    Transferred,
    UserHangUp,
    RemoteHangUp,
    Unknown,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EndReason::Declined => "declined",
            EndReason::NoAnswer => "no_answer",
            EndReason::NetworkError => "network_error",
            EndReason::ConnectionFailed => "connection_failed",
            EndReason::Transferred => "transferred",
            EndReason::UserHangUp => "user_hang_up",
            EndReason::RemoteHangUp => "remote_hang_up",
            EndReason::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

/// Outcome stored in the call history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallStatus {
    Answered,
    Missed,
    Declined,
    Completed,
    Failed,
}

impl CallStatus {
    /// Map an end reason and the final duration to a history status
    pub fn from_end_reason(reason: EndReason, duration: Duration) -> Self {
        let talked = duration > Duration::ZERO;
        match reason {
            EndReason::Declined => CallStatus::Declined,
            EndReason::NoAnswer => CallStatus::Missed,
            EndReason::NetworkError | EndReason::ConnectionFailed => {
                if talked {
                    CallStatus::Completed
                } else {
                    CallStatus::Failed
                }
            }
            EndReason::Transferred
            | EndReason::UserHangUp
            | EndReason::RemoteHangUp
            | EndReason::Unknown => {
                if talked {
                    CallStatus::Completed
                } else {
                    CallStatus::Answered
                }
            }
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CallStatus::Answered => "answered",
            CallStatus::Missed => "missed",
            CallStatus::Declined => "declined",
            CallStatus::Completed => "completed",
            CallStatus::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// A boolean toggled optimistically while a collaborator confirms it
///
/// The UI shows [`value`](Self::value) immediately; the flag is then either
/// confirmed or reverted to the previous value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptimisticFlag {
    Confirmed(bool),
    Pending { previous: bool, requested: bool },
}

impl OptimisticFlag {
    /// Value to display
    pub fn value(&self) -> bool {
        match *self {
            OptimisticFlag::Confirmed(value) => value,
            OptimisticFlag::Pending { requested, .. } => requested,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, OptimisticFlag::Pending { .. })
    }

    pub fn request(self, requested: bool) -> Self {
        OptimisticFlag::Pending {
            previous: self.confirmed_value(),
            requested,
        }
    }

    pub fn revert(self) -> Self {
        OptimisticFlag::Confirmed(self.confirmed_value())
    }

    fn confirmed_value(&self) -> bool {
        match *self {
            OptimisticFlag::Confirmed(value) => value,
            OptimisticFlag::Pending { previous, .. } => previous,
        }
    }
}

impl Default for OptimisticFlag {
    fn default() -> Self {
        OptimisticFlag::Confirmed(false)
    }
}

/// The one live call on the device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSession {
    pub call_id: String,
    pub direction: CallDirection,
    pub phase: CallPhase,
    /// Remote party number (the callee for outgoing calls)
    pub caller_number: String,
    pub caller_name: Option<String>,
    pub started_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Time spent Active or Held, advanced by the duration tick
    pub duration: Duration,
    pub mute: OptimisticFlag,
    pub speaker: OptimisticFlag,
    pub hold: OptimisticFlag,
    pub is_keypad_visible: bool,
    pub quality_score: Option<f64>,
    pub quality_warning: bool,
    pub decline_reason: Option<String>,
    pub end_reason: Option<EndReason>,
}

impl CallSession {
    pub fn incoming(call_id: impl Into<String>, caller_number: impl Into<String>) -> Self {
        Self::new(call_id.into(), CallDirection::Incoming, CallPhase::Incoming, caller_number.into())
    }

    pub fn outgoing(call_id: impl Into<String>, callee_number: impl Into<String>) -> Self {
        Self::new(call_id.into(), CallDirection::Outgoing, CallPhase::Outgoing, callee_number.into())
    }

    fn new(call_id: String, direction: CallDirection, phase: CallPhase, caller_number: String) -> Self {
        Self {
            call_id,
            direction,
            phase,
            caller_number,
            caller_name: None,
            started_at: Utc::now(),
            answered_at: None,
            ended_at: None,
            duration: Duration::ZERO,
            mute: OptimisticFlag::default(),
            speaker: OptimisticFlag::default(),
            hold: OptimisticFlag::default(),
            is_keypad_visible: false,
            quality_score: None,
            quality_warning: false,
            decline_reason: None,
            end_reason: None,
        }
    }

    pub fn with_caller_name(mut self, name: Option<String>) -> Self {
        self.caller_name = name;
        self
    }

    /// Start from the mute and loudspeaker state the audio route is in
    pub fn with_audio_flags(mut self, muted: bool, speaker_on: bool) -> Self {
        self.mute = OptimisticFlag::Confirmed(muted);
        self.speaker = OptimisticFlag::Confirmed(speaker_on);
        self
    }

    /// Mark the call as answered now
    pub fn mark_answered(&mut self) {
        self.phase = CallPhase::Active;
        self.answered_at = Some(Utc::now());
    }

    /// Close the session with a terminal phase and reason
    pub fn mark_ended(&mut self, phase: CallPhase, reason: EndReason) {
        self.phase = phase;
        self.end_reason = Some(reason);
        self.ended_at = Some(Utc::now());
    }

    /// Archive into a history record
    pub fn to_record(&self) -> CallRecord {
        let end_reason = self.end_reason.unwrap_or(EndReason::Unknown);
        CallRecord {
            call_id: self.call_id.clone(),
            direction: self.direction,
            number: self.caller_number.clone(),
            name: self.caller_name.clone(),
            status: CallStatus::from_end_reason(end_reason, self.duration),
            end_reason,
            decline_reason: self.decline_reason.clone(),
            started_at: self.started_at,
            answered_at: self.answered_at,
            ended_at: self.ended_at.unwrap_or_else(Utc::now),
            duration_secs: self.duration.as_secs(),
        }
    }
}

/// History entry handed to the call-history repository
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    pub call_id: String,
    pub direction: CallDirection,
    pub number: String,
    pub name: Option<String>,
    pub status: CallStatus,
    pub end_reason: EndReason,
    pub decline_reason: Option<String>,
    pub started_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
    pub ended_at: DateTime<Utc>,
    pub duration_secs: u64,
}

/// Snapshot published on every transition
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallSessionState {
    pub phase: CallPhase,
    /// Live session, or the archived one while Ended/Failed
    pub session: Option<CallSession>,
    /// Set once the call reached Ended/Failed
    pub record: Option<CallRecord>,
    /// Last surfaced error; the call may still be live
    pub error: Option<CallError>,
    /// Increases by one with every published snapshot
    pub sequence: u64,
}

impl CallSessionState {
    pub fn call_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.call_id.as_str())
    }

    /// Call duration so far, zero without a session
    pub fn duration(&self) -> Duration {
        self.session.as_ref().map_or(Duration::ZERO, |s| s.duration)
    }

    pub fn with_session(mut self, session: CallSession) -> Self {
        self.phase = session.phase;
        self.session = Some(session);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let zero = Duration::ZERO;
        let talked = Duration::from_secs(42);

        assert_eq!(CallStatus::from_end_reason(EndReason::Declined, talked), CallStatus::Declined);
        assert_eq!(CallStatus::from_end_reason(EndReason::NoAnswer, zero), CallStatus::Missed);
        assert_eq!(CallStatus::from_end_reason(EndReason::NetworkError, zero), CallStatus::Failed);
        assert_eq!(CallStatus::from_end_reason(EndReason::ConnectionFailed, talked), CallStatus::Completed);
        assert_eq!(CallStatus::from_end_reason(EndReason::UserHangUp, zero), CallStatus::Answered);
        assert_eq!(CallStatus::from_end_reason(EndReason::RemoteHangUp, talked), CallStatus::Completed);
        assert_eq!(CallStatus::from_end_reason(EndReason::Transferred, zero), CallStatus::Answered);
        assert_eq!(CallStatus::from_end_reason(EndReason::Unknown, talked), CallStatus::Completed);
    }

    #[test]
    fn test_optimistic_flag() {
        let flag = OptimisticFlag::default().request(true);
        assert!(flag.value());
        assert!(flag.is_pending());
        assert_eq!(flag.revert(), OptimisticFlag::Confirmed(false));

        // A second request while pending keeps the last confirmed value
        let again = flag.request(false);
        assert_eq!(again.revert(), OptimisticFlag::Confirmed(false));
    }

    #[test]
    fn test_phase_predicates() {
        assert!(CallPhase::Held.is_live());
        assert!(CallPhase::Held.is_connected());
        assert!(!CallPhase::Incoming.is_connected());
        assert!(CallPhase::Failed.is_terminal());
        assert!(!CallPhase::Idle.is_live());
        assert_eq!(CallPhase::Outgoing.to_string(), "outgoing");
    }

    #[test]
    fn test_session_starts_from_audio_route() {
        let session = CallSession::incoming("c1", "+15550100").with_audio_flags(true, false);
        assert_eq!(session.mute, OptimisticFlag::Confirmed(true));
        assert_eq!(session.speaker, OptimisticFlag::Confirmed(false));
        assert_eq!(session.hold, OptimisticFlag::Confirmed(false));
    }

    #[test]
    fn test_record_from_declined_session() {
        let mut session = CallSession::incoming("c1", "+15550100");
        session.decline_reason = Some("busy".to_string());
        session.mark_ended(CallPhase::Ended, EndReason::Declined);
        let record = session.to_record();

        assert_eq!(record.status, CallStatus::Declined);
        assert_eq!(record.duration_secs, 0);
        assert_eq!(record.decline_reason.as_deref(), Some("busy"));

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["status"], "Declined");
    }
}
