//! Call lifecycle
//!
//! - [`types`] holds the data model: phases, end reasons, the live
//!   [`CallSession`] and the archived [`CallRecord`]
//! - [`CallSessionStateMachine`] drives one call through its phases
//! - [`CallSessionBuilder`] wires the machine to its collaborators

mod builder;
mod machine;
pub mod types;

pub use builder::CallSessionBuilder;
pub use machine::{is_dtmf_digit, CallSessionStateMachine};
pub use types::{
    CallDirection, CallPhase, CallRecord, CallSession, CallSessionState, CallStatus, EndReason,
    OptimisticFlag,
};
