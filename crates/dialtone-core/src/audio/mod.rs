//! Audio routing for the live call
//!
//! [`AudioRouteController`] is the only component that talks to the
//! [`AudioPlatformBridge`]. The call state machine forwards mute, loudspeaker
//! and mode changes to it and never touches the bridge directly.

mod bridge;
mod route;

pub use bridge::{AudioMode, AudioOutput, AudioPlatformBridge, NoopAudioBridge};
pub use route::{AudioRouteController, AudioRouteState, DEFAULT_AUDIO_COMMAND_TIMEOUT};
