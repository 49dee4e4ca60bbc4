//! Audio Route Controller
//!
//! Owns the [`AudioRouteState`] and drives the platform bridge. Commands are
//! serialized; each one marks the state as changing while the bridge call is
//! outstanding and publishes a snapshot before and after it.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::bridge::{AudioMode, AudioOutput, AudioPlatformBridge};
use crate::error::{CallError, CallResult};
use crate::events::{EventEmitter, EventStream, DEFAULT_EVENT_CAPACITY};
use crate::retry::with_timeout;

/// Deadline for a single platform bridge call
pub const DEFAULT_AUDIO_COMMAND_TIMEOUT: Duration = Duration::from_secs(3);

/// Snapshot of the audio route
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioRouteState {
    pub is_muted: bool,
    pub is_speaker_on: bool,
    pub current_output: AudioOutput,
    pub available_outputs: BTreeSet<AudioOutput>,
    pub is_bluetooth_connected: bool,
    pub mode: AudioMode,
    /// A bridge command is outstanding
    pub is_changing_audio: bool,
    /// Last bridge failure; cleared by the next successful command
    pub error_message: Option<String>,
}

impl AudioRouteState {
    /// Output used when audio leaves the loudspeaker or a device disappears
    pub fn private_output(&self) -> AudioOutput {
        if self.available_outputs.contains(&AudioOutput::WiredHeadset) {
            AudioOutput::WiredHeadset
        } else {
            AudioOutput::Earpiece
        }
    }
}

impl Default for AudioRouteState {
    fn default() -> Self {
        Self {
            is_muted: false,
            is_speaker_on: false,
            current_output: AudioOutput::Earpiece,
            available_outputs: [AudioOutput::Earpiece, AudioOutput::Speaker].into_iter().collect(),
            is_bluetooth_connected: false,
            mode: AudioMode::Normal,
            is_changing_audio: false,
            error_message: None,
        }
    }
}

/// Mute, loudspeaker and output-device control for the live call
pub struct AudioRouteController {
    bridge: Arc<dyn AudioPlatformBridge>,
    state: Mutex<AudioRouteState>,
    commands: tokio::sync::Mutex<()>,
    events: EventEmitter<AudioRouteState>,
    command_timeout: Duration,
}

impl AudioRouteController {
    pub fn new(bridge: Arc<dyn AudioPlatformBridge>) -> Self {
        Self {
            bridge,
            state: Mutex::new(AudioRouteState::default()),
            commands: tokio::sync::Mutex::new(()),
            events: EventEmitter::new(DEFAULT_EVENT_CAPACITY),
            command_timeout: DEFAULT_AUDIO_COMMAND_TIMEOUT,
        }
    }

    /// Bound every bridge call; a bridge that does not answer in time fails
    /// the command with `OperationTimeout`
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn state(&self) -> AudioRouteState {
        self.state.lock().clone()
    }

    pub fn subscribe(&self) -> EventStream<AudioRouteState> {
        self.events.subscribe()
    }

    /// Flip the microphone mute; returns the new mute state
    pub async fn toggle_mute(&self) -> CallResult<bool> {
        let _command = self.commands.lock().await;
        let target = !self.state.lock().is_muted;
        self.begin("mute");

        let result = self.bridge_call("mute", self.bridge.set_mute(target)).await;
        self.complete("mute", &result, |state| state.is_muted = target);
        result.map(|_| target)
    }

    /// Switch between the loudspeaker and the private output
    ///
    /// Returns whether the loudspeaker is now on.
    pub async fn toggle_speaker(&self) -> CallResult<bool> {
        let _command = self.commands.lock().await;
        let (target, output) = {
            let state = self.state.lock();
            if state.is_speaker_on {
                (false, state.private_output())
            } else {
                (true, AudioOutput::Speaker)
            }
        };
        self.begin("speaker");

        let result = self.bridge_call("speaker", self.bridge.set_speaker(target)).await;
        self.complete("speaker", &result, |state| {
            state.is_speaker_on = target;
            state.current_output = output;
        });
        result.map(|_| target)
    }

    /// Route audio to a specific available output
    pub async fn set_output(&self, output: AudioOutput) -> CallResult<()> {
        let _command = self.commands.lock().await;
        if !self.state.lock().available_outputs.contains(&output) {
            let error = CallError::platform_audio(format!("output {} is not available", output));
            self.update(|state| state.error_message = Some(error.to_string()));
            return Err(error);
        }
        self.begin("output");

        let result = self.bridge_call("output", self.bridge.set_output(output)).await;
        self.complete("output", &result, |state| {
            state.current_output = output;
            state.is_speaker_on = output == AudioOutput::Speaker;
        });
        result
    }

    pub async fn set_audio_mode(&self, mode: AudioMode) -> CallResult<()> {
        let _command = self.commands.lock().await;
        self.begin("mode");

        let result = self.bridge_call("mode", self.bridge.set_audio_mode(mode)).await;
        self.complete("mode", &result, |state| state.mode = mode);
        result
    }

    /// Unmute, leave the loudspeaker and return to the normal audio mode
    ///
    /// Every step is attempted; the first failure is returned. A Bluetooth or
    /// wired output selected during the call stays selected for the next one.
    /// A clean reset clears any error left by earlier commands.
    pub async fn reset_for_call_end(&self) -> CallResult<()> {
        let _command = self.commands.lock().await;
        let snapshot = self.state();
        let mut first_error = None;

        if snapshot.is_muted {
            self.begin("reset_mute");
            let result = self.bridge_call("reset_mute", self.bridge.set_mute(false)).await;
            self.complete("reset_mute", &result, |state| state.is_muted = false);
            first_error = first_error.or(result.err());
        }

        if snapshot.is_speaker_on {
            let output = snapshot.private_output();
            self.begin("reset_speaker");
            let result = self.bridge_call("reset_speaker", self.bridge.set_speaker(false)).await;
            self.complete("reset_speaker", &result, |state| {
                state.is_speaker_on = false;
                state.current_output = output;
            });
            first_error = first_error.or(result.err());
        }

        if snapshot.mode != AudioMode::Normal {
            self.begin("reset_mode");
            let result = self.bridge_call("reset_mode", self.bridge.set_audio_mode(AudioMode::Normal)).await;
            self.complete("reset_mode", &result, |state| state.mode = AudioMode::Normal);
            first_error = first_error.or(result.err());
        }

        match first_error {
            Some(error) => Err(error),
            None => {
                if snapshot.error_message.is_some() {
                    self.update(|state| state.error_message = None);
                }
                Ok(())
            }
        }
    }

    /// Apply a device hot-plug change
    ///
    /// If the current output disappeared the route falls back to the wired
    /// headset when present, else the earpiece.
    pub async fn update_available_outputs(&self, bluetooth: bool, wired_headset: bool) -> CallResult<()> {
        let _command = self.commands.lock().await;
        let fallback = {
            let mut state = self.state.lock();
            let mut outputs: BTreeSet<AudioOutput> =
                [AudioOutput::Earpiece, AudioOutput::Speaker].into_iter().collect();
            if bluetooth {
                outputs.insert(AudioOutput::Bluetooth);
            }
            if wired_headset {
                outputs.insert(AudioOutput::WiredHeadset);
            }
            state.available_outputs = outputs;
            state.is_bluetooth_connected = bluetooth;

            (!state.available_outputs.contains(&state.current_output)).then(|| state.private_output())
        };
        info!(bluetooth = bluetooth, wired_headset = wired_headset, "Audio outputs changed");

        let Some(output) = fallback else {
            self.events.emit(self.state());
            return Ok(());
        };

        debug!(output = %output, "Current output disappeared, falling back");
        self.begin("fallback");
        let result = self.bridge_call("fallback", self.bridge.set_output(output)).await;
        self.complete("fallback", &result, |state| {
            state.current_output = output;
            state.is_speaker_on = false;
        });
        result
    }

    async fn bridge_call<F>(&self, command: &str, call: F) -> CallResult<()>
    where
        F: Future<Output = CallResult<()>>,
    {
        with_timeout(command, self.command_timeout, call).await
    }

    fn update(&self, apply: impl FnOnce(&mut AudioRouteState)) {
        let snapshot = {
            let mut state = self.state.lock();
            apply(&mut state);
            state.clone()
        };
        self.events.emit(snapshot);
    }

    fn begin(&self, command: &str) {
        debug!(command = command, "Audio command started");
        self.update(|state| state.is_changing_audio = true);
    }

    fn complete(&self, command: &str, result: &CallResult<()>, apply: impl FnOnce(&mut AudioRouteState)) {
        match result {
            Ok(()) => self.update(|state| {
                apply(state);
                state.is_changing_audio = false;
                state.error_message = None;
            }),
            Err(e) => {
                warn!(command = command, error = %e, "Audio command failed");
                self.update(|state| {
                    state.is_changing_audio = false;
                    state.error_message = Some(e.to_string());
                });
            }
        }
    }
}
