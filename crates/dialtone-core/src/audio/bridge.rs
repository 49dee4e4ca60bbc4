//! Platform audio bridge

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CallResult;

/// Audio output device
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AudioOutput {
    Earpiece,
    Speaker,
    Bluetooth,
    WiredHeadset,
}

impl fmt::Display for AudioOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AudioOutput::Earpiece => "earpiece",
            AudioOutput::Speaker => "speaker",
            AudioOutput::Bluetooth => "bluetooth",
            AudioOutput::WiredHeadset => "wired_headset",
        };
        f.write_str(label)
    }
}

/// Platform audio session mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AudioMode {
    #[default]
    Normal,
    /// Incoming call alert
    Ringtone,
    /// Two-way voice
    InCommunication,
}

impl fmt::Display for AudioMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AudioMode::Normal => "normal",
            AudioMode::Ringtone => "ringtone",
            AudioMode::InCommunication => "in_communication",
        };
        f.write_str(label)
    }
}

/// Native audio stack as seen by the core
#[async_trait]
pub trait AudioPlatformBridge: Send + Sync {
    async fn set_audio_mode(&self, mode: AudioMode) -> CallResult<()>;

    async fn set_speaker(&self, enabled: bool) -> CallResult<()>;

    async fn set_mute(&self, muted: bool) -> CallResult<()>;

    /// Route audio to `output`
    ///
    /// Platforms without explicit device routing only distinguish the
    /// loudspeaker from everything else.
    async fn set_output(&self, output: AudioOutput) -> CallResult<()> {
        self.set_speaker(output == AudioOutput::Speaker).await
    }
}

/// Bridge that accepts every command; for headless embedders
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAudioBridge;

#[async_trait]
impl AudioPlatformBridge for NoopAudioBridge {
    async fn set_audio_mode(&self, _mode: AudioMode) -> CallResult<()> {
        Ok(())
    }

    async fn set_speaker(&self, _enabled: bool) -> CallResult<()> {
        Ok(())
    }

    async fn set_mute(&self, _muted: bool) -> CallResult<()> {
        Ok(())
    }
}
