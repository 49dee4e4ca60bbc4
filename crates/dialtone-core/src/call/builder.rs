//! Builder for [`CallSessionStateMachine`]
//!
//! Collaborators are injected here; nothing is looked up globally. Only the
//! telephony transport is mandatory. History defaults to a sink that drops
//! records and audio defaults to a bridge that accepts every command.
//!
//! ```rust,no_run
//! use dialtone_core::{CallSessionBuilder, CoreConfig, TelephonySession};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # fn example(transport: Arc<dyn TelephonySession>) -> dialtone_core::CallResult<()> {
//! let machine = CallSessionBuilder::new()
//!     .with_config(CoreConfig::new().with_hangup_timeout(Duration::from_secs(2)))
//!     .with_transport(transport)
//!     .build()?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use super::machine::CallSessionStateMachine;
use crate::audio::{AudioPlatformBridge, NoopAudioBridge};
use crate::config::CoreConfig;
use crate::error::{CallError, CallResult};
use crate::transport::{CallHistoryRepository, NoopCallHistory, TelephonySession};

pub struct CallSessionBuilder {
    config: CoreConfig,
    transport: Option<Arc<dyn TelephonySession>>,
    history: Arc<dyn CallHistoryRepository>,
    audio_bridge: Arc<dyn AudioPlatformBridge>,
}

impl CallSessionBuilder {
    pub fn new() -> Self {
        Self {
            config: CoreConfig::default(),
            transport: None,
            history: Arc::new(NoopCallHistory),
            audio_bridge: Arc::new(NoopAudioBridge),
        }
    }

    pub fn with_config(mut self, config: CoreConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn TelephonySession>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_history(mut self, history: Arc<dyn CallHistoryRepository>) -> Self {
        self.history = history;
        self
    }

    pub fn with_audio_bridge(mut self, bridge: Arc<dyn AudioPlatformBridge>) -> Self {
        self.audio_bridge = bridge;
        self
    }

    /// Validate the configuration and assemble the machine
    pub fn build(self) -> CallResult<CallSessionStateMachine> {
        let transport = self
            .transport
            .ok_or_else(|| CallError::config("transport", "a telephony session is required"))?;
        CallSessionStateMachine::new(self.config, transport, self.history, self.audio_bridge)
    }
}

impl Default for CallSessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}
