//! Core configuration
//!
//! [`CoreConfig`] bundles everything the call core can be tuned with. Defaults
//! reproduce the production behaviour (1 s duration tick, 2 s quality sampling,
//! 300-sample history, the three retry presets) so most embedders only touch a
//! field or two.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────┐
//! │        CoreConfig        │
//! │ ┌──────────────────────┐ │
//! │ │ CallConfig           │ │  • duration tick, collaborator deadlines
//! │ │ QualityConfig        │ │  • sampling cadence, history, alerts
//! │ │ RetryPresets        ─┼─┼─ • registration / connection / quick
//! │ │ LoggingConfig        │ │  • subscriber level and format
//! │ └──────────────────────┘ │
//! └──────────────────────────┘
//! ```
//!
//! # Usage Examples
//!
//! ```rust
//! use dialtone_core::config::{CoreConfig, QualityConfig};
//! use std::time::Duration;
//!
//! let config = CoreConfig::new()
//!     .with_tick_interval(Duration::from_millis(500))
//!     .with_quality(QualityConfig::default().with_history_capacity(60));
//!
//! assert_eq!(config.call.tick_interval(), Duration::from_millis(500));
//! assert_eq!(config.quality.history_capacity, 60);
//! assert!(config.validate().is_ok());
//! ```
//!
//! ## Loading from TOML
//!
//! ```rust
//! use dialtone_core::config::CoreConfig;
//!
//! let config = CoreConfig::from_toml_str(r#"
//!     [quality]
//!     sample_interval_ms = 1000
//!
//!     [retry.call_connection]
//!     max_attempts = 4
//!     initial_delay_ms = 500
//!     max_delay_ms = 4000
//!     backoff_multiplier = 2.0
//! "#).unwrap();
//!
//! assert_eq!(config.quality.sample_interval_ms, 1000);
//! assert_eq!(config.retry.call_connection.max_attempts(), 4);
//! // Untouched sections keep their defaults
//! assert_eq!(config.call.tick_interval_ms, 1000);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CallError, CallResult};
use crate::events::DEFAULT_EVENT_CAPACITY;
use crate::logging::LoggingConfig;
use crate::retry::RetryConfig;

/// Call state machine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Period of the call duration tick
    pub tick_interval_ms: u64,
    /// Capacity of the call state broadcast channel
    pub event_capacity: usize,
    /// Deadline for the transport hangup or decline that ends a call
    pub hangup_timeout_ms: u64,
    /// Deadline for each platform audio bridge call
    pub audio_timeout_ms: u64,
}

impl CallConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn hangup_timeout(&self) -> Duration {
        Duration::from_millis(self.hangup_timeout_ms)
    }

    pub fn audio_timeout(&self) -> Duration {
        Duration::from_millis(self.audio_timeout_ms)
    }
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            hangup_timeout_ms: 5000,
            audio_timeout_ms: 3000,
        }
    }
}

/// Connection quality monitor settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    /// Period between two `stats()` polls
    pub sample_interval_ms: u64,
    /// Ring buffer capacity; oldest samples are evicted first
    pub history_capacity: usize,
    /// Consecutive poor/bad samples that raise a degradation alert
    pub degraded_alert_threshold: u32,
    /// Samples required before an assessment is considered reliable
    pub min_samples_for_assessment: usize,
    pub event_capacity: usize,
}

impl QualityConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn with_sample_interval(mut self, interval: Duration) -> Self {
        self.sample_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    pub fn with_alert_threshold(mut self, samples: u32) -> Self {
        self.degraded_alert_threshold = samples;
        self
    }

    pub fn with_min_samples(mut self, samples: usize) -> Self {
        self.min_samples_for_assessment = samples;
        self
    }

    pub fn validate(&self) -> CallResult<()> {
        if self.sample_interval_ms == 0 {
            return Err(CallError::config("quality.sample_interval_ms", "must be positive"));
        }
        if self.history_capacity == 0 {
            return Err(CallError::config("quality.history_capacity", "must be positive"));
        }
        if self.degraded_alert_threshold == 0 {
            return Err(CallError::config("quality.degraded_alert_threshold", "must be at least 1"));
        }
        Ok(())
    }
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 2000,
            history_capacity: 300,
            degraded_alert_threshold: 3,
            min_samples_for_assessment: 5,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

/// Retry policies used by the state machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPresets {
    /// Used by `register()`
    pub registration: RetryConfig,
    /// Used by answer, outgoing call setup and reconnection
    pub call_connection: RetryConfig,
    /// Available to embedders for short-lived operations
    pub quick: RetryConfig,
}

impl Default for RetryPresets {
    fn default() -> Self {
        Self {
            registration: RetryConfig::sip_registration(),
            call_connection: RetryConfig::call_connection(),
            quick: RetryConfig::quick_retry(),
        }
    }
}

/// Complete configuration of the call core
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub call: CallConfig,
    pub quality: QualityConfig,
    pub retry: RetryPresets,
    pub logging: LoggingConfig,
}

impl CoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a TOML document; missing sections and fields keep their defaults
    pub fn from_toml_str(input: &str) -> CallResult<Self> {
        let config: CoreConfig =
            toml::from_str(input).map_err(|e| CallError::config("toml", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> CallResult<String> {
        toml::to_string(self).map_err(|e| CallError::config("toml", e.to_string()))
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.call.tick_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_hangup_timeout(mut self, timeout: Duration) -> Self {
        self.call.hangup_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_audio_timeout(mut self, timeout: Duration) -> Self {
        self.call.audio_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_logging(mut self, logging: LoggingConfig) -> Self {
        self.logging = logging;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.call.event_capacity = capacity;
        self
    }

    pub fn with_quality(mut self, quality: QualityConfig) -> Self {
        self.quality = quality;
        self
    }

    pub fn with_registration_retry(mut self, config: RetryConfig) -> Self {
        self.retry.registration = config;
        self
    }

    pub fn with_call_connection_retry(mut self, config: RetryConfig) -> Self {
        self.retry.call_connection = config;
        self
    }

    pub fn validate(&self) -> CallResult<()> {
        if self.call.tick_interval_ms == 0 {
            return Err(CallError::config("call.tick_interval_ms", "must be positive"));
        }
        if self.call.hangup_timeout_ms == 0 {
            return Err(CallError::config("call.hangup_timeout_ms", "must be positive"));
        }
        if self.call.audio_timeout_ms == 0 {
            return Err(CallError::config("call.audio_timeout_ms", "must be positive"));
        }
        self.logging.validate()?;
        self.quality.validate()?;
        self.retry.registration.validate()?;
        self.retry.call_connection.validate()?;
        self.retry.quick.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CoreConfig::default();
        assert_eq!(config.call.tick_interval(), Duration::from_secs(1));
        assert_eq!(config.quality.sample_interval(), Duration::from_secs(2));
        assert_eq!(config.quality.history_capacity, 300);
        assert_eq!(config.quality.degraded_alert_threshold, 3);
        assert_eq!(config.quality.min_samples_for_assessment, 5);
        assert_eq!(config.retry.registration, RetryConfig::sip_registration());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_round_trip_keeps_presets() {
        let config = CoreConfig::new().with_tick_interval(Duration::from_millis(250));
        let text = config.to_toml_string().unwrap();
        let parsed = CoreConfig::from_toml_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = CoreConfig::from_toml_str("[quality]\nhistory_capacity = 0\n").unwrap_err();
        assert!(matches!(err, CallError::InvalidConfiguration { ref field, .. } if field == "quality.history_capacity"));

        let bad_retry = r#"
            [retry.quick]
            max_attempts = 0
            initial_delay_ms = 100
            max_delay_ms = 200
            backoff_multiplier = 1.5
        "#;
        assert!(CoreConfig::from_toml_str(bad_retry).is_err());

        let err = CoreConfig::from_toml_str("[logging]\nlevel = \"chatty\"\n").unwrap_err();
        assert!(matches!(err, CallError::InvalidConfiguration { ref field, .. } if field == "logging.level"));
    }

    #[test]
    fn test_logging_section() {
        let config = CoreConfig::from_toml_str(
            "[call]\naudio_timeout_ms = 750\n\n[logging]\nlevel = \"debug\"\nformat = \"pretty\"\n",
        )
        .unwrap();
        assert_eq!(config.logging.format, crate::logging::LogFormat::Pretty);
        assert_eq!(config.logging.level().unwrap(), tracing::Level::DEBUG);
        assert_eq!(config.call.audio_timeout(), Duration::from_millis(750));
        assert_eq!(config.call.hangup_timeout(), Duration::from_secs(5));
    }
}
