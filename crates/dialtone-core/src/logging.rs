//! Tracing subscriber installation
//!
//! The core only emits `tracing` events with structured fields (`call_id`,
//! `operation`, `error`). Hosts without a logging stack of their own can
//! install a subscriber driven by the `[logging]` section of
//! [`CoreConfig`](crate::config::CoreConfig):
//!
//! ```toml
//! [logging]
//! level = "debug"
//! format = "json"
//! directives = ["tokio=warn"]
//! ```
//!
//! `RUST_LOG`, when set, replaces the configured filter entirely.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::error::{CallError, CallResult};

/// Target name of every event emitted by this crate
pub const LOG_TARGET: &str = "dialtone_core";

/// Output format of the installed subscriber
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Single-line human-readable output
    #[default]
    Compact,
    /// Multi-line output for local debugging
    Pretty,
    /// One JSON object per event, for log shippers
    Json,
}

/// Subscriber settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Level for the call core's own events
    pub level: String,
    pub format: LogFormat,
    /// Include file and line of each event
    pub include_location: bool,
    /// Extra `EnvFilter` directives, e.g. `"tokio=warn"`
    pub directives: Vec<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
            include_location: false,
            directives: Vec::new(),
        }
    }
}

impl LoggingConfig {
    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level.to_string().to_lowercase();
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_directive(mut self, directive: impl Into<String>) -> Self {
        self.directives.push(directive.into());
        self
    }

    /// Configured level of the core's events
    pub fn level(&self) -> CallResult<Level> {
        Level::from_str(&self.level)
            .map_err(|_| CallError::config("logging.level", format!("invalid log level: {}", self.level)))
    }

    /// Filter built from the configuration, ignoring `RUST_LOG`
    ///
    /// Other crates stay at `warn` unless a directive says otherwise.
    pub fn env_filter(&self) -> CallResult<EnvFilter> {
        let level = self.level()?;
        let mut filter = EnvFilter::default()
            .add_directive(LevelFilter::WARN.into())
            .add_directive(directive(&format!("{}={}", LOG_TARGET, LevelFilter::from_level(level)))?);
        for extra in &self.directives {
            filter = filter.add_directive(directive(extra)?);
        }
        Ok(filter)
    }

    pub fn validate(&self) -> CallResult<()> {
        self.env_filter().map(|_| ())
    }
}

fn directive(text: &str) -> CallResult<tracing_subscriber::filter::Directive> {
    text.parse()
        .map_err(|e| CallError::config("logging.directives", format!("{}: {}", text, e)))
}

/// Install the global subscriber described by `config`
///
/// Only one global subscriber can exist per process; a second call returns
/// an `InvalidConfiguration` error and leaves the first one in place.
pub fn setup_logging(config: &LoggingConfig) -> CallResult<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(from_env) => from_env,
        Err(_) => config.env_filter()?,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_file(config.include_location)
        .with_line_number(config.include_location);

    let installed = match config.format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.map_err(|e| CallError::config("logging", format!("subscriber already installed: {}", e)))?;

    tracing::info!(
        version = crate::VERSION,
        level = %config.level,
        format = ?config.format,
        "Call core logging initialized"
    );
    Ok(())
}
