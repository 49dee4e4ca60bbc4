//! Retry policy value object and named presets

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{CallError, CallResult};

/// Upper bound accepted for `max_delay`
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Configuration for retry behavior
///
/// An immutable, validated value. Construct it with [`RetryConfig::new`] or
/// one of the presets, then refine with the `with_*` builders, each of which
/// re-validates.
///
/// # Examples
///
/// ```rust
/// use dialtone_core::retry::RetryConfig;
/// use std::time::Duration;
///
/// let config = RetryConfig::call_connection();
/// assert_eq!(config.max_attempts(), 3);
/// assert_eq!(config.initial_delay(), Duration::from_secs(1));
///
/// // Delay before attempt 3 is 1s * 1.5^1
/// assert_eq!(config.delay_for_attempt(2), Duration::from_millis(1500));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RetryConfigRepr", into = "RetryConfigRepr")]
pub struct RetryConfig {
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
    backoff_multiplier: f64,
    use_jitter: bool,
    jitter_factor: f64,
}

impl RetryConfig {
    /// Create a validated configuration without jitter
    pub fn new(
        max_attempts: u32,
        initial_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
    ) -> CallResult<Self> {
        Self {
            max_attempts,
            initial_delay,
            max_delay,
            backoff_multiplier,
            use_jitter: false,
            jitter_factor: 0.0,
        }
        .validated()
    }

    /// SIP registration: 5 attempts, 2s initial, 60s cap, x2.0, 25% jitter
    pub fn sip_registration() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            use_jitter: true,
            jitter_factor: 0.25,
        }
    }

    /// Call setup and reconnection: 3 attempts, 1s initial, 10s cap, x1.5, 15% jitter
    pub fn call_connection() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 1.5,
            use_jitter: true,
            jitter_factor: 0.15,
        }
    }

    /// Quick retries: 3 attempts, 500ms initial, 3s cap, x1.5, jitter disabled
    ///
    /// The factor is set but `use_jitter` is off, and `use_jitter` wins.
    pub fn quick_retry() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(3),
            backoff_multiplier: 1.5,
            use_jitter: false,
            jitter_factor: 0.1,
        }
    }

    /// Replace the attempt budget
    pub fn with_max_attempts(mut self, max_attempts: u32) -> CallResult<Self> {
        self.max_attempts = max_attempts;
        self.validated()
    }

    /// Replace the delay bounds
    pub fn with_delays(mut self, initial_delay: Duration, max_delay: Duration) -> CallResult<Self> {
        self.initial_delay = initial_delay;
        self.max_delay = max_delay;
        self.validated()
    }

    /// Replace the backoff multiplier
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> CallResult<Self> {
        self.backoff_multiplier = multiplier;
        self.validated()
    }

    /// Enable jitter with the given factor
    pub fn with_jitter(mut self, factor: f64) -> CallResult<Self> {
        self.use_jitter = true;
        self.jitter_factor = factor;
        self.validated()
    }

    /// Disable jitter, keeping the stored factor
    pub fn without_jitter(mut self) -> Self {
        self.use_jitter = false;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn backoff_multiplier(&self) -> f64 {
        self.backoff_multiplier
    }

    pub fn use_jitter(&self) -> bool {
        self.use_jitter
    }

    pub fn jitter_factor(&self) -> f64 {
        self.jitter_factor
    }

    /// Check every invariant of the value
    pub fn validate(&self) -> CallResult<()> {
        if self.max_attempts == 0 {
            return Err(CallError::config("max_attempts", "must be at least 1"));
        }
        if self.initial_delay.is_zero() {
            return Err(CallError::config("initial_delay", "must be positive"));
        }
        if self.max_delay.is_zero() {
            return Err(CallError::config("max_delay", "must be positive"));
        }
        if self.max_delay > MAX_RETRY_DELAY {
            return Err(CallError::config("max_delay", "must not exceed 24 hours"));
        }
        if self.max_delay < self.initial_delay {
            return Err(CallError::config("max_delay", "must not be shorter than initial_delay"));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(CallError::config("backoff_multiplier", "must be a finite value >= 1.0"));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(CallError::config("jitter_factor", "must be within [0, 1]"));
        }
        Ok(())
    }

    fn validated(self) -> CallResult<Self> {
        self.validate()?;
        Ok(self)
    }

    /// Backoff delay after failed attempt `attempt` (1-indexed), before jitter
    ///
    /// `min(max_delay, initial_delay * backoff_multiplier^(attempt - 1))`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let scaled = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = scaled.min(self.max_delay.as_secs_f64());
        Duration::try_from_secs_f64(capped).unwrap_or(self.max_delay)
    }

    /// Backoff delay with jitter applied when enabled
    pub fn jittered_delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.delay_for_attempt(attempt);
        if !self.use_jitter || self.jitter_factor == 0.0 {
            return base;
        }
        let offset = rng.gen_range(-self.jitter_factor..=self.jitter_factor);
        Duration::try_from_secs_f64(base.as_secs_f64() * (1.0 + offset).max(0.0)).unwrap_or(base)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::call_connection()
    }
}

/// Serialized form with millisecond durations
#[doc(hidden)]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfigRepr {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    #[serde(default)]
    pub use_jitter: bool,
    #[serde(default)]
    pub jitter_factor: f64,
}

impl TryFrom<RetryConfigRepr> for RetryConfig {
    type Error = CallError;

    fn try_from(repr: RetryConfigRepr) -> CallResult<Self> {
        Self {
            max_attempts: repr.max_attempts,
            initial_delay: Duration::from_millis(repr.initial_delay_ms),
            max_delay: Duration::from_millis(repr.max_delay_ms),
            backoff_multiplier: repr.backoff_multiplier,
            use_jitter: repr.use_jitter,
            jitter_factor: repr.jitter_factor,
        }
        .validated()
    }
}

impl From<RetryConfig> for RetryConfigRepr {
    fn from(config: RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_delay_ms: config.initial_delay.as_millis() as u64,
            max_delay_ms: config.max_delay.as_millis() as u64,
            backoff_multiplier: config.backoff_multiplier,
            use_jitter: config.use_jitter,
            jitter_factor: config.jitter_factor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::mock::StepRng;

    #[test]
    fn test_presets() {
        let sip = RetryConfig::sip_registration();
        assert_eq!(sip.max_attempts(), 5);
        assert_eq!(sip.initial_delay(), Duration::from_secs(2));
        assert_eq!(sip.max_delay(), Duration::from_secs(60));
        assert_eq!(sip.backoff_multiplier(), 2.0);
        assert!(sip.use_jitter());
        assert_eq!(sip.jitter_factor(), 0.25);

        let call = RetryConfig::call_connection();
        assert_eq!(call.max_attempts(), 3);
        assert_eq!(call.initial_delay(), Duration::from_secs(1));
        assert_eq!(call.max_delay(), Duration::from_secs(10));
        assert_eq!(call.backoff_multiplier(), 1.5);
        assert_eq!(call.jitter_factor(), 0.15);

        let quick = RetryConfig::quick_retry();
        assert_eq!(quick.max_attempts(), 3);
        assert_eq!(quick.initial_delay(), Duration::from_millis(500));
        assert_eq!(quick.max_delay(), Duration::from_secs(3));
        assert!(!quick.use_jitter());

        for preset in [sip, call, quick] {
            assert!(preset.validate().is_ok());
        }
    }

    #[test]
    fn test_disabled_jitter_wins_over_factor() {
        let quick = RetryConfig::quick_retry();
        assert!(quick.jitter_factor() > 0.0);

        let mut rng = StepRng::new(u64::MAX / 3, 7);
        for attempt in 1..=5 {
            assert_eq!(quick.jittered_delay(attempt, &mut rng), quick.delay_for_attempt(attempt));
        }
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let config = RetryConfig::sip_registration();
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let delay = config.jittered_delay(1, &mut rng).as_secs_f64();
            assert!((1.5..=2.5).contains(&delay), "delay {} out of band", delay);
        }
    }

    #[test]
    fn test_delay_is_capped() {
        let config = RetryConfig::sip_registration();
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(32));
        assert_eq!(config.delay_for_attempt(6), Duration::from_secs(60));
        assert_eq!(config.delay_for_attempt(60), Duration::from_secs(60));
    }

    #[test]
    fn test_invalid_configs_rejected() {
        let ms = Duration::from_millis;
        assert!(RetryConfig::new(0, ms(10), ms(100), 2.0).is_err());
        assert!(RetryConfig::new(3, ms(0), ms(100), 2.0).is_err());
        assert!(RetryConfig::new(3, ms(200), ms(100), 2.0).is_err());
        assert!(RetryConfig::new(3, ms(10), ms(100), 0.5).is_err());
        assert!(RetryConfig::call_connection().with_jitter(1.5).is_err());
        assert!(RetryConfig::new(3, ms(10), ms(100), 1.0).is_ok());
    }

    #[test]
    fn test_max_delay_bounded() {
        let ms = Duration::from_millis;
        assert!(RetryConfig::new(3, ms(10), Duration::MAX, 2.0).is_err());
        assert!(RetryConfig::new(3, ms(10), MAX_RETRY_DELAY + ms(1), 2.0).is_err());

        let config = RetryConfig::new(u32::MAX, ms(10), MAX_RETRY_DELAY, 4.0)
            .unwrap()
            .with_jitter(1.0)
            .unwrap();
        assert_eq!(config.delay_for_attempt(u32::MAX), MAX_RETRY_DELAY);

        let mut rng = StepRng::new(u64::MAX, 0);
        let jittered = config.jittered_delay(u32::MAX, &mut rng);
        assert!(jittered <= MAX_RETRY_DELAY * 2);
    }

    #[test]
    fn test_serde_validates() {
        let json = r#"{"max_attempts":4,"initial_delay_ms":250,"max_delay_ms":2000,"backoff_multiplier":2.0}"#;
        let config: RetryConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.max_attempts(), 4);
        assert_eq!(config.initial_delay(), Duration::from_millis(250));
        assert!(!config.use_jitter());

        let bad = r#"{"max_attempts":4,"initial_delay_ms":250,"max_delay_ms":100,"backoff_multiplier":2.0}"#;
        assert!(serde_json::from_str::<RetryConfig>(bad).is_err());
    }

    proptest! {
        #[test]
        fn prop_delay_matches_formula(
            max_attempts in 1u32..20,
            initial_ms in 1u64..5_000,
            extra_ms in 0u64..120_000,
            multiplier in 1.0f64..4.0,
            attempt in 1u32..20,
        ) {
            let initial = Duration::from_millis(initial_ms);
            let max = Duration::from_millis(initial_ms + extra_ms);
            let config = RetryConfig::new(max_attempts, initial, max, multiplier).unwrap();

            let expected = (initial.as_secs_f64() * multiplier.powi(attempt as i32 - 1))
                .min(max.as_secs_f64());
            let actual = config.delay_for_attempt(attempt).as_secs_f64();

            prop_assert!((actual - expected).abs() < 1e-6);
        }
    }
}
