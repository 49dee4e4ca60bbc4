//! Connection quality monitoring
//!
//! While a call is live the [`ConnectionQualityMonitor`] polls the transport's
//! statistics, scores each observation with [`quality_score`] and keeps a
//! bounded history. Scores feed the call snapshot; sustained degradation is
//! signalled on a dedicated alert stream.

mod monitor;
mod score;

pub use monitor::{ConnectionQualityMonitor, DegradedQualityAlert, QualityAssessment};
pub use score::{quality_score, ConnectionQualitySample, QualityLevel};
