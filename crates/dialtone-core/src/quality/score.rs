//! Quality scoring of raw transport statistics

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::transport::TransportStats;

/// Quality bucket derived from a 0-100 score
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum QualityLevel {
    Bad,
    Poor,
    Fair,
    Good,
    Excellent,
}

impl QualityLevel {
    /// Level thresholds: >=80 excellent, >=60 good, >=40 fair, >=20 poor, else bad
    pub fn from_score(score: f64) -> Self {
        if score >= 80.0 {
            QualityLevel::Excellent
        } else if score >= 60.0 {
            QualityLevel::Good
        } else if score >= 40.0 {
            QualityLevel::Fair
        } else if score >= 20.0 {
            QualityLevel::Poor
        } else {
            QualityLevel::Bad
        }
    }

    /// Poor and bad samples count towards the degradation alert
    pub fn is_degraded(&self) -> bool {
        matches!(self, QualityLevel::Poor | QualityLevel::Bad)
    }
}

impl fmt::Display for QualityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            QualityLevel::Excellent => "excellent",
            QualityLevel::Good => "good",
            QualityLevel::Fair => "fair",
            QualityLevel::Poor => "poor",
            QualityLevel::Bad => "bad",
        };
        f.write_str(label)
    }
}

/// Score transport statistics on a 0-100 scale
///
/// Starts from 100 and subtracts penalties for packet loss, round-trip time
/// and jitter; missing metrics carry no penalty.
///
/// ```rust
/// use dialtone_core::quality::{quality_score, QualityLevel};
/// use dialtone_core::transport::TransportStats;
///
/// let stats = TransportStats {
///     round_trip_time_ms: Some(200.0),
///     jitter_ms: Some(40.0),
///     packet_loss_percent: Some(2.0),
///     ..Default::default()
/// };
/// // 100 - 5 (loss) - 7.5 (rtt) - 5 (jitter)
/// assert_eq!(quality_score(&stats), 82.5);
/// assert_eq!(QualityLevel::from_score(82.5), QualityLevel::Excellent);
/// ```
pub fn quality_score(stats: &TransportStats) -> f64 {
    let mut score = 100.0;

    if let Some(loss) = stats.packet_loss_percent {
        score -= loss * 2.5;
    }

    if let Some(rtt) = stats.round_trip_time_ms {
        if rtt > 300.0 {
            score -= 30.0;
        } else if rtt > 150.0 {
            score -= (rtt - 150.0) * 0.15;
        }
    }

    if let Some(jitter) = stats.jitter_ms {
        if jitter > 50.0 {
            score -= 15.0;
        } else if jitter > 30.0 {
            score -= (jitter - 30.0) * 0.5;
        }
    }

    score.clamp(0.0, 100.0)
}

/// One scored observation of the connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionQualitySample {
    pub timestamp: DateTime<Utc>,
    pub round_trip_time_ms: Option<f64>,
    pub jitter_ms: Option<f64>,
    pub packet_loss_percent: Option<f64>,
    pub audio_bitrate_kbps: Option<f64>,
    pub local_candidate_type: Option<String>,
    pub remote_candidate_type: Option<String>,
    pub quality_score: f64,
    pub quality_level: QualityLevel,
}

impl ConnectionQualitySample {
    /// Score `stats` and stamp it with `timestamp`
    pub fn from_stats(stats: TransportStats, timestamp: DateTime<Utc>) -> Self {
        let quality_score = quality_score(&stats);
        Self {
            timestamp,
            round_trip_time_ms: stats.round_trip_time_ms,
            jitter_ms: stats.jitter_ms,
            packet_loss_percent: stats.packet_loss_percent,
            audio_bitrate_kbps: stats.audio_bitrate_kbps,
            local_candidate_type: stats.local_candidate_type,
            remote_candidate_type: stats.remote_candidate_type,
            quality_score,
            quality_level: QualityLevel::from_score(quality_score),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(rtt: f64, jitter: f64, loss: f64) -> TransportStats {
        TransportStats {
            round_trip_time_ms: Some(rtt),
            jitter_ms: Some(jitter),
            packet_loss_percent: Some(loss),
            ..Default::default()
        }
    }

    #[test]
    fn test_good_network_is_excellent() {
        let score = quality_score(&stats(50.0, 5.0, 0.1));
        assert!((score - 99.75).abs() < 1e-9);
        assert_eq!(QualityLevel::from_score(score), QualityLevel::Excellent);
    }

    #[test]
    fn test_terrible_network_is_degraded() {
        // 100 - 25 (loss) - 30 (rtt) - 15 (jitter)
        let score = quality_score(&stats(500.0, 100.0, 10.0));
        assert_eq!(score, 30.0);
        let level = QualityLevel::from_score(score);
        assert!(level.is_degraded());
        assert_eq!(level, QualityLevel::Poor);
    }

    #[test]
    fn test_score_clamped() {
        assert_eq!(quality_score(&stats(900.0, 90.0, 80.0)), 0.0);
        assert_eq!(quality_score(&TransportStats::default()), 100.0);
    }

    #[test]
    fn test_linear_bands() {
        // rtt exactly on the band edges carries no extra step
        assert_eq!(quality_score(&stats(150.0, 30.0, 0.0)), 100.0);
        assert_eq!(quality_score(&stats(300.0, 50.0, 0.0)), 100.0 - 22.5 - 10.0);
    }

    #[test]
    fn test_level_thresholds() {
        assert_eq!(QualityLevel::from_score(80.0), QualityLevel::Excellent);
        assert_eq!(QualityLevel::from_score(79.9), QualityLevel::Good);
        assert_eq!(QualityLevel::from_score(60.0), QualityLevel::Good);
        assert_eq!(QualityLevel::from_score(40.0), QualityLevel::Fair);
        assert_eq!(QualityLevel::from_score(20.0), QualityLevel::Poor);
        assert_eq!(QualityLevel::from_score(19.99), QualityLevel::Bad);
        assert!(QualityLevel::Excellent > QualityLevel::Poor);
    }
}
