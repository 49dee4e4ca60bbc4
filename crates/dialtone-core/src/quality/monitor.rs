//! Periodic connection quality sampling

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::score::{ConnectionQualitySample, QualityLevel};
use crate::config::QualityConfig;
use crate::events::{EventEmitter, EventStream};
use crate::timer::{ScheduledTask, TickControl};
use crate::transport::{TelephonySession, TransportStats};

/// Raised after a run of consecutive poor/bad samples
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DegradedQualityAlert {
    pub call_id: String,
    pub consecutive_poor_samples: u32,
    pub latest: ConnectionQualitySample,
    pub raised_at: DateTime<Utc>,
}

/// Summary of the sample history
#[derive(Debug, Clone, PartialEq)]
pub enum QualityAssessment {
    /// Not enough samples to say anything yet
    InsufficientData { samples: usize, required: usize },
    Reliable {
        average_score: f64,
        level: QualityLevel,
        latest: ConnectionQualitySample,
    },
}

impl QualityAssessment {
    pub fn is_reliable(&self) -> bool {
        matches!(self, QualityAssessment::Reliable { .. })
    }
}

#[derive(Debug, Default)]
struct MonitorState {
    call_id: Option<String>,
    history: VecDeque<ConnectionQualitySample>,
    consecutive_poor: u32,
}

struct MonitorShared {
    config: QualityConfig,
    state: Mutex<MonitorState>,
    samples: EventEmitter<ConnectionQualitySample>,
    alerts: EventEmitter<DegradedQualityAlert>,
}

impl MonitorShared {
    /// Score and store `stats`; ignored unless `call_id` is the attached call
    fn record(&self, call_id: &str, stats: TransportStats) -> Option<ConnectionQualitySample> {
        let sample = ConnectionQualitySample::from_stats(stats, Utc::now());
        let mut state = self.state.lock();
        if state.call_id.as_deref() != Some(call_id) {
            debug!(call_id = %call_id, "Dropping stats for a call that is not monitored");
            return None;
        }

        if state.history.len() >= self.config.history_capacity {
            state.history.pop_front();
        }
        state.history.push_back(sample.clone());

        let alert = if sample.quality_level.is_degraded() {
            state.consecutive_poor += 1;
            (state.consecutive_poor == self.config.degraded_alert_threshold).then(|| {
                DegradedQualityAlert {
                    call_id: call_id.to_string(),
                    consecutive_poor_samples: state.consecutive_poor,
                    latest: sample.clone(),
                    raised_at: sample.timestamp,
                }
            })
        } else {
            state.consecutive_poor = 0;
            None
        };

        debug!(
            call_id = %call_id,
            score = sample.quality_score,
            level = %sample.quality_level,
            "Quality sample recorded"
        );
        self.samples.emit(sample.clone());
        if let Some(alert) = alert {
            warn!(
                call_id = %call_id,
                consecutive = alert.consecutive_poor_samples,
                score = sample.quality_score,
                "Connection quality degraded"
            );
            self.alerts.emit(alert);
        }
        Some(sample)
    }

    fn is_attached_to(&self, call_id: &str) -> bool {
        self.state.lock().call_id.as_deref() == Some(call_id)
    }
}

/// Samples transport statistics for the active call
///
/// One monitor serves one call at a time. [`attach`](Self::attach) starts the
/// sampler, [`detach`](Self::detach) stops it and discards the history.
/// Samples and degradation alerts are published on separate streams.
pub struct ConnectionQualityMonitor {
    shared: Arc<MonitorShared>,
    sampler: Mutex<Option<ScheduledTask>>,
}

impl ConnectionQualityMonitor {
    pub fn new(config: QualityConfig) -> Self {
        let samples = EventEmitter::new(config.event_capacity);
        let alerts = EventEmitter::new(config.event_capacity);
        Self {
            shared: Arc::new(MonitorShared {
                config,
                state: Mutex::new(MonitorState::default()),
                samples,
                alerts,
            }),
            sampler: Mutex::new(None),
        }
    }

    /// Start sampling `call_id`, replacing any previous attachment
    pub fn attach(&self, call_id: &str, transport: Arc<dyn TelephonySession>) {
        self.detach();
        {
            let mut state = self.shared.state.lock();
            state.call_id = Some(call_id.to_string());
        }
        info!(
            call_id = %call_id,
            interval_ms = self.shared.config.sample_interval_ms,
            "Quality monitoring started"
        );

        let shared = self.shared.clone();
        let call_id = call_id.to_string();
        let task = ScheduledTask::periodic(
            format!("quality:{}", call_id),
            self.shared.config.sample_interval(),
            move |_| {
                let shared = shared.clone();
                let transport = transport.clone();
                let call_id = call_id.clone();
                async move {
                    if !shared.is_attached_to(&call_id) {
                        return TickControl::Stop;
                    }
                    match transport.stats(&call_id).await {
                        Ok(stats) => {
                            shared.record(&call_id, stats);
                        }
                        Err(e) => {
                            warn!(call_id = %call_id, error = %e, "Failed to poll call statistics");
                        }
                    }
                    TickControl::Continue
                }
            },
        );
        *self.sampler.lock() = Some(task);
    }

    /// Stop sampling and discard the history
    pub fn detach(&self) {
        if let Some(task) = self.sampler.lock().take() {
            task.cancel();
        }
        let mut state = self.shared.state.lock();
        if let Some(call_id) = state.call_id.take() {
            info!(call_id = %call_id, samples = state.history.len(), "Quality monitoring stopped");
        }
        state.history.clear();
        state.consecutive_poor = 0;
    }

    /// Feed statistics pushed by the transport through the same pipeline
    pub fn record_stats(&self, call_id: &str, stats: TransportStats) -> Option<ConnectionQualitySample> {
        self.shared.record(call_id, stats)
    }

    pub fn attached_call(&self) -> Option<String> {
        self.shared.state.lock().call_id.clone()
    }

    /// Whether the periodic sampler is running
    pub fn is_sampling(&self) -> bool {
        self.sampler
            .lock()
            .as_ref()
            .map_or(false, |task| !task.is_cancelled() && !task.is_finished())
    }

    /// Sample history, oldest first
    pub fn history(&self) -> Vec<ConnectionQualitySample> {
        self.shared.state.lock().history.iter().cloned().collect()
    }

    pub fn latest(&self) -> Option<ConnectionQualitySample> {
        self.shared.state.lock().history.back().cloned()
    }

    pub fn assessment(&self) -> QualityAssessment {
        let state = self.shared.state.lock();
        let required = self.shared.config.min_samples_for_assessment;
        let samples = state.history.len();
        match state.history.back() {
            Some(latest) if samples >= required => {
                let average_score =
                    state.history.iter().map(|s| s.quality_score).sum::<f64>() / samples as f64;
                QualityAssessment::Reliable {
                    average_score,
                    level: QualityLevel::from_score(average_score),
                    latest: latest.clone(),
                }
            }
            _ => QualityAssessment::InsufficientData { samples, required },
        }
    }

    pub fn subscribe_samples(&self) -> EventStream<ConnectionQualitySample> {
        self.shared.samples.subscribe()
    }

    pub fn subscribe_alerts(&self) -> EventStream<DegradedQualityAlert> {
        self.shared.alerts.subscribe()
    }

    pub(crate) fn sample_receiver(&self) -> tokio::sync::broadcast::Receiver<ConnectionQualitySample> {
        self.shared.samples.receiver()
    }

    pub(crate) fn alert_receiver(&self) -> tokio::sync::broadcast::Receiver<DegradedQualityAlert> {
        self.shared.alerts.receiver()
    }
}

impl Default for ConnectionQualityMonitor {
    fn default() -> Self {
        Self::new(QualityConfig::default())
    }
}

impl Drop for ConnectionQualityMonitor {
    fn drop(&mut self) {
        if let Some(task) = self.sampler.lock().take() {
            task.cancel();
        }
    }
}
