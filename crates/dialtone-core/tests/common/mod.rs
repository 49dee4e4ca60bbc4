//! Hand-written collaborator fakes shared by the integration tests

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use dialtone_core::audio::{AudioMode, AudioOutput, AudioPlatformBridge};
use dialtone_core::{
    CallError, CallHistoryRepository, CallRecord, CallResult, CallSessionBuilder,
    CallSessionStateMachine, CoreConfig, TelephonySession, TransportEvent, TransportStats,
};

/// Scripted failures keyed by operation name
#[derive(Default)]
pub struct FailureScript {
    next: Mutex<HashMap<&'static str, VecDeque<CallError>>>,
    always: Mutex<HashMap<&'static str, CallError>>,
    hanging: Mutex<HashSet<&'static str>>,
}

impl FailureScript {
    pub fn fail_next(&self, operation: &'static str, error: CallError) {
        self.next.lock().entry(operation).or_default().push_back(error);
    }

    pub fn fail_always(&self, operation: &'static str, error: CallError) {
        self.always.lock().insert(operation, error);
    }

    /// Make `operation` never complete
    pub fn hang(&self, operation: &'static str) {
        self.hanging.lock().insert(operation);
    }

    pub fn heal(&self, operation: &'static str) {
        self.always.lock().remove(operation);
        self.next.lock().remove(operation);
        self.hanging.lock().remove(operation);
    }

    async fn gate(&self, operation: &'static str) {
        let hanging = self.hanging.lock().contains(operation);
        if hanging {
            std::future::pending::<()>().await;
        }
    }

    fn check(&self, operation: &'static str) -> CallResult<()> {
        if let Some(error) = self.next.lock().get_mut(operation).and_then(VecDeque::pop_front) {
            return Err(error);
        }
        match self.always.lock().get(operation) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

/// In-memory telephony transport
pub struct FakeTransport {
    pub failures: FailureScript,
    calls: Mutex<Vec<String>>,
    stats: Mutex<TransportStats>,
    events: broadcast::Sender<TransportEvent>,
    remote_call_id: String,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            failures: FailureScript::default(),
            calls: Mutex::new(Vec::new()),
            stats: Mutex::new(good_stats()),
            events,
            remote_call_id: "remote-1".to_string(),
        })
    }

    /// Push an event to every `events()` stream
    pub fn push(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    pub fn set_stats(&self, stats: TransportStats) {
        *self.stats.lock() = stats;
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Number of invocations of `operation`, failed ones included
    pub fn count(&self, operation: &str) -> usize {
        let prefix = format!("{}:", operation);
        self.calls
            .lock()
            .iter()
            .filter(|c| c.as_str() == operation || c.starts_with(&prefix))
            .count()
    }

    async fn record(&self, operation: &'static str, detail: &str) -> CallResult<()> {
        self.calls.lock().push(format!("{}:{}", operation, detail));
        self.failures.gate(operation).await;
        self.failures.check(operation)
    }
}

#[async_trait]
impl TelephonySession for FakeTransport {
    async fn connect(&self) -> CallResult<()> {
        self.calls.lock().push("connect".to_string());
        self.failures.gate("connect").await;
        self.failures.check("connect")
    }

    async fn make_call(&self, to: &str) -> CallResult<String> {
        self.record("make_call", to).await?;
        Ok(self.remote_call_id.clone())
    }

    async fn answer(&self, call_id: &str) -> CallResult<()> {
        self.record("answer", call_id).await
    }

    async fn decline(&self, call_id: &str, reason: &str) -> CallResult<()> {
        self.record("decline", &format!("{}:{}", call_id, reason)).await
    }

    async fn hangup(&self, call_id: &str) -> CallResult<()> {
        self.record("hangup", call_id).await
    }

    async fn hold(&self, call_id: &str) -> CallResult<()> {
        self.record("hold", call_id).await
    }

    async fn unhold(&self, call_id: &str) -> CallResult<()> {
        self.record("unhold", call_id).await
    }

    async fn send_dtmf(&self, call_id: &str, digit: char) -> CallResult<()> {
        self.record("send_dtmf", &format!("{}:{}", call_id, digit)).await
    }

    async fn stats(&self, call_id: &str) -> CallResult<TransportStats> {
        self.record("stats", call_id).await?;
        Ok(self.stats.lock().clone())
    }

    fn events(&self) -> BoxStream<'static, TransportEvent> {
        Box::pin(BroadcastStream::new(self.events.subscribe()).filter_map(Result::ok))
    }
}

/// Audio bridge recording every command
#[derive(Default)]
pub struct FakeAudioBridge {
    pub failures: FailureScript,
    commands: Mutex<Vec<String>>,
    /// Artificial latency of every command
    pub latency: Mutex<Duration>,
}

impl FakeAudioBridge {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }

    async fn run(&self, operation: &'static str, detail: String) -> CallResult<()> {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.commands.lock().push(format!("{}:{}", operation, detail));
        self.failures.gate(operation).await;
        self.failures.check(operation)
    }
}

#[async_trait]
impl AudioPlatformBridge for FakeAudioBridge {
    async fn set_audio_mode(&self, mode: AudioMode) -> CallResult<()> {
        self.run("mode", mode.to_string()).await
    }

    async fn set_speaker(&self, enabled: bool) -> CallResult<()> {
        self.run("speaker", enabled.to_string()).await
    }

    async fn set_mute(&self, muted: bool) -> CallResult<()> {
        self.run("mute", muted.to_string()).await
    }

    async fn set_output(&self, output: AudioOutput) -> CallResult<()> {
        self.run("output", output.to_string()).await
    }
}

/// Call history keeping records in memory
#[derive(Default)]
pub struct RecordingHistory {
    pub failures: FailureScript,
    records: Mutex<Vec<CallRecord>>,
    attempts: Mutex<usize>,
}

impl RecordingHistory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn records(&self) -> Vec<CallRecord> {
        self.records.lock().clone()
    }

    pub fn attempts(&self) -> usize {
        *self.attempts.lock()
    }
}

#[async_trait]
impl CallHistoryRepository for RecordingHistory {
    async fn save_call_record(&self, record: CallRecord) -> CallResult<()> {
        *self.attempts.lock() += 1;
        self.failures.check("save")?;
        self.records.lock().push(record);
        Ok(())
    }
}

pub struct Harness {
    pub machine: CallSessionStateMachine,
    pub transport: Arc<FakeTransport>,
    pub audio: Arc<FakeAudioBridge>,
    pub history: Arc<RecordingHistory>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(CoreConfig::default())
    }

    pub fn with_config(config: CoreConfig) -> Self {
        let transport = FakeTransport::new();
        let audio = FakeAudioBridge::new();
        let history = RecordingHistory::new();
        let machine = CallSessionBuilder::new()
            .with_config(config)
            .with_transport(transport.clone())
            .with_audio_bridge(audio.clone())
            .with_history(history.clone())
            .build()
            .expect("valid configuration");
        Self {
            machine,
            transport,
            audio,
            history,
        }
    }

    /// Ring and answer a call
    pub async fn active_call(&self, call_id: &str) {
        self.machine
            .on_incoming(call_id, "+15550100", Some("Alice".to_string()))
            .await
            .expect("incoming call accepted");
        self.machine.answer().await.expect("answer succeeds");
    }
}

/// Let spawned tasks (history writes, event pump) run
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

pub fn good_stats() -> TransportStats {
    TransportStats {
        round_trip_time_ms: Some(50.0),
        jitter_ms: Some(5.0),
        packet_loss_percent: Some(0.1),
        ..Default::default()
    }
}

pub fn terrible_stats() -> TransportStats {
    TransportStats {
        round_trip_time_ms: Some(500.0),
        jitter_ms: Some(100.0),
        packet_loss_percent: Some(10.0),
        ..Default::default()
    }
}
