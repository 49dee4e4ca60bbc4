//! Call session state machine
//!
//! [`CallSessionStateMachine`] owns the single live call. User commands and
//! transport events are serialized through one FIFO command lock, so they are
//! applied in arrival order. Every transition publishes a
//! [`CallSessionState`] snapshot with a strictly increasing `sequence`.
//!
//! # Timers
//!
//! The duration tick and the quality listener are [`ScheduledTask`]s owned by
//! the machine. Both are cancelled on any transition out of Active/Held and
//! when the machine is dropped.
//!
//! # Examples
//!
//! ```rust,no_run
//! use dialtone_core::{CallSessionBuilder, EndReason, TelephonySession};
//! use std::sync::Arc;
//!
//! # async fn example(transport: Arc<dyn TelephonySession>) -> dialtone_core::CallResult<()> {
//! let machine = CallSessionBuilder::new().with_transport(transport).build()?;
//! machine.attach_transport_events();
//!
//! machine.on_incoming("call-1", "+15550100", None).await?;
//! machine.answer().await?;
//! machine.toggle_mute().await?;
//! machine.end_call(EndReason::UserHangUp).await?;
//! # Ok(())
//! # }
//! ```

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::types::{CallPhase, CallSession, CallSessionState, EndReason, OptimisticFlag};
use crate::audio::{AudioMode, AudioPlatformBridge, AudioRouteController};
use crate::config::CoreConfig;
use crate::error::{CallError, CallResult, ErrorContext};
use crate::events::{EventEmitter, EventStream};
use crate::quality::ConnectionQualityMonitor;
use crate::retry::{with_timeout, RetryHooks, RetryManager};
use crate::timer::{ScheduledTask, TickControl};
use crate::transport::{CallHistoryRepository, TelephonySession, TransportEvent};

/// Whether `digit` is a valid DTMF symbol (`0-9`, `A-D`, `*`, `#`)
pub fn is_dtmf_digit(digit: char) -> bool {
    matches!(digit, '0'..='9' | 'A'..='D' | '*' | '#')
}

#[derive(Default)]
struct CallTimers {
    ticker: Option<ScheduledTask>,
    quality_listener: Option<ScheduledTask>,
}

struct MachineShared {
    config: CoreConfig,
    transport: Arc<dyn TelephonySession>,
    history: Arc<dyn CallHistoryRepository>,
    audio: Arc<AudioRouteController>,
    quality: Arc<ConnectionQualityMonitor>,
    retry: Arc<RetryManager>,
    commands: tokio::sync::Mutex<()>,
    state: Mutex<CallSessionState>,
    timers: Mutex<CallTimers>,
    pump: Mutex<Option<ScheduledTask>>,
    events: EventEmitter<CallSessionState>,
}

impl MachineShared {
    fn snapshot(&self) -> CallSessionState {
        self.state.lock().clone()
    }

    /// Apply `change` and publish the resulting snapshot
    fn publish(&self, change: impl FnOnce(&mut CallSessionState)) {
        let mut state = self.state.lock();
        change(&mut state);
        state.sequence += 1;
        self.events.emit(state.clone());
    }

    /// Replace whatever was there with a fresh live session
    fn begin_session(&self, session: CallSession) {
        self.publish(|state| {
            let sequence = state.sequence;
            *state = CallSessionState::default().with_session(session);
            state.sequence = sequence;
        });
    }

    /// Mutate the live session `call_id` and publish; false if it is gone
    fn update_session<F>(&self, call_id: &str, change: F) -> bool
    where
        F: FnOnce(&mut CallSession, &mut Option<CallError>),
    {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        match state.session.as_mut() {
            Some(session) if session.call_id == call_id && session.phase.is_live() => {
                change(session, &mut state.error);
                state.phase = session.phase;
            }
            _ => return false,
        }
        state.sequence += 1;
        self.events.emit(state.clone());
        true
    }

    /// Id of the live session if its phase is one of `allowed`
    fn require(&self, operation: &str, allowed: &[CallPhase]) -> CallResult<String> {
        let state = self.state.lock();
        match state.session.as_ref() {
            Some(session) if allowed.contains(&state.phase) => Ok(session.call_id.clone()),
            _ => {
                debug!(operation = operation, phase = %state.phase, "Command rejected in current phase");
                Err(CallError::invalid_state(operation, state.phase))
            }
        }
    }

    fn require_no_live_call(&self, operation: &str) -> CallResult<()> {
        let phase = self.state.lock().phase;
        if phase.is_live() {
            warn!(operation = operation, phase = %phase, "A call is already in progress");
            return Err(CallError::invalid_state(operation, phase));
        }
        Ok(())
    }

    /// One duration tick; false stops the ticker
    fn tick(&self, call_id: &str, period: Duration) -> bool {
        let mut state = self.state.lock();
        match state.session.as_mut() {
            Some(session) if session.call_id == call_id && session.phase.is_connected() => {
                session.duration += period;
            }
            _ => return false,
        }
        state.sequence += 1;
        self.events.emit(state.clone());
        true
    }

    fn start_ticker(self: &Arc<Self>, call_id: &str) {
        let mut timers = self.timers.lock();
        if timers.ticker.is_some() {
            debug!(call_id = %call_id, "Duration ticker already running");
            return;
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.config.call.tick_interval();
        let owner = call_id.to_string();
        timers.ticker = Some(ScheduledTask::periodic(
            format!("duration:{}", call_id),
            period,
            move |_| {
                let weak = weak.clone();
                let call_id = owner.clone();
                async move {
                    match weak.upgrade() {
                        Some(shared) if shared.tick(&call_id, period) => TickControl::Continue,
                        _ => TickControl::Stop,
                    }
                }
            },
        ));
    }

    /// Attach the quality monitor and mirror its output onto the session
    fn start_quality(self: &Arc<Self>, call_id: &str) {
        let mut samples = self.quality.sample_receiver();
        let mut alerts = self.quality.alert_receiver();
        self.quality.attach(call_id, self.transport.clone());

        let weak: Weak<Self> = Arc::downgrade(self);
        let owner = call_id.to_string();
        let listener = ScheduledTask::spawn(format!("quality-listener:{}", call_id), async move {
            loop {
                tokio::select! {
                    sample = samples.recv() => match sample {
                        Ok(sample) => {
                            let Some(shared) = weak.upgrade() else { break };
                            shared.update_session(&owner, |session, _| {
                                session.quality_score = Some(sample.quality_score);
                                if !sample.quality_level.is_degraded() {
                                    session.quality_warning = false;
                                }
                            });
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            debug!(call_id = %owner, skipped = skipped, "Quality listener lagged");
                        }
                        Err(RecvError::Closed) => break,
                    },
                    alert = alerts.recv() => match alert {
                        Ok(alert) => {
                            let Some(shared) = weak.upgrade() else { break };
                            shared.update_session(&alert.call_id, |session, _| session.quality_warning = true);
                        }
                        Err(RecvError::Lagged(_)) => {}
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        });

        if let Some(previous) = self.timers.lock().quality_listener.replace(listener) {
            previous.cancel();
        }
    }

    fn stop_timers(&self) {
        let (ticker, listener) = {
            let mut timers = self.timers.lock();
            (timers.ticker.take(), timers.quality_listener.take())
        };
        if let Some(ticker) = ticker {
            ticker.cancel();
        }
        if let Some(listener) = listener {
            listener.cancel();
        }
        self.quality.detach();
    }

    /// Change the platform audio mode; a failure or timeout is surfaced but the
    /// call continues
    async fn apply_audio_mode(&self, call_id: &str, mode: AudioMode) {
        if let Err(e) = self.audio.set_audio_mode(mode).await {
            warn!(call_id = %call_id, mode = %mode, error = %e, "Audio mode change failed, call continues");
            self.update_session(call_id, |_, error| *error = Some(e));
        }
    }

    /// Common side effects of a call becoming Active
    async fn connect_call(self: &Arc<Self>, call_id: &str) {
        let connected = self.update_session(call_id, |session, error| {
            session.mark_answered();
            *error = None;
        });
        if !connected {
            return;
        }
        info!(call_id = %call_id, "Call connected");
        self.start_ticker(call_id);
        self.start_quality(call_id);
        self.apply_audio_mode(call_id, AudioMode::InCommunication).await;
    }

    /// Move the live call to a terminal phase, archive it and reset audio
    async fn finish<F>(&self, call_id: &str, phase: CallPhase, reason: EndReason, error: Option<CallError>, prepare: F)
    where
        F: FnOnce(&mut CallSession),
    {
        self.stop_timers();

        let record = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let record = match state.session.as_mut() {
                Some(session) if session.call_id == call_id && session.phase.is_live() => {
                    prepare(session);
                    session.mark_ended(phase, reason);
                    session.to_record()
                }
                _ => return,
            };
            state.phase = phase;
            state.record = Some(record.clone());
            state.error = error;
            state.sequence += 1;
            self.events.emit(state.clone());
            record
        };

        info!(
            call_id = %call_id,
            phase = %phase,
            reason = %reason,
            status = %record.status,
            duration_secs = record.duration_secs,
            "Call finished"
        );

        self.archive(record);
        if let Err(e) = self.audio.reset_for_call_end().await {
            warn!(call_id = %call_id, error = %e, "Failed to reset audio after call");
        }
    }

    /// Hand the record to the history repository without waiting for it
    fn archive(&self, record: super::types::CallRecord) {
        let history = self.history.clone();
        tokio::spawn(async move {
            let call_id = record.call_id.clone();
            // Logged by the context wrapper; a lost record never fails the call
            let _ = history
                .save_call_record(record)
                .await
                .with_context(|| format!("archive call {}", call_id));
        });
    }

    fn cancel_pending(&self, call_id: &str) {
        for operation in ["answer", "make_call", "reconnect"] {
            self.retry.cancel(&format!("{}:{}", operation, call_id));
        }
    }
}

impl Drop for MachineShared {
    fn drop(&mut self) {
        self.retry.cancel_all();
    }
}

/// Orchestrates the lifecycle of the device's single call
///
/// Cloning yields another handle to the same machine.
#[derive(Clone)]
pub struct CallSessionStateMachine {
    shared: Arc<MachineShared>,
}

impl CallSessionStateMachine {
    /// Create a machine around the injected collaborators
    pub fn new(
        config: CoreConfig,
        transport: Arc<dyn TelephonySession>,
        history: Arc<dyn CallHistoryRepository>,
        audio_bridge: Arc<dyn AudioPlatformBridge>,
    ) -> CallResult<Self> {
        config.validate()?;
        let quality = Arc::new(ConnectionQualityMonitor::new(config.quality.clone()));
        let events = EventEmitter::new(config.call.event_capacity);
        Ok(Self {
            shared: Arc::new(MachineShared {
                transport,
                history,
                audio: Arc::new(
                    AudioRouteController::new(audio_bridge).with_command_timeout(config.call.audio_timeout()),
                ),
                quality,
                retry: Arc::new(RetryManager::new()),
                commands: tokio::sync::Mutex::new(()),
                state: Mutex::new(CallSessionState::default()),
                timers: Mutex::new(CallTimers::default()),
                pump: Mutex::new(None),
                events,
                config,
            }),
        })
    }

    /// Current snapshot
    pub fn state(&self) -> CallSessionState {
        self.shared.snapshot()
    }

    pub fn phase(&self) -> CallPhase {
        self.shared.state.lock().phase
    }

    /// Every snapshot published from now on
    pub fn subscribe(&self) -> EventStream<CallSessionState> {
        self.shared.events.subscribe()
    }

    pub fn audio(&self) -> &AudioRouteController {
        &self.shared.audio
    }

    pub fn quality(&self) -> &ConnectionQualityMonitor {
        &self.shared.quality
    }

    pub fn retry_manager(&self) -> &RetryManager {
        &self.shared.retry
    }

    pub fn config(&self) -> &CoreConfig {
        &self.shared.config
    }

    /// Whether the duration tick is running
    pub fn is_ticking(&self) -> bool {
        self.shared
            .timers
            .lock()
            .ticker
            .as_ref()
            .map_or(false, |task| !task.is_finished())
    }

    /// Register the incoming call and start ringing
    pub async fn on_incoming(
        &self,
        call_id: &str,
        caller_number: &str,
        caller_name: Option<String>,
    ) -> CallResult<()> {
        let _command = self.shared.commands.lock().await;
        self.shared.require_no_live_call("on_incoming")?;

        info!(call_id = %call_id, caller = %caller_number, "Incoming call");
        let route = self.shared.audio.state();
        self.shared.begin_session(
            CallSession::incoming(call_id, caller_number)
                .with_caller_name(caller_name)
                .with_audio_flags(route.is_muted, route.is_speaker_on),
        );
        self.shared.apply_audio_mode(call_id, AudioMode::Ringtone).await;
        Ok(())
    }

    /// Answer the ringing call
    ///
    /// The transport answer is retried with the call-connection policy.
    /// Authentication failures fail the call; other failures leave it ringing
    /// with the error on the snapshot.
    pub async fn answer(&self) -> CallResult<()> {
        let _command = self.shared.commands.lock().await;
        let call_id = self.shared.require("answer", &[CallPhase::Incoming])?;
        info!(call_id = %call_id, "Answering call");

        let shared = &self.shared;
        let result = shared
            .retry
            .execute_with(
                format!("answer:{}", call_id),
                &shared.config.retry.call_connection,
                RetryHooks::taxonomy(),
                || shared.transport.answer(&call_id),
            )
            .await
            .into_result();

        match result {
            Ok(()) => {
                shared.connect_call(&call_id).await;
                Ok(())
            }
            Err(CallError::UserCancelled) => Err(CallError::UserCancelled),
            Err(e) if e.is_fatal() => {
                shared
                    .finish(&call_id, CallPhase::Failed, EndReason::ConnectionFailed, Some(e.clone()), |_| {})
                    .await;
                Err(e)
            }
            Err(e) => {
                warn!(call_id = %call_id, error = %e, "Answer failed, call still ringing");
                shared.update_session(&call_id, |_, error| *error = Some(e.clone()));
                Err(e)
            }
        }
    }

    /// Reject the ringing call
    ///
    /// The call always ends locally, at the latest after the hangup timeout.
    /// A transport failure or timeout is returned and left on the snapshot.
    pub async fn decline(&self, reason: &str) -> CallResult<()> {
        let _command = self.shared.commands.lock().await;
        let call_id = self.shared.require("decline", &[CallPhase::Incoming])?;
        info!(call_id = %call_id, reason = %reason, "Declining call");

        let outcome = with_timeout(
            "decline",
            self.shared.config.call.hangup_timeout(),
            self.shared.transport.decline(&call_id, reason),
        )
        .await;
        if let Err(e) = &outcome {
            warn!(call_id = %call_id, error = %e, "Transport decline failed, ending locally");
        }

        self.shared
            .finish(
                &call_id,
                CallPhase::Ended,
                EndReason::Declined,
                outcome.clone().err(),
                |session| {
                    session.duration = Duration::ZERO;
                    session.decline_reason = Some(reason.to_string());
                },
            )
            .await;
        outcome
    }

    /// Place an outgoing call; returns the transport call id
    pub async fn make_call(&self, to: &str, display_name: Option<String>) -> CallResult<String> {
        let _command = self.shared.commands.lock().await;
        self.shared.require_no_live_call("make_call")?;

        let local_id = format!("local-{}", Uuid::new_v4());
        info!(call_id = %local_id, to = %to, "Placing call");
        let route = self.shared.audio.state();
        self.shared.begin_session(
            CallSession::outgoing(local_id.as_str(), to)
                .with_caller_name(display_name)
                .with_audio_flags(route.is_muted, route.is_speaker_on),
        );

        let shared = &self.shared;
        let result = shared
            .retry
            .execute_with(
                format!("make_call:{}", local_id),
                &shared.config.retry.call_connection,
                RetryHooks::taxonomy(),
                || shared.transport.make_call(to),
            )
            .await
            .into_result();

        match result {
            Ok(remote_id) => {
                debug!(local_id = %local_id, call_id = %remote_id, "Transport assigned call id");
                shared.update_session(&local_id, |session, _| session.call_id = remote_id.clone());
                Ok(remote_id)
            }
            Err(CallError::UserCancelled) => Err(CallError::UserCancelled),
            Err(e) => {
                shared
                    .finish(&local_id, CallPhase::Failed, EndReason::ConnectionFailed, Some(e.clone()), |_| {})
                    .await;
                Err(e)
            }
        }
    }

    /// The remote party answered our outgoing call
    pub async fn on_remote_answered(&self, call_id: &str) -> CallResult<()> {
        let _command = self.shared.commands.lock().await;
        let current = self.shared.require("on_remote_answered", &[CallPhase::Outgoing])?;
        if current != call_id {
            warn!(call_id = %call_id, current = %current, "Answer for an unknown call");
            return Err(CallError::invalid_state("on_remote_answered", "not the current call"));
        }
        self.shared.connect_call(call_id).await;
        Ok(())
    }

    /// The call ended on the remote/transport side; no hangup is sent
    pub async fn on_remote_ended(&self, call_id: &str, reason: EndReason) -> CallResult<()> {
        self.shared.cancel_pending(call_id);
        let _command = self.shared.commands.lock().await;

        let state = self.shared.snapshot();
        if !state.phase.is_live() || state.call_id() != Some(call_id) {
            debug!(call_id = %call_id, "End event for a call that is not live");
            return Ok(());
        }
        info!(call_id = %call_id, reason = %reason, "Call ended remotely");
        self.shared
            .finish(call_id, CallPhase::Ended, reason, None, |_| {})
            .await;
        Ok(())
    }

    /// Hang up the live call
    pub async fn end_call(&self, reason: EndReason) -> CallResult<()> {
        if let Some(call_id) = self.shared.snapshot().call_id() {
            self.shared.cancel_pending(call_id);
        }
        let _command = self.shared.commands.lock().await;
        let call_id = self.shared.require(
            "end_call",
            &[CallPhase::Incoming, CallPhase::Outgoing, CallPhase::Active, CallPhase::Held],
        )?;
        info!(call_id = %call_id, reason = %reason, "Ending call");

        self.shared.stop_timers();
        let hangup = with_timeout(
            "hangup",
            self.shared.config.call.hangup_timeout(),
            self.shared.transport.hangup(&call_id),
        )
        .await
        .with_context(|| format!("hangup call {}", call_id));
        if hangup.is_err() {
            debug!(call_id = %call_id, "Ending locally without a confirmed hangup");
        }

        self.shared
            .finish(&call_id, CallPhase::Ended, reason, None, |_| {})
            .await;
        Ok(())
    }

    /// Toggle the microphone; returns whether it is now muted
    pub async fn toggle_mute(&self) -> CallResult<bool> {
        let _command = self.shared.commands.lock().await;
        let call_id = self
            .shared
            .require("toggle_mute", &[CallPhase::Active, CallPhase::Held])?;

        self.shared
            .update_session(&call_id, |session, _| session.mute = session.mute.request(!session.mute.value()));
        let result = self.shared.audio.toggle_mute().await;
        self.settle_flag(&call_id, &result, |session| &mut session.mute);
        result
    }

    /// Toggle the loudspeaker; returns whether it is now on
    pub async fn toggle_speaker(&self) -> CallResult<bool> {
        let _command = self.shared.commands.lock().await;
        let call_id = self
            .shared
            .require("toggle_speaker", &[CallPhase::Active, CallPhase::Held])?;

        self.shared.update_session(&call_id, |session, _| {
            session.speaker = session.speaker.request(!session.speaker.value())
        });
        let result = self.shared.audio.toggle_speaker().await;
        self.settle_flag(&call_id, &result, |session| &mut session.speaker);
        result
    }

    /// Put the call on hold or resume it; returns whether it is now held
    pub async fn toggle_hold(&self) -> CallResult<bool> {
        let _command = self.shared.commands.lock().await;
        let call_id = self
            .shared
            .require("toggle_hold", &[CallPhase::Active, CallPhase::Held])?;
        let hold = self.phase() == CallPhase::Active;

        self.shared
            .update_session(&call_id, |session, _| session.hold = session.hold.request(hold));
        let result = if hold {
            self.shared.transport.hold(&call_id).await
        } else {
            self.shared.transport.unhold(&call_id).await
        };

        match result {
            Ok(()) => {
                info!(call_id = %call_id, held = hold, "Hold state changed");
                self.shared.update_session(&call_id, |session, error| {
                    session.hold = OptimisticFlag::Confirmed(hold);
                    session.phase = if hold { CallPhase::Held } else { CallPhase::Active };
                    *error = None;
                });
                Ok(hold)
            }
            Err(e) => {
                warn!(call_id = %call_id, error = %e, "Hold change failed, reverting");
                self.shared.update_session(&call_id, |session, error| {
                    session.hold = session.hold.revert();
                    *error = Some(e.clone());
                });
                Err(e)
            }
        }
    }

    /// Send one DTMF digit; transport failures are logged only
    pub async fn send_dtmf(&self, digit: char) -> CallResult<()> {
        if !is_dtmf_digit(digit) {
            return Err(CallError::InvalidDtmfDigit { digit });
        }
        let _command = self.shared.commands.lock().await;
        let call_id = self
            .shared
            .require("send_dtmf", &[CallPhase::Active, CallPhase::Held])?;

        if let Err(e) = self.shared.transport.send_dtmf(&call_id, digit).await {
            warn!(call_id = %call_id, digit = %digit, error = %e, "DTMF send failed");
        }
        Ok(())
    }

    /// Show or hide the dial pad; returns whether it is now visible
    pub async fn toggle_keypad(&self) -> CallResult<bool> {
        let _command = self.shared.commands.lock().await;
        let call_id = self.shared.require(
            "toggle_keypad",
            &[CallPhase::Outgoing, CallPhase::Active, CallPhase::Held],
        )?;

        let mut visible = false;
        self.shared.update_session(&call_id, |session, _| {
            session.is_keypad_visible = !session.is_keypad_visible;
            visible = session.is_keypad_visible;
        });
        Ok(visible)
    }

    /// Re-establish the transport after a connection loss
    ///
    /// The command lock is released while retrying so `end_call` can cancel
    /// the reconnection. Exhaustion fails the call.
    pub async fn reconnect(&self) -> CallResult<()> {
        let call_id = {
            let _command = self.shared.commands.lock().await;
            let call_id = self
                .shared
                .require("reconnect", &[CallPhase::Active, CallPhase::Held])?;
            self.shared.update_session(&call_id, |_, error| {
                *error = Some(CallError::transient("connection lost"));
            });
            call_id
        };
        warn!(call_id = %call_id, "Connection lost, reconnecting");

        let shared = &self.shared;
        let result = shared
            .retry
            .execute_with(
                format!("reconnect:{}", call_id),
                &shared.config.retry.call_connection,
                RetryHooks::taxonomy(),
                || shared.transport.connect(),
            )
            .await
            .into_result();

        let _command = shared.commands.lock().await;
        match result {
            Ok(()) => {
                info!(call_id = %call_id, "Reconnected");
                shared.update_session(&call_id, |_, error| *error = None);
                Ok(())
            }
            Err(CallError::UserCancelled) => Err(CallError::UserCancelled),
            Err(e) => {
                shared
                    .finish(&call_id, CallPhase::Failed, EndReason::ConnectionFailed, Some(e.clone()), |_| {})
                    .await;
                Err(e)
            }
        }
    }

    /// Register with the telephony backend using the registration policy
    pub async fn register(&self) -> CallResult<()> {
        let shared = &self.shared;
        shared
            .retry
            .execute_with(
                "register",
                &shared.config.retry.registration,
                RetryHooks::taxonomy(),
                || shared.transport.connect(),
            )
            .await
            .into_result()
    }

    /// Return to Idle after the call reached Ended or Failed
    pub async fn reset(&self) -> CallResult<()> {
        let _command = self.shared.commands.lock().await;
        let phase = self.phase();
        match phase {
            CallPhase::Idle => Ok(()),
            CallPhase::Ended | CallPhase::Failed => {
                self.shared.publish(|state| {
                    let sequence = state.sequence;
                    *state = CallSessionState::default();
                    state.sequence = sequence;
                });
                Ok(())
            }
            _ => Err(CallError::invalid_state("reset", phase)),
        }
    }

    /// Consume transport events and dispatch them to this machine
    pub fn attach_transport_events(&self) {
        let mut events = self.shared.transport.events();
        let weak = Arc::downgrade(&self.shared);
        let pump = ScheduledTask::spawn("transport-events", async move {
            while let Some(event) = events.next().await {
                let Some(shared) = weak.upgrade() else { break };
                CallSessionStateMachine { shared }.dispatch(event).await;
            }
            debug!("Transport event stream ended");
        });

        if let Some(previous) = self.shared.pump.lock().replace(pump) {
            previous.cancel();
        }
    }

    async fn dispatch(&self, event: TransportEvent) {
        debug!(call_id = %event.call_id(), event = ?event, "Transport event");
        let result = match event {
            TransportEvent::IncomingCall {
                call_id,
                caller_number,
                caller_name,
            } => self.on_incoming(&call_id, &caller_number, caller_name).await,
            TransportEvent::RemoteAnswered { call_id } => self.on_remote_answered(&call_id).await,
            TransportEvent::CallEnded { call_id, reason } => self.on_remote_ended(&call_id, reason).await,
            TransportEvent::ConnectionLost { call_id } => {
                let machine = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = machine.reconnect().await {
                        warn!(call_id = %call_id, error = %e, "Reconnection did not complete");
                    }
                });
                Ok(())
            }
            TransportEvent::QualityReport { call_id, stats } => {
                self.shared.quality.record_stats(&call_id, stats);
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!(error = %e, "Transport event rejected");
        }
    }

    /// Stop every timer, the event pump and all in-flight retries
    pub fn shutdown(&self) {
        info!("Shutting down call session machine");
        if let Some(pump) = self.shared.pump.lock().take() {
            pump.cancel();
        }
        self.shared.retry.cancel_all();
        self.shared.stop_timers();
    }

    fn settle_flag(
        &self,
        call_id: &str,
        result: &CallResult<bool>,
        flag: impl FnOnce(&mut CallSession) -> &mut OptimisticFlag,
    ) {
        match result {
            Ok(value) => {
                self.shared.update_session(call_id, |session, error| {
                    *flag(session) = OptimisticFlag::Confirmed(*value);
                    *error = None;
                });
            }
            Err(e) => {
                warn!(call_id = %call_id, error = %e, "Audio change failed, reverting");
                self.shared.update_session(call_id, |session, error| {
                    let flag = flag(session);
                    *flag = flag.revert();
                    *error = Some(e.clone());
                });
            }
        }
    }
}

impl std::fmt::Debug for CallSessionStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("CallSessionStateMachine")
            .field("phase", &state.phase)
            .field("call_id", &state.call_id())
            .field("sequence", &state.sequence)
            .finish()
    }
}
