mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio_stream::StreamExt;

use common::FakeAudioBridge;
use dialtone_core::audio::{AudioMode, AudioOutput, AudioRouteController};
use dialtone_core::CallError;

#[tokio::test(start_paused = true)]
async fn test_changing_flag_brackets_bridge_call() {
    let bridge = FakeAudioBridge::new();
    *bridge.latency.lock() = Duration::from_millis(100);
    let controller = AudioRouteController::new(bridge.clone());
    let mut states = controller.subscribe();

    controller.toggle_speaker().await.unwrap();

    let during = states.next().await.unwrap().unwrap();
    assert!(during.is_changing_audio);
    assert!(!during.is_speaker_on);

    let after = states.next().await.unwrap().unwrap();
    assert!(!after.is_changing_audio);
    assert!(after.is_speaker_on);
    assert_eq!(after.current_output, AudioOutput::Speaker);
}

#[tokio::test(start_paused = true)]
async fn test_failure_keeps_prior_values() {
    let bridge = FakeAudioBridge::new();
    bridge.failures.fail_next("speaker", CallError::platform_audio("route busy"));
    let controller = AudioRouteController::new(bridge.clone());

    let result = controller.toggle_speaker().await;

    assert!(matches!(result, Err(CallError::PlatformAudio { .. })));
    let state = controller.state();
    assert!(!state.is_speaker_on);
    assert_eq!(state.current_output, AudioOutput::Earpiece);
    assert!(!state.is_changing_audio);
    assert_eq!(
        state.error_message.as_deref(),
        Some("Platform audio error: route busy")
    );

    // The next successful command clears the error
    controller.toggle_speaker().await.unwrap();
    assert_eq!(controller.state().error_message, None);
}

#[tokio::test(start_paused = true)]
async fn test_commands_are_serialized() {
    let bridge = FakeAudioBridge::new();
    *bridge.latency.lock() = Duration::from_millis(50);
    let controller = Arc::new(AudioRouteController::new(bridge.clone()));

    let (first, second) = tokio::join!(controller.toggle_mute(), controller.toggle_mute());

    assert_eq!(first, Ok(true));
    assert_eq!(second, Ok(false));
    assert_eq!(bridge.commands(), vec!["mute:true", "mute:false"]);
    assert!(!controller.state().is_muted);
}

#[tokio::test(start_paused = true)]
async fn test_reset_for_call_end() {
    let bridge = FakeAudioBridge::new();
    let controller = AudioRouteController::new(bridge.clone());
    controller.set_audio_mode(AudioMode::InCommunication).await.unwrap();
    controller.toggle_mute().await.unwrap();
    controller.toggle_speaker().await.unwrap();

    controller.reset_for_call_end().await.unwrap();

    let state = controller.state();
    assert!(!state.is_muted);
    assert!(!state.is_speaker_on);
    assert_eq!(state.mode, AudioMode::Normal);
    assert_eq!(state.current_output, AudioOutput::Earpiece);
    assert_eq!(
        bridge.commands()[3..],
        ["mute:false", "speaker:false", "mode:normal"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_reset_continues_after_failure() {
    let bridge = FakeAudioBridge::new();
    let controller = AudioRouteController::new(bridge.clone());
    controller.set_audio_mode(AudioMode::InCommunication).await.unwrap();
    controller.toggle_mute().await.unwrap();
    bridge.failures.fail_next("mute", CallError::platform_audio("stuck"));

    let result = controller.reset_for_call_end().await;

    assert!(matches!(result, Err(CallError::PlatformAudio { .. })));
    let state = controller.state();
    assert!(state.is_muted);
    assert_eq!(state.mode, AudioMode::Normal);
}

#[tokio::test(start_paused = true)]
async fn test_output_selection_and_hot_plug() {
    let bridge = FakeAudioBridge::new();
    let controller = AudioRouteController::new(bridge.clone());

    assert!(controller.set_output(AudioOutput::Bluetooth).await.is_err());

    controller.update_available_outputs(true, false).await.unwrap();
    controller.set_output(AudioOutput::Bluetooth).await.unwrap();
    assert_eq!(controller.state().current_output, AudioOutput::Bluetooth);

    // Bluetooth disappears without a headset: back to the earpiece
    controller.update_available_outputs(false, false).await.unwrap();
    let state = controller.state();
    assert_eq!(state.current_output, AudioOutput::Earpiece);
    assert!(!state.available_outputs.contains(&AudioOutput::Bluetooth));
    assert_eq!(bridge.commands().last().map(String::as_str), Some("output:earpiece"));
}

#[tokio::test(start_paused = true)]
async fn test_speaker_off_prefers_wired_headset() {
    let bridge = FakeAudioBridge::new();
    let controller = AudioRouteController::new(bridge.clone());
    controller.update_available_outputs(false, true).await.unwrap();

    controller.toggle_speaker().await.unwrap();
    controller.toggle_speaker().await.unwrap();

    assert_eq!(controller.state().current_output, AudioOutput::WiredHeadset);
}

#[tokio::test(start_paused = true)]
async fn test_unresponsive_bridge_times_out() {
    let bridge = FakeAudioBridge::new();
    bridge.failures.hang("speaker");
    let controller = AudioRouteController::new(bridge.clone()).with_command_timeout(Duration::from_secs(1));

    let result = controller.toggle_speaker().await;

    assert_eq!(result, Err(CallError::OperationTimeout { duration_ms: 1000 }));
    let state = controller.state();
    assert!(!state.is_changing_audio);
    assert!(!state.is_speaker_on);
    assert!(state.error_message.is_some());

    // The command lock was released with the abandoned bridge call
    bridge.failures.heal("speaker");
    assert_eq!(controller.toggle_speaker().await, Ok(true));
}

#[tokio::test(start_paused = true)]
async fn test_clean_reset_clears_stale_error_and_keeps_device() {
    let bridge = FakeAudioBridge::new();
    let controller = AudioRouteController::new(bridge.clone());
    controller.update_available_outputs(true, false).await.unwrap();
    controller.set_output(AudioOutput::Bluetooth).await.unwrap();
    bridge.failures.fail_next("mode", CallError::platform_audio("busy"));
    assert!(controller.set_audio_mode(AudioMode::InCommunication).await.is_err());
    assert!(controller.state().error_message.is_some());

    // Nothing to undo: no bridge call, but the stale error goes away
    let before = bridge.commands().len();
    controller.reset_for_call_end().await.unwrap();

    let state = controller.state();
    assert_eq!(bridge.commands().len(), before);
    assert_eq!(state.error_message, None);
    assert_eq!(state.current_output, AudioOutput::Bluetooth);
    assert_eq!(state.mode, AudioMode::Normal);
}
