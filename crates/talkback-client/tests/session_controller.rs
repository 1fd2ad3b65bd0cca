//! Session controller behaviour against in-memory collaborators
//!
//! Run with: cargo test -p talkback-client --test session_controller

mod support;

use serde_json::json;
use std::sync::atomic::Ordering;
use std::time::Duration;
use support::{eventually, noise, Harness, USER};
use talkback_client::error::SessionError;
use talkback_client::state::ConnectionState;
use talkback_client::transport::{PeerState, TransportEvent};
use talkback_protocol::MessageRole;

fn response_done(id: &str, total_tokens: i64) -> serde_json::Value {
    json!({
        "type": "response.done",
        "response": {
            "id": id,
            "status": "completed",
            "usage": {
                "total_tokens": total_tokens,
                "input_tokens": total_tokens / 2,
                "output_tokens": total_tokens - total_tokens / 2
            }
        }
    })
}

fn user_item(id: &str, transcript: &str) -> serde_json::Value {
    json!({
        "type": "conversation.item.done",
        "item": {
            "id": id,
            "role": "user",
            "content": [{ "type": "input_audio", "transcript": transcript }]
        }
    })
}

/// Feed loud noise into the microphone until the returned task is aborted
fn speak(harness: &Harness) -> tokio::task::JoinHandle<()> {
    let capture = harness.capture.clone();
    tokio::spawn(async move {
        let mut seed = 1;
        loop {
            capture.publish(noise(480, 0.5, seed));
            seed += 1;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
}

#[tokio::test(start_paused = true)]
async fn connect_goes_live_and_configures_the_session() {
    let h = Harness::connected(5000).await;

    let transport = h.connector.last_transport();
    eventually(|| transport.session_updates() == 1).await;

    let snapshot = h.wait_for(|s| s.session_id.is_some()).await;
    assert_eq!(snapshot.state, ConnectionState::Connected);
    assert_eq!(snapshot.user_id, Some(USER));
    assert_eq!(snapshot.selected_voice.as_deref(), Some("ash"));
    assert_eq!(snapshot.token_balance, 5000);
    assert!(snapshot.can_connect);
    assert!(snapshot.error.is_none());

    let (model, key) = h.connector.last_request.lock().unwrap().clone().unwrap();
    assert_eq!(model, "gpt-realtime");
    assert_eq!(key, "ek_test");
}

#[tokio::test(start_paused = true)]
async fn profile_voice_is_used_unless_overridden() {
    let h = Harness::new(5000);
    h.backend.state().profile_voice = Some("verse".to_string());
    h.backend.state().profile_model = Some("gpt-realtime-mini".to_string());

    h.controller.connect(USER, None).await.unwrap();
    let snapshot = h.wait_for(|s| s.state.is_connected()).await;
    assert_eq!(snapshot.selected_voice.as_deref(), Some("verse"));
    let (model, _) = h.connector.last_request.lock().unwrap().clone().unwrap();
    assert_eq!(model, "gpt-realtime-mini");

    h.controller.disconnect().await;
    h.controller.connect(USER, Some("coral".to_string())).await.unwrap();
    let snapshot = h.wait_for(|s| s.state.is_connected()).await;
    assert_eq!(snapshot.selected_voice.as_deref(), Some("coral"));
}

#[tokio::test(start_paused = true)]
async fn concurrent_connects_open_one_session() {
    let h = Harness::new(5000);

    let (first, second) = tokio::join!(
        h.controller.connect(USER, None),
        h.controller.connect(USER, None)
    );
    assert!(first.is_ok());
    assert!(second.is_ok());
    h.wait_for(|s| s.state.is_connected()).await;

    // Connecting again while live is a no-op
    h.controller.connect(USER, None).await.unwrap();

    assert_eq!(h.capture.opens.load(Ordering::SeqCst), 1);
    assert_eq!(h.connector.opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn low_balance_blocks_the_session_before_any_media() {
    let h = Harness::new(1500);

    let err = h.controller.connect(USER, None).await.unwrap_err();
    assert_eq!(err, SessionError::InsufficientBalance { balance: 1500 });

    let snapshot = h.controller.snapshot();
    assert_eq!(snapshot.state, ConnectionState::Error);
    assert!(!snapshot.can_connect);
    assert_eq!(h.capture.opens.load(Ordering::SeqCst), 0);
    assert_eq!(h.connector.opens(), 0);

    // The low remainder is surrendered in one cleanup debit
    let state = h.backend.state();
    assert_eq!(state.deductions.len(), 1);
    assert!(state.deductions[0].session_id.starts_with("cleanup_"));
    assert_eq!(state.deductions[0].usage.total_tokens, 1500);
    assert_eq!(state.balance, 0);
    assert_eq!(snapshot.token_balance, 0);
}

#[tokio::test(start_paused = true)]
async fn ledger_outage_blocks_the_session() {
    let h = Harness::new(5000);
    h.backend.state().fail_balance = true;

    let err = h.controller.connect(USER, None).await.unwrap_err();
    assert!(matches!(err, SessionError::LedgerUnavailable(_)));
    assert_eq!(h.connector.opens(), 0);
    assert!(h.backend.state().deductions.is_empty());
}

#[tokio::test(start_paused = true)]
async fn credential_failure_is_terminal_on_first_connect() {
    let h = Harness::new(5000);
    h.backend.state().fail_credential = true;

    let err = h.controller.connect(USER, None).await.unwrap_err();
    assert!(matches!(err, SessionError::CredentialError(_)));

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.controller.snapshot().state, ConnectionState::Error);
    assert_eq!(h.connector.opens(), 0);
}

#[tokio::test(start_paused = true)]
async fn denied_microphone_fails_without_signaling() {
    let h = Harness::new(5000);
    h.capture.deny.store(true, Ordering::SeqCst);

    let err = h.controller.connect(USER, None).await.unwrap_err();
    assert_eq!(err, SessionError::PermissionDenied);
    assert_eq!(h.controller.snapshot().error, Some(SessionError::PermissionDenied));
    assert_eq!(h.connector.opens(), 0);
}

#[tokio::test(start_paused = true)]
async fn turn_events_drive_sub_states() {
    let h = Harness::connected(5000).await;

    h.connector.message(json!({ "type": "input_audio_buffer.speech_started", "item_id": "i1" }));
    h.wait_for(|s| s.state == ConnectionState::Listening).await;

    h.connector.message(json!({ "type": "response.created", "response": { "id": "r1" } }));
    h.wait_for(|s| s.state == ConnectionState::Thinking).await;

    h.connector.message(json!({ "type": "response.audio.delta", "response_id": "r1", "delta": "AAAA" }));
    h.wait_for(|s| s.state == ConnectionState::Speaking).await;

    h.connector.message(json!({ "type": "response.audio.done", "response_id": "r1" }));
    h.wait_for(|s| s.state == ConnectionState::Connected).await;
}

#[tokio::test(start_paused = true)]
async fn response_created_resumes_paused_playback() {
    let h = Harness::connected(5000).await;
    talkback_client::media::AudioOutput::pause(h.output.as_ref());

    h.connector.message(json!({ "type": "response.created" }));
    h.wait_for(|s| s.state == ConnectionState::Thinking).await;
    assert!(!talkback_client::media::AudioOutput::is_paused(h.output.as_ref()));
}

#[tokio::test(start_paused = true)]
async fn responses_are_billed_while_balance_lasts() {
    let h = Harness::connected(10_000).await;

    h.connector.message(response_done("resp_1", 1200));
    let snapshot = h.wait_for(|s| s.token_balance == 8800).await;
    assert_eq!(snapshot.state, ConnectionState::Connected);
    assert!(snapshot.can_connect);

    let deductions = h.backend.state().deductions.clone();
    assert_eq!(deductions.len(), 1);
    assert_eq!(deductions[0].session_id, "resp_1");
    assert_eq!(deductions[0].usage.total_tokens, 1200);
}

#[tokio::test(start_paused = true)]
async fn crossing_the_continue_threshold_sweeps_once_and_ends() {
    let h = Harness::connected(2200).await;
    let transport = h.connector.last_transport();

    h.connector.message(response_done("resp_1", 500));
    let snapshot = h.wait_for(|s| s.state == ConnectionState::Error).await;
    assert_eq!(snapshot.error, Some(SessionError::TokensExhausted));
    assert_eq!(snapshot.token_balance, 0);
    assert!(!snapshot.can_connect);

    let deductions = h.backend.state().deductions.clone();
    assert_eq!(deductions.len(), 2);
    assert_eq!(deductions[0].usage.total_tokens, 500);
    assert!(deductions[1].session_id.starts_with("cleanup_"));
    assert_eq!(deductions[1].usage.total_tokens, 1700);
    assert_eq!(h.backend.state().balance, 0);
    assert!(transport.is_closed());

    // Nothing from the dead connection is processed any more
    h.connector.message(user_item("late", "are you there?"));
    h.connector.message(response_done("resp_2", 100));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(h.backend.state().saved.is_empty());
    assert_eq!(h.backend.state().deductions.len(), 2);
    assert_eq!(h.controller.snapshot().state, ConnectionState::Error);
}

#[tokio::test(start_paused = true)]
async fn completed_items_are_saved_once() {
    let h = Harness::connected(5000).await;
    h.wait_for(|s| s.session_id.is_some()).await;

    h.connector.message(user_item("item_1", "  hello there "));
    h.connector.message(user_item("item_1", "hello there"));
    h.connector.message(json!({
        "type": "conversation.item.done",
        "item": {
            "id": "item_2",
            "role": "assistant",
            "content": [{ "type": "output_audio", "transcript": "Hi! How can I help?" }]
        }
    }));

    eventually(|| h.backend.state().saved.len() == 2).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let saved = h.backend.state().saved.clone();
    assert_eq!(saved.len(), 2);
    assert_eq!(saved[0].message_type, MessageRole::User);
    assert_eq!(saved[0].content, "hello there");
    assert_eq!(saved[0].session_id, Some(901));
    assert_eq!(saved[1].message_type, MessageRole::Assistant);
    assert_eq!(saved[1].content, "Hi! How can I help?");
}

#[tokio::test(start_paused = true)]
async fn item_ids_are_remembered_even_without_a_transcript() {
    let h = Harness::connected(5000).await;

    h.connector.message(json!({
        "type": "conversation.item.done",
        "item": {
            "id": "item_7",
            "role": "assistant",
            "content": [{ "type": "output_audio" }]
        }
    }));
    h.connector.message(json!({
        "type": "conversation.item.done",
        "item": {
            "id": "item_7",
            "role": "assistant",
            "content": [{ "type": "output_audio", "transcript": "late transcript" }]
        }
    }));
    h.connector.message(user_item("item_8", "still saved"));

    eventually(|| h.backend.state().saved.len() == 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let saved = h.backend.state().saved.clone();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].content, "still saved");
}

#[tokio::test(start_paused = true)]
async fn provider_errors_are_reported_without_ending_the_session() {
    let h = Harness::connected(5000).await;

    h.connector.message(json!({
        "type": "error",
        "error": { "type": "invalid_request_error", "message": "Unknown parameter" }
    }));
    let snapshot = h.wait_for(|s| s.error.is_some()).await;
    assert_eq!(
        snapshot.error,
        Some(SessionError::ServerReportedError("Unknown parameter".to_string()))
    );
    assert!(snapshot.state.is_connected());

    // Garbage and unknown events are ignored
    h.connector.emit(TransportEvent::Message("{not json".to_string()));
    h.connector.message(json!({ "type": "rate_limits.updated" }));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.controller.snapshot().state.is_connected());
}

#[tokio::test(start_paused = true)]
async fn remote_audio_applies_the_routing_hint() {
    let h = Harness::connected(5000).await;

    h.connector.emit(TransportEvent::RemoteAudio);
    eventually(|| h.routing.applied.load(Ordering::SeqCst) == 1).await;
}

#[tokio::test(start_paused = true)]
async fn lost_connection_backs_off_then_gives_up() {
    let h = Harness::connected(5000).await;
    h.connector.set_failing(true);

    let lost_at = tokio::time::Instant::now();
    h.connector.emit(TransportEvent::PeerState(PeerState::Failed));

    let snapshot = h.wait_for(|s| s.state == ConnectionState::Reconnecting).await;
    assert_eq!(snapshot.reconnect_attempts, 1);

    let snapshot = h.wait_for(|s| s.state == ConnectionState::Error).await;
    assert_eq!(snapshot.error, Some(SessionError::MaxRetriesExceeded { attempts: 3 }));

    let times = h.connector.open_times.lock().unwrap().clone();
    assert_eq!(times.len(), 4, "initial connect plus three retries");

    let close_to = |actual: Duration, expected: u64| {
        let expected = Duration::from_secs(expected);
        actual >= expected && actual < expected + Duration::from_millis(100)
    };
    assert!(close_to(times[1] - lost_at, 1), "first retry after {:?}", times[1] - lost_at);
    assert!(close_to(times[2] - times[1], 2), "second gap {:?}", times[2] - times[1]);
    assert!(close_to(times[3] - times[2], 4), "third gap {:?}", times[3] - times[2]);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.connector.opens(), 4);
}

#[tokio::test(start_paused = true)]
async fn reopening_the_channel_resets_attempts() {
    let h = Harness::connected(5000).await;
    let first = h.connector.last_transport();

    h.connector.emit(TransportEvent::PeerState(PeerState::Disconnected));
    h.wait_for(|s| s.state == ConnectionState::Reconnecting).await;
    assert!(first.is_closed());

    let snapshot = h.wait_for(|s| s.state.is_connected()).await;
    assert_eq!(snapshot.reconnect_attempts, 0);
    assert_eq!(h.connector.opens(), 2);

    // The voice session survives the reconnect and the mic is reused
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.backend.state().sessions_created, 1);
    assert_eq!(h.capture.opens.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn disconnect_cancels_a_pending_retry() {
    let h = Harness::connected(5000).await;
    h.connector.set_failing(true);

    h.connector.emit(TransportEvent::PeerState(PeerState::Failed));
    h.wait_for(|s| s.state == ConnectionState::Reconnecting).await;

    h.controller.disconnect().await;
    let snapshot = h.controller.snapshot();
    assert_eq!(snapshot.state, ConnectionState::Idle);
    assert_eq!(snapshot.reconnect_attempts, 0);
    assert!(snapshot.user_id.is_none());
    assert!(snapshot.session_id.is_none());

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.connector.opens(), 1);
    assert_eq!(h.controller.snapshot().state, ConnectionState::Idle);

    let handle = h.capture.last_handle().unwrap();
    assert!(!handle.is_active());
    assert!(h.media.current().is_none());
}

#[tokio::test(start_paused = true)]
async fn disconnect_is_safe_from_any_state() {
    let h = Harness::new(5000);
    h.controller.disconnect().await;
    h.controller.disconnect().await;
    assert_eq!(h.controller.snapshot().state, ConnectionState::Idle);

    h.controller.connect(USER, None).await.unwrap();
    h.wait_for(|s| s.state.is_connected()).await;
    let transport = h.connector.last_transport();
    let stale_sink = h.connector.last_sink().unwrap();

    h.controller.disconnect().await;
    assert!(transport.is_closed());
    assert!(h.output.clears.load(Ordering::SeqCst) >= 1);

    // Events from the closed connection cannot revive it
    stale_sink(TransportEvent::ChannelOpen);
    stale_sink(TransportEvent::Message(
        json!({ "type": "response.audio.delta" }).to_string(),
    ));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.controller.snapshot().state, ConnectionState::Idle);

    // Reconnecting afterwards starts a fresh session
    h.controller.connect(USER, None).await.unwrap();
    h.wait_for(|s| s.state.is_connected()).await;
    assert_eq!(h.connector.opens(), 2);
}

#[tokio::test(start_paused = true)]
async fn speaking_over_the_assistant_cancels_the_response() {
    let h = Harness::connected(5000).await;
    let transport = h.connector.last_transport();

    h.connector.message(json!({ "type": "response.created" }));
    h.connector.message(json!({ "type": "response.audio.delta" }));
    h.wait_for(|s| s.state == ConnectionState::Speaking).await;

    let voice = speak(&h);
    h.wait_for(|s| s.state == ConnectionState::Listening).await;
    assert_eq!(transport.cancels(), 1);

    let output = h.output.as_ref();
    assert!(talkback_client::media::AudioOutput::is_paused(output));
    assert_eq!(talkback_client::media::AudioOutput::volume(output), 1.0);
    let volumes = output.volumes.lock().unwrap().clone();
    assert!(volumes.len() >= 2, "expected a fade, got {volumes:?}");
    assert!(volumes[0] < 1.0);

    // Continued speech is one utterance, not a stream of cancels
    tokio::time::sleep(Duration::from_millis(500)).await;
    voice.abort();
    assert_eq!(transport.cancels(), 1);
}

#[tokio::test(start_paused = true)]
async fn talking_through_a_response_interrupts_once_audio_arrives() {
    let h = Harness::connected(5000).await;
    let transport = h.connector.last_transport();

    h.connector.message(json!({ "type": "response.created" }));
    h.wait_for(|s| s.state == ConnectionState::Thinking).await;

    // The user starts talking before any assistant audio
    let voice = speak(&h);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(transport.cancels(), 0);

    h.connector.message(json!({ "type": "response.audio.delta" }));
    h.wait_for(|s| s.state == ConnectionState::Listening).await;
    assert_eq!(transport.cancels(), 1);

    // Trailing audio of the cancelled response is not cancelled again
    h.connector.message(json!({ "type": "response.audio.delta" }));
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(transport.cancels(), 1);

    // A new response is fair game
    h.connector.message(json!({ "type": "response.created" }));
    h.connector.message(json!({ "type": "response.audio.delta" }));
    eventually(|| transport.cancels() == 2).await;
    voice.abort();
}

#[tokio::test(start_paused = true)]
async fn speech_while_not_speaking_sends_nothing() {
    let h = Harness::connected(5000).await;
    let transport = h.connector.last_transport();

    let voice = speak(&h);
    tokio::time::sleep(Duration::from_millis(500)).await;
    voice.abort();

    assert_eq!(transport.cancels(), 0);
    assert_eq!(h.controller.snapshot().state, ConnectionState::Connected);
    assert!(h.output.volumes.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn going_offline_fails_fast_and_online_resumes() {
    let h = Harness::connected(5000).await;
    let transport = h.connector.last_transport();

    h.controller.network_changed(false).await;
    let snapshot = h.controller.snapshot();
    assert_eq!(snapshot.state, ConnectionState::Error);
    assert_eq!(snapshot.error, Some(SessionError::ConnectivityLost));
    assert!(!snapshot.is_online);
    assert!(transport.is_closed());

    // No backoff while offline
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.connector.opens(), 1);

    h.controller.network_changed(true).await;
    h.wait_for(|s| s.state == ConnectionState::Reconnecting).await;
    let snapshot = h.wait_for(|s| s.state.is_connected()).await;
    assert!(snapshot.is_online);
    assert!(snapshot.error.is_none());
    assert_eq!(h.connector.opens(), 2);
}

#[tokio::test(start_paused = true)]
async fn going_offline_mid_connect_fails_the_connect() {
    let h = Harness::new(5000);
    *h.connector.latency.lock().unwrap() = Duration::from_secs(2);

    let (result, ()) = tokio::join!(h.controller.connect(USER, None), async {
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(h.controller.snapshot().state, ConnectionState::Connecting);
        h.controller.network_changed(false).await;
    });

    assert_eq!(result, Err(SessionError::ConnectivityLost));
    assert_eq!(h.controller.snapshot().state, ConnectionState::Error);
    assert!(h.connector.last_transport().is_closed());
}

#[tokio::test(start_paused = true)]
async fn disconnect_mid_connect_is_not_an_error() {
    let h = Harness::new(5000);
    *h.connector.latency.lock().unwrap() = Duration::from_secs(2);

    let (result, ()) = tokio::join!(h.controller.connect(USER, None), async {
        tokio::time::sleep(Duration::from_millis(500)).await;
        h.controller.disconnect().await;
    });

    assert_eq!(result, Ok(()));
    assert_eq!(h.controller.snapshot().state, ConnectionState::Idle);
    assert!(h.connector.last_transport().is_closed());
}

#[tokio::test(start_paused = true)]
async fn offline_connect_is_refused() {
    let h = Harness::new(5000);
    h.controller.network_changed(false).await;

    let err = h.controller.connect(USER, None).await.unwrap_err();
    assert_eq!(err, SessionError::ConnectivityLost);
    assert_eq!(h.connector.opens(), 0);
}

#[tokio::test(start_paused = true)]
async fn update_token_balance_publishes_eligibility() {
    let h = Harness::new(2500);

    let check = h.controller.update_token_balance(USER).await;
    assert_eq!(check.balance, 2500);
    assert!(check.can_proceed);
    assert!(h.controller.snapshot().can_connect);

    h.backend.state().balance = 2000;
    let check = h.controller.update_token_balance(USER).await;
    assert!(!check.can_proceed);
    assert!(!h.controller.snapshot().can_connect);
}

#[tokio::test(start_paused = true)]
async fn disposed_controller_refuses_to_connect() {
    let h = Harness::connected(5000).await;

    h.controller.dispose().await;
    h.controller.dispose().await;
    assert_eq!(h.controller.snapshot().state, ConnectionState::Idle);

    let err = h.controller.connect(USER, None).await.unwrap_err();
    assert!(matches!(err, SessionError::Transport(_)));
}
