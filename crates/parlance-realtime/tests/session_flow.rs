//! Scripted end-to-end sessions: the client runs against channel-pair
//! doubles for the service, microphone and speaker.

mod support;

use parlance_realtime::{
    ClientConfig, ClientError, ClientEvent, Role, SessionContext, SessionState, VoiceClient,
    VoiceInteraction, audio,
};
use parlance_realtime_types::protocol::ClientEnvelope;
use std::time::Duration;

use support::{CountingSink, EventLog, ScriptedMic, ScriptedTransport, settle, test_config};

#[tokio::test(start_paused = true)]
async fn empty_credential_fails_before_any_network() {
    support::init_tracing();
    let transport = ScriptedTransport::ready();
    let client = VoiceClient::with_transport(
        ClientConfig::new("   "),
        transport.clone(),
        ScriptedMic::granted(),
        CountingSink::new(),
    );
    let events = EventLog::attach(&client);

    let err = client.connect(SessionContext::default()).await.unwrap_err();
    assert!(matches!(err, ClientError::Configuration(_)));
    assert_eq!(transport.opens(), 0);
    assert_eq!(client.session_state(), SessionState::Disconnected);
    assert_eq!(events.fatal_errors(), 1);
}

#[tokio::test(start_paused = true)]
async fn recording_before_connect_is_rejected() {
    support::init_tracing();
    let transport = ScriptedTransport::ready();
    let mic = ScriptedMic::granted();
    let client = VoiceClient::with_transport(
        test_config(),
        transport.clone(),
        mic.clone(),
        CountingSink::new(),
    );

    let err = client.start_recording().await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::InvalidState {
            op: "start_recording",
            state: SessionState::Disconnected,
        }
    ));
    // The microphone was never touched, so no frames exist to leak out.
    assert_eq!(mic.opens(), 0);
    assert_eq!(transport.opens(), 0);
}

#[tokio::test(start_paused = true)]
async fn full_turn_round_trip() -> anyhow::Result<()> {
    support::init_tracing();
    let transport = ScriptedTransport::ready();
    let mic = ScriptedMic::granted();
    let sink = CountingSink::new();
    let client =
        VoiceClient::with_transport(test_config(), transport.clone(), mic.clone(), sink.clone());
    let events = EventLog::attach(&client);

    client.connect(SessionContext::default()).await?;
    assert!(client.state().is_connected);
    assert_eq!(events.connected(), 1);

    let mut link = transport.take_link();
    assert!(matches!(
        link.expect_envelope().await,
        ClientEnvelope::Setup(_)
    ));

    client.start_recording().await?;
    assert_eq!(client.session_state(), SessionState::Listening);
    assert!(client.state().is_recording);

    // Two full 20ms windows at 16kHz plus half a window; the remainder is
    // padded to a third window on stop.
    mic.feed(vec![0.2; 320], 0).await;
    mic.feed(vec![0.2; 320], 1).await;
    mic.feed(vec![0.2; 160], 2).await;
    client.stop_recording().await?;
    assert_eq!(client.session_state(), SessionState::Processing);
    assert!(client.state().is_loading);

    let (windows, message_id) = link.drain_user_turn().await;
    assert_eq!(windows, 3);

    link.send_json(r#"{"type":"turn_complete"}"#).await;
    link.send_json(&format!(
        r#"{{"type":"text","role":"user","text":"a table for two please","message_id":"{message_id}"}}"#
    ))
    .await;

    // 100ms of response audio in two chunks, then the transcript and the end
    // of the response.
    let data = audio::encode_pcm16(&vec![0.3; 1_600]);
    link.send_json(&format!(
        r#"{{"type":"audio","format":"audio/pcm;rate=16000","data":"{data}","seq":0}}"#
    ))
    .await;
    settle("speaking", || {
        client.session_state() == SessionState::Speaking
    })
    .await;
    link.send_json(&format!(
        r#"{{"type":"audio","format":"audio/pcm;rate=16000","data":"{data}","seq":1}}"#
    ))
    .await;
    link.send_json(r#"{"type":"text","role":"assistant","text":"Of course, right this way."}"#)
        .await;
    link.send_json(r#"{"type":"response_complete"}"#).await;

    settle("idle after the turn", || {
        client.session_state() == SessionState::Connected
    })
    .await;
    settle("playback drained", || sink.plays() == 2).await;

    let history = client.history();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].role, Role::User);
    assert_eq!(history[0].text, "a table for two please");
    assert!(!history[0].pending_transcript);
    assert_eq!(history[1].role, Role::Assistant);
    assert_eq!(history[1].text, "Of course, right this way.");

    let stats = client.session_stats();
    assert_eq!(stats.chunks_sent, 3);
    assert_eq!(stats.chunks_received, 2);
    assert_eq!(stats.turns_completed, 1);
    assert_eq!(stats.messages, 2);
    assert!(stats.peak_input_level > 0.0);

    assert!(events.saw_interaction(VoiceInteraction::UserSpeechStarted));
    assert!(events.saw_interaction(VoiceInteraction::UserSpeechEnded));
    assert!(events.saw_interaction(VoiceInteraction::AssistantSpeechStarted));
    assert!(events.saw_interaction(VoiceInteraction::AssistantSpeechEnded));
    assert!(events.count(|e| matches!(e, ClientEvent::SessionStatsUpdate(_))) >= 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn refused_turn_end_leaves_the_turn_open_for_retry() {
    support::init_tracing();
    let transport = ScriptedTransport::ready();
    let mic = ScriptedMic::granted();
    let mut config = test_config();
    // One outbound slot: the setup frame fills it until the service reads it.
    config.send_queue_capacity = 1;
    let client = VoiceClient::with_transport(
        config,
        transport.clone(),
        mic.clone(),
        CountingSink::new(),
    );

    client.connect(SessionContext::default()).await.expect("connect");
    client.start_recording().await.expect("record");

    let err = client.stop_recording().await.unwrap_err();
    assert!(matches!(err, ClientError::Backpressure));
    // The turn was not committed: still listening, nothing in history.
    assert_eq!(client.session_state(), SessionState::Listening);
    assert!(client.history().is_empty());

    // Once the service catches up the same call goes through.
    let mut link = transport.take_link();
    assert!(matches!(
        link.expect_envelope().await,
        ClientEnvelope::Setup(_)
    ));
    client.stop_recording().await.expect("retry");
    assert_eq!(client.session_state(), SessionState::Processing);

    let history = client.history();
    assert_eq!(history.len(), 1);
    match link.expect_envelope().await {
        ClientEnvelope::TurnEnd(turn) => assert_eq!(turn.message_id, history[0].id),
        other => panic!("expected turn_end, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn barge_in_flushes_playback_and_listens() {
    support::init_tracing();
    let transport = ScriptedTransport::ready();
    let mic = ScriptedMic::granted();
    let sink = CountingSink::new();
    let client =
        VoiceClient::with_transport(test_config(), transport.clone(), mic.clone(), sink.clone());
    let events = EventLog::attach(&client);

    client.connect(SessionContext::default()).await.expect("connect");
    let mut link = transport.take_link();
    link.expect_envelope().await;

    client.start_recording().await.expect("record");
    mic.feed(vec![0.2; 320], 0).await;
    client.stop_recording().await.expect("stop");
    link.drain_user_turn().await;

    // A full second of assistant audio; the user interrupts mid-sentence.
    let data = audio::encode_pcm16(&vec![0.3; 16_000]);
    link.send_json(&format!(
        r#"{{"type":"audio","format":"audio/pcm;rate=16000","data":"{data}","seq":0}}"#
    ))
    .await;
    link.send_json(&format!(
        r#"{{"type":"audio","format":"audio/pcm;rate=16000","data":"{data}","seq":1}}"#
    ))
    .await;
    settle("speaking", || {
        client.session_state() == SessionState::Speaking
    })
    .await;

    client.start_recording().await.expect("barge in");
    assert_eq!(client.session_state(), SessionState::Listening);
    assert!(events.saw_interaction(VoiceInteraction::Interrupted));
    assert!(sink.cancels() >= 1);

    // The interrupted assistant turn still became a history entry.
    let history = client.history();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].role, Role::Assistant);

    // A late completion from the service does not pull the session out of
    // the new user turn.
    link.send_json(r#"{"type":"response_complete"}"#).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(client.session_state(), SessionState::Listening);
    assert_eq!(client.history().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn denied_microphone_leaves_the_session_connected() {
    support::init_tracing();
    let transport = ScriptedTransport::ready();
    let client = VoiceClient::with_transport(
        test_config(),
        transport.clone(),
        ScriptedMic::denied(),
        CountingSink::new(),
    );
    let events = EventLog::attach(&client);

    client.connect(SessionContext::default()).await.expect("connect");
    let err = client.start_recording().await.unwrap_err();
    assert!(matches!(err, ClientError::Permission(_)));
    assert_eq!(client.session_state(), SessionState::Connected);
    assert_eq!(
        events.count(|e| matches!(
            e,
            ClientEvent::Error {
                error: ClientError::Permission(_),
                fatal: false,
            }
        )),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn device_failure_mid_recording_keeps_the_connection() {
    support::init_tracing();
    let transport = ScriptedTransport::ready();
    let mic = ScriptedMic::granted();
    let client = VoiceClient::with_transport(
        test_config(),
        transport.clone(),
        mic.clone(),
        CountingSink::new(),
    );
    let events = EventLog::attach(&client);

    client.connect(SessionContext::default()).await.expect("connect");
    let mut link = transport.take_link();
    link.expect_envelope().await;

    client.start_recording().await.expect("record");
    mic.feed(vec![0.2; 320], 0).await;
    mic.fail();

    settle("fallback to idle", || {
        client.session_state() == SessionState::Connected
    })
    .await;
    assert!(client.connection_status().connected);
    assert!(!client.state().is_recording);
    assert!(
        events.count(|e| matches!(
            e,
            ClientEvent::Error {
                error: ClientError::Device(_),
                fatal: false,
            }
        )) >= 1
    );
}

#[tokio::test(start_paused = true)]
async fn disconnect_is_idempotent() {
    support::init_tracing();
    let transport = ScriptedTransport::ready();
    let client = VoiceClient::with_transport(
        test_config(),
        transport.clone(),
        ScriptedMic::granted(),
        CountingSink::new(),
    );
    let events = EventLog::attach(&client);

    client.connect(SessionContext::default()).await.expect("connect");
    client.disconnect().await;
    client.disconnect().await;

    assert_eq!(client.session_state(), SessionState::Disconnected);
    assert_eq!(events.disconnected(), 1);
    assert!(client.history().is_empty());
    assert!(!client.connection_status().connected);
}
