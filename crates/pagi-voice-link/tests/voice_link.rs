mod common;

use common::{created, delta, done, ConstantFeed, Harness};
use pagi_voice_link::{PeerEvent, SessionState, VoiceLinkError};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn connect_reaches_listening_and_configures_remote_session() {
    let h = Harness::new();
    h.link.connect(true).await.expect("connect");
    assert_eq!(h.link.state(), SessionState::Connecting);
    assert_eq!(h.peer.answer.lock().unwrap().as_deref(), Some("v=0 answer"));
    assert_eq!(h.pool.active_leases(), 1);

    h.peer.emit(PeerEvent::ChannelOpen);
    h.settle().await;
    assert_eq!(h.link.state(), SessionState::Connecting);

    h.peer.emit(PeerEvent::RemoteMedia {
        feed: Box::new(ConstantFeed(0)),
    });
    h.wait_for(SessionState::Listening).await;

    assert_eq!(h.peer.sent_types(), vec!["session.update"]);
    let update = &h.peer.sent_events()[0];
    assert_eq!(update["session"]["voice"], "alloy");
    assert_eq!(
        *h.observer.states.lock().unwrap(),
        vec![
            SessionState::Connecting,
            SessionState::Connected,
            SessionState::Listening
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn concurrent_connects_create_one_transport() {
    let h = Harness::new();
    let (a, b) = tokio::join!(h.link.connect(false), h.link.connect(false));
    assert!(a.is_ok());
    assert!(b.is_ok());
    h.settle().await;

    assert_eq!(h.issuer.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.peer.creates.load(Ordering::SeqCst), 1);
    assert_eq!(h.microphone.opens.load(Ordering::SeqCst), 1);

    h.link.connect(false).await.expect("connect while live is a no-op");
    assert_eq!(h.peer.creates.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn disconnect_is_idempotent_and_releases_everything() {
    let h = Harness::new();
    h.link.disconnect().await;
    assert_eq!(h.link.state(), SessionState::Disconnected);

    h.connect_live().await;
    h.link.disconnect().await;
    h.link.disconnect().await;
    h.settle().await;

    assert_eq!(h.link.state(), SessionState::Disconnected);
    assert!(!h.pool.is_open());
    assert_eq!(h.microphone.stops.load(Ordering::SeqCst), 1);
    assert_eq!(h.peer.closes.load(Ordering::SeqCst), 1);
    let levels = *h.link.subscribe_levels().borrow();
    assert_eq!(levels.local, 0.0);
    assert_eq!(levels.remote, 0.0);

    // a fresh session can follow
    h.connect_live().await;
    assert_eq!(h.peer.creates.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn disconnect_during_handshake_abandons_the_attempt() {
    let h = Harness::new();
    h.relay.hold.store(true, Ordering::SeqCst);

    let link = h.link.clone();
    let pending = tokio::spawn(async move { link.connect(false).await });
    h.settle().await;
    assert_eq!(h.relay.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.link.state(), SessionState::Connecting);

    h.link.disconnect().await;
    let outcome = pending.await.expect("connect task");
    assert!(outcome.is_ok(), "abandoned connect resolves Ok, got {outcome:?}");

    h.relay.release.notify_one();
    h.settle().await;
    assert_eq!(h.link.state(), SessionState::Disconnected);
    assert!(!h.pool.is_open());
    assert_eq!(h.peer.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn credential_rejection_is_an_authentication_error() {
    let h = Harness::new();
    h.issuer.reject.store(true, Ordering::SeqCst);

    let err = h.link.connect(false).await.unwrap_err();
    assert!(matches!(err, VoiceLinkError::Authentication(_)), "{err:?}");
    assert_eq!(h.link.state(), SessionState::Disconnected);
    assert_eq!(h.microphone.opens.load(Ordering::SeqCst), 0);
    assert_eq!(h.peer.creates.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn microphone_denial_is_a_permission_error() {
    let h = Harness::new();
    h.microphone.deny.store(true, Ordering::SeqCst);

    let err = h.link.connect(false).await.unwrap_err();
    assert!(matches!(err, VoiceLinkError::Permission(_)), "{err:?}");
    assert_eq!(h.link.state(), SessionState::Disconnected);
    assert_eq!(h.peer.creates.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn relay_failure_is_a_transport_error_and_releases_resources() {
    let h = Harness::new();
    h.relay.fail.store(true, Ordering::SeqCst);

    let err = h.link.connect(false).await.unwrap_err();
    assert!(matches!(err, VoiceLinkError::Transport(_)), "{err:?}");
    h.settle().await;
    assert_eq!(h.link.state(), SessionState::Disconnected);
    assert!(!h.pool.is_open());
    assert_eq!(h.peer.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn streamed_answer_is_delivered_once() {
    let h = Harness::new();
    h.connect_live().await;

    h.peer.message(created("resp_1"));
    h.peer.message(delta("resp_1", "Hello ther"));
    h.wait_for(SessionState::Speaking).await;
    h.peer.message(delta("resp_1", "Hello there, how can I help you today?"));
    h.peer.message(done("resp_1", "completed", None));
    h.wait_for(SessionState::Listening).await;

    // the same finalize again, e.g. replayed by the remote peer
    h.peer.message(done("resp_1", "completed", Some("Hello there, how can I help you today?")));
    h.settle().await;

    assert_eq!(h.observer.answer_texts(), vec!["Hello there, how can I help you today?"]);
    let answer = h.observer.answers.lock().unwrap()[0].clone();
    assert!(answer.complete);
    assert_eq!(answer.retries, 0);
    assert_eq!(answer.response_id.as_deref(), Some("resp_1"));
}

#[tokio::test(start_paused = true)]
async fn dangling_answer_is_continued_and_merged() {
    let h = Harness::new();
    h.connect_live().await;

    h.peer.message(created("resp_1"));
    h.peer.message(delta("resp_1", "I'd suggest taking the train and"));
    h.peer.message(done("resp_1", "completed", None));
    h.settle().await;
    assert!(h.observer.answers.lock().unwrap().is_empty());
    assert!(h.peer.sent_types().is_empty(), "continuation waits for the cooldown");

    tokio::time::sleep(Duration::from_millis(900)).await;
    assert_eq!(h.peer.sent_types(), vec!["conversation.item.create", "response.create"]);
    let prompt = h.peer.sent_events()[0]["item"]["content"][0]["text"]
        .as_str()
        .unwrap_or_default()
        .to_string();
    assert!(prompt.contains("taking the train and"), "{prompt}");

    h.peer.message(created("resp_2"));
    h.peer.message(delta("resp_2", "then a short walk."));
    h.peer.message(done("resp_2", "completed", None));
    h.wait_for(SessionState::Listening).await;

    let answers = h.observer.answers.lock().unwrap().clone();
    assert_eq!(answers.len(), 1);
    assert_eq!(answers[0].text, "I'd suggest taking the train and then a short walk.");
    assert_eq!(answers[0].retries, 1);
    assert_eq!(answers[0].response_id.as_deref(), Some("resp_2"));
}

#[tokio::test(start_paused = true)]
async fn cancelled_answer_is_never_delivered() {
    let h = Harness::new();
    h.connect_live().await;

    h.peer.message(created("resp_1"));
    h.peer.message(delta("resp_1", "Let me think about"));
    h.wait_for(SessionState::Speaking).await;
    h.peer.message(json!({"type": "response.cancelled", "response_id": "resp_1"}));
    h.wait_for(SessionState::Listening).await;

    h.peer.message(done("resp_1", "cancelled", Some("Let me think about")));
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert!(h.observer.answers.lock().unwrap().is_empty());
    assert!(h.peer.sent_types().is_empty(), "no continuation for a cancelled answer");
}

#[tokio::test(start_paused = true)]
async fn send_text_only_reaches_a_live_conversation() {
    let h = Harness::new();
    h.link.send_text("hello?").expect("queued");
    h.settle().await;
    assert!(h.peer.sent_types().is_empty());

    h.connect_live().await;
    h.link.send_text("What's the weather like?").expect("queued");
    h.settle().await;

    assert_eq!(h.peer.sent_types(), vec!["conversation.item.create", "response.create"]);
    let item = &h.peer.sent_events()[0]["item"];
    assert_eq!(item["role"], "user");
    assert_eq!(item["content"][0]["text"], "What's the weather like?");
}

#[tokio::test(start_paused = true)]
async fn interrupt_cancels_and_returns_to_listening() {
    let h = Harness::new();
    h.connect_live().await;

    h.peer.message(created("resp_1"));
    h.peer.message(delta("resp_1", "Once upon a time there was"));
    h.wait_for(SessionState::Speaking).await;

    h.link.interrupt().expect("queued");
    h.wait_for(SessionState::Listening).await;
    assert_eq!(h.peer.sent_types(), vec!["response.cancel"]);

    // the late finalize of the interrupted response is ignored
    h.peer.message(done("resp_1", "completed", Some("Once upon a time there was a king.")));
    h.settle().await;
    assert!(h.observer.answers.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn user_transcripts_are_forwarded() {
    let h = Harness::new();
    h.connect_live().await;

    h.peer.message(json!({
        "type": "conversation.item.input_audio_transcription.completed",
        "item_id": "item_7",
        "transcript": "  book a table for two  "
    }));
    h.peer.message(json!({"type": "conversation.item.input_audio_transcription.completed", "transcript": "   "}));
    h.settle().await;

    let transcripts = h.observer.transcripts.lock().unwrap().clone();
    assert_eq!(transcripts.len(), 1);
    assert_eq!(transcripts[0].text, "book a table for two");
    assert_eq!(transcripts[0].item_id.as_deref(), Some("item_7"));
}

#[tokio::test(start_paused = true)]
async fn malformed_and_unknown_messages_are_dropped() {
    let h = Harness::new();
    h.connect_live().await;

    h.peer.emit(PeerEvent::ChannelMessage("{not json".to_string()));
    h.peer.message(json!({"no_type": true}));
    h.peer.message(json!({"type": "response.content_part.added"}));
    h.peer.message(json!({"type": "error", "error": {"code": "rate_limited", "message": "slow down"}}));
    h.settle().await;

    assert_eq!(h.link.state(), SessionState::Listening);
}

#[tokio::test(start_paused = true)]
async fn fatal_error_code_disconnects() {
    let h = Harness::new();
    h.connect_live().await;

    h.peer.message(json!({
        "type": "error",
        "error": {"type": "invalid_request_error", "code": "session_expired", "message": "Session expired"}
    }));
    h.wait_for(SessionState::Disconnected).await;
    h.settle().await;
    assert!(!h.pool.is_open());
    assert_eq!(h.peer.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn peer_failure_disconnects() {
    let h = Harness::new();
    h.connect_live().await;

    h.peer.emit(PeerEvent::Failed("ice failed".to_string()));
    h.wait_for(SessionState::Disconnected).await;
    assert_eq!(h.observer.idle_disconnects.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn idle_session_is_disconnected_once() {
    let h = Harness::new();
    h.connect_live().await;

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.link.state(), SessionState::Listening);

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(h.link.state(), SessionState::Disconnected);
    assert_eq!(h.observer.idle_disconnects.load(Ordering::SeqCst), 1);
    assert!(!h.pool.is_open());

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.observer.idle_disconnects.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn sustained_local_speech_restarts_the_idle_window() {
    let h = Harness::new();
    h.connect_live().await;

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.link.state(), SessionState::Listening);

    // about a second of loud broadband audio from the microphone
    let mut seed = 0x2545_f491_u32;
    for _ in 0..24 {
        let samples = (0..512)
            .map(|_| {
                seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                (seed >> 8) as f32 / (1u32 << 24) as f32 * 1.6 - 0.8
            })
            .collect();
        h.microphone_chunk(samples);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    h.microphone_chunk(vec![0.0; 512]);

    // past the original 15 s window, still connected
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(h.link.state(), SessionState::Listening);
    assert_eq!(h.observer.idle_disconnects.load(Ordering::SeqCst), 0);

    tokio::time::sleep(Duration::from_secs(12)).await;
    assert_eq!(h.link.state(), SessionState::Disconnected);
    assert_eq!(h.observer.idle_disconnects.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn idle_clock_holds_while_an_answer_streams() {
    let h = Harness::new();
    h.connect_live().await;

    h.peer.message(created("resp_1"));
    h.peer.message(delta("resp_1", "There are several ways to get there"));
    h.wait_for(SessionState::Speaking).await;

    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(h.link.state(), SessionState::Speaking);
    assert_eq!(h.observer.idle_disconnects.load(Ordering::SeqCst), 0);

    // finishing the answer restarts the full idle window
    h.peer.message(delta("resp_1", "There are several ways to get there."));
    h.peer.message(done("resp_1", "completed", None));
    h.wait_for(SessionState::Listening).await;
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.link.state(), SessionState::Listening);
}

#[tokio::test(start_paused = true)]
async fn stuck_answer_is_abandoned_by_the_watchdog() {
    let h = Harness::new();
    h.connect_live().await;

    h.peer.message(created("resp_1"));
    h.peer.message(delta("resp_1", "Hmm"));
    h.wait_for(SessionState::Speaking).await;

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(h.link.state(), SessionState::Listening);

    h.peer.message(done("resp_1", "completed", Some("Hmm, well.")));
    h.settle().await;
    assert!(h.observer.answers.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_the_driver() {
    let h = Harness::new();
    h.connect_live().await;

    h.link.shutdown().await;
    assert_eq!(h.link.state(), SessionState::Disconnected);
    assert!(matches!(h.link.send_text("anyone?"), Err(VoiceLinkError::ChannelClosed)));
    assert!(matches!(h.link.connect(false).await, Err(VoiceLinkError::ChannelClosed)));
}
