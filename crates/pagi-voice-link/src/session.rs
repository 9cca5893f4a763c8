//! Event protocol handler: the session state machine.
//!
//! Consumes transport milestones and inbound channel events, drives the session state and
//! delegates answer accounting to the [`ResponseEngine`]. Like the engine it performs no I/O;
//! every call returns the [`SessionEffect`]s the driver must carry out, in order.
//!
//! ```text
//! disconnected ─connect─▶ connecting ─media─▶ connected ─channel open─▶ listening ⇄ speaking
//!       ▲                                                                    │
//!       └──────────── disconnect / fatal protocol error / idle expiry ───────┘
//! ```

use crate::config::{SessionConfig, VoiceLinkConfig};
use crate::engine::{Answer, EngineAction, ResponseEngine};
use crate::protocol::{InboundEvent, InboundMessage, OutboundEvent};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Listening,
    Speaking,
}

impl SessionState {
    /// Transport is up (media flowing).
    pub fn is_live(self) -> bool {
        matches!(
            self,
            SessionState::Connected | SessionState::Listening | SessionState::Speaking
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Listening => "listening",
            SessionState::Speaking => "speaking",
        };
        f.write_str(name)
    }
}

/// Why a session was torn down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    Requested,
    IdleTimeout,
    /// Inbound error event with a fatal code.
    ProtocolError(String),
    /// The peer link failed or its channel closed.
    TransportFailure(String),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Requested => f.write_str("requested"),
            DisconnectReason::IdleTimeout => f.write_str("idle timeout"),
            DisconnectReason::ProtocolError(code) => write!(f, "protocol error ({code})"),
            DisconnectReason::TransportFailure(msg) => write!(f, "transport failure ({msg})"),
        }
    }
}

/// Finalized user speech as transcribed by the remote peer.
#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    pub text: String,
    pub item_id: Option<String>,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEffect {
    StateChanged(SessionState),
    DeliverAnswer(Answer),
    DeliverTranscript(Transcript),
    Send(OutboundEvent),
    /// Positively confirmed user speech; resets the idle clock.
    UserSpeechConfirmed,
    /// A logical answer is over; resets the idle clock.
    AnswerEnded,
    /// The session must be torn down.
    Disconnect(DisconnectReason),
}

pub struct SessionMachine {
    state: SessionState,
    engine: ResponseEngine,
    session: SessionConfig,
    stuck_after: Duration,
    watchdog: Option<Instant>,
    media_seen: bool,
    channel_open: bool,
}

impl SessionMachine {
    pub fn new(config: &VoiceLinkConfig) -> Self {
        Self::with_engine(config, ResponseEngine::new(config))
    }

    pub fn with_engine(config: &VoiceLinkConfig, engine: ResponseEngine) -> Self {
        Self {
            state: SessionState::Disconnected,
            engine,
            session: config.session.clone(),
            stuck_after: config.timing.stuck_response(),
            watchdog: None,
            media_seen: false,
            channel_open: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn answer_in_progress(&self) -> bool {
        self.engine.in_progress()
    }

    pub fn engine(&self) -> &ResponseEngine {
        &self.engine
    }

    /// Every transition goes through here.
    fn set_state(&mut self, next: SessionState, effects: &mut Vec<SessionEffect>) {
        if self.state == next {
            return;
        }
        debug!(target: "pagi::voice_link::session", from = %self.state, to = %next, "State transition");
        self.state = next;
        effects.push(SessionEffect::StateChanged(next));
    }

    pub fn begin_connect(&mut self) -> Vec<SessionEffect> {
        let mut effects = Vec::new();
        if self.state == SessionState::Disconnected {
            self.media_seen = false;
            self.channel_open = false;
            self.set_state(SessionState::Connecting, &mut effects);
        }
        effects
    }

    /// First remote media frame.
    pub fn on_remote_media(&mut self) -> Vec<SessionEffect> {
        let mut effects = Vec::new();
        if self.media_seen || self.state != SessionState::Connecting {
            return effects;
        }
        self.media_seen = true;
        self.set_state(SessionState::Connected, &mut effects);
        if self.channel_open {
            self.set_state(SessionState::Listening, &mut effects);
        }
        effects
    }

    /// The ordered event channel opened. Configures the remote session.
    pub fn on_channel_open(&mut self) -> Vec<SessionEffect> {
        let mut effects = Vec::new();
        if self.channel_open || self.state == SessionState::Disconnected {
            return effects;
        }
        self.channel_open = true;
        info!(target: "pagi::voice_link::session", voice = %self.session.voice, "Event channel open");
        effects.push(SessionEffect::Send(OutboundEvent::session_update(&self.session)));
        if self.state == SessionState::Connected {
            self.set_state(SessionState::Listening, &mut effects);
        }
        effects
    }

    /// One raw channel message. Malformed messages are protocol faults and are dropped.
    pub fn on_channel_message(&mut self, text: &str, now: Instant) -> Vec<SessionEffect> {
        match InboundMessage::parse(text) {
            Ok(message) => {
                if message.event == InboundEvent::Unknown {
                    debug!(target: "pagi::voice_link::session", kind = %message.kind, "Ignoring unknown event type");
                    return Vec::new();
                }
                self.handle(message.event, now)
            }
            Err(e) => {
                warn!(target: "pagi::voice_link::session", error = %e, "Protocol fault; dropping message");
                Vec::new()
            }
        }
    }

    pub fn handle(&mut self, event: InboundEvent, now: Instant) -> Vec<SessionEffect> {
        let mut effects = Vec::new();
        if self.state == SessionState::Disconnected {
            return effects;
        }

        match event {
            InboundEvent::SessionReady {} => {
                debug!(target: "pagi::voice_link::session", "Remote session configured");
            }
            InboundEvent::UserSpeechStarted {} => {
                // barge-in: the remote peer will cut the answer short itself
                if self.engine.in_progress() {
                    self.engine.mark_interrupted();
                }
            }
            InboundEvent::UserSpeechStopped {} => {}
            InboundEvent::UserTranscript { item_id, transcript } => {
                let text = transcript.trim();
                if !text.is_empty() {
                    effects.push(SessionEffect::DeliverTranscript(Transcript {
                        text: text.to_string(),
                        item_id,
                        received_at: Utc::now(),
                    }));
                    effects.push(SessionEffect::UserSpeechConfirmed);
                }
            }
            InboundEvent::AnswerStarted { response } => {
                let actions = self.engine.on_started(response.id.as_deref(), now);
                self.apply(actions, now, &mut effects);
            }
            InboundEvent::TextDelta { response_id, delta } => {
                if self.engine.on_fragment(response_id.as_deref(), Some(&delta), now) {
                    self.enter_speaking(now, &mut effects);
                }
            }
            InboundEvent::AudioDelta { response_id } => {
                if self.engine.on_fragment(response_id.as_deref(), None, now) {
                    self.enter_speaking(now, &mut effects);
                }
            }
            InboundEvent::SegmentDone {
                response_id,
                transcript,
                text,
            } => {
                let segment = transcript.as_deref().or(text.as_deref());
                self.engine.on_segment_done(response_id.as_deref(), segment, now);
            }
            InboundEvent::AnswerFinalized { response } => {
                let text = response.text();
                let actions = self.engine.on_finalized(
                    response.id.as_deref(),
                    response.status,
                    text.as_deref(),
                    now,
                );
                self.apply(actions, now, &mut effects);
            }
            InboundEvent::AnswerCancelled { response_id } => {
                let actions = self.engine.on_cancelled(response_id.as_deref(), now);
                self.apply(actions, now, &mut effects);
            }
            InboundEvent::PlaybackStopped {} | InboundEvent::RateLimits {} | InboundEvent::Unknown => {
                debug!(target: "pagi::voice_link::session", "Dropping non-conversational event");
            }
            InboundEvent::Error { error } => {
                let code = error.code.clone().unwrap_or_default();
                if self.session.fatal_error_codes.iter().any(|c| *c == code) {
                    warn!(
                        target: "pagi::voice_link::session",
                        code = %code,
                        message = %error.message,
                        "Unrecoverable protocol error"
                    );
                    effects.push(SessionEffect::Disconnect(DisconnectReason::ProtocolError(code)));
                } else {
                    warn!(
                        target: "pagi::voice_link::session",
                        code = %code,
                        kind = ?error.kind,
                        message = %error.message,
                        "Protocol fault reported by remote peer"
                    );
                }
            }
        }
        effects
    }

    /// Typed user turn. Only meaningful once the conversation is up.
    pub fn send_text(&mut self, text: &str) -> Vec<SessionEffect> {
        if !matches!(self.state, SessionState::Listening | SessionState::Speaking) {
            warn!(target: "pagi::voice_link::session", state = %self.state, "Ignoring text turn outside a live conversation");
            return Vec::new();
        }
        vec![
            SessionEffect::Send(OutboundEvent::user_text(text)),
            SessionEffect::Send(OutboundEvent::create_response()),
        ]
    }

    /// Cancel the answer in progress.
    pub fn interrupt(&mut self, now: Instant) -> Vec<SessionEffect> {
        let mut effects = Vec::new();
        if !self.engine.in_progress() && self.state != SessionState::Speaking {
            return effects;
        }
        info!(target: "pagi::voice_link::session", "Interrupting answer in progress");
        effects.push(SessionEffect::Send(OutboundEvent::cancel_response()));
        let actions = self.engine.interrupt(now);
        self.apply(actions, now, &mut effects);
        effects
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.watchdog, self.engine.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Fire whatever timers are due at `now`.
    pub fn on_timers(&mut self, now: Instant) -> Vec<SessionEffect> {
        let mut effects = Vec::new();
        if self.state == SessionState::Disconnected {
            return effects;
        }

        if self.watchdog.is_some_and(|at| at <= now) {
            self.watchdog = None;
            warn!(
                target: "pagi::voice_link::session",
                ceiling_ms = self.stuck_after.as_millis() as u64,
                "Stuck response; forcing listening"
            );
            self.engine.abandon(now);
            if self.state == SessionState::Speaking {
                self.set_state(SessionState::Listening, &mut effects);
            }
            effects.push(SessionEffect::AnswerEnded);
            return effects;
        }

        let actions = self.engine.on_deadline(now);
        self.apply(actions, now, &mut effects);
        effects
    }

    /// Session teardown. Clears all per-session state.
    pub fn on_teardown(&mut self) -> Vec<SessionEffect> {
        let mut effects = Vec::new();
        self.engine.reset();
        self.watchdog = None;
        self.media_seen = false;
        self.channel_open = false;
        self.set_state(SessionState::Disconnected, &mut effects);
        effects
    }

    fn enter_speaking(&mut self, now: Instant, effects: &mut Vec<SessionEffect>) {
        if self.state == SessionState::Listening {
            self.set_state(SessionState::Speaking, effects);
            self.watchdog = Some(now + self.stuck_after);
        }
    }

    fn apply(&mut self, actions: Vec<EngineAction>, now: Instant, effects: &mut Vec<SessionEffect>) {
        for action in actions {
            match action {
                EngineAction::Deliver(answer) => effects.push(SessionEffect::DeliverAnswer(answer)),
                EngineAction::Send(event) => {
                    if matches!(event, OutboundEvent::CreateResponse { .. })
                        && self.state == SessionState::Speaking
                    {
                        self.watchdog = Some(now + self.stuck_after);
                    }
                    effects.push(SessionEffect::Send(event));
                }
                EngineAction::AnswerEnded => {
                    self.watchdog = None;
                    if self.state == SessionState::Speaking {
                        self.set_state(SessionState::Listening, effects);
                    }
                    effects.push(SessionEffect::AnswerEnded);
                }
            }
        }
    }
}

impl fmt::Debug for SessionMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionMachine")
            .field("state", &self.state)
            .field("watchdog", &self.watchdog)
            .field("engine", &self.engine)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn live_machine() -> SessionMachine {
        let mut m = SessionMachine::new(&VoiceLinkConfig::default());
        m.begin_connect();
        m.on_remote_media();
        m.on_channel_open();
        assert_eq!(m.state(), SessionState::Listening);
        m
    }

    fn states(effects: &[SessionEffect]) -> Vec<SessionState> {
        effects
            .iter()
            .filter_map(|e| match e {
                SessionEffect::StateChanged(s) => Some(*s),
                _ => None,
            })
            .collect()
    }

    fn answers(effects: &[SessionEffect]) -> Vec<&Answer> {
        effects
            .iter()
            .filter_map(|e| match e {
                SessionEffect::DeliverAnswer(a) => Some(a),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn connect_path_reaches_listening_and_configures_session() {
        let mut m = SessionMachine::new(&VoiceLinkConfig::default());
        assert_eq!(states(&m.begin_connect()), vec![SessionState::Connecting]);
        assert!(m.begin_connect().is_empty());
        assert_eq!(states(&m.on_remote_media()), vec![SessionState::Connected]);
        let open = m.on_channel_open();
        assert_eq!(states(&open), vec![SessionState::Listening]);
        assert!(matches!(open[0], SessionEffect::Send(OutboundEvent::SessionUpdate { .. })));
    }

    #[test]
    fn channel_open_before_media_still_ends_listening() {
        let mut m = SessionMachine::new(&VoiceLinkConfig::default());
        m.begin_connect();
        assert!(states(&m.on_channel_open()).is_empty());
        assert_eq!(
            states(&m.on_remote_media()),
            vec![SessionState::Connected, SessionState::Listening]
        );
    }

    #[test]
    fn streamed_answer_round_trip() {
        let t0 = Instant::now();
        let mut m = live_machine();
        m.on_channel_message(r#"{"type":"response.created","response":{"id":"r1"}}"#, t0);
        let fx = m.on_channel_message(
            r#"{"type":"response.audio_transcript.delta","response_id":"r1","delta":"Hello ther"}"#,
            t0,
        );
        assert_eq!(states(&fx), vec![SessionState::Speaking]);
        m.on_channel_message(
            r#"{"type":"response.audio_transcript.delta","response_id":"r1","delta":"Hello there, how can I"}"#,
            t0,
        );
        let fx = m.on_channel_message(
            r#"{"type":"response.done","response":{"id":"r1","status":"completed"}}"#,
            t0,
        );
        let delivered = answers(&fx);
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].text, "Hello there, how can I");
        assert_eq!(states(&fx), vec![SessionState::Listening]);
        assert!(fx.contains(&SessionEffect::AnswerEnded));
        assert_eq!(m.next_deadline(), None);
    }

    #[test]
    fn segment_markers_do_not_end_the_answer() {
        let t0 = Instant::now();
        let mut m = live_machine();
        m.on_channel_message(r#"{"type":"response.audio.delta","response_id":"r1"}"#, t0);
        let fx = m.on_channel_message(
            r#"{"type":"response.audio_transcript.done","response_id":"r1","transcript":"First part."}"#,
            t0,
        );
        assert!(fx.is_empty());
        assert_eq!(m.state(), SessionState::Speaking);
    }

    #[test]
    fn transcripts_confirm_user_speech() {
        let t0 = Instant::now();
        let mut m = live_machine();
        let fx = m.on_channel_message(
            r#"{"type":"conversation.item.input_audio_transcription.completed","item_id":"i1","transcript":" what time is it "}"#,
            t0,
        );
        assert!(matches!(&fx[0], SessionEffect::DeliverTranscript(t) if t.text == "what time is it"));
        assert_eq!(fx[1], SessionEffect::UserSpeechConfirmed);
    }

    #[test]
    fn raw_voice_activity_does_not_confirm_speech() {
        let t0 = Instant::now();
        let mut m = live_machine();
        let fx = m.on_channel_message(r#"{"type":"input_audio_buffer.speech_started"}"#, t0);
        assert!(fx.is_empty());
    }

    #[test]
    fn malformed_and_unknown_messages_are_dropped() {
        let t0 = Instant::now();
        let mut m = live_machine();
        assert!(m.on_channel_message("{oops", t0).is_empty());
        assert!(m.on_channel_message(r#"{"type":"brand.new.event"}"#, t0).is_empty());
        assert!(m.on_channel_message(r#"{"type":"rate_limits.updated","rate_limits":[]}"#, t0).is_empty());
        assert_eq!(m.state(), SessionState::Listening);
    }

    #[test]
    fn fatal_error_code_requests_disconnect() {
        let t0 = Instant::now();
        let mut m = live_machine();
        let fx = m.on_channel_message(
            r#"{"type":"error","error":{"type":"invalid_request_error","code":"session_expired","message":"gone"}}"#,
            t0,
        );
        assert_eq!(
            fx,
            vec![SessionEffect::Disconnect(DisconnectReason::ProtocolError(
                "session_expired".into()
            ))]
        );
        let benign = m.on_channel_message(
            r#"{"type":"error","error":{"code":"invalid_value","message":"bad field"}}"#,
            t0,
        );
        assert!(benign.is_empty());
    }

    #[test]
    fn watchdog_forces_listening_and_clears_answer() {
        let t0 = Instant::now();
        let mut m = live_machine();
        m.on_channel_message(
            r#"{"type":"response.text.delta","response_id":"r1","delta":"Thinking about"}"#,
            t0,
        );
        assert_eq!(m.next_deadline(), Some(t0 + Duration::from_secs(30)));
        assert!(m.on_timers(t0 + Duration::from_secs(29)).is_empty());

        let fx = m.on_timers(t0 + Duration::from_secs(30));
        assert_eq!(states(&fx), vec![SessionState::Listening]);
        assert!(!m.answer_in_progress());
        // a late finalize for the dropped answer is not delivered
        let late = m.on_channel_message(
            r#"{"type":"response.done","response":{"id":"r1","status":"completed"}}"#,
            t0 + Duration::from_secs(31),
        );
        assert!(answers(&late).is_empty());
    }

    #[test]
    fn continuation_request_rearms_watchdog() {
        let t0 = Instant::now();
        let mut m = live_machine();
        m.on_channel_message(r#"{"type":"response.text.delta","response_id":"r1","delta":"and"}"#, t0);
        let t1 = t0 + Duration::from_secs(5);
        let fx = m.on_channel_message(
            r#"{"type":"response.done","response":{"id":"r1","status":"completed"}}"#,
            t1,
        );
        assert!(fx.is_empty());
        assert_eq!(m.state(), SessionState::Speaking);

        let due = t1 + Duration::from_millis(800);
        assert_eq!(m.next_deadline(), Some(due));
        let fx = m.on_timers(due);
        assert_eq!(
            fx.iter().filter(|e| matches!(e, SessionEffect::Send(_))).count(),
            2
        );
        assert_eq!(m.next_deadline(), Some(due + Duration::from_secs(30)));
    }

    #[test]
    fn interrupt_cancels_and_returns_to_listening() {
        let t0 = Instant::now();
        let mut m = live_machine();
        m.on_channel_message(r#"{"type":"response.text.delta","response_id":"r1","delta":"Once upon"}"#, t0);
        let fx = m.interrupt(t0);
        assert!(matches!(fx[0], SessionEffect::Send(OutboundEvent::CancelResponse { .. })));
        assert_eq!(states(&fx), vec![SessionState::Listening]);
        assert!(m.interrupt(t0).is_empty());
    }

    #[test]
    fn text_turns_require_a_live_conversation() {
        let mut m = SessionMachine::new(&VoiceLinkConfig::default());
        assert!(m.send_text("hi").is_empty());
        let mut m = live_machine();
        assert_eq!(m.send_text("hi").len(), 2);
    }

    #[test]
    fn teardown_is_idempotent() {
        let t0 = Instant::now();
        let mut m = live_machine();
        m.on_channel_message(r#"{"type":"response.text.delta","response_id":"r1","delta":"x"}"#, t0);
        assert_eq!(states(&m.on_teardown()), vec![SessionState::Disconnected]);
        assert!(m.on_teardown().is_empty());
        assert!(!m.answer_in_progress());
        assert_eq!(m.next_deadline(), None);
        // events after teardown are ignored
        assert!(m
            .on_channel_message(r#"{"type":"response.text.delta","delta":"y"}"#, t0)
            .is_empty());
    }
}
