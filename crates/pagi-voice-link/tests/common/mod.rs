//! In-memory collaborators for driving a `VoiceLink` without a network or a microphone.

#![allow(dead_code)]

use async_trait::async_trait;
use pagi_voice_link::{
    AnalyzerFeed, Answer, AudioChunk, CaptureBackend, CaptureStream, Collaborators, CredentialIssuer,
    CredentialRequest, FeedStatus, HandshakeRelay, MicrophonePool, PeerConnector, PeerEvent, PeerLink,
    PeerSetup, SessionCredential, SessionObserver, SessionState, Transcript, VoiceLink, VoiceLinkConfig,
    VoiceLinkError, VoiceLinkResult,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Notify};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("pagi=debug"))
        .with_test_writer()
        .try_init();
}

#[derive(Default)]
pub struct FakeIssuer {
    pub calls: AtomicUsize,
    pub reject: AtomicBool,
}

#[async_trait]
impl CredentialIssuer for FakeIssuer {
    async fn issue(&self, request: &CredentialRequest) -> VoiceLinkResult<SessionCredential> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert_eq!(request.voice_preference, "alloy");
        if self.reject.load(Ordering::SeqCst) {
            return Err(VoiceLinkError::Authentication("issuer said no".into()));
        }
        Ok(SessionCredential::new("ek_test", None))
    }
}

#[derive(Default)]
pub struct FakeRelay {
    pub calls: AtomicUsize,
    pub fail: AtomicBool,
    /// When set, `exchange` waits for a notification before answering.
    pub hold: AtomicBool,
    pub release: Notify,
}

#[async_trait]
impl HandshakeRelay for FakeRelay {
    async fn exchange(&self, offer: &str, credential: &SessionCredential) -> VoiceLinkResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert_eq!(offer, "v=0 offer");
        assert_eq!(credential.short_lived_credential, "ek_test");
        if self.hold.load(Ordering::SeqCst) {
            self.release.notified().await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(VoiceLinkError::Transport("relay answered 502".into()));
        }
        Ok("v=0 answer".to_string())
    }
}

/// Everything the test can see or poke on the most recent peer link.
#[derive(Default)]
pub struct PeerProbe {
    pub creates: AtomicUsize,
    pub closes: AtomicUsize,
    pub answer: Mutex<Option<String>>,
    pub sent: Mutex<Vec<String>>,
    pub events: Mutex<Option<mpsc::UnboundedSender<PeerEvent>>>,
}

impl PeerProbe {
    pub fn emit(&self, event: PeerEvent) {
        let events = self.events.lock().unwrap();
        events.as_ref().expect("no peer link yet").send(event).expect("driver gone");
    }

    pub fn message(&self, value: Value) {
        self.emit(PeerEvent::ChannelMessage(value.to_string()));
    }

    /// Types of every client event sent so far, in order.
    pub fn sent_types(&self) -> Vec<String> {
        self.sent_events()
            .iter()
            .map(|v| v["type"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    pub fn sent_events(&self) -> Vec<Value> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|s| serde_json::from_str(s).expect("client events are JSON"))
            .collect()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().unwrap().clear();
    }
}

pub struct FakeConnector {
    pub probe: Arc<PeerProbe>,
}

struct FakeLink {
    probe: Arc<PeerProbe>,
}

#[async_trait]
impl PeerConnector for FakeConnector {
    async fn create(&self, setup: PeerSetup) -> VoiceLinkResult<Box<dyn PeerLink>> {
        self.probe.creates.fetch_add(1, Ordering::SeqCst);
        *self.probe.events.lock().unwrap() = Some(setup.events);
        Ok(Box::new(FakeLink {
            probe: Arc::clone(&self.probe),
        }))
    }
}

#[async_trait]
impl PeerLink for FakeLink {
    async fn create_offer(&self) -> VoiceLinkResult<String> {
        Ok("v=0 offer".to_string())
    }

    async fn apply_answer(&self, answer: String) -> VoiceLinkResult<()> {
        *self.probe.answer.lock().unwrap() = Some(answer);
        Ok(())
    }

    fn send(&self, message: String) -> VoiceLinkResult<()> {
        self.probe.sent.lock().unwrap().push(message);
        Ok(())
    }

    async fn close(&self) {
        self.probe.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeMicrophone {
    pub opens: AtomicUsize,
    pub stops: Arc<AtomicUsize>,
    pub deny: AtomicBool,
    pub tx: Mutex<Option<broadcast::Sender<AudioChunk>>>,
}

struct FakeStream {
    tx: broadcast::Sender<AudioChunk>,
    stops: Arc<AtomicUsize>,
}

impl CaptureStream for FakeStream {
    fn subscribe(&self) -> broadcast::Receiver<AudioChunk> {
        self.tx.subscribe()
    }

    fn sample_rate(&self) -> u32 {
        48_000
    }

    fn stop(&mut self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

impl CaptureBackend for FakeMicrophone {
    fn open(&self) -> VoiceLinkResult<Box<dyn CaptureStream>> {
        if self.deny.load(Ordering::SeqCst) {
            return Err(VoiceLinkError::Permission("microphone access denied".into()));
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        let (tx, _) = broadcast::channel(16);
        *self.tx.lock().unwrap() = Some(tx.clone());
        Ok(Box::new(FakeStream {
            tx,
            stops: Arc::clone(&self.stops),
        }))
    }
}

/// Remote analyzer that always reports one fixed bin value.
pub struct ConstantFeed(pub u8);

impl AnalyzerFeed for ConstantFeed {
    fn frequency_bins(&mut self, bins: &mut Vec<u8>) -> FeedStatus {
        bins.clear();
        bins.resize(64, self.0);
        FeedStatus::Live
    }
}

#[derive(Default)]
pub struct RecordingObserver {
    pub states: Mutex<Vec<SessionState>>,
    pub answers: Mutex<Vec<Answer>>,
    pub transcripts: Mutex<Vec<Transcript>>,
    pub idle_disconnects: AtomicUsize,
}

impl SessionObserver for RecordingObserver {
    fn on_state_change(&self, state: SessionState) {
        self.states.lock().unwrap().push(state);
    }

    fn on_answer(&self, answer: &Answer) {
        self.answers.lock().unwrap().push(answer.clone());
    }

    fn on_transcript(&self, transcript: &Transcript) {
        self.transcripts.lock().unwrap().push(transcript.clone());
    }

    fn on_idle_disconnect(&self) {
        self.idle_disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

impl RecordingObserver {
    pub fn answer_texts(&self) -> Vec<String> {
        self.answers.lock().unwrap().iter().map(|a| a.text.clone()).collect()
    }
}

pub struct Harness {
    pub link: VoiceLink,
    pub issuer: Arc<FakeIssuer>,
    pub relay: Arc<FakeRelay>,
    pub peer: Arc<PeerProbe>,
    pub microphone: Arc<FakeMicrophone>,
    pub pool: MicrophonePool,
    pub observer: Arc<RecordingObserver>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(VoiceLinkConfig::default())
    }

    pub fn with_config(config: VoiceLinkConfig) -> Self {
        init_tracing();
        let issuer = Arc::new(FakeIssuer::default());
        let relay = Arc::new(FakeRelay::default());
        let peer = Arc::new(PeerProbe::default());
        let microphone = Arc::new(FakeMicrophone::default());
        let pool = MicrophonePool::new(microphone.clone());
        let observer = Arc::new(RecordingObserver::default());

        let link = VoiceLink::spawn(
            config,
            Collaborators {
                issuer: issuer.clone(),
                relay: relay.clone(),
                connector: Arc::new(FakeConnector { probe: peer.clone() }),
                microphones: pool.clone(),
                observer: observer.clone(),
            },
        )
        .expect("default config is valid");

        Self {
            link,
            issuer,
            relay,
            peer,
            microphone,
            pool,
            observer,
        }
    }

    /// Connect and bring the session to `listening`.
    pub async fn connect_live(&self) {
        self.link.connect(false).await.expect("connect");
        self.peer.emit(PeerEvent::RemoteMedia {
            feed: Box::new(ConstantFeed(0)),
        });
        self.peer.emit(PeerEvent::ChannelOpen);
        self.wait_for(SessionState::Listening).await;
        self.peer.clear_sent();
    }

    pub async fn wait_for(&self, state: SessionState) {
        let mut rx = self.link.subscribe_state();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == state))
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {state}"))
            .expect("driver gone");
    }

    /// Push one block of PCM through the open microphone.
    pub fn microphone_chunk(&self, samples: Vec<f32>) {
        let tx = self.microphone.tx.lock().unwrap();
        tx.as_ref()
            .expect("microphone not open")
            .send(AudioChunk::new(samples, 48_000))
            .expect("no analyzer attached");
    }

    /// Let the driver drain everything queued so far.
    pub async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

pub fn delta(response_id: &str, text: &str) -> Value {
    json!({"type": "response.audio_transcript.delta", "response_id": response_id, "delta": text})
}

pub fn created(response_id: &str) -> Value {
    json!({"type": "response.created", "response": {"id": response_id}})
}

pub fn done(response_id: &str, status: &str, transcript: Option<&str>) -> Value {
    let output = match transcript {
        Some(t) => json!([{"content": [{"transcript": t}]}]),
        None => json!([]),
    };
    json!({"type": "response.done", "response": {"id": response_id, "status": status, "output": output}})
}
