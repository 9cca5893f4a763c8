//! Connection manager and session driver.
//!
//! [`VoiceLink`] is a cheap handle; all session state lives in one driver task that owns
//! the [`SessionMachine`], the [`IdleClock`] and the [`AudioLevelMonitor`]. Commands, peer
//! events, handshake progress and every timer are serialized through one `select!` loop,
//! so nothing needs a lock and the connect guard is a plain state check.
//!
//! The handshake runs in its own task because it is the only part that waits on the
//! network. Its messages carry the epoch of the attempt that spawned it; a disconnect bumps
//! the epoch, so results of an abandoned attempt are released instead of applied.

use crate::capture::{MicrophoneLease, MicrophonePool};
use crate::config::VoiceLinkConfig;
use crate::engine::Answer;
use crate::error::{VoiceLinkError, VoiceLinkResult};
use crate::idle::{IdleClock, IdleInputs, IdleVerdict};
use crate::levels::{AudioLevelMonitor, AudioLevels, PcmAnalyzer};
use crate::protocol::OutboundEvent;
use crate::session::{DisconnectReason, SessionEffect, SessionMachine, SessionState, Transcript};
use crate::transport::{
    CredentialIssuer, CredentialRequest, HandshakeRelay, PeerConnector, PeerEvent, PeerLink,
    PeerSetup,
};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Receives session notifications. Called from the driver task, so implementations must
/// return promptly.
pub trait SessionObserver: Send + Sync {
    fn on_state_change(&self, _state: SessionState) {}

    /// A finalized answer. At most once per logical answer.
    fn on_answer(&self, _answer: &Answer) {}

    fn on_transcript(&self, _transcript: &Transcript) {}

    /// The idle clock forced a disconnect.
    fn on_idle_disconnect(&self) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl SessionObserver for NoopObserver {}

/// External collaborators of a voice link.
#[derive(Clone)]
pub struct Collaborators {
    pub issuer: Arc<dyn CredentialIssuer>,
    pub relay: Arc<dyn HandshakeRelay>,
    pub connector: Arc<dyn PeerConnector>,
    pub microphones: MicrophonePool,
    pub observer: Arc<dyn SessionObserver>,
}

enum Command {
    Connect {
        fast_path: bool,
        reply: oneshot::Sender<VoiceLinkResult<()>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    SendText(String),
    Interrupt,
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

enum Handshake {
    CaptureStarted {
        epoch: u64,
        lease: MicrophoneLease,
    },
    LinkCreated {
        epoch: u64,
        link: Arc<dyn PeerLink>,
    },
    Finished {
        epoch: u64,
        result: VoiceLinkResult<()>,
    },
}

/// Resources of the one session that may exist.
struct ActiveSession {
    epoch: u64,
    pending_connect: Option<oneshot::Sender<VoiceLinkResult<()>>>,
    handshake: Option<JoinHandle<()>>,
    lease: Option<MicrophoneLease>,
    link: Option<Arc<dyn PeerLink>>,
    events: Option<mpsc::UnboundedReceiver<PeerEvent>>,
}

/// Handle to a voice session controller.
#[derive(Clone)]
pub struct VoiceLink {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SessionState>,
    levels: watch::Receiver<AudioLevels>,
}

impl VoiceLink {
    /// Validate the config and start the driver task on the current runtime.
    pub fn spawn(config: VoiceLinkConfig, collaborators: Collaborators) -> VoiceLinkResult<Self> {
        config.validate()?;
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);
        let (levels_tx, levels_rx) = watch::channel(AudioLevels::default());

        let driver = Driver::new(config, collaborators, commands_rx, state_tx, levels_tx);
        tokio::spawn(driver.run());

        Ok(Self {
            commands: commands_tx,
            state: state_rx,
            levels: levels_rx,
        })
    }

    /// Establish a session. A no-op (resolving `Ok`) while a session exists or is forming.
    /// An attempt abandoned by [`disconnect`](Self::disconnect) also resolves `Ok`.
    pub async fn connect(&self, fast_path: bool) -> VoiceLinkResult<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Connect { fast_path, reply })
            .map_err(|_| VoiceLinkError::ChannelClosed)?;
        rx.await.map_err(|_| VoiceLinkError::ChannelClosed)?
    }

    /// Tear the session down. Safe in any state, any number of times.
    pub async fn disconnect(&self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Disconnect { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    /// Send a typed user turn and request an answer.
    pub fn send_text(&self, text: impl Into<String>) -> VoiceLinkResult<()> {
        self.commands
            .send(Command::SendText(text.into()))
            .map_err(|_| VoiceLinkError::ChannelClosed)
    }

    /// Cancel the answer in progress.
    pub fn interrupt(&self) -> VoiceLinkResult<()> {
        self.commands
            .send(Command::Interrupt)
            .map_err(|_| VoiceLinkError::ChannelClosed)
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    pub fn subscribe_levels(&self) -> watch::Receiver<AudioLevels> {
        self.levels.clone()
    }

    /// Tear down and stop the driver. Other handles fail with `ChannelClosed` afterwards.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
    }
}

impl std::fmt::Debug for VoiceLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceLink").field("state", &self.state()).finish()
    }
}

/// Only the three connect categories reach a caller.
fn connect_error(err: VoiceLinkError) -> VoiceLinkError {
    match err {
        e if e.is_fatal() => e,
        VoiceLinkError::AudioDevice(msg) => VoiceLinkError::Permission(msg),
        other => VoiceLinkError::Transport(other.to_string()),
    }
}

async fn next_peer_event(events: Option<&mut mpsc::UnboundedReceiver<PeerEvent>>) -> Option<PeerEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn interval(period: Duration) -> Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

struct Driver {
    config: VoiceLinkConfig,
    collaborators: Collaborators,
    machine: SessionMachine,
    idle: IdleClock,
    levels: AudioLevelMonitor,
    state_tx: watch::Sender<SessionState>,
    commands: mpsc::UnboundedReceiver<Command>,
    handshake_tx: mpsc::UnboundedSender<Handshake>,
    handshake_rx: mpsc::UnboundedReceiver<Handshake>,
    session: Option<ActiveSession>,
    epoch: u64,
    idle_tick: Interval,
    level_tick: Interval,
}

impl Driver {
    fn new(
        config: VoiceLinkConfig,
        collaborators: Collaborators,
        commands: mpsc::UnboundedReceiver<Command>,
        state_tx: watch::Sender<SessionState>,
        levels_tx: watch::Sender<AudioLevels>,
    ) -> Self {
        let (handshake_tx, handshake_rx) = mpsc::unbounded_channel();
        Self {
            machine: SessionMachine::new(&config),
            idle: IdleClock::new(&config),
            levels: AudioLevelMonitor::new(&config, levels_tx),
            idle_tick: interval(config.timing.idle_tick()),
            level_tick: interval(config.timing.level_sample()),
            config,
            collaborators,
            state_tx,
            commands,
            handshake_tx,
            handshake_rx,
            session: None,
            epoch: 0,
        }
    }

    async fn run(mut self) {
        info!(target: "pagi::voice_link", "Voice link driver started");
        loop {
            let deadline = self.machine.next_deadline();
            let wake_at = deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
            let idle_armed = self.idle.is_armed();
            let sampling = self.machine.state() != SessionState::Disconnected || !self.levels.is_quiet();
            let events = self.session.as_mut().and_then(|s| s.events.as_mut());

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.teardown(DisconnectReason::Requested);
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.on_command(command),
                    None => {
                        self.teardown(DisconnectReason::Requested);
                        break;
                    }
                },
                Some(progress) = self.handshake_rx.recv() => self.on_handshake(progress),
                event = next_peer_event(events) => self.on_peer_event(event),
                _ = self.idle_tick.tick(), if idle_armed => self.on_idle_tick(),
                _ = self.level_tick.tick(), if sampling => self.on_level_tick(),
                _ = tokio::time::sleep_until(wake_at), if deadline.is_some() => {
                    let effects = self.machine.on_timers(Instant::now());
                    self.apply(effects);
                }
            }
        }
        info!(target: "pagi::voice_link", "Voice link driver stopped");
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Connect { fast_path, reply } => self.connect(fast_path, reply),
            Command::Disconnect { reply } => {
                self.teardown(DisconnectReason::Requested);
                let _ = reply.send(());
            }
            Command::SendText(text) => {
                let effects = self.machine.send_text(&text);
                self.apply(effects);
            }
            Command::Interrupt => {
                let effects = self.machine.interrupt(Instant::now());
                self.apply(effects);
            }
            Command::Shutdown { reply } => {
                self.teardown(DisconnectReason::Requested);
                let _ = reply.send(());
            }
        }
    }

    fn connect(&mut self, fast_path: bool, reply: oneshot::Sender<VoiceLinkResult<()>>) {
        if self.session.is_some() || self.machine.state() != SessionState::Disconnected {
            debug!(target: "pagi::voice_link", state = %self.machine.state(), "Connect ignored; session exists");
            let _ = reply.send(Ok(()));
            return;
        }

        self.epoch += 1;
        let epoch = self.epoch;
        info!(target: "pagi::voice_link", epoch, fast_path, "🔌 Connecting voice session");

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let task = HandshakeTask {
            epoch,
            fast_path,
            voice: self.config.session.voice.clone(),
            collaborators: self.collaborators.clone(),
            progress: self.handshake_tx.clone(),
            events: events_tx,
        };
        self.session = Some(ActiveSession {
            epoch,
            pending_connect: Some(reply),
            handshake: Some(tokio::spawn(task.run())),
            lease: None,
            link: None,
            events: Some(events_rx),
        });

        self.idle.arm(Instant::now());
        let effects = self.machine.begin_connect();
        self.apply(effects);
    }

    fn current(&mut self, epoch: u64) -> Option<&mut ActiveSession> {
        self.session.as_mut().filter(|s| s.epoch == epoch)
    }

    fn on_handshake(&mut self, progress: Handshake) {
        match progress {
            Handshake::CaptureStarted { epoch, lease } => {
                let fft_size = self.config.levels.fft_size;
                match self.current(epoch) {
                    Some(session) => {
                        let feed = PcmAnalyzer::new(lease.subscribe(), fft_size);
                        session.lease = Some(lease);
                        self.levels.attach_local(Box::new(feed));
                    }
                    None => debug!(target: "pagi::voice_link", epoch, "Releasing microphone of abandoned attempt"),
                }
            }
            Handshake::LinkCreated { epoch, link } => match self.current(epoch) {
                Some(session) => session.link = Some(link),
                None => {
                    debug!(target: "pagi::voice_link", epoch, "Closing link of abandoned attempt");
                    tokio::spawn(async move { link.close().await });
                }
            },
            Handshake::Finished { epoch, result } => {
                let Some(session) = self.current(epoch) else {
                    debug!(target: "pagi::voice_link", epoch, "Discarding result of abandoned attempt");
                    return;
                };
                session.handshake = None;
                match result {
                    Ok(()) => {
                        info!(target: "pagi::voice_link", epoch, "✅ Handshake complete");
                        if let Some(reply) = session.pending_connect.take() {
                            let _ = reply.send(Ok(()));
                        }
                    }
                    Err(e) => {
                        let err = connect_error(e);
                        warn!(target: "pagi::voice_link", epoch, error = %err, "Connect failed");
                        let reply = session.pending_connect.take();
                        self.teardown(DisconnectReason::TransportFailure(err.to_string()));
                        if let Some(reply) = reply {
                            let _ = reply.send(Err(err));
                        }
                    }
                }
            }
        }
    }

    fn on_peer_event(&mut self, event: Option<PeerEvent>) {
        let now = Instant::now();
        let effects = match event {
            Some(PeerEvent::RemoteMedia { feed }) => {
                self.levels.attach_remote(feed);
                self.machine.on_remote_media()
            }
            Some(PeerEvent::ChannelOpen) => self.machine.on_channel_open(),
            Some(PeerEvent::ChannelMessage(text)) => self.machine.on_channel_message(&text, now),
            Some(PeerEvent::ChannelClosed) => {
                vec![SessionEffect::Disconnect(DisconnectReason::TransportFailure(
                    "event channel closed".to_string(),
                ))]
            }
            Some(PeerEvent::Failed(msg)) => {
                vec![SessionEffect::Disconnect(DisconnectReason::TransportFailure(msg))]
            }
            None => {
                if let Some(session) = self.session.as_mut() {
                    session.events = None;
                }
                if self.machine.state().is_live() {
                    vec![SessionEffect::Disconnect(DisconnectReason::TransportFailure(
                        "peer link dropped".to_string(),
                    ))]
                } else {
                    Vec::new()
                }
            }
        };
        self.apply(effects);
    }

    fn on_idle_tick(&mut self) {
        let now = Instant::now();
        let inputs = IdleInputs {
            state: self.machine.state(),
            answer_in_progress: self.machine.answer_in_progress(),
            remote_level: self.levels.levels().remote,
        };
        if self.idle.tick(now, inputs) == IdleVerdict::Expired {
            self.teardown(DisconnectReason::IdleTimeout);
            self.collaborators.observer.on_idle_disconnect();
        }
    }

    fn on_level_tick(&mut self) {
        let now = Instant::now();
        let tick = self.levels.sample(now);
        if let Some(energy) = tick.speech_sample {
            self.idle.observe_local_sample(energy, now);
        }
    }

    fn apply(&mut self, effects: Vec<SessionEffect>) {
        for effect in effects {
            match effect {
                SessionEffect::StateChanged(state) => {
                    self.state_tx.send_replace(state);
                    self.collaborators.observer.on_state_change(state);
                }
                SessionEffect::DeliverAnswer(answer) => self.collaborators.observer.on_answer(&answer),
                SessionEffect::DeliverTranscript(transcript) => {
                    self.collaborators.observer.on_transcript(&transcript)
                }
                SessionEffect::Send(event) => self.send(&event),
                SessionEffect::UserSpeechConfirmed => self.idle.confirm_user_speech(Instant::now()),
                SessionEffect::AnswerEnded => {
                    if self.idle.is_armed() {
                        self.idle.reset(Instant::now());
                    }
                }
                SessionEffect::Disconnect(reason) => self.teardown(reason),
            }
        }
    }

    fn send(&self, event: &OutboundEvent) {
        let Some(link) = self.session.as_ref().and_then(|s| s.link.as_ref()) else {
            warn!(target: "pagi::voice_link", "No peer link; dropping outbound event");
            return;
        };
        let result = event.to_json().and_then(|json| link.send(json));
        if let Err(e) = result {
            warn!(target: "pagi::voice_link", error = %e, "Failed to send client event");
        }
    }

    /// Release everything the session holds. Idempotent.
    fn teardown(&mut self, reason: DisconnectReason) {
        if let Some(mut session) = self.session.take() {
            info!(target: "pagi::voice_link", epoch = session.epoch, %reason, "Tearing down voice session");
            if let Some(handshake) = session.handshake.take() {
                handshake.abort();
            }
            if let Some(reply) = session.pending_connect.take() {
                let outcome = match &reason {
                    DisconnectReason::TransportFailure(msg) => Err(VoiceLinkError::Transport(msg.clone())),
                    _ => Ok(()),
                };
                let _ = reply.send(outcome);
            }
            if let Some(link) = session.link.take() {
                tokio::spawn(async move { link.close().await });
            }
            drop(session.lease.take());
            drop(session.events.take());
        }

        self.levels.detach_all();
        self.idle.disarm();
        let effects = self.machine.on_teardown();
        self.apply(effects);
    }
}

/// The network part of `connect`, run off the driver loop.
struct HandshakeTask {
    epoch: u64,
    fast_path: bool,
    voice: String,
    collaborators: Collaborators,
    progress: mpsc::UnboundedSender<Handshake>,
    events: mpsc::UnboundedSender<PeerEvent>,
}

impl HandshakeTask {
    async fn run(self) {
        let result = self.establish().await;
        let _ = self.progress.send(Handshake::Finished {
            epoch: self.epoch,
            result,
        });
    }

    async fn establish(&self) -> VoiceLinkResult<()> {
        let request = CredentialRequest {
            voice_preference: self.voice.clone(),
            fast_path: self.fast_path,
        };
        let credential = self.collaborators.issuer.issue(&request).await?;
        if !credential.is_usable(Utc::now()) {
            return Err(VoiceLinkError::Authentication(
                "credential is blank or already expired".to_string(),
            ));
        }

        let pool = self.collaborators.microphones.clone();
        let lease = tokio::task::spawn_blocking(move || pool.acquire())
            .await
            .map_err(|e| VoiceLinkError::Permission(format!("capture task failed: {e}")))??;
        let setup = PeerSetup {
            local_audio: lease.subscribe(),
            sample_rate: lease.sample_rate(),
            events: self.events.clone(),
        };
        let _ = self.progress.send(Handshake::CaptureStarted {
            epoch: self.epoch,
            lease,
        });

        let link: Arc<dyn PeerLink> = Arc::from(self.collaborators.connector.create(setup).await?);
        let _ = self.progress.send(Handshake::LinkCreated {
            epoch: self.epoch,
            link: Arc::clone(&link),
        });

        let offer = link.create_offer().await?;
        let answer = self.collaborators.relay.exchange(&offer, &credential).await?;
        link.apply_answer(answer).await?;
        Ok(())
    }
}
