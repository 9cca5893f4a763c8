//! Voice Link Demo: talk to the remote speech model through the default microphone.
//!
//! Needs a backend that exposes the credential issuer and handshake relay (see
//! `PAGI_VOICE_LINK__ENDPOINTS__*`). Type a line to send it as a text turn, `/stop` to
//! interrupt the current answer, `/quit` to hang up.
//!
//! ```text
//! cargo run -p pagi-voice-link --example voice_link_demo --features microphone,webrtc
//! ```

use pagi_voice_link::{
    Answer, Collaborators, CpalMicrophone, HttpCredentialIssuer, HttpHandshakeRelay, MicrophonePool,
    SessionObserver, SessionState, Transcript, VoiceLink, VoiceLinkConfig, WebRtcConnector,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

struct ConsoleObserver;

impl SessionObserver for ConsoleObserver {
    fn on_state_change(&self, state: SessionState) {
        info!("📱 {state}");
    }

    fn on_answer(&self, answer: &Answer) {
        let note = if answer.complete { "" } else { " (best effort)" };
        info!("🤖 [{}]{note} {}", answer.language.as_tag(), answer.text);
    }

    fn on_transcript(&self, transcript: &Transcript) {
        info!("🎤 {}", transcript.text);
    }

    fn on_idle_disconnect(&self) {
        info!("💤 Disconnected after inactivity. Type anything to reconnect.");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[voice_link_demo] .env not loaded: {} (using system environment)", e);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,pagi=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = VoiceLinkConfig::load()?;
    let collaborators = Collaborators {
        issuer: Arc::new(HttpCredentialIssuer::new(&config.endpoints)?),
        relay: Arc::new(HttpHandshakeRelay::new(&config.endpoints)?),
        connector: Arc::new(WebRtcConnector::new(&config)?),
        microphones: MicrophonePool::new(Arc::new(CpalMicrophone::default())),
        observer: Arc::new(ConsoleObserver),
    };
    let link = VoiceLink::spawn(config, collaborators)?;

    info!("Voice Link Demo ready. Speak, or type a message. /stop interrupts, /quit exits.");
    link.connect(false).await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match line.trim() {
            "" => {}
            "/quit" => break,
            "/stop" => link.interrupt()?,
            text => {
                if link.state() == SessionState::Disconnected {
                    if let Err(e) = link.connect(true).await {
                        warn!("Reconnect failed: {e}");
                        continue;
                    }
                    let mut state = link.subscribe_state();
                    let _ = tokio::time::timeout(
                        Duration::from_secs(10),
                        state.wait_for(|s| *s == SessionState::Listening),
                    )
                    .await;
                }
                link.send_text(text)?;
            }
        }
    }

    link.shutdown().await;
    Ok(())
}
