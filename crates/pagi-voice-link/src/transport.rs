//! Collaborator seams of the connection manager.
//!
//! The credential issuer and handshake relay are backend endpoints (see [`crate::http`]);
//! the peer connector builds the media transport (see `webrtc_peer` behind the `webrtc`
//! feature). Tests substitute in-memory fakes for all three.

use crate::capture::AudioChunk;
use crate::error::VoiceLinkResult;
use crate::levels::AnalyzerFeed;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

/// Body sent to the credential issuer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialRequest {
    pub voice_preference: String,
    pub fast_path: bool,
}

/// Short-lived credential returned by the issuer.
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCredential {
    pub short_lived_credential: String,
    #[serde(default)]
    pub expiry: Option<DateTime<Utc>>,
}

impl SessionCredential {
    pub fn new(token: impl Into<String>, expiry: Option<DateTime<Utc>>) -> Self {
        Self {
            short_lived_credential: token.into(),
            expiry,
        }
    }

    /// Blank or already expired.
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        !self.short_lived_credential.trim().is_empty() && self.expiry.map_or(true, |at| at > now)
    }
}

impl std::fmt::Debug for SessionCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCredential")
            .field("short_lived_credential", &"<redacted>")
            .field("expiry", &self.expiry)
            .finish()
    }
}

#[async_trait]
pub trait CredentialIssuer: Send + Sync {
    /// Mint a credential. Failures are [`Authentication`](crate::VoiceLinkError::Authentication).
    async fn issue(&self, request: &CredentialRequest) -> VoiceLinkResult<SessionCredential>;
}

#[async_trait]
pub trait HandshakeRelay: Send + Sync {
    /// Exchange the local offer for the remote answer description. Failures are
    /// [`Transport`](crate::VoiceLinkError::Transport).
    async fn exchange(&self, offer: &str, credential: &SessionCredential) -> VoiceLinkResult<String>;
}

/// Everything a peer link reports back to the controller.
pub enum PeerEvent {
    /// First remote media frame, with an analyzer over the remote voice.
    RemoteMedia { feed: Box<dyn AnalyzerFeed> },
    ChannelOpen,
    ChannelMessage(String),
    ChannelClosed,
    Failed(String),
}

impl std::fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerEvent::RemoteMedia { .. } => f.write_str("RemoteMedia"),
            PeerEvent::ChannelOpen => f.write_str("ChannelOpen"),
            PeerEvent::ChannelMessage(m) => f.debug_tuple("ChannelMessage").field(m).finish(),
            PeerEvent::ChannelClosed => f.write_str("ChannelClosed"),
            PeerEvent::Failed(e) => f.debug_tuple("Failed").field(e).finish(),
        }
    }
}

/// Inputs for building one peer link.
#[derive(Debug)]
pub struct PeerSetup {
    /// Local microphone audio to send.
    pub local_audio: broadcast::Receiver<AudioChunk>,
    pub sample_rate: u32,
    /// Where the link reports media, channel and failure events.
    pub events: mpsc::UnboundedSender<PeerEvent>,
}

#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Create the transport with the local track attached and the event channel created.
    async fn create(&self, setup: PeerSetup) -> VoiceLinkResult<Box<dyn PeerLink>>;
}

/// One live (or forming) peer transport.
#[async_trait]
pub trait PeerLink: Send + Sync {
    async fn create_offer(&self) -> VoiceLinkResult<String>;

    async fn apply_answer(&self, answer: String) -> VoiceLinkResult<()>;

    /// Queue a message on the event channel without waiting.
    fn send(&self, message: String) -> VoiceLinkResult<()>;

    /// Close everything. Must tolerate parts already being closed.
    async fn close(&self);
}
