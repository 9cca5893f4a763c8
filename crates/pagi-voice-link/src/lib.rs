//! # PAGI Voice Link - Realtime Voice Session Controller
//!
//! Client-side controller for a duplex voice session with a remote speech model. It owns
//! the peer transport lifecycle, interprets the model's JSON event stream, repairs
//! truncated answers, and disconnects idle sessions before they run up cost.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        VoiceLink (driver)                         │
//! │  ┌──────────────┐  ┌────────────────┐  ┌─────────────────────┐   │
//! │  │  Handshake   │→ │ SessionMachine │→ │   ResponseEngine    │   │
//! │  │ (issuer/     │  │ (event state   │  │ (completion, retry, │   │
//! │  │  relay/peer) │  │   machine)     │  │    dedup)           │   │
//! │  └──────────────┘  └────────────────┘  └─────────────────────┘   │
//! │         ↑                  ↓                                      │
//! │  ┌──────────────┐  ┌────────────────┐  ┌─────────────────────┐   │
//! │  │  Microphone  │→ │ AudioLevel     │→ │     IdleClock       │   │
//! │  │  Pool (cpal) │  │ Monitor (FFT)  │  │ (15s cost control)  │   │
//! │  └──────────────┘  └────────────────┘  └─────────────────────┘   │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The machine, engine, idle clock and level monitor are synchronous and take the current
//! [`tokio::time::Instant`]; the [`VoiceLink`] driver task is the only place that awaits.

pub mod capture;
pub mod completion;
pub mod config;
pub mod controller;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod http;
pub mod idle;
pub mod levels;
pub mod protocol;
pub mod session;
pub mod transport;
#[cfg(feature = "webrtc")]
pub mod webrtc_peer;

pub use capture::{AudioChunk, CaptureBackend, CaptureStream, MicrophoneLease, MicrophonePool};
#[cfg(feature = "microphone")]
pub use capture::CpalMicrophone;
pub use completion::{ClassifierSet, Completeness, CompletenessClassifier, EnglishTailClassifier, Language};
pub use config::VoiceLinkConfig;
pub use controller::{Collaborators, NoopObserver, SessionObserver, VoiceLink};
pub use dedup::{DedupWindow, PrefixSuffixSimilarity, SimilarityPolicy};
pub use engine::{Answer, EngineAction, ResponseEngine};
pub use error::{VoiceLinkError, VoiceLinkResult};
pub use http::{HttpCredentialIssuer, HttpHandshakeRelay};
pub use idle::{IdleClock, IdleInputs, IdleVerdict};
pub use levels::{AnalyzerFeed, AudioLevelMonitor, AudioLevels, FeedStatus, PcmAnalyzer};
pub use protocol::{InboundEvent, OutboundEvent};
pub use session::{DisconnectReason, SessionEffect, SessionMachine, SessionState, Transcript};
pub use transport::{
    CredentialIssuer, CredentialRequest, HandshakeRelay, PeerConnector, PeerEvent, PeerLink, PeerSetup,
    SessionCredential,
};
#[cfg(feature = "webrtc")]
pub use webrtc_peer::{WebRtcConnector, WebRtcLink};
