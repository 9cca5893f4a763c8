//! Error types for the voice link controller

use thiserror::Error;

/// Result type alias for voice link operations
pub type VoiceLinkResult<T> = Result<T, VoiceLinkError>;

/// Errors that can occur while establishing or running a voice session.
///
/// Only [`Authentication`](VoiceLinkError::Authentication),
/// [`Permission`](VoiceLinkError::Permission) and
/// [`Transport`](VoiceLinkError::Transport) ever reach a caller of `connect()`.
/// Everything else is logged and absorbed by the controller.
#[derive(Error, Debug)]
pub enum VoiceLinkError {
    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Permission error: {0}")]
    Permission(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol fault: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Audio device error: {0}")]
    AudioDevice(String),

    #[error("Controller channel closed")]
    ChannelClosed,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl VoiceLinkError {
    /// True for the categories that abort a connect attempt and propagate to the caller.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            VoiceLinkError::Authentication(_)
                | VoiceLinkError::Permission(_)
                | VoiceLinkError::Transport(_)
        )
    }
}

impl From<config::ConfigError> for VoiceLinkError {
    fn from(err: config::ConfigError) -> Self {
        VoiceLinkError::Config(err.to_string())
    }
}

#[cfg(feature = "microphone")]
impl From<cpal::DefaultStreamConfigError> for VoiceLinkError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        VoiceLinkError::Permission(err.to_string())
    }
}

#[cfg(feature = "microphone")]
impl From<cpal::BuildStreamError> for VoiceLinkError {
    fn from(err: cpal::BuildStreamError) -> Self {
        VoiceLinkError::Permission(err.to_string())
    }
}

#[cfg(feature = "microphone")]
impl From<cpal::PlayStreamError> for VoiceLinkError {
    fn from(err: cpal::PlayStreamError) -> Self {
        VoiceLinkError::AudioDevice(err.to_string())
    }
}

#[cfg(feature = "webrtc")]
impl From<webrtc::Error> for VoiceLinkError {
    fn from(err: webrtc::Error) -> Self {
        VoiceLinkError::Transport(err.to_string())
    }
}
