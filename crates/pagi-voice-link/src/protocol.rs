//! Event channel wire format.
//!
//! The remote peer speaks a versioned JSON event protocol over the ordered data channel.
//! Several wire names map onto one variant so older and newer protocol revisions both
//! work. Unknown event types parse as [`InboundEvent::Unknown`] and are ignored.

use crate::config::SessionConfig;
use crate::error::{VoiceLinkError, VoiceLinkResult};
use serde::{Deserialize, Serialize};

/// Terminal status reported by the remote peer for one response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    #[default]
    Completed,
    Cancelled,
    Failed,
    Incomplete,
    InProgress,
    #[serde(other)]
    Unknown,
}

impl ResponseStatus {
    /// The remote peer gave up on the answer; worth repairing.
    pub fn is_failure(self) -> bool {
        matches!(self, ResponseStatus::Failed | ResponseStatus::Incomplete)
    }

    /// Only `completed` vouches for the answer; a missing status defaults to it.
    pub fn is_confirmed(self) -> bool {
        self == ResponseStatus::Completed
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct ResponseRef {
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct ContentPart {
    #[serde(default)]
    pub transcript: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct OutputItem {
    #[serde(default)]
    pub content: Vec<ContentPart>,
}

/// Body of a `response.done` event.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct ResponseBody {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub status: ResponseStatus,
    #[serde(default)]
    pub output: Vec<OutputItem>,
}

impl ResponseBody {
    /// Concatenated transcript/text of every output part, if any was reported.
    pub fn text(&self) -> Option<String> {
        let parts: Vec<&str> = self
            .output
            .iter()
            .flat_map(|item| item.content.iter())
            .filter_map(|part| part.transcript.as_deref().or(part.text.as_deref()))
            .filter(|s| !s.trim().is_empty())
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(" "))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub message: String,
}

/// One parsed message from the event channel.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum InboundEvent {
    #[serde(rename = "session.created", alias = "session.updated")]
    SessionReady {},

    #[serde(rename = "input_audio_buffer.speech_started")]
    UserSpeechStarted {},

    #[serde(rename = "input_audio_buffer.speech_stopped")]
    UserSpeechStopped {},

    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    UserTranscript {
        #[serde(default)]
        item_id: Option<String>,
        #[serde(default)]
        transcript: String,
    },

    #[serde(rename = "response.created")]
    AnswerStarted {
        #[serde(default)]
        response: ResponseRef,
    },

    #[serde(
        rename = "response.audio_transcript.delta",
        alias = "response.output_audio_transcript.delta",
        alias = "response.text.delta",
        alias = "response.output_text.delta"
    )]
    TextDelta {
        #[serde(default)]
        response_id: Option<String>,
        #[serde(default)]
        delta: String,
    },

    #[serde(rename = "response.audio.delta", alias = "response.output_audio.delta")]
    AudioDelta {
        #[serde(default)]
        response_id: Option<String>,
    },

    #[serde(
        rename = "response.audio_transcript.done",
        alias = "response.output_audio_transcript.done",
        alias = "response.text.done",
        alias = "response.output_text.done"
    )]
    SegmentDone {
        #[serde(default)]
        response_id: Option<String>,
        #[serde(default)]
        transcript: Option<String>,
        #[serde(default)]
        text: Option<String>,
    },

    #[serde(rename = "response.done")]
    AnswerFinalized {
        #[serde(default)]
        response: ResponseBody,
    },

    #[serde(rename = "response.cancelled")]
    AnswerCancelled {
        #[serde(default)]
        response_id: Option<String>,
    },

    #[serde(rename = "output_audio_buffer.stopped")]
    PlaybackStopped {},

    #[serde(rename = "rate_limits.updated")]
    RateLimits {},

    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        error: ErrorBody,
    },

    #[serde(other)]
    Unknown,
}

/// An inbound event together with its raw wire type, kept for logging.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub kind: String,
    pub event: InboundEvent,
}

impl InboundMessage {
    /// Parse one channel message. Malformed JSON or a missing `type` is a protocol fault.
    pub fn parse(text: &str) -> VoiceLinkResult<Self> {
        let value: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| VoiceLinkError::Protocol(format!("invalid JSON: {e}")))?;
        let kind = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| VoiceLinkError::Protocol("event without a type tag".to_string()))?
            .to_string();
        let event = serde_json::from_value(value)
            .map_err(|e| VoiceLinkError::Protocol(format!("malformed `{kind}` event: {e}")))?;
        Ok(Self { kind, event })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptionSettings {
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSettings {
    pub voice: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    pub input_audio_transcription: TranscriptionSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InputText {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationItem {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub role: &'static str,
    pub content: Vec<InputText>,
}

/// Client events sent over the data channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum OutboundEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { event_id: String, session: SessionSettings },

    #[serde(rename = "conversation.item.create")]
    CreateItem { event_id: String, item: ConversationItem },

    #[serde(rename = "response.create")]
    CreateResponse { event_id: String },

    #[serde(rename = "response.cancel")]
    CancelResponse { event_id: String },
}

fn next_event_id() -> String {
    format!("evt_{}", uuid::Uuid::new_v4().simple())
}

impl OutboundEvent {
    pub fn session_update(config: &SessionConfig) -> Self {
        OutboundEvent::SessionUpdate {
            event_id: next_event_id(),
            session: SessionSettings {
                voice: config.voice.clone(),
                instructions: config.instructions.clone(),
                input_audio_transcription: TranscriptionSettings {
                    model: config.transcription_model.clone(),
                },
            },
        }
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        OutboundEvent::CreateItem {
            event_id: next_event_id(),
            item: ConversationItem {
                kind: "message",
                role: "user",
                content: vec![InputText {
                    kind: "input_text",
                    text: text.into(),
                }],
            },
        }
    }

    pub fn create_response() -> Self {
        OutboundEvent::CreateResponse {
            event_id: next_event_id(),
        }
    }

    pub fn cancel_response() -> Self {
        OutboundEvent::CancelResponse {
            event_id: next_event_id(),
        }
    }

    pub fn to_json(&self) -> VoiceLinkResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}
