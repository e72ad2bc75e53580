//! Outbound browser envelopes.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use serde::Serialize;

/// MIME type advertised for audio relayed from the AI service.
pub const AI_AUDIO_MIME_TYPE: &str = "audio/pcm;rate=24000";

/// Error codes reported to browser clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidMessage,
    #[serde(rename = "GEMINI_ERROR")]
    AiService,
    SessionFailed,
    ConnectionClosed,
    RateLimited,
    BufferFull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Audio,
    Text,
    Status,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ServerPayload {
    Audio {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: &'static str,
    },
    Text {
        text: String,
    },
    Status {
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
}

/// `{"type", "sessionId", "payload"}` envelope sent to browser clients.
///
/// An empty session id is omitted from the JSON, which is how failures that
/// happen before a session exists are reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(rename = "sessionId", skip_serializing_if = "String::is_empty")]
    pub session_id: String,
    pub payload: ServerPayload,
}

impl ServerMessage {
    /// Wrap raw 24 kHz PCM from the AI service.
    pub fn audio(session_id: &str, pcm: &[u8]) -> Self {
        Self {
            kind: MessageKind::Audio,
            session_id: session_id.to_string(),
            payload: ServerPayload::Audio {
                data: B64.encode(pcm),
                mime_type: AI_AUDIO_MIME_TYPE,
            },
        }
    }

    pub fn text(session_id: &str, text: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Text,
            session_id: session_id.to_string(),
            payload: ServerPayload::Text { text: text.into() },
        }
    }

    pub fn status(session_id: &str, status: &str, message: Option<&str>) -> Self {
        Self {
            kind: MessageKind::Status,
            session_id: session_id.to_string(),
            payload: ServerPayload::Status {
                status: status.to_string(),
                message: message.map(str::to_string),
            },
        }
    }

    pub fn error(session_id: &str, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Error,
            session_id: session_id.to_string(),
            payload: ServerPayload::Error {
                code,
                message: message.into(),
            },
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
