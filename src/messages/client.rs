//! Inbound browser envelopes.
//!
//! Text frames from a browser client carry `{"type": ..., "payload": ...}`.
//! Parsing happens in two stages: the envelope tag first, then the payload
//! shape for that tag. The result is a closed [`ClientRequest`].

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: Tagged<EnvelopeKind>,
    #[serde(default)]
    payload: Value,
}

/// A known tag, or the raw text of one we do not handle.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Tagged<T> {
    Known(T),
    Other(String),
}

impl<T> Default for Tagged<T> {
    fn default() -> Self {
        Tagged::Other(String::new())
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
enum EnvelopeKind {
    #[serde(alias = "audio_binary")]
    Audio,
    Control,
}

#[derive(Debug, Deserialize)]
struct AudioPayload {
    #[serde(default)]
    data: String,
}

#[derive(Debug, Deserialize)]
struct ControlPayload {
    #[serde(default)]
    action: Tagged<ControlAction>,
}

/// A validated request from a browser client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientRequest {
    /// Decoded audio bytes to accumulate for the current turn.
    Audio(Vec<u8>),
    Control(ControlAction),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    Ping,
    EndTurn,
}

/// Why an inbound envelope was rejected. The display text is sent back to
/// the client verbatim inside an `INVALID_MESSAGE` error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    #[error("Invalid message format")]
    Malformed,
    #[error("Invalid audio payload")]
    InvalidAudioPayload,
    #[error("Invalid base64 audio data")]
    InvalidBase64,
    #[error("Invalid control payload")]
    InvalidControlPayload,
    #[error("Unknown control action: {0}")]
    UnknownAction(String),
    #[error("Unknown message type: {0}")]
    UnknownType(String),
}

/// Parse one browser text frame.
///
/// `audio_binary` is an alias of `audio` and goes through the same validation.
pub fn parse_client_message(text: &str) -> Result<ClientRequest, EnvelopeError> {
    let envelope: RawEnvelope =
        serde_json::from_str(text).map_err(|_| EnvelopeError::Malformed)?;

    match envelope.kind {
        Tagged::Known(EnvelopeKind::Audio) => {
            let payload: AudioPayload = serde_json::from_value(envelope.payload)
                .map_err(|_| EnvelopeError::InvalidAudioPayload)?;
            let bytes = B64
                .decode(payload.data.as_bytes())
                .map_err(|_| EnvelopeError::InvalidBase64)?;
            Ok(ClientRequest::Audio(bytes))
        }
        Tagged::Known(EnvelopeKind::Control) => {
            let payload: ControlPayload = serde_json::from_value(envelope.payload)
                .map_err(|_| EnvelopeError::InvalidControlPayload)?;
            match payload.action {
                Tagged::Known(action) => Ok(ClientRequest::Control(action)),
                Tagged::Other(action) => Err(EnvelopeError::UnknownAction(action)),
            }
        }
        Tagged::Other(kind) => Err(EnvelopeError::UnknownType(kind)),
    }
}
