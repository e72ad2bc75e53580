//! Telephony media-stream frames.
//!
//! Inbound frames are JSON objects discriminated by an `event` field. Only the
//! fields the gateway acts on are extracted; everything else is ignored.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Deserialize)]
struct RawEvent {
    event: Option<String>,
    start: Option<RawStart>,
    media: Option<RawMedia>,
    mark: Option<RawMark>,
}

#[derive(Debug, Deserialize)]
struct RawStart {
    #[serde(rename = "streamSid")]
    stream_sid: Option<String>,
    #[serde(rename = "callSid")]
    call_sid: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawMedia {
    payload: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawMark {
    name: Option<String>,
}

/// A parsed inbound telephony event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TelephonyEvent {
    Connected,
    Start {
        stream_sid: String,
        call_sid: Option<String>,
    },
    /// 8 kHz mu-law audio, already base64-decoded.
    Media(Vec<u8>),
    Stop,
    Mark(Option<String>),
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TelephonyError {
    #[error("failed to parse telephony frame: {0}")]
    Malformed(String),
    #[error("telephony frame missing 'event' field")]
    MissingEvent,
    #[error("'start' event missing streamSid")]
    MissingStreamSid,
    #[error("'media' event missing payload")]
    MissingPayload,
    #[error("failed to decode media payload: {0}")]
    InvalidPayload(String),
}

impl TelephonyEvent {
    pub fn parse(text: &str) -> Result<Self, TelephonyError> {
        let raw: RawEvent =
            serde_json::from_str(text).map_err(|e| TelephonyError::Malformed(e.to_string()))?;
        let event = raw.event.ok_or(TelephonyError::MissingEvent)?;

        match event.as_str() {
            "connected" => Ok(Self::Connected),
            "start" => {
                let start = raw.start.ok_or(TelephonyError::MissingStreamSid)?;
                let stream_sid = start.stream_sid.ok_or(TelephonyError::MissingStreamSid)?;
                Ok(Self::Start {
                    stream_sid,
                    call_sid: start.call_sid,
                })
            }
            "media" => {
                let payload = raw
                    .media
                    .and_then(|m| m.payload)
                    .ok_or(TelephonyError::MissingPayload)?;
                let audio = B64
                    .decode(payload.as_bytes())
                    .map_err(|e| TelephonyError::InvalidPayload(e.to_string()))?;
                Ok(Self::Media(audio))
            }
            "stop" => Ok(Self::Stop),
            "mark" => Ok(Self::Mark(raw.mark.and_then(|m| m.name))),
            _ => Ok(Self::Other(event)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MediaBody {
    pub payload: String,
}

/// Outbound `{"event": "media", "streamSid", "media": {"payload"}}` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TelephonyMediaFrame {
    pub event: &'static str,
    #[serde(rename = "streamSid")]
    pub stream_sid: String,
    pub media: MediaBody,
}

impl TelephonyMediaFrame {
    /// Wrap 8 kHz mu-law bytes for the given stream.
    pub fn new(stream_sid: &str, mulaw: &[u8]) -> Self {
        Self {
            event: "media",
            stream_sid: stream_sid.to_string(),
            media: MediaBody {
                payload: B64.encode(mulaw),
            },
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
