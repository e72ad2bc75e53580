//! # Wire Messages
//!
//! JSON shapes exchanged with connected clients.
//!
//! - **client**: inbound browser envelopes (`audio`, `audio_binary`, `control`)
//! - **server**: outbound browser envelopes (`audio`, `text`, `status`, `error`)
//! - **telephony**: media-stream events in both directions

pub mod client;
pub mod server;
pub mod telephony;

pub use client::{parse_client_message, ClientRequest, ControlAction};
pub use server::{ErrorCode, ServerMessage};
pub use telephony::{TelephonyEvent, TelephonyMediaFrame};

/// Anything a session can queue for its write pump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    Client(ServerMessage),
    Telephony(TelephonyMediaFrame),
}

impl OutboundMessage {
    pub fn to_json(&self) -> serde_json::Result<String> {
        match self {
            OutboundMessage::Client(msg) => msg.to_json(),
            OutboundMessage::Telephony(frame) => frame.to_json(),
        }
    }
}

impl From<ServerMessage> for OutboundMessage {
    fn from(msg: ServerMessage) -> Self {
        OutboundMessage::Client(msg)
    }
}

impl From<TelephonyMediaFrame> for OutboundMessage {
    fn from(frame: TelephonyMediaFrame) -> Self {
        OutboundMessage::Telephony(frame)
    }
}
