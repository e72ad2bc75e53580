//! # Conversational AI Service
//!
//! The contract sessions use to talk to the remote speech-to-speech service.
//!
//! ## Shape of the contract:
//! - [`AiConnector::connect`] opens one streaming conversation and returns an [`AiLink`]
//! - the link's **handle** pushes audio, end-of-turn markers and tool answers upstream
//! - the link's **events** channel delivers everything the service produces
//!
//! Events are plain messages on a channel the session owns, so the service
//! never calls back into session internals.

pub mod gemini;
pub mod tools;

#[cfg(test)]
pub mod testing;

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Capacity of the channel carrying service events to a session.
pub const AI_EVENT_QUEUE_SIZE: usize = 256;

/// A function the service wants the gateway to run.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub args: Value,
}

/// The answer to a [`ToolCall`], echoed back with the same id and name.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResponse {
    pub id: String,
    pub name: String,
    pub response: Value,
}

/// Tool advertised to the service at setup time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
}

/// Per-conversation setup sent when connecting.
#[derive(Debug, Clone, Default)]
pub struct AiSetup {
    pub system_prompt: String,
    pub tools: Vec<ToolDeclaration>,
}

/// Something the service produced.
#[derive(Debug, Clone, PartialEq)]
pub enum AiEvent {
    /// 24 kHz, 16-bit little-endian PCM
    Audio(Vec<u8>),
    Text(String),
    TurnComplete,
    ToolCall(Vec<ToolCall>),
    Error(AiError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AiError {
    #[error("failed to connect to AI service: {0}")]
    Connect(String),
    #[error("AI service setup failed: {0}")]
    Setup(String),
    #[error("AI service connection closed")]
    ConnectionClosed,
    #[error("AI service protocol error: {0}")]
    Protocol(String),
}

impl AiError {
    /// Whether the upstream conversation is gone for good.
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, AiError::ConnectionClosed)
    }
}

/// Upstream half of a live conversation.
#[async_trait]
pub trait AiHandle: Send + Sync {
    /// Stream 16 kHz PCM as it arrives.
    async fn send_audio(&self, pcm: Vec<u8>) -> Result<(), AiError>;

    /// Send a complete turn of 16 kHz PCM followed by an end-of-turn marker.
    /// An empty batch sends nothing.
    async fn send_audio_batch(&self, pcm: Vec<u8>) -> Result<(), AiError>;

    async fn send_tool_response(&self, responses: Vec<ToolResponse>) -> Result<(), AiError>;

    /// Release the conversation. Safe to call more than once.
    async fn close(&self);
}

/// Opens conversations with the service.
#[async_trait]
pub trait AiConnector: Send + Sync {
    async fn connect(&self, setup: &AiSetup) -> Result<AiLink, AiError>;
}

/// A connected conversation: the upstream handle plus the event stream.
pub struct AiLink {
    pub handle: Arc<dyn AiHandle>,
    pub events: mpsc::Receiver<AiEvent>,
}

impl std::fmt::Debug for AiLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AiLink").finish_non_exhaustive()
    }
}
