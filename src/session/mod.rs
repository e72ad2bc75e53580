//! # Session Management
//!
//! A session bridges one client connection to one AI service conversation.
//!
//! ## Session Lifecycle:
//! 1. **Open**: created by the manager, AI conversation connected, not yet started
//! 2. **Running**: read loop, write pump and AI event pump are live
//! 3. **Closing**: teardown in progress (entered exactly once)
//! 4. **Closed**: workers joined, buffer cleared, AI conversation released
//!
//! ## Components:
//! - **bridge**: the per-connection [`Session`] and its workers
//! - **manager**: registry with a concurrency cap, idle eviction and shutdown
//! - **mirror**: optional best-effort metadata mirror for external observers

pub mod bridge;
pub mod manager;
pub mod mirror;

pub use bridge::Session;
pub use manager::SessionManager;

use crate::ai::AiError;
use crate::config::SessionsConfig;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Which wire protocol a session speaks to its client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    Browser,
    Telephony,
}

impl ConnectionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionMode::Browser => "browser",
            ConnectionMode::Telephony => "telephony",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    Open,
    Running,
    Closing,
    Closed,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("maximum sessions reached ({max})")]
    CapacityExceeded { max: usize },
    #[error("server is shutting down")]
    ShuttingDown,
    #[error(transparent)]
    Ai(#[from] AiError),
    #[error("session {id} cannot start while {phase:?}")]
    InvalidState { id: String, phase: SessionPhase },
}

/// Per-session limits and timers, derived from [`SessionsConfig`].
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub max_buffer_bytes: usize,
    pub outbound_queue_size: usize,
    pub write_timeout: Duration,
    pub keepalive: Duration,
    pub close_grace: Duration,
}

impl From<&SessionsConfig> for SessionSettings {
    fn from(config: &SessionsConfig) -> Self {
        Self {
            max_buffer_bytes: config.max_buffer_bytes,
            outbound_queue_size: config.outbound_queue_size,
            write_timeout: config.write_timeout(),
            keepalive: config.keepalive(),
            close_grace: config.close_grace(),
        }
    }
}

/// Point-in-time view of a session for the HTTP API and the metadata mirror.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub mode: ConnectionMode,
    pub phase: SessionPhase,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_sid: Option<String>,
    pub buffered_bytes: usize,
    pub buffer_limit_bytes: usize,
    pub dropped_messages: u64,
}
