//! Best-effort copy of session metadata for observers outside the process.
//!
//! The registry in [`SessionManager`](super::SessionManager) is authoritative;
//! the mirror is written on create and cleared on removal, and a failure to
//! write it never affects a session.

use crate::config::MirrorKind;
use crate::session::ConnectionMode;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// What gets mirrored for each live session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionMetadata {
    pub id: String,
    pub mode: ConnectionMode,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

pub trait SessionMirror: Send + Sync {
    fn record(&self, metadata: &SessionMetadata);

    fn forget(&self, id: &str);

    /// Number of mirrored sessions, if the backend can tell.
    fn mirrored_count(&self) -> Option<usize>;
}

/// Mirror that stores nothing.
#[derive(Debug, Default)]
pub struct NoopMirror;

impl SessionMirror for NoopMirror {
    fn record(&self, _metadata: &SessionMetadata) {}

    fn forget(&self, _id: &str) {}

    fn mirrored_count(&self) -> Option<usize> {
        None
    }
}

#[derive(Debug, Default)]
pub struct InMemoryMirror {
    entries: RwLock<HashMap<String, SessionMetadata>>,
}

impl InMemoryMirror {
    #[cfg(test)]
    pub fn get(&self, id: &str) -> Option<SessionMetadata> {
        self.entries.read().get(id).cloned()
    }
}

impl SessionMirror for InMemoryMirror {
    fn record(&self, metadata: &SessionMetadata) {
        self.entries
            .write()
            .insert(metadata.id.clone(), metadata.clone());
    }

    fn forget(&self, id: &str) {
        self.entries.write().remove(id);
    }

    fn mirrored_count(&self) -> Option<usize> {
        Some(self.entries.read().len())
    }
}

pub fn mirror_for(kind: MirrorKind) -> Arc<dyn SessionMirror> {
    match kind {
        MirrorKind::None => Arc::new(NoopMirror),
        MirrorKind::Memory => Arc::new(InMemoryMirror::default()),
    }
}
