//! # Session Registry
//!
//! Tracks every live [`Session`] by id, enforces the concurrency cap, evicts
//! idle sessions and tears everything down on shutdown.
//!
//! ## Locking:
//! The registry lock only guards the map. Connecting to the AI service and
//! closing sessions both happen outside it, so a slow upstream never blocks
//! lookups or the health endpoint.

use crate::ai::tools::ToolBox;
use crate::ai::{AiConnector, AiSetup};
use crate::config::SessionsConfig;
use crate::session::mirror::SessionMirror;
use crate::session::{ConnectionMode, Session, SessionError, SessionSettings, SessionSummary};
use chrono::Utc;
use futures_util::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    max_concurrent_sessions: usize,
    session_timeout: Duration,
    settings: SessionSettings,
    connector: Arc<dyn AiConnector>,
    setup: AiSetup,
    tools: Arc<ToolBox>,
    mirror: Arc<dyn SessionMirror>,
    accepting: AtomicBool,
}

/// Aggregate view served by the sessions endpoint.
#[derive(Debug, Serialize)]
pub struct SessionManagerSummary {
    pub total_sessions: usize,
    pub max_sessions: usize,
    pub mode_counts: HashMap<String, usize>,
    pub buffered_bytes: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mirrored_sessions: Option<usize>,
    pub sessions: Vec<SessionSummary>,
}

impl SessionManager {
    pub fn new(
        config: &SessionsConfig,
        connector: Arc<dyn AiConnector>,
        setup: AiSetup,
        tools: Arc<ToolBox>,
        mirror: Arc<dyn SessionMirror>,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_concurrent_sessions: config.max_concurrent_sessions,
            session_timeout: config.session_timeout(),
            settings: SessionSettings::from(config),
            connector,
            setup,
            tools,
            mirror,
            accepting: AtomicBool::new(true),
        }
    }

    /// Connect a new AI conversation and register a session around it.
    ///
    /// ## Returns:
    /// - **Ok(session)**: registered, in the `Open` phase, ready for [`Session::start`]
    /// - **Err(CapacityExceeded)**: the cap was reached (checked before and after connecting)
    /// - **Err(ShuttingDown)**: [`SessionManager::shutdown`] has run
    /// - **Err(Ai)**: the service could not be reached or rejected setup
    pub async fn create_session(&self, mode: ConnectionMode) -> Result<Arc<Session>, SessionError> {
        self.check_admission(self.active_session_count())?;

        let link = self.connector.connect(&self.setup).await?;
        let id = Uuid::new_v4().to_string();
        let session = Session::new(
            id.clone(),
            mode,
            link,
            Arc::clone(&self.tools),
            self.settings.clone(),
        );

        // The cap may have been reached while connecting
        let admitted = {
            let mut sessions = self.sessions.write();
            let admitted = self.check_admission(sessions.len());
            if admitted.is_ok() {
                sessions.insert(id.clone(), Arc::clone(&session));
            }
            admitted
        };
        if let Err(e) = admitted {
            session.close().await;
            return Err(e);
        }

        self.mirror.record(&session.metadata());
        info!(
            session_id = %id,
            mode = mode.as_str(),
            active = self.active_session_count(),
            "session created"
        );
        Ok(session)
    }

    fn check_admission(&self, current: usize) -> Result<(), SessionError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(SessionError::ShuttingDown);
        }
        if current >= self.max_concurrent_sessions {
            return Err(SessionError::CapacityExceeded {
                max: self.max_concurrent_sessions,
            });
        }
        Ok(())
    }

    pub fn get_session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(session_id).cloned()
    }

    /// Unregister and close a session. Returns false if the id was unknown.
    pub async fn remove_session(&self, session_id: &str) -> bool {
        let removed = self.sessions.write().remove(session_id);
        match removed {
            Some(session) => {
                let phase = session.phase();
                self.mirror.forget(session_id);
                session.close().await;
                info!(
                    session_id = %session_id,
                    mode = session.mode().as_str(),
                    ?phase,
                    active = self.active_session_count(),
                    "session removed"
                );
                true
            }
            None => false,
        }
    }

    pub fn active_session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Close every session idle for longer than the session timeout.
    pub async fn cleanup_inactive(&self) -> usize {
        let now = Utc::now();
        let expired: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.write();
            let ids: Vec<String> = sessions
                .iter()
                .filter(|(_, session)| session.idle_for(now) > self.session_timeout)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };

        for session in &expired {
            warn!(
                session_id = %session.id(),
                idle_secs = session.idle_for(now).as_secs(),
                "evicting idle session"
            );
            self.mirror.forget(session.id());
        }
        join_all(expired.iter().map(|session| session.close())).await;

        expired.len()
    }

    /// Run [`SessionManager::cleanup_inactive`] every `interval` until `shutdown` fires.
    pub fn spawn_cleanup_task(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = manager.cleanup_inactive().await;
                        if removed > 0 {
                            info!(
                                removed,
                                active = manager.active_session_count(),
                                "idle session cleanup"
                            );
                        }
                    }
                }
            }
        })
    }

    /// Stop admitting sessions and close every live one concurrently.
    pub async fn shutdown(&self) -> usize {
        self.accepting.store(false, Ordering::SeqCst);

        let drained: Vec<Arc<Session>> = self.sessions.write().drain().map(|(_, s)| s).collect();
        for session in &drained {
            self.mirror.forget(session.id());
        }
        join_all(drained.iter().map(|session| session.close())).await;

        info!(closed = drained.len(), "all sessions closed");
        drained.len()
    }

    pub fn get_sessions_summary(&self) -> SessionManagerSummary {
        let mut sessions: Vec<SessionSummary> = self
            .sessions
            .read()
            .values()
            .map(|session| session.summary())
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        let mut mode_counts = HashMap::new();
        for summary in &sessions {
            *mode_counts
                .entry(summary.mode.as_str().to_string())
                .or_insert(0) += 1;
        }

        SessionManagerSummary {
            total_sessions: sessions.len(),
            max_sessions: self.max_concurrent_sessions,
            mode_counts,
            buffered_bytes: sessions.iter().map(|s| s.buffered_bytes).sum(),
            mirrored_sessions: self.mirror.mirrored_count(),
            sessions,
        }
    }
}
