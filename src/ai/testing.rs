//! In-process stand-in for the AI service, used by session and manager tests.

use crate::ai::{AiConnector, AiError, AiEvent, AiHandle, AiLink, AiSetup, ToolResponse};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// One upstream call observed by a [`FakeHandle`].
#[derive(Debug, Clone, PartialEq)]
pub enum AiCall {
    Audio(Vec<u8>),
    AudioBatch(Vec<u8>),
    EndOfTurn,
    ToolResponse(Vec<ToolResponse>),
    Close,
}

pub struct FakeHandle {
    calls: Mutex<Vec<AiCall>>,
    events: mpsc::Sender<AiEvent>,
    fail_sends: AtomicBool,
}

impl FakeHandle {
    pub fn calls(&self) -> Vec<AiCall> {
        self.calls.lock().clone()
    }

    /// Inject an event as if the service had produced it.
    pub async fn emit(&self, event: AiEvent) {
        let _ = self.events.send(event).await;
    }

    /// Make every subsequent send fail as if the upstream socket were gone.
    pub fn fail_sends(&self) {
        self.fail_sends.store(true, Ordering::SeqCst);
    }

    fn record(&self, call: AiCall) -> Result<(), AiError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(AiError::ConnectionClosed);
        }
        self.calls.lock().push(call);
        Ok(())
    }
}

#[async_trait]
impl AiHandle for FakeHandle {
    async fn send_audio(&self, pcm: Vec<u8>) -> Result<(), AiError> {
        self.record(AiCall::Audio(pcm))
    }

    async fn send_audio_batch(&self, pcm: Vec<u8>) -> Result<(), AiError> {
        if pcm.is_empty() {
            return Ok(());
        }
        self.record(AiCall::AudioBatch(pcm))?;
        self.record(AiCall::EndOfTurn)
    }

    async fn send_tool_response(&self, responses: Vec<ToolResponse>) -> Result<(), AiError> {
        self.record(AiCall::ToolResponse(responses))
    }

    async fn close(&self) {
        self.calls.lock().push(AiCall::Close);
    }
}

/// Connector handing out [`FakeHandle`]s and remembering each one.
#[derive(Default)]
pub struct FakeConnector {
    handles: Mutex<Vec<Arc<FakeHandle>>>,
    refuse: AtomicBool,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make subsequent connects fail.
    pub fn refuse_connections(&self) {
        self.refuse.store(true, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn handle(&self, index: usize) -> Arc<FakeHandle> {
        Arc::clone(&self.handles.lock()[index])
    }
}

#[async_trait]
impl AiConnector for FakeConnector {
    async fn connect(&self, _setup: &AiSetup) -> Result<AiLink, AiError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(AiError::Connect("refused by test".to_string()));
        }
        let (tx, rx) = mpsc::channel(crate::ai::AI_EVENT_QUEUE_SIZE);
        let handle = Arc::new(FakeHandle {
            calls: Mutex::new(Vec::new()),
            events: tx,
            fail_sends: AtomicBool::new(false),
        });
        self.handles.lock().push(Arc::clone(&handle));
        Ok(AiLink {
            handle,
            events: rx,
        })
    }
}

/// Poll `condition` until it holds or `limit` elapses.
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
