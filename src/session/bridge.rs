//! # Client Session
//!
//! One [`Session`] owns one client WebSocket and one AI service conversation.
//!
//! ## Workers:
//! - **read loop**: the only reader of the socket; parses frames and drives
//!   the buffer, the telephony state and upstream sends
//! - **write pump**: the only writer of the socket; drains the bounded
//!   outbound queue, batching whatever is already queued before flushing
//! - **AI event pump**: turns service events into outbound messages
//!
//! Every other part of the session only enqueues. A full queue drops the new
//! message instead of blocking the producer.
//!
//! ## Teardown:
//! Workers never tear the session down themselves. When one of them stops it
//! cancels the session token; whoever owns the session (the gateway or the
//! manager) then calls [`Session::close`], which runs exactly once.

use crate::ai::tools::ToolBox;
use crate::ai::{AiEvent, AiHandle, AiLink};
use crate::audio::{codec, AudioBuffer};
use crate::messages::{
    parse_client_message, ClientRequest, ControlAction, ErrorCode, OutboundMessage, ServerMessage,
    TelephonyEvent, TelephonyMediaFrame,
};
use crate::session::mirror::SessionMetadata;
use crate::session::{ConnectionMode, SessionError, SessionPhase, SessionSettings, SessionSummary};
use chrono::{DateTime, Utc};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Upper bound on messages written between two flushes.
const MAX_WRITE_BATCH: usize = 32;

#[derive(Debug)]
struct SessionState {
    phase: SessionPhase,
    stream_sid: Option<String>,
    last_activity: DateTime<Utc>,
}

pub struct Session {
    id: String,
    mode: ConnectionMode,
    created_at: DateTime<Utc>,
    state: Mutex<SessionState>,
    buffer: AudioBuffer,
    outbound_tx: mpsc::Sender<OutboundMessage>,
    outbound_rx: Mutex<Option<mpsc::Receiver<OutboundMessage>>>,
    ai: Arc<dyn AiHandle>,
    ai_events: Mutex<Option<mpsc::Receiver<AiEvent>>>,
    tools: Arc<ToolBox>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    dropped: AtomicU64,
    settings: SessionSettings,
}

impl Session {
    pub fn new(
        id: String,
        mode: ConnectionMode,
        link: AiLink,
        tools: Arc<ToolBox>,
        settings: SessionSettings,
    ) -> Arc<Self> {
        let (outbound_tx, outbound_rx) = mpsc::channel(settings.outbound_queue_size);
        let now = Utc::now();

        Arc::new(Self {
            id,
            mode,
            created_at: now,
            state: Mutex::new(SessionState {
                phase: SessionPhase::Open,
                stream_sid: None,
                last_activity: now,
            }),
            buffer: AudioBuffer::new(settings.max_buffer_bytes),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            ai: link.handle,
            ai_events: Mutex::new(Some(link.events)),
            tools,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            dropped: AtomicU64::new(0),
            settings,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn mode(&self) -> ConnectionMode {
        self.mode
    }

    pub fn phase(&self) -> SessionPhase {
        self.state.lock().phase
    }

    pub fn stream_sid(&self) -> Option<String> {
        self.state.lock().stream_sid.clone()
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.state.lock().last_activity
    }

    /// How long the session has gone without inbound or outbound traffic.
    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_activity()).to_std().unwrap_or_default()
    }

    pub fn dropped_messages(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Resolves once any worker has stopped or the session was closed.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn summary(&self) -> SessionSummary {
        let state = self.state.lock();
        SessionSummary {
            id: self.id.clone(),
            mode: self.mode,
            phase: state.phase,
            created_at: self.created_at,
            last_activity: state.last_activity,
            stream_sid: state.stream_sid.clone(),
            buffered_bytes: self.buffer.size(),
            buffer_limit_bytes: self.buffer.max_size(),
            dropped_messages: self.dropped_messages(),
        }
    }

    pub fn metadata(&self) -> SessionMetadata {
        SessionMetadata {
            id: self.id.clone(),
            mode: self.mode,
            created_at: self.created_at,
            last_activity: self.last_activity(),
        }
    }

    /// Take ownership of the client socket and spawn the workers.
    ///
    /// Only valid once, on an `Open` session.
    pub fn start<S>(self: &Arc<Self>, ws: WebSocketStream<S>) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        {
            let mut state = self.state.lock();
            if state.phase != SessionPhase::Open {
                return Err(SessionError::InvalidState {
                    id: self.id.clone(),
                    phase: state.phase,
                });
            }
            state.phase = SessionPhase::Running;
        }

        let outbound_rx = self.outbound_rx.lock().take();
        let ai_events = self.ai_events.lock().take();
        let (Some(outbound_rx), Some(ai_events)) = (outbound_rx, ai_events) else {
            return Err(SessionError::InvalidState {
                id: self.id.clone(),
                phase: SessionPhase::Running,
            });
        };

        let (sink, stream) = ws.split();

        if self.mode == ConnectionMode::Browser {
            self.queue_message(ServerMessage::status(
                &self.id,
                "connected",
                Some("Session established"),
            ));
        }

        let handles = vec![
            tokio::spawn(Arc::clone(self).write_pump(sink, outbound_rx)),
            tokio::spawn(Arc::clone(self).read_loop(stream)),
            tokio::spawn(Arc::clone(self).ai_event_pump(ai_events)),
        ];
        self.tasks.lock().extend(handles);

        info!(session_id = %self.id, mode = self.mode.as_str(), "session started");
        Ok(())
    }

    /// Tear the session down. The first call does the work; later calls return
    /// immediately.
    pub async fn close(&self) {
        {
            let mut state = self.state.lock();
            match state.phase {
                SessionPhase::Closing | SessionPhase::Closed => return,
                SessionPhase::Open | SessionPhase::Running => state.phase = SessionPhase::Closing,
            }
        }

        self.cancel.cancel();

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for mut handle in handles {
            if tokio::time::timeout(self.settings.close_grace, &mut handle)
                .await
                .is_err()
            {
                warn!(session_id = %self.id, "worker did not stop in time; aborting");
                handle.abort();
            }
        }

        self.buffer.clear();
        self.ai.close().await;
        self.state.lock().phase = SessionPhase::Closed;

        info!(
            session_id = %self.id,
            mode = self.mode.as_str(),
            dropped = self.dropped_messages(),
            "session closed"
        );
    }

    fn touch(&self) {
        self.state.lock().last_activity = Utc::now();
    }

    /// Enqueue for the write pump without blocking.
    ///
    /// Returns false when the message was not queued (session closing or queue full).
    fn queue_message(&self, message: impl Into<OutboundMessage>) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }

        match self.outbound_tx.try_send(message.into()) {
            Ok(()) => {
                self.touch();
                true
            }
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(session_id = %self.id, dropped, "outbound queue full; dropping message");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    fn queue_error(&self, code: ErrorCode, message: impl Into<String>) {
        self.queue_message(ServerMessage::error(&self.id, code, message));
    }

    async fn write_pump<S>(
        self: Arc<Self>,
        mut sink: SplitSink<WebSocketStream<S>, Message>,
        mut outbound: mpsc::Receiver<OutboundMessage>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let period = self.settings.keepalive;
        let mut keepalive = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut writable = true;
        loop {
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                next = outbound.recv() => match next {
                    Some(first) => self.write_batch(&mut sink, &mut outbound, first).await,
                    None => break,
                },
                _ = keepalive.tick() => self.write_with_timeout(sink.send(Message::Ping(Vec::new()))).await,
            };

            if let Err(e) = result {
                warn!(session_id = %self.id, error = %e, "client write failed");
                writable = false;
                break;
            }
        }
        self.cancel.cancel();

        // Messages queued before cancellation go out ahead of the close frame,
        // all under a single write deadline.
        if writable {
            let pending: Vec<OutboundMessage> =
                std::iter::from_fn(|| outbound.try_recv().ok()).collect();
            let flushed = pending.len();
            let id = &self.id;
            let result = self
                .write_with_timeout(async move {
                    feed_messages(&mut sink, pending, id).await?;
                    sink.send(Message::Close(None)).await
                })
                .await;
            match result {
                Ok(()) => debug!(session_id = %self.id, flushed, "close frame sent"),
                Err(e) => debug!(session_id = %self.id, flushed, error = %e, "close handshake failed"),
            }
        }
        debug!(session_id = %self.id, "write pump stopped");
    }

    async fn write_batch<S>(
        &self,
        sink: &mut SplitSink<WebSocketStream<S>, Message>,
        outbound: &mut mpsc::Receiver<OutboundMessage>,
        first: OutboundMessage,
    ) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut pending = vec![first];
        while pending.len() < MAX_WRITE_BATCH {
            match outbound.try_recv() {
                Ok(message) => pending.push(message),
                Err(_) => break,
            }
        }

        let id = &self.id;
        self.write_with_timeout(async move {
            feed_messages(sink, pending, id).await?;
            sink.flush().await
        })
        .await
    }

    async fn write_with_timeout<F>(&self, write: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = Result<(), WsError>>,
    {
        match tokio::time::timeout(self.settings.write_timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => anyhow::bail!("write timed out after {:?}", self.settings.write_timeout),
        }
    }

    async fn read_loop<S>(self: Arc<Self>, mut stream: SplitStream<WebSocketStream<S>>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        loop {
            let frame = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                frame = stream.next() => frame,
            };

            let message = match frame {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    debug!(session_id = %self.id, error = %e, "client read failed");
                    break;
                }
                None => {
                    debug!(session_id = %self.id, "client stream ended");
                    break;
                }
            };

            // Pings and pongs keep the transport alive but are not client activity
            if matches!(message, Message::Text(_) | Message::Binary(_)) {
                self.touch();
            }

            let flow = match self.mode {
                ConnectionMode::Browser => self.handle_browser_frame(message).await,
                ConnectionMode::Telephony => self.handle_telephony_frame(message).await,
            };
            if flow.is_break() {
                break;
            }
        }

        self.cancel.cancel();
        debug!(session_id = %self.id, "read loop stopped");
    }

    async fn handle_browser_frame(&self, message: Message) -> ControlFlow<()> {
        match message {
            Message::Binary(audio) => self.buffer_audio(&audio),
            Message::Text(text) => match parse_client_message(&text) {
                Ok(ClientRequest::Audio(audio)) => self.buffer_audio(&audio),
                Ok(ClientRequest::Control(ControlAction::Ping)) => {
                    self.queue_message(ServerMessage::status(&self.id, "pong", None));
                }
                Ok(ClientRequest::Control(ControlAction::EndTurn)) => return self.end_turn().await,
                Err(e) => {
                    debug!(session_id = %self.id, error = %e, "rejected client message");
                    self.queue_error(ErrorCode::InvalidMessage, e.to_string());
                }
            },
            Message::Close(_) => return ControlFlow::Break(()),
            _ => {}
        }
        ControlFlow::Continue(())
    }

    fn buffer_audio(&self, audio: &[u8]) {
        debug!(session_id = %self.id, bytes = audio.len(), "buffering client audio");
        if let Err(e) = self.buffer.append(audio) {
            warn!(session_id = %self.id, bytes = audio.len(), "audio chunk rejected: {}", e);
            self.queue_error(ErrorCode::BufferFull, e.to_string());
        }
    }

    async fn end_turn(&self) -> ControlFlow<()> {
        let chunks = self.buffer.chunk_count();
        let Some(audio) = self.buffer.flush() else {
            debug!(session_id = %self.id, "end_turn with empty buffer; ignoring");
            return ControlFlow::Continue(());
        };

        info!(session_id = %self.id, bytes = audio.len(), chunks, "sending turn audio");
        if let Err(e) = self.ai.send_audio_batch(audio).await {
            error!(session_id = %self.id, error = %e, "failed to send turn audio");
            self.queue_error(ErrorCode::AiService, e.to_string());
            if e.is_connection_closed() {
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn handle_telephony_frame(&self, message: Message) -> ControlFlow<()> {
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => return ControlFlow::Break(()),
            Message::Binary(bytes) => {
                debug!(session_id = %self.id, bytes = bytes.len(), "ignoring binary telephony frame");
                return ControlFlow::Continue(());
            }
            _ => return ControlFlow::Continue(()),
        };

        let event = match TelephonyEvent::parse(&text) {
            Ok(event) => event,
            Err(e) => {
                warn!(session_id = %self.id, error = %e, "skipping telephony frame");
                return ControlFlow::Continue(());
            }
        };

        match event {
            TelephonyEvent::Connected => {
                info!(session_id = %self.id, "telephony stream connected");
            }
            TelephonyEvent::Start {
                stream_sid,
                call_sid,
            } => {
                info!(
                    session_id = %self.id,
                    stream_sid = %stream_sid,
                    call_sid = call_sid.as_deref().unwrap_or("-"),
                    "telephony stream started"
                );
                self.state.lock().stream_sid = Some(stream_sid);
            }
            TelephonyEvent::Media(mulaw) => {
                if self.stream_sid().is_none() {
                    warn!(session_id = %self.id, bytes = mulaw.len(), "media before start; dropping");
                    return ControlFlow::Continue(());
                }
                let pcm = codec::mulaw_8k_to_pcm_16k(&mulaw);
                if let Err(e) = self.ai.send_audio(pcm).await {
                    error!(session_id = %self.id, error = %e, "failed to forward caller audio");
                    if e.is_connection_closed() {
                        return ControlFlow::Break(());
                    }
                }
            }
            TelephonyEvent::Stop => {
                info!(session_id = %self.id, "telephony stream stopped");
                return ControlFlow::Break(());
            }
            TelephonyEvent::Mark(name) => {
                debug!(session_id = %self.id, mark = name.as_deref().unwrap_or("-"), "mark event");
            }
            TelephonyEvent::Other(event) => {
                warn!(session_id = %self.id, event = %event, "unknown telephony event");
            }
        }
        ControlFlow::Continue(())
    }

    async fn ai_event_pump(self: Arc<Self>, mut events: mpsc::Receiver<AiEvent>) {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                next = events.recv() => next,
            };

            let Some(event) = next else {
                info!(session_id = %self.id, "AI service event stream ended");
                break;
            };

            if self.handle_ai_event(event).await.is_break() {
                break;
            }
        }

        self.cancel.cancel();
        debug!(session_id = %self.id, "AI event pump stopped");
    }

    async fn handle_ai_event(&self, event: AiEvent) -> ControlFlow<()> {
        match event {
            AiEvent::Audio(pcm) => self.relay_audio(&pcm),
            AiEvent::Text(text) => match self.mode {
                ConnectionMode::Browser => {
                    self.queue_message(ServerMessage::text(&self.id, text));
                }
                ConnectionMode::Telephony => {
                    info!(session_id = %self.id, text = %text, "assistant text");
                }
            },
            AiEvent::TurnComplete => match self.mode {
                ConnectionMode::Browser => {
                    self.queue_message(ServerMessage::status(&self.id, "turn_complete", None));
                }
                ConnectionMode::Telephony => {
                    debug!(session_id = %self.id, "assistant turn complete");
                }
            },
            AiEvent::ToolCall(calls) => {
                let responses = calls
                    .iter()
                    .map(|call| {
                        info!(session_id = %self.id, tool = %call.name, call_id = %call.id, "tool call");
                        self.tools.invoke(call)
                    })
                    .collect();
                if let Err(e) = self.ai.send_tool_response(responses).await {
                    error!(session_id = %self.id, error = %e, "failed to send tool response");
                    if self.mode == ConnectionMode::Browser {
                        self.queue_error(ErrorCode::AiService, e.to_string());
                    }
                    if e.is_connection_closed() {
                        return ControlFlow::Break(());
                    }
                }
            }
            AiEvent::Error(e) => {
                error!(session_id = %self.id, error = %e, "AI service error");
                if self.mode == ConnectionMode::Browser {
                    self.queue_error(ErrorCode::AiService, e.to_string());
                }
                if e.is_connection_closed() {
                    return ControlFlow::Break(());
                }
            }
        }
        ControlFlow::Continue(())
    }

    fn relay_audio(&self, pcm: &[u8]) {
        match self.mode {
            ConnectionMode::Browser => {
                self.queue_message(ServerMessage::audio(&self.id, pcm));
            }
            ConnectionMode::Telephony => {
                let Some(stream_sid) = self.stream_sid() else {
                    warn!(session_id = %self.id, bytes = pcm.len(), "no stream id yet; dropping assistant audio");
                    return;
                };
                let mulaw = codec::pcm_24k_to_mulaw_8k(pcm);
                self.queue_message(TelephonyMediaFrame::new(&stream_sid, &mulaw));
            }
        }
    }
}

/// Feed serialized messages into the sink without flushing.
async fn feed_messages<S>(
    sink: &mut SplitSink<WebSocketStream<S>, Message>,
    pending: Vec<OutboundMessage>,
    session_id: &str,
) -> Result<(), WsError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    for message in pending {
        match message.to_json() {
            Ok(json) => sink.feed(Message::Text(json)).await?,
            Err(e) => warn!(session_id = %session_id, error = %e, "failed to serialize outbound message"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::testing::{wait_until, AiCall, FakeConnector, FakeHandle};
    use crate::ai::{AiConnector, AiError, AiSetup, ToolCall};
    use crate::config::ToolConfig;
    use base64::engine::general_purpose::STANDARD as B64;
    use base64::Engine as _;
    use serde_json::{json, Value};
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::protocol::Role;

    const WAIT: Duration = Duration::from_secs(2);

    fn settings() -> SessionSettings {
        SessionSettings {
            max_buffer_bytes: 4096,
            outbound_queue_size: 64,
            write_timeout: Duration::from_secs(2),
            keepalive: Duration::from_secs(30),
            close_grace: Duration::from_secs(1),
        }
    }

    fn toolbox() -> Arc<ToolBox> {
        Arc::new(ToolBox::new(vec![ToolConfig {
            name: "company_information".to_string(),
            description: "Company facts".to_string(),
            output: "We process payments.".to_string(),
        }]))
    }

    async fn new_session(
        mode: ConnectionMode,
        settings: SessionSettings,
    ) -> (Arc<Session>, Arc<FakeHandle>) {
        let connector = FakeConnector::new();
        let link = connector.connect(&AiSetup::default()).await.unwrap();
        let session = Session::new("session-1".to_string(), mode, link, toolbox(), settings);
        (session, connector.handle(0))
    }

    async fn started(
        mode: ConnectionMode,
        settings: SessionSettings,
    ) -> (Arc<Session>, Arc<FakeHandle>, WebSocketStream<DuplexStream>) {
        let (session, ai) = new_session(mode, settings).await;
        let (server_io, client_io) = tokio::io::duplex(1 << 20);
        let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
        session.start(server).unwrap();
        (session, ai, client)
    }

    /// Next JSON text frame from the server, skipping control frames.
    async fn next_json(client: &mut WebSocketStream<DuplexStream>) -> Value {
        loop {
            let frame = tokio::time::timeout(WAIT, client.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("stream ended")
                .expect("read failed");
            if let Message::Text(text) = frame {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    /// True if no text frame arrives within a short window.
    async fn stays_quiet(client: &mut WebSocketStream<DuplexStream>) -> bool {
        let window = tokio::time::timeout(Duration::from_millis(200), async {
            loop {
                match client.next().await {
                    Some(Ok(Message::Text(_))) => return false,
                    Some(Ok(_)) => continue,
                    _ => return true,
                }
            }
        });
        window.await.unwrap_or(true)
    }

    async fn send_json(client: &mut WebSocketStream<DuplexStream>, value: Value) {
        client.send(Message::Text(value.to_string())).await.unwrap();
    }

    #[tokio::test]
    async fn test_browser_receives_connected_status() {
        let (session, _ai, mut client) = started(ConnectionMode::Browser, settings()).await;

        let msg = next_json(&mut client).await;
        assert_eq!(msg["type"], "status");
        assert_eq!(msg["sessionId"], "session-1");
        assert_eq!(msg["payload"]["status"], "connected");
        assert_eq!(msg["payload"]["message"], "Session established");
        assert_eq!(session.phase(), SessionPhase::Running);
    }

    #[tokio::test]
    async fn test_browser_turn_is_sent_as_one_batch() {
        let (_session, ai, mut client) = started(ConnectionMode::Browser, settings()).await;
        next_json(&mut client).await;

        let first = vec![1u8; 1000];
        let second = vec![2u8; 1000];
        for chunk in [&first, &second] {
            send_json(
                &mut client,
                json!({"type": "audio", "payload": {"data": B64.encode(chunk)}}),
            )
            .await;
        }
        send_json(&mut client, json!({"type": "control", "payload": {"action": "end_turn"}})).await;

        assert!(wait_until(WAIT, || ai.calls().len() >= 2).await);

        let mut expected = first.clone();
        expected.extend_from_slice(&second);
        assert_eq!(ai.calls(), vec![AiCall::AudioBatch(expected), AiCall::EndOfTurn]);
    }

    #[tokio::test]
    async fn test_binary_frames_are_buffered_and_empty_turns_ignored() {
        let (session, ai, mut client) = started(ConnectionMode::Browser, settings()).await;
        next_json(&mut client).await;

        // Nothing buffered yet
        send_json(&mut client, json!({"type": "control", "payload": {"action": "end_turn"}})).await;
        send_json(&mut client, json!({"type": "control", "payload": {"action": "ping"}})).await;
        assert_eq!(next_json(&mut client).await["payload"]["status"], "pong");
        assert!(ai.calls().is_empty());

        client.send(Message::Binary(vec![5, 6, 7])).await.unwrap();
        assert!(wait_until(WAIT, || session.summary().buffered_bytes == 3).await);

        send_json(&mut client, json!({"type": "control", "payload": {"action": "end_turn"}})).await;
        assert!(wait_until(WAIT, || ai.calls().len() == 2).await);
        assert_eq!(ai.calls()[0], AiCall::AudioBatch(vec![5, 6, 7]));
    }

    #[tokio::test]
    async fn test_invalid_messages_are_reported_and_session_continues() {
        let (_session, _ai, mut client) = started(ConnectionMode::Browser, settings()).await;
        next_json(&mut client).await;

        send_json(&mut client, json!({"type": "config", "payload": {}})).await;
        let err = next_json(&mut client).await;
        assert_eq!(err["type"], "error");
        assert_eq!(err["payload"]["code"], "INVALID_MESSAGE");
        assert_eq!(err["payload"]["message"], "Unknown message type: config");

        client.send(Message::Text("{not json".to_string())).await.unwrap();
        let err = next_json(&mut client).await;
        assert_eq!(err["payload"]["message"], "Invalid message format");

        send_json(&mut client, json!({"type": "control", "payload": {"action": "ping"}})).await;
        let pong = next_json(&mut client).await;
        assert_eq!(pong["type"], "status");
        assert_eq!(pong["payload"]["status"], "pong");
    }

    #[tokio::test]
    async fn test_buffer_full_keeps_earlier_audio() {
        let mut small = settings();
        small.max_buffer_bytes = 1500;
        let (_session, ai, mut client) = started(ConnectionMode::Browser, small).await;
        next_json(&mut client).await;

        client.send(Message::Binary(vec![1; 1000])).await.unwrap();
        client.send(Message::Binary(vec![2; 1000])).await.unwrap();

        let err = next_json(&mut client).await;
        assert_eq!(err["payload"]["code"], "BUFFER_FULL");
        assert_eq!(err["payload"]["message"], "Audio buffer full (max 1500 bytes)");

        send_json(&mut client, json!({"type": "control", "payload": {"action": "end_turn"}})).await;
        assert!(wait_until(WAIT, || ai.calls().len() == 2).await);
        assert_eq!(ai.calls()[0], AiCall::AudioBatch(vec![1; 1000]));
    }

    #[tokio::test]
    async fn test_browser_relays_ai_events() {
        let (_session, ai, mut client) = started(ConnectionMode::Browser, settings()).await;
        next_json(&mut client).await;

        ai.emit(AiEvent::Audio(vec![1, 2, 3])).await;
        ai.emit(AiEvent::Text("Hello".to_string())).await;
        ai.emit(AiEvent::TurnComplete).await;

        let audio = next_json(&mut client).await;
        assert_eq!(audio["type"], "audio");
        assert_eq!(audio["payload"]["data"], "AQID");
        assert_eq!(audio["payload"]["mimeType"], "audio/pcm;rate=24000");

        let text = next_json(&mut client).await;
        assert_eq!(text["type"], "text");
        assert_eq!(text["payload"]["text"], "Hello");

        let done = next_json(&mut client).await;
        assert_eq!(done["payload"]["status"], "turn_complete");
    }

    #[tokio::test]
    async fn test_tool_calls_are_answered() {
        let (_session, ai, mut client) = started(ConnectionMode::Browser, settings()).await;
        next_json(&mut client).await;

        ai.emit(AiEvent::ToolCall(vec![
            ToolCall {
                id: "c1".to_string(),
                name: "company_information".to_string(),
                args: json!({}),
            },
            ToolCall {
                id: "c2".to_string(),
                name: "unknown_tool".to_string(),
                args: json!({}),
            },
        ]))
        .await;

        assert!(wait_until(WAIT, || !ai.calls().is_empty()).await);
        let AiCall::ToolResponse(responses) = &ai.calls()[0] else {
            panic!("expected a tool response, got {:?}", ai.calls());
        };
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].id, "c1");
        assert_eq!(responses[0].response, json!({"output": "We process payments."}));
        assert_eq!(
            responses[1].response,
            json!({"error": "Unknown function: unknown_tool"})
        );
    }

    #[tokio::test]
    async fn test_ai_connection_loss_reports_and_ends_session() {
        let (session, ai, mut client) = started(ConnectionMode::Browser, settings()).await;
        next_json(&mut client).await;

        ai.emit(AiEvent::Error(AiError::ConnectionClosed)).await;

        let err = next_json(&mut client).await;
        assert_eq!(err["payload"]["code"], "GEMINI_ERROR");
        assert_eq!(err["payload"]["message"], "AI service connection closed");

        tokio::time::timeout(WAIT, session.cancelled()).await.unwrap();
        session.close().await;
        assert_eq!(session.phase(), SessionPhase::Closed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_error_queued_before_cancellation_is_delivered() {
        for _ in 0..20 {
            let (session, ai, mut client) = started(ConnectionMode::Browser, settings()).await;
            next_json(&mut client).await;

            ai.emit(AiEvent::Error(AiError::ConnectionClosed)).await;

            let mut frames = Vec::new();
            while let Ok(Some(Ok(frame))) = tokio::time::timeout(WAIT, client.next()).await {
                frames.push(frame);
            }
            let Some(Message::Text(text)) = frames.first() else {
                panic!("expected the error envelope first, got {:?}", frames);
            };
            let err: Value = serde_json::from_str(text).unwrap();
            assert_eq!(err["payload"]["code"], "GEMINI_ERROR");
            assert!(matches!(frames.last(), Some(Message::Close(_))));

            session.close().await;
        }
    }

    #[tokio::test]
    async fn test_keepalive_pongs_do_not_count_as_activity() {
        let mut fast = settings();
        fast.keepalive = Duration::from_millis(50);
        let (session, _ai, mut client) = started(ConnectionMode::Browser, fast).await;

        // Reading answers every ping with a pong
        let reader = tokio::spawn(async move {
            let mut pings = 0;
            while let Some(Ok(frame)) = client.next().await {
                if matches!(frame, Message::Ping(_)) {
                    pings += 1;
                }
            }
            pings
        });

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(session.idle_for(Utc::now()) > Duration::from_millis(300));

        session.close().await;
        let pings = tokio::time::timeout(WAIT, reader).await.unwrap().unwrap();
        assert!(pings >= 3, "only {} pings sent", pings);
    }

    #[tokio::test]
    async fn test_telephony_media_is_upsampled_and_streamed() {
        let (session, ai, mut client) = started(ConnectionMode::Telephony, settings()).await;

        send_json(&mut client, json!({"event": "connected", "protocol": "Call"})).await;
        send_json(&mut client, json!({"event": "start", "start": {"streamSid": "ST123"}})).await;
        let mulaw = vec![0xFFu8; 160];
        send_json(
            &mut client,
            json!({"event": "media", "media": {"payload": B64.encode(&mulaw)}}),
        )
        .await;

        assert!(wait_until(WAIT, || !ai.calls().is_empty()).await);
        assert_eq!(ai.calls(), vec![AiCall::Audio(vec![0u8; 160 * 4])]);
        assert_eq!(session.stream_sid().as_deref(), Some("ST123"));
    }

    #[tokio::test]
    async fn test_telephony_media_before_start_is_dropped() {
        let (session, ai, mut client) = started(ConnectionMode::Telephony, settings()).await;

        send_json(
            &mut client,
            json!({"event": "media", "media": {"payload": B64.encode([0x00u8, 0x80])}}),
        )
        .await;
        // Assistant audio without a stream id is dropped too
        ai.emit(AiEvent::Audio(vec![0; 12])).await;

        assert!(stays_quiet(&mut client).await);
        assert!(ai.calls().is_empty());
        assert_eq!(session.phase(), SessionPhase::Running);
    }

    #[tokio::test]
    async fn test_telephony_relays_ai_audio_as_mulaw() {
        let (session, ai, mut client) = started(ConnectionMode::Telephony, settings()).await;

        send_json(&mut client, json!({"event": "start", "start": {"streamSid": "ST123"}})).await;
        assert!(wait_until(WAIT, || session.stream_sid().is_some()).await);

        let pcm = codec::samples_to_pcm_bytes(&[0, 1000, 2000, -8000, 5, 6]);
        ai.emit(AiEvent::Audio(pcm.clone())).await;

        let frame = next_json(&mut client).await;
        assert_eq!(frame["event"], "media");
        assert_eq!(frame["streamSid"], "ST123");
        assert_eq!(
            frame["media"]["payload"],
            B64.encode(codec::pcm_24k_to_mulaw_8k(&pcm))
        );
    }

    #[tokio::test]
    async fn test_telephony_stop_ends_session() {
        let (session, ai, mut client) = started(ConnectionMode::Telephony, settings()).await;

        send_json(&mut client, json!({"event": "stop"})).await;
        tokio::time::timeout(WAIT, session.cancelled()).await.unwrap();

        session.close().await;
        assert_eq!(session.phase(), SessionPhase::Closed);
        assert_eq!(ai.calls(), vec![AiCall::Close]);
    }

    #[tokio::test]
    async fn test_client_disconnect_cancels_session() {
        let (session, _ai, client) = started(ConnectionMode::Browser, settings()).await;
        drop(client);
        tokio::time::timeout(WAIT, session.cancelled()).await.unwrap();
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (session, ai, _client) = started(ConnectionMode::Browser, settings()).await;

        session.close().await;
        session.close().await;

        assert_eq!(session.phase(), SessionPhase::Closed);
        assert_eq!(ai.calls(), vec![AiCall::Close]);
        assert!(!session.queue_message(ServerMessage::status("session-1", "pong", None)));
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let (session, _ai, _client) = started(ConnectionMode::Browser, settings()).await;

        let (server_io, _other) = tokio::io::duplex(1024);
        let again = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        assert!(matches!(
            session.start(again),
            Err(SessionError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_full_queue_drops_new_messages() {
        let mut tiny = settings();
        tiny.outbound_queue_size = 1;
        // Not started, so nothing drains the queue
        let (session, _ai) = new_session(ConnectionMode::Browser, tiny).await;

        assert!(session.queue_message(ServerMessage::status("session-1", "pong", None)));
        assert!(!session.queue_message(ServerMessage::status("session-1", "pong", None)));
        assert_eq!(session.dropped_messages(), 1);
    }
}
