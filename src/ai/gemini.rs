//! Gemini Live client.
//!
//! One WebSocket per conversation. After the setup handshake two tasks own
//! the socket halves: a writer draining a command channel and a reader
//! turning server frames into [`AiEvent`]s.

use crate::ai::{
    AiConnector, AiError, AiEvent, AiHandle, AiLink, AiSetup, ToolCall, ToolResponse,
    AI_EVENT_QUEUE_SIZE,
};
use crate::config::AiConfig;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// MIME type of audio streamed to the service.
pub const INPUT_AUDIO_MIME_TYPE: &str = "audio/pcm;rate=16000";

const COMMAND_QUEUE_SIZE: usize = 256;
const CLOSE_FRAME_TIMEOUT: Duration = Duration::from_secs(2);

pub struct GeminiConnector {
    endpoint: String,
    api_key: String,
    model: String,
    voice: String,
    setup_timeout: Duration,
}

impl GeminiConnector {
    pub fn new(config: &AiConfig) -> Self {
        Self {
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            voice: config.voice.clone(),
            setup_timeout: config.setup_timeout(),
        }
    }
}

#[async_trait]
impl AiConnector for GeminiConnector {
    async fn connect(&self, setup: &AiSetup) -> Result<AiLink, AiError> {
        let url = format!("{}?key={}", self.endpoint, self.api_key);
        let (ws, _) = tokio::time::timeout(self.setup_timeout, tokio_tungstenite::connect_async(url))
            .await
            .map_err(|_| AiError::Connect("timed out".to_string()))?
            .map_err(|e| AiError::Connect(e.to_string()))?;

        let (mut sink, mut stream) = ws.split();

        let setup_frame = setup_message(&self.model, &self.voice, setup);
        sink.send(Message::Text(setup_frame.to_string()))
            .await
            .map_err(|e| AiError::Setup(e.to_string()))?;

        tokio::time::timeout(self.setup_timeout, await_setup_complete(&mut stream))
            .await
            .map_err(|_| AiError::Setup("timed out waiting for setupComplete".to_string()))??;

        info!(model = %self.model, voice = %self.voice, "AI service conversation established");

        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_SIZE);
        let (event_tx, event_rx) = mpsc::channel(AI_EVENT_QUEUE_SIZE);
        let cancel = CancellationToken::new();

        tokio::spawn(write_loop(sink, command_rx, cancel.clone()));
        tokio::spawn(read_loop(stream, event_tx, cancel.clone()));

        Ok(AiLink {
            handle: Arc::new(GeminiHandle {
                commands: command_tx,
                cancel,
            }),
            events: event_rx,
        })
    }
}

struct GeminiHandle {
    commands: mpsc::Sender<Message>,
    cancel: CancellationToken,
}

impl GeminiHandle {
    async fn push(&self, payload: Value) -> Result<(), AiError> {
        if self.cancel.is_cancelled() {
            return Err(AiError::ConnectionClosed);
        }
        self.commands
            .send(Message::Text(payload.to_string()))
            .await
            .map_err(|_| AiError::ConnectionClosed)
    }
}

#[async_trait]
impl AiHandle for GeminiHandle {
    async fn send_audio(&self, pcm: Vec<u8>) -> Result<(), AiError> {
        if pcm.is_empty() {
            return Ok(());
        }
        self.push(realtime_audio_message(&pcm)).await
    }

    async fn send_audio_batch(&self, pcm: Vec<u8>) -> Result<(), AiError> {
        if pcm.is_empty() {
            return Ok(());
        }
        self.push(realtime_audio_message(&pcm)).await?;
        self.push(audio_stream_end_message()).await
    }

    async fn send_tool_response(&self, responses: Vec<ToolResponse>) -> Result<(), AiError> {
        self.push(tool_response_message(&responses)).await
    }

    async fn close(&self) {
        self.cancel.cancel();
    }
}

enum Inbound {
    Payload(Value),
    Closed(String),
    Skip,
}

fn classify(message: Message) -> Result<Inbound, AiError> {
    match message {
        Message::Text(text) => serde_json::from_str(&text)
            .map(Inbound::Payload)
            .map_err(|e| AiError::Protocol(e.to_string())),
        Message::Binary(bytes) => serde_json::from_slice(&bytes)
            .map(Inbound::Payload)
            .map_err(|e| AiError::Protocol(e.to_string())),
        Message::Close(frame) => Ok(Inbound::Closed(
            frame.map(|f| f.reason.to_string()).unwrap_or_default(),
        )),
        _ => Ok(Inbound::Skip),
    }
}

async fn await_setup_complete<S>(stream: &mut S) -> Result<(), AiError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(frame) = stream.next().await {
        let frame = frame.map_err(|e| AiError::Setup(e.to_string()))?;
        match classify(frame) {
            Ok(Inbound::Payload(value)) if value.get("setupComplete").is_some() => return Ok(()),
            Ok(Inbound::Payload(_)) | Ok(Inbound::Skip) => continue,
            Ok(Inbound::Closed(reason)) => {
                return Err(AiError::Setup(format!("closed during setup: {}", reason)))
            }
            Err(e) => return Err(AiError::Setup(e.to_string())),
        }
    }
    Err(AiError::Setup("stream ended during setup".to_string()))
}

async fn write_loop<S>(mut sink: S, mut commands: mpsc::Receiver<Message>, cancel: CancellationToken)
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = commands.recv() => next,
        };
        let Some(message) = next else { break };
        if let Err(e) = sink.send(message).await {
            warn!(error = %e, "AI service write failed");
            break;
        }
    }

    match tokio::time::timeout(CLOSE_FRAME_TIMEOUT, sink.send(Message::Close(None))).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(error = %e, "AI service close frame failed"),
        Err(_) => debug!("AI service close frame timed out"),
    }
    cancel.cancel();
}

async fn read_loop<S>(mut stream: S, events: mpsc::Sender<AiEvent>, cancel: CancellationToken)
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    let reason = loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            next = stream.next() => next,
        };
        match next {
            None => break "stream ended".to_string(),
            Some(Err(e)) => break e.to_string(),
            Some(Ok(message)) => match classify(message) {
                Ok(Inbound::Payload(value)) => {
                    for event in parse_server_frame(value) {
                        if events.send(event).await.is_err() {
                            cancel.cancel();
                            return;
                        }
                    }
                }
                Ok(Inbound::Closed(reason)) => break reason,
                Ok(Inbound::Skip) => {}
                Err(e) => warn!(error = %e, "ignoring undecodable AI service frame"),
            },
        }
    };

    if !cancel.is_cancelled() {
        info!(reason = %reason, "AI service receiver closed");
        if events.send(AiEvent::Error(AiError::ConnectionClosed)).await.is_err() {
            debug!("session stopped before the AI close was reported");
        }
    }
    cancel.cancel();
}

pub fn setup_message(model: &str, voice: &str, setup: &AiSetup) -> Value {
    let mut body = json!({
        "model": model,
        "generationConfig": {
            "responseModalities": ["AUDIO"],
            "speechConfig": {
                "voiceConfig": { "prebuiltVoiceConfig": { "voiceName": voice } }
            }
        }
    });

    if !setup.system_prompt.is_empty() {
        body["systemInstruction"] = json!({ "parts": [{ "text": setup.system_prompt }] });
    }

    if !setup.tools.is_empty() {
        let declarations: Vec<Value> = setup
            .tools
            .iter()
            .map(|tool| json!({ "name": tool.name, "description": tool.description }))
            .collect();
        body["tools"] = json!([{ "functionDeclarations": declarations }]);
    }

    json!({ "setup": body })
}

pub fn realtime_audio_message(pcm: &[u8]) -> Value {
    json!({
        "realtimeInput": {
            "audio": { "mimeType": INPUT_AUDIO_MIME_TYPE, "data": B64.encode(pcm) }
        }
    })
}

pub fn audio_stream_end_message() -> Value {
    json!({ "realtimeInput": { "audioStreamEnd": true } })
}

pub fn tool_response_message(responses: &[ToolResponse]) -> Value {
    let function_responses: Vec<Value> = responses
        .iter()
        .map(|r| json!({ "id": r.id, "name": r.name, "response": r.response }))
        .collect();
    json!({ "toolResponse": { "functionResponses": function_responses } })
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerFrame {
    server_content: Option<ServerContent>,
    tool_call: Option<ToolCallFrame>,
    go_away: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    model_turn: Option<ModelTurn>,
    #[serde(default)]
    turn_complete: bool,
    #[serde(default)]
    interrupted: bool,
}

#[derive(Debug, Default, Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    text: Option<String>,
    inline_data: Option<InlineData>,
    #[serde(default)]
    thought: bool,
}

#[derive(Debug, Default, Deserialize)]
struct InlineData {
    data: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolCallFrame {
    #[serde(default)]
    function_calls: Vec<FunctionCall>,
}

#[derive(Debug, Default, Deserialize)]
struct FunctionCall {
    #[serde(default)]
    id: String,
    name: String,
    #[serde(default)]
    args: Value,
}

/// Translate one server frame into zero or more events, in frame order.
pub fn parse_server_frame(value: Value) -> Vec<AiEvent> {
    let frame: ServerFrame = match serde_json::from_value(value) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, "unrecognised AI service frame");
            return Vec::new();
        }
    };

    let mut events = Vec::new();

    if let Some(content) = frame.server_content {
        if content.interrupted {
            debug!("AI service turn interrupted");
        }
        for part in content.model_turn.map(|t| t.parts).unwrap_or_default() {
            if part.thought {
                continue;
            }
            if let Some(inline) = part.inline_data {
                match B64.decode(inline.data.as_bytes()) {
                    Ok(pcm) if !pcm.is_empty() => events.push(AiEvent::Audio(pcm)),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "dropping undecodable audio part"),
                }
            }
            if let Some(text) = part.text.filter(|t| !t.is_empty()) {
                events.push(AiEvent::Text(text));
            }
        }
        if content.turn_complete {
            events.push(AiEvent::TurnComplete);
        }
    }

    if let Some(tool_call) = frame.tool_call {
        let calls: Vec<ToolCall> = tool_call
            .function_calls
            .into_iter()
            .map(|call| ToolCall {
                id: call.id,
                name: call.name,
                args: call.args,
            })
            .collect();
        if !calls.is_empty() {
            events.push(AiEvent::ToolCall(calls));
        }
    }

    if let Some(go_away) = frame.go_away {
        warn!(detail = %go_away, "AI service announced disconnect");
    }

    events
}
