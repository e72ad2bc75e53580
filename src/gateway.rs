//! # WebSocket Gateway
//!
//! Accepts client connections, routes the upgrade by path and hands each
//! socket to a fresh session.
//!
//! ## Routes:
//! - `/ws`: browser clients (JSON envelopes); the `Origin` header must be allowed
//! - `/stream`: telephony media streams; no origin check
//!
//! Anything else is refused during the handshake, before a session or an AI
//! conversation exists.

use crate::config::GatewayConfig;
use crate::messages::{ErrorCode, ServerMessage};
use crate::session::{ConnectionMode, SessionError, SessionManager};
use crate::state::GatewayMetrics;
use futures_util::SinkExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const BROWSER_PATH: &str = "/ws";
pub const TELEPHONY_PATH: &str = "/stream";

/// Why an upgrade request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    NotFound,
    OriginNotAllowed,
}

impl Rejection {
    fn into_response(self) -> ErrorResponse {
        let (status, body) = match self {
            Rejection::NotFound => (StatusCode::NOT_FOUND, "Not Found"),
            Rejection::OriginNotAllowed => (StatusCode::FORBIDDEN, "Origin not allowed"),
        };
        let mut response = ErrorResponse::new(Some(body.to_string()));
        *response.status_mut() = status;
        response
    }
}

pub struct Gateway {
    config: GatewayConfig,
    manager: Arc<SessionManager>,
    metrics: Arc<GatewayMetrics>,
}

impl Gateway {
    pub fn new(
        config: GatewayConfig,
        manager: Arc<SessionManager>,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self {
            config,
            manager,
            metrics,
        }
    }

    /// Decide which session mode an upgrade request maps to.
    pub fn route(&self, path: &str, origin: Option<&str>) -> Result<ConnectionMode, Rejection> {
        match path {
            BROWSER_PATH if self.config.mode.accepts_browser() => {
                if self.config.origin_allowed(origin) {
                    Ok(ConnectionMode::Browser)
                } else {
                    Err(Rejection::OriginNotAllowed)
                }
            }
            TELEPHONY_PATH if self.config.mode.accepts_telephony() => Ok(ConnectionMode::Telephony),
            _ => Err(Rejection::NotFound),
        }
    }

    fn socket_config(&self) -> WebSocketConfig {
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(self.config.max_frame_bytes);
        config.max_frame_size = Some(self.config.max_frame_bytes);
        config
    }

    /// Accept connections until `shutdown` fires.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) {
        match listener.local_addr() {
            Ok(addr) => info!("WebSocket gateway listening on {}", addr),
            Err(e) => warn!("WebSocket gateway listening (address unknown: {})", e),
        }

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    let gateway = Arc::clone(&self);
                    tokio::spawn(async move { gateway.handle_connection(stream, peer).await });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }

        info!("WebSocket gateway stopped accepting connections");
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let mut routed = None;
        let callback = |request: &Request, response: Response| {
            let origin = request
                .headers()
                .get("origin")
                .and_then(|value| value.to_str().ok());
            match self.route(request.uri().path(), origin) {
                Ok(mode) => {
                    routed = Some(mode);
                    Ok(response)
                }
                Err(rejection) => {
                    warn!(
                        peer = %peer,
                        path = request.uri().path(),
                        origin = origin.unwrap_or("-"),
                        ?rejection,
                        "rejected upgrade"
                    );
                    Err(rejection.into_response())
                }
            }
        };

        let handshake = tokio_tungstenite::accept_hdr_async_with_config(
            stream,
            callback,
            Some(self.socket_config()),
        )
        .await;

        let mut ws = match handshake {
            Ok(ws) => ws,
            Err(e) => {
                self.metrics.record_rejected();
                debug!(peer = %peer, error = %e, "WebSocket handshake failed");
                return;
            }
        };
        let Some(mode) = routed else {
            return;
        };
        self.metrics.record_accepted();
        info!(peer = %peer, mode = mode.as_str(), "client connected");

        let session = match self.manager.create_session(mode).await {
            Ok(session) => session,
            Err(e) => {
                self.metrics.record_session_failed();
                error!(peer = %peer, mode = mode.as_str(), error = %e, "failed to create session");
                if mode == ConnectionMode::Browser {
                    let envelope = ServerMessage::error("", error_code_for(&e), e.to_string());
                    match envelope.to_json() {
                        Ok(json) => {
                            if let Err(e) = ws.send(Message::Text(json)).await {
                                debug!(peer = %peer, error = %e, "failed to send session error");
                            }
                        }
                        Err(e) => warn!(peer = %peer, error = %e, "failed to serialize session error"),
                    }
                }
                if let Err(e) = ws.close(None).await {
                    debug!(peer = %peer, error = %e, "close after session failure failed");
                }
                return;
            }
        };

        if let Err(e) = session.start(ws) {
            error!(session_id = %session.id(), error = %e, "failed to start session");
            self.manager.remove_session(session.id()).await;
            return;
        }

        session.cancelled().await;
        self.manager.remove_session(session.id()).await;
        info!(peer = %peer, session_id = %session.id(), "client disconnected");
    }
}

/// Error code reported to a browser whose session could not be created.
fn error_code_for(error: &SessionError) -> ErrorCode {
    match error {
        SessionError::CapacityExceeded { .. } => ErrorCode::RateLimited,
        SessionError::ShuttingDown => ErrorCode::ConnectionClosed,
        SessionError::Ai(_) | SessionError::InvalidState { .. } => ErrorCode::SessionFailed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::testing::{wait_until, FakeConnector};
    use crate::ai::tools::ToolBox;
    use crate::ai::AiSetup;
    use crate::config::{AppConfig, GatewayMode, MirrorKind};
    use crate::session::mirror::mirror_for;
    use futures_util::StreamExt;
    use serde_json::Value;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::Error as WsError;

    fn gateway_config(mode: GatewayMode, origins: &[&str]) -> GatewayConfig {
        let mut config = AppConfig::default().gateway;
        config.mode = mode;
        config.allowed_origins = origins.iter().map(|o| o.to_string()).collect();
        config
    }

    fn gateway_with(
        config: GatewayConfig,
        max_sessions: usize,
    ) -> (Arc<Gateway>, Arc<FakeConnector>, Arc<SessionManager>) {
        let mut sessions = AppConfig::default().sessions;
        sessions.max_concurrent_sessions = max_sessions;
        let connector = FakeConnector::new();
        let manager = Arc::new(SessionManager::new(
            &sessions,
            connector.clone(),
            AiSetup::default(),
            Arc::new(ToolBox::new(Vec::new())),
            mirror_for(MirrorKind::None),
        ));
        let gateway = Arc::new(Gateway::new(
            config,
            Arc::clone(&manager),
            Arc::new(GatewayMetrics::default()),
        ));
        (gateway, connector, manager)
    }

    async fn spawn_gateway(gateway: Arc<Gateway>) -> (SocketAddr, CancellationToken) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let token = CancellationToken::new();
        tokio::spawn(gateway.serve(listener, token.clone()));
        (addr, token)
    }

    async fn next_json<S>(ws: &mut S) -> Value
    where
        S: futures_util::Stream<Item = Result<Message, WsError>> + Unpin,
    {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(2), ws.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let Message::Text(text) = frame {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    #[test]
    fn test_route_by_path_and_origin() {
        let (gateway, _, _) = gateway_with(
            gateway_config(GatewayMode::Both, &["https://app.example.com"]),
            4,
        );

        assert_eq!(
            gateway.route("/ws", Some("https://app.example.com")),
            Ok(ConnectionMode::Browser)
        );
        assert_eq!(
            gateway.route("/ws", Some("https://evil.example.com")),
            Err(Rejection::OriginNotAllowed)
        );
        assert_eq!(gateway.route("/ws", None), Err(Rejection::OriginNotAllowed));
        assert_eq!(
            gateway.route("/stream", Some("https://evil.example.com")),
            Ok(ConnectionMode::Telephony)
        );
        assert_eq!(gateway.route("/other", None), Err(Rejection::NotFound));
    }

    #[test]
    fn test_route_respects_gateway_mode() {
        let (browser_only, _, _) = gateway_with(gateway_config(GatewayMode::Browser, &["*"]), 4);
        assert_eq!(browser_only.route("/ws", None), Ok(ConnectionMode::Browser));
        assert_eq!(browser_only.route("/stream", None), Err(Rejection::NotFound));

        let (telephony_only, _, _) =
            gateway_with(gateway_config(GatewayMode::Telephony, &["*"]), 4);
        assert_eq!(telephony_only.route("/ws", None), Err(Rejection::NotFound));
        assert_eq!(
            telephony_only.route("/stream", None),
            Ok(ConnectionMode::Telephony)
        );
    }

    #[test]
    fn test_creation_errors_map_to_codes() {
        assert_eq!(
            error_code_for(&SessionError::CapacityExceeded { max: 1 }),
            ErrorCode::RateLimited
        );
        assert_eq!(
            error_code_for(&SessionError::Ai(crate::ai::AiError::ConnectionClosed)),
            ErrorCode::SessionFailed
        );
    }

    #[tokio::test]
    async fn test_browser_connection_end_to_end() {
        let (gateway, connector, manager) =
            gateway_with(gateway_config(GatewayMode::Both, &["*"]), 4);
        let (addr, token) = spawn_gateway(gateway).await;

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
            .await
            .unwrap();
        let status = next_json(&mut ws).await;
        assert_eq!(status["payload"]["status"], "connected");
        assert_eq!(manager.active_session_count(), 1);
        assert_eq!(connector.connect_count(), 1);

        ws.close(None).await.unwrap();
        assert!(wait_until(Duration::from_secs(2), || manager.active_session_count() == 0).await);
        token.cancel();
    }

    #[tokio::test]
    async fn test_unknown_path_is_refused_with_404() {
        let (gateway, connector, _) = gateway_with(gateway_config(GatewayMode::Both, &["*"]), 4);
        let (addr, token) = spawn_gateway(gateway).await;

        let err = tokio_tungstenite::connect_async(format!("ws://{}/nope", addr))
            .await
            .unwrap_err();
        match err {
            WsError::Http(response) => assert_eq!(response.status(), StatusCode::NOT_FOUND),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(connector.connect_count(), 0);
        token.cancel();
    }

    #[tokio::test]
    async fn test_disallowed_origin_is_refused_with_403() {
        let (gateway, _, _) = gateway_with(
            gateway_config(GatewayMode::Both, &["https://app.example.com"]),
            4,
        );
        let (addr, token) = spawn_gateway(gateway).await;

        let mut request = format!("ws://{}/ws", addr).into_client_request().unwrap();
        request
            .headers_mut()
            .insert("Origin", "https://evil.example.com".parse().unwrap());
        let err = tokio_tungstenite::connect_async(request).await.unwrap_err();
        match err {
            WsError::Http(response) => assert_eq!(response.status(), StatusCode::FORBIDDEN),
            other => panic!("unexpected error: {other}"),
        }
        token.cancel();
    }

    #[tokio::test]
    async fn test_browser_gets_error_envelope_when_session_fails() {
        let (gateway, connector, manager) =
            gateway_with(gateway_config(GatewayMode::Both, &["*"]), 4);
        connector.refuse_connections();
        let (addr, token) = spawn_gateway(gateway).await;

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
            .await
            .unwrap();
        let envelope = next_json(&mut ws).await;
        assert_eq!(envelope["type"], "error");
        assert_eq!(envelope["payload"]["code"], "SESSION_FAILED");
        assert!(envelope.get("sessionId").is_none());
        let closing = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .unwrap();
        assert!(matches!(closing, Some(Ok(Message::Close(_)))));
        assert_eq!(manager.active_session_count(), 0);
        token.cancel();
    }
}
