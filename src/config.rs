//! # Configuration Management
//!
//! This module loads the gateway configuration from multiple sources:
//! - Default values (built into the code)
//! - An optional TOML file (config.toml)
//! - Environment variables (with the APP_ prefix)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: the same structs are serialized into the `config` builder as
//!   defaults and deserialized back out after all sources are merged
//! - **derive macros**: `Debug`, `Clone`, `Serialize`, `Deserialize` on every section
//! - **Duration helpers**: numeric fields stay plain integers on disk and are
//!   turned into `std::time::Duration` by small accessor methods
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST`, `PORT` and `GEMINI_API_KEY` environment variables
//! 2. `APP_` environment variables, sections separated by `__`
//!    (e.g. `APP_SESSIONS__MAX_CONCURRENT_SESSIONS=20`,
//!    `APP_GATEWAY__ALLOWED_ORIGINS=https://a.example,https://b.example`)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration that contains all settings.
///
/// ## Sections:
/// - `server`: the HTTP side server (health, sessions, TwiML)
/// - `gateway`: the WebSocket listener clients stream audio through
/// - `sessions`: per-session limits and lifecycle timers
/// - `ai`: the remote conversational AI service
/// - `telephony`: values used when answering voice calls
/// - `tools`: tools the AI service may call, answered with static text
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub gateway: GatewayConfig,
    pub sessions: SessionsConfig,
    pub ai: AiConfig,
    pub telephony: TelephonyConfig,
    #[serde(default)]
    pub tools: Vec<ToolConfig>,
}

/// HTTP side server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Which client protocols the gateway accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayMode {
    /// Browser clients on `/ws` only
    Browser,
    /// Telephony media streams on `/stream` only
    Telephony,
    Both,
}

impl GatewayMode {
    pub fn accepts_browser(self) -> bool {
        matches!(self, GatewayMode::Browser | GatewayMode::Both)
    }

    pub fn accepts_telephony(self) -> bool {
        matches!(self, GatewayMode::Telephony | GatewayMode::Both)
    }
}

/// WebSocket gateway settings.
///
/// ## Fields:
/// - `allowed_origins`: browser `Origin` values accepted on `/ws`; `"*"` accepts any
/// - `max_frame_bytes`: largest inbound WebSocket message accepted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub mode: GatewayMode,
    pub allowed_origins: Vec<String>,
    pub max_frame_bytes: usize,
}

impl GatewayConfig {
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        self.allowed_origins
            .iter()
            .any(|allowed| allowed == "*" || Some(allowed.as_str()) == origin)
    }
}

/// Where session metadata is mirrored for external observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MirrorKind {
    None,
    Memory,
}

/// Session limits and lifecycle timers.
///
/// ## Tuning guidelines:
/// - `max_buffer_bytes` bounds one browser turn; 5 MB is roughly 160 s of 16 kHz PCM
/// - `outbound_queue_size` is in messages; a full queue drops new messages
/// - `session_timeout_secs` evicts sessions with no inbound or outbound activity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    pub max_concurrent_sessions: usize,
    pub max_buffer_bytes: usize,
    pub session_timeout_secs: u64,
    pub cleanup_interval_secs: u64,
    pub outbound_queue_size: usize,
    pub write_timeout_secs: u64,
    pub keepalive_secs: u64,
    pub close_grace_ms: u64,
    pub shutdown_timeout_secs: u64,
    pub metadata_mirror: MirrorKind,
}

impl SessionsConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Remote AI service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub voice: String,
    pub system_prompt: String,
    pub setup_timeout_secs: u64,
}

impl AiConfig {
    pub fn setup_timeout(&self) -> Duration {
        Duration::from_secs(self.setup_timeout_secs)
    }
}

/// Voice-call answering settings.
///
/// ## Fields:
/// - `stream_url`: media stream URL handed to the telephony provider; when empty
///   it is derived from the request host as `wss://<host>/stream`
/// - `greeting`: spoken to the caller before the stream connects
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelephonyConfig {
    pub stream_url: String,
    pub greeting: String,
}

/// A tool declared to the AI service and answered with fixed text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolConfig {
    pub name: String,
    pub description: String,
    pub output: String,
}

const DEFAULT_SYSTEM_PROMPT: &str = "You are a friendly, patient voice assistant answering \
calls on behalf of a small business. Keep answers short and conversational. When the caller \
asks about the company, call the company_information tool instead of guessing.";

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8081,
            },
            gateway: GatewayConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
                mode: GatewayMode::Both,
                allowed_origins: vec!["*".to_string()],
                max_frame_bytes: 512 * 1024,
            },
            sessions: SessionsConfig {
                max_concurrent_sessions: 100,
                max_buffer_bytes: 5 * 1024 * 1024,
                session_timeout_secs: 30 * 60,
                cleanup_interval_secs: 60,
                outbound_queue_size: 256,
                write_timeout_secs: 10,
                keepalive_secs: 30,
                close_grace_ms: 2000,
                shutdown_timeout_secs: 10,
                metadata_mirror: MirrorKind::None,
            },
            ai: AiConfig {
                endpoint: "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".to_string(),
                api_key: String::new(),
                model: "models/gemini-2.5-flash-native-audio-preview-12-2025".to_string(),
                voice: "Zephyr".to_string(),
                system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
                setup_timeout_secs: 10,
            },
            telephony: TelephonyConfig {
                stream_url: String::new(),
                greeting: "Connecting to the assistant now.".to_string(),
            },
            tools: vec![ToolConfig {
                name: "company_information".to_string(),
                description: "Get general information about the company".to_string(),
                output: "No company information has been configured yet.".to_string(),
            }],
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_GATEWAY__PORT=9000`: Override the gateway port
    /// - `APP_SESSIONS__METADATA_MIRROR=memory`: Enable the in-process metadata mirror
    /// - `HOST=0.0.0.0` / `PORT=3000`: HTTP server bind, for deployment platforms
    /// - `GEMINI_API_KEY=...`: AI service credential
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("gateway.allowed_origins")
                    .try_parsing(true),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Ok(key) = env::var("GEMINI_API_KEY") {
            settings = settings.set_override("ai.api_key", key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// The AI service credential is required: without it no session can ever
    /// be established.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.gateway.port == 0 {
            return Err(anyhow::anyhow!("Gateway port cannot be 0"));
        }

        if self.gateway.host == self.server.host && self.gateway.port == self.server.port {
            return Err(anyhow::anyhow!(
                "Gateway and HTTP server cannot share {}:{}",
                self.server.host,
                self.server.port
            ));
        }

        if self.gateway.max_frame_bytes == 0 {
            return Err(anyhow::anyhow!("Max frame size must be greater than 0"));
        }

        if self.sessions.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.sessions.max_buffer_bytes == 0 {
            return Err(anyhow::anyhow!("Audio buffer size must be greater than 0"));
        }

        if self.sessions.outbound_queue_size == 0 {
            return Err(anyhow::anyhow!("Outbound queue size must be greater than 0"));
        }

        if self.sessions.cleanup_interval_secs == 0 || self.sessions.keepalive_secs == 0 {
            return Err(anyhow::anyhow!("Cleanup and keepalive intervals must be greater than 0"));
        }

        if self.ai.api_key.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "AI service API key is required (set GEMINI_API_KEY)"
            ));
        }

        Ok(())
    }

    /// Copy of the configuration that is safe to expose over HTTP.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if !copy.ai.api_key.is_empty() {
            copy.ai.api_key = "***".to_string();
        }
        copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.ai.api_key = "test-key".to_string();
        config
    }

    /// Defaults are complete apart from the credential.
    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.gateway.port, 8080);
        assert_eq!(config.sessions.max_concurrent_sessions, 100);
        assert_eq!(config.sessions.max_buffer_bytes, 5 * 1024 * 1024);
        assert_eq!(config.sessions.session_timeout(), Duration::from_secs(1800));
        assert!(config.validate().is_err());

        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = valid_config();
        config.sessions.max_concurrent_sessions = 0;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.gateway.port = config.server.port;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.sessions.outbound_queue_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_origin_check() {
        let mut gateway = AppConfig::default().gateway;
        assert!(gateway.origin_allowed(None));

        gateway.allowed_origins = vec!["https://app.example".to_string()];
        assert!(gateway.origin_allowed(Some("https://app.example")));
        assert!(!gateway.origin_allowed(Some("https://evil.example")));
        assert!(!gateway.origin_allowed(None));
    }

    #[test]
    fn test_gateway_modes() {
        assert!(GatewayMode::Both.accepts_browser());
        assert!(GatewayMode::Both.accepts_telephony());
        assert!(!GatewayMode::Browser.accepts_telephony());
        assert!(!GatewayMode::Telephony.accepts_browser());
    }

    #[test]
    fn test_redacted_hides_api_key() {
        let redacted = valid_config().redacted();
        assert_eq!(redacted.ai.api_key, "***");
        assert_eq!(AppConfig::default().redacted().ai.api_key, "");
    }
}
