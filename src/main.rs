//! # Audio Bridge Gateway - Main Application Entry Point
//!
//! Bridges browser and telephony audio clients to a real-time conversational
//! AI service. Two listeners run side by side:
//!
//! - a **WebSocket gateway** (`/ws` for browsers, `/stream` for telephony media
//!   streams) where every connection becomes a session
//! - an **HTTP server** (actix-web) for health checks, session inspection,
//!   redacted configuration and the telephony call webhook
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: every connection is a set of cooperating async tasks
//! - **Arc**: configuration, the session registry and counters are shared by
//!   the gateway, the HTTP workers and the cleanup task
//! - **CancellationToken**: one token tells every long-running task to stop
//! - **Result<T, E>** with `?`: startup failures bubble up and end the process
//!
//! ## Application Architecture:
//! - **config**: Defaults, `config.toml` and `APP_*` environment variables
//! - **audio**: mu-law codec, resampling and the per-session turn buffer
//! - **messages**: JSON wire shapes for browser and telephony clients
//! - **ai**: AI service contract, the Gemini Live client and the tool box
//! - **session**: per-connection bridge and the session registry
//! - **gateway**: WebSocket accept loop and upgrade routing
//! - **state / health / handlers / middleware**: the HTTP side
//! - **error**: HTTP error responses

mod ai;
mod audio;
mod config;
mod error;
mod gateway;
mod handlers;
mod health;
mod messages;
mod middleware;
mod session;
mod state;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use ai::gemini::GeminiConnector;
use ai::tools::ToolBox;
use ai::AiSetup;
use anyhow::{Context, Result};
use config::AppConfig;
use gateway::Gateway;
use session::mirror::mirror_for;
use session::SessionManager;
use state::{AppState, GatewayMetrics};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging** for debugging and monitoring
/// 3. **Builds the session registry** around the AI service connector
/// 4. **Starts the WebSocket gateway** and the idle-session cleanup task
/// 5. **Starts the HTTP server** with middleware and routes
/// 6. **Shuts down gracefully**: stop accepting, close every session within the
///    configured deadline, then stop the HTTP server
#[tokio::main]
async fn main() -> Result<()> {
    // It's fine if there's no .env file
    dotenv::dotenv().ok();

    init_tracing()?;

    // TLS for the AI service connection; Err means a provider is already installed
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = AppConfig::load()?;
    config.validate()?;
    let config = Arc::new(config);

    info!("Starting {} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    info!(
        "Configuration loaded: http {}:{}, gateway {}:{} ({:?})",
        config.server.host,
        config.server.port,
        config.gateway.host,
        config.gateway.port,
        config.gateway.mode
    );

    let tools = Arc::new(ToolBox::new(config.tools.clone()));
    let setup = AiSetup {
        system_prompt: config.ai.system_prompt.clone(),
        tools: tools.declarations(),
    };
    let manager = Arc::new(SessionManager::new(
        &config.sessions,
        Arc::new(GeminiConnector::new(&config.ai)),
        setup,
        tools,
        mirror_for(config.sessions.metadata_mirror),
    ));
    let gateway_metrics = Arc::new(GatewayMetrics::default());

    // One token stops the gateway, the cleanup task and the main loop
    let shutdown = CancellationToken::new();
    setup_signal_handlers(shutdown.clone());

    let cleanup_task =
        manager.spawn_cleanup_task(config.sessions.cleanup_interval(), shutdown.clone());

    let gateway_addr = format!("{}:{}", config.gateway.host, config.gateway.port);
    let listener = TcpListener::bind(&gateway_addr)
        .await
        .with_context(|| format!("failed to bind WebSocket gateway on {}", gateway_addr))?;
    let gateway = Arc::new(Gateway::new(
        config.gateway.clone(),
        Arc::clone(&manager),
        Arc::clone(&gateway_metrics),
    ));
    let gateway_task = tokio::spawn(gateway.serve(listener, shutdown.clone()));

    let app_state = AppState::new(Arc::clone(&config), Arc::clone(&manager), gateway_metrics);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            // Middleware executes in reverse order for responses
            .wrap(cors)
            .wrap(middleware::MetricsMiddleware)
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::detailed_health))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/sessions", web::get().to(handlers::list_sessions))
                    .route("/sessions/{id}", web::get().to(handlers::get_session))
                    .route("/sessions/{id}", web::delete().to(handlers::close_session)),
            )
            .route("/health", web::get().to(health::health_check))
            .route("/voice", web::get().to(handlers::voice_webhook))
            .route("/voice", web::post().to(handlers::voice_webhook))
    })
    .bind(&bind_addr)
    .with_context(|| format!("failed to bind HTTP server on {}", bind_addr))?
    // Signals are handled below so sessions are closed before the server stops
    .disable_signals()
    .run();

    let server_handle = server.handle();
    let mut server_task = tokio::spawn(server);

    tokio::select! {
        result = &mut server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = shutdown.cancelled() => {
            info!("Shutdown signal received, stopping...");
        }
    }

    shutdown.cancel();

    let deadline = config.sessions.shutdown_timeout();
    match tokio::time::timeout(deadline, manager.shutdown()).await {
        Ok(closed) => info!("Closed {} session(s)", closed),
        Err(_) => warn!("Timed out after {:?} closing sessions", deadline),
    }

    server_handle.stop(true).await;
    if let Err(e) = gateway_task.await {
        error!("Gateway task error: {}", e);
    }
    if let Err(e) = cleanup_task.await {
        error!("Cleanup task error: {}", e);
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize the tracing (logging) system for the application.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g., "debug", "audio_bridge_gateway=trace")
/// - If not set, defaults to "audio_bridge_gateway=debug,actix_web=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "audio_bridge_gateway=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .context("failed to initialize tracing")?;

    Ok(())
}

/// Cancel `shutdown` on SIGTERM or SIGINT (Ctrl+C).
fn setup_signal_handlers(shutdown: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        shutdown.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            error!("Failed to install SIGTERM handler: {}", e);
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
            }
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("Received SIGINT"),
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        },
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C"),
        Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
    }
}
