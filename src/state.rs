//! # Application State Management
//!
//! Shared state handed to every HTTP handler, plus the counters the WebSocket
//! gateway updates as clients come and go.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc (Atomically Reference Counted)
//! - **Purpose**: Lets the HTTP workers, the gateway and the cleanup task share one
//!   [`SessionManager`] and one configuration
//! - **Memory safety**: The data is dropped when the last reference goes away
//!
//! ### Atomics vs. locks
//! - **GatewayMetrics** are plain counters bumped from many tasks at once, so they
//!   are `AtomicU64`s: no lock, no contention
//! - **AppMetrics** keeps a per-endpoint map, which needs a lock; it uses
//!   `parking_lot::RwLock`, whose guards cannot be poisoned, so no `unwrap()`
//!   is needed to read it
//!
//! ### Immutable configuration
//! Configuration is loaded once at startup and never changes afterwards, so it
//! is shared as `Arc<AppConfig>` without any lock.

use crate::config::AppConfig;
use crate::session::SessionManager;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// The main application state that's shared across all HTTP request handlers.
///
/// ## Rust Concepts:
/// - **#[derive(Clone)]**: Cloning copies the `Arc`s, not the data behind them
/// - **Instant**: A point in time, used for uptime
#[derive(Clone)]
pub struct AppState {
    /// Application configuration (read-only after startup)
    pub config: Arc<AppConfig>,

    /// Registry of live client sessions
    pub sessions: Arc<SessionManager>,

    /// Connection counters maintained by the WebSocket gateway
    pub gateway_metrics: Arc<GatewayMetrics>,

    /// HTTP request metrics, updated by the metrics middleware
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// When the server started
    pub start_time: Instant,
}

/// Request metrics collected across all HTTP requests.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of HTTP requests that ended in a 4xx/5xx
    pub error_count: u64,

    /// Key: endpoint name (e.g., "GET /health")
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Detailed performance metrics for a specific API endpoint.
///
/// ## Performance calculations:
/// - **Average response time**: total_duration_ms / request_count
/// - **Error rate**: error_count / request_count
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

/// Counters for the WebSocket side of the server.
///
/// ## Fields:
/// - `connections_accepted`: upgrades that completed the handshake
/// - `handshakes_rejected`: upgrades refused (bad path, bad origin, malformed request)
/// - `sessions_failed`: accepted connections whose session could not be created
#[derive(Debug, Default)]
pub struct GatewayMetrics {
    connections_accepted: AtomicU64,
    handshakes_rejected: AtomicU64,
    sessions_failed: AtomicU64,
}

/// Point-in-time copy of [`GatewayMetrics`], ready for JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GatewayMetricsSnapshot {
    pub connections_accepted: u64,
    pub handshakes_rejected: u64,
    pub sessions_failed: u64,
}

impl GatewayMetrics {
    pub fn record_accepted(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.handshakes_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_failed(&self) {
        self.sessions_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> GatewayMetricsSnapshot {
        GatewayMetricsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            handshakes_rejected: self.handshakes_rejected.load(Ordering::Relaxed),
            sessions_failed: self.sessions_failed.load(Ordering::Relaxed),
        }
    }
}

impl AppState {
    /// Create the shared state.
    ///
    /// ## What this does:
    /// 1. Shares the configuration without a lock (it never changes)
    /// 2. Keeps handles to the session registry and the gateway counters
    /// 3. Starts with empty HTTP metrics
    /// 4. Records the current time as the server start time
    pub fn new(
        config: Arc<AppConfig>,
        sessions: Arc<SessionManager>,
        gateway_metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self {
            config,
            sessions,
            gateway_metrics,
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
        }
    }

    /// Increment the total request counter (called by middleware for every request).
    pub fn increment_request_count(&self) {
        self.metrics.write().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.metrics.write().error_count += 1;
    }

    /// Record detailed metrics for a specific endpoint.
    ///
    /// ## Parameters:
    /// - **endpoint**: The API endpoint (e.g., "GET /health")
    /// - **duration_ms**: How long the request took to process
    /// - **is_error**: Whether this request resulted in an error
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write();
        let endpoint_metric = metrics
            .endpoint_metrics
            .entry(endpoint.to_string())
            .or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Get a snapshot of current metrics.
    ///
    /// Clones under the read lock so the lock is not held while a response is
    /// being serialized.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Error rate as a fraction (0.0 to 1.0).
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
