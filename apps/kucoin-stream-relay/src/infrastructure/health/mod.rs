//! Health Check and Metrics Endpoint
//!
//! HTTP endpoint for health checks, session status reporting, and Prometheus
//! metrics.
//!
//! # Endpoints
//!
//! - `GET /health` - JSON health status
//! - `GET /healthz` - Liveness probe (simple OK)
//! - `GET /readyz` - Readiness probe (at least one upstream session connected)
//! - `GET /metrics` - Prometheus metrics in text format

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::domain::subscription::TopicDemand;
use crate::infrastructure::broadcast::{PoolStats, SharedBroadcastPool};
use crate::infrastructure::kucoin::{FeedConnector, FeedPipeline, FeedSnapshot, PipelineStats};
use crate::infrastructure::metrics::get_metrics_handle;

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status.
    pub status: HealthStatus,
    /// Relay version.
    pub version: String,
    /// Uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Upstream sessions.
    pub sessions: Vec<FeedSnapshot>,
    /// Downstream connections.
    pub clients: PoolStats,
    /// Upstream topics.
    pub topics: TopicStatus,
    /// Frame counters.
    pub pipeline: PipelineStats,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Every upstream session is connected.
    Healthy,
    /// Some upstream sessions are down.
    Degraded,
    /// No upstream session is connected.
    Unhealthy,
}

/// Upstream topic counts.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct TopicStatus {
    /// Topics subscribed at startup.
    pub pinned: usize,
    /// Topics requested by connected clients.
    pub demanded: usize,
}

// =============================================================================
// Health Server State
// =============================================================================

/// Shared state for the health server.
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    pool: SharedBroadcastPool,
    demand: Arc<TopicDemand>,
    connector: Arc<FeedConnector>,
    pipeline: Arc<FeedPipeline>,
}

impl HealthServerState {
    /// Create health server state.
    #[must_use]
    pub fn new(
        version: String,
        pool: SharedBroadcastPool,
        demand: Arc<TopicDemand>,
        connector: Arc<FeedConnector>,
        pipeline: Arc<FeedPipeline>,
    ) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            pool,
            demand,
            connector,
            pipeline,
        }
    }

    /// Build the current health report.
    #[must_use]
    pub fn report(&self) -> HealthResponse {
        let sessions: Vec<_> = self
            .connector
            .states()
            .iter()
            .map(|state| state.snapshot())
            .collect();
        let demand = self.demand.stats();

        HealthResponse {
            status: determine_health_status(&sessions),
            version: self.version.clone(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            current_time: Utc::now(),
            sessions,
            clients: self.pool.stats(),
            topics: TopicStatus {
                pinned: demand.pinned_topics,
                demanded: demand.demanded_topics,
            },
            pipeline: self.pipeline.stats(),
        }
    }
}

// =============================================================================
// Health Server
// =============================================================================

/// Health check HTTP server.
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a new health server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Router with every health endpoint.
    pub fn router(state: Arc<HealthServerState>) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/healthz", get(liveness_handler))
            .route("/readyz", get(readiness_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(state)
    }

    /// Run the health server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Health server listening");

        axum::serve(listener, Self::router(self.state))
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let response = state.report();
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let is_ready = state
        .connector
        .states()
        .iter()
        .any(|session| session.is_connected());

    if is_ready {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                handle.render(),
            )
        },
    )
}

fn determine_health_status(sessions: &[FeedSnapshot]) -> HealthStatus {
    let connected = sessions.iter().filter(|s| s.connected).count();
    match connected {
        0 => HealthStatus::Unhealthy,
        n if n == sessions.len() => HealthStatus::Healthy,
        _ => HealthStatus::Degraded,
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================
