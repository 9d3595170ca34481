//! Infrastructure Layer - Adapters and external integrations.
//!
//! Concrete implementations of the application ports plus the HTTP surfaces.

/// KuCoin REST bootstrap and WebSocket sessions.
pub mod kucoin;

/// Downstream connection registry and fan-out.
pub mod broadcast;

/// Downstream WebSocket server.
pub mod relay;

/// Environment-driven configuration.
pub mod config;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Tracing and OpenTelemetry setup.
pub mod telemetry;
