#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements
    )
)]

//! KuCoin Stream Relay - Market Data Fan-out
//!
//! Keeps a small number of sessions open against KuCoin's public WebSocket
//! feed, decodes ticker and candle pushes into typed events, and fans them
//! out to any number of downstream WebSocket clients grouped by the event
//! kind each client asked for.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Market event types and topic bookkeeping
//!   - `market`: Instruments, tickers, candles
//!   - `topic`: Upstream topic names and candle intervals
//!   - `subscription`: Reference-counted upstream topic demand
//!
//! - **Application**: Port definitions
//!   - `ports`: Event publication, upstream topic control
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `kucoin`: Bootstrap REST client, sessions, decode pipeline
//!   - `broadcast`: Connection registry and bounded per-connection outboxes
//!   - `relay`: Downstream WebSocket server
//!   - `config`: Environment configuration
//!   - `health`: Health check and metrics endpoint
//!
//! # Data Flow
//!
//! ```text
//! KuCoin WS (ticker)  ──┐
//!                       │    ┌──────────┐    ┌──────────┐    ┌───────────┐
//! KuCoin WS (candles) ──┼───►│ classify │───►│  decode  │───►│ Broadcast │──► Client 1
//!                       │    └──────────┘    └──────────┘    │   Pool    │──► Client 2
//! KuCoin WS (candles) ──┘                                    └───────────┘──► Client N
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core types with no I/O.
pub mod domain;

/// Application layer - Port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::market::{
    Candle, EventKind, Instrument, InstrumentCatalog, KlineEvent, MarketEvent, TickerEvent,
};
pub use domain::subscription::{ConnectionId, TopicChanges, TopicDemand};
pub use domain::topic::{CandleInterval, Topic, TopicError};

// Ports
pub use application::ports::{EventPublisher, PublishReport, UpstreamTopics};

// Infrastructure config
pub use infrastructure::config::{
    BroadcastSettings, ConfigError, RelayConfig, ServerSettings, UpstreamSettings,
};

// Broadcast pool (for integration tests)
pub use infrastructure::broadcast::{
    BroadcastPool, ConnectionGuard, OverflowPolicy, PoolConfig, PoolError, PoolStats,
    SharedBroadcastPool,
};

// Upstream feed
pub use infrastructure::kucoin::{
    FeedConnector, FeedPipeline, FeedSessionConfig, FrameDecoder, KucoinRestClient,
};

// Servers
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};
pub use infrastructure::relay::{RelayServer, RelayServerError, RelayState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
