//! KuCoin Stream Relay Binary
//!
//! Starts the market data relay.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin kucoin-stream-relay
//! ```
//!
//! # Environment Variables
//!
//! - `KUCOIN_REST_URL`: REST base URL (default: <https://api.kucoin.com>)
//! - `KUCOIN_CANDLE_INTERVAL`: Candle granularity (default: 1min)
//! - `KUCOIN_PRESUBSCRIBE_CANDLES`: Subscribe candles for every symbol at startup (default: false)
//! - `KUCOIN_TOPICS_PER_SESSION`: Candle topics per upstream session (default: 100)
//! - `RELAY_PORT`: Downstream WebSocket port (default: 3000)
//! - `RELAY_HEALTH_PORT`: Health check and metrics port (default: 8082)
//! - `RELAY_RECONNECT_ENABLED`: Re-establish ended sessions (default: false)
//! - `OTEL_ENABLED`: Enable OpenTelemetry export (default: true)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;

use anyhow::Context;
use kucoin_stream_relay::infrastructure::broadcast::{BroadcastPool, PoolConfig};
use kucoin_stream_relay::infrastructure::health::{HealthServer, HealthServerState};
use kucoin_stream_relay::infrastructure::kucoin::{
    FeedConnector, FeedPipeline, FeedSessionConfig, FrameDecoder, HeartbeatConfig,
    KucoinRestClient, ReconnectConfig, catalog_from_symbols,
};
use kucoin_stream_relay::infrastructure::relay::{RelayServer, RelayState};
use kucoin_stream_relay::infrastructure::telemetry;
use kucoin_stream_relay::{EventPublisher, RelayConfig, Topic, TopicDemand, init_metrics};
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("a rustls crypto provider was already installed"))?;

    load_dotenv();

    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting KuCoin Stream Relay");

    if let Err(e) = init_metrics() {
        tracing::warn!(error = %e, "Prometheus recorder not installed");
    }

    let config = RelayConfig::from_env().context("invalid relay configuration")?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    // Bootstrap: connection token and symbol catalog
    let rest = KucoinRestClient::new(&config.upstream.rest_url)?;
    let bullet = rest
        .fetch_bullet()
        .await
        .context("failed to obtain upstream connection token")?;
    let symbols = rest
        .fetch_symbols()
        .await
        .context("failed to load symbol listing")?;
    let catalog = catalog_from_symbols(&symbols);

    // Fan-out and decode pipeline
    let pool = Arc::new(BroadcastPool::new(PoolConfig::from(config.broadcast.clone())));
    let publisher: Arc<dyn EventPublisher> = pool.clone();
    let pipeline = Arc::new(FeedPipeline::new(FrameDecoder::new(catalog), publisher));

    // Upstream sessions
    let session_config = FeedSessionConfig {
        endpoint: bullet.endpoint().to_string(),
        token: bullet.token.clone(),
        heartbeat: bullet.heartbeat(HeartbeatConfig::new(
            config.upstream.ping_interval,
            config.upstream.pong_timeout,
        )),
        handshake_timeout: config.upstream.handshake_timeout,
        reconnect: ReconnectConfig::from_settings(&config.upstream),
    };
    let connector = Arc::new(FeedConnector::new(
        session_config,
        config.upstream.topics_per_session,
        Arc::clone(&pipeline),
        shutdown_token.clone(),
    ));

    let demand = Arc::new(TopicDemand::new());
    demand.pin(Topic::all_tickers());
    connector.open_dedicated("ticker", vec![Topic::all_tickers()]);

    if config.upstream.presubscribe_candles {
        let topics: Vec<_> = symbols
            .iter()
            .map(|s| Topic::candles(&s.symbol, config.upstream.candle_interval))
            .collect();
        for topic in &topics {
            demand.pin(topic.clone());
        }
        tracing::info!(topics = topics.len(), "Presubscribing candle topics");
        connector.open_candles(topics);
    }

    // Downstream relay server
    let relay_state = Arc::new(RelayState::new(
        Arc::clone(&pool),
        Arc::clone(&demand),
        connector.clone(),
        config.upstream.candle_interval,
        config.broadcast.write_timeout,
    ));
    let relay_server = RelayServer::new(
        config.server.relay_port,
        relay_state,
        shutdown_token.clone(),
    );
    tokio::spawn(async move {
        if let Err(e) = relay_server.run().await {
            tracing::error!(error = %e, "Relay server error");
        }
    });

    // Health server
    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        Arc::clone(&pool),
        Arc::clone(&demand),
        Arc::clone(&connector),
        Arc::clone(&pipeline),
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );
    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    tracing::info!("Relay ready");

    await_shutdown(shutdown_token).await;

    tracing::info!("Relay stopped");
    Ok(())
}

/// Log the parsed configuration.
fn log_config(config: &RelayConfig) {
    tracing::info!(
        rest_url = %config.upstream.rest_url,
        candle_interval = %config.upstream.candle_interval,
        presubscribe_candles = config.upstream.presubscribe_candles,
        topics_per_session = config.upstream.topics_per_session,
        reconnect_enabled = config.upstream.reconnect_enabled,
        relay_port = config.server.relay_port,
        health_port = config.server.health_port,
        "Configuration loaded"
    );
    tracing::debug!(
        outbound_capacity = config.broadcast.outbound_capacity,
        overflow_policy = config.broadcast.overflow_policy.as_str(),
        write_timeout_ms =
            u64::try_from(config.broadcast.write_timeout.as_millis()).unwrap_or(u64::MAX),
        "Fan-out settings"
    );
}

/// Load `.env` from the current directory or the nearest ancestor holding one.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    let Ok(cwd) = std::env::current_dir() else {
        return;
    };
    if let Some(env_path) = cwd
        .ancestors()
        .skip(1)
        .map(|dir| dir.join(".env"))
        .find(|path| path.exists())
    {
        let _ = dotenvy::from_path(&env_path);
    }
}

/// Wait for SIGTERM or SIGINT, then cancel every task.
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Ctrl+C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();
}
