//! Downstream Relay Server
//!
//! WebSocket endpoint (`GET /ws`) for downstream clients.
//!
//! # Protocol
//!
//! Clients send `{"type": "ticker" | "kline", "symbol"?: "<symbol>"}`. Each
//! request replaces the connection's previous subscription. Invalid requests
//! get `{"type":"error","message":...}` and change nothing.
//!
//! # Connection Lifecycle
//!
//! ```text
//!   upgrade ──► ConnectionGuard::register ──► reader loop ◄──► writer task
//!                                                 │
//!                       close / error / overflow  ▼
//!               TopicDemand::release ──► drop(guard) ──► unregistered
//! ```
//!
//! The writer task is the only code that writes to the socket. It drains the
//! connection's outbox and bounds every write by the configured timeout.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::ports::UpstreamTopics;
use crate::domain::market::EventKind;
use crate::domain::subscription::{ConnectionId, TopicChanges, TopicDemand};
use crate::domain::topic::{CandleInterval, Topic};
use crate::infrastructure::broadcast::{ConnectionGuard, Payload, SharedBroadcastPool};
use crate::infrastructure::metrics;

// =============================================================================
// Wire Types
// =============================================================================

/// Subscription request from a downstream client.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClientRequest {
    /// Requested event kind.
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Symbol, required for klines.
    #[serde(default)]
    pub symbol: Option<String>,
}

#[derive(Serialize)]
struct ErrorNotice<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    message: &'a str,
}

fn error_payload(message: &str) -> Option<Payload> {
    serde_json::to_string(&ErrorNotice {
        kind: "error",
        message,
    })
    .ok()
    .map(Payload::from)
}

// =============================================================================
// Relay State
// =============================================================================

/// Shared state for every downstream connection.
pub struct RelayState {
    pool: SharedBroadcastPool,
    demand: Arc<TopicDemand>,
    upstream: Arc<dyn UpstreamTopics>,
    candle_interval: CandleInterval,
    write_timeout: Duration,
    /// Held from a demand change until the upstream has been told, so
    /// commands reach the upstream in the order demand changed.
    topic_gate: tokio::sync::Mutex<()>,
}

impl RelayState {
    /// Create relay state.
    #[must_use]
    pub fn new(
        pool: SharedBroadcastPool,
        demand: Arc<TopicDemand>,
        upstream: Arc<dyn UpstreamTopics>,
        candle_interval: CandleInterval,
        write_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            demand,
            upstream,
            candle_interval,
            write_timeout,
            topic_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Pool the connections are registered in.
    #[must_use]
    pub fn pool(&self) -> &SharedBroadcastPool {
        &self.pool
    }

    /// Apply one client request to a connection.
    ///
    /// On success the upstream topic is in place before the connection
    /// starts matching events of the requested kind.
    pub async fn handle_request(&self, guard: &ConnectionGuard, text: &str) {
        let id = guard.id();
        let request = match serde_json::from_str::<ClientRequest>(text) {
            Ok(request) => request,
            Err(e) => {
                tracing::debug!(connection_id = id, error = %e, "Malformed client request");
                notify_error(guard, "malformed request");
                return;
            }
        };

        let topic = match Topic::for_request(
            request.kind,
            request.symbol.as_deref(),
            self.candle_interval,
        ) {
            Ok(topic) => topic,
            Err(e) => {
                tracing::debug!(connection_id = id, error = %e, "Rejected client request");
                notify_error(guard, &e.to_string());
                return;
            }
        };

        {
            let _gate = self.topic_gate.lock().await;
            let changes = self.demand.acquire(id, topic.clone());
            self.apply(changes).await;
        }

        match guard.set_topic(request.kind) {
            Ok(previous) => tracing::debug!(
                connection_id = id,
                kind = %request.kind,
                topic = %topic,
                previous = ?previous,
                "Connection subscribed"
            ),
            Err(e) => tracing::debug!(connection_id = id, error = %e, "Subscription ignored"),
        }
    }

    /// Release whatever upstream topic a connection held.
    pub async fn release(&self, connection: ConnectionId) {
        let _gate = self.topic_gate.lock().await;
        let changes = self.demand.release(connection);
        self.apply(changes).await;
    }

    async fn apply(&self, changes: TopicChanges) {
        for topic in changes.subscribe {
            self.upstream.subscribe(topic).await;
        }
        for topic in changes.unsubscribe {
            self.upstream.unsubscribe(topic).await;
        }
    }
}

fn notify_error(guard: &ConnectionGuard, message: &str) {
    if let Some(payload) = error_payload(message) {
        guard.outbox().push(payload);
    }
}

// =============================================================================
// Router
// =============================================================================

/// Router serving `GET /ws`.
pub fn router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<RelayState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<RelayState>) {
    let guard = ConnectionGuard::register(&state.pool);
    let id = guard.id();
    metrics::set_downstream_clients(state.pool.len());

    let (mut sender, mut receiver) = socket.split();
    let outbox = guard.outbox();
    let write_timeout = state.write_timeout;

    let mut writer = tokio::spawn(async move {
        while let Some(payload) = outbox.next().await {
            let send = sender.send(Message::Text(payload.to_string().into()));
            match tokio::time::timeout(write_timeout, send).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::debug!(connection_id = id, error = %e, "Downstream write failed");
                    break;
                }
                Err(_) => {
                    tracing::warn!(
                        connection_id = id,
                        timeout_ms = u64::try_from(write_timeout.as_millis()).unwrap_or(u64::MAX),
                        "Downstream write timed out"
                    );
                    break;
                }
            }
        }
        let _ = sender.close().await;
    });

    loop {
        tokio::select! {
            _ = &mut writer => break,
            message = receiver.next() => match message {
                Some(Ok(Message::Text(text))) => state.handle_request(&guard, text.as_str()).await,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(connection_id = id, error = %e, "Downstream read failed");
                    break;
                }
            },
        }
    }

    state.release(id).await;
    drop(guard);
    writer.abort();
    metrics::set_downstream_clients(state.pool.len());
    tracing::debug!(connection_id = id, "Connection closed");
}

// =============================================================================
// Relay Server
// =============================================================================

/// Downstream WebSocket server.
pub struct RelayServer {
    port: u16,
    state: Arc<RelayState>,
    cancel: CancellationToken,
}

impl RelayServer {
    /// Create a relay server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<RelayState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run until cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`RelayServerError`] if binding fails or the server stops
    /// with an error.
    pub async fn run(self) -> Result<(), RelayServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| RelayServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Relay server listening");

        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| RelayServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Relay server stopped");
        Ok(())
    }
}

/// Relay server errors.
#[derive(Debug, thiserror::Error)]
pub enum RelayServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),
    /// Server failed while running.
    #[error("server failed: {0}")]
    ServerFailed(String),
}

#[cfg(test)]
mod tests {
    use mockall::predicate::eq;

    use super::*;
    use crate::application::ports::MockUpstreamTopics;
    use crate::infrastructure::broadcast::BroadcastPool;

    fn state(upstream: MockUpstreamTopics, demand: Arc<TopicDemand>) -> RelayState {
        RelayState::new(
            Arc::new(BroadcastPool::default()),
            demand,
            Arc::new(upstream),
            CandleInterval::OneMinute,
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn first_kline_client_subscribes_upstream_once() {
        let topic = Topic::candles("BTC-USDT", CandleInterval::OneMinute);
        let mut upstream = MockUpstreamTopics::new();
        upstream
            .expect_subscribe()
            .with(eq(topic.clone()))
            .times(1)
            .return_const(());
        upstream
            .expect_unsubscribe()
            .with(eq(topic))
            .times(1)
            .return_const(());

        let state = state(upstream, Arc::new(TopicDemand::new()));
        let a = ConnectionGuard::register(state.pool());
        let b = ConnectionGuard::register(state.pool());

        state
            .handle_request(&a, r#"{"type":"kline","symbol":"btc-usdt"}"#)
            .await;
        state
            .handle_request(&b, r#"{"type":"kline","symbol":"BTC-USDT"}"#)
            .await;
        assert_eq!(state.pool().stats().kline_subscribers, 2);

        state.release(a.id()).await;
        state.release(b.id()).await;
    }

    #[tokio::test]
    async fn pinned_ticker_topic_is_never_touched() {
        let mut upstream = MockUpstreamTopics::new();
        upstream.expect_subscribe().never();
        upstream.expect_unsubscribe().never();

        let demand = Arc::new(TopicDemand::new());
        demand.pin(Topic::all_tickers());
        let state = state(upstream, demand);
        let guard = ConnectionGuard::register(state.pool());

        state.handle_request(&guard, r#"{"type":"ticker"}"#).await;
        state.release(guard.id()).await;

        assert_eq!(state.pool().stats().ticker_subscribers, 1);
    }

    #[tokio::test]
    async fn invalid_request_leaves_subscription_unchanged() {
        let mut upstream = MockUpstreamTopics::new();
        upstream.expect_subscribe().never();

        let demand = Arc::new(TopicDemand::new());
        demand.pin(Topic::all_tickers());
        let state = state(upstream, demand);
        let guard = ConnectionGuard::register(state.pool());
        state.handle_request(&guard, r#"{"type":"ticker"}"#).await;

        state.handle_request(&guard, r#"{"type":"kline"}"#).await;
        state.handle_request(&guard, "not json").await;

        assert_eq!(state.pool().topic_of(guard.id()), Ok(Some(EventKind::Ticker)));
        let outbox = guard.outbox();
        let first = outbox.next().await.unwrap();
        assert!(first.contains(r#""type":"error""#));
        assert!(first.contains("symbol"));
        let second = outbox.next().await.unwrap();
        assert!(second.contains("malformed request"));
    }

    /// Upstream that carries a set of topics; unsubscribes take a while.
    #[derive(Default)]
    struct SlowUnsubscribe {
        carried: parking_lot::Mutex<std::collections::HashSet<Topic>>,
    }

    #[async_trait::async_trait]
    impl UpstreamTopics for SlowUnsubscribe {
        async fn subscribe(&self, topic: Topic) {
            self.carried.lock().insert(topic);
        }

        async fn unsubscribe(&self, topic: Topic) {
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.carried.lock().remove(&topic);
        }
    }

    #[tokio::test]
    async fn handover_keeps_topic_carried_upstream() {
        let topic = Topic::candles("ETH-USDT", CandleInterval::OneMinute);
        let upstream = Arc::new(SlowUnsubscribe::default());
        let demand = Arc::new(TopicDemand::new());
        demand.pin(Topic::all_tickers());
        let state = Arc::new(RelayState::new(
            Arc::new(BroadcastPool::default()),
            Arc::clone(&demand),
            upstream.clone(),
            CandleInterval::OneMinute,
            Duration::from_secs(1),
        ));

        let a = ConnectionGuard::register(state.pool());
        let b = ConnectionGuard::register(state.pool());
        state
            .handle_request(&a, r#"{"type":"kline","symbol":"ETH-USDT"}"#)
            .await;

        // A leaves the topic while B asks for it during A's unsubscribe.
        let leaving = {
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                state.handle_request(&a, r#"{"type":"ticker"}"#).await;
                a
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        state
            .handle_request(&b, r#"{"type":"kline","symbol":"ETH-USDT"}"#)
            .await;
        let _a = leaving.await.unwrap();

        assert!(demand.active_topics().contains(&topic));
        assert!(upstream.carried.lock().contains(&topic));
    }

    #[test]
    fn client_request_parsing() {
        let request: ClientRequest =
            serde_json::from_str(r#"{"type":"kline","symbol":"ETH-USDT"}"#).unwrap();
        assert_eq!(request.kind, EventKind::Kline);
        assert_eq!(request.symbol.as_deref(), Some("ETH-USDT"));

        assert!(serde_json::from_str::<ClientRequest>(r#"{"type":"trade"}"#).is_err());
    }
}
