//! Relay WebSocket Integration Tests
//!
//! Drives the downstream `/ws` endpoint with real WebSocket clients.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

use kucoin_stream_relay::infrastructure::relay::router;
use kucoin_stream_relay::{
    BroadcastPool, CandleInterval, EventPublisher, Instrument, MarketEvent, RelayState,
    SharedBroadcastPool, TickerEvent, Topic, TopicDemand, UpstreamTopics,
};

type Client = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    Subscribe(String),
    Unsubscribe(String),
}

#[derive(Default)]
struct RecordingUpstream {
    calls: Mutex<Vec<Call>>,
}

impl RecordingUpstream {
    fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl UpstreamTopics for RecordingUpstream {
    async fn subscribe(&self, topic: Topic) {
        self.calls.lock().push(Call::Subscribe(topic.to_string()));
    }

    async fn unsubscribe(&self, topic: Topic) {
        self.calls.lock().push(Call::Unsubscribe(topic.to_string()));
    }
}

struct Harness {
    addr: String,
    pool: SharedBroadcastPool,
    upstream: Arc<RecordingUpstream>,
}

async fn start_relay() -> Harness {
    let pool = Arc::new(BroadcastPool::default());
    let demand = Arc::new(TopicDemand::new());
    demand.pin(Topic::all_tickers());
    let upstream = Arc::new(RecordingUpstream::default());

    let state = Arc::new(RelayState::new(
        Arc::clone(&pool),
        demand,
        upstream.clone(),
        CandleInterval::OneMinute,
        Duration::from_secs(1),
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        axum::serve(listener, router(state)).await.unwrap();
    });

    Harness {
        addr,
        pool,
        upstream,
    }
}

async fn connect(harness: &Harness) -> Client {
    let (client, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", harness.addr))
        .await
        .unwrap();
    client
}

async fn send(client: &mut Client, text: &str) {
    client
        .send(Message::Text(text.to_string().into()))
        .await
        .unwrap();
}

async fn next_text(client: &mut Client) -> String {
    loop {
        let message = timeout(Duration::from_secs(5), client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        if let Message::Text(text) = message {
            return text.to_string();
        }
    }
}

async fn wait_until(condition: impl Fn() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

fn ticker() -> MarketEvent {
    TickerEvent::new(
        Instrument::new("kucoin", "BTC-USDT", "BTC", "USDT"),
        Decimal::from_str("67232.9").unwrap(),
        Decimal::from_str("67232.8").unwrap(),
        1_690_000_000_000,
    )
    .into()
}

#[tokio::test]
async fn ticker_client_receives_published_events() {
    let harness = start_relay().await;
    let mut client = connect(&harness).await;

    send(&mut client, r#"{"type":"ticker"}"#).await;
    wait_until(|| harness.pool.stats().ticker_subscribers == 1).await;

    harness.pool.publish(&ticker());

    let text = next_text(&mut client).await;
    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(value["type"], "ticker");
    assert_eq!(value["ask_price"], "67232.9");
    assert_eq!(value["instrument"]["base_currency"], "BTC");

    let event: MarketEvent = serde_json::from_str(&text).unwrap();
    assert_eq!(event, ticker());
    assert!(harness.upstream.calls().is_empty());
}

#[tokio::test]
async fn kline_without_symbol_gets_error_notice() {
    let harness = start_relay().await;
    let mut client = connect(&harness).await;

    send(&mut client, r#"{"type":"kline"}"#).await;

    let text = next_text(&mut client).await;
    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(value["type"], "error");
    assert!(value["message"].as_str().unwrap().contains("symbol"));
    assert_eq!(harness.pool.stats().kline_subscribers, 0);
}

#[tokio::test]
async fn kline_topic_follows_client_lifetime() {
    let harness = start_relay().await;
    let topic = Topic::candles("ETH-USDT", CandleInterval::OneMinute).to_string();

    let mut first = connect(&harness).await;
    let mut second = connect(&harness).await;
    send(&mut first, r#"{"type":"kline","symbol":"ETH-USDT"}"#).await;
    send(&mut second, r#"{"type":"kline","symbol":"eth-usdt"}"#).await;
    wait_until(|| harness.pool.stats().kline_subscribers == 2).await;
    assert_eq!(harness.upstream.calls(), [Call::Subscribe(topic.clone())]);

    first.close(None).await.unwrap();
    wait_until(|| harness.pool.len() == 1).await;
    assert_eq!(harness.upstream.calls().len(), 1);

    // Switching kind releases the candle topic.
    send(&mut second, r#"{"type":"ticker"}"#).await;
    wait_until(|| harness.pool.stats().ticker_subscribers == 1).await;
    assert_eq!(
        harness.upstream.calls(),
        [Call::Subscribe(topic.clone()), Call::Unsubscribe(topic)]
    );

    second.close(None).await.unwrap();
    wait_until(|| harness.pool.is_empty()).await;
}
