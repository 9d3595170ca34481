//! KuCoin Wire Messages
//!
//! Serde types for the KuCoin public WebSocket protocol and the two REST
//! bootstrap endpoints.
//!
//! # Frame Envelope
//!
//! Every inbound frame is a JSON object with a `type` field:
//!
//! ```json
//! {"id":"hQvf8jkno","type":"welcome"}
//! {"id":"1545910660739","type":"ack"}
//! {"id":"1545910590801","type":"pong"}
//! {"type":"message","topic":"/market/ticker:all","subject":"BTC-USDT","data":{...}}
//! ```
//!
//! Numeric market values arrive as strings and are kept as strings here;
//! the decoder turns them into exact decimals.

use serde::{Deserialize, Serialize};

// =============================================================================
// Outbound Control Frames
// =============================================================================

/// Subscription verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionAction {
    /// Start receiving a topic.
    Subscribe,
    /// Stop receiving a topic.
    Unsubscribe,
}

/// Subscribe / unsubscribe request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRequest {
    /// Correlation ID echoed back in the `ack`.
    pub id: String,
    /// Verb.
    #[serde(rename = "type")]
    pub action: SubscriptionAction,
    /// Topic string.
    pub topic: String,
    /// Public channels only.
    pub private_channel: bool,
    /// Ask the server for an `ack`.
    pub response: bool,
}

impl SubscriptionRequest {
    /// Build a request for a public topic.
    #[must_use]
    pub fn new(action: SubscriptionAction, correlation_id: &str, topic: &str) -> Self {
        Self {
            id: correlation_id.to_string(),
            action,
            topic: topic.to_string(),
            private_channel: false,
            response: true,
        }
    }
}

/// Keepalive ping.
#[derive(Debug, Clone, Serialize)]
pub struct PingRequest {
    /// Session ID.
    pub id: String,
    /// Always `"ping"`.
    #[serde(rename = "type")]
    pub msg_type: &'static str,
}

impl PingRequest {
    /// Build a ping for a session.
    #[must_use]
    pub fn new(session_id: &str) -> Self {
        Self {
            id: session_id.to_string(),
            msg_type: "ping",
        }
    }
}

// =============================================================================
// Inbound Frames
// =============================================================================

/// Control portion of any inbound frame.
#[derive(Debug, Clone, Deserialize)]
pub struct FrameEnvelope {
    /// `welcome`, `ack`, `pong`, `message` or `error`.
    #[serde(rename = "type")]
    pub msg_type: String,
    /// Correlation or session ID.
    #[serde(default)]
    pub id: Option<String>,
    /// Topic for `message` frames.
    #[serde(default)]
    pub topic: Option<String>,
    /// Error code for `error` frames.
    #[serde(default)]
    pub code: Option<serde_json::Value>,
    /// Error text for `error` frames.
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

impl FrameEnvelope {
    /// Whether this is the session welcome.
    #[must_use]
    pub fn is_welcome(&self) -> bool {
        self.msg_type == "welcome"
    }

    /// Whether this is a keepalive reply.
    #[must_use]
    pub fn is_pong(&self) -> bool {
        self.msg_type == "pong"
    }

    /// Whether this is a subscription acknowledgement.
    #[must_use]
    pub fn is_ack(&self) -> bool {
        self.msg_type == "ack"
    }

    /// Whether the server reported an error.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.msg_type == "error"
    }
}

/// Ticker push frame.
#[derive(Debug, Clone, Deserialize)]
pub struct TickerFrame {
    /// e.g. `/market/ticker:all`.
    pub topic: String,
    /// Symbol when subscribed to `all`.
    #[serde(default)]
    pub subject: Option<String>,
    /// Payload.
    pub data: TickerData,
}

/// Ticker payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TickerData {
    /// Best ask price.
    pub best_ask: String,
    /// Best bid price.
    pub best_bid: String,
    /// Milliseconds since epoch.
    pub time: i64,
}

/// Candle push frame.
#[derive(Debug, Clone, Deserialize)]
pub struct CandleFrame {
    /// e.g. `/market/candles:BTC-USDT_1min`.
    pub topic: String,
    /// Payload.
    pub data: CandleData,
}

/// Candle payload.
#[derive(Debug, Clone, Deserialize)]
pub struct CandleData {
    /// Symbol.
    pub symbol: String,
    /// `[start, open, close, high, low, base volume, quote volume]`.
    pub candles: Vec<String>,
    /// Push time in nanoseconds.
    #[serde(default)]
    pub time: Option<i64>,
}

// =============================================================================
// REST Bootstrap
// =============================================================================

/// KuCoin's success code.
pub const API_SUCCESS_CODE: &str = "200000";

/// Generic REST envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiResponse<T> {
    /// `"200000"` on success.
    pub code: String,
    /// Payload, absent on some errors.
    pub data: Option<T>,
    /// Error text.
    #[serde(default)]
    pub msg: Option<String>,
}

/// `POST /api/v1/bullet-public` payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulletData {
    /// Connection token.
    pub token: String,
    /// Candidate WebSocket servers.
    pub instance_servers: Vec<InstanceServer>,
}

/// One WebSocket server offered by the bullet endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceServer {
    /// `wss://` endpoint.
    pub endpoint: String,
    /// Always `websocket`.
    #[serde(default)]
    pub protocol: String,
    /// Whether TLS is required.
    #[serde(default)]
    pub encrypt: bool,
    /// Recommended ping interval, milliseconds.
    pub ping_interval: u64,
    /// Server-side pong timeout, milliseconds.
    pub ping_timeout: u64,
}

/// `GET /api/v2/symbols` entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolInfo {
    /// e.g. `BTC-USDT`.
    pub symbol: String,
    /// e.g. `BTC`.
    pub base_currency: String,
    /// e.g. `USDT`.
    pub quote_currency: String,
    /// Whether the pair currently trades.
    #[serde(default)]
    pub enable_trading: bool,
}

// =============================================================================
// Tests
// =============================================================================
