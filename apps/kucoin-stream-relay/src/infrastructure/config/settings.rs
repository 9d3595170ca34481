//! Relay Configuration Settings
//!
//! Configuration types for the relay, loaded from environment variables.
//! Unset or unparseable numeric values fall back to their defaults; an
//! unknown candle interval is an error because it would silently change
//! which upstream topics exist.

use std::time::Duration;

use crate::domain::topic::CandleInterval;
use crate::infrastructure::broadcast::OverflowPolicy;

/// Default KuCoin REST base URL.
pub const DEFAULT_REST_URL: &str = "https://api.kucoin.com";

/// Upstream feed settings.
#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    /// REST base URL for the bootstrap calls.
    pub rest_url: String,
    /// Candle granularity used for every kline subscription.
    pub candle_interval: CandleInterval,
    /// Subscribe candles for every tradable symbol at startup.
    pub presubscribe_candles: bool,
    /// Maximum candle topics carried by one session.
    pub topics_per_session: usize,
    /// Keepalive ping interval.
    pub ping_interval: Duration,
    /// Silence tolerated after a ping.
    pub pong_timeout: Duration,
    /// Bound on dial plus welcome.
    pub handshake_timeout: Duration,
    /// Whether ended sessions are re-established.
    pub reconnect_enabled: bool,
    /// Initial reconnection delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum reconnection delay.
    pub reconnect_delay_max: Duration,
    /// Reconnection backoff multiplier.
    pub reconnect_delay_multiplier: f64,
    /// Maximum reconnection attempts (0 = unlimited).
    pub max_reconnect_attempts: u32,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            rest_url: DEFAULT_REST_URL.to_string(),
            candle_interval: CandleInterval::OneMinute,
            presubscribe_candles: false,
            topics_per_session: 100,
            ping_interval: Duration::from_secs(10),
            pong_timeout: Duration::from_secs(20),
            handshake_timeout: Duration::from_secs(10),
            reconnect_enabled: false,
            reconnect_delay_initial: Duration::from_millis(1000),
            reconnect_delay_max: Duration::from_secs(60),
            reconnect_delay_multiplier: 2.0,
            max_reconnect_attempts: 0,
        }
    }
}

/// Downstream fan-out settings.
#[derive(Debug, Clone)]
pub struct BroadcastSettings {
    /// Outbox capacity per connection.
    pub outbound_capacity: usize,
    /// Overflow policy.
    pub overflow_policy: OverflowPolicy,
    /// Bound on a single socket write.
    pub write_timeout: Duration,
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            outbound_capacity: 256,
            overflow_policy: OverflowPolicy::DropOldest,
            write_timeout: Duration::from_millis(5000),
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Relay WebSocket port.
    pub relay_port: u16,
    /// Health check and metrics port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            relay_port: 3000,
            health_port: 8082,
        }
    }
}

/// Complete relay configuration.
#[derive(Debug, Clone, Default)]
pub struct RelayConfig {
    /// Upstream feed settings.
    pub upstream: UpstreamSettings,
    /// Downstream fan-out settings.
    pub broadcast: BroadcastSettings,
    /// Server port settings.
    pub server: ServerSettings,
}

impl RelayConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if `KUCOIN_CANDLE_INTERVAL` names an unknown interval
    /// or `KUCOIN_REST_URL` is empty.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let rest_url = std::env::var("KUCOIN_REST_URL")
            .unwrap_or_else(|_| defaults.upstream.rest_url.clone());
        if rest_url.trim().is_empty() {
            return Err(ConfigError::EmptyValue("KUCOIN_REST_URL".to_string()));
        }

        let candle_interval = match std::env::var("KUCOIN_CANDLE_INTERVAL") {
            Ok(value) => value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue {
                    key: "KUCOIN_CANDLE_INTERVAL".to_string(),
                    value,
                })?,
            Err(_) => defaults.upstream.candle_interval,
        };

        let upstream = UpstreamSettings {
            rest_url: rest_url.trim_end_matches('/').to_string(),
            candle_interval,
            presubscribe_candles: parse_env_bool(
                "KUCOIN_PRESUBSCRIBE_CANDLES",
                defaults.upstream.presubscribe_candles,
            ),
            topics_per_session: parse_env_usize(
                "KUCOIN_TOPICS_PER_SESSION",
                defaults.upstream.topics_per_session,
            )
            .max(1),
            ping_interval: parse_env_duration_secs(
                "RELAY_PING_INTERVAL_SECS",
                defaults.upstream.ping_interval,
            )
            .max(MIN_PING_INTERVAL),
            pong_timeout: parse_env_duration_secs(
                "RELAY_PONG_TIMEOUT_SECS",
                defaults.upstream.pong_timeout,
            ),
            handshake_timeout: parse_env_duration_secs(
                "RELAY_HANDSHAKE_TIMEOUT_SECS",
                defaults.upstream.handshake_timeout,
            ),
            reconnect_enabled: parse_env_bool(
                "RELAY_RECONNECT_ENABLED",
                defaults.upstream.reconnect_enabled,
            ),
            reconnect_delay_initial: parse_env_duration_millis(
                "RELAY_RECONNECT_DELAY_INITIAL_MS",
                defaults.upstream.reconnect_delay_initial,
            ),
            reconnect_delay_max: parse_env_duration_secs(
                "RELAY_RECONNECT_DELAY_MAX_SECS",
                defaults.upstream.reconnect_delay_max,
            ),
            reconnect_delay_multiplier: parse_env_f64(
                "RELAY_RECONNECT_DELAY_MULTIPLIER",
                defaults.upstream.reconnect_delay_multiplier,
            ),
            max_reconnect_attempts: parse_env_u32(
                "RELAY_MAX_RECONNECT_ATTEMPTS",
                defaults.upstream.max_reconnect_attempts,
            ),
        };

        let broadcast = BroadcastSettings {
            outbound_capacity: parse_env_usize(
                "RELAY_OUTBOUND_CAPACITY",
                defaults.broadcast.outbound_capacity,
            )
            .max(1),
            overflow_policy: std::env::var("RELAY_OVERFLOW_POLICY")
                .map(|s| OverflowPolicy::from_str_case_insensitive(&s))
                .unwrap_or(defaults.broadcast.overflow_policy),
            write_timeout: parse_env_duration_millis(
                "RELAY_WRITE_TIMEOUT_MS",
                defaults.broadcast.write_timeout,
            ),
        };

        let server = ServerSettings {
            relay_port: parse_env_u16("RELAY_PORT", defaults.server.relay_port),
            health_port: parse_env_u16("RELAY_HEALTH_PORT", defaults.server.health_port),
        };

        Ok(Self {
            upstream,
            broadcast,
            server,
        })
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable holds an unusable value.
    #[error("invalid value {value:?} for environment variable {key}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// Offending value.
        value: String,
    },
}

fn parse_env_u16(key: &str, default: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .and_then(|v| match v.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        })
        .unwrap_or(default)
}

/// Shortest accepted keepalive period.
const MIN_PING_INTERVAL: Duration = Duration::from_secs(1);

fn parse_env_duration_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}

fn parse_env_duration_millis(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}
