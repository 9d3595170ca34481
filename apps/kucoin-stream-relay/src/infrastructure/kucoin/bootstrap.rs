//! Bootstrap REST Client
//!
//! The two REST calls made once at startup:
//!
//! - `POST /api/v1/bullet-public`: connection token and WebSocket servers
//! - `GET /api/v2/symbols`: tradable symbols with their currencies
//!
//! Results are plain data handed to the upstream sessions and the decoder.

use std::time::Duration;

use reqwest::Client;
use serde::de::DeserializeOwned;

use super::heartbeat::HeartbeatConfig;
use super::messages::{API_SUCCESS_CODE, ApiResponse, BulletData, InstanceServer, SymbolInfo};
use crate::domain::market::{EXCHANGE, Instrument, InstrumentCatalog};

/// Default request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Bootstrap failure.
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    /// Transport or decoding failure.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-2xx status.
    #[error("{endpoint} returned status {status}")]
    Status {
        /// Endpoint path.
        endpoint: &'static str,
        /// HTTP status code.
        status: u16,
    },

    /// API-level failure code.
    #[error("{endpoint} failed with code {code}: {message}")]
    Api {
        /// Endpoint path.
        endpoint: &'static str,
        /// KuCoin error code.
        code: String,
        /// KuCoin error message.
        message: String,
    },

    /// Bullet response listed no servers.
    #[error("bullet response contained no instance servers")]
    NoInstanceServers,
}

/// Token and server for opening upstream sessions.
#[derive(Debug, Clone)]
pub struct BulletToken {
    /// Connection token.
    pub token: String,
    /// Chosen instance server.
    pub server: InstanceServer,
}

impl BulletToken {
    /// Server endpoint.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.server.endpoint
    }

    /// Keepalive configuration tightened to the server's limits.
    #[must_use]
    pub fn heartbeat(&self, requested: HeartbeatConfig) -> HeartbeatConfig {
        requested.bounded_by(&self.server)
    }
}

/// Client for the bootstrap endpoints.
#[derive(Debug, Clone)]
pub struct KucoinRestClient {
    client: Client,
    base_url: String,
}

impl KucoinRestClient {
    /// Create a client against `base_url` (e.g. `https://api.kucoin.com`).
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError::Http`] if the HTTP client cannot be built.
    pub fn new(base_url: &str) -> Result<Self, BootstrapError> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Request a public connection token.
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError`] on transport failure, a failure code, or
    /// an empty server list.
    pub async fn fetch_bullet(&self) -> Result<BulletToken, BootstrapError> {
        const ENDPOINT: &str = "/api/v1/bullet-public";

        let response = self
            .client
            .post(format!("{}{ENDPOINT}", self.base_url))
            .send()
            .await?;
        let data: BulletData = Self::unwrap_response(ENDPOINT, response).await?;

        let server = data
            .instance_servers
            .into_iter()
            .next()
            .ok_or(BootstrapError::NoInstanceServers)?;

        tracing::info!(
            endpoint = %server.endpoint,
            ping_interval_ms = server.ping_interval,
            ping_timeout_ms = server.ping_timeout,
            "Obtained upstream connection token"
        );

        Ok(BulletToken {
            token: data.token,
            server,
        })
    }

    /// Fetch tradable symbols.
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError`] on transport failure or a failure code.
    pub async fn fetch_symbols(&self) -> Result<Vec<SymbolInfo>, BootstrapError> {
        const ENDPOINT: &str = "/api/v2/symbols";

        let response = self
            .client
            .get(format!("{}{ENDPOINT}", self.base_url))
            .send()
            .await?;
        let symbols: Vec<SymbolInfo> = Self::unwrap_response(ENDPOINT, response).await?;
        let tradable: Vec<_> = symbols.into_iter().filter(|s| s.enable_trading).collect();

        tracing::info!(symbols = tradable.len(), "Loaded tradable symbols");
        Ok(tradable)
    }

    async fn unwrap_response<T: DeserializeOwned>(
        endpoint: &'static str,
        response: reqwest::Response,
    ) -> Result<T, BootstrapError> {
        let status = response.status();
        if !status.is_success() {
            return Err(BootstrapError::Status {
                endpoint,
                status: status.as_u16(),
            });
        }

        let body: ApiResponse<T> = response.json().await?;
        match body.data {
            Some(data) if body.code == API_SUCCESS_CODE => Ok(data),
            _ => Err(BootstrapError::Api {
                endpoint,
                code: body.code,
                message: body.msg.unwrap_or_default(),
            }),
        }
    }
}

/// Build an instrument catalog from the symbol listing.
#[must_use]
pub fn catalog_from_symbols(symbols: &[SymbolInfo]) -> InstrumentCatalog {
    let mut catalog = InstrumentCatalog::new(EXCHANGE);
    for info in symbols {
        catalog.insert(Instrument::new(
            EXCHANGE,
            &info.symbol,
            &info.base_currency,
            &info.quote_currency,
        ));
    }
    catalog
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    #[tokio::test]
    async fn fetch_bullet_returns_first_server() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/bullet-public"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "code": "200000",
                "data": {
                    "token": "tok-123",
                    "instanceServers": [
                        {"endpoint": "wss://a.example/", "protocol": "websocket", "encrypt": true, "pingInterval": 18000, "pingTimeout": 10000},
                        {"endpoint": "wss://b.example/", "protocol": "websocket", "encrypt": true, "pingInterval": 18000, "pingTimeout": 10000}
                    ]
                }
            })))
            .mount(&server)
            .await;

        let client = KucoinRestClient::new(&server.uri()).unwrap();
        let bullet = client.fetch_bullet().await.unwrap();

        assert_eq!(bullet.token, "tok-123");
        assert_eq!(bullet.endpoint(), "wss://a.example/");
    }

    #[tokio::test]
    async fn fetch_bullet_surfaces_api_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/bullet-public"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "code": "429000",
                "msg": "Too many requests"
            })))
            .mount(&server)
            .await;

        let client = KucoinRestClient::new(&server.uri()).unwrap();
        let err = client.fetch_bullet().await.unwrap_err();

        assert!(matches!(err, BootstrapError::Api { ref code, .. } if code == "429000"));
    }

    #[tokio::test]
    async fn fetch_bullet_rejects_empty_server_list() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/bullet-public"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "code": "200000",
                "data": {"token": "t", "instanceServers": []}
            })))
            .mount(&server)
            .await;

        let client = KucoinRestClient::new(&server.uri()).unwrap();
        assert!(matches!(
            client.fetch_bullet().await,
            Err(BootstrapError::NoInstanceServers)
        ));
    }

    #[tokio::test]
    async fn fetch_symbols_keeps_tradable_only() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v2/symbols"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "code": "200000",
                "data": [
                    {"symbol": "BTC-USDT", "baseCurrency": "BTC", "quoteCurrency": "USDT", "enableTrading": true},
                    {"symbol": "OLD-USDT", "baseCurrency": "OLD", "quoteCurrency": "USDT", "enableTrading": false}
                ]
            })))
            .mount(&server)
            .await;

        let client = KucoinRestClient::new(&server.uri()).unwrap();
        let symbols = client.fetch_symbols().await.unwrap();

        assert_eq!(symbols.len(), 1);
        let catalog = catalog_from_symbols(&symbols);
        assert_eq!(catalog.symbols(), vec!["BTC-USDT".to_string()]);
    }

    #[tokio::test]
    async fn http_failure_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v2/symbols"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = KucoinRestClient::new(&server.uri()).unwrap();
        assert!(matches!(
            client.fetch_symbols().await,
            Err(BootstrapError::Status { status: 503, .. })
        ));
    }
}
