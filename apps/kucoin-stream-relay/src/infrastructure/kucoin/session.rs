//! Upstream Session
//!
//! One WebSocket session against the KuCoin public feed.
//!
//! # Lifecycle
//!
//! 1. [`UpstreamSession::connect`] dials
//!    `<endpoint>?token=<token>&connectId=<uuid>` and waits for the
//!    server's `welcome` frame. Failure here is final for the attempt.
//! 2. [`UpstreamSession::split`] yields a [`SessionWriter`] for control
//!    frames (subscribe, unsubscribe, ping) and a [`SessionReader`].
//! 3. [`SessionReader::listen`] turns the read half into a lazy stream of
//!    [`RawFrame`]s that ends when the peer closes or the transport fails.
//!    Going-away and abnormal closures are routine for this feed and are
//!    logged quietly; anything else is logged as a warning.
//!
//! Sessions never reconnect on their own.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{BoxStream, SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message, Utf8Bytes};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::heartbeat::SessionActivity;
use super::messages::{FrameEnvelope, PingRequest, SubscriptionAction, SubscriptionRequest};
use crate::domain::topic::Topic;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// =============================================================================
// Errors
// =============================================================================

/// Failure to establish a session.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// Endpoint is not a `ws://` or `wss://` URL.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Dial or upgrade failed.
    #[error("websocket connect failed: {0}")]
    Transport(#[from] tungstenite::Error),

    /// No welcome in time.
    #[error("no welcome frame within {0:?}")]
    HandshakeTimeout(Duration),

    /// Server answered with something other than a welcome.
    #[error("unexpected handshake frame: {0}")]
    UnexpectedHandshake(String),

    /// Server closed before welcoming.
    #[error("session closed during handshake")]
    ClosedDuringHandshake,
}

/// Failure to send a control frame. The session remains usable.
#[derive(Debug, thiserror::Error)]
pub enum SubscribeError {
    /// Serialization failed.
    #[error("failed to encode control frame: {0}")]
    Encode(#[from] serde_json::Error),

    /// Transport rejected the write.
    #[error("failed to send control frame: {0}")]
    Send(#[from] tungstenite::Error),
}

// =============================================================================
// Raw Frame
// =============================================================================

/// An undecoded text frame from the feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame(Utf8Bytes);

impl RawFrame {
    /// Wrap frame text.
    #[must_use]
    pub fn new(text: impl Into<Utf8Bytes>) -> Self {
        Self(text.into())
    }

    /// Frame text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Frame size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the frame is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// =============================================================================
// Session
// =============================================================================

/// A connected, welcomed upstream session.
pub struct UpstreamSession {
    id: String,
    stream: WsStream,
    activity: Arc<SessionActivity>,
}

impl UpstreamSession {
    /// Dial the feed and wait for its welcome.
    ///
    /// The whole dial-and-welcome exchange is bounded by `handshake_timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError`] if the endpoint is invalid, the upgrade
    /// fails, or no welcome arrives in time.
    pub async fn connect(
        endpoint: &str,
        token: &str,
        handshake_timeout: Duration,
    ) -> Result<Self, ConnectionError> {
        let id = uuid::Uuid::new_v4().to_string();
        let url = session_url(endpoint, token, &id)?;

        tracing::debug!(endpoint = %endpoint, session_id = %id, "Connecting upstream session");

        tokio::time::timeout(handshake_timeout, Self::handshake(url, id))
            .await
            .map_err(|_| ConnectionError::HandshakeTimeout(handshake_timeout))?
    }

    async fn handshake(url: String, id: String) -> Result<Self, ConnectionError> {
        let (mut stream, _response) = tokio_tungstenite::connect_async(url).await?;

        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    let envelope: FrameEnvelope = serde_json::from_str(text.as_str())
                        .map_err(|_| ConnectionError::UnexpectedHandshake(text.to_string()))?;
                    if envelope.is_welcome() {
                        tracing::info!(session_id = %id, "Upstream session welcomed");
                        return Ok(Self {
                            id,
                            stream,
                            activity: Arc::new(SessionActivity::new()),
                        });
                    }
                    return Err(ConnectionError::UnexpectedHandshake(text.to_string()));
                }
                Some(Ok(Message::Close(_))) | None => {
                    return Err(ConnectionError::ClosedDuringHandshake);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    /// Session ID; doubles as the `connectId` and ping ID.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Liveness state shared by both halves.
    #[must_use]
    pub fn activity(&self) -> Arc<SessionActivity> {
        Arc::clone(&self.activity)
    }

    /// Split into independently usable write and read halves.
    #[must_use]
    pub fn split(self) -> (SessionWriter, SessionReader) {
        let (sink, stream) = self.stream.split();
        (
            SessionWriter {
                id: self.id.clone(),
                sink,
                activity: Arc::clone(&self.activity),
            },
            SessionReader {
                id: self.id,
                stream,
                activity: self.activity,
            },
        )
    }
}

/// Build the session URL from an instance-server endpoint.
///
/// # Errors
///
/// Returns [`ConnectionError::InvalidEndpoint`] for non-WebSocket URLs.
pub fn session_url(endpoint: &str, token: &str, connect_id: &str) -> Result<String, ConnectionError> {
    let Some((scheme, rest)) = endpoint.split_once("://") else {
        return Err(ConnectionError::InvalidEndpoint(endpoint.to_string()));
    };
    if !matches!(scheme, "ws" | "wss") || rest.is_empty() {
        return Err(ConnectionError::InvalidEndpoint(endpoint.to_string()));
    }
    let separator = if rest.contains('/') { "" } else { "/" };
    Ok(format!(
        "{endpoint}{separator}?token={token}&connectId={connect_id}"
    ))
}

// =============================================================================
// Writer
// =============================================================================

/// Write half: control frames only.
pub struct SessionWriter {
    id: String,
    sink: SplitSink<WsStream, Message>,
    activity: Arc<SessionActivity>,
}

impl SessionWriter {
    /// Subscribe to a topic.
    ///
    /// # Errors
    ///
    /// Returns [`SubscribeError`] if the request cannot be written.
    pub async fn subscribe(&mut self, topic: &Topic, correlation_id: &str) -> Result<(), SubscribeError> {
        self.send_subscription(SubscriptionAction::Subscribe, topic, correlation_id)
            .await
    }

    /// Unsubscribe from a topic.
    ///
    /// # Errors
    ///
    /// Returns [`SubscribeError`] if the request cannot be written.
    pub async fn unsubscribe(
        &mut self,
        topic: &Topic,
        correlation_id: &str,
    ) -> Result<(), SubscribeError> {
        self.send_subscription(SubscriptionAction::Unsubscribe, topic, correlation_id)
            .await
    }

    async fn send_subscription(
        &mut self,
        action: SubscriptionAction,
        topic: &Topic,
        correlation_id: &str,
    ) -> Result<(), SubscribeError> {
        let request = SubscriptionRequest::new(action, correlation_id, topic.as_str());
        let json = serde_json::to_string(&request)?;
        tracing::debug!(
            session_id = %self.id,
            topic = %topic,
            correlation_id,
            action = ?action,
            "Sending subscription request"
        );
        self.sink.send(Message::Text(json.into())).await?;
        Ok(())
    }

    /// Send a keepalive ping.
    ///
    /// # Errors
    ///
    /// Returns [`SubscribeError`] if the ping cannot be written.
    pub async fn ping(&mut self) -> Result<(), SubscribeError> {
        let json = serde_json::to_string(&PingRequest::new(&self.id))?;
        self.sink.send(Message::Text(json.into())).await?;
        self.activity.mark_ping_sent();
        Ok(())
    }

    /// Close the session politely.
    pub async fn close(mut self) {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: Utf8Bytes::from_static("relay shutdown"),
        };
        if let Err(e) = self.sink.send(Message::Close(Some(frame))).await {
            tracing::debug!(session_id = %self.id, error = %e, "Close frame not sent");
        }
        let _ = self.sink.close().await;
    }
}

// =============================================================================
// Reader
// =============================================================================

/// Read half.
pub struct SessionReader {
    id: String,
    stream: SplitStream<WsStream>,
    activity: Arc<SessionActivity>,
}

impl SessionReader {
    /// Lazily yield text frames until the session ends.
    ///
    /// Every inbound frame, including transport-level pings and pongs,
    /// refreshes the session's activity timestamp.
    #[must_use]
    pub fn listen(self) -> BoxStream<'static, RawFrame> {
        futures::stream::unfold(self, |mut reader| async move {
            loop {
                let message = reader.stream.next().await;
                if message.as_ref().is_some_and(Result::is_ok) {
                    reader.activity.record_activity();
                }
                match message {
                    Some(Ok(Message::Text(text))) => return Some((RawFrame::new(text), reader)),
                    Some(Ok(Message::Binary(bytes))) => match Utf8Bytes::try_from(bytes) {
                        Ok(text) => return Some((RawFrame::new(text), reader)),
                        Err(_) => {
                            tracing::debug!(session_id = %reader.id, "Dropping non-UTF-8 binary frame");
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        log_close(&reader.id, frame.as_ref());
                        return None;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log_transport_error(&reader.id, &e);
                        return None;
                    }
                    None => {
                        tracing::info!(session_id = %reader.id, "Upstream stream ended");
                        return None;
                    }
                }
            }
        })
        .boxed()
    }
}

/// Whether a close code is routine for this feed.
#[must_use]
pub fn is_expected_close(code: CloseCode) -> bool {
    matches!(code, CloseCode::Away | CloseCode::Abnormal)
}

fn log_close(session_id: &str, frame: Option<&CloseFrame>) {
    match frame {
        Some(frame) if is_expected_close(frame.code) => {
            tracing::info!(
                session_id,
                code = u16::from(frame.code),
                reason = frame.reason.as_str(),
                "Upstream session closed by peer"
            );
        }
        Some(frame) => {
            tracing::warn!(
                session_id,
                code = u16::from(frame.code),
                reason = frame.reason.as_str(),
                "Upstream session closed unexpectedly"
            );
        }
        None => {
            tracing::warn!(session_id, "Upstream session closed without status");
        }
    }
}

fn log_transport_error(session_id: &str, error: &tungstenite::Error) {
    use tungstenite::error::ProtocolError;

    match error {
        tungstenite::Error::ConnectionClosed
        | tungstenite::Error::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
            tracing::info!(session_id, error = %error, "Upstream session dropped");
        }
        _ => {
            tracing::warn!(session_id, error = %error, "Upstream session failed");
        }
    }
}
