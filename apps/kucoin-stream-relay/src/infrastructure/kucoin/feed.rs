//! Upstream Feed Sessions
//!
//! Drives the upstream side of the relay.
//!
//! # Architecture
//!
//! ```text
//!   FeedConnector ──commands──► FeedSession "ticker"     ──frames──┐
//!        │                      FeedSession "candles-1"  ──frames──┼──► FeedPipeline
//!        └──────commands──────► FeedSession "candles-N"  ──frames──┘
//! ```
//!
//! Each [`FeedSession`] owns one upstream WebSocket and runs a single task
//! that multiplexes cancellation, keepalive ticks, subscription commands
//! and inbound frames. The [`FeedConnector`] places candle topics onto
//! sessions, opening a new session once the existing ones carry
//! `topics_per_session` topics.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatManager};
use super::messages::FrameEnvelope;
use super::pipeline::{FeedPipeline, FrameOutcome};
use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use super::session::{ConnectionError, RawFrame, SessionWriter, UpstreamSession};
use crate::application::ports::UpstreamTopics;
use crate::domain::topic::Topic;
use crate::infrastructure::metrics;

/// Commands buffered per session.
const COMMAND_BUFFER: usize = 256;

// =============================================================================
// Session State
// =============================================================================

/// Connection state of one upstream session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Dialing.
    Connecting,
    /// Welcomed and streaming.
    Connected,
    /// Waiting to redial.
    Reconnecting,
    /// Ended.
    Disconnected,
}

/// Observable state of one upstream session.
#[derive(Debug)]
pub struct FeedState {
    label: String,
    state: RwLock<SessionState>,
    last_connected_at: RwLock<Option<DateTime<Utc>>>,
    error_message: RwLock<Option<String>>,
    topic_count: AtomicUsize,
    reconnect_attempts: AtomicU64,
    frames_received: AtomicU64,
}

impl FeedState {
    /// Create state for a session.
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            state: RwLock::new(SessionState::Connecting),
            last_connected_at: RwLock::new(None),
            error_message: RwLock::new(None),
            topic_count: AtomicUsize::new(0),
            reconnect_attempts: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
        }
    }

    /// Set the connection state.
    pub fn set_state(&self, state: SessionState) {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        if previous == state {
            return;
        }
        if state == SessionState::Connected {
            *self.last_connected_at.write() = Some(Utc::now());
            *self.error_message.write() = None;
            metrics::adjust_upstream_sessions(1.0);
        } else if previous == SessionState::Connected {
            metrics::adjust_upstream_sessions(-1.0);
        }
    }

    /// Record the latest error.
    pub fn set_error(&self, message: String) {
        *self.error_message.write() = Some(message);
    }

    /// Session label.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// Whether the session is streaming.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Snapshot for reporting.
    #[must_use]
    pub fn snapshot(&self) -> FeedSnapshot {
        FeedSnapshot {
            label: self.label.clone(),
            state: self.state(),
            connected: self.is_connected(),
            last_connected_at: *self.last_connected_at.read(),
            error: self.error_message.read().clone(),
            topics: self.topic_count.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, Serialize)]
pub struct FeedSnapshot {
    /// Session label.
    pub label: String,
    /// State.
    pub state: SessionState,
    /// Whether streaming.
    pub connected: bool,
    /// Last successful welcome.
    pub last_connected_at: Option<DateTime<Utc>>,
    /// Latest error.
    pub error: Option<String>,
    /// Topics carried.
    pub topics: usize,
    /// Reconnection attempts so far.
    pub reconnect_attempts: u64,
    /// Frames received.
    pub frames_received: u64,
}

// =============================================================================
// Feed Session
// =============================================================================

/// Subscription change for a running session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedCommand {
    /// Start carrying a topic.
    Subscribe(Topic),
    /// Stop carrying a topic.
    Unsubscribe(Topic),
}

/// Connection parameters shared by all sessions.
#[derive(Debug, Clone)]
pub struct FeedSessionConfig {
    /// Instance-server endpoint.
    pub endpoint: String,
    /// Connection token.
    pub token: String,
    /// Keepalive timing.
    pub heartbeat: HeartbeatConfig,
    /// Bound on dial plus welcome.
    pub handshake_timeout: Duration,
    /// Reconnection policy.
    pub reconnect: ReconnectConfig,
}

/// Feed session failure.
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    /// Could not connect and reconnection is off or exhausted.
    #[error("upstream session {label} could not connect: {source}")]
    Connect {
        /// Session label.
        label: String,
        /// Underlying error.
        source: ConnectionError,
    },
    /// Reconnection attempts exhausted after the session ended.
    #[error("upstream session {0} ended and reconnection is exhausted")]
    Exhausted(String),
}

enum SessionExit {
    Cancelled,
    Ended,
}

/// One upstream session and its topics.
pub struct FeedSession {
    label: String,
    config: FeedSessionConfig,
    topics: BTreeSet<Topic>,
    commands: mpsc::Receiver<FeedCommand>,
    pipeline: Arc<FeedPipeline>,
    state: Arc<FeedState>,
    cancel: CancellationToken,
}

impl FeedSession {
    /// Create a session that will subscribe `topics` once connected.
    #[must_use]
    pub fn new(
        label: impl Into<String>,
        config: FeedSessionConfig,
        topics: impl IntoIterator<Item = Topic>,
        commands: mpsc::Receiver<FeedCommand>,
        pipeline: Arc<FeedPipeline>,
        cancel: CancellationToken,
    ) -> Self {
        let label = label.into();
        Self {
            state: Arc::new(FeedState::new(label.clone())),
            label,
            config,
            topics: topics.into_iter().collect(),
            commands,
            pipeline,
            cancel,
        }
    }

    /// Observable state.
    #[must_use]
    pub fn state(&self) -> Arc<FeedState> {
        Arc::clone(&self.state)
    }

    /// Run until cancelled, or until the session ends and reconnection is
    /// disabled or exhausted.
    ///
    /// # Errors
    ///
    /// Returns [`FeedError`] when the session cannot be (re)established.
    pub async fn run(mut self) -> Result<(), FeedError> {
        let mut policy = ReconnectPolicy::new(self.config.reconnect.clone());

        loop {
            self.state.set_state(SessionState::Connecting);
            let connect = tokio::select! {
                () = self.cancel.cancelled() => {
                    self.state.set_state(SessionState::Disconnected);
                    return Ok(());
                }
                result = UpstreamSession::connect(
                    &self.config.endpoint,
                    &self.config.token,
                    self.config.handshake_timeout,
                ) => result,
            };

            match connect {
                Ok(session) => {
                    policy.reset();
                    self.state.set_state(SessionState::Connected);
                    if let SessionExit::Cancelled = self.stream(session).await {
                        self.state.set_state(SessionState::Disconnected);
                        return Ok(());
                    }
                    self.state.set_state(SessionState::Disconnected);
                    if !policy.is_enabled() {
                        tracing::info!(session = %self.label, "Upstream session ended");
                        return Ok(());
                    }
                }
                Err(e) => {
                    tracing::warn!(session = %self.label, error = %e, "Upstream connect failed");
                    self.state.set_error(e.to_string());
                    self.state.set_state(SessionState::Disconnected);
                    if !policy.is_enabled() {
                        return Err(FeedError::Connect {
                            label: self.label.clone(),
                            source: e,
                        });
                    }
                }
            }

            let Some(delay) = policy.next_delay() else {
                return Err(FeedError::Exhausted(self.label.clone()));
            };
            let attempt = policy.attempt_count();
            self.state.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
            self.state.set_state(SessionState::Reconnecting);
            metrics::record_reconnect(&self.label);
            tracing::info!(
                session = %self.label,
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Reconnecting upstream session"
            );

            tokio::select! {
                () = self.cancel.cancelled() => {
                    self.state.set_state(SessionState::Disconnected);
                    return Ok(());
                }
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Pump one connected session until it ends or is cancelled.
    async fn stream(&mut self, session: UpstreamSession) -> SessionExit {
        let activity = session.activity();
        let (mut writer, reader) = session.split();

        for topic in &self.topics {
            send_command(&mut writer, &self.label, &FeedCommand::Subscribe(topic.clone())).await;
        }
        self.state.topic_count.store(self.topics.len(), Ordering::Relaxed);

        let heartbeat_cancel = self.cancel.child_token();
        let (heartbeat_tx, mut heartbeat_rx) = mpsc::channel(4);
        tokio::spawn(
            HeartbeatManager::new(
                self.config.heartbeat.clone(),
                activity,
                heartbeat_tx,
                heartbeat_cancel.clone(),
            )
            .run(),
        );

        let mut frames = reader.listen();
        let mut commands_open = true;

        let exit = loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    writer.close().await;
                    break SessionExit::Cancelled;
                }
                event = heartbeat_rx.recv() => match event {
                    Some(HeartbeatEvent::SendPing) => {
                        if let Err(e) = writer.ping().await {
                            tracing::warn!(session = %self.label, error = %e, "Ping failed");
                            break SessionExit::Ended;
                        }
                    }
                    Some(HeartbeatEvent::Timeout) | None => {
                        self.state.set_error("keepalive timeout".to_string());
                        break SessionExit::Ended;
                    }
                },
                command = self.commands.recv(), if commands_open => match command {
                    Some(command) => {
                        self.apply(&command);
                        send_command(&mut writer, &self.label, &command).await;
                    }
                    None => commands_open = false,
                },
                frame = frames.next() => match frame {
                    Some(frame) => self.handle_frame(&frame),
                    None => break SessionExit::Ended,
                },
            }
        };

        heartbeat_cancel.cancel();
        exit
    }

    fn apply(&mut self, command: &FeedCommand) {
        match command {
            FeedCommand::Subscribe(topic) => {
                self.topics.insert(topic.clone());
            }
            FeedCommand::Unsubscribe(topic) => {
                self.topics.remove(topic);
            }
        }
        self.state.topic_count.store(self.topics.len(), Ordering::Relaxed);
    }

    fn handle_frame(&self, frame: &RawFrame) {
        self.state.frames_received.fetch_add(1, Ordering::Relaxed);
        if let FrameOutcome::Unclassified = self.pipeline.process(frame) {
            log_control_frame(&self.label, frame);
        }
    }
}

async fn send_command(writer: &mut SessionWriter, label: &str, command: &FeedCommand) {
    let correlation_id = uuid::Uuid::new_v4().to_string();
    let result = match command {
        FeedCommand::Subscribe(topic) => writer.subscribe(topic, &correlation_id).await,
        FeedCommand::Unsubscribe(topic) => writer.unsubscribe(topic, &correlation_id).await,
    };
    if let Err(e) = result {
        tracing::warn!(session = label, command = ?command, error = %e, "Subscription request failed");
    }
}

fn log_control_frame(label: &str, frame: &RawFrame) {
    let Ok(envelope) = serde_json::from_str::<FrameEnvelope>(frame.as_str()) else {
        return;
    };
    if envelope.is_error() {
        tracing::warn!(
            session = label,
            id = envelope.id.as_deref().unwrap_or_default(),
            code = ?envelope.code,
            data = ?envelope.data,
            "Upstream reported an error"
        );
    } else if envelope.is_ack() {
        tracing::debug!(session = label, id = envelope.id.as_deref().unwrap_or_default(), "Subscription acknowledged");
    }
}

// =============================================================================
// Feed Connector
// =============================================================================

struct SessionSlot {
    label: String,
    commands: mpsc::Sender<FeedCommand>,
    state: Arc<FeedState>,
    topics: usize,
}

impl SessionSlot {
    /// The session task still owns its command receiver.
    fn is_live(&self) -> bool {
        !self.commands.is_closed()
    }
}

#[derive(Default)]
struct Placement {
    slots: Vec<SessionSlot>,
    topic_slot: HashMap<Topic, usize>,
    candle_sessions: usize,
}

impl Placement {
    /// Slot carrying `topic`, if that session is still running.
    fn live_slot_of(&self, topic: &Topic) -> Option<usize> {
        self.topic_slot
            .get(topic)
            .copied()
            .filter(|&index| self.slots[index].is_live())
    }

    /// Drop the record of `topic` on slot `index`.
    fn evict(&mut self, topic: &Topic, index: usize) {
        if self.topic_slot.get(topic) == Some(&index) {
            self.topic_slot.remove(topic);
            let slot = &mut self.slots[index];
            slot.topics = slot.topics.saturating_sub(1);
        }
    }
}

/// Where a topic command has to go.
struct Route {
    index: usize,
    label: String,
    commands: mpsc::Sender<FeedCommand>,
}

/// Places topics on upstream sessions and spawns sessions as needed.
pub struct FeedConnector {
    config: FeedSessionConfig,
    topics_per_session: usize,
    pipeline: Arc<FeedPipeline>,
    cancel: CancellationToken,
    placement: Mutex<Placement>,
}

impl FeedConnector {
    /// Create a connector. No session is opened yet.
    #[must_use]
    pub fn new(
        config: FeedSessionConfig,
        topics_per_session: usize,
        pipeline: Arc<FeedPipeline>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            topics_per_session: topics_per_session.max(1),
            pipeline,
            cancel,
            placement: Mutex::new(Placement::default()),
        }
    }

    /// Open a dedicated session for `topics` (e.g. the aggregate ticker).
    pub fn open_dedicated(&self, label: &str, topics: Vec<Topic>) -> Arc<FeedState> {
        let mut placement = self.placement.lock();
        self.spawn_slot(&mut placement, label.to_string(), topics)
    }

    /// Place candle topics in bulk, filling sessions up to capacity.
    pub fn open_candles(&self, topics: Vec<Topic>) {
        let mut placement = self.placement.lock();
        let fresh: Vec<_> = topics
            .into_iter()
            .filter(|t| placement.live_slot_of(t).is_none())
            .collect();
        for chunk in fresh.chunks(self.topics_per_session) {
            placement.candle_sessions += 1;
            let label = format!("candles-{}", placement.candle_sessions);
            self.spawn_slot(&mut placement, label, chunk.to_vec());
        }
    }

    /// State of every session opened so far.
    #[must_use]
    pub fn states(&self) -> Vec<Arc<FeedState>> {
        self.placement
            .lock()
            .slots
            .iter()
            .map(|slot| Arc::clone(&slot.state))
            .collect()
    }

    fn spawn_slot(
        &self,
        placement: &mut Placement,
        label: String,
        topics: Vec<Topic>,
    ) -> Arc<FeedState> {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let index = placement.slots.len();
        for topic in &topics {
            placement.topic_slot.insert(topic.clone(), index);
        }

        let session = FeedSession::new(
            label.clone(),
            self.config.clone(),
            topics.iter().cloned(),
            rx,
            Arc::clone(&self.pipeline),
            self.cancel.clone(),
        );
        let state = session.state();
        placement.slots.push(SessionSlot {
            label: label.clone(),
            commands: tx,
            state: Arc::clone(&state),
            topics: topics.len(),
        });

        tracing::info!(session = %label, topics = topics.len(), "Spawning upstream session");
        tokio::spawn(async move {
            if let Err(e) = session.run().await {
                tracing::error!(error = %e, "Upstream session stopped");
            }
        });
        state
    }

    /// Choose (or open) the session for a new topic.
    ///
    /// Topics recorded on a session that has since ended are placed again.
    /// Ended sessions never receive new topics.
    fn route_subscribe(&self, topic: &Topic) -> Option<Route> {
        let mut placement = self.placement.lock();
        if placement.live_slot_of(topic).is_some() {
            return None;
        }
        if let Some(stale) = placement.topic_slot.get(topic).copied() {
            placement.evict(topic, stale);
        }

        let open_slot = placement.slots.iter().position(|slot| {
            slot.label.starts_with("candles-")
                && slot.topics < self.topics_per_session
                && slot.is_live()
        });

        let index = if let Some(index) = open_slot {
            index
        } else {
            placement.candle_sessions += 1;
            let label = format!("candles-{}", placement.candle_sessions);
            self.spawn_slot(&mut placement, label, vec![topic.clone()]);
            return None;
        };

        placement.topic_slot.insert(topic.clone(), index);
        let slot = &mut placement.slots[index];
        slot.topics += 1;
        Some(Route {
            index,
            label: slot.label.clone(),
            commands: slot.commands.clone(),
        })
    }

    fn route_unsubscribe(&self, topic: &Topic) -> Option<Route> {
        let mut placement = self.placement.lock();
        let index = placement.topic_slot.get(topic).copied()?;
        placement.evict(topic, index);
        let slot = &placement.slots[index];
        Some(Route {
            index,
            label: slot.label.clone(),
            commands: slot.commands.clone(),
        })
    }
}

#[async_trait]
impl UpstreamTopics for FeedConnector {
    async fn subscribe(&self, topic: Topic) {
        // Each failed send closes out one slot, so this ends with the topic
        // on a running session or on a freshly spawned one.
        while let Some(route) = self.route_subscribe(&topic) {
            if route
                .commands
                .send(FeedCommand::Subscribe(topic.clone()))
                .await
                .is_ok()
            {
                return;
            }
            tracing::warn!(
                session = %route.label,
                topic = %topic,
                "Upstream session gone, placing topic elsewhere"
            );
            self.placement.lock().evict(&topic, route.index);
        }
    }

    async fn unsubscribe(&self, topic: Topic) {
        if let Some(route) = self.route_unsubscribe(&topic)
            && route
                .commands
                .send(FeedCommand::Unsubscribe(topic))
                .await
                .is_err()
        {
            tracing::debug!(session = %route.label, "Upstream session gone, nothing to unsubscribe");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::EventPublisher;
    use crate::domain::topic::CandleInterval;
    use crate::infrastructure::broadcast::BroadcastPool;
    use crate::infrastructure::kucoin::codec::FrameDecoder;

    /// Connector whose sessions dial a port nothing listens on.
    fn unreachable_connector(topics_per_session: usize) -> FeedConnector {
        let publisher: Arc<dyn EventPublisher> = Arc::new(BroadcastPool::default());
        let config = FeedSessionConfig {
            endpoint: "ws://127.0.0.1:1".to_string(),
            token: "t".to_string(),
            heartbeat: HeartbeatConfig::default(),
            handshake_timeout: Duration::from_secs(2),
            reconnect: ReconnectConfig::default(),
        };
        FeedConnector::new(
            config,
            topics_per_session,
            Arc::new(FeedPipeline::new(FrameDecoder::default(), publisher)),
            CancellationToken::new(),
        )
    }

    async fn wait_for_slot_to_end(connector: &FeedConnector, index: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while connector.placement.lock().slots[index].is_live() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn ended_candle_session_gets_no_new_topics() {
        let connector = unreachable_connector(10);
        let btc = Topic::candles("BTC-USDT", CandleInterval::OneMinute);
        let eth = Topic::candles("ETH-USDT", CandleInterval::OneMinute);

        connector.subscribe(btc.clone()).await;
        wait_for_slot_to_end(&connector, 0).await;
        assert_eq!(connector.states()[0].state(), SessionState::Disconnected);

        // Both calls complete without yielding, so the new session is still running.
        connector.subscribe(eth.clone()).await;
        connector.subscribe(btc.clone()).await;

        let placement = connector.placement.lock();
        assert_eq!(placement.slots.len(), 2);
        assert_eq!(placement.live_slot_of(&eth), Some(1));
        assert_eq!(placement.live_slot_of(&btc), Some(1));
        assert_eq!(placement.slots[0].topics, 0);
        assert_eq!(placement.slots[1].topics, 2);
    }

    #[tokio::test]
    async fn unsubscribe_frees_room_on_its_session() {
        let connector = unreachable_connector(2);
        let btc = Topic::candles("BTC-USDT", CandleInterval::OneMinute);
        let eth = Topic::candles("ETH-USDT", CandleInterval::OneMinute);
        let sol = Topic::candles("SOL-USDT", CandleInterval::OneMinute);

        connector.subscribe(btc.clone()).await;
        connector.subscribe(eth.clone()).await;
        connector.unsubscribe(btc.clone()).await;
        connector.subscribe(sol.clone()).await;

        let placement = connector.placement.lock();
        assert_eq!(placement.slots.len(), 1);
        assert!(!placement.topic_slot.contains_key(&btc));
        assert_eq!(placement.topic_slot.get(&sol), Some(&0));
        assert_eq!(placement.slots[0].topics, 2);
    }

    #[tokio::test]
    async fn unsubscribe_of_unknown_topic_is_ignored() {
        let connector = unreachable_connector(2);
        connector
            .unsubscribe(Topic::candles("BTC-USDT", CandleInterval::OneMinute))
            .await;
        assert!(connector.states().is_empty());
    }

    #[test]
    fn feed_state_tracks_connection() {
        let state = FeedState::new("ticker");
        assert_eq!(state.state(), SessionState::Connecting);

        state.set_error("boom".to_string());
        state.set_state(SessionState::Connected);

        let snapshot = state.snapshot();
        assert!(snapshot.connected);
        assert!(snapshot.error.is_none());
        assert!(snapshot.last_connected_at.is_some());
        assert_eq!(snapshot.label, "ticker");
    }

    #[test]
    fn snapshot_serializes_state_in_snake_case() {
        let state = FeedState::new("candles-1");
        state.set_state(SessionState::Reconnecting);
        let value = serde_json::to_value(state.snapshot()).unwrap();
        assert_eq!(value["state"], "reconnecting");
    }
}
