//! Session Keepalive
//!
//! KuCoin drops sessions that stay silent for longer than the server's
//! ping timeout, so every session sends `{"id":..,"type":"ping"}` on a fixed
//! interval. Any inbound frame counts as proof of life; a session that has
//! been waiting on a pong for longer than `pong_timeout` with nothing else
//! arriving is considered dead.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::messages::InstanceServer;

/// Keepalive timing.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Interval between pings.
    pub ping_interval: Duration,
    /// Silence tolerated after a ping before the session is abandoned.
    pub pong_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(10),
            pong_timeout: Duration::from_secs(20),
        }
    }
}

impl HeartbeatConfig {
    /// Create a configuration with custom values.
    #[must_use]
    pub const fn new(ping_interval: Duration, pong_timeout: Duration) -> Self {
        Self {
            ping_interval,
            pong_timeout,
        }
    }

    /// Tighten this configuration to what the instance server demands.
    ///
    /// The server's advertised ping interval caps ours; its ping timeout
    /// caps how long we wait for a reply.
    #[must_use]
    pub fn bounded_by(self, server: &InstanceServer) -> Self {
        let cap = |ours: Duration, theirs_ms: u64| {
            if theirs_ms == 0 {
                ours
            } else {
                ours.min(Duration::from_millis(theirs_ms))
            }
        };
        Self {
            ping_interval: cap(self.ping_interval, server.ping_interval),
            pong_timeout: cap(
                self.pong_timeout,
                server.ping_interval.saturating_add(server.ping_timeout),
            ),
        }
    }
}

/// Events emitted by the heartbeat manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// Time to send a ping.
    SendPing,
    /// Nothing heard back in time; the session should be torn down.
    Timeout,
}

// =============================================================================
// Session Activity
// =============================================================================

/// Liveness bookkeeping shared by a session's reader, writer and heartbeat.
#[derive(Debug)]
pub struct SessionActivity {
    last_activity: RwLock<Instant>,
    waiting_for_pong: AtomicBool,
}

impl Default for SessionActivity {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionActivity {
    /// Create activity state stamped now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_activity: RwLock::new(Instant::now()),
            waiting_for_pong: AtomicBool::new(false),
        }
    }

    /// Record an inbound frame of any kind.
    pub fn record_activity(&self) {
        *self.last_activity.write() = Instant::now();
        self.waiting_for_pong.store(false, Ordering::SeqCst);
    }

    /// Record that a ping went out.
    pub fn mark_ping_sent(&self) {
        self.waiting_for_pong.store(true, Ordering::SeqCst);
    }

    /// Whether a ping is outstanding.
    #[must_use]
    pub fn is_waiting_for_pong(&self) -> bool {
        self.waiting_for_pong.load(Ordering::SeqCst)
    }

    /// Time since the last inbound frame.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_activity.read().elapsed()
    }

    /// Last inbound frame.
    #[must_use]
    pub fn last_activity(&self) -> Instant {
        *self.last_activity.read()
    }
}

// =============================================================================
// Heartbeat Manager
// =============================================================================

/// Drives the ping schedule for one session.
pub struct HeartbeatManager {
    config: HeartbeatConfig,
    activity: Arc<SessionActivity>,
    event_tx: mpsc::Sender<HeartbeatEvent>,
    cancel: CancellationToken,
}

impl HeartbeatManager {
    /// Create a heartbeat manager.
    #[must_use]
    pub const fn new(
        config: HeartbeatConfig,
        activity: Arc<SessionActivity>,
        event_tx: mpsc::Sender<HeartbeatEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            activity,
            event_tx,
            cancel,
        }
    }

    /// Run until cancelled, the receiver goes away, or a timeout fires.
    pub async fn run(self) {
        // interval_at panics on a zero period
        let period = self.config.ping_interval.max(Duration::from_millis(1));
        let start = tokio::time::Instant::now() + period;
        let mut interval = tokio::time::interval_at(start, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = interval.tick() => {
                    if !self.tick().await {
                        break;
                    }
                }
            }
        }
    }

    /// Returns `false` once the manager should stop.
    async fn tick(&self) -> bool {
        if self.activity.is_waiting_for_pong() {
            let idle = self.activity.idle_for();
            if idle > self.config.pong_timeout {
                tracing::warn!(
                    idle_ms = u64::try_from(idle.as_millis()).unwrap_or(u64::MAX),
                    timeout_ms =
                        u64::try_from(self.config.pong_timeout.as_millis()).unwrap_or(u64::MAX),
                    "Upstream keepalive timed out"
                );
                let _ = self.event_tx.send(HeartbeatEvent::Timeout).await;
                return false;
            }
        }

        self.event_tx.send(HeartbeatEvent::SendPing).await.is_ok()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn server(ping_interval: u64, ping_timeout: u64) -> InstanceServer {
        InstanceServer {
            endpoint: "wss://example".to_string(),
            protocol: "websocket".to_string(),
            encrypt: true,
            ping_interval,
            ping_timeout,
        }
    }

    #[test]
    fn default_pings_every_ten_seconds() {
        assert_eq!(HeartbeatConfig::default().ping_interval, Duration::from_secs(10));
    }

    #[test]
    fn server_interval_caps_ours() {
        let config = HeartbeatConfig::default().bounded_by(&server(5_000, 3_000));
        assert_eq!(config.ping_interval, Duration::from_secs(5));
        assert_eq!(config.pong_timeout, Duration::from_secs(8));

        let relaxed = HeartbeatConfig::default().bounded_by(&server(18_000, 10_000));
        assert_eq!(relaxed.ping_interval, Duration::from_secs(10));
    }

    #[test]
    fn server_timeouts_near_u64_max_saturate() {
        let config = HeartbeatConfig::default().bounded_by(&server(u64::MAX, u64::MAX));
        assert_eq!(config.ping_interval, Duration::from_secs(10));
        assert_eq!(config.pong_timeout, HeartbeatConfig::default().pong_timeout);
    }

    #[test]
    fn activity_clears_pending_ping() {
        let activity = SessionActivity::new();
        activity.mark_ping_sent();
        assert!(activity.is_waiting_for_pong());

        activity.record_activity();
        assert!(!activity.is_waiting_for_pong());
        assert!(activity.idle_for() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn emits_ping_after_interval() {
        let config = HeartbeatConfig::new(Duration::from_millis(20), Duration::from_secs(5));
        let activity = Arc::new(SessionActivity::new());
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();

        tokio::spawn(HeartbeatManager::new(config, activity, tx, cancel.clone()).run());

        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert_eq!(event, Some(HeartbeatEvent::SendPing));
        cancel.cancel();
    }

    #[tokio::test]
    async fn zero_interval_still_pings() {
        let config = HeartbeatConfig::new(Duration::ZERO, Duration::from_secs(5));
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(
            HeartbeatManager::new(config, Arc::new(SessionActivity::new()), tx, cancel.clone())
                .run(),
        );

        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert_eq!(event, Some(HeartbeatEvent::SendPing));
        cancel.cancel();
        drop(rx);
        assert!(handle.await.is_ok());
    }

    #[tokio::test]
    async fn emits_timeout_when_silent() {
        let config = HeartbeatConfig::new(Duration::from_millis(20), Duration::from_millis(10));
        let activity = Arc::new(SessionActivity::new());
        activity.mark_ping_sent();
        let (tx, mut rx) = mpsc::channel(4);

        tokio::spawn(
            HeartbeatManager::new(config, Arc::clone(&activity), tx, CancellationToken::new())
                .run(),
        );

        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert_eq!(event, Some(HeartbeatEvent::Timeout));
    }
}
