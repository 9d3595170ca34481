//! Broadcast Pool
//!
//! Registry of downstream connections, each tagged with at most one
//! [`EventKind`], and the fan-out of decoded events to them.
//!
//! # Architecture
//!
//! ```text
//!                       ┌──────────────────────────────┐
//!   publish(event) ───► │ RwLock<HashMap<id, Member>>  │
//!                       │   snapshot matching outboxes │
//!                       └──────────────┬───────────────┘
//!                                      │ (lock released)
//!                    ┌─────────────────┼─────────────────┐
//!                    ▼                 ▼                 ▼
//!                 Outbox 1          Outbox 2          Outbox N
//!                    │                 │                 │
//!               writer task       writer task       writer task
//! ```
//!
//! The registry lock is held only to mutate membership or to snapshot the
//! outboxes matching a publish. Each event is serialized once and the
//! shared payload is pushed into every matching outbox. Pushing never
//! blocks, so one slow connection cannot delay delivery to the others.

mod outbox;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

pub use outbox::{Outbox, OverflowPolicy, Payload, PushOutcome};

use crate::application::ports::{EventPublisher, PublishReport};
use crate::domain::market::{EventKind, MarketEvent};
use crate::domain::subscription::ConnectionId;
use crate::infrastructure::config::BroadcastSettings;

// =============================================================================
// Configuration
// =============================================================================

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Outbox capacity per connection.
    pub outbound_capacity: usize,
    /// What to do when an outbox is full.
    pub overflow: OverflowPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 256,
            overflow: OverflowPolicy::DropOldest,
        }
    }
}

impl From<BroadcastSettings> for PoolConfig {
    fn from(settings: BroadcastSettings) -> Self {
        Self {
            outbound_capacity: settings.outbound_capacity,
            overflow: settings.overflow_policy,
        }
    }
}

/// Pool error. Always a no-op for the caller, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    /// The connection is not registered.
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),
}

// =============================================================================
// Pool
// =============================================================================

#[derive(Debug)]
struct Member {
    kind: Option<EventKind>,
    outbox: Arc<Outbox>,
}

/// Pool statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    /// Registered connections.
    pub connections: usize,
    /// Connections subscribed to tickers.
    pub ticker_subscribers: usize,
    /// Connections subscribed to klines.
    pub kline_subscribers: usize,
    /// Connections with no topic yet.
    pub idle: usize,
    /// Events published since start.
    pub events_published: u64,
}

/// Registry and fan-out of downstream connections.
#[derive(Debug)]
pub struct BroadcastPool {
    config: PoolConfig,
    members: RwLock<HashMap<ConnectionId, Member>>,
    next_id: AtomicU64,
    events_published: AtomicU64,
}

/// Shared pool handle.
pub type SharedBroadcastPool = Arc<BroadcastPool>;

impl Default for BroadcastPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

impl BroadcastPool {
    /// Create an empty pool.
    #[must_use]
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            members: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            events_published: AtomicU64::new(0),
        }
    }

    /// Allocate a fresh connection ID.
    #[must_use]
    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a connection with no topic.
    ///
    /// Idempotent: registering an existing connection returns its outbox and
    /// leaves its topic unchanged.
    pub fn register(&self, id: ConnectionId) -> Arc<Outbox> {
        let mut members = self.members.write();
        let member = members.entry(id).or_insert_with(|| Member {
            kind: None,
            outbox: Arc::new(Outbox::new(
                self.config.outbound_capacity,
                self.config.overflow,
            )),
        });
        Arc::clone(&member.outbox)
    }

    /// Point a connection at `kind`, replacing any previous kind.
    ///
    /// Returns the previous kind.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::UnknownConnection`] if the connection is not
    /// registered; nothing changes.
    pub fn set_topic(
        &self,
        id: ConnectionId,
        kind: EventKind,
    ) -> Result<Option<EventKind>, PoolError> {
        let mut members = self.members.write();
        let member = members
            .get_mut(&id)
            .ok_or(PoolError::UnknownConnection(id))?;
        Ok(member.kind.replace(kind))
    }

    /// Remove a connection and close its outbox.
    ///
    /// Idempotent. Returns `true` if the connection was registered.
    pub fn unregister(&self, id: ConnectionId) -> bool {
        let removed = self.members.write().remove(&id);
        let Some(member) = removed else {
            return false;
        };
        member.outbox.close();
        true
    }

    /// Kind a connection is subscribed to.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::UnknownConnection`] if the connection is not
    /// registered.
    pub fn topic_of(&self, id: ConnectionId) -> Result<Option<EventKind>, PoolError> {
        self.members
            .read()
            .get(&id)
            .map(|member| member.kind)
            .ok_or(PoolError::UnknownConnection(id))
    }

    /// Whether a connection is registered.
    #[must_use]
    pub fn is_registered(&self, id: ConnectionId) -> bool {
        self.members.read().contains_key(&id)
    }

    /// Number of registered connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.read().len()
    }

    /// Whether no connections are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.read().is_empty()
    }

    /// Get statistics.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let members = self.members.read();
        let mut stats = PoolStats {
            connections: members.len(),
            events_published: self.events_published.load(Ordering::Relaxed),
            ..PoolStats::default()
        };
        for member in members.values() {
            match member.kind {
                Some(EventKind::Ticker) => stats.ticker_subscribers += 1,
                Some(EventKind::Kline) => stats.kline_subscribers += 1,
                None => stats.idle += 1,
            }
        }
        stats
    }

    fn outboxes_for(&self, kind: EventKind) -> Vec<(ConnectionId, Arc<Outbox>)> {
        self.members
            .read()
            .iter()
            .filter(|(_, member)| member.kind == Some(kind))
            .map(|(id, member)| (*id, Arc::clone(&member.outbox)))
            .collect()
    }
}

impl EventPublisher for BroadcastPool {
    fn publish(&self, event: &MarketEvent) -> PublishReport {
        let payload: Payload = match serde_json::to_string(event) {
            Ok(json) => Arc::from(json),
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize market event");
                return PublishReport::default();
            }
        };
        self.events_published.fetch_add(1, Ordering::Relaxed);

        let mut report = PublishReport::default();
        for (id, outbox) in self.outboxes_for(event.kind()) {
            match outbox.push(Arc::clone(&payload)) {
                PushOutcome::Queued => report.delivered += 1,
                PushOutcome::DroppedOldest => {
                    report.delivered += 1;
                    report.dropped += 1;
                }
                PushOutcome::Overflowed => {
                    report.disconnected += 1;
                    tracing::warn!(connection_id = id, "Outbound queue overflowed, disconnecting");
                }
                PushOutcome::Closed => {}
            }
        }
        report
    }
}

// =============================================================================
// Connection Guard
// =============================================================================

/// Registration of one downstream connection, undone exactly once on drop.
#[derive(Debug)]
pub struct ConnectionGuard {
    id: ConnectionId,
    pool: SharedBroadcastPool,
    outbox: Arc<Outbox>,
}

impl ConnectionGuard {
    /// Register a new connection in `pool`.
    #[must_use]
    pub fn register(pool: &SharedBroadcastPool) -> Self {
        let id = pool.next_connection_id();
        let outbox = pool.register(id);
        tracing::debug!(connection_id = id, "Connection registered");
        Self {
            id,
            pool: Arc::clone(pool),
            outbox,
        }
    }

    /// Connection ID.
    #[must_use]
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    /// Outbox drained by this connection's writer.
    #[must_use]
    pub fn outbox(&self) -> Arc<Outbox> {
        Arc::clone(&self.outbox)
    }

    /// Subscribe this connection to `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::UnknownConnection`] if the connection was
    /// already removed from the pool.
    pub fn set_topic(&self, kind: EventKind) -> Result<Option<EventKind>, PoolError> {
        self.pool.set_topic(self.id, kind)
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.outbox.close();
        if self.pool.unregister(self.id) {
            tracing::debug!(connection_id = self.id, "Connection unregistered");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
