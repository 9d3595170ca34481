//! Port Interfaces
//!
//! ## Driven Ports (Outbound)
//!
//! - [`EventPublisher`]: fans a decoded event out to downstream connections
//! - [`UpstreamTopics`]: adds or removes topics on the upstream sessions

use async_trait::async_trait;

use crate::domain::market::MarketEvent;
use crate::domain::topic::Topic;

/// Outcome of publishing one event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Connections the event was queued for.
    pub delivered: usize,
    /// Older queued events discarded to make room.
    pub dropped: usize,
    /// Connections closed because their queue overflowed.
    pub disconnected: usize,
}

/// Delivers decoded events to interested subscribers.
pub trait EventPublisher: Send + Sync {
    /// Publish one event to every subscriber of its kind.
    fn publish(&self, event: &MarketEvent) -> PublishReport;
}

/// Controls which topics the upstream sessions carry.
///
/// Failures are handled (logged) by the implementation; callers fire and
/// forget.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UpstreamTopics: Send + Sync {
    /// Start receiving `topic`.
    async fn subscribe(&self, topic: Topic);

    /// Stop receiving `topic`.
    async fn unsubscribe(&self, topic: Topic);
}
