//! Upstream Topic Demand
//!
//! Tracks which upstream topic each downstream connection needs and
//! reference-counts topics across connections, so the relay holds exactly
//! one upstream subscription per topic regardless of how many clients
//! want it.
//!
//! # Design
//!
//! - A connection needs at most one topic at a time. Acquiring a new topic
//!   releases the previous one.
//! - Pinned topics (subscribed at startup) are never released.
//! - Every mutation returns the resulting [`TopicChanges`]: topics whose
//!   count went 0→1 must be subscribed upstream, topics whose count went
//!   1→0 must be unsubscribed.

use std::collections::{BTreeSet, HashMap, HashSet};

use parking_lot::RwLock;

use crate::domain::topic::Topic;

/// Identifier of a downstream connection.
pub type ConnectionId = u64;

// =============================================================================
// Topic Changes
// =============================================================================

/// Upstream subscription work produced by a demand change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicChanges {
    /// Topics to subscribe upstream.
    pub subscribe: Vec<Topic>,
    /// Topics to unsubscribe upstream.
    pub unsubscribe: Vec<Topic>,
}

impl TopicChanges {
    /// Check if there are any changes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscribe.is_empty() && self.unsubscribe.is_empty()
    }
}

// =============================================================================
// Demand State
// =============================================================================

#[derive(Debug, Default)]
struct DemandState {
    by_connection: HashMap<ConnectionId, Topic>,
    refcount: HashMap<Topic, usize>,
    pinned: HashSet<Topic>,
}

impl DemandState {
    fn is_active(&self, topic: &Topic) -> bool {
        self.pinned.contains(topic) || self.refcount.contains_key(topic)
    }

    /// Drop one reference; returns the topic if it is no longer needed.
    fn decrement(&mut self, topic: &Topic) -> Option<Topic> {
        let count = self.refcount.get_mut(topic)?;
        *count = count.saturating_sub(1);
        if *count > 0 {
            return None;
        }
        self.refcount.remove(topic);
        (!self.pinned.contains(topic)).then(|| topic.clone())
    }
}

/// Demand statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DemandStats {
    /// Connections currently holding a topic.
    pub connections: usize,
    /// Topics held by at least one connection.
    pub demanded_topics: usize,
    /// Topics pinned at startup.
    pub pinned_topics: usize,
}

// =============================================================================
// Topic Demand
// =============================================================================

/// Thread-safe, reference-counted view of which upstream topics are needed.
#[derive(Debug, Default)]
pub struct TopicDemand {
    state: RwLock<DemandState>,
}

impl TopicDemand {
    /// Create an empty demand tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin a topic for the lifetime of the process.
    ///
    /// Returns `true` if the topic was not already active and therefore
    /// needs an upstream subscription.
    pub fn pin(&self, topic: Topic) -> bool {
        let mut state = self.state.write();
        let newly_active = !state.is_active(&topic);
        state.pinned.insert(topic);
        newly_active
    }

    /// Point a connection at `topic`, releasing whatever it held before.
    pub fn acquire(&self, connection: ConnectionId, topic: Topic) -> TopicChanges {
        let mut state = self.state.write();
        let mut changes = TopicChanges::default();

        if state.by_connection.get(&connection) == Some(&topic) {
            return changes;
        }

        if !state.is_active(&topic) {
            changes.subscribe.push(topic.clone());
        }
        *state.refcount.entry(topic.clone()).or_insert(0) += 1;

        if let Some(previous) = state.by_connection.insert(connection, topic)
            && let Some(stale) = state.decrement(&previous)
        {
            changes.unsubscribe.push(stale);
        }

        changes
    }

    /// Release whatever a connection held.
    pub fn release(&self, connection: ConnectionId) -> TopicChanges {
        let mut state = self.state.write();
        let mut changes = TopicChanges::default();

        if let Some(previous) = state.by_connection.remove(&connection)
            && let Some(stale) = state.decrement(&previous)
        {
            changes.unsubscribe.push(stale);
        }

        changes
    }

    /// Topic currently held by a connection.
    #[must_use]
    pub fn topic_of(&self, connection: ConnectionId) -> Option<Topic> {
        self.state.read().by_connection.get(&connection).cloned()
    }

    /// Every topic that should be subscribed upstream, sorted.
    #[must_use]
    pub fn active_topics(&self) -> Vec<Topic> {
        let state = self.state.read();
        state
            .pinned
            .iter()
            .chain(state.refcount.keys())
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Get statistics.
    #[must_use]
    pub fn stats(&self) -> DemandStats {
        let state = self.state.read();
        DemandStats {
            connections: state.by_connection.len(),
            demanded_topics: state.refcount.len(),
            pinned_topics: state.pinned.len(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
