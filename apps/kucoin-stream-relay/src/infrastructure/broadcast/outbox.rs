//! Per-Connection Outbox
//!
//! A bounded FIFO of serialized events waiting to be written to one
//! downstream socket. Publishers push without blocking; a single writer task
//! per connection drains it, so socket writes for a connection are never
//! concurrent and a slow client never stalls a publish.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

/// A serialized event shared by every outbox it is queued in.
pub type Payload = Arc<str>;

/// What to do when an outbox is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Discard the oldest queued payload to make room.
    #[default]
    DropOldest,
    /// Close the outbox; the connection is torn down.
    Disconnect,
}

impl OverflowPolicy {
    /// Parse a policy name, defaulting to [`OverflowPolicy::DropOldest`].
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "disconnect" => Self::Disconnect,
            _ => Self::DropOldest,
        }
    }

    /// Policy name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DropOldest => "drop_oldest",
            Self::Disconnect => "disconnect",
        }
    }
}

/// Result of a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Queued.
    Queued,
    /// Queued after discarding the oldest payload.
    DroppedOldest,
    /// Full under [`OverflowPolicy::Disconnect`]; the outbox is now closed.
    Overflowed,
    /// Already closed; nothing queued.
    Closed,
}

#[derive(Debug, Default)]
struct OutboxState {
    queue: VecDeque<Payload>,
    closed: bool,
    dropped: u64,
}

/// Bounded outbound queue for one downstream connection.
#[derive(Debug)]
pub struct Outbox {
    state: Mutex<OutboxState>,
    notify: Notify,
    capacity: usize,
    policy: OverflowPolicy,
}

impl Outbox {
    /// Create an outbox holding at most `capacity` payloads (minimum 1).
    #[must_use]
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(OutboxState {
                queue: VecDeque::with_capacity(capacity.min(1024)),
                ..OutboxState::default()
            }),
            notify: Notify::new(),
            capacity,
            policy,
        }
    }

    /// Queue a payload without blocking.
    pub fn push(&self, payload: Payload) -> PushOutcome {
        let outcome = {
            let mut state = self.state.lock();
            if state.closed {
                return PushOutcome::Closed;
            }
            if state.queue.len() < self.capacity {
                state.queue.push_back(payload);
                PushOutcome::Queued
            } else {
                match self.policy {
                    OverflowPolicy::DropOldest => {
                        state.queue.pop_front();
                        state.queue.push_back(payload);
                        state.dropped += 1;
                        PushOutcome::DroppedOldest
                    }
                    OverflowPolicy::Disconnect => {
                        state.closed = true;
                        PushOutcome::Overflowed
                    }
                }
            }
        };
        self.notify.notify_one();
        outcome
    }

    /// Wait for the next payload.
    ///
    /// Returns `None` once the outbox is closed. Payloads still queued at
    /// close are discarded. Intended for a single consumer.
    pub async fn next(&self) -> Option<Payload> {
        loop {
            {
                let mut state = self.state.lock();
                if state.closed {
                    return None;
                }
                if let Some(payload) = state.queue.pop_front() {
                    return Some(payload);
                }
            }
            self.notify.notified().await;
        }
    }

    /// Close the outbox and wake the consumer.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            state.closed = true;
            state.queue.clear();
        }
        self.notify.notify_one();
    }

    /// Whether the outbox is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Payloads waiting.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Whether nothing is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().queue.is_empty()
    }

    /// Payloads discarded by [`OverflowPolicy::DropOldest`].
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.state.lock().dropped
    }

    /// Maximum queued payloads.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn payload(s: &str) -> Payload {
        Arc::from(s)
    }

    #[tokio::test]
    async fn delivers_in_order() {
        let outbox = Outbox::new(4, OverflowPolicy::DropOldest);
        outbox.push(payload("a"));
        outbox.push(payload("b"));

        assert_eq!(outbox.next().await.as_deref(), Some("a"));
        assert_eq!(outbox.next().await.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn drop_oldest_keeps_newest() {
        let outbox = Outbox::new(2, OverflowPolicy::DropOldest);
        assert_eq!(outbox.push(payload("1")), PushOutcome::Queued);
        assert_eq!(outbox.push(payload("2")), PushOutcome::Queued);
        assert_eq!(outbox.push(payload("3")), PushOutcome::DroppedOldest);

        assert_eq!(outbox.len(), 2);
        assert_eq!(outbox.dropped(), 1);
        assert_eq!(outbox.next().await.as_deref(), Some("2"));
    }

    #[test]
    fn disconnect_policy_closes_on_overflow() {
        let outbox = Outbox::new(1, OverflowPolicy::Disconnect);
        assert_eq!(outbox.push(payload("1")), PushOutcome::Queued);
        assert_eq!(outbox.push(payload("2")), PushOutcome::Overflowed);
        assert!(outbox.is_closed());
        assert_eq!(outbox.push(payload("3")), PushOutcome::Closed);
    }

    #[tokio::test]
    async fn close_wakes_waiting_consumer() {
        let outbox = Arc::new(Outbox::new(4, OverflowPolicy::DropOldest));
        let consumer = {
            let outbox = Arc::clone(&outbox);
            tokio::spawn(async move { outbox.next().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        outbox.close();

        let result = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn push_wakes_waiting_consumer() {
        let outbox = Arc::new(Outbox::new(4, OverflowPolicy::DropOldest));
        let consumer = {
            let outbox = Arc::clone(&outbox);
            tokio::spawn(async move { outbox.next().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        outbox.push(payload("late"));

        let result = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.as_deref(), Some("late"));
    }

    #[test]
    fn policy_parsing() {
        assert_eq!(
            OverflowPolicy::from_str_case_insensitive("DISCONNECT"),
            OverflowPolicy::Disconnect
        );
        assert_eq!(
            OverflowPolicy::from_str_case_insensitive("whatever"),
            OverflowPolicy::DropOldest
        );
    }
}
