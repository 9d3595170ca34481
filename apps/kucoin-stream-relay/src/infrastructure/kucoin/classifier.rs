//! Frame Classifier
//!
//! Routes a raw feed frame to a decode path by looking only at the prefix
//! of its `topic` (the segment before the first `:`). The payload is not
//! decoded here. Control frames (`welcome`, `ack`, `pong`), unknown topics
//! and malformed JSON are all [`FrameKind::Unclassified`].

use std::borrow::Cow;

use serde::Deserialize;

use crate::domain::market::EventKind;
use crate::domain::topic::{CANDLE_TOPIC_PREFIX, TICKER_TOPIC_PREFIX, topic_prefix};

/// Decode path for a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// `/market/ticker:*`.
    Ticker,
    /// `/market/candles:*`.
    Kline,
    /// Anything else; dropped.
    Unclassified,
}

impl FrameKind {
    /// Event kind produced by this decode path.
    #[must_use]
    pub const fn event_kind(self) -> Option<EventKind> {
        match self {
            Self::Ticker => Some(EventKind::Ticker),
            Self::Kline => Some(EventKind::Kline),
            Self::Unclassified => None,
        }
    }

    /// Metric label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ticker => "ticker",
            Self::Kline => "kline",
            Self::Unclassified => "unclassified",
        }
    }
}

#[derive(Deserialize)]
struct TopicProbe<'a> {
    #[serde(borrow, default)]
    topic: Option<Cow<'a, str>>,
}

/// Classify a topic string.
#[must_use]
pub fn classify_topic(topic: &str) -> FrameKind {
    match topic_prefix(topic) {
        TICKER_TOPIC_PREFIX => FrameKind::Ticker,
        CANDLE_TOPIC_PREFIX => FrameKind::Kline,
        _ => FrameKind::Unclassified,
    }
}

/// Classify a raw frame by its envelope topic.
#[must_use]
pub fn classify(frame: &str) -> FrameKind {
    match serde_json::from_str::<TopicProbe<'_>>(frame) {
        Ok(TopicProbe {
            topic: Some(topic),
        }) => classify_topic(&topic),
        Ok(_) => FrameKind::Unclassified,
        Err(e) => {
            tracing::trace!(error = %e, "Unparseable frame");
            FrameKind::Unclassified
        }
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case("/market/ticker:BTC-USDT" => FrameKind::Ticker ; "single ticker")]
    #[test_case("/market/ticker:all" => FrameKind::Ticker ; "aggregate ticker")]
    #[test_case("/market/candles:BTC-USDT_1min" => FrameKind::Kline ; "candles")]
    #[test_case("/market/level2:BTC-USDT" => FrameKind::Unclassified ; "other topic")]
    #[test_case("/market/tickerx:BTC-USDT" => FrameKind::Unclassified ; "prefix must match whole segment")]
    #[test_case("" => FrameKind::Unclassified ; "empty")]
    fn topic_classification(topic: &str) -> FrameKind {
        classify_topic(topic)
    }

    #[test_case(r#"{"type":"message","topic":"/market/ticker:all","data":{}}"# => FrameKind::Ticker ; "ticker frame")]
    #[test_case(r#"{"type":"message","topic":"/market/candles:ETH-BTC_1hour","data":{}}"# => FrameKind::Kline ; "candle frame")]
    #[test_case(r#"{"id":"1","type":"welcome"}"# => FrameKind::Unclassified ; "welcome")]
    #[test_case(r#"{"id":"1","type":"pong"}"# => FrameKind::Unclassified ; "pong")]
    #[test_case("not json" => FrameKind::Unclassified ; "malformed")]
    fn frame_classification(frame: &str) -> FrameKind {
        classify(frame)
    }

    #[test]
    fn escaped_topic_still_classifies() {
        let frame = r#"{"topic":"\/market\/ticker:all"}"#;
        assert_eq!(classify(frame), FrameKind::Ticker);
    }

    #[test]
    fn unclassified_has_no_event_kind() {
        assert_eq!(FrameKind::Unclassified.event_kind(), None);
        assert_eq!(FrameKind::Kline.event_kind(), Some(EventKind::Kline));
    }
}
