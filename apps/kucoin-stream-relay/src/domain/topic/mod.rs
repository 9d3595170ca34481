//! Upstream Topics
//!
//! KuCoin channels are addressed by topic strings of the form
//! `<prefix>:<subject>`, e.g. `/market/ticker:all` or
//! `/market/candles:BTC-USDT_1min`. A [`Topic`] is derived from the
//! downstream request `{kind, symbol}` plus the relay's configured
//! [`CandleInterval`], so the interval used to subscribe is the same value
//! later used to compute candle end times.

use std::fmt;
use std::str::FromStr;

use crate::domain::market::EventKind;

/// Prefix of ticker topics.
pub const TICKER_TOPIC_PREFIX: &str = "/market/ticker";

/// Prefix of candle topics.
pub const CANDLE_TOPIC_PREFIX: &str = "/market/candles";

/// Ticker subject covering every symbol.
pub const ALL_SUBJECT: &str = "all";

// =============================================================================
// Candle Interval
// =============================================================================

/// Candle granularities supported by the feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CandleInterval {
    /// 1 minute.
    #[default]
    OneMinute,
    /// 3 minutes.
    ThreeMinutes,
    /// 5 minutes.
    FiveMinutes,
    /// 15 minutes.
    FifteenMinutes,
    /// 30 minutes.
    ThirtyMinutes,
    /// 1 hour.
    OneHour,
    /// 2 hours.
    TwoHours,
    /// 4 hours.
    FourHours,
    /// 6 hours.
    SixHours,
    /// 8 hours.
    EightHours,
    /// 12 hours.
    TwelveHours,
    /// 1 day.
    OneDay,
    /// 1 week.
    OneWeek,
}

impl CandleInterval {
    /// Get all intervals, shortest first.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[
            Self::OneMinute,
            Self::ThreeMinutes,
            Self::FiveMinutes,
            Self::FifteenMinutes,
            Self::ThirtyMinutes,
            Self::OneHour,
            Self::TwoHours,
            Self::FourHours,
            Self::SixHours,
            Self::EightHours,
            Self::TwelveHours,
            Self::OneDay,
            Self::OneWeek,
        ]
    }

    /// Suffix used in candle topics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OneMinute => "1min",
            Self::ThreeMinutes => "3min",
            Self::FiveMinutes => "5min",
            Self::FifteenMinutes => "15min",
            Self::ThirtyMinutes => "30min",
            Self::OneHour => "1hour",
            Self::TwoHours => "2hour",
            Self::FourHours => "4hour",
            Self::SixHours => "6hour",
            Self::EightHours => "8hour",
            Self::TwelveHours => "12hour",
            Self::OneDay => "1day",
            Self::OneWeek => "1week",
        }
    }

    /// Candle width in seconds.
    #[must_use]
    pub const fn seconds(self) -> i64 {
        const MINUTE: i64 = 60;
        const HOUR: i64 = 60 * MINUTE;
        match self {
            Self::OneMinute => MINUTE,
            Self::ThreeMinutes => 3 * MINUTE,
            Self::FiveMinutes => 5 * MINUTE,
            Self::FifteenMinutes => 15 * MINUTE,
            Self::ThirtyMinutes => 30 * MINUTE,
            Self::OneHour => HOUR,
            Self::TwoHours => 2 * HOUR,
            Self::FourHours => 4 * HOUR,
            Self::SixHours => 6 * HOUR,
            Self::EightHours => 8 * HOUR,
            Self::TwelveHours => 12 * HOUR,
            Self::OneDay => 24 * HOUR,
            Self::OneWeek => 7 * 24 * HOUR,
        }
    }

    /// Interval encoded in a candle topic subject such as `BTC-USDT_1hour`.
    #[must_use]
    pub fn from_subject(subject: &str) -> Option<Self> {
        let (_, suffix) = subject.rsplit_once('_')?;
        suffix.parse().ok()
    }
}

impl FromStr for CandleInterval {
    type Err = TopicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::all()
            .iter()
            .copied()
            .find(|interval| interval.as_str() == s)
            .ok_or_else(|| TopicError::UnknownInterval(s.to_string()))
    }
}

impl fmt::Display for CandleInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Topic
// =============================================================================

/// An upstream channel name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Topic(String);

impl Topic {
    /// Aggregate ticker topic covering every symbol.
    #[must_use]
    pub fn all_tickers() -> Self {
        Self(format!("{TICKER_TOPIC_PREFIX}:{ALL_SUBJECT}"))
    }

    /// Candle topic for one symbol.
    #[must_use]
    pub fn candles(symbol: &str, interval: CandleInterval) -> Self {
        Self(format!("{CANDLE_TOPIC_PREFIX}:{symbol}_{interval}"))
    }

    /// Topic serving a downstream request.
    ///
    /// Ticker requests always map to the aggregate ticker topic. Kline
    /// requests need a symbol.
    ///
    /// # Errors
    ///
    /// Returns [`TopicError::MissingSymbol`] for a kline request without a
    /// symbol and [`TopicError::InvalidSymbol`] for a symbol that cannot
    /// appear in a topic.
    pub fn for_request(
        kind: EventKind,
        symbol: Option<&str>,
        interval: CandleInterval,
    ) -> Result<Self, TopicError> {
        match kind {
            EventKind::Ticker => Ok(Self::all_tickers()),
            EventKind::Kline => {
                let symbol = symbol
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .ok_or(TopicError::MissingSymbol)?;
                if symbol.contains([':', ',', ' ']) {
                    return Err(TopicError::InvalidSymbol(symbol.to_string()));
                }
                Ok(Self::candles(&symbol.to_uppercase(), interval))
            }
        }
    }

    /// Topic string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Segment before the first `:`.
    #[must_use]
    pub fn prefix(&self) -> &str {
        topic_prefix(&self.0)
    }

    /// Segment after the first `:`, if any.
    #[must_use]
    pub fn subject(&self) -> Option<&str> {
        self.0.split_once(':').map(|(_, subject)| subject)
    }

    /// Whether this is a candle topic.
    #[must_use]
    pub fn is_candles(&self) -> bool {
        self.prefix() == CANDLE_TOPIC_PREFIX
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Segment of a raw topic string before the first `:`.
#[must_use]
pub fn topic_prefix(topic: &str) -> &str {
    topic.split_once(':').map_or(topic, |(prefix, _)| prefix)
}

/// Topic derivation error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopicError {
    /// Kline request without a symbol.
    #[error("kline subscriptions require a symbol")]
    MissingSymbol,
    /// Symbol contains topic separators.
    #[error("invalid symbol: {0:?}")]
    InvalidSymbol(String),
    /// Unrecognized candle interval.
    #[error("unknown candle interval: {0:?}")]
    UnknownInterval(String),
}

// =============================================================================
// Tests
// =============================================================================
