//! Frame Decoder
//!
//! Turns classified raw frames into canonical [`TickerEvent`] and
//! [`KlineEvent`] values.
//!
//! # Numeric Handling
//!
//! Prices and volumes arrive as decimal strings and are parsed with
//! [`Decimal::from_str`], never through `f64`. Any field that fails to parse
//! fails the whole frame with a [`DecodeError`]; the frame is dropped rather
//! than forwarded with substituted values.
//!
//! # Candle Layout
//!
//! `data.candles` is positional:
//!
//! ```text
//! [start, open, close, high, low, base volume, quote volume]
//! ```
//!
//! Note that close precedes high and low.

use std::str::FromStr;

use rust_decimal::Decimal;

use super::classifier::FrameKind;
use super::messages::{CandleFrame, TickerFrame};
use crate::domain::market::{Candle, InstrumentCatalog, KlineEvent, MarketEvent, TickerEvent};
use crate::domain::topic::{ALL_SUBJECT, CandleInterval};

/// Number of positional candle fields.
pub const CANDLE_FIELDS: usize = 7;

/// Error decoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// Frame is not valid JSON or lacks required fields.
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    /// A numeric field is not a decimal.
    #[error("invalid decimal in {field}: {value:?}")]
    InvalidDecimal {
        /// Field name.
        field: &'static str,
        /// Raw value.
        value: String,
    },

    /// Candle start time is not an integer.
    #[error("invalid candle start time: {0:?}")]
    InvalidStartTime(String),

    /// Candle array too short.
    #[error("expected {expected} candle fields, got {actual}")]
    MissingCandleFields {
        /// Required count.
        expected: usize,
        /// Received count.
        actual: usize,
    },

    /// No symbol could be determined.
    #[error("frame on topic {0:?} carries no symbol")]
    MissingSymbol(String),

    /// Candle topic without a recognizable interval suffix.
    #[error("no candle interval in topic {0:?}")]
    UnknownInterval(String),
}

impl DecodeError {
    /// Metric label.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed",
            Self::InvalidDecimal { .. } => "invalid_decimal",
            Self::InvalidStartTime(_) => "invalid_start_time",
            Self::MissingCandleFields { .. } => "missing_candle_fields",
            Self::MissingSymbol(_) => "missing_symbol",
            Self::UnknownInterval(_) => "unknown_interval",
        }
    }
}

/// Stateless frame decoder bound to an instrument catalog.
#[derive(Debug, Clone, Default)]
pub struct FrameDecoder {
    catalog: InstrumentCatalog,
}

impl FrameDecoder {
    /// Create a decoder resolving instruments through `catalog`.
    #[must_use]
    pub const fn new(catalog: InstrumentCatalog) -> Self {
        Self { catalog }
    }

    /// Decode a frame along the path chosen by the classifier.
    ///
    /// Candle frames use the interval named in their own topic, which is
    /// the interval the relay subscribed with.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] if the payload cannot be decoded.
    pub fn decode(&self, kind: FrameKind, frame: &str) -> Result<Option<MarketEvent>, DecodeError> {
        match kind {
            FrameKind::Ticker => self.decode_ticker(frame).map(|t| Some(t.into())),
            FrameKind::Kline => {
                let parsed: CandleFrame = serde_json::from_str(frame)?;
                let interval = parsed
                    .topic
                    .split_once(':')
                    .and_then(|(_, subject)| CandleInterval::from_subject(subject))
                    .ok_or_else(|| DecodeError::UnknownInterval(parsed.topic.clone()))?;
                self.kline_from_frame(parsed, interval).map(|k| Some(k.into()))
            }
            FrameKind::Unclassified => Ok(None),
        }
    }

    /// Decode a ticker frame.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] if the frame is malformed or a price is not
    /// a decimal.
    pub fn decode_ticker(&self, frame: &str) -> Result<TickerEvent, DecodeError> {
        let parsed: TickerFrame = serde_json::from_str(frame)?;

        let symbol = match parsed.topic.split_once(':') {
            Some((_, subject)) if subject != ALL_SUBJECT && !subject.is_empty() => subject,
            _ => parsed
                .subject
                .as_deref()
                .filter(|s| !s.is_empty())
                .ok_or_else(|| DecodeError::MissingSymbol(parsed.topic.clone()))?,
        };

        let ask = parse_decimal("bestAsk", &parsed.data.best_ask)?;
        let bid = parse_decimal("bestBid", &parsed.data.best_bid)?;

        Ok(TickerEvent::new(
            self.catalog.resolve(symbol),
            ask,
            bid,
            parsed.data.time,
        ))
    }

    /// Decode a candle frame with an explicit interval.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] if the frame is malformed, the candle array
    /// has fewer than seven fields, or a field does not parse.
    pub fn decode_kline(
        &self,
        frame: &str,
        interval: CandleInterval,
    ) -> Result<KlineEvent, DecodeError> {
        let parsed: CandleFrame = serde_json::from_str(frame)?;
        self.kline_from_frame(parsed, interval)
    }

    fn kline_from_frame(
        &self,
        parsed: CandleFrame,
        interval: CandleInterval,
    ) -> Result<KlineEvent, DecodeError> {
        let fields = &parsed.data.candles;
        if fields.len() < CANDLE_FIELDS {
            return Err(DecodeError::MissingCandleFields {
                expected: CANDLE_FIELDS,
                actual: fields.len(),
            });
        }
        if parsed.data.symbol.is_empty() {
            return Err(DecodeError::MissingSymbol(parsed.topic));
        }

        let start_time = fields[0]
            .trim()
            .parse::<i64>()
            .map_err(|_| DecodeError::InvalidStartTime(fields[0].clone()))?;

        let candle = Candle {
            open: parse_decimal("open", &fields[1])?,
            close: parse_decimal("close", &fields[2])?,
            high: parse_decimal("high", &fields[3])?,
            low: parse_decimal("low", &fields[4])?,
            volume_base: parse_decimal("volume", &fields[5])?,
            volume_quote: parse_decimal("turnover", &fields[6])?,
        };

        KlineEvent::new(
            self.catalog.resolve(&parsed.data.symbol),
            interval,
            start_time,
            candle,
        )
        .ok_or_else(|| DecodeError::InvalidStartTime(fields[0].clone()))
    }
}

fn parse_decimal(field: &'static str, value: &str) -> Result<Decimal, DecodeError> {
    Decimal::from_str(value.trim()).map_err(|_| DecodeError::InvalidDecimal {
        field,
        value: value.to_string(),
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::domain::market::{EXCHANGE, Instrument};

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn ticker_frame(ask: &str, bid: &str) -> String {
        format!(
            r#"{{"type":"message","topic":"/market/ticker:all","subject":"BTC-USDT","data":{{"bestAsk":"{ask}","bestBid":"{bid}","time":1690000000123}}}}"#
        )
    }

    fn candle_frame(topic: &str, fields: &[&str]) -> String {
        let candles = serde_json::to_string(fields).unwrap();
        format!(
            r#"{{"type":"message","topic":"{topic}","subject":"trade.candles.update","data":{{"symbol":"BTC-USDT","candles":{candles},"time":1690000000000000000}}}}"#
        )
    }

    const SAMPLE: [&str; 7] = ["1690000000", "100.5", "101.2", "102.0", "99.8", "500", "50250"];

    #[test]
    fn ticker_prices_are_exact() {
        let decoder = FrameDecoder::default();
        let event = decoder
            .decode_ticker(&ticker_frame("0.10000000000000001", "0.1"))
            .unwrap();

        assert_eq!(event.ask_price().to_string(), "0.10000000000000001");
        assert_eq!(event.bid_price(), dec("0.1"));
        assert_eq!(event.timestamp(), 1_690_000_000_123);
        assert_eq!(event.instrument().symbol, "BTC-USDT");
        assert_eq!(event.instrument().exchange, EXCHANGE);
    }

    #[test]
    fn ticker_symbol_from_single_topic() {
        let frame = r#"{"type":"message","topic":"/market/ticker:ETH-BTC","subject":"trade.ticker","data":{"bestAsk":"1","bestBid":"0.9","time":1}}"#;
        let event = FrameDecoder::default().decode_ticker(frame).unwrap();
        assert_eq!(event.instrument().symbol, "ETH-BTC");
        assert_eq!(event.instrument().quote_currency, "BTC");
    }

    #[test]
    fn ticker_with_bad_price_is_rejected() {
        let result = FrameDecoder::default().decode_ticker(&ticker_frame("abc", "1"));
        assert!(matches!(
            result,
            Err(DecodeError::InvalidDecimal { field: "bestAsk", .. })
        ));
    }

    #[test]
    fn ticker_with_missing_field_is_malformed() {
        let frame = r#"{"type":"message","topic":"/market/ticker:all","subject":"BTC-USDT","data":{"bestAsk":"1","time":1}}"#;
        let result = FrameDecoder::default().decode_ticker(frame);
        assert!(matches!(result, Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn kline_positional_fields() {
        let frame = candle_frame("/market/candles:BTC-USDT_1min", &SAMPLE);
        let event = FrameDecoder::default()
            .decode_kline(&frame, CandleInterval::OneMinute)
            .unwrap();
        let candle = event.candle();

        assert_eq!(event.start_time(), 1_690_000_000);
        assert_eq!(event.end_time(), 1_690_000_060);
        assert_eq!(candle.open, dec("100.5"));
        assert_eq!(candle.close, dec("101.2"));
        assert_eq!(candle.high, dec("102.0"));
        assert_eq!(candle.low, dec("99.8"));
        assert_eq!(candle.volume_base, dec("500"));
        assert_eq!(candle.volume_quote, dec("50250"));
    }

    #[test]
    fn kline_with_short_array_is_rejected() {
        let frame = candle_frame("/market/candles:BTC-USDT_1min", &SAMPLE[..5]);
        let result = FrameDecoder::default().decode_kline(&frame, CandleInterval::OneMinute);
        assert!(matches!(
            result,
            Err(DecodeError::MissingCandleFields {
                expected: 7,
                actual: 5
            })
        ));
    }

    #[test]
    fn kline_with_bad_volume_is_rejected() {
        let mut fields = SAMPLE;
        fields[5] = "";
        let frame = candle_frame("/market/candles:BTC-USDT_1min", &fields);
        let result = FrameDecoder::default().decode_kline(&frame, CandleInterval::OneMinute);
        assert!(matches!(result, Err(DecodeError::InvalidDecimal { .. })));
    }

    #[test]
    fn kline_start_near_i64_max_is_rejected() {
        let mut fields = SAMPLE;
        fields[0] = "9223372036854775807";
        let frame = candle_frame("/market/candles:BTC-USDT_1hour", &fields);
        let result = FrameDecoder::default().decode_kline(&frame, CandleInterval::OneHour);
        assert!(matches!(
            result,
            Err(DecodeError::InvalidStartTime(ref value)) if value == "9223372036854775807"
        ));
    }

    #[test]
    fn decode_takes_interval_from_topic() {
        let frame = candle_frame("/market/candles:BTC-USDT_1hour", &SAMPLE);
        let event = FrameDecoder::default()
            .decode(FrameKind::Kline, &frame)
            .unwrap()
            .unwrap();

        let MarketEvent::Kline(kline) = event else {
            panic!("expected kline");
        };
        assert_eq!(kline.interval_seconds(), 3600);
        assert_eq!(kline.end_time(), 1_690_003_600);
    }

    #[test]
    fn decode_rejects_topic_without_interval() {
        let frame = candle_frame("/market/candles:BTC-USDT", &SAMPLE);
        let result = FrameDecoder::default().decode(FrameKind::Kline, &frame);
        assert!(matches!(result, Err(DecodeError::UnknownInterval(_))));
    }

    #[test]
    fn decode_unclassified_yields_nothing() {
        let result = FrameDecoder::default().decode(FrameKind::Unclassified, "{}");
        assert!(result.unwrap().is_none());
    }

    #[test]
    fn catalog_supplies_currencies() {
        let mut catalog = InstrumentCatalog::default();
        catalog.insert(Instrument::new(EXCHANGE, "BTC-USDT", "XBT", "USDT"));
        let decoder = FrameDecoder::new(catalog);

        let event = decoder.decode_ticker(&ticker_frame("1", "1")).unwrap();
        assert_eq!(event.instrument().base_currency, "XBT");
    }

    proptest! {
        #[test]
        fn ticker_decimals_survive_exactly(
            ask_int in 0u64..1_000_000_000,
            ask_frac in 0u64..100_000_000,
            bid_int in 0u64..1_000_000_000,
            bid_frac in 0u64..100_000_000,
        ) {
            let ask = format!("{ask_int}.{ask_frac:08}");
            let bid = format!("{bid_int}.{bid_frac:08}");
            let event = FrameDecoder::default()
                .decode_ticker(&ticker_frame(&ask, &bid))
                .unwrap();

            prop_assert_eq!(event.ask_price(), Decimal::from_str(&ask).unwrap());
            prop_assert_eq!(event.bid_price().to_string(), bid);
        }
    }
}
