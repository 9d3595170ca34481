//! Market Event Types
//!
//! Canonical, venue-neutral representations of the two event families the
//! relay forwards: best bid/ask ticks and OHLC candles.
//!
//! # Design
//!
//! - Prices and volumes are exact [`Decimal`] values. They are parsed from
//!   the feed's decimal strings and never pass through a float.
//! - Events are immutable once constructed. Fields are private and exposed
//!   through accessors, so a [`KlineEvent`] can never be observed with an
//!   `end_time` that disagrees with `start_time + interval_seconds`.
//! - [`MarketEvent`] is the JSON shape written to downstream clients,
//!   tagged by `"type"`.

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::topic::CandleInterval;

/// Exchange tag stamped on every instrument produced by this relay.
pub const EXCHANGE: &str = "kucoin";

// =============================================================================
// Event Kind
// =============================================================================

/// The topic kind a downstream connection can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// Best bid/ask updates.
    Ticker,
    /// OHLC candle updates.
    Kline,
}

impl EventKind {
    /// Get all event kinds.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[Self::Ticker, Self::Kline]
    }

    /// Wire name of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ticker => "ticker",
            Self::Kline => "kline",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Instrument
// =============================================================================

/// A tradable pair on a named exchange.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Instrument {
    /// Exchange tag, e.g. `kucoin`.
    pub exchange: String,
    /// Venue symbol, e.g. `BTC-USDT`.
    pub symbol: String,
    /// Base currency, e.g. `BTC`.
    pub base_currency: String,
    /// Quote currency, e.g. `USDT`.
    pub quote_currency: String,
}

impl Instrument {
    /// Create an instrument from its parts.
    #[must_use]
    pub fn new(
        exchange: impl Into<String>,
        symbol: impl Into<String>,
        base_currency: impl Into<String>,
        quote_currency: impl Into<String>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            symbol: symbol.into(),
            base_currency: base_currency.into(),
            quote_currency: quote_currency.into(),
        }
    }

    /// Derive an instrument from a `BASE-QUOTE` symbol.
    ///
    /// Symbols without a dash keep the whole symbol as base and an empty quote.
    #[must_use]
    pub fn from_symbol(exchange: &str, symbol: &str) -> Self {
        let (base, quote) = symbol.split_once('-').unwrap_or((symbol, ""));
        Self::new(exchange, symbol, base, quote)
    }
}

// =============================================================================
// Instrument Catalog
// =============================================================================

/// Symbol → instrument lookup built from the venue's symbol listing.
#[derive(Debug, Clone)]
pub struct InstrumentCatalog {
    exchange: String,
    instruments: HashMap<String, Instrument>,
}

impl InstrumentCatalog {
    /// Create an empty catalog for an exchange.
    #[must_use]
    pub fn new(exchange: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            instruments: HashMap::new(),
        }
    }

    /// Add or replace an instrument.
    pub fn insert(&mut self, instrument: Instrument) {
        self.instruments
            .insert(instrument.symbol.clone(), instrument);
    }

    /// Resolve a symbol, falling back to splitting `BASE-QUOTE` when the
    /// symbol was not listed.
    #[must_use]
    pub fn resolve(&self, symbol: &str) -> Instrument {
        self.instruments
            .get(symbol)
            .cloned()
            .unwrap_or_else(|| Instrument::from_symbol(&self.exchange, symbol))
    }

    /// Listed symbols, sorted.
    #[must_use]
    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<_> = self.instruments.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    /// Exchange tag.
    #[must_use]
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Number of listed instruments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.instruments.len()
    }

    /// Whether nothing is listed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instruments.is_empty()
    }
}

impl Default for InstrumentCatalog {
    fn default() -> Self {
        Self::new(EXCHANGE)
    }
}

// =============================================================================
// Ticker
// =============================================================================

/// Best bid/ask snapshot for one instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickerEvent {
    instrument: Instrument,
    ask_price: Decimal,
    bid_price: Decimal,
    /// Milliseconds since the Unix epoch, as reported by the venue.
    timestamp: i64,
}

impl TickerEvent {
    /// Create a ticker event.
    #[must_use]
    pub const fn new(
        instrument: Instrument,
        ask_price: Decimal,
        bid_price: Decimal,
        timestamp: i64,
    ) -> Self {
        Self {
            instrument,
            ask_price,
            bid_price,
            timestamp,
        }
    }

    /// Instrument the tick belongs to.
    #[must_use]
    pub const fn instrument(&self) -> &Instrument {
        &self.instrument
    }

    /// Best ask.
    #[must_use]
    pub const fn ask_price(&self) -> Decimal {
        self.ask_price
    }

    /// Best bid.
    #[must_use]
    pub const fn bid_price(&self) -> Decimal {
        self.bid_price
    }

    /// Venue timestamp in milliseconds.
    #[must_use]
    pub const fn timestamp(&self) -> i64 {
        self.timestamp
    }
}

// =============================================================================
// Kline
// =============================================================================

/// Price and volume values of one candle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candle {
    /// Opening price.
    pub open: Decimal,
    /// Highest price.
    pub high: Decimal,
    /// Lowest price.
    pub low: Decimal,
    /// Closing (or latest) price.
    pub close: Decimal,
    /// Volume in base currency.
    pub volume_base: Decimal,
    /// Volume in quote currency.
    pub volume_quote: Decimal,
}

/// OHLC candle for one instrument and interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "KlineRecord")]
pub struct KlineEvent {
    instrument: Instrument,
    interval_seconds: i64,
    start_time: i64,
    end_time: i64,
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
    volume_base: Decimal,
    volume_quote: Decimal,
}

impl KlineEvent {
    /// Create a candle event; `end_time` is derived from the interval.
    ///
    /// Returns `None` when `start_time + interval` does not fit in an `i64`.
    #[must_use]
    pub fn new(
        instrument: Instrument,
        interval: CandleInterval,
        start_time: i64,
        candle: Candle,
    ) -> Option<Self> {
        let interval_seconds = interval.seconds();
        let end_time = start_time.checked_add(interval_seconds)?;
        Some(Self {
            instrument,
            interval_seconds,
            start_time,
            end_time,
            open: candle.open,
            high: candle.high,
            low: candle.low,
            close: candle.close,
            volume_base: candle.volume_base,
            volume_quote: candle.volume_quote,
        })
    }

    /// Instrument the candle belongs to.
    #[must_use]
    pub const fn instrument(&self) -> &Instrument {
        &self.instrument
    }

    /// Candle width in seconds.
    #[must_use]
    pub const fn interval_seconds(&self) -> i64 {
        self.interval_seconds
    }

    /// Candle start, Unix seconds.
    #[must_use]
    pub const fn start_time(&self) -> i64 {
        self.start_time
    }

    /// Candle end, Unix seconds.
    #[must_use]
    pub const fn end_time(&self) -> i64 {
        self.end_time
    }

    /// Price and volume values.
    #[must_use]
    pub const fn candle(&self) -> Candle {
        Candle {
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume_base: self.volume_base,
            volume_quote: self.volume_quote,
        }
    }
}

/// Unchecked serde mirror of [`KlineEvent`].
#[derive(Deserialize)]
struct KlineRecord {
    instrument: Instrument,
    interval_seconds: i64,
    start_time: i64,
    end_time: i64,
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
    volume_base: Decimal,
    volume_quote: Decimal,
}

impl TryFrom<KlineRecord> for KlineEvent {
    type Error = String;

    fn try_from(record: KlineRecord) -> Result<Self, Self::Error> {
        if record.interval_seconds <= 0 {
            return Err(format!(
                "interval_seconds must be positive, got {}",
                record.interval_seconds
            ));
        }
        if record.start_time.checked_add(record.interval_seconds) != Some(record.end_time) {
            return Err(format!(
                "end_time {} does not equal start_time {} + interval_seconds {}",
                record.end_time, record.start_time, record.interval_seconds
            ));
        }
        Ok(Self {
            instrument: record.instrument,
            interval_seconds: record.interval_seconds,
            start_time: record.start_time,
            end_time: record.end_time,
            open: record.open,
            high: record.high,
            low: record.low,
            close: record.close,
            volume_base: record.volume_base,
            volume_quote: record.volume_quote,
        })
    }
}

// =============================================================================
// Market Event
// =============================================================================

/// A decoded event, as delivered to downstream clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MarketEvent {
    /// Best bid/ask update.
    Ticker(TickerEvent),
    /// Candle update.
    Kline(KlineEvent),
}

impl MarketEvent {
    /// Kind used for fan-out routing.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::Ticker(_) => EventKind::Ticker,
            Self::Kline(_) => EventKind::Kline,
        }
    }

    /// Instrument the event belongs to.
    #[must_use]
    pub const fn instrument(&self) -> &Instrument {
        match self {
            Self::Ticker(t) => t.instrument(),
            Self::Kline(k) => k.instrument(),
        }
    }
}

impl From<TickerEvent> for MarketEvent {
    fn from(event: TickerEvent) -> Self {
        Self::Ticker(event)
    }
}

impl From<KlineEvent> for MarketEvent {
    fn from(event: KlineEvent) -> Self {
        Self::Kline(event)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn sample_kline() -> KlineEvent {
        KlineEvent::new(
            Instrument::from_symbol(EXCHANGE, "BTC-USDT"),
            CandleInterval::OneMinute,
            1_690_000_000,
            Candle {
                open: dec("100.5"),
                high: dec("102.0"),
                low: dec("99.8"),
                close: dec("101.2"),
                volume_base: dec("500"),
                volume_quote: dec("50250"),
            },
        )
        .unwrap()
    }

    #[test]
    fn instrument_from_symbol_splits_on_dash() {
        let instrument = Instrument::from_symbol(EXCHANGE, "ETH-BTC");
        assert_eq!(instrument.base_currency, "ETH");
        assert_eq!(instrument.quote_currency, "BTC");
        assert_eq!(instrument.exchange, "kucoin");
    }

    #[test]
    fn instrument_from_symbol_without_dash() {
        let instrument = Instrument::from_symbol(EXCHANGE, "WEIRD");
        assert_eq!(instrument.base_currency, "WEIRD");
        assert_eq!(instrument.quote_currency, "");
    }

    #[test]
    fn catalog_prefers_listed_currencies() {
        let mut catalog = InstrumentCatalog::default();
        catalog.insert(Instrument::new(EXCHANGE, "USDT-TRY", "USDT", "TRY"));

        assert_eq!(catalog.resolve("USDT-TRY").quote_currency, "TRY");
        assert_eq!(catalog.resolve("SOL-USDC").base_currency, "SOL");
        assert_eq!(catalog.len(), 1);
    }

    #[test]
    fn kline_end_time_follows_interval() {
        let kline = sample_kline();
        assert_eq!(kline.interval_seconds(), 60);
        assert_eq!(kline.end_time(), 1_690_000_060);
    }

    #[test]
    fn kline_end_time_overflow_yields_none() {
        let candle = sample_kline().candle();
        let instrument = Instrument::from_symbol(EXCHANGE, "BTC-USDT");
        let late = i64::MAX - 1;
        assert!(KlineEvent::new(instrument.clone(), CandleInterval::OneWeek, late, candle).is_none());

        let last = KlineEvent::new(instrument, CandleInterval::OneMinute, i64::MAX - 60, candle);
        assert_eq!(last.map(|k| k.end_time()), Some(i64::MAX));
    }

    #[test]
    fn market_event_json_round_trip() {
        let ticker: MarketEvent = TickerEvent::new(
            Instrument::from_symbol(EXCHANGE, "BTC-USDT"),
            dec("29000.10"),
            dec("28999.95"),
            1_690_000_000_123,
        )
        .into();
        let kline: MarketEvent = sample_kline().into();

        for event in [ticker, kline] {
            let json = serde_json::to_string(&event).unwrap();
            let back: MarketEvent = serde_json::from_str(&json).unwrap();
            assert_eq!(back, event);
        }
    }

    #[test]
    fn ticker_json_shape() {
        let event: MarketEvent = TickerEvent::new(
            Instrument::from_symbol(EXCHANGE, "BTC-USDT"),
            dec("1.20"),
            dec("1.10"),
            7,
        )
        .into();

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "ticker");
        assert_eq!(value["ask_price"], "1.20");
        assert_eq!(value["instrument"]["symbol"], "BTC-USDT");
        assert_eq!(value["timestamp"], 7);
    }

    #[test]
    fn kline_with_inconsistent_end_time_is_rejected() {
        let mut value = serde_json::to_value(MarketEvent::from(sample_kline())).unwrap();
        value["end_time"] = serde_json::json!(1_690_003_600);

        let result = serde_json::from_value::<MarketEvent>(value);
        assert!(result.is_err());
    }

    #[test]
    fn event_kind_routing() {
        assert_eq!(MarketEvent::from(sample_kline()).kind(), EventKind::Kline);
        assert_eq!(EventKind::all().len(), 2);
        assert_eq!(EventKind::Ticker.to_string(), "ticker");
    }
}
