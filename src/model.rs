// =============================================================================
// Normalized Event Model — shared value types for the ingestion pipeline
// =============================================================================
//
// Every venue adapter emits these types regardless of wire protocol; every
// downstream engine consumes them without knowing which venue produced them.
// Monetary values cross the wire as decimal strings (venues differ in
// precision) and are only parsed to `f64` at arithmetic sites.
// =============================================================================

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A perpetual-futures venue this aggregator speaks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Venue {
    Hyperliquid,
    Aster,
    Lighter,
    Avantis,
}

impl Venue {
    /// All venues, in the deterministic insertion order used by
    /// aggregation (§4.5): H, A, L, V.
    pub const ALL: [Venue; 4] = [Venue::Hyperliquid, Venue::Aster, Venue::Lighter, Venue::Avantis];

    pub fn code(&self) -> &'static str {
        match self {
            Venue::Hyperliquid => "H",
            Venue::Aster => "A",
            Venue::Lighter => "L",
            Venue::Avantis => "V",
        }
    }
}

impl fmt::Display for Venue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Venue::Hyperliquid => "hyperliquid",
            Venue::Aster => "aster",
            Venue::Lighter => "lighter",
            Venue::Avantis => "avantis",
        };
        write!(f, "{name}")
    }
}

impl FromStr for Venue {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hyperliquid" | "h" => Ok(Venue::Hyperliquid),
            "aster" | "a" => Ok(Venue::Aster),
            "lighter" | "l" => Ok(Venue::Lighter),
            "avantis" | "v" => Ok(Venue::Avantis),
            other => anyhow::bail!("unknown venue: {other}"),
        }
    }
}

/// Which side of the book/trade tape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

/// A single price level as carried on the wire: decimal strings, parsed to
/// `f64` lazily at arithmetic sites.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: String,
    pub size: String,
    pub ts: i64,
}

impl PriceLevel {
    pub fn price_f64(&self) -> f64 {
        self.price.parse().unwrap_or(0.0)
    }

    pub fn size_f64(&self) -> f64 {
        self.size.parse().unwrap_or(0.0)
    }

    /// `true` when this level's size string means "remove this level".
    pub fn is_removal(&self) -> bool {
        matches!(self.size.as_str(), "0" | "0.0" | "0.00")
    }
}

/// Full order-book replacement for (venue, symbol).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub venue: Venue,
    pub symbol: String,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub sequence: u64,
    pub ts: i64,
}

/// Incremental order-book update for (venue, symbol).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delta {
    pub venue: Venue,
    pub symbol: String,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub sequence: u64,
    pub ts: i64,
}

/// A single executed trade, normalized across venues.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: String,
    pub venue: Venue,
    pub symbol: String,
    pub price: String,
    pub size: String,
    pub side: Side,
    pub ts: i64,
}

impl Trade {
    pub fn price_f64(&self) -> f64 {
        self.price.parse().unwrap_or(0.0)
    }

    pub fn size_f64(&self) -> f64 {
        self.size.parse().unwrap_or(0.0)
    }
}

/// A price observation fed to the ChartEngine — either a real trade or a
/// synthetic order-book-midpoint tick (`size == "0"`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickData {
    pub venue: Venue,
    pub symbol: String,
    pub price: String,
    pub size: String,
    pub side: Option<Side>,
    pub ts: i64,
    pub trade_id: Option<String>,
}

impl TickData {
    pub fn price_f64(&self) -> f64 {
        self.price.parse().unwrap_or(0.0)
    }

    pub fn size_f64(&self) -> f64 {
        self.size.parse().unwrap_or(0.0)
    }

    /// A synthetic midpoint tick carries size "0" and must not move
    /// volume/tradeCount (§4.4, §8 S6).
    pub fn is_synthetic(&self) -> bool {
        matches!(self.size.as_str(), "0" | "0.0" | "0.00")
    }

    pub fn midpoint(venue: Venue, symbol: String, mid_price: f64, ts: i64) -> Self {
        Self {
            venue,
            symbol,
            price: format!("{mid_price}"),
            size: "0".to_string(),
            side: None,
            ts,
            trade_id: None,
        }
    }
}

/// The fixed candle timeframe set (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    S1,
    M1,
    M5,
    M15,
    H1,
    H4,
    D1,
}

impl Timeframe {
    pub const ALL: [Timeframe; 7] = [
        Timeframe::S1,
        Timeframe::M1,
        Timeframe::M5,
        Timeframe::M15,
        Timeframe::H1,
        Timeframe::H4,
        Timeframe::D1,
    ];

    /// Bucket width in milliseconds.
    pub fn millis(&self) -> i64 {
        match self {
            Timeframe::S1 => 1_000,
            Timeframe::M1 => 60_000,
            Timeframe::M5 => 5 * 60_000,
            Timeframe::M15 => 15 * 60_000,
            Timeframe::H1 => 60 * 60_000,
            Timeframe::H4 => 4 * 60 * 60_000,
            Timeframe::D1 => 24 * 60 * 60_000,
        }
    }

    /// Bucket start for a given tick timestamp (ms): `floor(ts / tf) * tf`.
    pub fn bucket_start(&self, ts: i64) -> i64 {
        let tf = self.millis();
        ts.div_euclid(tf) * tf
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::S1 => "1s",
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1s" => Ok(Timeframe::S1),
            "1m" => Ok(Timeframe::M1),
            "5m" => Ok(Timeframe::M5),
            "15m" => Ok(Timeframe::M15),
            "1h" => Ok(Timeframe::H1),
            "4h" => Ok(Timeframe::H4),
            "1d" => Ok(Timeframe::D1),
            other => anyhow::bail!("unknown timeframe: {other}"),
        }
    }
}

/// An OHLCV candle as emitted downstream (all numeric fields as strings, per
/// the wire-compatibility convention used throughout this model).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub venue: Venue,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub quote_volume: f64,
    pub trade_count: u64,
    pub vwap: f64,
    pub price_change: f64,
    pub price_change_percent: f64,
}

/// A candle consolidated across venues for one (symbol, timeframe) —
/// `Candle` without the venue dimension.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedCandle {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub quote_volume: f64,
    pub trade_count: u64,
    pub vwap: f64,
    pub price_change: f64,
    pub price_change_percent: f64,
    pub contributing_venues: Vec<Venue>,
}

/// A fully-projected order book for one (venue, symbol), ready to publish.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Orderbook {
    pub venue: Venue,
    pub symbol: String,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub total_bid_size: f64,
    pub total_ask_size: f64,
    pub spread: f64,
    pub spread_percent: f64,
    pub mid_price: f64,
    pub sequence: u64,
    pub ts: i64,
}

/// A single contributor to an aggregated price level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LevelSource {
    pub venue: Venue,
    pub size: f64,
}

/// One normalized, cross-venue price level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedLevel {
    pub price: f64,
    pub total_size: f64,
    pub sources: Vec<LevelSource>,
}

/// Smart-routing recommendation for one side of the book.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRecommendation {
    pub venue: Venue,
    pub price: f64,
    pub savings: f64,
    pub savings_percent: f64,
}

/// Both routing recommendations published alongside an aggregated book.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Routing {
    pub buy: RoutingRecommendation,
    pub sell: RoutingRecommendation,
}

/// A consolidated, cross-venue order book (§4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedBook {
    pub symbol: String,
    pub ts: i64,
    pub bids: Vec<AggregatedLevel>,
    pub asks: Vec<AggregatedLevel>,
    pub spread: f64,
    pub best_bid: Option<AggregatedLevel>,
    pub best_ask: Option<AggregatedLevel>,
    pub per_venue: Vec<Orderbook>,
    pub routing: Routing,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_start_floors_to_timeframe() {
        assert_eq!(Timeframe::M1.bucket_start(60_000), 60_000);
        assert_eq!(Timeframe::M1.bucket_start(119_999), 60_000);
        assert_eq!(Timeframe::M1.bucket_start(120_000), 120_000);
    }

    #[test]
    fn price_level_removal_detection() {
        let removal = PriceLevel { price: "100".into(), size: "0".into(), ts: 0 };
        let keep = PriceLevel { price: "100".into(), size: "0.5".into(), ts: 0 };
        assert!(removal.is_removal());
        assert!(!keep.is_removal());
    }

    #[test]
    fn venue_round_trips_through_display_and_fromstr() {
        for v in Venue::ALL {
            let parsed: Venue = v.to_string().parse().unwrap();
            assert_eq!(parsed, v);
        }
    }

    #[test]
    fn timeframe_round_trips_through_display_and_fromstr() {
        for tf in Timeframe::ALL {
            let parsed: Timeframe = tf.to_string().parse().unwrap();
            assert_eq!(parsed, tf);
        }
    }
}
