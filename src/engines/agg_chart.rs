// =============================================================================
// AggregatedChartEngine — merges per-venue candles into one per symbol/tf
// =============================================================================
//
// Mirrors ChartEngine's builder/complete lifecycle one level up: each venue
// contributes to a shared bucket; once every contributing venue has
// completed that bucket, the consolidated candle is finalized and the
// bucket state is dropped.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::bus::{channels, BusEvent, CandleUpdateKind, PublishBus};
use crate::cache::Cache;
use crate::model::{AggregatedCandle, Candle, Timeframe, Venue};

#[derive(Debug, Clone)]
struct VenueContribution {
    candle: Candle,
    completed: bool,
}

struct Bucket {
    timestamp: i64,
    per_venue: HashMap<Venue, VenueContribution>,
}

pub struct AggregatedChartEngine {
    buckets: RwLock<HashMap<(String, Timeframe), Bucket>>,
    bus: Arc<PublishBus>,
    cache: Arc<dyn Cache>,
    /// `agg.candles:<symbol>:<timeframe>` cache TTL (config `cache_ttl.candles_ttl_s`).
    ttl_candles: Duration,
}

impl AggregatedChartEngine {
    pub fn new(bus: Arc<PublishBus>, cache: Arc<dyn Cache>, ttl_candles: Duration) -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            bus,
            cache,
            ttl_candles,
        }
    }

    /// Absorb one venue's candle update (or completion) and re-derive the
    /// consolidated candle for its (symbol, timeframe) bucket.
    pub fn process_candle_update(&self, candle: Candle, update_kind: CandleUpdateKind) {
        let key = (candle.symbol.clone(), candle.timeframe);
        let venue = candle.venue;

        let (consolidated, all_completed) = {
            let mut buckets = self.buckets.write();
            let bucket = buckets.entry(key.clone()).or_insert_with(|| Bucket {
                timestamp: candle.timestamp,
                per_venue: HashMap::new(),
            });

            // A later bucket for this (symbol, timeframe) superseded the
            // one we were tracking — start fresh rather than merging two
            // different time buckets together.
            if bucket.timestamp != candle.timestamp && update_kind == CandleUpdateKind::Update {
                bucket.timestamp = candle.timestamp;
                bucket.per_venue.clear();
            }

            bucket.per_venue.insert(
                venue,
                VenueContribution {
                    candle: candle.clone(),
                    completed: matches!(update_kind, CandleUpdateKind::New),
                },
            );

            let consolidated = consolidate(&key.0, key.1, bucket);
            let all_completed = !bucket.per_venue.is_empty() && bucket.per_venue.values().all(|c| c.completed);
            (consolidated, all_completed)
        };

        let emit_kind = if all_completed { CandleUpdateKind::New } else { CandleUpdateKind::Update };
        self.emit(&consolidated, emit_kind);

        if all_completed {
            self.buckets.write().remove(&key);
        }
    }

    fn emit(&self, candle: &AggregatedCandle, update_kind: CandleUpdateKind) {
        self.cache.set_with_ttl(
            &format!("agg.candles:{}:{}", candle.symbol, candle.timeframe),
            serde_json::to_vec(candle).unwrap_or_default(),
            self.ttl_candles,
        );
        self.bus.publish(
            &channels::agg_candles(&candle.symbol, candle.timeframe),
            BusEvent::AggregatedCandle { candle: candle.clone(), update_kind },
        );
    }
}

/// Derive the consolidated candle from a bucket's current per-venue
/// contributions. Open comes from the earliest contributing venue in
/// H, A, L, V order; high/low/volume/quoteVolume/tradeCount are
/// aggregated across every contributor; close is whichever venue last
/// updated (tracked implicitly — the map always reflects the latest
/// candle seen per venue).
fn consolidate(symbol: &str, timeframe: Timeframe, bucket: &Bucket) -> AggregatedCandle {
    let open = Venue::ALL
        .iter()
        .find_map(|v| bucket.per_venue.get(v))
        .map(|c| c.candle.open)
        .unwrap_or(0.0);

    let mut high = f64::MIN;
    let mut low = f64::MAX;
    let mut volume = 0.0;
    let mut quote_volume = 0.0;
    let mut trade_count = 0u64;
    let mut close = open;
    let mut latest_ts = i64::MIN;
    let mut contributing_venues: Vec<Venue> = Vec::new();

    for venue in Venue::ALL {
        let Some(contribution) = bucket.per_venue.get(&venue) else { continue };
        let c = &contribution.candle;
        high = high.max(c.high);
        low = low.min(c.low);
        volume += c.volume;
        quote_volume += c.quote_volume;
        trade_count += c.trade_count;
        contributing_venues.push(venue);
        if c.timestamp >= latest_ts {
            latest_ts = c.timestamp;
            close = c.close;
        }
    }

    let vwap = if volume > 0.0 { quote_volume / volume } else { open };
    let price_change = close - open;
    let price_change_percent = if open != 0.0 { price_change / open * 100.0 } else { 0.0 };

    AggregatedCandle {
        symbol: symbol.to_string(),
        timeframe,
        timestamp: bucket.timestamp,
        open,
        high,
        low,
        close,
        volume,
        quote_volume,
        trade_count,
        vwap,
        price_change,
        price_change_percent,
        contributing_venues,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;

    fn engine() -> AggregatedChartEngine {
        AggregatedChartEngine::new(Arc::new(PublishBus::new()), Arc::new(InMemoryCache::new()), Duration::from_secs(3_600))
    }

    fn candle(venue: Venue, open: f64, close: f64, volume: f64, ts: i64) -> Candle {
        Candle {
            venue,
            symbol: "BTC".into(),
            timeframe: Timeframe::M1,
            timestamp: ts,
            open,
            high: open.max(close),
            low: open.min(close),
            close,
            volume,
            quote_volume: close * volume,
            trade_count: 1,
            vwap: close,
            price_change: close - open,
            price_change_percent: 0.0,
        }
    }

    #[test]
    fn merges_high_low_and_sums_volume_across_venues() {
        let eng = engine();
        eng.process_candle_update(candle(Venue::Hyperliquid, 100.0, 102.0, 1.0, 60_000), CandleUpdateKind::Update);
        eng.process_candle_update(candle(Venue::Aster, 100.0, 98.0, 2.0, 60_000), CandleUpdateKind::Update);

        let buckets = eng.buckets.read();
        let bucket = buckets.get(&("BTC".to_string(), Timeframe::M1)).unwrap();
        let consolidated = consolidate("BTC", Timeframe::M1, bucket);
        assert_eq!(consolidated.high, 102.0);
        assert_eq!(consolidated.low, 98.0);
        assert_eq!(consolidated.volume, 3.0);
    }

    #[test]
    fn bucket_persists_until_every_contributor_completes() {
        let eng = engine();
        let key = ("BTC".to_string(), Timeframe::M1);

        eng.process_candle_update(candle(Venue::Hyperliquid, 100.0, 101.0, 1.0, 60_000), CandleUpdateKind::Update);
        eng.process_candle_update(candle(Venue::Aster, 100.0, 99.0, 2.0, 60_000), CandleUpdateKind::Update);

        // Hyperliquid completes first; Aster is still in-flight, so the
        // bucket must not be dropped yet.
        eng.process_candle_update(candle(Venue::Hyperliquid, 100.0, 101.0, 1.0, 60_000), CandleUpdateKind::New);
        assert!(eng.buckets.read().contains_key(&key));

        // Aster completes too; now every contributor is done and the
        // bucket is finalized and dropped.
        eng.process_candle_update(candle(Venue::Aster, 100.0, 99.0, 2.0, 60_000), CandleUpdateKind::New);
        assert!(!eng.buckets.read().contains_key(&key));
    }
}
