// =============================================================================
// ChartEngine — folds ticks into OHLCV candles across seven timeframes
// =============================================================================
//
// Real trades and synthetic order-book midpoint ticks share one fold path;
// they differ only in whether trade_count increments (spec §4.4, §8 S6).
// Volume/quoteVolume naturally stay put for synthetic ticks because their
// size is "0" — no separate branch is needed for those fields.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::{error, warn};

use crate::bus::{channels, BusEvent, CandleUpdateKind, PublishBus};
use crate::cache::Cache;
use crate::coldstore::ColdStore;
use crate::model::{Candle, TickData, Timeframe, Venue};

/// Cap on repeated cold-store write failures before a batch is dropped
/// rather than retried forever (spec §4.4 "bounded-retry, not infinite").
const MAX_BATCH_RETRIES: u32 = 5;

#[derive(Debug, Clone)]
struct CandleBuilder {
    venue: Venue,
    symbol: String,
    timeframe: Timeframe,
    timestamp: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    quote_volume: f64,
    trade_count: u64,
    vwap: f64,
}

impl CandleBuilder {
    fn new(venue: Venue, symbol: String, timeframe: Timeframe, bucket: i64, tick: &TickData) -> Self {
        let price = tick.price_f64();
        let size = tick.size_f64();
        Self {
            venue,
            symbol,
            timeframe,
            timestamp: bucket,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: size,
            quote_volume: price * size,
            trade_count: if tick.is_synthetic() { 0 } else { 1 },
            vwap: price,
        }
    }

    fn fold(&mut self, tick: &TickData) {
        let price = tick.price_f64();
        let size = tick.size_f64();
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
        self.volume += size;
        self.quote_volume += price * size;
        if !tick.is_synthetic() {
            self.trade_count += 1;
        }
        if self.volume > 0.0 {
            self.vwap = self.quote_volume / self.volume;
        }
    }

    fn to_candle(&self) -> Candle {
        let price_change = self.close - self.open;
        let price_change_percent = if self.open != 0.0 { price_change / self.open * 100.0 } else { 0.0 };
        Candle {
            venue: self.venue,
            symbol: self.symbol.clone(),
            timeframe: self.timeframe,
            timestamp: self.timestamp,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            quote_volume: self.quote_volume,
            trade_count: self.trade_count,
            vwap: self.vwap,
            price_change,
            price_change_percent,
        }
    }
}

pub struct ChartEngine {
    builders: RwLock<HashMap<(Venue, String, Timeframe), CandleBuilder>>,
    batch: Mutex<VecDeque<Candle>>,
    bus: Arc<PublishBus>,
    cache: Arc<dyn Cache>,
    cold_store: Arc<dyn ColdStore>,
    /// `candles:<venue>:<symbol>:<timeframe>` cache TTL (config `cache_ttl.candles_ttl_s`).
    ttl_candles: Duration,
    /// Batch buffer cap before oldest candles are dropped (config `candle_batch_size`).
    batch_capacity: usize,
    /// Cold-store drain cadence (config `candle_batch_interval_ms`).
    batch_drain_interval: Duration,
}

impl ChartEngine {
    pub fn new(
        bus: Arc<PublishBus>,
        cache: Arc<dyn Cache>,
        cold_store: Arc<dyn ColdStore>,
        ttl_candles: Duration,
        batch_capacity: usize,
        batch_drain_interval: Duration,
    ) -> Self {
        Self {
            builders: RwLock::new(HashMap::new()),
            batch: Mutex::new(VecDeque::new()),
            bus,
            cache,
            cold_store,
            ttl_candles,
            batch_capacity,
            batch_drain_interval,
        }
    }

    /// Fold one tick into every timeframe's builder for (venue, symbol).
    pub fn process_tick_data(&self, tick: TickData) {
        for timeframe in Timeframe::ALL {
            let bucket = timeframe.bucket_start(tick.ts);
            let key = (tick.venue, tick.symbol.clone(), timeframe);

            let (completed, updated) = {
                let mut builders = self.builders.write();
                match builders.get(&key).map(|b| b.timestamp) {
                    Some(existing_bucket) if existing_bucket == bucket => {
                        let builder = builders.get_mut(&key).expect("checked above");
                        builder.fold(&tick);
                        (None, builder.to_candle())
                    }
                    Some(_) => {
                        let old = builders.remove(&key).expect("checked above");
                        let completed = old.to_candle();
                        let new_builder = CandleBuilder::new(tick.venue, tick.symbol.clone(), timeframe, bucket, &tick);
                        let updated = new_builder.to_candle();
                        builders.insert(key, new_builder);
                        (Some(completed), updated)
                    }
                    None => {
                        let new_builder = CandleBuilder::new(tick.venue, tick.symbol.clone(), timeframe, bucket, &tick);
                        let updated = new_builder.to_candle();
                        builders.insert(key, new_builder);
                        (None, updated)
                    }
                }
            };

            if let Some(completed) = completed {
                self.emit(completed.clone(), CandleUpdateKind::New);
                self.enqueue_batch(completed);
            }
            self.emit(updated, CandleUpdateKind::Update);
        }
    }

    fn emit(&self, candle: Candle, update_kind: CandleUpdateKind) {
        self.cache.set_with_ttl(
            &format!("candles:{}:{}:{}", candle.venue, candle.symbol, candle.timeframe),
            serde_json::to_vec(&candle).unwrap_or_default(),
            self.ttl_candles,
        );
        self.bus.publish(
            &channels::candles(candle.venue, &candle.symbol, candle.timeframe),
            BusEvent::Candle { candle, update_kind },
        );
    }

    fn enqueue_batch(&self, candle: Candle) {
        let mut batch = self.batch.lock();
        batch.push_back(candle);
        while batch.len() > self.batch_capacity {
            batch.pop_front();
        }
    }

    /// Flush every in-flight builder as a completed candle. Used on
    /// shutdown so no partial bucket is silently lost.
    pub fn force_complete_all_candles(&self) {
        let builders = std::mem::take(&mut *self.builders.write());
        for (_, builder) in builders {
            let completed = builder.to_candle();
            self.emit(completed.clone(), CandleUpdateKind::New);
            self.enqueue_batch(completed);
        }
    }

    /// Drain the batch buffer to the cold store every 10 s. On failure the
    /// batch is re-queued at the head, up to `MAX_BATCH_RETRIES` consecutive
    /// attempts, after which it is dropped and logged.
    pub async fn run_batch_drain(self: Arc<Self>, mut stop: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.batch_drain_interval);
        interval.tick().await;
        let mut consecutive_failures: u32 = 0;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let pending: Vec<Candle> = {
                        let mut batch = self.batch.lock();
                        batch.drain(..).collect()
                    };
                    if pending.is_empty() {
                        continue;
                    }

                    match self.cold_store.write_candles(&pending).await {
                        Ok(()) => consecutive_failures = 0,
                        Err(e) => {
                            consecutive_failures += 1;
                            if consecutive_failures >= MAX_BATCH_RETRIES {
                                error!(error = %e, count = pending.len(), "dropping candle batch after repeated cold-store failures");
                                consecutive_failures = 0;
                            } else {
                                warn!(error = %e, attempt = consecutive_failures, "cold-store write failed, re-queueing batch");
                                let mut batch = self.batch.lock();
                                for candle in pending.into_iter().rev() {
                                    batch.push_front(candle);
                                }
                            }
                        }
                    }
                }
                _ = stop.recv() => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use crate::coldstore::NullColdStore;

    fn engine() -> ChartEngine {
        ChartEngine::new(
            Arc::new(PublishBus::new()),
            Arc::new(InMemoryCache::new()),
            Arc::new(NullColdStore),
            Duration::from_secs(3_600),
            100,
            Duration::from_secs(10),
        )
    }

    fn tick(price: &str, size: &str, ts: i64) -> TickData {
        TickData {
            venue: Venue::Hyperliquid,
            symbol: "BTC".into(),
            price: price.into(),
            size: size.into(),
            side: None,
            ts,
            trade_id: None,
        }
    }

    #[test]
    fn s1_bucket_crossing_completes_old_and_starts_new() {
        let eng = engine();
        eng.process_tick_data(tick("100", "1", 60_000));
        let mut bids = eng.builders.write();
        let before = bids.get(&(Venue::Hyperliquid, "BTC".into(), Timeframe::M1)).unwrap().clone();
        drop(bids);
        assert_eq!(before.open, 100.0);
        assert_eq!(before.volume, 1.0);

        eng.process_tick_data(tick("110", "2", 120_000));
        let builders = eng.builders.read();
        let after = builders.get(&(Venue::Hyperliquid, "BTC".into(), Timeframe::M1)).unwrap();
        assert_eq!(after.timestamp, 120_000);
        assert_eq!(after.open, 110.0);
        assert_eq!(after.volume, 2.0);
    }

    #[test]
    fn s6_synthetic_midpoint_tick_does_not_move_volume_or_trade_count() {
        let eng = engine();
        let mut synthetic = tick("101", "0", 60_000);
        synthetic.side = None;
        eng.process_tick_data(synthetic);

        let builders = eng.builders.read();
        let b = builders.get(&(Venue::Hyperliquid, "BTC".into(), Timeframe::M1)).unwrap();
        assert_eq!(b.open, 101.0);
        assert_eq!(b.volume, 0.0);
        assert_eq!(b.trade_count, 0);
    }

    #[test]
    fn real_trade_after_synthetic_tick_increments_trade_count_only_once() {
        let eng = engine();
        eng.process_tick_data(tick("101", "0", 60_000));
        eng.process_tick_data(tick("102", "1", 60_500));

        let builders = eng.builders.read();
        let b = builders.get(&(Venue::Hyperliquid, "BTC".into(), Timeframe::M1)).unwrap();
        assert_eq!(b.trade_count, 1);
        assert_eq!(b.volume, 1.0);
        assert_eq!(b.close, 102.0);
    }

    #[test]
    fn force_complete_flushes_all_builders() {
        let eng = engine();
        eng.process_tick_data(tick("100", "1", 60_000));
        eng.force_complete_all_candles();
        assert!(eng.builders.read().is_empty());
        assert_eq!(eng.batch.lock().len(), Timeframe::ALL.len());
    }
}
