// =============================================================================
// TradeEngine — bounded recent-trade ring per (venue, symbol), rolling metrics
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::bus::{channels, BusEvent, PublishBus};
use crate::cache::Cache;
use crate::model::{Side, Trade, Venue};

const RING_CAPACITY: usize = 1000;
/// Retention multiplier applied to the widest rolling window (spec §4.3).
const RETENTION_MULTIPLIER: i64 = 2;

/// Rolling-metrics windows the engine reports over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
    M1,
    M5,
    M15,
    H1,
    H4,
    D1,
}

impl Window {
    pub const ALL: [Window; 6] = [Window::M1, Window::M5, Window::M15, Window::H1, Window::H4, Window::D1];

    pub fn millis(&self) -> i64 {
        match self {
            Window::M1 => 60_000,
            Window::M5 => 5 * 60_000,
            Window::M15 => 15 * 60_000,
            Window::H1 => 60 * 60_000,
            Window::H4 => 4 * 60 * 60_000,
            Window::D1 => 24 * 60 * 60_000,
        }
    }
}

/// Optional filter applied to a recent-trades read.
#[derive(Debug, Clone, Default)]
pub struct TradeFilter {
    pub side: Option<Side>,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    pub min_size: Option<f64>,
    pub max_size: Option<f64>,
    pub since_ts: Option<i64>,
}

impl TradeFilter {
    fn matches(&self, trade: &Trade) -> bool {
        if let Some(side) = self.side {
            if trade.side != side {
                return false;
            }
        }
        let price = trade.price_f64();
        if let Some(min) = self.min_price {
            if price < min {
                return false;
            }
        }
        if let Some(max) = self.max_price {
            if price > max {
                return false;
            }
        }
        let size = trade.size_f64();
        if let Some(min) = self.min_size {
            if size < min {
                return false;
            }
        }
        if let Some(max) = self.max_size {
            if size > max {
                return false;
            }
        }
        if let Some(since) = self.since_ts {
            if trade.ts < since {
                return false;
            }
        }
        true
    }
}

/// Rolling metrics over one window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowMetrics {
    pub last_price: f64,
    pub change: f64,
    pub change_percent: f64,
    pub volume: f64,
    pub quote_volume: f64,
    pub high: f64,
    pub low: f64,
    pub count: u64,
}

pub struct TradeEngine {
    rings: RwLock<HashMap<(Venue, String), VecDeque<Trade>>>,
    bus: Arc<PublishBus>,
    cache: Arc<dyn Cache>,
    /// `recent_trades:<venue>:<symbol>` cache TTL (config `cache_ttl.recent_trades_ttl_s`).
    ttl_recent_trades: StdDuration,
}

impl TradeEngine {
    pub fn new(bus: Arc<PublishBus>, cache: Arc<dyn Cache>, ttl_recent_trades: StdDuration) -> Self {
        Self {
            rings: RwLock::new(HashMap::new()),
            bus,
            cache,
            ttl_recent_trades,
        }
    }

    /// Ingest a batch of normalized trades for one (venue, symbol). Newest
    /// trades are pushed to the front; the ring is capped at 1000 entries.
    pub fn record_trades(&self, trades: Vec<Trade>) {
        if trades.is_empty() {
            return;
        }
        let venue = trades[0].venue;
        let symbol = trades[0].symbol.clone();
        let key = (venue, symbol.clone());

        {
            let mut rings = self.rings.write();
            let ring = rings.entry(key).or_insert_with(VecDeque::new);
            for trade in trades.iter().rev() {
                ring.push_front(trade.clone());
            }
            while ring.len() > RING_CAPACITY {
                ring.pop_back();
            }
        }

        self.cache_recent(venue, &symbol);
        self.bus.publish(&channels::trades(venue, &symbol), BusEvent::Trades(trades));
    }

    fn cache_recent(&self, venue: Venue, symbol: &str) {
        let rings = self.rings.read();
        if let Some(ring) = rings.get(&(venue, symbol.to_string())) {
            let snapshot: Vec<&Trade> = ring.iter().collect();
            self.cache.set_with_ttl(
                &format!("recent_trades:{venue}:{symbol}"),
                serde_json::to_vec(&snapshot).unwrap_or_default(),
                self.ttl_recent_trades,
            );
        }
    }

    /// Recent trades for (venue, symbol), newest first, matching `filter`.
    pub fn recent_trades(&self, venue: Venue, symbol: &str, filter: &TradeFilter) -> Vec<Trade> {
        self.rings
            .read()
            .get(&(venue, symbol.to_string()))
            .map(|ring| ring.iter().filter(|t| filter.matches(t)).cloned().collect())
            .unwrap_or_default()
    }

    /// Rolling metrics for (venue, symbol) over `window`, as of the newest
    /// trade's timestamp. `None` when there is no trade history at all.
    pub fn metrics(&self, venue: Venue, symbol: &str, window: Window) -> Option<WindowMetrics> {
        let rings = self.rings.read();
        let ring = rings.get(&(venue, symbol.to_string()))?;
        let newest = ring.front()?;
        let last_price = newest.price_f64();
        let cutoff = newest.ts - window.millis();

        let mut volume = 0.0;
        let mut quote_volume = 0.0;
        let mut high = f64::MIN;
        let mut low = f64::MAX;
        let mut count = 0u64;
        let mut oldest_in_window = last_price;

        for trade in ring.iter() {
            if trade.ts < cutoff {
                break;
            }
            let price = trade.price_f64();
            let size = trade.size_f64();
            volume += size;
            quote_volume += price * size;
            high = high.max(price);
            low = low.min(price);
            count += 1;
            oldest_in_window = price;
        }

        if count == 0 {
            return None;
        }

        let change = last_price - oldest_in_window;
        let change_percent = if oldest_in_window != 0.0 { change / oldest_in_window * 100.0 } else { 0.0 };

        Some(WindowMetrics {
            last_price,
            change,
            change_percent,
            volume,
            quote_volume,
            high,
            low,
            count,
        })
    }

    /// Periodically drop trades older than the retention window (default:
    /// the widest rolling window times a multiplier).
    pub async fn run_retention_sweep(self: Arc<Self>, mut stop: broadcast::Receiver<()>) {
        let retention_ms = Window::D1.millis() * RETENTION_MULTIPLIER;
        let mut interval = tokio::time::interval(StdDuration::from_secs(60));
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let mut rings = self.rings.write();
                    for ring in rings.values_mut() {
                        let Some(newest_ts) = ring.front().map(|t| t.ts) else { continue };
                        let cutoff = newest_ts - retention_ms;
                        while ring.back().map(|t| t.ts < cutoff).unwrap_or(false) {
                            ring.pop_back();
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

    fn engine() -> TradeEngine {
        TradeEngine::new(Arc::new(PublishBus::new()), Arc::new(InMemoryCache::new()), StdDuration::from_secs(300))
    }

    fn trade(id: &str, price: &str, size: &str, side: Side, ts: i64) -> Trade {
        Trade { id: id.into(), venue: Venue::Hyperliquid, symbol: "BTC".into(), price: price.into(), size: size.into(), side, ts }
    }

    #[test]
    fn ring_caps_at_1000_newest_first() {
        let eng = engine();
        for i in 0..1200 {
            eng.record_trades(vec![trade(&i.to_string(), "100", "1", Side::Buy, i)]);
        }
        let all = eng.recent_trades(Venue::Hyperliquid, "BTC", &TradeFilter::default());
        assert_eq!(all.len(), 1000);
        assert_eq!(all[0].id, "1199");
    }

    #[test]
    fn filter_by_side_and_price_range() {
        let eng = engine();
        eng.record_trades(vec![
            trade("1", "100", "1", Side::Buy, 0),
            trade("2", "105", "2", Side::Sell, 1),
        ]);
        let filter = TradeFilter { side: Some(Side::Sell), ..Default::default() };
        let filtered = eng.recent_trades(Venue::Hyperliquid, "BTC", &filter);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].id, "2");
    }

    #[test]
    fn metrics_over_window_compute_change_and_volume() {
        let eng = engine();
        eng.record_trades(vec![trade("1", "100", "1", Side::Buy, 0)]);
        eng.record_trades(vec![trade("2", "110", "2", Side::Buy, 30_000)]);
        let m = eng.metrics(Venue::Hyperliquid, "BTC", Window::M1).unwrap();
        assert_eq!(m.last_price, 110.0);
        assert_eq!(m.volume, 3.0);
        assert_eq!(m.count, 2);
        assert_eq!(m.change, 10.0);
    }

    #[test]
    fn metrics_none_without_history() {
        let eng = engine();
        assert!(eng.metrics(Venue::Hyperliquid, "BTC", Window::M1).is_none());
    }
}
