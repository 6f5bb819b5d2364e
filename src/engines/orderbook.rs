// =============================================================================
// OrderbookEngine — per-(venue, symbol) book state, projection, impact math
// =============================================================================
//
// Single-writer per key: all mutation happens behind `books`'s write lock,
// held only for the in-memory update. Publish and cache writes happen after
// the lock is dropped (spec §5 — engines only suspend on publish/cache).
// =============================================================================

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::warn;

use crate::bus::{channels, BusEvent, PublishBus};
use crate::cache::Cache;
use crate::model::{Delta, Orderbook, PriceLevel, Snapshot, Venue};

const TOP_LEVELS: usize = 1000;
/// Depth carried on the `orderbook.<venue>.<symbol>` bus channel (spec §4.6).
const BUS_DEPTH: usize = 20;

/// Total ordering over `f64` prices used as a `BTreeMap` key. Prices parsed
/// from venue wire data are always finite, so `total_cmp` is a safe total
/// order here.
#[derive(Debug, Clone, Copy, PartialEq)]
struct PriceKey(f64);

impl Eq for PriceKey {}

impl PartialOrd for PriceKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PriceKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

struct BookState {
    venue: Venue,
    symbol: String,
    bids: BTreeMap<PriceKey, PriceLevel>,
    asks: BTreeMap<PriceKey, PriceLevel>,
    sequence: u64,
    last_update: i64,
}

impl BookState {
    fn project(&self) -> Orderbook {
        let bids: Vec<PriceLevel> = self
            .bids
            .values()
            .rev()
            .take(TOP_LEVELS)
            .cloned()
            .collect();
        let asks: Vec<PriceLevel> = self
            .asks
            .values()
            .take(TOP_LEVELS)
            .cloned()
            .collect();

        let total_bid_size: f64 = self.bids.values().map(|l| l.size_f64()).sum();
        let total_ask_size: f64 = self.asks.values().map(|l| l.size_f64()).sum();

        let best_bid = bids.first().map(|l| l.price_f64());
        let best_ask = asks.first().map(|l| l.price_f64());

        let (spread, spread_percent, mid_price) = match (best_bid, best_ask) {
            (Some(b), Some(a)) => {
                let spread = a - b;
                let spread_percent = if b != 0.0 { spread / b * 100.0 } else { 0.0 };
                (spread, spread_percent, (b + a) / 2.0)
            }
            _ => (0.0, 0.0, 0.0),
        };

        Orderbook {
            venue: self.venue,
            symbol: self.symbol.clone(),
            bids,
            asks,
            total_bid_size,
            total_ask_size,
            spread,
            spread_percent,
            mid_price,
            sequence: self.sequence,
            ts: self.last_update,
        }
    }
}

/// Average fill price and signed impact for walking one side of the book.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceImpact {
    pub avg_fill_price: f64,
    pub filled_size: f64,
    pub impact_percent: f64,
}

pub struct OrderbookEngine {
    books: RwLock<HashMap<(Venue, String), BookState>>,
    bus: Arc<PublishBus>,
    cache: Arc<dyn Cache>,
    /// `orderbook:<venue>:<symbol>` cache TTL (config `cache_ttl.orderbook_ttl_s`, spec §6).
    ttl_orderbook: Duration,
    /// `orderbook_snapshot:<venue>:<symbol>` cache TTL (config `cache_ttl.orderbook_snapshot_ttl_s`).
    ttl_snapshot: Duration,
}

impl OrderbookEngine {
    pub fn new(bus: Arc<PublishBus>, cache: Arc<dyn Cache>, ttl_orderbook: Duration, ttl_snapshot: Duration) -> Self {
        Self {
            books: RwLock::new(HashMap::new()),
            bus,
            cache,
            ttl_orderbook,
            ttl_snapshot,
        }
    }

    /// Replace the book for (venue, symbol) wholesale. Returns the freshly
    /// projected book so callers (the supervisor) can forward it on to the
    /// aggregation and chart engines without re-reading the lock.
    pub fn process_snapshot(&self, snapshot: Snapshot) -> Orderbook {
        let key = (snapshot.venue, snapshot.symbol.clone());

        let mut bids = BTreeMap::new();
        for level in &snapshot.bids {
            if level.size_f64() < 0.0 {
                warn!(venue = %snapshot.venue, symbol = %snapshot.symbol, price = %level.price, size = %level.size, "negative size in snapshot level, dropped");
                continue;
            }
            if !level.is_removal() {
                bids.insert(PriceKey(level.price_f64()), level.clone());
            }
        }
        let mut asks = BTreeMap::new();
        for level in &snapshot.asks {
            if level.size_f64() < 0.0 {
                warn!(venue = %snapshot.venue, symbol = %snapshot.symbol, price = %level.price, size = %level.size, "negative size in snapshot level, dropped");
                continue;
            }
            if !level.is_removal() {
                asks.insert(PriceKey(level.price_f64()), level.clone());
            }
        }

        let state = BookState {
            venue: snapshot.venue,
            symbol: snapshot.symbol.clone(),
            bids,
            asks,
            sequence: snapshot.sequence,
            last_update: snapshot.ts,
        };

        let projection = state.project();
        self.books.write().insert(key, state);

        self.cache.set_with_ttl(
            &format!("orderbook_snapshot:{}:{}", snapshot.venue, snapshot.symbol),
            serde_json::to_vec(&snapshot).unwrap_or_default(),
            self.ttl_snapshot,
        );
        self.publish(&projection);
        projection
    }

    /// Apply incremental level changes. Deltas for a (venue, symbol) with no
    /// prior snapshot are dropped with a warning — no state is ever created
    /// from a delta alone. Returns `None` in that case; otherwise the fresh
    /// projection, for the same reason `process_snapshot` returns one.
    pub fn process_update(&self, delta: Delta) -> Option<Orderbook> {
        let key = (delta.venue, delta.symbol.clone());
        let projection = {
            let mut books = self.books.write();
            let Some(state) = books.get_mut(&key) else {
                warn!(venue = %delta.venue, symbol = %delta.symbol, "delta for unknown orderbook, dropped");
                return None;
            };

            for level in &delta.bids {
                apply_level(&mut state.bids, level, delta.venue, &delta.symbol);
            }
            for level in &delta.asks {
                apply_level(&mut state.asks, level, delta.venue, &delta.symbol);
            }
            state.sequence = delta.sequence;
            state.last_update = delta.ts;

            state.project()
        };

        self.publish(&projection);
        Some(projection)
    }

    /// Cache carries the full top-1000 projection (§4.2); the
    /// `orderbook.<venue>.<symbol>` bus channel carries a lighter top-20
    /// snapshot (§4.6) since every subscriber gets a copy of every publish.
    fn publish(&self, projection: &Orderbook) {
        self.cache.set_with_ttl(
            &format!("orderbook:{}:{}", projection.venue, projection.symbol),
            serde_json::to_vec(projection).unwrap_or_default(),
            self.ttl_orderbook,
        );

        let mut bus_projection = projection.clone();
        bus_projection.bids.truncate(BUS_DEPTH);
        bus_projection.asks.truncate(BUS_DEPTH);

        self.bus.publish(
            &channels::orderbook(projection.venue, &projection.symbol),
            BusEvent::Orderbook(bus_projection),
        );
    }

    /// Current projection for (venue, symbol), if a book exists.
    pub fn orderbook(&self, venue: Venue, symbol: &str) -> Option<Orderbook> {
        self.books
            .read()
            .get(&(venue, symbol.to_string()))
            .map(BookState::project)
    }

    pub fn calculate_spread(&self, venue: Venue, symbol: &str) -> Option<f64> {
        self.orderbook(venue, symbol).map(|ob| ob.spread)
    }

    /// Walk the sorted book for `side`, consuming levels to exactly fill
    /// `size`. Impact is reported as a signed percent vs. midpoint: positive
    /// when a buyer pays above mid, or a seller receives below mid.
    pub fn calculate_price_impact(
        &self,
        venue: Venue,
        symbol: &str,
        buy: bool,
        size: f64,
    ) -> Option<PriceImpact> {
        let books = self.books.read();
        let state = books.get(&(venue, symbol.to_string()))?;
        let projection = state.project();
        let mid = projection.mid_price;
        if mid == 0.0 {
            return None;
        }

        let levels: Vec<&PriceLevel> = if buy {
            projection.asks.iter().collect()
        } else {
            projection.bids.iter().collect()
        };

        let mut remaining = size;
        let mut notional = 0.0;
        let mut filled = 0.0;
        for level in levels {
            if remaining <= 0.0 {
                break;
            }
            let take = remaining.min(level.size_f64());
            notional += take * level.price_f64();
            filled += take;
            remaining -= take;
        }

        if filled == 0.0 {
            return None;
        }

        let avg_fill_price = notional / filled;
        let impact_percent = if buy {
            (avg_fill_price - mid) / mid * 100.0
        } else {
            (mid - avg_fill_price) / mid * 100.0
        };

        Some(PriceImpact {
            avg_fill_price,
            filled_size: filled,
            impact_percent,
        })
    }

    /// Every 30 s, write the current projection for every tracked book
    /// through to cache to bound staleness (spec §4.2).
    pub async fn run_periodic_cache_refresh(self: Arc<Self>, mut stop: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let projections: Vec<Orderbook> = self
                        .books
                        .read()
                        .values()
                        .map(BookState::project)
                        .collect();
                    for projection in &projections {
                        self.cache.set_with_ttl(
                            &format!("orderbook:{}:{}", projection.venue, projection.symbol),
                            serde_json::to_vec(projection).unwrap_or_default(),
                            self.ttl_orderbook,
                        );
                    }
                }
                _ = stop.recv() => return,
            }
        }
    }
}

/// Apply one delta level: remove on `size=="0"`, drop a negative size as a
/// `StateError` (spec §7 — logged, dropped, existing state untouched),
/// otherwise upsert.
fn apply_level(side: &mut BTreeMap<PriceKey, PriceLevel>, level: &PriceLevel, venue: Venue, symbol: &str) {
    if level.size_f64() < 0.0 {
        warn!(%venue, %symbol, price = %level.price, size = %level.size, "negative size in delta level, dropped");
        return;
    }
    let key = PriceKey(level.price_f64());
    if level.is_removal() {
        side.remove(&key);
    } else {
        side.insert(key, level.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;

    fn engine() -> OrderbookEngine {
        OrderbookEngine::new(
            Arc::new(PublishBus::new()),
            Arc::new(InMemoryCache::new()),
            Duration::from_secs(30),
            Duration::from_secs(30),
        )
    }

    fn level(price: &str, size: &str) -> PriceLevel {
        PriceLevel { price: price.into(), size: size.into(), ts: 0 }
    }

    #[test]
    fn snapshot_then_projection_sorts_bids_desc_asks_asc() {
        let eng = engine();
        eng.process_snapshot(Snapshot {
            venue: Venue::Hyperliquid,
            symbol: "BTC".into(),
            bids: vec![level("99", "2"), level("100", "1")],
            asks: vec![level("102", "1"), level("101", "3")],
            sequence: 1,
            ts: 0,
        });

        let ob = eng.orderbook(Venue::Hyperliquid, "BTC").unwrap();
        assert_eq!(ob.bids[0].price, "100");
        assert_eq!(ob.bids[1].price, "99");
        assert_eq!(ob.asks[0].price, "101");
        assert_eq!(ob.asks[1].price, "102");
        assert!(ob.bids[0].price_f64() < ob.asks[0].price_f64());
    }

    #[test]
    fn s2_delta_removal_recomputes_spread() {
        let eng = engine();
        eng.process_snapshot(Snapshot {
            venue: Venue::Hyperliquid,
            symbol: "BTC".into(),
            bids: vec![level("100", "1"), level("99", "2")],
            asks: vec![level("101", "1")],
            sequence: 1,
            ts: 0,
        });
        eng.process_update(Delta {
            venue: Venue::Hyperliquid,
            symbol: "BTC".into(),
            bids: vec![level("99", "0")],
            asks: vec![],
            sequence: 2,
            ts: 1,
        });

        let ob = eng.orderbook(Venue::Hyperliquid, "BTC").unwrap();
        assert_eq!(ob.bids.len(), 1);
        assert_eq!(ob.bids[0].price, "100");
        assert_eq!(ob.asks.len(), 1);
        assert_eq!(ob.spread, 1.0);
    }

    #[test]
    fn negative_size_snapshot_level_is_dropped() {
        let eng = engine();
        eng.process_snapshot(Snapshot {
            venue: Venue::Hyperliquid,
            symbol: "BTC".into(),
            bids: vec![level("100", "1"), level("99", "-1")],
            asks: vec![level("101", "1")],
            sequence: 1,
            ts: 0,
        });

        let ob = eng.orderbook(Venue::Hyperliquid, "BTC").unwrap();
        assert_eq!(ob.bids.len(), 1);
        assert_eq!(ob.bids[0].price, "100");
    }

    #[test]
    fn negative_size_delta_level_is_dropped_and_existing_level_untouched() {
        let eng = engine();
        eng.process_snapshot(Snapshot {
            venue: Venue::Hyperliquid,
            symbol: "BTC".into(),
            bids: vec![level("100", "1")],
            asks: vec![],
            sequence: 1,
            ts: 0,
        });
        eng.process_update(Delta {
            venue: Venue::Hyperliquid,
            symbol: "BTC".into(),
            bids: vec![level("100", "-5"), level("99", "-1")],
            asks: vec![],
            sequence: 2,
            ts: 1,
        });

        let ob = eng.orderbook(Venue::Hyperliquid, "BTC").unwrap();
        assert_eq!(ob.bids.len(), 1);
        assert_eq!(ob.bids[0].price, "100");
        assert_eq!(ob.bids[0].size, "1");
    }

    #[test]
    fn delta_for_unknown_book_is_dropped() {
        let eng = engine();
        eng.process_update(Delta {
            venue: Venue::Aster,
            symbol: "ETH".into(),
            bids: vec![level("100", "1")],
            asks: vec![],
            sequence: 1,
            ts: 0,
        });
        assert!(eng.orderbook(Venue::Aster, "ETH").is_none());
    }

    #[test]
    fn price_impact_walks_book_and_reports_signed_percent() {
        let eng = engine();
        eng.process_snapshot(Snapshot {
            venue: Venue::Hyperliquid,
            symbol: "BTC".into(),
            bids: vec![level("100", "5")],
            asks: vec![level("101", "1"), level("102", "5")],
            sequence: 1,
            ts: 0,
        });

        let impact = eng.calculate_price_impact(Venue::Hyperliquid, "BTC", true, 2.0).unwrap();
        assert_eq!(impact.filled_size, 2.0);
        assert!(impact.impact_percent > 0.0);
    }

    #[test]
    fn bus_channel_carries_top_20_while_orderbook_read_keeps_full_depth() {
        let eng = engine();
        let bids: Vec<PriceLevel> = (0..30).map(|i| level(&(100 - i).to_string(), "1")).collect();
        let asks: Vec<PriceLevel> = (0..30).map(|i| level(&(101 + i).to_string(), "1")).collect();

        let mut rx = eng.bus.subscribe(&channels::orderbook(Venue::Hyperliquid, "BTC"));
        eng.process_snapshot(Snapshot { venue: Venue::Hyperliquid, symbol: "BTC".into(), bids, asks, sequence: 1, ts: 0 });

        let event = rx.try_recv().unwrap();
        match event.as_ref() {
            BusEvent::Orderbook(ob) => {
                assert_eq!(ob.bids.len(), 20);
                assert_eq!(ob.asks.len(), 20);
            }
            _ => panic!("expected orderbook event"),
        }

        let full = eng.orderbook(Venue::Hyperliquid, "BTC").unwrap();
        assert_eq!(full.bids.len(), 30);
        assert_eq!(full.asks.len(), 30);
    }

    #[test]
    fn repeated_identical_snapshot_yields_identical_state() {
        let eng = engine();
        let snap = Snapshot {
            venue: Venue::Hyperliquid,
            symbol: "BTC".into(),
            bids: vec![level("100", "1")],
            asks: vec![level("101", "1")],
            sequence: 1,
            ts: 0,
        };
        eng.process_snapshot(snap.clone());
        let first = eng.orderbook(Venue::Hyperliquid, "BTC").unwrap();
        eng.process_snapshot(snap);
        let second = eng.orderbook(Venue::Hyperliquid, "BTC").unwrap();
        assert_eq!(first.bids, second.bids);
        assert_eq!(first.asks, second.asks);
    }
}
