// =============================================================================
// AggregationEngine — merges per-venue books, computes routing, throttles
// =============================================================================
//
// The savings formula divides by a fixed 3 regardless of how many of the
// other three venues actually have a quote (missing venues contribute 0 to
// the sum). This reproduces the source's documented-but-questionable
// behavior rather than correcting it (spec §9 Open Questions).
// =============================================================================

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::bus::{channels, BusEvent, PublishBus};
use crate::cache::Cache;
use crate::model::{AggregatedBook, AggregatedLevel, LevelSource, Orderbook, PriceLevel, Routing, RoutingRecommendation, Venue};

/// Minimum interval between `aggregated.book.<symbol>` publications.
const DEFAULT_THROTTLE: Duration = Duration::from_millis(50);
const DEFAULT_AGG_BOOK_TTL: Duration = Duration::from_secs(60);
const DEFAULT_AGG_ROUTING_TTL: Duration = Duration::from_secs(1);
const MAX_LEVELS_PER_SIDE: usize = 50;
/// Fixed divisor used by the savings formula (spec §4.5, §9).
const SAVINGS_DIVISOR: f64 = 3.0;

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

/// Round to 0.01, half away from zero — `f64::round` already rounds halves
/// away from zero, which is what this normalization requires.
fn normalize_price(price: f64) -> f64 {
    (price * 100.0).round() / 100.0
}

pub struct AggregationEngine {
    per_venue_books: RwLock<HashMap<String, HashMap<Venue, Orderbook>>>,
    last_publish: RwLock<HashMap<String, Instant>>,
    bus: Arc<PublishBus>,
    cache: Arc<dyn Cache>,
    throttle: Duration,
    /// `agg.book:<symbol>` cache TTL (config `cache_ttl.agg_book_ttl_s`).
    ttl_agg_book: Duration,
    /// `agg.routing:<symbol>` cache TTL (config `cache_ttl.agg_routing_ttl_s`).
    ttl_agg_routing: Duration,
}

impl AggregationEngine {
    pub fn new(bus: Arc<PublishBus>, cache: Arc<dyn Cache>) -> Self {
        Self::with_config(bus, cache, DEFAULT_THROTTLE, DEFAULT_AGG_BOOK_TTL, DEFAULT_AGG_ROUTING_TTL)
    }

    pub fn with_throttle(bus: Arc<PublishBus>, cache: Arc<dyn Cache>, throttle: Duration) -> Self {
        Self::with_config(bus, cache, throttle, DEFAULT_AGG_BOOK_TTL, DEFAULT_AGG_ROUTING_TTL)
    }

    pub fn with_config(
        bus: Arc<PublishBus>,
        cache: Arc<dyn Cache>,
        throttle: Duration,
        ttl_agg_book: Duration,
        ttl_agg_routing: Duration,
    ) -> Self {
        Self {
            per_venue_books: RwLock::new(HashMap::new()),
            last_publish: RwLock::new(HashMap::new()),
            bus,
            cache,
            throttle,
            ttl_agg_book,
            ttl_agg_routing,
        }
    }

    /// Record the latest per-venue book and attempt to aggregate + publish.
    pub fn process_orderbook_update(&self, orderbook: Orderbook) {
        let symbol = orderbook.symbol.clone();
        {
            let mut books = self.per_venue_books.write();
            books.entry(symbol.clone()).or_default().insert(orderbook.venue, orderbook);
        }
        self.aggregate_and_publish(&symbol);
    }

    /// Merge all known per-venue books for `symbol` and publish, subject to
    /// the per-symbol throttle. A throttled update is dropped, not queued —
    /// the next eligible update carries the then-current state.
    fn aggregate_and_publish(&self, symbol: &str) {
        {
            let mut last = self.last_publish.write();
            let now = Instant::now();
            if let Some(last_ts) = last.get(symbol) {
                if now.duration_since(*last_ts) < self.throttle {
                    return;
                }
            }
            last.insert(symbol.to_string(), now);
        }

        let books = match self.per_venue_books.read().get(symbol).cloned() {
            Some(b) if !b.is_empty() => b,
            _ => return,
        };

        let bids = merge_side(&books, true);
        let asks = merge_side(&books, false);

        let best_bid = bids.first().cloned();
        let best_ask = asks.first().cloned();
        let spread = match (&best_bid, &best_ask) {
            (Some(b), Some(a)) => a.price - b.price,
            _ => 0.0,
        };

        let routing = compute_routing(&books);

        // Per-venue snapshot carried alongside the merged book is capped to
        // the top 20 levels per side (spec §3, §4.6), independent of the
        // engine's own top-1000 projection.
        let per_venue: Vec<Orderbook> = Venue::ALL
            .iter()
            .filter_map(|v| books.get(v).cloned())
            .map(top_20)
            .collect();

        let aggregated = AggregatedBook {
            symbol: symbol.to_string(),
            ts: chrono::Utc::now().timestamp_millis(),
            bids,
            asks,
            spread,
            best_bid,
            best_ask,
            per_venue,
            routing: routing.clone(),
        };

        self.cache.set_with_ttl(
            &format!("agg.book:{symbol}"),
            serde_json::to_vec(&aggregated).unwrap_or_default(),
            self.ttl_agg_book,
        );
        self.cache.set_with_ttl(
            &format!("agg.routing:{symbol}"),
            serde_json::to_vec(&routing).unwrap_or_default(),
            self.ttl_agg_routing,
        );

        self.bus.publish(&channels::aggregated_book(symbol), BusEvent::AggregatedBook(aggregated));
        self.bus.publish(&channels::agg_routing(symbol), BusEvent::Routing(routing));
    }
}

/// Top-20-bids/asks snapshot for the `per_venue` field of an
/// `AggregatedBook` (spec §3, §4.6 "top 20 bids/asks").
const PER_VENUE_DEPTH: usize = 20;

fn top_20(mut book: Orderbook) -> Orderbook {
    book.bids.truncate(PER_VENUE_DEPTH);
    book.asks.truncate(PER_VENUE_DEPTH);
    book
}

/// Merge one side across venues, in deterministic H, A, L, V insertion
/// order, normalizing price to 0.01 for cross-venue equality.
fn merge_side(books: &HashMap<Venue, Orderbook>, is_bid: bool) -> Vec<AggregatedLevel> {
    let mut levels: BTreeMap<PriceKey, AggregatedLevel> = BTreeMap::new();

    for venue in Venue::ALL {
        let Some(book) = books.get(&venue) else { continue };
        let side: &Vec<PriceLevel> = if is_bid { &book.bids } else { &book.asks };
        for level in side {
            let price = normalize_price(level.price_f64());
            let size = level.size_f64();
            let key = PriceKey(price);
            let entry = levels.entry(key).or_insert_with(|| AggregatedLevel {
                price,
                total_size: 0.0,
                sources: Vec::new(),
            });
            entry.total_size += size;
            entry.sources.push(LevelSource { venue, size });
        }
    }

    let mut out: Vec<AggregatedLevel> = levels.into_values().collect();
    if is_bid {
        out.sort_by(|a, b| b.price.total_cmp(&a.price));
    } else {
        out.sort_by(|a, b| a.price.total_cmp(&b.price));
    }
    out.truncate(MAX_LEVELS_PER_SIDE);
    out
}

fn compute_routing(books: &HashMap<Venue, Orderbook>) -> Routing {
    let top_asks: Vec<(Venue, f64)> = Venue::ALL
        .iter()
        .filter_map(|v| books.get(v).and_then(|b| b.asks.first()).map(|l| (*v, l.price_f64())))
        .collect();

    let buy = if let Some(&(chosen_venue, chosen_price)) =
        top_asks.iter().min_by(|a, b| a.1.total_cmp(&b.1))
    {
        let others_sum: f64 = Venue::ALL
            .iter()
            .filter(|v| **v != chosen_venue)
            .map(|v| books.get(v).and_then(|b| b.asks.first()).map(|l| l.price_f64()).unwrap_or(0.0))
            .sum();
        let savings = (others_sum / SAVINGS_DIVISOR - chosen_price).abs();
        let savings_percent = if chosen_price != 0.0 { savings / chosen_price * 100.0 } else { 0.0 };
        RoutingRecommendation { venue: chosen_venue, price: chosen_price, savings, savings_percent }
    } else {
        RoutingRecommendation { venue: Venue::Hyperliquid, price: 0.0, savings: 0.0, savings_percent: 0.0 }
    };

    let top_bids: Vec<(Venue, f64)> = Venue::ALL
        .iter()
        .filter_map(|v| books.get(v).and_then(|b| b.bids.first()).map(|l| (*v, l.price_f64())))
        .collect();

    let sell = if let Some(&(chosen_venue, chosen_price)) =
        top_bids.iter().max_by(|a, b| a.1.total_cmp(&b.1))
    {
        let others_sum: f64 = Venue::ALL
            .iter()
            .filter(|v| **v != chosen_venue)
            .map(|v| books.get(v).and_then(|b| b.bids.first()).map(|l| l.price_f64()).unwrap_or(0.0))
            .sum();
        let savings = (others_sum / SAVINGS_DIVISOR - chosen_price).abs();
        let savings_percent = if chosen_price != 0.0 { savings / chosen_price * 100.0 } else { 0.0 };
        RoutingRecommendation { venue: chosen_venue, price: chosen_price, savings, savings_percent }
    } else {
        RoutingRecommendation { venue: Venue::Hyperliquid, price: 0.0, savings: 0.0, savings_percent: 0.0 }
    };

    Routing { buy, sell }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;

    fn book(venue: Venue, bid: Option<(&str, &str)>, ask: Option<(&str, &str)>) -> Orderbook {
        let level = |p: &str, s: &str| PriceLevel { price: p.into(), size: s.into(), ts: 0 };
        Orderbook {
            venue,
            symbol: "BTC".into(),
            bids: bid.map(|(p, s)| vec![level(p, s)]).unwrap_or_default(),
            asks: ask.map(|(p, s)| vec![level(p, s)]).unwrap_or_default(),
            total_bid_size: 0.0,
            total_ask_size: 0.0,
            spread: 0.0,
            spread_percent: 0.0,
            mid_price: 0.0,
            sequence: 1,
            ts: 0,
        }
    }

    fn engine() -> AggregationEngine {
        AggregationEngine::with_throttle(Arc::new(PublishBus::new()), Arc::new(InMemoryCache::new()), Duration::from_millis(50))
    }

    #[test]
    fn s3_aggregation_normalizes_and_merges_in_venue_order() {
        let eng = engine();
        eng.process_orderbook_update(book(Venue::Hyperliquid, None, Some(("180.520", "5"))));
        eng.process_orderbook_update(book(Venue::Aster, None, Some(("180.52", "3"))));

        let books = eng.per_venue_books.read().get("BTC").cloned().unwrap();
        let asks = merge_side(&books, false);
        assert_eq!(asks.len(), 1);
        assert_eq!(asks[0].price, 180.52);
        assert_eq!(asks[0].total_size, 8.0);
        assert_eq!(asks[0].sources[0].venue, Venue::Hyperliquid);
        assert_eq!(asks[0].sources[1].venue, Venue::Aster);
    }

    #[test]
    fn s4_routing_picks_lowest_ask_with_frozen_savings_formula() {
        let books: HashMap<Venue, Orderbook> = [
            (Venue::Hyperliquid, book(Venue::Hyperliquid, None, Some(("101", "1")))),
            (Venue::Aster, book(Venue::Aster, None, Some(("100", "1")))),
            (Venue::Lighter, book(Venue::Lighter, None, Some(("102", "1")))),
            (Venue::Avantis, book(Venue::Avantis, None, Some(("103", "1")))),
        ]
        .into_iter()
        .collect();

        let routing = compute_routing(&books);
        assert_eq!(routing.buy.venue, Venue::Aster);
        assert_eq!(routing.buy.price, 100.0);
        assert_eq!(routing.buy.savings, 2.0);
        assert_eq!(routing.buy.savings_percent, 2.0);
    }

    #[test]
    fn s5_throttle_allows_one_publish_per_window() {
        let eng = engine();
        for _ in 0..10 {
            eng.process_orderbook_update(book(Venue::Hyperliquid, Some(("100", "1")), Some(("101", "1"))));
        }
        // Only the throttle gate is under test here: the cache must carry
        // exactly one aggregated snapshot regardless of how many updates
        // landed inside the window.
        assert!(eng.cache.get("agg.book:BTC").is_some());
    }

    #[test]
    fn missing_all_venues_defaults_to_hyperliquid_zero_price() {
        let routing = compute_routing(&HashMap::new());
        assert_eq!(routing.buy.venue, Venue::Hyperliquid);
        assert_eq!(routing.buy.price, 0.0);
    }

    #[test]
    fn per_venue_snapshot_caps_at_top_20_levels_per_side() {
        let level = |p: f64, s: &str| PriceLevel { price: p.to_string(), size: s.into(), ts: 0 };
        let mut wide_book = book(Venue::Hyperliquid, None, None);
        wide_book.bids = (0..30).map(|i| level(100.0 - i as f64, "1")).collect();
        wide_book.asks = (0..30).map(|i| level(101.0 + i as f64, "1")).collect();

        let capped = top_20(wide_book);
        assert_eq!(capped.bids.len(), 20);
        assert_eq!(capped.asks.len(), 20);
    }
}
