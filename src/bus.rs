// =============================================================================
// PublishBus — channel-keyed fan-out, at-most-once delivery (spec §4.6)
// =============================================================================
//
// Publish is fire-and-forget: a send with no active subscribers is not an
// error. Each subscriber gets its own `broadcast::Receiver` and drains it on
// its own task, so the bus never re-enters an engine synchronously.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::model::{AggregatedBook, AggregatedCandle, Candle, Orderbook, Trade};

/// Default per-channel broadcast buffer, matching the capacity used by the
/// pack's orderbook aggregators for update fan-out.
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// A downstream event, tagged by the channel it was published on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum BusEvent {
    Orderbook(Orderbook),
    Trades(Vec<Trade>),
    Candle { candle: Candle, update_kind: CandleUpdateKind },
    AggregatedBook(AggregatedBook),
    Routing(crate::model::Routing),
    AggregatedCandle { candle: AggregatedCandle, update_kind: CandleUpdateKind },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CandleUpdateKind {
    /// Emitted on every fold.
    Update,
    /// Emitted once, on bucket-crossing completion.
    New,
}

/// The JSON envelope every bus event is wrapped in when serialized for a
/// transport boundary (REST/WS), per spec §6.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope<'a> {
    pub channel: &'a str,
    pub data: &'a BusEvent,
    pub timestamp: i64,
}

struct Channel {
    sender: broadcast::Sender<Arc<BusEvent>>,
}

/// Key-prefixed pub/sub bus. Channels are created lazily on first publish or
/// first subscribe.
pub struct PublishBus {
    channels: RwLock<HashMap<String, Channel>>,
}

impl PublishBus {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
        }
    }

    fn sender_for(&self, channel: &str) -> broadcast::Sender<Arc<BusEvent>> {
        if let Some(c) = self.channels.read().get(channel) {
            return c.sender.clone();
        }
        let mut channels = self.channels.write();
        channels
            .entry(channel.to_string())
            .or_insert_with(|| Channel {
                sender: broadcast::channel(DEFAULT_CHANNEL_CAPACITY).0,
            })
            .sender
            .clone()
    }

    /// Publish an event on `channel`. Fire-and-forget: if there are no
    /// subscribers the event is simply dropped.
    pub fn publish(&self, channel: &str, event: BusEvent) {
        let sender = self.sender_for(channel);
        let _ = sender.send(Arc::new(event));
    }

    /// Subscribe to `channel`, receiving every event published on it from
    /// this point forward.
    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<Arc<BusEvent>> {
        self.sender_for(channel).subscribe()
    }

    /// Build the JSON envelope for an event, stamped with the current time.
    pub fn envelope<'a>(channel: &'a str, data: &'a BusEvent) -> Envelope<'a> {
        Envelope {
            channel,
            data,
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

impl Default for PublishBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Channel-name builders, kept in one place so the string format never
/// drifts between publishers and subscribers (spec §4.6 / §6).
pub mod channels {
    use crate::model::{Timeframe, Venue};

    pub fn orderbook(venue: Venue, symbol: &str) -> String {
        format!("orderbook.{venue}.{symbol}")
    }

    pub fn trades(venue: Venue, symbol: &str) -> String {
        format!("trades.{venue}.{symbol}")
    }

    pub fn candles(venue: Venue, symbol: &str, timeframe: Timeframe) -> String {
        format!("candles.{venue}.{symbol}.{timeframe}")
    }

    pub fn aggregated_book(symbol: &str) -> String {
        format!("aggregated.book.{symbol}")
    }

    pub fn agg_routing(symbol: &str) -> String {
        format!("agg.routing.{symbol}")
    }

    pub fn agg_candles(symbol: &str, timeframe: Timeframe) -> String {
        format!("agg.candles.{symbol}.{timeframe}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Orderbook, Venue};

    fn sample_orderbook() -> Orderbook {
        Orderbook {
            venue: Venue::Hyperliquid,
            symbol: "BTC".into(),
            bids: vec![],
            asks: vec![],
            total_bid_size: 0.0,
            total_ask_size: 0.0,
            spread: 0.0,
            spread_percent: 0.0,
            mid_price: 0.0,
            sequence: 1,
            ts: 0,
        }
    }

    #[test]
    fn publish_without_subscribers_does_not_error() {
        let bus = PublishBus::new();
        bus.publish("orderbook.hyperliquid.BTC", BusEvent::Orderbook(sample_orderbook()));
    }

    #[test]
    fn subscriber_receives_published_event() {
        let bus = PublishBus::new();
        let mut rx = bus.subscribe("orderbook.hyperliquid.BTC");
        bus.publish("orderbook.hyperliquid.BTC", BusEvent::Orderbook(sample_orderbook()));
        let received = rx.try_recv().expect("event should be delivered");
        matches!(*received, BusEvent::Orderbook(_));
    }

    #[test]
    fn channel_name_helpers_match_spec_format() {
        assert_eq!(channels::orderbook(Venue::Aster, "ETH"), "orderbook.aster.ETH");
        assert_eq!(channels::aggregated_book("BTC"), "aggregated.book.BTC");
        assert_eq!(channels::agg_routing("BTC"), "agg.routing.BTC");
    }
}
