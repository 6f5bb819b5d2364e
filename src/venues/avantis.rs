// =============================================================================
// Avantis venue protocol
// =============================================================================
//
// Avantis has no central limit order book: it prices against a pyth-style
// oracle feed and applies a synthetic spread around the oracle mid price.
// The adapter turns each oracle `priceUpdate` into a synthetic one-level
// `Snapshot` (a book with a single bid and a single ask) so the rest of the
// pipeline — which is orderbook-shaped — needs no special case. Position
// open/close events surface as `fill` messages and map directly to `Trade`.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::json;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::errors::PipelineError;
use crate::model::{PriceLevel, Side, Snapshot, Trade, Venue};

use super::{now_ms, ParsedMessage, VenueProtocol};

const WS_URL: &str = "wss://socket.avantisfi.com/ws";

/// Half-spread applied around the oracle mid price when synthesizing a
/// one-level book, expressed as a fraction of price (5 bps).
const SYNTHETIC_HALF_SPREAD: f64 = 0.0005;

pub struct AvantisProtocol;

impl VenueProtocol for AvantisProtocol {
    fn venue(&self) -> Venue {
        Venue::Avantis
    }

    fn ws_url(&self, _symbols: &[String]) -> String {
        WS_URL.to_string()
    }

    fn subscribe_messages(&self, symbols: &[String]) -> Vec<WsMessage> {
        symbols
            .iter()
            .map(|sym| WsMessage::Text(json!({"op": "subscribe", "pair": sym}).to_string()))
            .collect()
    }

    fn ping_message(&self) -> WsMessage {
        WsMessage::Text(json!({"op": "ping"}).to_string())
    }

    fn parse_message(
        &self,
        text: &str,
        next_seq: &AtomicU64,
    ) -> Result<Vec<ParsedMessage>, PipelineError> {
        let root: serde_json::Value = serde_json::from_str(text).map_err(|e| PipelineError::Protocol {
            venue: Venue::Avantis,
            detail: format!("invalid JSON: {e}"),
        })?;

        let op = root.get("op").and_then(|o| o.as_str()).unwrap_or("");

        match op {
            "priceUpdate" => {
                let symbol = root["pair"].as_str().unwrap_or_default().to_string();
                let mid: f64 = root["price"]
                    .as_str()
                    .and_then(|s| s.parse().ok())
                    .or_else(|| root["price"].as_f64())
                    .ok_or_else(|| PipelineError::Protocol {
                        venue: Venue::Avantis,
                        detail: "priceUpdate missing price".into(),
                    })?;
                let ts = root["timestamp"].as_i64().unwrap_or_else(now_ms);
                let seq = next_seq.fetch_add(1, Ordering::Relaxed);

                let bid_price = mid * (1.0 - SYNTHETIC_HALF_SPREAD);
                let ask_price = mid * (1.0 + SYNTHETIC_HALF_SPREAD);

                Ok(vec![ParsedMessage::Snapshot(Snapshot {
                    venue: Venue::Avantis,
                    symbol,
                    bids: vec![PriceLevel { price: format!("{bid_price}"), size: "1".to_string(), ts }],
                    asks: vec![PriceLevel { price: format!("{ask_price}"), size: "1".to_string(), ts }],
                    sequence: seq,
                    ts,
                })])
            }
            "fill" => {
                let symbol = root["pair"].as_str().unwrap_or_default().to_string();
                let price = root["price"].as_str().ok_or_else(|| PipelineError::Protocol {
                    venue: Venue::Avantis,
                    detail: "fill missing price".into(),
                })?.to_string();
                let size = root["size"].as_str().ok_or_else(|| PipelineError::Protocol {
                    venue: Venue::Avantis,
                    detail: "fill missing size".into(),
                })?.to_string();
                let side = match root["isLong"].as_bool().unwrap_or(true) {
                    true => Side::Buy,
                    false => Side::Sell,
                };
                let ts = root["timestamp"].as_i64().unwrap_or_else(now_ms);
                let id = root["tradeId"]
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("avantis-{ts}-{price}"));

                Ok(vec![ParsedMessage::Trades(vec![Trade {
                    id,
                    venue: Venue::Avantis,
                    symbol,
                    price,
                    size,
                    side,
                    ts,
                }])])
            }
            "pong" | "subscribed" => Ok(vec![ParsedMessage::Ignored]),
            other => Err(PipelineError::Protocol {
                venue: Venue::Avantis,
                detail: format!("unrecognized op: {other}"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    #[test]
    fn synthesizes_one_level_book_around_oracle_mid() {
        let proto = AvantisProtocol;
        let seq = AtomicU64::new(1);
        let json = r#"{"op":"priceUpdate","pair":"BTC","price":"100.0","timestamp":1000}"#;
        let parsed = proto.parse_message(json, &seq).unwrap();
        match &parsed[0] {
            ParsedMessage::Snapshot(s) => {
                assert_eq!(s.bids.len(), 1);
                assert_eq!(s.asks.len(), 1);
                assert!(s.bids[0].price_f64() < 100.0);
                assert!(s.asks[0].price_f64() > 100.0);
            }
            _ => panic!("expected snapshot"),
        }
    }

    #[test]
    fn parses_fill_as_trade() {
        let proto = AvantisProtocol;
        let seq = AtomicU64::new(1);
        let json = r#"{"op":"fill","pair":"BTC","price":"100.5","size":"0.4","isLong":false,"timestamp":2000,"tradeId":"xyz"}"#;
        let parsed = proto.parse_message(json, &seq).unwrap();
        match &parsed[0] {
            ParsedMessage::Trades(trades) => {
                assert_eq!(trades[0].side, Side::Sell);
                assert_eq!(trades[0].id, "xyz");
            }
            _ => panic!("expected trades"),
        }
    }

    #[test]
    fn rejects_unrecognized_op() {
        let proto = AvantisProtocol;
        let seq = AtomicU64::new(1);
        let err = proto.parse_message(r#"{"op":"nonsense"}"#, &seq).unwrap_err();
        assert!(matches!(err, PipelineError::Protocol { .. }));
    }
}
