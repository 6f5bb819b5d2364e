// =============================================================================
// Lighter venue protocol
// =============================================================================
//
// Lighter is an order-book perp DEX: each market gets its own subscription
// channel, `order_book/<symbol>` and `trade/<symbol>`, requested via
// post-connect JSON frames (no URL-encoded subscription). `order_book`
// pushes are full snapshots keyed by an `offset` sequence number; `trade`
// pushes carry one fill per message.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::json;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::errors::PipelineError;
use crate::model::{PriceLevel, Side, Snapshot, Trade, Venue};

use super::{coerce_levels, now_ms, ParsedMessage, VenueProtocol};

const WS_URL: &str = "wss://mainnet.zklighter.elliot.ai/stream";

pub struct LighterProtocol;

impl VenueProtocol for LighterProtocol {
    fn venue(&self) -> Venue {
        Venue::Lighter
    }

    fn ws_url(&self, _symbols: &[String]) -> String {
        WS_URL.to_string()
    }

    fn subscribe_messages(&self, symbols: &[String]) -> Vec<WsMessage> {
        symbols
            .iter()
            .flat_map(|sym| {
                vec![
                    WsMessage::Text(
                        json!({"type": "subscribe", "channel": format!("order_book/{sym}")}).to_string(),
                    ),
                    WsMessage::Text(
                        json!({"type": "subscribe", "channel": format!("trade/{sym}")}).to_string(),
                    ),
                ]
            })
            .collect()
    }

    fn ping_message(&self) -> WsMessage {
        WsMessage::Text(json!({"type": "ping"}).to_string())
    }

    fn parse_message(
        &self,
        text: &str,
        next_seq: &AtomicU64,
    ) -> Result<Vec<ParsedMessage>, PipelineError> {
        let root: serde_json::Value = serde_json::from_str(text).map_err(|e| PipelineError::Protocol {
            venue: Venue::Lighter,
            detail: format!("invalid JSON: {e}"),
        })?;

        let kind = root.get("type").and_then(|t| t.as_str()).unwrap_or("");
        let channel = root.get("channel").and_then(|c| c.as_str()).unwrap_or("");

        if kind == "order_book" || channel.starts_with("order_book") {
            let symbol = channel
                .split_once('/')
                .map(|(_, s)| s.to_string())
                .or_else(|| root.get("symbol").and_then(|s| s.as_str()).map(str::to_string))
                .unwrap_or_default();

            let ts = root["timestamp"].as_i64().unwrap_or_else(now_ms);
            let seq = root["offset"].as_u64().unwrap_or_else(|| next_seq.fetch_add(1, Ordering::Relaxed));

            let bids = coerce_levels(&root["bids"])
                .into_iter()
                .map(|(price, size)| PriceLevel { price, size, ts })
                .collect();
            let asks = coerce_levels(&root["asks"])
                .into_iter()
                .map(|(price, size)| PriceLevel { price, size, ts })
                .collect();

            Ok(vec![ParsedMessage::Snapshot(Snapshot {
                venue: Venue::Lighter,
                symbol,
                bids,
                asks,
                sequence: seq,
                ts,
            })])
        } else if kind == "trade" || channel.starts_with("trade") {
            let symbol = channel
                .split_once('/')
                .map(|(_, s)| s.to_string())
                .or_else(|| root.get("symbol").and_then(|s| s.as_str()).map(str::to_string))
                .unwrap_or_default();

            let price = root["price"].as_str().ok_or_else(|| PipelineError::Protocol {
                venue: Venue::Lighter,
                detail: "trade missing price".into(),
            })?.to_string();
            let size = root["size"].as_str().ok_or_else(|| PipelineError::Protocol {
                venue: Venue::Lighter,
                detail: "trade missing size".into(),
            })?.to_string();
            let side = match root["side"].as_str().unwrap_or("buy") {
                "sell" | "ask" => Side::Sell,
                _ => Side::Buy,
            };
            let ts = root["timestamp"].as_i64().unwrap_or_else(now_ms);
            let id = root["id"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| format!("lighter-{ts}-{price}"));

            Ok(vec![ParsedMessage::Trades(vec![Trade {
                id,
                venue: Venue::Lighter,
                symbol,
                price,
                size,
                side,
                ts,
            }])])
        } else if kind == "pong" || kind == "subscribed" {
            Ok(vec![ParsedMessage::Ignored])
        } else {
            Err(PipelineError::Protocol {
                venue: Venue::Lighter,
                detail: format!("unrecognized message type: {kind}"),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    #[test]
    fn parses_order_book_snapshot() {
        let proto = LighterProtocol;
        let seq = AtomicU64::new(1);
        let json = r#"{
            "type": "order_book",
            "channel": "order_book/BTC",
            "offset": 9,
            "timestamp": 1000,
            "bids": [["100.0", "1.0"]],
            "asks": [["101.0", "2.0"]]
        }"#;
        let parsed = proto.parse_message(json, &seq).unwrap();
        match &parsed[0] {
            ParsedMessage::Snapshot(s) => {
                assert_eq!(s.symbol, "BTC");
                assert_eq!(s.sequence, 9);
            }
            _ => panic!("expected snapshot"),
        }
    }

    #[test]
    fn parses_trade() {
        let proto = LighterProtocol;
        let seq = AtomicU64::new(1);
        let json = r#"{
            "type": "trade",
            "channel": "trade/BTC",
            "price": "100.5",
            "size": "0.3",
            "side": "sell",
            "timestamp": 2000,
            "id": "abc"
        }"#;
        let parsed = proto.parse_message(json, &seq).unwrap();
        match &parsed[0] {
            ParsedMessage::Trades(trades) => {
                assert_eq!(trades[0].side, Side::Sell);
                assert_eq!(trades[0].id, "abc");
            }
            _ => panic!("expected trades"),
        }
    }

    #[test]
    fn rejects_unrecognized_type() {
        let proto = LighterProtocol;
        let seq = AtomicU64::new(1);
        let err = proto.parse_message(r#"{"type":"nonsense"}"#, &seq).unwrap_err();
        assert!(matches!(err, PipelineError::Protocol { .. }));
    }
}
