// =============================================================================
// Hyperliquid venue protocol
// =============================================================================
//
// Wire shape: a single combined WebSocket endpoint; subscriptions are
// requested by sending `{"method":"subscribe","subscription":{...}}` frames
// after connecting. `l2Book` pushes are a two-element `levels` array
// (bids, asks) of `{px, sz, n}` objects; `trades` pushes are an array of
// per-trade objects.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::json;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::errors::PipelineError;
use crate::model::{PriceLevel, Side, Snapshot, Trade, Venue};

use super::{coerce_levels, now_ms, ParsedMessage, VenueProtocol};

const WS_URL: &str = "wss://api.hyperliquid.xyz/ws";

pub struct HyperliquidProtocol;

impl VenueProtocol for HyperliquidProtocol {
    fn venue(&self) -> Venue {
        Venue::Hyperliquid
    }

    fn ws_url(&self, _symbols: &[String]) -> String {
        WS_URL.to_string()
    }

    fn subscribe_messages(&self, symbols: &[String]) -> Vec<WsMessage> {
        let mut out = Vec::with_capacity(symbols.len() * 2);
        for sym in symbols {
            out.push(WsMessage::Text(
                json!({"method": "subscribe", "subscription": {"type": "l2Book", "coin": sym}})
                    .to_string(),
            ));
            out.push(WsMessage::Text(
                json!({"method": "subscribe", "subscription": {"type": "trades", "coin": sym}})
                    .to_string(),
            ));
        }
        out
    }

    fn ping_message(&self) -> WsMessage {
        WsMessage::Text(json!({"method": "ping"}).to_string())
    }

    fn parse_message(
        &self,
        text: &str,
        next_seq: &AtomicU64,
    ) -> Result<Vec<ParsedMessage>, PipelineError> {
        let root: serde_json::Value = serde_json::from_str(text).map_err(|e| PipelineError::Protocol {
            venue: Venue::Hyperliquid,
            detail: format!("invalid JSON: {e}"),
        })?;

        let channel = root.get("channel").and_then(|c| c.as_str()).unwrap_or("");
        match channel {
            "l2Book" => {
                let data = &root["data"];
                let coin = data["coin"].as_str().unwrap_or_default().to_string();
                let levels = data["levels"].as_array().ok_or_else(|| PipelineError::Protocol {
                    venue: Venue::Hyperliquid,
                    detail: "l2Book message missing levels".into(),
                })?;

                let ts = data["time"].as_i64().unwrap_or_else(now_ms);
                let seq = next_seq.fetch_add(1, Ordering::Relaxed);

                let bids = levels
                    .first()
                    .map(|v| coerce_levels(v))
                    .unwrap_or_default()
                    .into_iter()
                    .map(|(price, size)| PriceLevel { price, size, ts })
                    .collect();
                let asks = levels
                    .get(1)
                    .map(|v| coerce_levels(v))
                    .unwrap_or_default()
                    .into_iter()
                    .map(|(price, size)| PriceLevel { price, size, ts })
                    .collect();

                Ok(vec![ParsedMessage::Snapshot(Snapshot {
                    venue: Venue::Hyperliquid,
                    symbol: coin,
                    bids,
                    asks,
                    sequence: seq,
                    ts,
                })])
            }
            "trades" => {
                let data = root["data"].as_array().ok_or_else(|| PipelineError::Protocol {
                    venue: Venue::Hyperliquid,
                    detail: "trades message missing data array".into(),
                })?;

                let trades = data
                    .iter()
                    .filter_map(|t| {
                        let coin = t["coin"].as_str()?.to_string();
                        let price = t["px"].as_str()?.to_string();
                        let size = t["sz"].as_str()?.to_string();
                        let side = match t["side"].as_str()? {
                            "B" => Side::Buy,
                            _ => Side::Sell,
                        };
                        let ts = t["time"].as_i64().unwrap_or_else(now_ms);
                        let id = t["tid"]
                            .as_u64()
                            .map(|n| n.to_string())
                            .unwrap_or_else(|| format!("hl-{ts}-{price}-{size}"));
                        Some(Trade {
                            id,
                            venue: Venue::Hyperliquid,
                            symbol: coin,
                            price,
                            size,
                            side,
                            ts,
                        })
                    })
                    .collect();

                Ok(vec![ParsedMessage::Trades(trades)])
            }
            "pong" | "subscriptionResponse" => Ok(vec![ParsedMessage::Ignored]),
            other => Err(PipelineError::Protocol {
                venue: Venue::Hyperliquid,
                detail: format!("unrecognized channel: {other}"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    #[test]
    fn parses_l2book_snapshot() {
        let proto = HyperliquidProtocol;
        let seq = AtomicU64::new(1);
        let json = r#"{
            "channel": "l2Book",
            "data": {
                "coin": "BTC",
                "time": 1000,
                "levels": [
                    [{"px": "100.0", "sz": "1.0", "n": 1}],
                    [{"px": "101.0", "sz": "2.0", "n": 1}]
                ]
            }
        }"#;
        let parsed = proto.parse_message(json, &seq).unwrap();
        assert_eq!(parsed.len(), 1);
        match &parsed[0] {
            ParsedMessage::Snapshot(s) => {
                assert_eq!(s.symbol, "BTC");
                assert_eq!(s.bids[0].price, "100.0");
                assert_eq!(s.asks[0].price, "101.0");
            }
            _ => panic!("expected snapshot"),
        }
    }

    #[test]
    fn parses_trades() {
        let proto = HyperliquidProtocol;
        let seq = AtomicU64::new(1);
        let json = r#"{
            "channel": "trades",
            "data": [
                {"coin": "BTC", "side": "B", "px": "100.5", "sz": "0.1", "time": 2000, "tid": 42}
            ]
        }"#;
        let parsed = proto.parse_message(json, &seq).unwrap();
        match &parsed[0] {
            ParsedMessage::Trades(trades) => {
                assert_eq!(trades.len(), 1);
                assert_eq!(trades[0].side, Side::Buy);
                assert_eq!(trades[0].id, "42");
            }
            _ => panic!("expected trades"),
        }
    }

    #[test]
    fn rejects_unrecognized_channel() {
        let proto = HyperliquidProtocol;
        let seq = AtomicU64::new(1);
        let err = proto.parse_message(r#"{"channel":"nonsense"}"#, &seq).unwrap_err();
        assert!(matches!(err, PipelineError::Protocol { .. }));
    }
}
