// =============================================================================
// Aster venue protocol
// =============================================================================
//
// Aster's public market-data feed follows the Binance-family combined-stream
// convention: one WebSocket carries all subscribed `<symbol>@depth20` and
// `<symbol>@aggTrade` streams, selected entirely via the URL. No post-connect
// subscribe frames or special ping payload are required — tungstenite
// answers control-frame pings automatically and this protocol's own
// heartbeat ping is a protocol-level no-op frame.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};

use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::errors::PipelineError;
use crate::model::{PriceLevel, Side, Snapshot, Trade, Venue};

use super::{coerce_levels, now_ms, ParsedMessage, VenueProtocol};

const WS_BASE: &str = "wss://fstream.asterdex.com/stream";

pub struct AsterProtocol;

impl VenueProtocol for AsterProtocol {
    fn venue(&self) -> Venue {
        Venue::Aster
    }

    fn ws_url(&self, symbols: &[String]) -> String {
        let streams: Vec<String> = symbols
            .iter()
            .flat_map(|s| {
                let lower = s.to_lowercase();
                vec![format!("{lower}@depth20@100ms"), format!("{lower}@aggTrade")]
            })
            .collect();
        format!("{WS_BASE}?streams={}", streams.join("/"))
    }

    fn ping_message(&self) -> WsMessage {
        WsMessage::Ping(Vec::new())
    }

    fn parse_message(
        &self,
        text: &str,
        next_seq: &AtomicU64,
    ) -> Result<Vec<ParsedMessage>, PipelineError> {
        let root: serde_json::Value = serde_json::from_str(text).map_err(|e| PipelineError::Protocol {
            venue: Venue::Aster,
            detail: format!("invalid JSON: {e}"),
        })?;

        let stream = root.get("stream").and_then(|s| s.as_str()).unwrap_or_default();
        let data = root.get("data").unwrap_or(&root);

        if stream.contains("@depth") {
            let symbol = stream.split('@').next().unwrap_or_default().to_uppercase();
            let ts = now_ms();
            let seq = data["lastUpdateId"].as_u64().unwrap_or_else(|| next_seq.fetch_add(1, Ordering::Relaxed));

            let bids = coerce_levels(&data["b"])
                .into_iter()
                .map(|(price, size)| PriceLevel { price, size, ts })
                .collect();
            let asks = coerce_levels(&data["a"])
                .into_iter()
                .map(|(price, size)| PriceLevel { price, size, ts })
                .collect();

            Ok(vec![ParsedMessage::Snapshot(Snapshot {
                venue: Venue::Aster,
                symbol,
                bids,
                asks,
                sequence: seq,
                ts,
            })])
        } else if stream.contains("@aggTrade") {
            let symbol = data["s"].as_str().unwrap_or_default().to_uppercase();
            let price = data["p"].as_str().ok_or_else(|| PipelineError::Protocol {
                venue: Venue::Aster,
                detail: "aggTrade missing price".into(),
            })?.to_string();
            let size = data["q"].as_str().ok_or_else(|| PipelineError::Protocol {
                venue: Venue::Aster,
                detail: "aggTrade missing quantity".into(),
            })?.to_string();
            let is_buyer_maker = data["m"].as_bool().unwrap_or(false);
            let ts = data["T"].as_i64().unwrap_or_else(now_ms);
            let id = data["a"].as_u64().map(|n| n.to_string()).unwrap_or_else(|| format!("aster-{ts}"));

            Ok(vec![ParsedMessage::Trades(vec![Trade {
                id,
                venue: Venue::Aster,
                symbol,
                price,
                size,
                // buyer is maker => the taker side (the aggressor) is a sell.
                side: if is_buyer_maker { Side::Sell } else { Side::Buy },
                ts,
            }])])
        } else {
            Ok(vec![ParsedMessage::Ignored])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    #[test]
    fn builds_combined_stream_url() {
        let proto = AsterProtocol;
        let url = proto.ws_url(&["BTCUSDT".to_string()]);
        assert!(url.contains("btcusdt@depth20@100ms"));
        assert!(url.contains("btcusdt@aggTrade"));
    }

    #[test]
    fn parses_depth_snapshot() {
        let proto = AsterProtocol;
        let seq = AtomicU64::new(1);
        let json = r#"{
            "stream": "btcusdt@depth20@100ms",
            "data": { "lastUpdateId": 7, "b": [["100.0","1.0"]], "a": [["101.0","2.0"]] }
        }"#;
        let parsed = proto.parse_message(json, &seq).unwrap();
        match &parsed[0] {
            ParsedMessage::Snapshot(s) => {
                assert_eq!(s.symbol, "BTCUSDT");
                assert_eq!(s.sequence, 7);
            }
            _ => panic!("expected snapshot"),
        }
    }

    #[test]
    fn parses_agg_trade() {
        let proto = AsterProtocol;
        let seq = AtomicU64::new(1);
        let json = r#"{
            "stream": "btcusdt@aggTrade",
            "data": { "s": "BTCUSDT", "p": "100.5", "q": "0.2", "m": true, "T": 123, "a": 99 }
        }"#;
        let parsed = proto.parse_message(json, &seq).unwrap();
        match &parsed[0] {
            ParsedMessage::Trades(trades) => {
                assert_eq!(trades[0].side, Side::Sell);
                assert_eq!(trades[0].id, "99");
            }
            _ => panic!("expected trades"),
        }
    }
}
