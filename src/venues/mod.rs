// =============================================================================
// VenueAdapter — persistent per-venue WebSocket, normalized event emission
// =============================================================================
//
// Polymorphic over capability set {Connect, Subscribe, Disconnect, heartbeat,
// parse} (spec §9 Design Notes): `WsVenueAdapter<P>` owns the connection
// lifecycle, heartbeat, and exponential-backoff reconnect; each venue
// supplies a `VenueProtocol` that knows its URL shape, ping payload, and
// message parsing.
// =============================================================================

pub mod aster;
pub mod avantis;
pub mod hyperliquid;
pub mod lighter;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{error, info, warn};

use crate::errors::PipelineError;
use crate::model::{Delta, Snapshot, Trade, Venue};

/// Observable adapter events (spec §4.1), modeled as a typed enum sent over
/// an `mpsc` channel rather than string-named emitters (spec §9).
#[derive(Debug, Clone)]
pub enum AdapterEvent {
    Connected { venue: Venue },
    Disconnected { venue: Venue, reason: String },
    Error { venue: Venue, kind: &'static str, detail: String },
    Orderbook(Snapshot),
    OrderbookDelta(Delta),
    Trades(Vec<Trade>),
}

/// One parsed unit of venue wire data.
pub enum ParsedMessage {
    Snapshot(Snapshot),
    Delta(Delta),
    Trades(Vec<Trade>),
    /// Message recognized but carries no normalized content (e.g. a pong).
    Ignored,
}

/// Capability set a concrete venue supplies to the generic adapter.
pub trait VenueProtocol: Send + Sync + 'static {
    fn venue(&self) -> Venue;

    /// Build the WebSocket URL for the given symbol subscription set.
    fn ws_url(&self, symbols: &[String]) -> String;

    /// Messages to send immediately after the socket opens to request book +
    /// trades channels for each symbol (spec §4.1, §6). Venues that encode
    /// the subscription entirely in the URL (combined-stream style) return
    /// an empty vec.
    fn subscribe_messages(&self, symbols: &[String]) -> Vec<WsMessage> {
        let _ = symbols;
        Vec::new()
    }

    /// The venue-appropriate keepalive ping frame.
    fn ping_message(&self) -> WsMessage {
        WsMessage::Ping(Vec::new())
    }

    /// Parse one inbound text frame. `next_seq` is a per-adapter monotonic
    /// counter to assign when the venue does not provide its own sequence
    /// number.
    fn parse_message(
        &self,
        text: &str,
        next_seq: &AtomicU64,
    ) -> Result<Vec<ParsedMessage>, PipelineError>;
}

/// Reconnect/heartbeat tuning (spec §4.1, §6).
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    pub heartbeat_interval: Duration,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    /// 0 = unlimited.
    pub max_reconnect_attempts: u32,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            reconnect_initial: Duration::from_secs(5),
            reconnect_max: Duration::from_secs(60),
            max_reconnect_attempts: 0,
        }
    }
}

/// Coerce a JSON array of levels in either documented shape —
/// `{"px": "...", "sz": "..."}` objects or `["price", "size"]` tuples — into
/// normalized `(price, size)` string pairs (spec §4.1).
pub fn coerce_levels(value: &serde_json::Value) -> Vec<(String, String)> {
    let Some(arr) = value.as_array() else {
        return Vec::new();
    };

    arr.iter()
        .filter_map(|entry| {
            if let Some(tuple) = entry.as_array() {
                let price = tuple.first()?.as_str().map(str::to_string).or_else(|| {
                    tuple.first()?.as_f64().map(|f| f.to_string())
                })?;
                let size = tuple.get(1)?.as_str().map(str::to_string).or_else(|| {
                    tuple.get(1)?.as_f64().map(|f| f.to_string())
                })?;
                Some((price, size))
            } else if entry.is_object() {
                let price = entry
                    .get("px")
                    .or_else(|| entry.get("price"))
                    .and_then(|v| v.as_str().map(str::to_string).or_else(|| v.as_f64().map(|f| f.to_string())))?;
                let size = entry
                    .get("sz")
                    .or_else(|| entry.get("size"))
                    .or_else(|| entry.get("qty"))
                    .and_then(|v| v.as_str().map(str::to_string).or_else(|| v.as_f64().map(|f| f.to_string())))?;
                Some((price, size))
            } else {
                None
            }
        })
        .collect()
}

/// Generic WebSocket-backed venue adapter. Owns the reconnect loop; the
/// wire-protocol specifics come from `P: VenueProtocol`.
pub struct WsVenueAdapter<P: VenueProtocol> {
    protocol: P,
    config: AdapterConfig,
    symbols: RwLock<Vec<String>>,
    next_seq: AtomicU64,
}

impl<P: VenueProtocol> WsVenueAdapter<P> {
    pub fn new(protocol: P, config: AdapterConfig) -> Self {
        Self {
            protocol,
            config,
            symbols: RwLock::new(Vec::new()),
            next_seq: AtomicU64::new(1),
        }
    }

    pub fn venue(&self) -> Venue {
        self.protocol.venue()
    }

    /// Request subscription for `symbols`. Idempotent; the remembered set is
    /// used for resubscription on every reconnect.
    pub fn subscribe(&self, symbols: Vec<String>) {
        let mut current = self.symbols.write();
        for s in symbols {
            if !current.contains(&s) {
                current.push(s);
            }
        }
    }

    /// Run the adapter until `stop` fires. Reconnects with exponential
    /// backoff on any transport failure; resets the backoff/attempt counter
    /// on the first successfully processed data message after a (re)connect,
    /// not merely on socket open (spec §4.1).
    pub async fn run(
        self: Arc<Self>,
        events: mpsc::UnboundedSender<AdapterEvent>,
        mut stop: broadcast::Receiver<()>,
    ) {
        let venue = self.venue();
        let mut backoff = self.config.reconnect_initial;
        let mut attempts: u32 = 0;

        loop {
            if stop.try_recv().is_ok() {
                return;
            }

            let symbols = self.symbols.read().clone();
            if symbols.is_empty() {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(200)) => continue,
                    _ = stop.recv() => return,
                }
            }

            match self
                .connect_once(&symbols, &events, &mut stop, &mut backoff, &mut attempts)
                .await
            {
                ConnectOutcome::StoppedGracefully => return,
                ConnectOutcome::Failed(reason) => {
                    let _ = events.send(AdapterEvent::Disconnected {
                        venue,
                        reason: reason.clone(),
                    });
                    warn!(%venue, reason = %reason, "venue adapter disconnected");

                    attempts += 1;
                    if self.config.max_reconnect_attempts != 0
                        && attempts >= self.config.max_reconnect_attempts
                    {
                        error!(%venue, attempts, "exhausted reconnect attempts");
                        return;
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = stop.recv() => return,
            }
            backoff = std::cmp::min(backoff * 2, self.config.reconnect_max);
        }
    }

    async fn connect_once(
        &self,
        symbols: &[String],
        events: &mpsc::UnboundedSender<AdapterEvent>,
        stop: &mut broadcast::Receiver<()>,
        backoff: &mut Duration,
        attempts: &mut u32,
    ) -> ConnectOutcome {
        let venue = self.venue();
        let url = self.protocol.ws_url(symbols);
        info!(%venue, %url, "connecting to venue WebSocket");

        let (ws_stream, _resp) = match connect_async(&url).await {
            Ok(pair) => pair,
            Err(e) => return ConnectOutcome::Failed(e.to_string()),
        };

        info!(%venue, "venue WebSocket connected");

        let (mut write, mut read) = ws_stream.split();

        for sub in self.protocol.subscribe_messages(symbols) {
            if write.send(sub).await.is_err() {
                return ConnectOutcome::Failed("failed to send subscribe message".into());
            }
        }

        let _ = events.send(AdapterEvent::Connected { venue });
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.tick().await; // first tick fires immediately; discard
        let mut last_activity = Instant::now();
        let mut processed_any = false;

        loop {
            tokio::select! {
                _ = stop.recv() => {
                    let _ = write.send(WsMessage::Close(None)).await;
                    return ConnectOutcome::StoppedGracefully;
                }

                _ = heartbeat.tick() => {
                    if last_activity.elapsed() > self.config.heartbeat_interval * 2 {
                        return ConnectOutcome::Failed("heartbeat timeout: no pong/data received".into());
                    }
                    if write.send(self.protocol.ping_message()).await.is_err() {
                        return ConnectOutcome::Failed("failed to send heartbeat ping".into());
                    }
                }

                msg = read.next() => {
                    match msg {
                        Some(Ok(WsMessage::Text(text))) => {
                            last_activity = Instant::now();
                            match self.protocol.parse_message(&text, &self.next_seq) {
                                Ok(parsed) => {
                                    if self.dispatch(parsed, events) && !processed_any {
                                        processed_any = true;
                                        // First data message on this connection: the
                                        // connection is healthy, reset reconnect state
                                        // without tearing the socket down.
                                        *backoff = self.config.reconnect_initial;
                                        *attempts = 0;
                                    }
                                }
                                Err(e) => {
                                    warn!(%venue, error = %e, "failed to parse venue message");
                                    let _ = events.send(AdapterEvent::Error {
                                        venue,
                                        kind: "protocol",
                                        detail: e.to_string(),
                                    });
                                }
                            }
                        }
                        Some(Ok(WsMessage::Pong(_))) => {
                            last_activity = Instant::now();
                        }
                        Some(Ok(WsMessage::Ping(payload))) => {
                            last_activity = Instant::now();
                            let _ = write.send(WsMessage::Pong(payload)).await;
                        }
                        Some(Ok(WsMessage::Close(_))) => {
                            return ConnectOutcome::Failed("venue closed the connection".into());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            return ConnectOutcome::Failed(e.to_string());
                        }
                        None => {
                            return ConnectOutcome::Failed("stream ended".into());
                        }
                    }
                }
            }
        }
    }

    /// Translate parsed wire messages into `AdapterEvent`s. Returns `true`
    /// if at least one normalized event carrying data was dispatched.
    fn dispatch(
        &self,
        parsed: Vec<ParsedMessage>,
        events: &mpsc::UnboundedSender<AdapterEvent>,
    ) -> bool {
        let mut any = false;
        for msg in parsed {
            match msg {
                ParsedMessage::Snapshot(s) => {
                    any = true;
                    let _ = events.send(AdapterEvent::Orderbook(s));
                }
                ParsedMessage::Delta(d) => {
                    any = true;
                    let _ = events.send(AdapterEvent::OrderbookDelta(d));
                }
                ParsedMessage::Trades(t) => {
                    if !t.is_empty() {
                        any = true;
                        let _ = events.send(AdapterEvent::Trades(t));
                    }
                }
                ParsedMessage::Ignored => {}
            }
        }
        any
    }
}

enum ConnectOutcome {
    StoppedGracefully,
    Failed(String),
}

/// Current UNIX timestamp in milliseconds, used when a venue message lacks
/// its own timestamp field.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn coerce_levels_handles_tuple_shape() {
        let value = json!([["100.5", "2.0"], ["100.4", "1.5"]]);
        let levels = coerce_levels(&value);
        assert_eq!(levels, vec![
            ("100.5".to_string(), "2.0".to_string()),
            ("100.4".to_string(), "1.5".to_string()),
        ]);
    }

    #[test]
    fn coerce_levels_handles_object_shape() {
        let value = json!([{"px": "100.5", "sz": "2.0"}]);
        let levels = coerce_levels(&value);
        assert_eq!(levels, vec![("100.5".to_string(), "2.0".to_string())]);
    }

    #[test]
    fn coerce_levels_ignores_malformed_entries() {
        let value = json!([{"foo": "bar"}, ["100.5"]]);
        assert!(coerce_levels(&value).is_empty());
    }
}
