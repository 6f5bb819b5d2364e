// =============================================================================
// WebSocket Handler — PublishBus event re-publication
// =============================================================================
//
// Clients connect to `/api/v1/ws?symbol=BTC[&venue=hyperliquid]` and receive
// every bus event for that symbol as a JSON envelope `{channel, data,
// timestamp}` (spec §6), for as long as the connection stays open. Unlike a
// poll-on-version-change snapshot feed, each event is forwarded the moment
// it is published — the bus already gives us at-most-once fan-out per
// subscriber (spec §4.7), so there is no separate diffing step to do here.
// =============================================================================

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::bus::{channels, BusEvent, PublishBus};
use crate::model::{Timeframe, Venue};
use crate::supervisor::Pipeline;

#[derive(Deserialize)]
pub struct WsQuery {
    symbol: String,
    venue: Option<String>,
}

/// Axum handler for the WebSocket upgrade request.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(pipeline): State<Arc<Pipeline>>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let venue = match query.venue.as_deref().map(str::parse::<Venue>) {
        Some(Ok(v)) => Some(v),
        Some(Err(e)) => {
            warn!(error = %e, "WebSocket connection rejected: invalid venue");
            return (axum::http::StatusCode::BAD_REQUEST, "Invalid venue").into_response();
        }
        None => None,
    };

    info!(symbol = %query.symbol, ?venue, "WebSocket connection accepted — upgrading");
    ws.on_upgrade(move |socket| handle_ws_connection(socket, pipeline, query.symbol, venue))
        .into_response()
}

/// Subscribe to every bus channel relevant to `symbol` (and `venue`, if
/// given) and forward each event as a JSON text frame until the client
/// disconnects or the pipeline shuts down.
async fn handle_ws_connection(socket: WebSocket, pipeline: Arc<Pipeline>, symbol: String, venue: Option<Venue>) {
    let (mut sender, mut receiver) = socket.split();

    let mut channel_names: Vec<String> = vec![channels::aggregated_book(&symbol), channels::agg_routing(&symbol)];
    for timeframe in Timeframe::ALL {
        channel_names.push(channels::agg_candles(&symbol, timeframe));
    }
    if let Some(v) = venue {
        channel_names.push(channels::orderbook(v, &symbol));
        channel_names.push(channels::trades(v, &symbol));
        for timeframe in Timeframe::ALL {
            channel_names.push(channels::candles(v, &symbol, timeframe));
        }
    }

    let (event_tx, mut event_rx) = tokio::sync::mpsc::unbounded_channel::<(String, Arc<BusEvent>)>();
    for name in &channel_names {
        spawn_channel_relay(&pipeline.bus, name, event_tx.clone());
    }
    drop(event_tx);

    loop {
        tokio::select! {
            event = event_rx.recv() => {
                let Some((channel, event)) = event else { break };
                let envelope = PublishBus::envelope(&channel, &event);
                match serde_json::to_string(&envelope) {
                    Ok(json) => {
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to serialize bus event for WebSocket"),
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        debug!(msg = %text, "WebSocket text message received (heartbeat)");
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        info!("WebSocket Close frame received — disconnecting");
                        break;
                    }
                    Some(Ok(Message::Binary(_))) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket receive error — disconnecting");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    info!(%symbol, ?venue, "WebSocket connection closed");
}

/// Drain one bus channel onto a shared forwarding queue. Each relay task
/// dies quietly when the bus channel is dropped or the client disconnects.
fn spawn_channel_relay(
    bus: &PublishBus,
    channel: &str,
    out: tokio::sync::mpsc::UnboundedSender<(String, Arc<BusEvent>)>,
) {
    let mut rx = bus.subscribe(channel);
    let channel = channel.to_string();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if out.send((channel.clone(), event)).is_err() {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    });
}
