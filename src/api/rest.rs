// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// A read-only facade over the pipeline's engines and cache. Every route is
// public: this is a market-data feed, not a trading surface, so there is no
// bearer-token gate here (spec §1 Non-goals — no credential/wallet
// handling).
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};

use crate::engines::trades::{TradeFilter, Window};
use crate::model::{Side, Timeframe, Venue};
use crate::supervisor::Pipeline;

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(pipeline: Arc<Pipeline>) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/orderbook/:venue/:symbol", get(orderbook))
        .route("/api/v1/orderbook/:venue/:symbol/impact", get(price_impact))
        .route("/api/v1/trades/:venue/:symbol", get(recent_trades))
        .route("/api/v1/trades/:venue/:symbol/metrics", get(trade_metrics))
        .route("/api/v1/candles/:venue/:symbol/:timeframe", get(candle))
        .route("/api/v1/aggregated/:symbol", get(aggregated_book))
        .route("/api/v1/routing/:symbol", get(routing))
        .route("/api/v1/aggregated-candles/:symbol/:timeframe", get(aggregated_candle))
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(pipeline)
}

#[derive(serde::Serialize)]
struct HealthResponse {
    status: &'static str,
    server_time: i64,
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

fn parse_venue(raw: &str) -> Result<Venue, (StatusCode, Json<serde_json::Value>)> {
    raw.parse::<Venue>()
        .map_err(|e| (StatusCode::BAD_REQUEST, Json(serde_json::json!({ "error": e.to_string() }))))
}

fn parse_timeframe(raw: &str) -> Result<Timeframe, (StatusCode, Json<serde_json::Value>)> {
    raw.parse::<Timeframe>()
        .map_err(|e| (StatusCode::BAD_REQUEST, Json(serde_json::json!({ "error": e.to_string() }))))
}

fn not_found() -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::NOT_FOUND, Json(serde_json::json!({ "error": "not found" })))
}

// ── Orderbook ────────────────────────────────────────────────────────────

async fn orderbook(
    State(pipeline): State<Arc<Pipeline>>,
    Path((venue, symbol)): Path<(String, String)>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let venue = parse_venue(&venue)?;
    pipeline.orderbook.orderbook(venue, &symbol).map(Json).ok_or_else(not_found)
}

#[derive(Deserialize)]
struct ImpactQuery {
    side: String,
    size: f64,
}

async fn price_impact(
    State(pipeline): State<Arc<Pipeline>>,
    Path((venue, symbol)): Path<(String, String)>,
    Query(query): Query<ImpactQuery>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let venue = parse_venue(&venue)?;
    let buy = match query.side.to_ascii_lowercase().as_str() {
        "buy" => true,
        "sell" => false,
        other => {
            return Err((
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": format!("invalid side: '{other}', use 'buy' or 'sell'") })),
            ))
        }
    };
    pipeline
        .orderbook
        .calculate_price_impact(venue, &symbol, buy, query.size)
        .map(Json)
        .ok_or_else(not_found)
}

// ── Trades ───────────────────────────────────────────────────────────────

#[derive(Deserialize, Default)]
struct RecentTradesQuery {
    side: Option<String>,
    min_price: Option<f64>,
    max_price: Option<f64>,
    min_size: Option<f64>,
    max_size: Option<f64>,
    since_ts: Option<i64>,
}

async fn recent_trades(
    State(pipeline): State<Arc<Pipeline>>,
    Path((venue, symbol)): Path<(String, String)>,
    Query(query): Query<RecentTradesQuery>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let venue = parse_venue(&venue)?;
    let side = match query.side.as_deref() {
        Some("buy") => Some(Side::Buy),
        Some("sell") => Some(Side::Sell),
        Some(other) => {
            return Err((
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": format!("invalid side: '{other}'") })),
            ))
        }
        None => None,
    };
    let filter = TradeFilter {
        side,
        min_price: query.min_price,
        max_price: query.max_price,
        min_size: query.min_size,
        max_size: query.max_size,
        since_ts: query.since_ts,
    };
    Ok(Json(pipeline.trades.recent_trades(venue, &symbol, &filter)))
}

#[derive(Deserialize)]
struct MetricsQuery {
    window: String,
}

async fn trade_metrics(
    State(pipeline): State<Arc<Pipeline>>,
    Path((venue, symbol)): Path<(String, String)>,
    Query(query): Query<MetricsQuery>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let venue = parse_venue(&venue)?;
    let window = match query.window.as_str() {
        "1m" => Window::M1,
        "5m" => Window::M5,
        "15m" => Window::M15,
        "1h" => Window::H1,
        "4h" => Window::H4,
        "1d" => Window::D1,
        other => {
            return Err((
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": format!("invalid window: '{other}'") })),
            ))
        }
    };
    pipeline.trades.metrics(venue, &symbol, window).map(Json).ok_or_else(not_found)
}

// ── Candles (read through the cache, matching spec §6's cache/KV surface) ─

async fn candle(
    State(pipeline): State<Arc<Pipeline>>,
    Path((venue, symbol, timeframe)): Path<(String, String, String)>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let venue = parse_venue(&venue)?;
    let timeframe = parse_timeframe(&timeframe)?;
    cached_json(&pipeline, &format!("candles:{venue}:{symbol}:{timeframe}"))
}

async fn aggregated_candle(
    State(pipeline): State<Arc<Pipeline>>,
    Path((symbol, timeframe)): Path<(String, String)>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let timeframe = parse_timeframe(&timeframe)?;
    cached_json(&pipeline, &format!("agg.candles:{symbol}:{timeframe}"))
}

// ── Aggregated book + routing ────────────────────────────────────────────

async fn aggregated_book(
    State(pipeline): State<Arc<Pipeline>>,
    Path(symbol): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    cached_json(&pipeline, &format!("agg.book:{symbol}"))
}

async fn routing(
    State(pipeline): State<Arc<Pipeline>>,
    Path(symbol): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    cached_json(&pipeline, &format!("agg.routing:{symbol}"))
}

fn cached_json(pipeline: &Pipeline, key: &str) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let bytes = pipeline.cache.get(key).ok_or_else(not_found)?;
    let value: serde_json::Value = serde_json::from_slice(&bytes)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({ "error": e.to_string() }))))?;
    Ok(Json(value))
}
