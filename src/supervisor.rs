// =============================================================================
// Supervisor — engine construction, adapter spawning, graceful shutdown
// =============================================================================
//
// Ties the independently-owned engines together: holds one `Arc` of each,
// fans venue adapter events into the right engine, and forwards each
// engine's output on to the next stage by direct call (spec §3 "Ownership"
// — no shared-mutable state across engines, only by-value handoff).
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use crate::bus::{channels, BusEvent, PublishBus};
use crate::cache::{Cache, InMemoryCache};
use crate::coldstore::{ColdStore, NullColdStore};
use crate::config::RuntimeConfig;
use crate::engines::{AggregatedChartEngine, AggregationEngine, ChartEngine, OrderbookEngine, TradeEngine};
use crate::model::{Timeframe, TickData, Venue};
use crate::venues::aster::AsterProtocol;
use crate::venues::avantis::AvantisProtocol;
use crate::venues::hyperliquid::HyperliquidProtocol;
use crate::venues::lighter::LighterProtocol;
use crate::venues::{AdapterConfig, AdapterEvent, WsVenueAdapter};

/// Soft shutdown budget after which remaining I/O is abandoned (spec §5).
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Pipeline {
    pub bus: Arc<PublishBus>,
    pub cache: Arc<dyn Cache>,
    pub cold_store: Arc<dyn ColdStore>,
    pub orderbook: Arc<OrderbookEngine>,
    pub trades: Arc<TradeEngine>,
    pub chart: Arc<ChartEngine>,
    pub aggregation: Arc<AggregationEngine>,
    pub agg_chart: Arc<AggregatedChartEngine>,
    config: RuntimeConfig,
    stop_tx: broadcast::Sender<()>,
}

impl Pipeline {
    pub fn new(config: RuntimeConfig) -> Arc<Self> {
        let bus = Arc::new(PublishBus::new());
        let cache: Arc<dyn Cache> = Arc::new(InMemoryCache::new());
        let cold_store: Arc<dyn ColdStore> = Arc::new(NullColdStore);
        let (stop_tx, _) = broadcast::channel(1);

        Arc::new(Self {
            orderbook: Arc::new(OrderbookEngine::new(
                bus.clone(),
                cache.clone(),
                config.cache_ttl.orderbook(),
                config.cache_ttl.orderbook_snapshot(),
            )),
            trades: Arc::new(TradeEngine::new(bus.clone(), cache.clone(), config.cache_ttl.recent_trades())),
            chart: Arc::new(ChartEngine::new(
                bus.clone(),
                cache.clone(),
                cold_store.clone(),
                config.cache_ttl.candles(),
                config.candle_batch_size,
                config.candle_batch_interval(),
            )),
            aggregation: Arc::new(AggregationEngine::with_config(
                bus.clone(),
                cache.clone(),
                Duration::from_millis(config.agg_throttle_ms),
                config.cache_ttl.agg_book(),
                config.cache_ttl.agg_routing(),
            )),
            agg_chart: Arc::new(AggregatedChartEngine::new(bus.clone(), cache.clone(), config.cache_ttl.candles())),
            bus,
            cache,
            cold_store,
            config,
            stop_tx,
        })
    }

    /// Spawn every venue adapter plus the event-fanout and periodic
    /// maintenance tasks. Returns once all tasks are running; the caller
    /// awaits `wait_for_shutdown` separately.
    pub fn spawn(self: &Arc<Self>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel::<AdapterEvent>();
        let adapter_config = AdapterConfig {
            heartbeat_interval: Duration::from_millis(self.config.heartbeat_interval_ms),
            reconnect_initial: Duration::from_millis(self.config.reconnect_initial_ms),
            reconnect_max: Duration::from_millis(self.config.reconnect_max_ms),
            max_reconnect_attempts: self.config.max_reconnect_attempts,
        };

        for venue in &self.config.venues {
            self.spawn_adapter(*venue, adapter_config.clone(), events_tx.clone());
        }

        tokio::spawn(self.clone().run_event_fanout(events_rx));
        tokio::spawn(self.orderbook.clone().run_periodic_cache_refresh(self.stop_tx.subscribe()));
        tokio::spawn(self.trades.clone().run_retention_sweep(self.stop_tx.subscribe()));
        tokio::spawn(self.chart.clone().run_batch_drain(self.stop_tx.subscribe()));

        for symbol in self.config.symbols.clone() {
            for timeframe in Timeframe::ALL {
                for venue in Venue::ALL {
                    self.spawn_candle_forwarder(venue, symbol.clone(), timeframe);
                }
            }
        }
    }

    /// Subscribe to one venue's per-symbol/timeframe candle channel and
    /// forward every update into the cross-venue chart engine. Kept as a
    /// bus subscription rather than a direct call from `ChartEngine` so the
    /// two engines stay decoupled (spec §5 — no engine holds a reference to
    /// another engine).
    fn spawn_candle_forwarder(self: &Arc<Self>, venue: Venue, symbol: String, timeframe: Timeframe) {
        let mut rx = self.bus.subscribe(&channels::candles(venue, &symbol, timeframe));
        let agg_chart = self.agg_chart.clone();
        let mut stop = self.stop_tx.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = rx.recv() => {
                        match event {
                            Ok(event) => {
                                if let BusEvent::Candle { candle, update_kind } = event.as_ref().clone() {
                                    agg_chart.process_candle_update(candle, update_kind);
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(broadcast::error::RecvError::Closed) => return,
                        }
                    }
                    _ = stop.recv() => return,
                }
            }
        });
    }

    fn spawn_adapter(
        self: &Arc<Self>,
        venue: Venue,
        adapter_config: AdapterConfig,
        events_tx: mpsc::UnboundedSender<AdapterEvent>,
    ) {
        let symbols = self.config.symbols.clone();
        let stop_rx = self.stop_tx.subscribe();

        macro_rules! spawn_protocol {
            ($protocol:expr) => {{
                let adapter = Arc::new(WsVenueAdapter::new($protocol, adapter_config));
                adapter.subscribe(symbols);
                tokio::spawn(adapter.run(events_tx, stop_rx));
            }};
        }

        match venue {
            Venue::Hyperliquid => spawn_protocol!(HyperliquidProtocol),
            Venue::Aster => spawn_protocol!(AsterProtocol),
            Venue::Lighter => spawn_protocol!(LighterProtocol),
            Venue::Avantis => spawn_protocol!(AvantisProtocol),
        }
    }

    /// Drain adapter events, routing each into the engine(s) it feeds, and
    /// forward each engine's output on to the next stage by direct call.
    async fn run_event_fanout(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<AdapterEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                AdapterEvent::Connected { venue } => info!(%venue, "venue connected"),
                AdapterEvent::Disconnected { venue, reason } => warn!(%venue, %reason, "venue disconnected"),
                AdapterEvent::Error { venue, kind, detail } => warn!(%venue, kind, %detail, "venue adapter error"),
                AdapterEvent::Orderbook(snapshot) => {
                    let projection = self.orderbook.process_snapshot(snapshot);
                    self.on_orderbook_update(projection);
                }
                AdapterEvent::OrderbookDelta(delta) => {
                    if let Some(projection) = self.orderbook.process_update(delta) {
                        self.on_orderbook_update(projection);
                    }
                }
                AdapterEvent::Trades(trades) => {
                    for trade in &trades {
                        let tick = TickData {
                            venue: trade.venue,
                            symbol: trade.symbol.clone(),
                            price: trade.price.clone(),
                            size: trade.size.clone(),
                            side: Some(trade.side),
                            ts: trade.ts,
                            trade_id: Some(trade.id.clone()),
                        };
                        self.chart.process_tick_data(tick);
                    }
                    self.trades.record_trades(trades);
                }
            }
        }
    }

    /// A fresh per-venue orderbook projection feeds both the aggregation
    /// engine and the chart engine's synthetic midpoint tick (spec §4.4,
    /// §8 S6): every book update produces a zero-size tick so candles stay
    /// current even on symbols with no recent trade.
    fn on_orderbook_update(&self, projection: crate::model::Orderbook) {
        if projection.mid_price > 0.0 {
            let tick = TickData::midpoint(
                projection.venue,
                projection.symbol.clone(),
                projection.mid_price,
                projection.ts,
            );
            self.chart.process_tick_data(tick);
        }
        self.aggregation.process_orderbook_update(projection);
    }

    /// Broadcast the stop signal, flush in-flight chart builders, and give
    /// outstanding I/O a bounded window to wind down (spec §5 Cancellation).
    pub async fn shutdown(&self) {
        info!("pipeline shutdown initiated");
        let _ = self.stop_tx.send(());
        self.chart.force_complete_all_candles();
        tokio::time::sleep(SHUTDOWN_TIMEOUT).await;
        info!("pipeline shutdown complete");
    }
}
