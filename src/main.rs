// =============================================================================
// Market Aggregator — Main Entry Point
// =============================================================================

mod api;
mod bus;
mod cache;
mod coldstore;
mod config;
mod engines;
mod errors;
mod model;
mod supervisor;
mod venues;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::RuntimeConfig;
use crate::supervisor::Pipeline;

const CONFIG_PATH: &str = "runtime_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("market aggregator starting up");

    let mut config = RuntimeConfig::load_or_default(CONFIG_PATH);

    if let Ok(syms) = std::env::var("AGGREGATOR_SYMBOLS") {
        let symbols: Vec<String> = syms
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
        if !symbols.is_empty() {
            config.symbols = symbols;
        }
    }

    info!(symbols = ?config.symbols, venues = ?config.venues, "runtime configuration loaded");

    let pipeline = Pipeline::new(config.clone());
    pipeline.spawn();

    let bind_addr = std::env::var("AGGREGATOR_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".into());
    let server_pipeline = pipeline.clone();
    tokio::spawn(async move {
        let app = api::rest::router(server_pipeline);
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .expect("failed to bind API server");
        info!(addr = %bind_addr, "API server listening");
        axum::serve(listener, app).await.expect("API server failed");
    });

    info!("all subsystems running, press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");

    pipeline.shutdown().await;

    if let Err(e) = config.save(CONFIG_PATH) {
        warn!(error = %e, "failed to save runtime config on shutdown");
    }

    info!("market aggregator shut down complete");
    Ok(())
}
