// =============================================================================
// RuntimeConfig — hot-reloadable pipeline settings with atomic save
// =============================================================================
//
// Every tunable lives here so the pipeline can be reconfigured without a
// restart. All fields carry `#[serde(default)]` so that adding a new field
// never breaks loading an older config file. Persistence uses an atomic
// tmp+rename pattern to avoid corruption on crash.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::model::Venue;

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_reconnect_initial_ms() -> u64 {
    5_000
}

fn default_reconnect_max_ms() -> u64 {
    60_000
}

fn default_max_reconnect_attempts() -> u32 {
    0
}

fn default_agg_throttle_ms() -> u64 {
    50
}

fn default_candle_batch_size() -> usize {
    100
}

fn default_candle_batch_interval_ms() -> u64 {
    10_000
}

fn default_symbols() -> Vec<String> {
    vec!["BTC".to_string(), "ETH".to_string(), "SOL".to_string()]
}

fn default_venues() -> Vec<Venue> {
    Venue::ALL.to_vec()
}

/// Per-stream cache TTLs, overridable independently (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheTtlConfig {
    #[serde(default = "default_orderbook_ttl_s")]
    pub orderbook_ttl_s: u64,
    #[serde(default = "default_orderbook_ttl_s")]
    pub orderbook_snapshot_ttl_s: u64,
    #[serde(default = "default_recent_trades_ttl_s")]
    pub recent_trades_ttl_s: u64,
    #[serde(default = "default_candles_ttl_s")]
    pub candles_ttl_s: u64,
    #[serde(default = "default_agg_book_ttl_s")]
    pub agg_book_ttl_s: u64,
    #[serde(default = "default_agg_routing_ttl_s")]
    pub agg_routing_ttl_s: u64,
}

fn default_orderbook_ttl_s() -> u64 {
    30
}
fn default_recent_trades_ttl_s() -> u64 {
    300
}
fn default_candles_ttl_s() -> u64 {
    3_600
}
fn default_agg_book_ttl_s() -> u64 {
    60
}
fn default_agg_routing_ttl_s() -> u64 {
    1
}

impl Default for CacheTtlConfig {
    fn default() -> Self {
        Self {
            orderbook_ttl_s: default_orderbook_ttl_s(),
            orderbook_snapshot_ttl_s: default_orderbook_ttl_s(),
            recent_trades_ttl_s: default_recent_trades_ttl_s(),
            candles_ttl_s: default_candles_ttl_s(),
            agg_book_ttl_s: default_agg_book_ttl_s(),
            agg_routing_ttl_s: default_agg_routing_ttl_s(),
        }
    }
}

impl CacheTtlConfig {
    pub fn orderbook(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.orderbook_ttl_s)
    }
    pub fn orderbook_snapshot(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.orderbook_snapshot_ttl_s)
    }
    pub fn recent_trades(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.recent_trades_ttl_s)
    }
    pub fn candles(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.candles_ttl_s)
    }
    pub fn agg_book(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.agg_book_ttl_s)
    }
    pub fn agg_routing(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.agg_routing_ttl_s)
    }
}

/// Top-level runtime configuration for the aggregation pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Symbols tracked across all configured venues.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Venues the pipeline connects to.
    #[serde(default = "default_venues")]
    pub venues: Vec<Venue>,

    /// Venue WebSocket ping interval.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Initial reconnect backoff.
    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,

    /// Reconnect backoff cap.
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,

    /// 0 = unlimited reconnect attempts.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Minimum interval between `aggregated.book.<symbol>` publications.
    #[serde(default = "default_agg_throttle_ms")]
    pub agg_throttle_ms: u64,

    /// Candle batch buffer size, drained to the cold store periodically.
    #[serde(default = "default_candle_batch_size")]
    pub candle_batch_size: usize,

    /// Candle batch drain interval.
    #[serde(default = "default_candle_batch_interval_ms")]
    pub candle_batch_interval_ms: u64,

    #[serde(default)]
    pub cache_ttl: CacheTtlConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            venues: default_venues(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            agg_throttle_ms: default_agg_throttle_ms(),
            candle_batch_size: default_candle_batch_size(),
            candle_batch_interval_ms: default_candle_batch_interval_ms(),
            cache_ttl: CacheTtlConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`. Callers typically fall
    /// back to `Default` with a warning when this errors.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(path = %path.display(), symbols = ?config.symbols, "runtime config loaded");

        Ok(config)
    }

    /// Load from `path`, falling back to defaults on any error.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        Self::load(path).unwrap_or_else(|e| {
            warn!(error = %e, "failed to load runtime config, using defaults");
            Self::default()
        })
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename), preventing corruption on crash.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    pub fn candle_batch_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.candle_batch_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.heartbeat_interval_ms, 30_000);
        assert_eq!(cfg.reconnect_initial_ms, 5_000);
        assert_eq!(cfg.reconnect_max_ms, 60_000);
        assert_eq!(cfg.max_reconnect_attempts, 0);
        assert_eq!(cfg.agg_throttle_ms, 50);
        assert_eq!(cfg.candle_batch_size, 100);
        assert_eq!(cfg.venues.len(), 4);
    }

    #[test]
    fn deserialize_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.symbols, default_symbols());
        assert_eq!(cfg.cache_ttl.agg_routing_ttl_s, 1);
    }

    #[test]
    fn deserialize_partial_json_fills_defaults() {
        let json = r#"{ "symbols": ["XRP"], "agg_throttle_ms": 100 }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.symbols, vec!["XRP"]);
        assert_eq!(cfg.agg_throttle_ms, 100);
        assert_eq!(cfg.heartbeat_interval_ms, 30_000);
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = std::env::temp_dir().join(format!("rtconfig-test-{:?}", std::thread::current().id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("runtime_config.json");

        let mut cfg = RuntimeConfig::default();
        cfg.symbols = vec!["BTC".to_string(), "DOGE".to_string()];
        cfg.save(&path).unwrap();

        let loaded = RuntimeConfig::load(&path).unwrap();
        assert_eq!(loaded.symbols, cfg.symbols);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
