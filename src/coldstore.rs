// =============================================================================
// ColdStore — optional durable read-through for historical candles
// =============================================================================
//
// The source's batch-insert is a documented no-op (spec §9 Open Questions);
// `NullColdStore` preserves that behavior as the default so the core runs
// fully in-memory. A real implementation can be substituted behind the same
// trait without touching `ChartEngine`.
// =============================================================================

use async_trait::async_trait;

use crate::model::{Candle, Timeframe, Venue};

#[async_trait]
pub trait ColdStore: Send + Sync {
    async fn read_candles(
        &self,
        venue: Venue,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> anyhow::Result<Vec<Candle>>;

    async fn write_candles(&self, candles: &[Candle]) -> anyhow::Result<()>;
}

/// Default `ColdStore`: reads return nothing, writes always succeed without
/// doing anything. Matches the source's no-op batch insert.
pub struct NullColdStore;

#[async_trait]
impl ColdStore for NullColdStore {
    async fn read_candles(
        &self,
        _venue: Venue,
        _symbol: &str,
        _timeframe: Timeframe,
        _limit: usize,
    ) -> anyhow::Result<Vec<Candle>> {
        Ok(Vec::new())
    }

    async fn write_candles(&self, _candles: &[Candle]) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_store_reads_empty_and_writes_succeed() {
        let store = NullColdStore;
        let candles = store
            .read_candles(Venue::Hyperliquid, "BTC", Timeframe::M1, 10)
            .await
            .unwrap();
        assert!(candles.is_empty());
        store.write_candles(&[]).await.unwrap();
    }
}
