//! Candle service: serves historical + forming klines by merging the in-memory store with
//! persisted history, backfilling gaps from the upstream REST API as needed (§4.3).

mod backfill;
mod db;
mod rate_limit;

pub use backfill::{BackfillClient, BackfillError};
pub use db::CandleDb;

use std::sync::Arc;

use anyhow::Result;
use tracing::warn;

use crate::config::Settings;
use crate::model::{interval_ms, Kline};
use crate::store::Store;

pub struct CandleService {
    store: Arc<Store>,
    db: Arc<CandleDb>,
    backfill: BackfillClient,
}

impl CandleService {
    pub fn new(store: Arc<Store>, db: Arc<CandleDb>, settings: &Settings) -> Self {
        let backfill = BackfillClient::new(
            settings.upstream.api_base_url.clone(),
            settings.upstream.backfill_concurrency,
            settings.upstream.backfill_rate_limit_per_minute,
        );
        Self { store, db, backfill }
    }

    /// Returns up to `limit` klines for `symbol`/`interval`, oldest-first, with the
    /// in-memory forming candle (if any) appended last. Backfills from REST when the
    /// persisted history falls short of what was asked for.
    ///
    /// Per §4.3/§7, a rate-limited backfill is the one REST failure mode that must be
    /// surfaced to the caller (as `BackfillError::RateLimited`, mapped to HTTP 429 by the
    /// handler) rather than silently degrading; every other REST failure here is swallowed
    /// into a shorter-than-requested candle list, matching "partial failures are surfaced
    /// as a shorter candle list...not a hard error".
    pub async fn get_candles(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> std::result::Result<Vec<Kline>, BackfillError> {
        let closed_limit = limit.saturating_sub(1).max(1);
        let mut closed = self.db.recent(symbol, interval, closed_limit).await?;

        if closed.len() < closed_limit {
            match self.backfill_gap(symbol, interval, closed_limit).await {
                Ok(()) => {}
                Err(BackfillError::RateLimited { retry_after_secs }) => {
                    return Err(BackfillError::RateLimited { retry_after_secs });
                }
                Err(err) => {
                    warn!("backfill for {symbol}/{interval} failed, serving what is persisted: {err}");
                }
            }
            closed = self.db.recent(symbol, interval, closed_limit).await?;
        }

        let forming = self
            .store
            .get_kline(symbol, interval)
            .and_then(|(current, _)| current);

        let mut result = closed;
        if let Some(forming) = forming {
            result.push(forming);
        }
        if result.len() > limit {
            let excess = result.len() - limit;
            result.drain(0..excess);
        }
        Ok(result)
    }

    /// Persist klines the store has newly closed. The in-memory forming candle always wins
    /// for the current period; everything prior must agree byte-for-byte with what's
    /// already persisted, which `INSERT OR REPLACE` on the `(symbol, interval, open_time)`
    /// key enforces by construction (re-persisting an identical closed kline is a no-op).
    pub async fn persist_closed(&self, kline: &Kline) -> Result<()> {
        if !kline.is_closed {
            return Ok(());
        }
        self.db.upsert(kline).await
    }

    /// Fetch and persist the most recent `target_count` closed candles from REST, used when
    /// the database doesn't yet hold enough history to satisfy a request (cold start, or a
    /// symbol just added).
    async fn backfill_gap(
        &self,
        symbol: &str,
        interval: &str,
        target_count: usize,
    ) -> std::result::Result<(), BackfillError> {
        let period_ms = interval_ms(interval)
            .ok_or_else(|| anyhow::anyhow!("unknown interval {interval}"))?;
        let now_ms = self.latest_known_time(symbol, interval, period_ms);
        let start_ms = now_ms.saturating_sub(period_ms * target_count as u64);

        let fetched = self
            .backfill
            .fetch_range(symbol, interval, start_ms, now_ms)
            .await?;
        if fetched.is_empty() {
            return Ok(());
        }
        self.db.upsert_many(&fetched).await?;
        Ok(())
    }

    fn latest_known_time(&self, symbol: &str, interval: &str, period_ms: u64) -> u64 {
        self.store
            .get_kline(symbol, interval)
            .and_then(|(current, _)| current)
            .map(|k| k.open_time)
            .unwrap_or_else(|| {
                std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or(0)
                    / period_ms
                    * period_ms
            })
    }

    /// Persisted klines within `[start_ms, end_ms]`, ascending. Does not consult the
    /// in-memory forming candle since a caller asking for a bounded historical range
    /// wants closed candles only.
    pub async fn range(&self, symbol: &str, interval: &str, start_ms: u64, end_ms: u64) -> Result<Vec<Kline>> {
        self.db.range(symbol, interval, start_ms, end_ms).await
    }

    pub async fn cleanup_older_than(&self, cutoff_ms: u64) -> Result<()> {
        self.db.cleanup_older_than(cutoff_ms).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ChangeEvent;
    use tokio::sync::mpsc;

    fn sample_kline(open_time: u64) -> Kline {
        Kline {
            symbol: "BTCUSDT".to_string(),
            interval: "1m".to_string(),
            open_time,
            close_time: open_time + 59_999,
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            volume: 10.0,
            taker_buy_volume: 6.0,
            quote_volume: 15.0,
            trade_count: 5,
            is_closed: true,
        }
    }

    #[tokio::test]
    async fn persisted_closed_candles_merge_with_forming_candle_from_store() {
        let (tx, _rx) = mpsc::channel::<ChangeEvent>(16);
        let store = Store::new(tx, vec!["BTCUSDT".to_string()]);
        let db = CandleDb::open(":memory:").await.unwrap();
        db.upsert(&sample_kline(60_000)).await.unwrap();
        db.upsert(&sample_kline(120_000)).await.unwrap();

        let settings = Settings::default();
        let service = CandleService::new(store.clone(), db, &settings);

        let mut forming = sample_kline(180_000);
        forming.is_closed = false;
        store.apply(crate::ingest::IngestEvent::Kline(forming.clone()));

        let candles = service.get_candles("BTCUSDT", "1m", 10).await.unwrap();
        assert_eq!(candles.len(), 3);
        assert_eq!(candles.last().unwrap().open_time, 180_000);
        assert!(!candles.last().unwrap().is_closed);
    }

    #[tokio::test]
    async fn persist_closed_ignores_forming_candles() {
        let (tx, _rx) = mpsc::channel::<ChangeEvent>(16);
        let store = Store::new(tx, vec!["BTCUSDT".to_string()]);
        let db = CandleDb::open(":memory:").await.unwrap();
        let settings = Settings::default();
        let service = CandleService::new(store, db.clone(), &settings);

        let mut forming = sample_kline(60_000);
        forming.is_closed = false;
        service.persist_closed(&forming).await.unwrap();

        assert!(db.recent("BTCUSDT", "1m", 10).await.unwrap().is_empty());
    }
}
