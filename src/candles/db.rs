use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::model::Kline;

/// Closed-kline persistence. Generalized from the teacher's `DatabaseManager`'s fixed
/// 1m/5m/15m `candles` table (`data::database`) to an arbitrary `interval` string keyed
/// by `(symbol, interval, open_time)`.
pub struct CandleDb {
    connection: Arc<Mutex<Connection>>,
}

impl CandleDb {
    pub async fn open(path: &str) -> Result<Arc<Self>> {
        let conn = Connection::open(path).context("failed to open candle database")?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "cache_size", 10000)?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS candles (
                symbol TEXT NOT NULL,
                interval TEXT NOT NULL,
                open_time INTEGER NOT NULL,
                close_time INTEGER NOT NULL,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                volume REAL NOT NULL,
                taker_buy_volume REAL NOT NULL,
                quote_volume REAL NOT NULL,
                trade_count INTEGER NOT NULL,
                UNIQUE(symbol, interval, open_time)
            )
            "#,
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_candles_lookup ON candles(symbol, interval, open_time)",
            [],
        )?;

        info!("candle database ready at {path}");
        Ok(Arc::new(Self {
            connection: Arc::new(Mutex::new(conn)),
        }))
    }

    pub async fn upsert(&self, kline: &Kline) -> Result<()> {
        let conn = self.connection.lock().await;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO candles
            (symbol, interval, open_time, close_time, open, high, low, close,
             volume, taker_buy_volume, quote_volume, trade_count)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                kline.symbol,
                kline.interval,
                kline.open_time,
                kline.close_time,
                kline.open,
                kline.high,
                kline.low,
                kline.close,
                kline.volume,
                kline.taker_buy_volume,
                kline.quote_volume,
                kline.trade_count,
            ],
        )?;
        Ok(())
    }

    pub async fn upsert_many(&self, klines: &[Kline]) -> Result<()> {
        let conn = self.connection.lock().await;
        for kline in klines {
            conn.execute(
                r#"
                INSERT OR REPLACE INTO candles
                (symbol, interval, open_time, close_time, open, high, low, close,
                 volume, taker_buy_volume, quote_volume, trade_count)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                "#,
                params![
                    kline.symbol,
                    kline.interval,
                    kline.open_time,
                    kline.close_time,
                    kline.open,
                    kline.high,
                    kline.low,
                    kline.close,
                    kline.volume,
                    kline.taker_buy_volume,
                    kline.quote_volume,
                    kline.trade_count,
                ],
            )?;
        }
        Ok(())
    }

    pub async fn recent(&self, symbol: &str, interval: &str, limit: usize) -> Result<Vec<Kline>> {
        let conn = self.connection.lock().await;
        let mut stmt = conn.prepare(
            r#"
            SELECT symbol, interval, open_time, close_time, open, high, low, close,
                   volume, taker_buy_volume, quote_volume, trade_count
            FROM candles
            WHERE symbol = ?1 AND interval = ?2
            ORDER BY open_time DESC
            LIMIT ?3
            "#,
        )?;

        let rows = stmt.query_map(params![symbol, interval, limit as i64], row_to_kline)?;
        let mut klines = Vec::new();
        for row in rows {
            klines.push(row?);
        }
        klines.reverse();
        Ok(klines)
    }

    pub async fn range(
        &self,
        symbol: &str,
        interval: &str,
        start_ms: u64,
        end_ms: u64,
    ) -> Result<Vec<Kline>> {
        let conn = self.connection.lock().await;
        let mut stmt = conn.prepare(
            r#"
            SELECT symbol, interval, open_time, close_time, open, high, low, close,
                   volume, taker_buy_volume, quote_volume, trade_count
            FROM candles
            WHERE symbol = ?1 AND interval = ?2 AND open_time >= ?3 AND open_time <= ?4
            ORDER BY open_time ASC
            "#,
        )?;

        let rows = stmt.query_map(params![symbol, interval, start_ms, end_ms], row_to_kline)?;
        let mut klines = Vec::new();
        for row in rows {
            klines.push(row?);
        }
        Ok(klines)
    }

    pub async fn cleanup_older_than(&self, cutoff_ms: u64) -> Result<()> {
        let conn = self.connection.lock().await;
        conn.execute("DELETE FROM candles WHERE open_time < ?1", params![cutoff_ms])?;
        Ok(())
    }
}

fn row_to_kline(row: &rusqlite::Row) -> rusqlite::Result<Kline> {
    Ok(Kline {
        symbol: row.get(0)?,
        interval: row.get(1)?,
        open_time: row.get::<_, i64>(2)? as u64,
        close_time: row.get::<_, i64>(3)? as u64,
        open: row.get(4)?,
        high: row.get(5)?,
        low: row.get(6)?,
        close: row.get(7)?,
        volume: row.get(8)?,
        taker_buy_volume: row.get(9)?,
        quote_volume: row.get(10)?,
        trade_count: row.get::<_, i64>(11)? as u64,
        is_closed: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

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
    async fn upsert_then_read_back_round_trips() {
        let db = CandleDb::open(":memory:").await.unwrap();
        db.upsert(&sample_kline(60_000)).await.unwrap();
        db.upsert(&sample_kline(120_000)).await.unwrap();

        let rows = db.recent("BTCUSDT", "1m", 10).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].open_time, 60_000);
        assert_eq!(rows[1].open_time, 120_000);
    }

    #[tokio::test]
    async fn upsert_is_idempotent_on_the_unique_key() {
        let db = CandleDb::open(":memory:").await.unwrap();
        db.upsert(&sample_kline(60_000)).await.unwrap();
        let mut updated = sample_kline(60_000);
        updated.close = 9.0;
        db.upsert(&updated).await.unwrap();

        let rows = db.recent("BTCUSDT", "1m", 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].close, 9.0);
    }
}
