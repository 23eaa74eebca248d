// =============================================================================
// Candle Repository — durable candle store, unique per (symbol, tf, bucket)
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::params;

use crate::market_data::Candle;
use crate::store::{parse_dec, parse_dt, parse_text, Db};
use crate::types::Timeframe;

/// Repository over the `candles` table. Upserts are idempotent under replay:
/// re-inserting a bucket overwrites it with identical data.
#[derive(Clone)]
pub struct CandleRepo {
    db: Arc<Db>,
}

impl CandleRepo {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    /// Insert or replace the candle for its `(symbol, timeframe,
    /// bucket_start)` identity. Malformed OHLC is refused so broker
    /// backfills cannot poison the store.
    pub fn upsert(&self, candle: &Candle) -> Result<()> {
        anyhow::ensure!(
            candle.is_well_formed(),
            "malformed candle for {} {} at {}",
            candle.symbol,
            candle.timeframe,
            candle.bucket_start
        );
        self.db.with(|conn| {
            conn.execute(
                "INSERT INTO candles
                    (symbol, timeframe, bucket_start, open, high, low, close, volume, closed)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT (symbol, timeframe, bucket_start) DO UPDATE SET
                    open = excluded.open,
                    high = excluded.high,
                    low = excluded.low,
                    close = excluded.close,
                    volume = excluded.volume,
                    closed = excluded.closed",
                params![
                    candle.symbol,
                    candle.timeframe.as_str(),
                    candle.bucket_start.to_rfc3339(),
                    candle.open.to_string(),
                    candle.high.to_string(),
                    candle.low.to_string(),
                    candle.close.to_string(),
                    candle.volume,
                    candle.closed as i64,
                ],
            )
            .context("failed to upsert candle")?;
            Ok(())
        })
    }

    /// Most recent `limit` closed candles, oldest first.
    pub fn recent_closed(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        self.db.with(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT symbol, timeframe, bucket_start, open, high, low, close, volume, closed
                     FROM candles
                     WHERE symbol = ?1 AND timeframe = ?2 AND closed = 1
                     ORDER BY bucket_start DESC
                     LIMIT ?3",
                )
                .context("failed to prepare candle query")?;

            let rows = stmt
                .query_map(params![symbol, timeframe.as_str(), limit as i64], row_to_candle)
                .context("failed to query candles")?;

            let mut out: Vec<Candle> = rows.collect::<rusqlite::Result<_>>()?;
            out.reverse();
            Ok(out)
        })
    }

    /// Number of closed candles stored for `(symbol, timeframe)`.
    pub fn count_closed(&self, symbol: &str, timeframe: Timeframe) -> Result<i64> {
        self.db.with(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM candles WHERE symbol = ?1 AND timeframe = ?2 AND closed = 1",
                params![symbol, timeframe.as_str()],
                |row| row.get(0),
            )?)
        })
    }
}

fn row_to_candle(row: &rusqlite::Row<'_>) -> rusqlite::Result<Candle> {
    Ok(Candle {
        symbol: row.get(0)?,
        timeframe: parse_text(row.get::<_, String>(1)?)?,
        bucket_start: parse_dt(row.get(2)?)?,
        open: parse_dec(row.get(3)?)?,
        high: parse_dec(row.get(4)?)?,
        low: parse_dec(row.get(5)?)?,
        close: parse_dec(row.get(6)?)?,
        volume: row.get(7)?,
        closed: row.get::<_, i64>(8)? != 0,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, Utc};
    use rust_decimal_macros::dec;

    fn candle(idx: i64, closed: bool) -> Candle {
        let base = DateTime::<Utc>::from_timestamp(1_718_163_900, 0).unwrap();
        Candle {
            symbol: "INFY".to_string(),
            timeframe: Timeframe::M1,
            bucket_start: base + Duration::minutes(idx),
            open: dec!(1500),
            high: dec!(1505),
            low: dec!(1498),
            close: Decimal::from(1500 + idx),
            volume: 100,
            closed,
        }
    }

    use rust_decimal::Decimal;

    #[test]
    fn upsert_is_idempotent() {
        let repo = CandleRepo::new(Arc::new(Db::open_in_memory().unwrap()));
        let c = candle(0, true);
        repo.upsert(&c).unwrap();
        repo.upsert(&c).unwrap();
        assert_eq!(repo.count_closed("INFY", Timeframe::M1).unwrap(), 1);
    }

    #[test]
    fn upsert_replaces_on_conflict() {
        let repo = CandleRepo::new(Arc::new(Db::open_in_memory().unwrap()));
        let mut c = candle(0, false);
        repo.upsert(&c).unwrap();
        c.high = dec!(1512);
        c.close = dec!(1510);
        c.closed = true;
        repo.upsert(&c).unwrap();

        let got = repo.recent_closed("INFY", Timeframe::M1, 10).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].close, dec!(1510));
        assert!(got[0].closed);
    }

    #[test]
    fn malformed_candle_is_refused() {
        let repo = CandleRepo::new(Arc::new(Db::open_in_memory().unwrap()));
        let mut c = candle(0, true);
        c.high = dec!(1490); // below the low
        assert!(repo.upsert(&c).is_err());
        assert_eq!(repo.count_closed("INFY", Timeframe::M1).unwrap(), 0);
    }

    #[test]
    fn recent_closed_is_oldest_first_and_limited() {
        let repo = CandleRepo::new(Arc::new(Db::open_in_memory().unwrap()));
        for i in 0..5 {
            repo.upsert(&candle(i, true)).unwrap();
        }
        repo.upsert(&candle(5, false)).unwrap(); // open candle excluded

        let got = repo.recent_closed("INFY", Timeframe::M1, 3).unwrap();
        assert_eq!(got.len(), 3);
        assert!(got[0].bucket_start < got[1].bucket_start);
        assert_eq!(got[2].close, Decimal::from(1504));
    }
}
