// =============================================================================
// Market data — price cache and session-aligned candle aggregation
// =============================================================================

pub mod aggregator;
pub mod price_cache;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::Timeframe;

/// A single OHLCV candle. Identity is `(symbol, timeframe, bucket_start)`;
/// the bucket start is session-aligned. A candle is immutable once closed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub bucket_start: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: i64,
    pub closed: bool,
}

impl Candle {
    /// OHLC sanity: high dominates open/close/low, low is dominated.
    pub fn is_well_formed(&self) -> bool {
        self.high >= self.open.max(self.close).max(self.low)
            && self.low <= self.open.min(self.close).min(self.high)
    }
}
