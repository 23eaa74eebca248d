// =============================================================================
// Price Cache — hot map of symbol → latest (price, timestamp)
// =============================================================================
//
// Writes are last-writer-wins per symbol; readers take a cheap shared lock
// and never see a torn (price, timestamp) pair. No backpressure: the cache
// always reflects the most recent tick that reached it.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::types::Tick;

/// Latest observed price for a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PricePoint {
    pub ltp: Decimal,
    pub ts: DateTime<Utc>,
}

/// Thread-safe cache of the latest price per symbol.
#[derive(Default)]
pub struct PriceCache {
    inner: RwLock<HashMap<String, PricePoint>>,
}

impl PriceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a tick. Last writer wins per symbol.
    pub fn update(&self, tick: &Tick) {
        self.inner.write().insert(
            tick.symbol.clone(),
            PricePoint {
                ltp: tick.ltp,
                ts: tick.ts,
            },
        );
    }

    /// Latest price point for `symbol`, if any tick has been seen.
    pub fn get(&self, symbol: &str) -> Option<PricePoint> {
        self.inner.read().get(symbol).copied()
    }

    /// Latest price alone.
    pub fn ltp(&self, symbol: &str) -> Option<Decimal> {
        self.get(symbol).map(|p| p.ltp)
    }

    /// Snapshot of every tracked symbol.
    pub fn snapshot(&self) -> HashMap<String, PricePoint> {
        self.inner.read().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn tick(symbol: &str, ltp: Decimal, secs: i64) -> Tick {
        Tick {
            symbol: symbol.to_string(),
            ltp,
            volume: 10,
            ts: DateTime::<Utc>::from_timestamp(1_700_000_000 + secs, 0).unwrap(),
        }
    }

    #[test]
    fn last_writer_wins() {
        let cache = PriceCache::new();
        cache.update(&tick("RELIANCE", dec!(2900.50), 0));
        cache.update(&tick("RELIANCE", dec!(2901.25), 1));

        let point = cache.get("RELIANCE").unwrap();
        assert_eq!(point.ltp, dec!(2901.25));
    }

    #[test]
    fn unknown_symbol_is_none() {
        let cache = PriceCache::new();
        assert!(cache.get("TCS").is_none());
        assert!(cache.ltp("TCS").is_none());
    }

    #[test]
    fn snapshot_contains_all_symbols() {
        let cache = PriceCache::new();
        cache.update(&tick("INFY", dec!(1500), 0));
        cache.update(&tick("TCS", dec!(3900), 0));
        let snap = cache.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap["INFY"].ltp, dec!(1500));
    }
}
