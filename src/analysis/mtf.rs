// =============================================================================
// Per-timeframe analysis — range, max drop, zones, buy-zone score
// =============================================================================
//
// For a window of closed candles and the current price P:
//
//   tfLow  = min(low),  tfHigh = max(high),  range = tfHigh - tfLow
//   maxDrop = max over the series of (runningHigh - low)
//   maxDropPct = the same drop expressed against the running high
//   numZones = ceil(1 / maxDropPct), clamped to [1, 50]
//   currentZone = floor(((P - tfLow) / tfLow) / maxDropPct) + 1, clamped
//   inBuyZone iff (P - tfLow) / range <= 0.35
//   buyZoneScore = min(1, ((P - tfLow) / range) / 0.35)   0 = at floor (best)
//
// The sell-side fields mirror the buy side against the timeframe high.
// Everything here is deterministic given its inputs.
// =============================================================================

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::market_data::Candle;
use crate::types::Timeframe;

/// Fraction of the range that counts as the buy (or sell) zone.
pub const ZONE_BAND: f64 = 0.35;

/// Zone-count clamp.
const MAX_ZONES: u32 = 50;

/// Analysis snapshot for a single timeframe. Ephemeral; derived from a
/// window of closed candles plus the current price.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeframeAnalysis {
    pub timeframe: Timeframe,
    pub candles: usize,
    pub tf_low: Decimal,
    pub tf_high: Decimal,
    pub range: Decimal,
    pub max_drop: Decimal,
    pub max_drop_pct: f64,
    pub num_zones: u32,
    pub current_zone: u32,
    pub in_buy_zone: bool,
    pub buy_zone_score: f64,
    pub in_sell_zone: bool,
    pub sell_zone_score: f64,
    /// `drop_distribution[i]` is the fraction of candles whose drop reached
    /// zone `i + 1`.
    pub drop_distribution: Vec<f64>,
}

/// Analyze one timeframe window. Returns `None` when fewer than 2 closed
/// candles are available or the current price is non-positive.
pub fn analyze_timeframe(
    timeframe: Timeframe,
    candles: &[Candle],
    price: Decimal,
) -> Option<TimeframeAnalysis> {
    if candles.len() < 2 || price <= Decimal::ZERO {
        debug!(
            %timeframe,
            candles = candles.len(),
            "analysis skipped: insufficient data"
        );
        return None;
    }

    let tf_low = candles.iter().map(|c| c.low).min()?;
    let tf_high = candles.iter().map(|c| c.high).max()?;
    let range = tf_high - tf_low;

    // Max drop from the running high, in absolute and fractional terms.
    let mut running_high = candles[0].high;
    let mut max_drop = Decimal::ZERO;
    let mut max_drop_pct = 0.0f64;
    let mut drops = Vec::with_capacity(candles.len());
    for c in candles {
        running_high = running_high.max(c.high);
        let drop = running_high - c.low;
        max_drop = max_drop.max(drop);
        let drop_pct = if running_high > Decimal::ZERO {
            (drop / running_high).to_f64().unwrap_or(0.0)
        } else {
            0.0
        };
        max_drop_pct = max_drop_pct.max(drop_pct);
        drops.push(drop_pct);
    }

    let num_zones = if max_drop_pct > 0.0 {
        ((1.0 / max_drop_pct).ceil() as u32).clamp(1, MAX_ZONES)
    } else {
        1
    };

    let price_f = price.to_f64().unwrap_or(0.0);
    let tf_low_f = tf_low.to_f64().unwrap_or(0.0);
    let range_f = range.to_f64().unwrap_or(0.0);
    let tf_high_f = tf_high.to_f64().unwrap_or(0.0);

    let current_zone = if max_drop_pct > 0.0 && tf_low_f > 0.0 {
        let rise = (price_f - tf_low_f) / tf_low_f;
        (((rise / max_drop_pct).floor() as i64) + 1).clamp(1, num_zones as i64) as u32
    } else {
        1
    };

    // Position inside the range; a flat window counts as being at the floor.
    let floor_frac = if range_f > 0.0 {
        ((price_f - tf_low_f) / range_f).clamp(0.0, f64::MAX)
    } else {
        0.0
    };
    let ceil_frac = if range_f > 0.0 {
        ((tf_high_f - price_f) / range_f).clamp(0.0, f64::MAX)
    } else {
        0.0
    };

    let in_buy_zone = floor_frac <= ZONE_BAND;
    let buy_zone_score = (floor_frac / ZONE_BAND).min(1.0);
    let in_sell_zone = ceil_frac <= ZONE_BAND;
    let sell_zone_score = (ceil_frac / ZONE_BAND).min(1.0);

    // A candle's drop "reaches" zone i when it entered zone i's band.
    let mut drop_distribution = vec![0.0f64; num_zones as usize];
    if max_drop_pct > 0.0 {
        for (i, slot) in drop_distribution.iter_mut().enumerate() {
            // Zone i+1 begins i zone-widths below the running high.
            let threshold = i as f64 * max_drop_pct;
            let reached = drops.iter().filter(|d| **d >= threshold).count();
            *slot = reached as f64 / drops.len() as f64;
        }
    }

    Some(TimeframeAnalysis {
        timeframe,
        candles: candles.len(),
        tf_low,
        tf_high,
        range,
        max_drop,
        max_drop_pct,
        num_zones,
        current_zone,
        in_buy_zone,
        buy_zone_score,
        in_sell_zone,
        sell_zone_score,
        drop_distribution,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
