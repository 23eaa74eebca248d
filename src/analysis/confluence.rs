// =============================================================================
// Confluence — weighted cross-timeframe zone score → discrete strength
// =============================================================================
//
// The confluence score is the weighted average of the per-timeframe zone
// scores (buy side uses the buy-zone score, sell side the mirrored sell-zone
// score). Lower is better: 0 means every timeframe sits at its floor.
//
// Strength thresholds:  <=0.25 VERY_STRONG, <=0.45 STRONG, <=0.65 MODERATE,
// <=0.85 WEAK, else NONE. Position-size multipliers 1.2 / 1.0 / 0.8 / 0.6 / 0.
// =============================================================================

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::analysis::mtf::TimeframeAnalysis;
use crate::config::MtfConfig;
use crate::types::{ConfluenceStrength, Direction};

/// Confluence object produced by the MTF analysis for one symbol at one
/// price. Embedded in every signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Confluence {
    pub direction: Direction,
    /// Weighted zone score across HTF / ITF / LTF, in [0, 1]. Lower is better.
    pub score: f64,
    pub strength: ConfluenceStrength,
    pub htf: TimeframeAnalysis,
    pub itf: TimeframeAnalysis,
    pub ltf: TimeframeAnalysis,
}

impl Confluence {
    /// Combine per-timeframe snapshots under the configured weights.
    pub fn evaluate(
        direction: Direction,
        htf: TimeframeAnalysis,
        itf: TimeframeAnalysis,
        ltf: TimeframeAnalysis,
        cfg: &MtfConfig,
    ) -> Self {
        let pick = |a: &TimeframeAnalysis| match direction {
            Direction::Buy => a.buy_zone_score,
            Direction::Sell => a.sell_zone_score,
        };

        let weight_sum = cfg.weight_htf + cfg.weight_itf + cfg.weight_ltf;
        let score = if weight_sum > 0.0 {
            (pick(&htf) * cfg.weight_htf + pick(&itf) * cfg.weight_itf + pick(&ltf) * cfg.weight_ltf)
                / weight_sum
        } else {
            1.0
        };

        Self {
            direction,
            score,
            strength: strength_for_score(score),
            htf,
            itf,
            ltf,
        }
    }

    /// Whether every timeframe is inside the relevant zone band.
    pub fn all_in_zone(&self) -> bool {
        let in_zone = |a: &TimeframeAnalysis| match self.direction {
            Direction::Buy => a.in_buy_zone,
            Direction::Sell => a.in_sell_zone,
        };
        in_zone(&self.htf) && in_zone(&self.itf) && in_zone(&self.ltf)
    }
}

/// Discrete strength for a weighted zone score.
pub fn strength_for_score(score: f64) -> ConfluenceStrength {
    if score <= 0.25 {
        ConfluenceStrength::VeryStrong
    } else if score <= 0.45 {
        ConfluenceStrength::Strong
    } else if score <= 0.65 {
        ConfluenceStrength::Moderate
    } else if score <= 0.85 {
        ConfluenceStrength::Weak
    } else {
        ConfluenceStrength::None
    }
}

/// Position-size multiplier applied to the Kelly-sized quantity.
pub fn size_multiplier(strength: ConfluenceStrength) -> Decimal {
    match strength {
        ConfluenceStrength::VeryStrong => dec!(1.2),
        ConfluenceStrength::Strong => dec!(1.0),
        ConfluenceStrength::Moderate => dec!(0.8),
        ConfluenceStrength::Weak => dec!(0.6),
        ConfluenceStrength::None => Decimal::ZERO,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
