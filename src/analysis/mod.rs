// =============================================================================
// Multi-timeframe analysis — per-timeframe zone maths and confluence scoring
// =============================================================================

pub mod confluence;
pub mod mtf;

pub use confluence::{size_multiplier, strength_for_score, Confluence};
pub use mtf::{analyze_timeframe, TimeframeAnalysis};
