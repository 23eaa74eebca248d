// =============================================================================
// Engine Configuration — hot-reloadable settings with atomic save
// =============================================================================
//
// Two kinds of configuration live here:
//
//   * `EngineConfig` — process-level settings loaded from a JSON file at
//     startup (partitions, worker pool, intervals, bind address). Atomic
//     tmp + rename persistence; every field carries a serde default so old
//     files keep loading as fields are added.
//
//   * `MtfConfig` / `MtfOverride` / `TrailingStopsConfig` — trading
//     parameters owned by the config store (admin-editable, persisted in
//     the database). The merge of global config and per-symbol override is
//     a pure function; a null override field inherits the global value.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::{ConfluenceStrength, UpdateFrequency};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_db_path() -> String {
    "meridian.db".to_string()
}

fn default_partitions() -> usize {
    8
}

fn default_signal_ttl_secs() -> i64 {
    900
}

fn default_reconcile_interval_secs() -> u64 {
    30
}

fn default_watchdog_interval_secs() -> u64 {
    30
}

fn default_closing_window_mins() -> i64 {
    5
}

fn default_broker_max_attempts() -> u32 {
    3
}

fn default_broker_backoff_ms() -> u64 {
    250
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_depth() -> usize {
    50
}

fn default_weight_htf() -> f64 {
    0.5
}

fn default_weight_itf() -> f64 {
    0.3
}

fn default_weight_ltf() -> f64 {
    0.2
}

fn default_min_strength() -> ConfluenceStrength {
    ConfluenceStrength::Strong
}

fn default_entry_offset_pct() -> f64 {
    0.1
}

fn default_target_r() -> f64 {
    2.0
}

fn default_max_holding_mins() -> i64 {
    375
}

fn default_stop_loss_pct() -> f64 {
    1.0
}

fn default_max_rebuys() -> u32 {
    1
}

fn default_activation_percent() -> f64 {
    1.0
}

fn default_trailing_percent() -> f64 {
    0.5
}

fn default_min_move_percent() -> f64 {
    0.05
}

fn default_max_loss_percent() -> f64 {
    2.0
}

fn default_lock_profit_percent() -> f64 {
    0.25
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Process-level engine configuration, loaded once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Path of the SQLite database file.
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Number of trade-actor partitions. All messages for one trade hash to
    /// the same partition.
    #[serde(default = "default_partitions")]
    pub partitions: usize,

    /// Orchestrator validation pool size. 0 means the CPU count.
    #[serde(default)]
    pub orchestrator_workers: usize,

    /// Run brokers in paper (simulated) mode.
    #[serde(default = "default_true")]
    pub paper_mode: bool,

    /// Signal time-to-live before expiry.
    #[serde(default = "default_signal_ttl_secs")]
    pub signal_ttl_secs: i64,

    /// Interval of the pending-trade reconciler.
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,

    /// Interval of the broker-session token watchdog.
    #[serde(default = "default_watchdog_interval_secs")]
    pub watchdog_interval_secs: u64,

    /// Width of the end-of-session window in which target and time-based
    /// exits are refused.
    #[serde(default = "default_closing_window_mins")]
    pub closing_window_mins: i64,

    /// Maximum attempts for transient broker failures.
    #[serde(default = "default_broker_max_attempts")]
    pub broker_max_attempts: u32,

    /// Base backoff between broker retries (doubles per attempt).
    #[serde(default = "default_broker_backoff_ms")]
    pub broker_backoff_ms: u64,

    /// Bind address of the admin / event-stream API.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            partitions: default_partitions(),
            orchestrator_workers: 0,
            paper_mode: true,
            signal_ttl_secs: default_signal_ttl_secs(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
            watchdog_interval_secs: default_watchdog_interval_secs(),
            closing_window_mins: default_closing_window_mins(),
            broker_max_attempts: default_broker_max_attempts(),
            broker_backoff_ms: default_broker_backoff_ms(),
            bind_addr: default_bind_addr(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;

        info!(
            path = %path.display(),
            partitions = config.partitions,
            paper_mode = config.paper_mode,
            "engine config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration using an atomic write (write to
    /// `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise engine config")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }
}

// =============================================================================
// MTF configuration (global + per-symbol override)
// =============================================================================

/// Global multi-timeframe analysis configuration. A single logical row in
/// the config store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MtfConfig {
    /// Candle window depths per timeframe (number of closed candles).
    #[serde(default = "default_depth")]
    pub ltf_depth: usize,
    #[serde(default = "default_depth")]
    pub itf_depth: usize,
    #[serde(default = "default_depth")]
    pub htf_depth: usize,

    /// Confluence weights across HTF / ITF / LTF buy-zone scores.
    #[serde(default = "default_weight_htf")]
    pub weight_htf: f64,
    #[serde(default = "default_weight_itf")]
    pub weight_itf: f64,
    #[serde(default = "default_weight_ltf")]
    pub weight_ltf: f64,

    /// Minimum confluence strength that emits a signal.
    #[serde(default = "default_min_strength")]
    pub min_strength: ConfluenceStrength,

    /// Use LIMIT entries with an offset from the current price, else MARKET.
    #[serde(default = "default_true")]
    pub use_limit_entries: bool,

    /// Limit-price offset from the current price, percent.
    #[serde(default = "default_entry_offset_pct")]
    pub entry_offset_pct: f64,

    /// Target distance in multiples of the stop distance.
    #[serde(default = "default_target_r")]
    pub target_r: f64,

    /// Initial stop distance from entry, percent.
    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: f64,

    /// Time-based exit after this holding period, minutes.
    #[serde(default = "default_max_holding_mins")]
    pub max_holding_mins: i64,

    /// Whether re-entering a symbol with an already-active trade is allowed.
    #[serde(default)]
    pub allow_rebuy: bool,

    /// Maximum rebuys per (user, symbol) beyond the first entry.
    #[serde(default = "default_max_rebuys")]
    pub max_rebuys: u32,
}

impl Default for MtfConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults deserialise")
    }
}

impl MtfConfig {
    /// Validate ranges; rejected configs are never applied.
    pub fn validate(&self) -> Result<(), String> {
        if self.ltf_depth < 2 || self.itf_depth < 2 || self.htf_depth < 2 {
            return Err("timeframe depths must be >= 2".to_string());
        }
        let weight_sum = self.weight_htf + self.weight_itf + self.weight_ltf;
        if self.weight_htf < 0.0 || self.weight_itf < 0.0 || self.weight_ltf < 0.0 {
            return Err("confluence weights must be non-negative".to_string());
        }
        if weight_sum <= 0.0 {
            return Err("confluence weights must sum to a positive value".to_string());
        }
        if !(0.0..=100.0).contains(&self.entry_offset_pct) {
            return Err("entryOffsetPct must be within [0, 100]".to_string());
        }
        if self.stop_loss_pct <= 0.0 || self.stop_loss_pct > 100.0 {
            return Err("stopLossPct must be within (0, 100]".to_string());
        }
        if self.target_r <= 0.0 {
            return Err("targetR must be positive".to_string());
        }
        if self.max_holding_mins <= 0 {
            return Err("maxHoldingMins must be positive".to_string());
        }
        Ok(())
    }

    /// Resolve the effective config for a symbol: any override field that is
    /// present replaces the global value, a null field inherits it.
    pub fn merged_with(&self, ov: &MtfOverride) -> MtfConfig {
        MtfConfig {
            ltf_depth: ov.ltf_depth.unwrap_or(self.ltf_depth),
            itf_depth: ov.itf_depth.unwrap_or(self.itf_depth),
            htf_depth: ov.htf_depth.unwrap_or(self.htf_depth),
            weight_htf: ov.weight_htf.unwrap_or(self.weight_htf),
            weight_itf: ov.weight_itf.unwrap_or(self.weight_itf),
            weight_ltf: ov.weight_ltf.unwrap_or(self.weight_ltf),
            min_strength: ov.min_strength.unwrap_or(self.min_strength),
            use_limit_entries: ov.use_limit_entries.unwrap_or(self.use_limit_entries),
            entry_offset_pct: ov.entry_offset_pct.unwrap_or(self.entry_offset_pct),
            target_r: ov.target_r.unwrap_or(self.target_r),
            stop_loss_pct: ov.stop_loss_pct.unwrap_or(self.stop_loss_pct),
            max_holding_mins: ov.max_holding_mins.unwrap_or(self.max_holding_mins),
            allow_rebuy: ov.allow_rebuy.unwrap_or(self.allow_rebuy),
            max_rebuys: ov.max_rebuys.unwrap_or(self.max_rebuys),
        }
    }
}

/// Per-symbol override row. Null means inherit the global value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MtfOverride {
    #[serde(default)]
    pub ltf_depth: Option<usize>,
    #[serde(default)]
    pub itf_depth: Option<usize>,
    #[serde(default)]
    pub htf_depth: Option<usize>,
    #[serde(default)]
    pub weight_htf: Option<f64>,
    #[serde(default)]
    pub weight_itf: Option<f64>,
    #[serde(default)]
    pub weight_ltf: Option<f64>,
    #[serde(default)]
    pub min_strength: Option<ConfluenceStrength>,
    #[serde(default)]
    pub use_limit_entries: Option<bool>,
    #[serde(default)]
    pub entry_offset_pct: Option<f64>,
    #[serde(default)]
    pub target_r: Option<f64>,
    #[serde(default)]
    pub stop_loss_pct: Option<f64>,
    #[serde(default)]
    pub max_holding_mins: Option<i64>,
    #[serde(default)]
    pub allow_rebuy: Option<bool>,
    #[serde(default)]
    pub max_rebuys: Option<u32>,
}

// =============================================================================
// Trailing-stops configuration
// =============================================================================

/// Trailing-stops configuration document. Every percent must lie in (0, 100].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrailingStopsConfig {
    /// Unrealized profit (percent of entry) that activates the trail.
    #[serde(default = "default_activation_percent")]
    pub activation_percent: f64,

    /// Trail distance below the highest price (percent).
    #[serde(default = "default_trailing_percent")]
    pub trailing_percent: f64,

    /// When the trailing rule re-evaluates.
    #[serde(default)]
    pub update_frequency: UpdateFrequency,

    /// Brick filter: minimum move (percent) between consecutive exit
    /// evaluations for the same trade.
    #[serde(default = "default_min_move_percent")]
    pub min_move_percent: f64,

    /// Hard loss cap from entry (percent).
    #[serde(default = "default_max_loss_percent")]
    pub max_loss_percent: f64,

    /// Profit locked in once the trail activates (percent of entry).
    #[serde(default = "default_lock_profit_percent")]
    pub lock_profit_percent: f64,
}

impl Default for TrailingStopsConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults deserialise")
    }
}

impl TrailingStopsConfig {
    pub fn validate(&self) -> Result<(), String> {
        for (name, value) in [
            ("activationPercent", self.activation_percent),
            ("trailingPercent", self.trailing_percent),
            ("minMovePercent", self.min_move_percent),
            ("maxLossPercent", self.max_loss_percent),
            ("lockProfitPercent", self.lock_profit_percent),
        ] {
            if !(value > 0.0 && value <= 100.0) {
                return Err(format!("{name} must be within (0, 100], got {value}"));
            }
        }
        Ok(())
    }
}
