// =============================================================================
// Candle Aggregator — ticks → 1-minute candles → 25m / 125m candles
// =============================================================================
//
// One open 1-minute builder per symbol. A tick for a newer bucket closes the
// current builder and starts the next one; the closed 1-minute candle is then
// absorbed into the higher-timeframe builders, which roll over on their own
// session-aligned boundaries (`session_open + k * interval`).
//
// Out-of-order ticks within the current bucket are accepted (they update
// high/low/close and preserve the open). Ticks for an already-closed bucket
// are dropped and counted — replay safety comes from the repository's
// idempotent upsert, not from rewriting history here.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, warn};

use crate::clock::SessionClock;
use crate::market_data::Candle;
use crate::types::{Tick, Timeframe};

/// Rejection for malformed ticks. Dropped, counted, never fatal.
#[derive(Debug, thiserror::Error)]
pub enum IngressReject {
    #[error("non-positive price {price} for {symbol}")]
    NonPositivePrice { symbol: String, price: Decimal },
    #[error("negative volume {volume} for {symbol}")]
    NegativeVolume { symbol: String, volume: i64 },
}

/// Operational counters, readable without locking the aggregator state.
#[derive(Debug, Default)]
pub struct AggregatorStats {
    pub ticks_accepted: AtomicU64,
    pub late_ticks: AtomicU64,
    pub rejected_ticks: AtomicU64,
    pub out_of_session: AtomicU64,
}

/// Serialisable snapshot of [`AggregatorStats`].
#[derive(Debug, Clone, Serialize)]
pub struct AggregatorStatsSnapshot {
    pub ticks_accepted: u64,
    pub late_ticks: u64,
    pub rejected_ticks: u64,
    pub out_of_session: u64,
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Builder {
    bucket_start: DateTime<Utc>,
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
    volume: i64,
}

impl Builder {
    fn from_tick(bucket_start: DateTime<Utc>, tick: &Tick) -> Self {
        Self {
            bucket_start,
            open: tick.ltp,
            high: tick.ltp,
            low: tick.ltp,
            close: tick.ltp,
            volume: tick.volume,
        }
    }

    /// Apply a tick inside this bucket. The open is preserved even for
    /// out-of-order ticks.
    fn apply_tick(&mut self, tick: &Tick) {
        self.high = self.high.max(tick.ltp);
        self.low = self.low.min(tick.ltp);
        self.close = tick.ltp;
        self.volume += tick.volume;
    }

    fn from_candle(bucket_start: DateTime<Utc>, c: &Candle) -> Self {
        Self {
            bucket_start,
            open: c.open,
            high: c.high,
            low: c.low,
            close: c.close,
            volume: c.volume,
        }
    }

    /// Absorb a closed lower-timeframe candle.
    fn absorb(&mut self, c: &Candle) {
        self.high = self.high.max(c.high);
        self.low = self.low.min(c.low);
        self.close = c.close;
        self.volume += c.volume;
    }

    fn into_candle(self, symbol: &str, timeframe: Timeframe) -> Candle {
        Candle {
            symbol: symbol.to_string(),
            timeframe,
            bucket_start: self.bucket_start,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            closed: true,
        }
    }
}

#[derive(Debug, Default)]
struct SymbolState {
    m1: Option<Builder>,
    m25: Option<Builder>,
    m125: Option<Builder>,
    /// Bucket start of the newest closed 1-minute candle; used to classify
    /// late ticks once the builder has rolled over.
    last_closed_1m: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Aggregator
// ---------------------------------------------------------------------------

/// Tick-to-candle aggregator for all tracked symbols.
pub struct CandleAggregator {
    clock: SessionClock,
    state: RwLock<HashMap<String, SymbolState>>,
    stats: AggregatorStats,
}

impl CandleAggregator {
    pub fn new(clock: SessionClock) -> Self {
        Self {
            clock,
            state: RwLock::new(HashMap::new()),
            stats: AggregatorStats::default(),
        }
    }

    /// Feed one tick. Returns the candles *closed* by this tick (possibly a
    /// 1m, 25m and 125m candle at once on a shared boundary), oldest
    /// timeframe last.
    pub fn on_tick(&self, tick: &Tick) -> Result<Vec<Candle>, IngressReject> {
        if tick.ltp <= Decimal::ZERO {
            self.stats.rejected_ticks.fetch_add(1, Ordering::Relaxed);
            return Err(IngressReject::NonPositivePrice {
                symbol: tick.symbol.clone(),
                price: tick.ltp,
            });
        }
        if tick.volume < 0 {
            self.stats.rejected_ticks.fetch_add(1, Ordering::Relaxed);
            return Err(IngressReject::NegativeVolume {
                symbol: tick.symbol.clone(),
                volume: tick.volume,
            });
        }

        let Some(bucket) = self.clock.bucket_start(tick.ts, Timeframe::M1) else {
            self.stats.out_of_session.fetch_add(1, Ordering::Relaxed);
            debug!(symbol = %tick.symbol, ts = %tick.ts, "tick outside session — ignored");
            return Ok(Vec::new());
        };

        enum Action {
            Start,
            Apply,
            Roll,
            Late,
        }

        let mut closed = Vec::new();
        let mut map = self.state.write();
        let sym = map.entry(tick.symbol.clone()).or_default();

        let action = match &sym.m1 {
            // A tick at or before the newest closed bucket is late.
            None if sym.last_closed_1m.is_some_and(|last| bucket <= last) => Action::Late,
            None => Action::Start,
            Some(b) if bucket == b.bucket_start => Action::Apply,
            Some(b) if bucket > b.bucket_start => Action::Roll,
            Some(_) => Action::Late,
        };

        match action {
            Action::Late => {
                drop(map);
                self.count_late(tick, bucket);
                return Ok(Vec::new());
            }
            Action::Start => sym.m1 = Some(Builder::from_tick(bucket, tick)),
            Action::Apply => sym
                .m1
                .as_mut()
                .expect("apply only chosen with a live builder")
                .apply_tick(tick),
            Action::Roll => {
                let finished = sym
                    .m1
                    .take()
                    .expect("roll only chosen with a live builder")
                    .into_candle(&tick.symbol, Timeframe::M1);
                sym.last_closed_1m = Some(finished.bucket_start);
                sym.m1 = Some(Builder::from_tick(bucket, tick));
                self.roll_higher(sym, &finished, &mut closed);
                closed.push(finished);
            }
        }

        self.stats.ticks_accepted.fetch_add(1, Ordering::Relaxed);
        // Deterministic persistence order across timeframes.
        closed.sort_by_key(|c| (c.bucket_start, c.timeframe.minutes()));
        Ok(closed)
    }

    /// Absorb a freshly closed 1-minute candle into the 25m / 125m builders,
    /// closing any builder whose session-aligned boundary has passed.
    fn roll_higher(&self, sym: &mut SymbolState, one_min: &Candle, closed: &mut Vec<Candle>) {
        for tf in [Timeframe::M25, Timeframe::M125] {
            let Some(hbucket) = self.clock.bucket_start(one_min.bucket_start, tf) else {
                continue;
            };
            let slot = match tf {
                Timeframe::M25 => &mut sym.m25,
                Timeframe::M125 => &mut sym.m125,
                Timeframe::M1 => unreachable!("1m is not a derived timeframe"),
            };
            match slot {
                Some(hb) if hb.bucket_start == hbucket => hb.absorb(one_min),
                Some(hb) => {
                    closed.push(hb.clone().into_candle(&one_min.symbol, tf));
                    *slot = Some(Builder::from_candle(hbucket, one_min));
                }
                None => *slot = Some(Builder::from_candle(hbucket, one_min)),
            }
        }
    }

    /// Close every builder whose bucket has fully elapsed as of `now`.
    /// Called periodically so thin symbols still publish candles when ticks
    /// stop mid-session.
    pub fn flush_expired(&self, now: DateTime<Utc>) -> Vec<Candle> {
        let mut out = Vec::new();
        let mut map = self.state.write();
        for (symbol, sym) in map.iter_mut() {
            if let Some(b) = &sym.m1 {
                if self.clock.bucket_end(b.bucket_start, Timeframe::M1) <= now {
                    let finished = sym.m1.take().expect("checked above").into_candle(symbol, Timeframe::M1);
                    sym.last_closed_1m = Some(finished.bucket_start);
                    // Capture higher-TF closes triggered by this candle too.
                    let mut extra = Vec::new();
                    self.roll_higher(sym, &finished, &mut extra);
                    out.push(finished);
                    out.append(&mut extra);
                }
            }
            for (slot, tf) in [(&mut sym.m25, Timeframe::M25), (&mut sym.m125, Timeframe::M125)] {
                if let Some(b) = slot {
                    if self.clock.bucket_end(b.bucket_start, tf) <= now {
                        out.push(slot.take().expect("checked above").into_candle(symbol, tf));
                    }
                }
            }
        }
        out.sort_by_key(|c| (c.bucket_start, c.timeframe.minutes()));
        out
    }

    /// Close everything unconditionally (session end).
    pub fn flush_all(&self) -> Vec<Candle> {
        let mut out = Vec::new();
        let mut map = self.state.write();
        for (symbol, sym) in map.iter_mut() {
            if let Some(b) = sym.m1.take() {
                sym.last_closed_1m = Some(b.bucket_start);
                let finished = b.into_candle(symbol, Timeframe::M1);
                let mut extra = Vec::new();
                self.roll_higher(sym, &finished, &mut extra);
                out.push(finished);
                out.append(&mut extra);
            }
            if let Some(b) = sym.m25.take() {
                out.push(b.into_candle(symbol, Timeframe::M25));
            }
            if let Some(b) = sym.m125.take() {
                out.push(b.into_candle(symbol, Timeframe::M125));
            }
        }
        out.sort_by_key(|c| (c.bucket_start, c.timeframe.minutes()));
        out
    }

    fn count_late(&self, tick: &Tick, bucket: DateTime<Utc>) {
        self.stats.late_ticks.fetch_add(1, Ordering::Relaxed);
        warn!(
            symbol = %tick.symbol,
            bucket = %bucket,
            ts = %tick.ts,
            "late tick for closed bucket — dropped"
        );
    }

    pub fn stats(&self) -> AggregatorStatsSnapshot {
        AggregatorStatsSnapshot {
            ticks_accepted: self.stats.ticks_accepted.load(Ordering::Relaxed),
            late_ticks: self.stats.late_ticks.load(Ordering::Relaxed),
            rejected_ticks: self.stats.rejected_ticks.load(Ordering::Relaxed),
            out_of_session: self.stats.out_of_session.load(Ordering::Relaxed),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
