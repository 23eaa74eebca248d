// =============================================================================
// Exit Rules — trailing-stop maths, price-update triggers, exit qualification
// =============================================================================
//
// Trigger order on a price update for an OPEN trade:
//   1. stop breach (initial or trailing stop, adverse move)
//   2. target hit (entry + targetR * stop distance)
//   3. trailing-stop update (activation, then monotonic tightening)
//   4. time-based exit (holding-period elapsed)
//
// A brick filter gates re-evaluation: price must have moved at least
// `minMovePercent` from the last evaluated price, in either direction.
//
// Exit qualification is the dual of entry validation: broker operational,
// trade OPEN, direction consistency, no exit in flight, within the session
// window (stop-driven reasons cross the closing window, target/time do not),
// full quantity only, order type by reason.
// =============================================================================

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use tracing::debug;

use crate::clock::SessionClock;
use crate::config::{MtfConfig, TrailingStopsConfig};
use crate::store::trades::{Trade, TrailingState, ValidationError};
use crate::types::{Direction, ExitReason, OrderType, TradeStatus};

/// Price decimals on the exchange.
const PRICE_DECIMALS: u32 = 2;

/// Limit-price buffer for time-based exits, in favor of the fill (0.1%).
const TIME_EXIT_BUFFER: Decimal = Decimal::from_parts(1, 0, 0, false, 3); // 0.001

fn pct(value: f64) -> Decimal {
    Decimal::from_f64_retain(value).unwrap_or(Decimal::ZERO) / Decimal::from(100)
}

// ---------------------------------------------------------------------------
// Brick filter
// ---------------------------------------------------------------------------

/// True when price moved at least `min_move_percent` from the last
/// evaluation price (always true on the first evaluation).
pub fn brick_moved(last_eval: Option<Decimal>, ltp: Decimal, min_move_percent: f64) -> bool {
    let Some(last) = last_eval else { return true };
    if last <= Decimal::ZERO {
        return true;
    }
    let moved = ((ltp - last) / last).abs();
    moved >= pct(min_move_percent)
}

// ---------------------------------------------------------------------------
// Trailing stop
// ---------------------------------------------------------------------------

/// Apply the trailing-stop update rule for one price observation.
///
/// Longs: activation on unrealized profit >= activationPercent of entry;
/// once active, `stop = max(stop, highest * (1 - trailingPercent))` — the
/// stop never decreases. Shorts mirror every predicate (the `highest_price`
/// field tracks the lowest seen price).
pub fn update_trailing(
    direction: Direction,
    entry_price: Decimal,
    state: TrailingState,
    ltp: Decimal,
    cfg: &TrailingStopsConfig,
) -> TrailingState {
    if entry_price <= Decimal::ZERO {
        return state;
    }
    let trail_frac = pct(cfg.trailing_percent);
    let activation_frac = pct(cfg.activation_percent);
    let mut next = state;

    match direction {
        Direction::Buy => {
            let watermark = next.highest_price.unwrap_or(entry_price).max(ltp);
            next.highest_price = Some(watermark);

            if !next.active {
                let profit = (ltp - entry_price) / entry_price;
                if profit >= activation_frac {
                    next.active = true;
                }
            }
            if next.active {
                let candidate = (watermark * (Decimal::ONE - trail_frac))
                    .round_dp_with_strategy(PRICE_DECIMALS + 1, RoundingStrategy::MidpointAwayFromZero);
                next.stop_price = Some(match next.stop_price {
                    Some(current) => current.max(candidate),
                    None => candidate,
                });
            }
        }
        Direction::Sell => {
            let watermark = next.highest_price.unwrap_or(entry_price).min(ltp);
            next.highest_price = Some(watermark);

            if !next.active {
                let profit = (entry_price - ltp) / entry_price;
                if profit >= activation_frac {
                    next.active = true;
                }
            }
            if next.active {
                let candidate = (watermark * (Decimal::ONE + trail_frac))
                    .round_dp_with_strategy(PRICE_DECIMALS + 1, RoundingStrategy::MidpointAwayFromZero);
                next.stop_price = Some(match next.stop_price {
                    Some(current) => current.min(candidate),
                    None => candidate,
                });
            }
        }
    }
    next
}

// ---------------------------------------------------------------------------
// Price-update evaluation
// ---------------------------------------------------------------------------

/// Outcome of evaluating one price update against an OPEN trade.
#[derive(Debug, Clone)]
pub struct PriceEvaluation {
    /// Exit trigger, if a condition qualified.
    pub trigger: Option<(ExitReason, Decimal)>,
    /// Updated trailing state (persist when changed).
    pub trailing: TrailingState,
    pub trailing_changed: bool,
}

/// Evaluate exit conditions in order for an OPEN trade at `ltp`.
pub fn evaluate_price_update(
    trade: &Trade,
    ltp: Decimal,
    now: DateTime<Utc>,
    trailing_cfg: &TrailingStopsConfig,
    mtf_cfg: &MtfConfig,
) -> PriceEvaluation {
    let direction = trade.direction;
    let entry = trade.entry_price.unwrap_or(Decimal::ZERO);

    // 1. Stop breach: trailing stop when active, else the initial stop.
    let effective_stop = trade
        .trailing
        .stop_price
        .filter(|_| trade.trailing.active)
        .or(trade.stop_price);
    if let Some(stop) = effective_stop {
        let breached = match direction {
            Direction::Buy => ltp <= stop,
            Direction::Sell => ltp >= stop,
        };
        if breached {
            let reason = if trade.trailing.active {
                ExitReason::TrailingStop
            } else {
                ExitReason::StopLoss
            };
            debug!(trade_id = %trade.id, %ltp, %stop, reason = %reason, "stop breached");
            return PriceEvaluation {
                trigger: Some((reason, ltp)),
                trailing: trade.trailing,
                trailing_changed: false,
            };
        }
    }

    // 2. Target hit.
    if let Some(target) = trade.target_price {
        let hit = match direction {
            Direction::Buy => ltp >= target,
            Direction::Sell => ltp <= target,
        };
        if hit {
            return PriceEvaluation {
                trigger: Some((ExitReason::TargetHit, ltp)),
                trailing: trade.trailing,
                trailing_changed: false,
            };
        }
    }

    // 3. Trailing-stop update.
    let trailing = update_trailing(direction, entry, trade.trailing, ltp, trailing_cfg);
    let trailing_changed = trailing != trade.trailing;

    // 4. Time-based exit.
    if let Some(entry_time) = trade.entry_time {
        let held_mins = (now - entry_time).num_minutes();
        if held_mins >= mtf_cfg.max_holding_mins {
            return PriceEvaluation {
                trigger: Some((ExitReason::TimeBased, ltp)),
                trailing,
                trailing_changed,
            };
        }
    }

    PriceEvaluation {
        trigger: None,
        trailing,
        trailing_changed,
    }
}

// ---------------------------------------------------------------------------
// Exit qualification
// ---------------------------------------------------------------------------

/// Outcome of exit qualification.
#[derive(Debug, Clone)]
pub struct ExitDecision {
    pub passed: bool,
    pub errors: Vec<ValidationError>,
    pub order_type: OrderType,
    pub quantity: i64,
    pub limit_price: Option<Decimal>,
}

/// Exit qualification service.
#[derive(Clone)]
pub struct ExitQualification {
    clock: SessionClock,
    closing_window_mins: i64,
}

impl ExitQualification {
    pub fn new(clock: SessionClock, closing_window_mins: i64) -> Self {
        Self {
            clock,
            closing_window_mins,
        }
    }

    /// Qualify an exit attempt for `trade`.
    ///
    /// `signal_direction` is set when the exit comes from an exit signal: a
    /// BUY exit-signal closes longs, a SELL exit-signal closes shorts.
    /// `exit_in_flight` reports whether a non-terminal exit intent exists.
    pub fn qualify(
        &self,
        trade: &Trade,
        reason: ExitReason,
        detected_price: Decimal,
        broker_connected: bool,
        exit_in_flight: bool,
        signal_direction: Option<Direction>,
        now: DateTime<Utc>,
    ) -> ExitDecision {
        let mut errors: Vec<ValidationError> = Vec::new();
        let fail = |code: &str, field: &str, expected: String, actual: String| ValidationError {
            code: code.to_string(),
            field: field.to_string(),
            expected,
            actual,
        };

        if !broker_connected {
            errors.push(fail(
                "BROKER_NOT_CONNECTED",
                "broker",
                "connected".into(),
                "disconnected".into(),
            ));
        }

        if trade.status != TradeStatus::Open {
            errors.push(fail(
                "TRADE_NOT_OPEN",
                "status",
                TradeStatus::Open.to_string(),
                trade.status.to_string(),
            ));
        }

        if let Some(dir) = signal_direction {
            if dir != trade.direction {
                errors.push(fail(
                    "DIRECTION_MISMATCH",
                    "direction",
                    trade.direction.to_string(),
                    dir.to_string(),
                ));
            }
        }

        if exit_in_flight {
            errors.push(fail(
                "EXIT_IN_FLIGHT",
                "exit_intent",
                "none".into(),
                "non-terminal exit intent exists".into(),
            ));
        }

        // Session window: stop-driven exits run across the whole session;
        // target and time-based exits stop at the closing window.
        if !self.clock.is_market_open(now) {
            errors.push(fail(
                "MARKET_CLOSED",
                "session",
                "market open".into(),
                now.to_rfc3339(),
            ));
        } else if !reason.allowed_in_closing_window()
            && self.clock.in_closing_window(now, self.closing_window_mins)
        {
            errors.push(fail(
                "EXIT_WINDOW_CLOSED",
                "session",
                format!("before last {} minutes", self.closing_window_mins),
                now.to_rfc3339(),
            ));
        }

        // Full exit only: quantity equals the filled entry quantity.
        let quantity = if trade.filled_qty > 0 {
            trade.filled_qty
        } else {
            trade.entry_qty
        };
        if quantity <= 0 {
            errors.push(fail(
                "NOTHING_TO_EXIT",
                "quantity",
                "> 0".into(),
                quantity.to_string(),
            ));
        }

        let order_type = reason.order_type();
        let limit_price = match (order_type, reason) {
            (OrderType::Limit, ExitReason::TargetHit) => Some(detected_price),
            (OrderType::Limit, ExitReason::TimeBased) => {
                // Buffer in favor of the fill: selling a long prices under
                // the detected price, covering a short prices over it.
                let factor = match trade.direction {
                    Direction::Buy => Decimal::ONE - TIME_EXIT_BUFFER,
                    Direction::Sell => Decimal::ONE + TIME_EXIT_BUFFER,
                };
                Some(
                    (detected_price * factor).round_dp_with_strategy(
                        PRICE_DECIMALS,
                        RoundingStrategy::MidpointAwayFromZero,
                    ),
                )
            }
            _ => None,
        };

        ExitDecision {
            passed: errors.is_empty(),
            errors,
            order_type,
            quantity,
            limit_price,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
