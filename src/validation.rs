// =============================================================================
// Validation Service — per-(user, broker) entry checks and position sizing
// =============================================================================
//
// Checks run in order; every failed check appends a named error, and the
// decision passes only when the list is empty. Sizing is fractional Kelly
// scaled by the confluence multiplier, floored to the lot size, and bounded
// by the per-position and portfolio log-loss caps.
//
// User context (capital, exposure, preferences) comes from a provider
// callable supplied at construction, so this module never reaches into
// portfolio storage directly.
// =============================================================================

use std::collections::HashSet;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use tracing::debug;
use uuid::Uuid;

use crate::analysis::size_multiplier;
use crate::config::MtfConfig;
use crate::store::signals::Signal;
use crate::store::trades::{TradeRepo, ValidationError};
use crate::store::user_brokers::UserBroker;
use crate::types::{ConnectionStatus, Direction, OrderType, ProductType};

/// Price decimals on the exchange (paise precision).
const PRICE_DECIMALS: u32 = 2;

/// Per-(user, broker) trading context, loaded by the provider for each
/// validation.
#[derive(Debug, Clone)]
pub struct UserContext {
    pub user_id: Uuid,
    pub total_capital: Decimal,
    pub available_capital: Decimal,
    pub current_exposure: Decimal,
    pub portfolio_frozen: bool,
    /// Allowed symbols; `None` means every symbol is tradable.
    pub allowed_symbols: Option<HashSet<String>>,
    /// Fractional Kelly multiplier, e.g. 0.2.
    pub kelly_fraction: Decimal,
    /// Per-symbol lot sizes; absent symbols trade in single shares.
    pub lot_sizes: std::collections::HashMap<String, i64>,
    /// Cap on |ln(1 - worst_loss / capital)| for a single position.
    pub max_position_log_loss: f64,
    /// Cap on the same measure applied to exposure after entry.
    pub max_portfolio_log_loss: f64,
    /// Hard exposure ceiling.
    pub max_exposure: Decimal,
}

/// Supplies the user context at validation time. Implementations may hit
/// the broker (funds) or portfolio storage, hence async.
#[async_trait::async_trait]
pub trait UserContextProvider: Send + Sync {
    async fn load(&self, user_broker: &UserBroker) -> Result<UserContext>;
}

/// Outcome of entry validation. `passed` iff `errors` is empty.
#[derive(Debug, Clone)]
pub struct EntryDecision {
    pub passed: bool,
    pub errors: Vec<ValidationError>,
    pub quantity: i64,
    pub order_type: OrderType,
    pub limit_price: Option<Decimal>,
    pub product_type: ProductType,
    pub log_impact: f64,
    pub exposure_after: Decimal,
}

/// Entry validation service. One instance serves every user-broker.
#[derive(Clone)]
pub struct ValidationService {
    trades: TradeRepo,
}

impl ValidationService {
    pub fn new(trades: TradeRepo) -> Self {
        Self { trades }
    }

    /// Run the entry checks for one delivery.
    pub fn validate_entry(
        &self,
        signal: &Signal,
        user_broker: &UserBroker,
        ctx: &UserContext,
        cfg: &MtfConfig,
        current_price: Decimal,
        now: DateTime<Utc>,
    ) -> Result<EntryDecision> {
        let mut errors: Vec<ValidationError> = Vec::new();
        let fail = |code: &str, field: &str, expected: String, actual: String| ValidationError {
            code: code.to_string(),
            field: field.to_string(),
            expected,
            actual,
        };

        // 1. Broker operational: active, connected, session valid.
        if !user_broker.active {
            errors.push(fail("BROKER_INACTIVE", "active", "true".into(), "false".into()));
        }
        if user_broker.connection_status != ConnectionStatus::Connected {
            errors.push(fail(
                "BROKER_DISCONNECTED",
                "connection_status",
                ConnectionStatus::Connected.to_string(),
                user_broker.connection_status.to_string(),
            ));
        }
        if let Some(expiry) = user_broker.session_expires_at {
            if expiry <= now {
                errors.push(fail(
                    "SESSION_EXPIRED",
                    "session_expires_at",
                    format!("> {now}"),
                    expiry.to_string(),
                ));
            }
        }

        // 2. Symbol allowlist.
        if let Some(allowed) = &ctx.allowed_symbols {
            if !allowed.contains(&signal.symbol) {
                errors.push(fail(
                    "SYMBOL_NOT_ALLOWED",
                    "symbol",
                    "in allowlist".into(),
                    signal.symbol.clone(),
                ));
            }
        }

        // 3. Portfolio frozen.
        if ctx.portfolio_frozen {
            errors.push(fail(
                "PORTFOLIO_FROZEN",
                "portfolio_frozen",
                "false".into(),
                "true".into(),
            ));
        }

        // 4. Duplicate-entry guard. EXITING still counts as active.
        let active = self.trades.count_active_directional(
            ctx.user_id,
            &signal.symbol,
            signal.direction,
        )?;
        if active > 0 {
            let rebuy_allowed = cfg.allow_rebuy && active <= cfg.max_rebuys as i64;
            if !rebuy_allowed {
                errors.push(fail(
                    "DUPLICATE_POSITION",
                    "active_trades",
                    if cfg.allow_rebuy {
                        format!("<= {}", cfg.max_rebuys)
                    } else {
                        "0".into()
                    },
                    active.to_string(),
                ));
            }
        }

        // 5. Kelly sizing, floored to the lot.
        let multiplier = size_multiplier(signal.strength);
        let lot = ctx.lot_sizes.get(&signal.symbol).copied().unwrap_or(1).max(1);
        let quantity = if current_price > Decimal::ZERO && multiplier > Decimal::ZERO {
            let budget = ctx.kelly_fraction * multiplier * ctx.available_capital;
            let shares = (budget / current_price)
                .to_i64()
                .unwrap_or(0);
            (shares / lot) * lot
        } else {
            0
        };
        if quantity < lot {
            errors.push(fail(
                "CAPITAL_INSUFFICIENT",
                "quantity",
                format!(">= {lot}"),
                quantity.to_string(),
            ));
        }

        // Per-position log-loss cap: worst loss is the configured stop
        // distance against total capital.
        let position_value = current_price * Decimal::from(quantity);
        let stop_fraction = Decimal::from_f64_retain(cfg.stop_loss_pct)
            .unwrap_or(Decimal::ONE)
            / Decimal::from(100);
        let worst_loss = position_value * stop_fraction;
        let log_impact = log_loss(worst_loss, ctx.total_capital);
        if log_impact.abs() > ctx.max_position_log_loss {
            errors.push(fail(
                "POSITION_LOG_LOSS_EXCEEDED",
                "log_impact",
                format!("|x| <= {}", ctx.max_position_log_loss),
                format!("{log_impact:.6}"),
            ));
        }

        // 6. Order type and limit price in the direction that improves
        // fill odds.
        let order_type = if cfg.use_limit_entries {
            OrderType::Limit
        } else {
            OrderType::Market
        };
        let limit_price = (order_type == OrderType::Limit).then(|| {
            let offset = Decimal::from_f64_retain(cfg.entry_offset_pct)
                .unwrap_or(Decimal::ZERO)
                / Decimal::from(100);
            let factor = match signal.direction {
                Direction::Buy => Decimal::ONE + offset,
                Direction::Sell => Decimal::ONE - offset,
            };
            (current_price * factor)
                .round_dp_with_strategy(PRICE_DECIMALS, RoundingStrategy::MidpointAwayFromZero)
        });

        // 7. Projected exposure.
        let exposure_after = ctx.current_exposure + position_value;
        if exposure_after > ctx.max_exposure {
            errors.push(fail(
                "EXPOSURE_CAP_EXCEEDED",
                "exposure_after",
                format!("<= {}", ctx.max_exposure),
                exposure_after.to_string(),
            ));
        }
        let portfolio_log = log_loss(exposure_after * stop_fraction, ctx.total_capital);
        if portfolio_log.abs() > ctx.max_portfolio_log_loss {
            errors.push(fail(
                "PORTFOLIO_LOG_LOSS_EXCEEDED",
                "portfolio_log_loss",
                format!("|x| <= {}", ctx.max_portfolio_log_loss),
                format!("{portfolio_log:.6}"),
            ));
        }

        let passed = errors.is_empty();
        debug!(
            signal_id = %signal.id,
            user_broker_id = %user_broker.id,
            passed,
            quantity,
            errors = errors.len(),
            "entry validation complete"
        );

        Ok(EntryDecision {
            passed,
            errors,
            quantity,
            order_type,
            limit_price,
            product_type: ProductType::default(),
            log_impact,
            exposure_after,
        })
    }
}

/// ln(1 - loss/capital); 0 when capital is non-positive or the loss
/// swallows the book (the caps reject long before that point).
fn log_loss(loss: Decimal, capital: Decimal) -> f64 {
    if capital <= Decimal::ZERO {
        return 0.0;
    }
    let fraction = (loss / capital).to_f64().unwrap_or(0.0);
    if fraction >= 1.0 {
        return f64::NEG_INFINITY;
    }
    (1.0 - fraction).ln()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::mtf::TimeframeAnalysis;
    use crate::analysis::Confluence;
    use crate::store::trades::Trade;
    use crate::store::trades::TrailingState;
    use crate::store::Db;
    use crate::types::{
        BrokerRole, ConfluenceStrength, EntryKind, SignalStatus, Timeframe, TradeStatus,
    };
    use rust_decimal_macros::dec;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn tf(timeframe: Timeframe) -> TimeframeAnalysis {
        TimeframeAnalysis {
            timeframe,
            candles: 50,
            tf_low: dec!(450),
            tf_high: dec!(520),
            range: dec!(70),
            max_drop: dec!(30),
            max_drop_pct: 0.06,
            num_zones: 17,
            current_zone: 1,
            in_buy_zone: true,
            buy_zone_score: 0.2,
            in_sell_zone: false,
            sell_zone_score: 1.0,
            drop_distribution: vec![1.0],
        }
    }

    fn signal(strength: ConfluenceStrength) -> Signal {
        let now = Utc::now();
        Signal {
            id: Uuid::new_v4(),
            symbol: "RELIANCE".to_string(),
            direction: Direction::Buy,
            strength,
            price: dec!(500),
            confluence: Confluence {
                direction: Direction::Buy,
                score: 0.3,
                strength,
                htf: tf(Timeframe::M125),
                itf: tf(Timeframe::M25),
                ltf: tf(Timeframe::M1),
            },
            status: SignalStatus::Active,
            created_at: now,
            expires_at: now + chrono::Duration::minutes(15),
        }
    }

    fn user_broker() -> UserBroker {
        UserBroker {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            broker_kind: "paper".to_string(),
            role: BrokerRole::Exec,
            credentials: serde_json::json!({}),
            active: true,
            connection_status: ConnectionStatus::Connected,
            session_expires_at: Some(Utc::now() + chrono::Duration::hours(6)),
            created_at: Utc::now(),
        }
    }

    fn ctx(user_id: Uuid) -> UserContext {
        UserContext {
            user_id,
            total_capital: dec!(100000),
            available_capital: dec!(100000),
            current_exposure: Decimal::ZERO,
            portfolio_frozen: false,
            allowed_symbols: None,
            kelly_fraction: dec!(0.2),
            lot_sizes: HashMap::new(),
            max_position_log_loss: 0.05,
            max_portfolio_log_loss: 0.10,
            max_exposure: dec!(50000),
        }
    }

    fn service() -> (ValidationService, TradeRepo) {
        let db = Arc::new(Db::open_in_memory().unwrap());
        let trades = TradeRepo::new(db);
        (ValidationService::new(trades.clone()), trades)
    }

    #[test]
    fn happy_path_kelly_sizing() {
        let (svc, _) = service();
        let ub = user_broker();
        let ctx = ctx(ub.user_id);
        let cfg = MtfConfig::default();

        // 0.2 * 1.0 * 100_000 = 20_000 budget; price 500 → 40 shares.
        let decision = svc
            .validate_entry(
                &signal(ConfluenceStrength::Strong),
                &ub,
                &ctx,
                &cfg,
                dec!(500),
                Utc::now(),
            )
            .unwrap();

        assert!(decision.passed, "errors: {:?}", decision.errors);
        assert_eq!(decision.quantity, 40);
        assert_eq!(decision.order_type, OrderType::Limit);
        // BUY limit is offset above the current price to improve fill odds.
        assert_eq!(decision.limit_price, Some(dec!(500.50)));
        assert_eq!(decision.exposure_after, dec!(20000));
        assert!(decision.log_impact < 0.0);
    }

    #[test]
    fn confluence_multiplier_scales_quantity() {
        let (svc, _) = service();
        let ub = user_broker();
        let ctx = ctx(ub.user_id);
        let cfg = MtfConfig::default();

        let strong = svc
            .validate_entry(&signal(ConfluenceStrength::Strong), &ub, &ctx, &cfg, dec!(500), Utc::now())
            .unwrap();
        let very_strong = svc
            .validate_entry(&signal(ConfluenceStrength::VeryStrong), &ub, &ctx, &cfg, dec!(500), Utc::now())
            .unwrap();
        let weak = svc
            .validate_entry(&signal(ConfluenceStrength::Weak), &ub, &ctx, &cfg, dec!(500), Utc::now())
            .unwrap();

        assert_eq!(strong.quantity, 40);
        assert_eq!(very_strong.quantity, 48); // 1.2x
        assert_eq!(weak.quantity, 24); // 0.6x
    }

    #[test]
    fn lot_size_floors_quantity() {
        let (svc, _) = service();
        let ub = user_broker();
        let mut ctx = ctx(ub.user_id);
        ctx.lot_sizes.insert("RELIANCE".to_string(), 15);
        let cfg = MtfConfig::default();

        let decision = svc
            .validate_entry(&signal(ConfluenceStrength::Strong), &ub, &ctx, &cfg, dec!(500), Utc::now())
            .unwrap();
        // 40 shares floored to lot 15 → 30.
        assert_eq!(decision.quantity, 30);
    }

    #[test]
    fn disconnected_broker_fails() {
        let (svc, _) = service();
        let mut ub = user_broker();
        ub.connection_status = ConnectionStatus::Disconnected;
        let ctx = ctx(ub.user_id);

        let decision = svc
            .validate_entry(
                &signal(ConfluenceStrength::Strong),
                &ub,
                &ctx,
                &MtfConfig::default(),
                dec!(500),
                Utc::now(),
            )
            .unwrap();
        assert!(!decision.passed);
        assert!(decision.errors.iter().any(|e| e.code == "BROKER_DISCONNECTED"));
    }

    #[test]
    fn expired_session_fails() {
        let (svc, _) = service();
        let mut ub = user_broker();
        ub.session_expires_at = Some(Utc::now() - chrono::Duration::minutes(1));
        let ctx = ctx(ub.user_id);

        let decision = svc
            .validate_entry(
                &signal(ConfluenceStrength::Strong),
                &ub,
                &ctx,
                &MtfConfig::default(),
                dec!(500),
                Utc::now(),
            )
            .unwrap();
        assert!(decision.errors.iter().any(|e| e.code == "SESSION_EXPIRED"));
    }

    #[test]
    fn symbol_allowlist_enforced() {
        let (svc, _) = service();
        let ub = user_broker();
        let mut ctx = ctx(ub.user_id);
        ctx.allowed_symbols = Some(HashSet::from(["TCS".to_string()]));

        let decision = svc
            .validate_entry(
                &signal(ConfluenceStrength::Strong),
                &ub,
                &ctx,
                &MtfConfig::default(),
                dec!(500),
                Utc::now(),
            )
            .unwrap();
        assert!(decision.errors.iter().any(|e| e.code == "SYMBOL_NOT_ALLOWED"));
    }

    #[test]
    fn duplicate_position_blocked_without_rebuy() {
        let (svc, trades) = service();
        let ub = user_broker();
        let ctx = ctx(ub.user_id);

        // Seed an EXITING trade — still counts as active.
        let now = Utc::now();
        let mut existing = Trade {
            id: Uuid::new_v4(),
            intent_id: Uuid::new_v4(),
            signal_id: Uuid::new_v4(),
            user_id: ub.user_id,
            user_broker_id: ub.id,
            symbol: "RELIANCE".to_string(),
            direction: Direction::Buy,
            entry_kind: EntryKind::NewBuy,
            product_type: ProductType::Delivery,
            order_type: OrderType::Limit,
            entry_qty: 10,
            filled_qty: 10,
            limit_price: None,
            entry_price: Some(dec!(490)),
            entry_time: Some(now),
            stop_price: None,
            target_price: None,
            trailing: TrailingState::default(),
            broker_order_id: None,
            exit_order_id: None,
            exit_price: None,
            exit_qty: 0,
            exit_reason: None,
            exit_time: None,
            realized_pnl: None,
            log_return: None,
            error_code: None,
            error_message: None,
            status: TradeStatus::Created,
            version: 1,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        existing = trades.upsert_for_intent(&existing).unwrap();
        existing.status = TradeStatus::EntrySubmitted;
        trades.update(&mut existing).unwrap();

        let cfg = MtfConfig::default();
        assert!(!cfg.allow_rebuy);
        let decision = svc
            .validate_entry(&signal(ConfluenceStrength::Strong), &ub, &ctx, &cfg, dec!(500), Utc::now())
            .unwrap();
        assert!(decision.errors.iter().any(|e| e.code == "DUPLICATE_POSITION"));

        // With rebuy allowed the same state passes the guard.
        let mut rebuy_cfg = cfg.clone();
        rebuy_cfg.allow_rebuy = true;
        rebuy_cfg.max_rebuys = 1;
        let decision = svc
            .validate_entry(&signal(ConfluenceStrength::Strong), &ub, &ctx, &rebuy_cfg, dec!(500), Utc::now())
            .unwrap();
        assert!(decision.passed, "errors: {:?}", decision.errors);
    }

    #[test]
    fn exposure_cap_blocks_oversized_entry() {
        let (svc, _) = service();
        let ub = user_broker();
        let mut ctx = ctx(ub.user_id);
        ctx.current_exposure = dec!(45000);

        let decision = svc
            .validate_entry(
                &signal(ConfluenceStrength::Strong),
                &ub,
                &ctx,
                &MtfConfig::default(),
                dec!(500),
                Utc::now(),
            )
            .unwrap();
        // 45_000 + 20_000 > 50_000 cap.
        assert!(decision.errors.iter().any(|e| e.code == "EXPOSURE_CAP_EXCEEDED"));
    }

    #[test]
    fn none_strength_yields_no_size() {
        let (svc, _) = service();
        let ub = user_broker();
        let ctx = ctx(ub.user_id);

        let decision = svc
            .validate_entry(
                &signal(ConfluenceStrength::None),
                &ub,
                &ctx,
                &MtfConfig::default(),
                dec!(500),
                Utc::now(),
            )
            .unwrap();
        assert!(!decision.passed);
        assert_eq!(decision.quantity, 0);
        assert!(decision.errors.iter().any(|e| e.code == "CAPITAL_INSUFFICIENT"));
    }

    #[test]
    fn market_entries_carry_no_limit() {
        let (svc, _) = service();
        let ub = user_broker();
        let ctx = ctx(ub.user_id);
        let mut cfg = MtfConfig::default();
        cfg.use_limit_entries = false;

        let decision = svc
            .validate_entry(&signal(ConfluenceStrength::Strong), &ub, &ctx, &cfg, dec!(500), Utc::now())
            .unwrap();
        assert_eq!(decision.order_type, OrderType::Market);
        assert!(decision.limit_price.is_none());
    }
}
