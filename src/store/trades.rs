// =============================================================================
// Trades, Trade Intents, Exit Intents — repositories
// =============================================================================
//
// A trade row exists before any broker call that references it, and only the
// trade actor writes trade rows after creation. Creation is an upsert keyed
// by intent_id: calling it twice returns the same trade. `broker_order_id`
// is unique among non-null values, so an order update can always be routed
// to exactly one trade.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::{
    parse_dec_opt, parse_dt, parse_dt_opt, parse_text, parse_text_opt, parse_uuid, Db,
};
use crate::types::{
    Direction, EntryKind, ExitIntentStatus, ExitReason, IntentStatus, OrderType, ProductType,
    TradeStatus,
};

/// A single named validation failure: what was checked, what was expected,
/// and what was found.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationError {
    pub code: String,
    pub field: String,
    pub expected: String,
    pub actual: String,
}

/// The validation outcome for one delivery. One intent per
/// (signal, user-broker) — the decision record, not the execution record.
#[derive(Debug, Clone)]
pub struct TradeIntent {
    pub id: Uuid,
    pub signal_id: Uuid,
    pub user_broker_id: Uuid,
    pub user_id: Uuid,
    pub symbol: String,
    pub direction: Direction,
    pub validation_passed: bool,
    pub errors: Vec<ValidationError>,
    pub quantity: i64,
    pub limit_price: Option<Decimal>,
    pub order_type: OrderType,
    pub product_type: ProductType,
    pub log_impact: f64,
    pub exposure_after: Decimal,
    pub status: IntentStatus,
    pub created_at: DateTime<Utc>,
}

/// Trailing-stop state carried on a trade.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TrailingState {
    pub highest_price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub active: bool,
}

/// The execution record of an approved intent.
#[derive(Debug, Clone)]
pub struct Trade {
    pub id: Uuid,
    pub intent_id: Uuid,
    pub signal_id: Uuid,
    pub user_id: Uuid,
    pub user_broker_id: Uuid,
    pub symbol: String,
    pub direction: Direction,
    pub entry_kind: EntryKind,
    pub product_type: ProductType,
    pub order_type: OrderType,
    pub entry_qty: i64,
    pub filled_qty: i64,
    pub limit_price: Option<Decimal>,
    pub entry_price: Option<Decimal>,
    pub entry_time: Option<DateTime<Utc>>,
    pub stop_price: Option<Decimal>,
    pub target_price: Option<Decimal>,
    pub trailing: TrailingState,
    pub broker_order_id: Option<String>,
    pub exit_order_id: Option<String>,
    pub exit_price: Option<Decimal>,
    pub exit_qty: i64,
    pub exit_reason: Option<ExitReason>,
    pub exit_time: Option<DateTime<Utc>>,
    pub realized_pnl: Option<Decimal>,
    pub log_return: Option<f64>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub status: TradeStatus,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// A logical exit attempt. `(trade_id, reason, episode)` distinguishes
/// retries of the same reason.
#[derive(Debug, Clone)]
pub struct ExitIntent {
    pub id: Uuid,
    pub trade_id: Uuid,
    pub reason: ExitReason,
    pub episode: i64,
    pub status: ExitIntentStatus,
    pub order_type: OrderType,
    pub quantity: i64,
    pub limit_price: Option<Decimal>,
    pub detected_price: Decimal,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Intent repository
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct IntentRepo {
    db: Arc<Db>,
}

impl IntentRepo {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    /// Insert an intent. A duplicate `(signal_id, user_broker_id)` is treated
    /// as success for the caller: the existing row is returned instead.
    pub fn insert(&self, intent: &TradeIntent) -> Result<TradeIntent> {
        let errors_json =
            serde_json::to_string(&intent.errors).context("failed to serialise intent errors")?;
        let inserted = self.db.with(|conn| {
            let n = conn.execute(
                "INSERT OR IGNORE INTO trade_intents
                    (id, signal_id, user_broker_id, user_id, symbol, direction,
                     validation_passed, errors_json, quantity, limit_price, order_type,
                     product_type, log_impact, exposure_after, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                params![
                    intent.id.to_string(),
                    intent.signal_id.to_string(),
                    intent.user_broker_id.to_string(),
                    intent.user_id.to_string(),
                    intent.symbol,
                    intent.direction.as_str(),
                    intent.validation_passed as i64,
                    errors_json,
                    intent.quantity,
                    intent.limit_price.map(|p| p.to_string()),
                    intent.order_type.as_str(),
                    intent.product_type.as_str(),
                    intent.log_impact,
                    intent.exposure_after.to_string(),
                    intent.status.as_str(),
                    intent.created_at.to_rfc3339(),
                ],
            )?;
            Ok(n)
        })?;

        if inserted == 1 {
            return Ok(intent.clone());
        }
        self.find_by_natural_key(intent.signal_id, intent.user_broker_id)?
            .context("intent insert ignored but no existing row found")
    }

    pub fn get(&self, id: Uuid) -> Result<Option<TradeIntent>> {
        self.db.with(|conn| {
            conn.query_row(
                &format!("{INTENT_SELECT} WHERE id = ?1"),
                params![id.to_string()],
                row_to_intent,
            )
            .optional()
            .context("failed to load intent")
        })
    }

    pub fn find_by_natural_key(
        &self,
        signal_id: Uuid,
        user_broker_id: Uuid,
    ) -> Result<Option<TradeIntent>> {
        self.db.with(|conn| {
            conn.query_row(
                &format!("{INTENT_SELECT} WHERE signal_id = ?1 AND user_broker_id = ?2"),
                params![signal_id.to_string(), user_broker_id.to_string()],
                row_to_intent,
            )
            .optional()
            .context("failed to load intent by natural key")
        })
    }

    pub fn set_status(&self, id: Uuid, status: IntentStatus) -> Result<()> {
        self.db.with(|conn| {
            conn.execute(
                "UPDATE trade_intents SET status = ?2 WHERE id = ?1",
                params![id.to_string(), status.as_str()],
            )?;
            Ok(())
        })
    }
}

const INTENT_SELECT: &str = "SELECT id, signal_id, user_broker_id, user_id, symbol, direction,
    validation_passed, errors_json, quantity, limit_price, order_type, product_type,
    log_impact, exposure_after, status, created_at FROM trade_intents";

fn row_to_intent(row: &rusqlite::Row<'_>) -> rusqlite::Result<TradeIntent> {
    let errors_json: String = row.get(7)?;
    Ok(TradeIntent {
        id: parse_uuid(row.get(0)?)?,
        signal_id: parse_uuid(row.get(1)?)?,
        user_broker_id: parse_uuid(row.get(2)?)?,
        user_id: parse_uuid(row.get(3)?)?,
        symbol: row.get(4)?,
        direction: parse_text(row.get::<_, String>(5)?)?,
        validation_passed: row.get::<_, i64>(6)? != 0,
        errors: serde_json::from_str(&errors_json).map_err(crate::store::conv_err)?,
        quantity: row.get(8)?,
        limit_price: parse_dec_opt(row.get(9)?)?,
        order_type: parse_text(row.get::<_, String>(10)?)?,
        product_type: parse_text(row.get::<_, String>(11)?)?,
        log_impact: row.get(12)?,
        exposure_after: crate::store::parse_dec(row.get(13)?)?,
        status: parse_text(row.get::<_, String>(14)?)?,
        created_at: parse_dt(row.get(15)?)?,
    })
}

// ---------------------------------------------------------------------------
// Trade repository
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct TradeRepo {
    db: Arc<Db>,
}

impl TradeRepo {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    /// Idempotent creation keyed by `intent_id`: the first call inserts, any
    /// later call returns the already-created trade unchanged.
    pub fn upsert_for_intent(&self, trade: &Trade) -> Result<Trade> {
        self.db.with(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO trades
                    (id, intent_id, signal_id, user_id, user_broker_id, symbol, direction,
                     entry_kind, product_type, order_type, entry_qty, filled_qty, limit_price,
                     status, version, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 0, ?12, ?13, 1, ?14, ?14)",
                params![
                    trade.id.to_string(),
                    trade.intent_id.to_string(),
                    trade.signal_id.to_string(),
                    trade.user_id.to_string(),
                    trade.user_broker_id.to_string(),
                    trade.symbol,
                    trade.direction.as_str(),
                    trade.entry_kind.as_str(),
                    trade.product_type.as_str(),
                    trade.order_type.as_str(),
                    trade.entry_qty,
                    trade.limit_price.map(|p| p.to_string()),
                    trade.status.as_str(),
                    trade.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })?;
        self.find_by_intent_id(trade.intent_id)?
            .context("trade upsert left no row behind")
    }

    /// Persist every mutable field of a trade, bumping its version. Only the
    /// trade actor calls this.
    pub fn update(&self, trade: &mut Trade) -> Result<()> {
        trade.version += 1;
        trade.updated_at = Utc::now();
        self.db.with(|conn| {
            let changed = conn.execute(
                "UPDATE trades SET
                    status = ?2, entry_qty = ?3, filled_qty = ?4, limit_price = ?5,
                    entry_price = ?6, entry_time = ?7, stop_price = ?8, target_price = ?9,
                    trail_highest = ?10, trail_stop = ?11, trail_active = ?12,
                    broker_order_id = ?13, exit_order_id = ?14, exit_price = ?15,
                    exit_qty = ?16, exit_reason = ?17, exit_time = ?18, realized_pnl = ?19,
                    log_return = ?20, error_code = ?21, error_message = ?22,
                    version = ?23, updated_at = ?24, deleted_at = ?25
                 WHERE id = ?1",
                params![
                    trade.id.to_string(),
                    trade.status.as_str(),
                    trade.entry_qty,
                    trade.filled_qty,
                    trade.limit_price.map(|p| p.to_string()),
                    trade.entry_price.map(|p| p.to_string()),
                    trade.entry_time.map(|t| t.to_rfc3339()),
                    trade.stop_price.map(|p| p.to_string()),
                    trade.target_price.map(|p| p.to_string()),
                    trade.trailing.highest_price.map(|p| p.to_string()),
                    trade.trailing.stop_price.map(|p| p.to_string()),
                    trade.trailing.active as i64,
                    trade.broker_order_id,
                    trade.exit_order_id,
                    trade.exit_price.map(|p| p.to_string()),
                    trade.exit_qty,
                    trade.exit_reason.map(|r| r.as_str()),
                    trade.exit_time.map(|t| t.to_rfc3339()),
                    trade.realized_pnl.map(|p| p.to_string()),
                    trade.log_return,
                    trade.error_code,
                    trade.error_message,
                    trade.version,
                    trade.updated_at.to_rfc3339(),
                    trade.deleted_at.map(|t| t.to_rfc3339()),
                ],
            )?;
            anyhow::ensure!(changed == 1, "trade {} vanished during update", trade.id);
            Ok(())
        })
    }

    pub fn find_by_id(&self, id: Uuid) -> Result<Option<Trade>> {
        self.query_one(&format!("{TRADE_SELECT} WHERE id = ?1"), id.to_string())
    }

    pub fn find_by_intent_id(&self, intent_id: Uuid) -> Result<Option<Trade>> {
        self.query_one(
            &format!("{TRADE_SELECT} WHERE intent_id = ?1"),
            intent_id.to_string(),
        )
    }

    pub fn find_by_broker_order_id(&self, broker_order_id: &str) -> Result<Option<Trade>> {
        self.query_one(
            &format!("{TRADE_SELECT} WHERE broker_order_id = ?1 OR exit_order_id = ?1"),
            broker_order_id.to_string(),
        )
    }

    /// Non-terminal, non-deleted trades for (user, symbol); the duplicate
    /// guard and rebuy classifier count these. EXITING counts as active.
    pub fn count_active(&self, user_id: Uuid, symbol: &str) -> Result<i64> {
        self.db.with(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM trades
                 WHERE user_id = ?1 AND symbol = ?2 AND deleted_at IS NULL
                   AND status NOT IN ('CLOSED', 'REJECTED', 'CANCELLED')",
                params![user_id.to_string(), symbol],
                |row| row.get(0),
            )?)
        })
    }

    pub fn count_active_directional(
        &self,
        user_id: Uuid,
        symbol: &str,
        direction: Direction,
    ) -> Result<i64> {
        self.db.with(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM trades
                 WHERE user_id = ?1 AND symbol = ?2 AND direction = ?3 AND deleted_at IS NULL
                   AND status NOT IN ('CLOSED', 'REJECTED', 'CANCELLED')",
                params![user_id.to_string(), symbol, direction.as_str()],
                |row| row.get(0),
            )?)
        })
    }

    /// All trades in any of `statuses` (reconciler, startup index rebuild).
    pub fn list_by_status(&self, statuses: &[TradeStatus]) -> Result<Vec<Trade>> {
        let set = statuses
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        self.db.with(|conn| {
            let sql = format!(
                "{TRADE_SELECT} WHERE status IN ({set}) AND deleted_at IS NULL ORDER BY created_at"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], row_to_trade)?;
            Ok(rows.collect::<rusqlite::Result<_>>()?)
        })
    }

    /// Soft delete for the audit trail; the row stays queryable by id.
    pub fn soft_delete(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        self.db.with(|conn| {
            let changed = conn.execute(
                "UPDATE trades SET deleted_at = ?2 WHERE id = ?1 AND deleted_at IS NULL",
                params![id.to_string(), now.to_rfc3339()],
            )?;
            Ok(changed == 1)
        })
    }

    fn query_one(&self, sql: &str, key: String) -> Result<Option<Trade>> {
        self.db.with(|conn| {
            conn.query_row(sql, params![key], row_to_trade)
                .optional()
                .context("failed to load trade")
        })
    }
}

const TRADE_SELECT: &str = "SELECT id, intent_id, signal_id, user_id, user_broker_id, symbol,
    direction, entry_kind, product_type, order_type, entry_qty, filled_qty, limit_price,
    entry_price, entry_time, stop_price, target_price, trail_highest, trail_stop, trail_active,
    broker_order_id, exit_order_id, exit_price, exit_qty, exit_reason, exit_time, realized_pnl,
    log_return, error_code, error_message, status, version, created_at, updated_at, deleted_at
    FROM trades";

fn row_to_trade(row: &rusqlite::Row<'_>) -> rusqlite::Result<Trade> {
    Ok(Trade {
        id: parse_uuid(row.get(0)?)?,
        intent_id: parse_uuid(row.get(1)?)?,
        signal_id: parse_uuid(row.get(2)?)?,
        user_id: parse_uuid(row.get(3)?)?,
        user_broker_id: parse_uuid(row.get(4)?)?,
        symbol: row.get(5)?,
        direction: parse_text(row.get::<_, String>(6)?)?,
        entry_kind: parse_text(row.get::<_, String>(7)?)?,
        product_type: parse_text(row.get::<_, String>(8)?)?,
        order_type: parse_text(row.get::<_, String>(9)?)?,
        entry_qty: row.get(10)?,
        filled_qty: row.get(11)?,
        limit_price: parse_dec_opt(row.get(12)?)?,
        entry_price: parse_dec_opt(row.get(13)?)?,
        entry_time: parse_dt_opt(row.get(14)?)?,
        stop_price: parse_dec_opt(row.get(15)?)?,
        target_price: parse_dec_opt(row.get(16)?)?,
        trailing: TrailingState {
            highest_price: parse_dec_opt(row.get(17)?)?,
            stop_price: parse_dec_opt(row.get(18)?)?,
            active: row.get::<_, i64>(19)? != 0,
        },
        broker_order_id: row.get(20)?,
        exit_order_id: row.get(21)?,
        exit_price: parse_dec_opt(row.get(22)?)?,
        exit_qty: row.get(23)?,
        exit_reason: parse_text_opt(row.get(24)?)?,
        exit_time: parse_dt_opt(row.get(25)?)?,
        realized_pnl: parse_dec_opt(row.get(26)?)?,
        log_return: row.get(27)?,
        error_code: row.get(28)?,
        error_message: row.get(29)?,
        status: parse_text(row.get::<_, String>(30)?)?,
        version: row.get(31)?,
        created_at: parse_dt(row.get(32)?)?,
        updated_at: parse_dt(row.get(33)?)?,
        deleted_at: parse_dt_opt(row.get(34)?)?,
    })
}

// ---------------------------------------------------------------------------
// Exit intent repository
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ExitIntentRepo {
    db: Arc<Db>,
}

impl ExitIntentRepo {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    pub fn insert(&self, intent: &ExitIntent) -> Result<()> {
        self.db.with(|conn| {
            conn.execute(
                "INSERT INTO exit_intents
                    (id, trade_id, reason, episode, status, order_type, quantity,
                     limit_price, detected_price, error_message, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    intent.id.to_string(),
                    intent.trade_id.to_string(),
                    intent.reason.as_str(),
                    intent.episode,
                    intent.status.as_str(),
                    intent.order_type.as_str(),
                    intent.quantity,
                    intent.limit_price.map(|p| p.to_string()),
                    intent.detected_price.to_string(),
                    intent.error_message,
                    intent.created_at.to_rfc3339(),
                    intent.updated_at.to_rfc3339(),
                ],
            )
            .context("failed to insert exit intent")?;
            Ok(())
        })
    }

    pub fn get(&self, id: Uuid) -> Result<Option<ExitIntent>> {
        self.db.with(|conn| {
            conn.query_row(
                &format!("{EXIT_SELECT} WHERE id = ?1"),
                params![id.to_string()],
                row_to_exit_intent,
            )
            .optional()
            .context("failed to load exit intent")
        })
    }

    /// Next episode number for (trade, reason): one past the highest used.
    pub fn next_episode(&self, trade_id: Uuid, reason: ExitReason) -> Result<i64> {
        self.db.with(|conn| {
            Ok(conn.query_row(
                "SELECT COALESCE(MAX(episode), 0) + 1 FROM exit_intents
                 WHERE trade_id = ?1 AND reason = ?2",
                params![trade_id.to_string(), reason.as_str()],
                |row| row.get(0),
            )?)
        })
    }

    /// The single in-flight exit intent of a trade, if any. At most one
    /// non-terminal intent exists per trade.
    pub fn non_terminal_for_trade(&self, trade_id: Uuid) -> Result<Option<ExitIntent>> {
        self.db.with(|conn| {
            conn.query_row(
                &format!(
                    "{EXIT_SELECT} WHERE trade_id = ?1
                     AND status IN ('PENDING', 'APPROVED', 'PLACED')
                     LIMIT 1"
                ),
                params![trade_id.to_string()],
                row_to_exit_intent,
            )
            .optional()
            .context("failed to load exit intent")
        })
    }

    pub fn set_status(
        &self,
        id: Uuid,
        status: ExitIntentStatus,
        error_message: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.db.with(|conn| {
            conn.execute(
                "UPDATE exit_intents
                 SET status = ?2, error_message = COALESCE(?3, error_message), updated_at = ?4
                 WHERE id = ?1",
                params![id.to_string(), status.as_str(), error_message, now.to_rfc3339()],
            )?;
            Ok(())
        })
    }
}

const EXIT_SELECT: &str = "SELECT id, trade_id, reason, episode, status, order_type, quantity,
    limit_price, detected_price, error_message, created_at, updated_at FROM exit_intents";

fn row_to_exit_intent(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExitIntent> {
    Ok(ExitIntent {
        id: parse_uuid(row.get(0)?)?,
        trade_id: parse_uuid(row.get(1)?)?,
        reason: parse_text(row.get::<_, String>(2)?)?,
        episode: row.get(3)?,
        status: parse_text(row.get::<_, String>(4)?)?,
        order_type: parse_text(row.get::<_, String>(5)?)?,
        quantity: row.get(6)?,
        limit_price: parse_dec_opt(row.get(7)?)?,
        detected_price: crate::store::parse_dec(row.get(8)?)?,
        error_message: row.get(9)?,
        created_at: parse_dt(row.get(10)?)?,
        updated_at: parse_dt(row.get(11)?)?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    pub(crate) fn sample_trade(intent_id: Uuid) -> Trade {
        let now = Utc::now();
        Trade {
            id: Uuid::new_v5(&Uuid::NAMESPACE_OID, intent_id.as_bytes()),
            intent_id,
            signal_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            user_broker_id: Uuid::new_v4(),
            symbol: "RELIANCE".to_string(),
            direction: Direction::Buy,
            entry_kind: EntryKind::NewBuy,
            product_type: ProductType::Delivery,
            order_type: OrderType::Limit,
            entry_qty: 10,
            filled_qty: 0,
            limit_price: Some(dec!(2900.10)),
            entry_price: None,
            entry_time: None,
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
        }
    }

    fn repos() -> (TradeRepo, IntentRepo, ExitIntentRepo) {
        let db = Arc::new(Db::open_in_memory().unwrap());
        (
            TradeRepo::new(db.clone()),
            IntentRepo::new(db.clone()),
            ExitIntentRepo::new(db),
        )
    }

    fn sample_intent() -> TradeIntent {
        TradeIntent {
            id: Uuid::new_v4(),
            signal_id: Uuid::new_v4(),
            user_broker_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            symbol: "RELIANCE".to_string(),
            direction: Direction::Buy,
            validation_passed: true,
            errors: Vec::new(),
            quantity: 10,
            limit_price: Some(dec!(2900.10)),
            order_type: OrderType::Limit,
            product_type: ProductType::Delivery,
            log_impact: -0.002,
            exposure_after: dec!(29001),
            status: IntentStatus::Approved,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn trade_creation_is_idempotent_by_intent() {
        let (trades, _, _) = repos();
        let intent_id = Uuid::new_v4();
        let t = sample_trade(intent_id);

        let first = trades.upsert_for_intent(&t).unwrap();
        let second = trades.upsert_for_intent(&t).unwrap();
        assert_eq!(first.id, second.id);

        let count: i64 = trades
            .db
            .with(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM trades", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn trade_update_roundtrip_bumps_version() {
        let (trades, _, _) = repos();
        let mut t = trades.upsert_for_intent(&sample_trade(Uuid::new_v4())).unwrap();
        assert_eq!(t.version, 1);

        t.status = TradeStatus::EntrySubmitted;
        t.broker_order_id = Some("ORD-1001".to_string());
        trades.update(&mut t).unwrap();

        let got = trades.find_by_id(t.id).unwrap().unwrap();
        assert_eq!(got.status, TradeStatus::EntrySubmitted);
        assert_eq!(got.broker_order_id.as_deref(), Some("ORD-1001"));
        assert_eq!(got.version, 2);
    }

    #[test]
    fn broker_order_id_routes_entry_and_exit_orders() {
        let (trades, _, _) = repos();
        let mut t = trades.upsert_for_intent(&sample_trade(Uuid::new_v4())).unwrap();
        t.broker_order_id = Some("ORD-ENTRY".to_string());
        t.exit_order_id = Some("ORD-EXIT".to_string());
        trades.update(&mut t).unwrap();

        assert_eq!(
            trades.find_by_broker_order_id("ORD-ENTRY").unwrap().unwrap().id,
            t.id
        );
        assert_eq!(
            trades.find_by_broker_order_id("ORD-EXIT").unwrap().unwrap().id,
            t.id
        );
        assert!(trades.find_by_broker_order_id("ORD-NONE").unwrap().is_none());
    }

    #[test]
    fn active_counts_include_exiting() {
        let (trades, _, _) = repos();
        let mut t = sample_trade(Uuid::new_v4());
        let user = t.user_id;
        t = trades.upsert_for_intent(&t).unwrap();
        t.status = TradeStatus::EntrySubmitted;
        trades.update(&mut t).unwrap();
        t.status = TradeStatus::Pending;
        trades.update(&mut t).unwrap();

        assert_eq!(trades.count_active(user, "RELIANCE").unwrap(), 1);

        // A closed trade no longer counts.
        let mut other = sample_trade(Uuid::new_v4());
        other.user_id = user;
        let mut other = trades.upsert_for_intent(&other).unwrap();
        other.status = TradeStatus::Closed;
        trades.update(&mut other).unwrap();

        assert_eq!(trades.count_active(user, "RELIANCE").unwrap(), 1);
        assert_eq!(
            trades
                .count_active_directional(user, "RELIANCE", Direction::Buy)
                .unwrap(),
            1
        );
    }

    #[test]
    fn intent_duplicate_returns_existing_row() {
        let (_, intents, _) = repos();
        let a = sample_intent();
        let stored = intents.insert(&a).unwrap();
        assert_eq!(stored.id, a.id);

        // Same natural key, different id: existing row wins.
        let mut b = a.clone();
        b.id = Uuid::new_v4();
        let stored = intents.insert(&b).unwrap();
        assert_eq!(stored.id, a.id);
    }

    #[test]
    fn intent_errors_roundtrip() {
        let (_, intents, _) = repos();
        let mut intent = sample_intent();
        intent.validation_passed = false;
        intent.status = IntentStatus::Rejected;
        intent.errors = vec![ValidationError {
            code: "CAPITAL_INSUFFICIENT".to_string(),
            field: "quantity".to_string(),
            expected: ">= 1".to_string(),
            actual: "0".to_string(),
        }];
        intents.insert(&intent).unwrap();

        let got = intents.get(intent.id).unwrap().unwrap();
        assert!(!got.validation_passed);
        assert_eq!(got.errors.len(), 1);
        assert_eq!(got.errors[0].code, "CAPITAL_INSUFFICIENT");
    }

    #[test]
    fn exit_intent_episode_numbering_and_uniqueness() {
        let (_, _, exits) = repos();
        let trade_id = Uuid::new_v4();
        assert_eq!(exits.next_episode(trade_id, ExitReason::StopLoss).unwrap(), 1);

        let now = Utc::now();
        let mut intent = ExitIntent {
            id: Uuid::new_v4(),
            trade_id,
            reason: ExitReason::StopLoss,
            episode: 1,
            status: ExitIntentStatus::Pending,
            order_type: OrderType::Market,
            quantity: 10,
            limit_price: None,
            detected_price: dec!(2850),
            error_message: None,
            created_at: now,
            updated_at: now,
        };
        exits.insert(&intent).unwrap();
        assert_eq!(exits.next_episode(trade_id, ExitReason::StopLoss).unwrap(), 2);

        // Duplicate (trade, reason, episode) violates uniqueness.
        intent.id = Uuid::new_v4();
        assert!(exits.insert(&intent).is_err());
    }

    #[test]
    fn non_terminal_exit_intent_lookup() {
        let (_, _, exits) = repos();
        let trade_id = Uuid::new_v4();
        let now = Utc::now();
        let intent = ExitIntent {
            id: Uuid::new_v4(),
            trade_id,
            reason: ExitReason::TargetHit,
            episode: 1,
            status: ExitIntentStatus::Placed,
            order_type: OrderType::Limit,
            quantity: 5,
            limit_price: Some(dec!(3000)),
            detected_price: dec!(3000),
            error_message: None,
            created_at: now,
            updated_at: now,
        };
        exits.insert(&intent).unwrap();

        let live = exits.non_terminal_for_trade(trade_id).unwrap().unwrap();
        assert_eq!(live.id, intent.id);

        exits
            .set_status(intent.id, ExitIntentStatus::Filled, None, Utc::now())
            .unwrap();
        assert!(exits.non_terminal_for_trade(trade_id).unwrap().is_none());
    }
}
