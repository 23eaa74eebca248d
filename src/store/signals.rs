// =============================================================================
// Signals & Deliveries — signal rows and the per-user-broker fan-out ledger
// =============================================================================
//
// The delivery table is the sole handoff between the global signal stream
// and per-user execution. `consume` is the at-most-once gate: a single
// guarded UPDATE that only one caller can win.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::analysis::Confluence;
use crate::store::{parse_dt, parse_text, parse_uuid, parse_uuid_opt, Db};
use crate::types::{ConfluenceStrength, DeliveryStatus, Direction, SignalStatus};

/// A persisted trading signal. Written only by the signal service.
#[derive(Debug, Clone)]
pub struct Signal {
    pub id: Uuid,
    pub symbol: String,
    pub direction: Direction,
    pub strength: ConfluenceStrength,
    /// Price of the symbol when the signal was emitted.
    pub price: Decimal,
    pub confluence: Confluence,
    pub status: SignalStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// One fan-out row pairing a signal with an EXEC user-broker.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: Uuid,
    pub signal_id: Uuid,
    pub user_broker_id: Uuid,
    pub status: DeliveryStatus,
    pub intent_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
}

// ---------------------------------------------------------------------------
// Signal repository
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct SignalRepo {
    db: Arc<Db>,
}

impl SignalRepo {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    pub fn insert(&self, signal: &Signal) -> Result<()> {
        let confluence_json =
            serde_json::to_string(&signal.confluence).context("failed to serialise confluence")?;
        self.db.with(|conn| {
            conn.execute(
                "INSERT INTO signals
                    (id, symbol, direction, strength, price, confluence_json, status,
                     created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    signal.id.to_string(),
                    signal.symbol,
                    signal.direction.as_str(),
                    signal.strength.as_str(),
                    signal.price.to_string(),
                    confluence_json,
                    signal.status.as_str(),
                    signal.created_at.to_rfc3339(),
                    signal.expires_at.to_rfc3339(),
                ],
            )
            .context("failed to insert signal")?;
            Ok(())
        })
    }

    pub fn get(&self, id: Uuid) -> Result<Option<Signal>> {
        self.db.with(|conn| {
            conn.query_row(
                "SELECT id, symbol, direction, strength, price, confluence_json, status,
                        created_at, expires_at
                 FROM signals WHERE id = ?1",
                params![id.to_string()],
                row_to_signal,
            )
            .optional()
            .context("failed to load signal")
        })
    }

    /// Whether an ACTIVE signal already exists for (symbol, direction) —
    /// the emission dedupe guard.
    pub fn has_active(&self, symbol: &str, direction: Direction) -> Result<bool> {
        self.db.with(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM signals
                 WHERE symbol = ?1 AND direction = ?2 AND status = 'ACTIVE'",
                params![symbol, direction.as_str()],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
    }

    /// Expire ACTIVE signals whose TTL has elapsed; returns the expired ids.
    pub fn expire_due(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        self.db.with(|conn| {
            let tx = conn.unchecked_transaction()?;
            let ids: Vec<Uuid> = {
                let mut stmt = tx.prepare(
                    "SELECT id FROM signals WHERE status = 'ACTIVE' AND expires_at <= ?1",
                )?;
                let rows = stmt.query_map(params![now.to_rfc3339()], |row| {
                    parse_uuid(row.get(0)?)
                })?;
                rows.collect::<rusqlite::Result<_>>()?
            };
            tx.execute(
                "UPDATE signals SET status = 'EXPIRED'
                 WHERE status = 'ACTIVE' AND expires_at <= ?1",
                params![now.to_rfc3339()],
            )?;
            tx.commit()?;
            Ok(ids)
        })
    }

    /// Mark ACTIVE signals STALE — scoped to one symbol when given — but
    /// only those not referenced by any trade. The guard and the update are
    /// one statement, so a concurrently created trade either blocks the
    /// stale transition or references a still-ACTIVE signal.
    pub fn mark_stale(&self, symbol: Option<&str>) -> Result<Vec<Uuid>> {
        self.db.with(|conn| {
            let tx = conn.unchecked_transaction()?;
            let ids: Vec<Uuid> = {
                let mut stmt = tx.prepare(
                    "SELECT id FROM signals
                     WHERE status = 'ACTIVE'
                       AND (?1 IS NULL OR symbol = ?1)
                       AND NOT EXISTS (
                           SELECT 1 FROM trades WHERE trades.signal_id = signals.id
                       )",
                )?;
                let rows = stmt.query_map(params![symbol], |row| parse_uuid(row.get(0)?))?;
                rows.collect::<rusqlite::Result<_>>()?
            };
            tx.execute(
                "UPDATE signals SET status = 'STALE'
                 WHERE status = 'ACTIVE'
                   AND (?1 IS NULL OR symbol = ?1)
                   AND NOT EXISTS (
                       SELECT 1 FROM trades WHERE trades.signal_id = signals.id
                   )",
                params![symbol],
            )?;
            tx.commit()?;
            Ok(ids)
        })
    }

    pub fn set_status(&self, id: Uuid, status: SignalStatus) -> Result<bool> {
        self.db.with(|conn| {
            let changed = conn.execute(
                "UPDATE signals SET status = ?2 WHERE id = ?1 AND status = 'ACTIVE'",
                params![id.to_string(), status.as_str()],
            )?;
            Ok(changed == 1)
        })
    }
}

fn row_to_signal(row: &rusqlite::Row<'_>) -> rusqlite::Result<Signal> {
    let confluence_json: String = row.get(5)?;
    Ok(Signal {
        id: parse_uuid(row.get(0)?)?,
        symbol: row.get(1)?,
        direction: parse_text(row.get::<_, String>(2)?)?,
        strength: parse_text(row.get::<_, String>(3)?)?,
        price: crate::store::parse_dec(row.get(4)?)?,
        confluence: serde_json::from_str(&confluence_json).map_err(crate::store::conv_err)?,
        status: parse_text(row.get::<_, String>(6)?)?,
        created_at: parse_dt(row.get(7)?)?,
        expires_at: parse_dt(row.get(8)?)?,
    })
}

// ---------------------------------------------------------------------------
// Delivery registry
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct DeliveryRegistry {
    db: Arc<Db>,
}

impl DeliveryRegistry {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    /// Insert one CREATED delivery per eligible user-broker. Duplicate
    /// (signal, user-broker) pairs are ignored, so fan-out is idempotent.
    pub fn create_for_signal(
        &self,
        signal_id: Uuid,
        user_broker_ids: &[Uuid],
        now: DateTime<Utc>,
    ) -> Result<Vec<Delivery>> {
        self.db.with(|conn| {
            let tx = conn.unchecked_transaction()?;
            let mut created = Vec::with_capacity(user_broker_ids.len());
            for ub in user_broker_ids {
                let id = Uuid::new_v4();
                let inserted = tx.execute(
                    "INSERT OR IGNORE INTO signal_deliveries
                        (id, signal_id, user_broker_id, status, intent_id, created_at, updated_at, version)
                     VALUES (?1, ?2, ?3, 'CREATED', NULL, ?4, ?4, 1)",
                    params![
                        id.to_string(),
                        signal_id.to_string(),
                        ub.to_string(),
                        now.to_rfc3339(),
                    ],
                )?;
                if inserted == 1 {
                    created.push(Delivery {
                        id,
                        signal_id,
                        user_broker_id: *ub,
                        status: DeliveryStatus::Created,
                        intent_id: None,
                        created_at: now,
                        updated_at: now,
                        version: 1,
                    });
                }
            }
            tx.commit()?;
            Ok(created)
        })
    }

    pub fn get(&self, id: Uuid) -> Result<Option<Delivery>> {
        self.db.with(|conn| {
            conn.query_row(
                "SELECT id, signal_id, user_broker_id, status, intent_id,
                        created_at, updated_at, version
                 FROM signal_deliveries WHERE id = ?1",
                params![id.to_string()],
                row_to_delivery,
            )
            .optional()
            .context("failed to load delivery")
        })
    }

    /// Deliveries still awaiting consumption, oldest first.
    pub fn pending(&self, limit: usize) -> Result<Vec<Delivery>> {
        self.db.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, signal_id, user_broker_id, status, intent_id,
                        created_at, updated_at, version
                 FROM signal_deliveries
                 WHERE status IN ('CREATED', 'DELIVERED')
                 ORDER BY created_at ASC
                 LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], row_to_delivery)?;
            Ok(rows.collect::<rusqlite::Result<_>>()?)
        })
    }

    pub fn mark_delivered(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        self.set_status_guarded(id, DeliveryStatus::Delivered, "('CREATED')", now)
    }

    pub fn mark_rejected(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        self.set_status_guarded(
            id,
            DeliveryStatus::Rejected,
            "('CREATED', 'DELIVERED')",
            now,
        )
    }

    pub fn mark_expired(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        self.set_status_guarded(
            id,
            DeliveryStatus::Expired,
            "('CREATED', 'DELIVERED')",
            now,
        )
    }

    /// Expire every unconsumed delivery of a signal (TTL lapse or stale).
    pub fn expire_for_signal(&self, signal_id: Uuid, now: DateTime<Utc>) -> Result<usize> {
        self.db.with(|conn| {
            let changed = conn.execute(
                "UPDATE signal_deliveries
                 SET status = 'EXPIRED', updated_at = ?2, version = version + 1
                 WHERE signal_id = ?1 AND status IN ('CREATED', 'DELIVERED')",
                params![signal_id.to_string(), now.to_rfc3339()],
            )?;
            Ok(changed)
        })
    }

    /// The atomic consume: DELIVERED/CREATED → CONSUMED with the intent id
    /// set, in one guarded UPDATE. Returns false when another caller already
    /// consumed the row or it left the eligible set.
    pub fn consume(&self, delivery_id: Uuid, intent_id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        self.db.with(|conn| {
            let changed = conn.execute(
                "UPDATE signal_deliveries
                 SET status = 'CONSUMED', intent_id = ?2, updated_at = ?3, version = version + 1
                 WHERE id = ?1
                   AND status IN ('CREATED', 'DELIVERED')
                   AND intent_id IS NULL",
                params![
                    delivery_id.to_string(),
                    intent_id.to_string(),
                    now.to_rfc3339(),
                ],
            )?;
            Ok(changed == 1)
        })
    }

    fn set_status_guarded(
        &self,
        id: Uuid,
        to: DeliveryStatus,
        eligible: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.db.with(|conn| {
            let sql = format!(
                "UPDATE signal_deliveries
                 SET status = ?2, updated_at = ?3, version = version + 1
                 WHERE id = ?1 AND status IN {eligible}"
            );
            let changed = conn.execute(
                &sql,
                params![id.to_string(), to.as_str(), now.to_rfc3339()],
            )?;
            Ok(changed == 1)
        })
    }
}

fn row_to_delivery(row: &rusqlite::Row<'_>) -> rusqlite::Result<Delivery> {
    Ok(Delivery {
        id: parse_uuid(row.get(0)?)?,
        signal_id: parse_uuid(row.get(1)?)?,
        user_broker_id: parse_uuid(row.get(2)?)?,
        status: parse_text(row.get::<_, String>(3)?)?,
        intent_id: parse_uuid_opt(row.get(4)?)?,
        created_at: parse_dt(row.get(5)?)?,
        updated_at: parse_dt(row.get(6)?)?,
        version: row.get(7)?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::mtf::TimeframeAnalysis;
    use crate::types::Timeframe;
    use rust_decimal_macros::dec;

    fn tf(timeframe: Timeframe) -> TimeframeAnalysis {
        TimeframeAnalysis {
            timeframe,
            candles: 50,
            tf_low: dec!(100),
            tf_high: dec!(120),
            range: dec!(20),
            max_drop: dec!(10),
            max_drop_pct: 0.1,
            num_zones: 10,
            current_zone: 1,
            in_buy_zone: true,
            buy_zone_score: 0.1,
            in_sell_zone: false,
            sell_zone_score: 1.0,
            drop_distribution: vec![1.0, 0.4],
        }
    }

    fn signal(symbol: &str) -> Signal {
        let now = Utc::now();
        Signal {
            id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            direction: Direction::Buy,
            strength: ConfluenceStrength::Strong,
            price: dec!(104),
            confluence: Confluence {
                direction: Direction::Buy,
                score: 0.3,
                strength: ConfluenceStrength::Strong,
                htf: tf(Timeframe::M125),
                itf: tf(Timeframe::M25),
                ltf: tf(Timeframe::M1),
            },
            status: SignalStatus::Active,
            created_at: now,
            expires_at: now + chrono::Duration::minutes(15),
        }
    }

    fn setup() -> (Arc<Db>, SignalRepo, DeliveryRegistry) {
        let db = Arc::new(Db::open_in_memory().unwrap());
        (db.clone(), SignalRepo::new(db.clone()), DeliveryRegistry::new(db))
    }

    #[test]
    fn signal_roundtrip() {
        let (_, signals, _) = setup();
        let s = signal("RELIANCE");
        signals.insert(&s).unwrap();

        let got = signals.get(s.id).unwrap().unwrap();
        assert_eq!(got.symbol, "RELIANCE");
        assert_eq!(got.direction, Direction::Buy);
        assert_eq!(got.strength, ConfluenceStrength::Strong);
        assert_eq!(got.status, SignalStatus::Active);
        assert!((got.confluence.score - 0.3).abs() < 1e-9);
    }

    #[test]
    fn fanout_is_idempotent_per_user_broker() {
        let (_, signals, deliveries) = setup();
        let s = signal("TCS");
        signals.insert(&s).unwrap();

        let ub = Uuid::new_v4();
        let first = deliveries
            .create_for_signal(s.id, &[ub], Utc::now())
            .unwrap();
        assert_eq!(first.len(), 1);

        // Second fan-out for the same pair inserts nothing.
        let second = deliveries
            .create_for_signal(s.id, &[ub], Utc::now())
            .unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn consume_succeeds_exactly_once() {
        let (_, signals, deliveries) = setup();
        let s = signal("TCS");
        signals.insert(&s).unwrap();
        let ub = Uuid::new_v4();
        let d = deliveries
            .create_for_signal(s.id, &[ub], Utc::now())
            .unwrap()
            .remove(0);

        let intent_a = Uuid::new_v4();
        let intent_b = Uuid::new_v4();
        assert!(deliveries.consume(d.id, intent_a, Utc::now()).unwrap());
        assert!(!deliveries.consume(d.id, intent_b, Utc::now()).unwrap());

        let got = deliveries.get(d.id).unwrap().unwrap();
        assert_eq!(got.status, DeliveryStatus::Consumed);
        assert_eq!(got.intent_id, Some(intent_a));
        assert_eq!(got.version, 2);
    }

    #[test]
    fn consume_after_rejection_fails() {
        let (_, signals, deliveries) = setup();
        let s = signal("INFY");
        signals.insert(&s).unwrap();
        let d = deliveries
            .create_for_signal(s.id, &[Uuid::new_v4()], Utc::now())
            .unwrap()
            .remove(0);

        assert!(deliveries.mark_rejected(d.id, Utc::now()).unwrap());
        assert!(!deliveries.consume(d.id, Uuid::new_v4(), Utc::now()).unwrap());
    }

    #[test]
    fn expire_due_flips_only_elapsed_signals() {
        let (_, signals, _) = setup();
        let mut fresh = signal("A1");
        fresh.expires_at = Utc::now() + chrono::Duration::minutes(10);
        let mut old = signal("A2");
        old.expires_at = Utc::now() - chrono::Duration::minutes(1);
        signals.insert(&fresh).unwrap();
        signals.insert(&old).unwrap();

        let expired = signals.expire_due(Utc::now()).unwrap();
        assert_eq!(expired, vec![old.id]);
        assert_eq!(signals.get(old.id).unwrap().unwrap().status, SignalStatus::Expired);
        assert_eq!(signals.get(fresh.id).unwrap().unwrap().status, SignalStatus::Active);
    }

    #[test]
    fn mark_stale_skips_signals_with_trades() {
        let (db, signals, _) = setup();
        let referenced = signal("X");
        let free = signal("X");
        signals.insert(&referenced).unwrap();
        signals.insert(&free).unwrap();

        // A trade row referencing the first signal blocks its stale marking.
        db.with(|conn| {
            conn.execute(
                "INSERT INTO trades (id, intent_id, signal_id, user_id, user_broker_id,
                    symbol, direction, entry_kind, product_type, order_type, entry_qty,
                    status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'X', 'BUY', 'NEWBUY', 'DELIVERY', 'LIMIT', 10,
                    'OPEN', ?6, ?6)",
                params![
                    Uuid::new_v4().to_string(),
                    Uuid::new_v4().to_string(),
                    referenced.id.to_string(),
                    Uuid::new_v4().to_string(),
                    Uuid::new_v4().to_string(),
                    Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .unwrap();

        let stale = signals.mark_stale(Some("X")).unwrap();
        assert_eq!(stale, vec![free.id]);
        assert_eq!(
            signals.get(referenced.id).unwrap().unwrap().status,
            SignalStatus::Active
        );
        assert_eq!(signals.get(free.id).unwrap().unwrap().status, SignalStatus::Stale);
    }
}
