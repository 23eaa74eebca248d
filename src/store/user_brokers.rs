// =============================================================================
// User-Brokers — bindings, broker sessions, OAuth states, watchlists
// =============================================================================
//
// EXEC bindings receive signal deliveries; exactly one DATA binding feeds
// market data for the whole system. Session rows rotate their session id on
// token refresh; the watchdog compares ids and tells adapters to reload.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use crate::store::{parse_dt, parse_dt_opt, parse_text, parse_uuid, Db};
use crate::types::{BrokerRole, ConnectionStatus};

/// A (user, broker) binding.
#[derive(Debug, Clone)]
pub struct UserBroker {
    pub id: Uuid,
    pub user_id: Uuid,
    /// Adapter kind, e.g. "kite" or "paper".
    pub broker_kind: String,
    pub role: BrokerRole,
    pub credentials: serde_json::Value,
    pub active: bool,
    pub connection_status: ConnectionStatus,
    pub session_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A broker session row. The session id rotates on every token refresh.
#[derive(Debug, Clone)]
pub struct BrokerSession {
    pub user_broker_id: Uuid,
    pub session_id: String,
    pub access_token: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Lifetime of an OAuth login state nonce.
const OAUTH_STATE_TTL_MINS: i64 = 10;

#[derive(Clone)]
pub struct UserBrokerRepo {
    db: Arc<Db>,
}

impl UserBrokerRepo {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    // -------------------------------------------------------------------------
    // Bindings
    // -------------------------------------------------------------------------

    pub fn insert(&self, ub: &UserBroker) -> Result<()> {
        self.db.with(|conn| {
            conn.execute(
                "INSERT INTO user_brokers
                    (id, user_id, broker_kind, role, credentials_json, active,
                     connection_status, session_expires_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    ub.id.to_string(),
                    ub.user_id.to_string(),
                    ub.broker_kind,
                    ub.role.as_str(),
                    ub.credentials.to_string(),
                    ub.active as i64,
                    ub.connection_status.as_str(),
                    ub.session_expires_at.map(|t| t.to_rfc3339()),
                    ub.created_at.to_rfc3339(),
                ],
            )
            .context("failed to insert user broker")?;
            Ok(())
        })
    }

    pub fn get(&self, id: Uuid) -> Result<Option<UserBroker>> {
        self.db.with(|conn| {
            conn.query_row(
                &format!("{UB_SELECT} WHERE id = ?1"),
                params![id.to_string()],
                row_to_user_broker,
            )
            .optional()
            .context("failed to load user broker")
        })
    }

    /// Every active EXEC binding — the fan-out audience for new signals.
    pub fn active_exec(&self) -> Result<Vec<UserBroker>> {
        self.db.with(|conn| {
            let mut stmt =
                conn.prepare(&format!("{UB_SELECT} WHERE role = 'EXEC' AND active = 1"))?;
            let rows = stmt.query_map([], row_to_user_broker)?;
            Ok(rows.collect::<rusqlite::Result<_>>()?)
        })
    }

    /// The single DATA binding providing market data.
    pub fn data_broker(&self) -> Result<Option<UserBroker>> {
        self.db.with(|conn| {
            conn.query_row(
                &format!("{UB_SELECT} WHERE role = 'DATA' AND active = 1 LIMIT 1"),
                [],
                row_to_user_broker,
            )
            .optional()
            .context("failed to load data broker")
        })
    }

    pub fn set_connection_status(&self, id: Uuid, status: ConnectionStatus) -> Result<()> {
        self.db.with(|conn| {
            conn.execute(
                "UPDATE user_brokers SET connection_status = ?2 WHERE id = ?1",
                params![id.to_string(), status.as_str()],
            )?;
            Ok(())
        })
    }

    pub fn set_session_expiry(&self, id: Uuid, expires_at: DateTime<Utc>) -> Result<()> {
        self.db.with(|conn| {
            conn.execute(
                "UPDATE user_brokers SET session_expires_at = ?2 WHERE id = ?1",
                params![id.to_string(), expires_at.to_rfc3339()],
            )?;
            Ok(())
        })
    }

    // -------------------------------------------------------------------------
    // Broker sessions
    // -------------------------------------------------------------------------

    /// Record a fresh session, rotating the session id.
    pub fn upsert_session(&self, session: &BrokerSession) -> Result<()> {
        self.db.with(|conn| {
            conn.execute(
                "INSERT INTO user_broker_sessions
                    (user_broker_id, session_id, access_token, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (user_broker_id) DO UPDATE SET
                    session_id = excluded.session_id,
                    access_token = excluded.access_token,
                    created_at = excluded.created_at,
                    expires_at = excluded.expires_at",
                params![
                    session.user_broker_id.to_string(),
                    session.session_id,
                    session.access_token,
                    session.created_at.to_rfc3339(),
                    session.expires_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    pub fn session(&self, user_broker_id: Uuid) -> Result<Option<BrokerSession>> {
        self.db.with(|conn| {
            conn.query_row(
                "SELECT user_broker_id, session_id, access_token, created_at, expires_at
                 FROM user_broker_sessions WHERE user_broker_id = ?1",
                params![user_broker_id.to_string()],
                |row| {
                    Ok(BrokerSession {
                        user_broker_id: parse_uuid(row.get(0)?)?,
                        session_id: row.get(1)?,
                        access_token: row.get(2)?,
                        created_at: parse_dt(row.get(3)?)?,
                        expires_at: parse_dt(row.get(4)?)?,
                    })
                },
            )
            .optional()
            .context("failed to load broker session")
        })
    }

    pub fn all_sessions(&self) -> Result<Vec<BrokerSession>> {
        self.db.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT user_broker_id, session_id, access_token, created_at, expires_at
                 FROM user_broker_sessions",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(BrokerSession {
                    user_broker_id: parse_uuid(row.get(0)?)?,
                    session_id: row.get(1)?,
                    access_token: row.get(2)?,
                    created_at: parse_dt(row.get(3)?)?,
                    expires_at: parse_dt(row.get(4)?)?,
                })
            })?;
            Ok(rows.collect::<rusqlite::Result<_>>()?)
        })
    }

    // -------------------------------------------------------------------------
    // OAuth states
    // -------------------------------------------------------------------------

    /// Create a short-lived state nonce for an external login flow.
    pub fn create_oauth_state(&self, user_broker_id: Uuid, now: DateTime<Utc>) -> Result<String> {
        let state = Uuid::new_v4().simple().to_string();
        self.db.with(|conn| {
            conn.execute(
                "INSERT INTO oauth_states (state, user_broker_id, created_at, expires_at, consumed)
                 VALUES (?1, ?2, ?3, ?4, 0)",
                params![
                    state,
                    user_broker_id.to_string(),
                    now.to_rfc3339(),
                    (now + Duration::minutes(OAUTH_STATE_TTL_MINS)).to_rfc3339(),
                ],
            )?;
            Ok(())
        })?;
        Ok(state)
    }

    /// Atomically consume a state nonce. Returns the bound user-broker, or
    /// `None` when the state is unknown, expired, or already consumed.
    pub fn consume_oauth_state(
        &self,
        state: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Uuid>> {
        self.db.with(|conn| {
            let tx = conn.unchecked_transaction()?;
            let changed = tx.execute(
                "UPDATE oauth_states SET consumed = 1
                 WHERE state = ?1 AND consumed = 0 AND expires_at > ?2",
                params![state, now.to_rfc3339()],
            )?;
            let result = if changed == 1 {
                let ub: String = tx.query_row(
                    "SELECT user_broker_id FROM oauth_states WHERE state = ?1",
                    params![state],
                    |row| row.get(0),
                )?;
                Some(Uuid::parse_str(&ub).context("malformed user broker id in oauth state")?)
            } else {
                None
            };
            tx.commit()?;
            Ok(result)
        })
    }

    /// Drop expired state rows; the watchdog calls this each cycle.
    pub fn purge_expired_oauth_states(&self, now: DateTime<Utc>) -> Result<usize> {
        self.db.with(|conn| {
            let n = conn.execute(
                "DELETE FROM oauth_states WHERE expires_at <= ?1",
                params![now.to_rfc3339()],
            )?;
            Ok(n)
        })
    }

    // -------------------------------------------------------------------------
    // Watchlists
    // -------------------------------------------------------------------------

    pub fn create_watchlist_template(
        &self,
        name: &str,
        symbols: &[String],
        now: DateTime<Utc>,
    ) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let symbols_json = serde_json::to_string(symbols)?;
        self.db.with(|conn| {
            conn.execute(
                "INSERT INTO watchlist_templates (id, name, symbols_json, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![id.to_string(), name, symbols_json, now.to_rfc3339()],
            )?;
            Ok(())
        })?;
        Ok(id)
    }

    pub fn select_watchlist(
        &self,
        user_broker_id: Uuid,
        template_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.db.with(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO watchlist_selections
                    (user_broker_id, template_id, selected_at)
                 VALUES (?1, ?2, ?3)",
                params![
                    user_broker_id.to_string(),
                    template_id.to_string(),
                    now.to_rfc3339()
                ],
            )?;
            Ok(())
        })
    }

    /// Union of symbols across all selected templates — the universe the
    /// DATA broker subscribes to.
    pub fn active_symbols(&self) -> Result<Vec<String>> {
        self.db.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT t.symbols_json
                 FROM watchlist_templates t
                 JOIN watchlist_selections s ON s.template_id = t.id",
            )?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            let mut symbols: Vec<String> = Vec::new();
            for json in rows {
                let list: Vec<String> =
                    serde_json::from_str(&json?).map_err(crate::store::conv_err)?;
                symbols.extend(list);
            }
            symbols.sort();
            symbols.dedup();
            Ok(symbols)
        })
    }
}

const UB_SELECT: &str = "SELECT id, user_id, broker_kind, role, credentials_json, active,
    connection_status, session_expires_at, created_at FROM user_brokers";

fn row_to_user_broker(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserBroker> {
    let credentials: String = row.get(4)?;
    Ok(UserBroker {
        id: parse_uuid(row.get(0)?)?,
        user_id: parse_uuid(row.get(1)?)?,
        broker_kind: row.get(2)?,
        role: parse_text(row.get::<_, String>(3)?)?,
        credentials: serde_json::from_str(&credentials).map_err(crate::store::conv_err)?,
        active: row.get::<_, i64>(5)? != 0,
        connection_status: parse_text(row.get::<_, String>(6)?)?,
        session_expires_at: parse_dt_opt(row.get(7)?)?,
        created_at: parse_dt(row.get(8)?)?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
