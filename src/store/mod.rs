// =============================================================================
// Persistent Store — embedded SQLite behind a shared handle
// =============================================================================
//
// The whole engine shares one connection guarded by a parking_lot Mutex.
// WAL mode keeps readers unblocked during writes; the schema is created
// idempotently at startup. Repositories are thin structs over `Arc<Db>`.
//
// Idempotency keys (intent_id, broker_order_id, (signal_id, user_broker_id))
// are the correctness mechanism — not row locks.
// =============================================================================

pub mod candles;
pub mod config_store;
pub mod events;
pub mod signals;
pub mod trades;
pub mod user_brokers;

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;
use rust_decimal::Decimal;
use tracing::info;
use uuid::Uuid;

/// Schema, applied idempotently at startup.
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS candles (
    symbol        TEXT NOT NULL,
    timeframe     TEXT NOT NULL,
    bucket_start  TEXT NOT NULL,
    open          TEXT NOT NULL,
    high          TEXT NOT NULL,
    low           TEXT NOT NULL,
    close         TEXT NOT NULL,
    volume        INTEGER NOT NULL,
    closed        INTEGER NOT NULL,
    PRIMARY KEY (symbol, timeframe, bucket_start)
);

CREATE TABLE IF NOT EXISTS signals (
    id              TEXT PRIMARY KEY,
    symbol          TEXT NOT NULL,
    direction       TEXT NOT NULL,
    strength        TEXT NOT NULL,
    price           TEXT NOT NULL,
    confluence_json TEXT NOT NULL,
    status          TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    expires_at      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_signals_status ON signals(status, symbol);

CREATE TABLE IF NOT EXISTS signal_deliveries (
    id             TEXT PRIMARY KEY,
    signal_id      TEXT NOT NULL,
    user_broker_id TEXT NOT NULL,
    status         TEXT NOT NULL,
    intent_id      TEXT,
    created_at     TEXT NOT NULL,
    updated_at     TEXT NOT NULL,
    version        INTEGER NOT NULL DEFAULT 1,
    UNIQUE (signal_id, user_broker_id)
);
CREATE INDEX IF NOT EXISTS idx_deliveries_status ON signal_deliveries(status);

CREATE TABLE IF NOT EXISTS trade_intents (
    id                TEXT PRIMARY KEY,
    signal_id         TEXT NOT NULL,
    user_broker_id    TEXT NOT NULL,
    user_id           TEXT NOT NULL,
    symbol            TEXT NOT NULL,
    direction         TEXT NOT NULL,
    validation_passed INTEGER NOT NULL,
    errors_json       TEXT NOT NULL,
    quantity          INTEGER NOT NULL,
    limit_price       TEXT,
    order_type        TEXT NOT NULL,
    product_type      TEXT NOT NULL,
    log_impact        REAL NOT NULL,
    exposure_after    TEXT NOT NULL,
    status            TEXT NOT NULL,
    created_at        TEXT NOT NULL,
    UNIQUE (signal_id, user_broker_id)
);

CREATE TABLE IF NOT EXISTS trades (
    id              TEXT PRIMARY KEY,
    intent_id       TEXT NOT NULL UNIQUE,
    signal_id       TEXT NOT NULL,
    user_id         TEXT NOT NULL,
    user_broker_id  TEXT NOT NULL,
    symbol          TEXT NOT NULL,
    direction       TEXT NOT NULL,
    entry_kind      TEXT NOT NULL,
    product_type    TEXT NOT NULL,
    order_type      TEXT NOT NULL,
    entry_qty       INTEGER NOT NULL,
    filled_qty      INTEGER NOT NULL DEFAULT 0,
    limit_price     TEXT,
    entry_price     TEXT,
    entry_time      TEXT,
    stop_price      TEXT,
    target_price    TEXT,
    trail_highest   TEXT,
    trail_stop      TEXT,
    trail_active    INTEGER NOT NULL DEFAULT 0,
    broker_order_id TEXT,
    exit_order_id   TEXT,
    exit_price      TEXT,
    exit_qty        INTEGER NOT NULL DEFAULT 0,
    exit_reason     TEXT,
    exit_time       TEXT,
    realized_pnl    TEXT,
    log_return      REAL,
    error_code      TEXT,
    error_message   TEXT,
    status          TEXT NOT NULL,
    version         INTEGER NOT NULL DEFAULT 1,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL,
    deleted_at      TEXT
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_trades_broker_order
    ON trades(broker_order_id) WHERE broker_order_id IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_trades_status ON trades(status);
CREATE INDEX IF NOT EXISTS idx_trades_user_symbol ON trades(user_id, symbol);

CREATE TABLE IF NOT EXISTS exit_intents (
    id             TEXT PRIMARY KEY,
    trade_id       TEXT NOT NULL,
    reason         TEXT NOT NULL,
    episode        INTEGER NOT NULL,
    status         TEXT NOT NULL,
    order_type     TEXT NOT NULL,
    quantity       INTEGER NOT NULL,
    limit_price    TEXT,
    detected_price TEXT NOT NULL,
    error_message  TEXT,
    created_at     TEXT NOT NULL,
    updated_at     TEXT NOT NULL,
    UNIQUE (trade_id, reason, episode)
);

CREATE TABLE IF NOT EXISTS events (
    seq            INTEGER PRIMARY KEY,
    event_type     TEXT NOT NULL,
    scope          TEXT NOT NULL,
    user_id        TEXT,
    broker_id      TEXT,
    user_broker_id TEXT,
    signal_id      TEXT,
    intent_id      TEXT,
    trade_id       TEXT,
    order_id       TEXT,
    payload        TEXT NOT NULL,
    ts             TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS user_brokers (
    id                 TEXT PRIMARY KEY,
    user_id            TEXT NOT NULL,
    broker_kind        TEXT NOT NULL,
    role               TEXT NOT NULL,
    credentials_json   TEXT NOT NULL,
    active             INTEGER NOT NULL DEFAULT 1,
    connection_status  TEXT NOT NULL DEFAULT 'DISCONNECTED',
    session_expires_at TEXT,
    created_at         TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS user_broker_sessions (
    user_broker_id TEXT PRIMARY KEY,
    session_id     TEXT NOT NULL,
    access_token   TEXT NOT NULL,
    created_at     TEXT NOT NULL,
    expires_at     TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS oauth_states (
    state          TEXT PRIMARY KEY,
    user_broker_id TEXT NOT NULL,
    created_at     TEXT NOT NULL,
    expires_at     TEXT NOT NULL,
    consumed       INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS mtf_config_global (
    id          INTEGER PRIMARY KEY CHECK (id = 1),
    config_json TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

-- user_broker_id '' is the symbol-wide override row (NULL would defeat the
-- uniqueness constraint).
CREATE TABLE IF NOT EXISTS mtf_config_symbol (
    symbol         TEXT NOT NULL,
    user_broker_id TEXT NOT NULL DEFAULT '',
    override_json  TEXT NOT NULL,
    updated_at     TEXT NOT NULL,
    UNIQUE (symbol, user_broker_id)
);

CREATE TABLE IF NOT EXISTS trailing_config (
    id          INTEGER PRIMARY KEY CHECK (id = 1),
    config_json TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS watchlist_templates (
    id           TEXT PRIMARY KEY,
    name         TEXT NOT NULL UNIQUE,
    symbols_json TEXT NOT NULL,
    created_at   TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS watchlist_selections (
    user_broker_id TEXT NOT NULL,
    template_id    TEXT NOT NULL,
    selected_at    TEXT NOT NULL,
    PRIMARY KEY (user_broker_id, template_id)
);
"#;

/// Shared database handle.
pub struct Db {
    conn: Mutex<Connection>,
}

impl Db {
    /// Open (or create) the database at `path` and apply pragmas + schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {}", path.display()))?;
        let db = Self::init(conn)?;
        info!(path = %path.display(), "database opened");
        Ok(db)
    }

    /// In-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL")
            .context("failed to set synchronous pragma")?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .context("failed to enable foreign keys")?;
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to apply schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run `f` with the connection locked.
    pub fn with<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn)
    }
}

// ---------------------------------------------------------------------------
// Row-conversion helpers shared by the repositories
// ---------------------------------------------------------------------------

pub(crate) fn conv_err<E>(e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
}

pub(crate) fn parse_uuid(s: String) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(&s).map_err(conv_err)
}

pub(crate) fn parse_uuid_opt(s: Option<String>) -> rusqlite::Result<Option<Uuid>> {
    s.map(|v| Uuid::parse_str(&v).map_err(conv_err)).transpose()
}

pub(crate) fn parse_dt(s: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(conv_err)
}

pub(crate) fn parse_dt_opt(s: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    s.map(parse_dt).transpose()
}

pub(crate) fn parse_dec(s: String) -> rusqlite::Result<Decimal> {
    s.parse::<Decimal>().map_err(conv_err)
}

pub(crate) fn parse_dec_opt(s: Option<String>) -> rusqlite::Result<Option<Decimal>> {
    s.map(parse_dec).transpose()
}

pub(crate) fn parse_text<T>(s: String) -> rusqlite::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    s.parse::<T>().map_err(conv_err)
}

pub(crate) fn parse_text_opt<T>(s: Option<String>) -> rusqlite::Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    s.map(parse_text).transpose()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_applies_idempotently() {
        let db = Db::open_in_memory().unwrap();
        // Applying again must not fail.
        db.with(|conn| {
            conn.execute_batch(SCHEMA_SQL).unwrap();
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn tables_exist() {
        let db = Db::open_in_memory().unwrap();
        let count: i64 = db
            .with(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN (
                        'candles','signals','signal_deliveries','trade_intents','trades',
                        'exit_intents','events','user_brokers','user_broker_sessions',
                        'oauth_states','mtf_config_global','mtf_config_symbol',
                        'trailing_config','watchlist_templates','watchlist_selections')",
                    [],
                    |row| row.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(count, 15);
    }
}
