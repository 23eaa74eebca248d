// =============================================================================
// Event Repository — append-only journal rows
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::params;

use crate::events::{Correlation, Event, EventScope};
use crate::store::{parse_dt, parse_text, parse_uuid_opt, Db};

#[derive(Clone)]
pub struct EventRepo {
    db: Arc<Db>,
}

impl EventRepo {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    /// Append one event row. The caller (the event log) owns seq assignment.
    pub fn append(&self, event: &Event) -> Result<()> {
        self.db.with(|conn| {
            conn.execute(
                "INSERT INTO events
                    (seq, event_type, scope, user_id, broker_id, user_broker_id,
                     signal_id, intent_id, trade_id, order_id, payload, ts)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    event.seq,
                    event.event_type,
                    event.scope.as_str(),
                    event.user_id.map(|u| u.to_string()),
                    event.broker_id,
                    event.user_broker_id.map(|u| u.to_string()),
                    event.correlation.signal_id.map(|u| u.to_string()),
                    event.correlation.intent_id.map(|u| u.to_string()),
                    event.correlation.trade_id.map(|u| u.to_string()),
                    event.correlation.order_id,
                    event.payload.to_string(),
                    event.ts.to_rfc3339(),
                ],
            )
            .context("failed to append event")?;
            Ok(())
        })
    }

    /// Highest persisted sequence number, 0 when the journal is empty.
    pub fn max_seq(&self) -> Result<i64> {
        self.db.with(|conn| {
            Ok(conn.query_row("SELECT COALESCE(MAX(seq), 0) FROM events", [], |row| {
                row.get(0)
            })?)
        })
    }

    /// Events with `seq > after`, in sequence order (catch-up reads).
    pub fn list_after(&self, after: i64, limit: usize) -> Result<Vec<Event>> {
        self.db.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT seq, event_type, scope, user_id, broker_id, user_broker_id,
                        signal_id, intent_id, trade_id, order_id, payload, ts
                 FROM events WHERE seq > ?1 ORDER BY seq ASC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![after, limit as i64], row_to_event)?;
            Ok(rows.collect::<rusqlite::Result<_>>()?)
        })
    }
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
    let payload: String = row.get(10)?;
    Ok(Event {
        seq: row.get(0)?,
        event_type: row.get(1)?,
        scope: parse_text::<EventScope>(row.get::<_, String>(2)?)?,
        user_id: parse_uuid_opt(row.get(3)?)?,
        broker_id: row.get(4)?,
        user_broker_id: parse_uuid_opt(row.get(5)?)?,
        correlation: Correlation {
            signal_id: parse_uuid_opt(row.get(6)?)?,
            intent_id: parse_uuid_opt(row.get(7)?)?,
            trade_id: parse_uuid_opt(row.get(8)?)?,
            order_id: row.get(9)?,
        },
        payload: serde_json::from_str(&payload).map_err(crate::store::conv_err)?,
        ts: parse_dt(row.get(11)?)?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn event(seq: i64) -> Event {
        Event {
            seq,
            event_type: "SIGNAL_PUBLISHED".to_string(),
            scope: EventScope::Global,
            user_id: None,
            broker_id: None,
            user_broker_id: None,
            correlation: Correlation {
                signal_id: Some(Uuid::new_v4()),
                ..Correlation::default()
            },
            payload: json!({"symbol": "RELIANCE"}),
            ts: Utc::now(),
        }
    }

    #[test]
    fn append_and_read_back_in_order() {
        let repo = EventRepo::new(Arc::new(Db::open_in_memory().unwrap()));
        for seq in 1..=3 {
            repo.append(&event(seq)).unwrap();
        }
        assert_eq!(repo.max_seq().unwrap(), 3);

        let events = repo.list_after(1, 10).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].seq, 2);
        assert_eq!(events[1].seq, 3);
        assert_eq!(events[0].payload["symbol"], "RELIANCE");
    }

    #[test]
    fn duplicate_seq_is_rejected() {
        let repo = EventRepo::new(Arc::new(Db::open_in_memory().unwrap()));
        repo.append(&event(1)).unwrap();
        assert!(repo.append(&event(1)).is_err());
    }
}
