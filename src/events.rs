// =============================================================================
// Event Log & Scoped Broadcaster — persist-before-publish, monotonic seq
// =============================================================================
//
// Every significant state change emits an Event. Appends hold one lock while
// the sequence number is assigned, the row is written, and the in-memory
// broadcast goes out, so `seq` is strictly increasing and every subscriber
// observes a prefix of the same global order.
//
// Subscribers present (user id, topics, user-broker ids); `should_receive`
// filters per event scope.
// =============================================================================

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::store::events::EventRepo;
use crate::types::AlertSeverity;

/// Event topics published by the engine.
pub mod topic {
    pub const SIGNAL_PUBLISHED: &str = "SIGNAL_PUBLISHED";
    pub const SIGNAL_EXPIRED: &str = "SIGNAL_EXPIRED";
    pub const SIGNAL_STALE: &str = "SIGNAL_STALE";
    pub const DELIVERY_CREATED: &str = "DELIVERY_CREATED";
    pub const INTENT_APPROVED: &str = "INTENT_APPROVED";
    pub const INTENT_REJECTED: &str = "INTENT_REJECTED";
    pub const INTENT_FAILED: &str = "INTENT_FAILED";
    pub const TRADE_CREATED: &str = "TRADE_CREATED";
    pub const TRADE_STATUS_CHANGED: &str = "TRADE_STATUS_CHANGED";
    pub const TRADE_OPENED: &str = "TRADE_OPENED";
    pub const TRADE_CLOSED: &str = "TRADE_CLOSED";
    pub const TRAILING_STOP_UPDATED: &str = "TRAILING_STOP_UPDATED";
    pub const EXIT_INTENT_REJECTED: &str = "EXIT_INTENT_REJECTED";
    pub const EXIT_PLACED: &str = "EXIT_PLACED";
    pub const CONFIG_UPDATED: &str = "CONFIG_UPDATED";
    pub const BROKER_SESSION_ROTATED: &str = "BROKER_SESSION_ROTATED";
    pub const ALERT_RAISED: &str = "ALERT_RAISED";
}

/// Delivery scope of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventScope {
    Global,
    User,
    UserBroker,
}

impl EventScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Global => "GLOBAL",
            Self::User => "USER",
            Self::UserBroker => "USER_BROKER",
        }
    }
}

impl std::fmt::Display for EventScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventScope {
    type Err = crate::types::UnknownEnum;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GLOBAL" => Ok(Self::Global),
            "USER" => Ok(Self::User),
            "USER_BROKER" => Ok(Self::UserBroker),
            other => Err(crate::types::UnknownEnum {
                kind: "event scope",
                value: other.to_string(),
            }),
        }
    }
}

/// Correlation ids threading an event back to its cause.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Correlation {
    pub signal_id: Option<Uuid>,
    pub intent_id: Option<Uuid>,
    pub trade_id: Option<Uuid>,
    pub order_id: Option<String>,
}

/// A journaled event. `seq` is the global total order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub seq: i64,
    pub event_type: String,
    pub scope: EventScope,
    pub user_id: Option<Uuid>,
    pub broker_id: Option<String>,
    pub user_broker_id: Option<Uuid>,
    pub correlation: Correlation,
    pub payload: serde_json::Value,
    pub ts: DateTime<Utc>,
}

/// An event under construction — everything but the sequence number.
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub event_type: &'static str,
    pub scope: EventScope,
    pub user_id: Option<Uuid>,
    pub broker_id: Option<String>,
    pub user_broker_id: Option<Uuid>,
    pub correlation: Correlation,
    pub payload: serde_json::Value,
}

impl EventDraft {
    pub fn global(event_type: &'static str, payload: serde_json::Value) -> Self {
        Self {
            event_type,
            scope: EventScope::Global,
            user_id: None,
            broker_id: None,
            user_broker_id: None,
            correlation: Correlation::default(),
            payload,
        }
    }

    pub fn user(event_type: &'static str, user_id: Uuid, payload: serde_json::Value) -> Self {
        Self {
            scope: EventScope::User,
            user_id: Some(user_id),
            ..Self::global(event_type, payload)
        }
    }

    pub fn user_broker(
        event_type: &'static str,
        user_id: Uuid,
        user_broker_id: Uuid,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            scope: EventScope::UserBroker,
            user_id: Some(user_id),
            user_broker_id: Some(user_broker_id),
            ..Self::global(event_type, payload)
        }
    }

    pub fn correlate(mut self, correlation: Correlation) -> Self {
        self.correlation = correlation;
        self
    }
}

// ---------------------------------------------------------------------------
// Event log
// ---------------------------------------------------------------------------

/// Broadcast channel capacity. Slow subscribers lag and are told how many
/// events they missed; they can catch up from the journal.
const BROADCAST_CAPACITY: usize = 1024;

/// The append-only event log plus its in-memory broadcaster.
pub struct EventLog {
    repo: EventRepo,
    seq: AtomicI64,
    append_lock: Mutex<()>,
    tx: broadcast::Sender<Event>,
}

impl EventLog {
    /// Seed the sequence counter from the journal.
    pub fn new(repo: EventRepo) -> Result<Self> {
        let max = repo.max_seq()?;
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Ok(Self {
            repo,
            seq: AtomicI64::new(max),
            append_lock: Mutex::new(()),
            tx,
        })
    }

    /// Assign the next sequence number, persist the event, then publish it.
    /// The row is durable before any subscriber sees it.
    pub fn append(&self, draft: EventDraft) -> Result<Event> {
        let _guard = self.append_lock.lock();
        let seq = self.seq.load(Ordering::Acquire) + 1;

        let event = Event {
            seq,
            event_type: draft.event_type.to_string(),
            scope: draft.scope,
            user_id: draft.user_id,
            broker_id: draft.broker_id,
            user_broker_id: draft.user_broker_id,
            correlation: draft.correlation,
            payload: draft.payload,
            ts: Utc::now(),
        };

        self.repo.append(&event)?;
        self.seq.store(seq, Ordering::Release);

        debug!(seq, event_type = %event.event_type, scope = %event.scope, "event appended");
        // No receivers is fine — the journal is the source of truth.
        let _ = self.tx.send(event.clone());
        Ok(event)
    }

    /// Raise an operational alert on the global scope.
    pub fn alert(&self, severity: AlertSeverity, code: &str, message: &str) {
        let draft = EventDraft::global(
            topic::ALERT_RAISED,
            serde_json::json!({
                "severity": severity.as_str(),
                "code": code,
                "message": message,
            }),
        );
        if let Err(e) = self.append(draft) {
            warn!(error = %e, code, "failed to journal alert");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn current_seq(&self) -> i64 {
        self.seq.load(Ordering::Acquire)
    }

    /// Catch-up read from the journal.
    pub fn replay_after(&self, after: i64, limit: usize) -> Result<Vec<Event>> {
        self.repo.list_after(after, limit)
    }
}

// ---------------------------------------------------------------------------
// Subscriber sessions
// ---------------------------------------------------------------------------

/// A connected event-stream session and its subscription filters.
#[derive(Debug, Clone)]
pub struct WsSession {
    pub session_id: Uuid,
    pub user_id: Uuid,
    /// Subscribed topics; empty means every topic.
    pub topics: HashSet<String>,
    /// Subscribed user-broker ids; empty means all of the user's brokers.
    pub user_broker_ids: HashSet<Uuid>,
    pub last_activity: DateTime<Utc>,
}

impl WsSession {
    pub fn new(user_id: Uuid, topics: HashSet<String>, user_broker_ids: HashSet<Uuid>) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            user_id,
            topics,
            user_broker_ids,
            last_activity: Utc::now(),
        }
    }

    /// True iff the topic matches and the event's scope is satisfied by this
    /// session.
    pub fn should_receive(&self, event: &Event) -> bool {
        if !self.topics.is_empty() && !self.topics.contains(&event.event_type) {
            return false;
        }
        match event.scope {
            EventScope::Global => true,
            EventScope::User => event.user_id == Some(self.user_id),
            EventScope::UserBroker => {
                event.user_id == Some(self.user_id)
                    && match event.user_broker_id {
                        Some(ub) => {
                            self.user_broker_ids.is_empty() || self.user_broker_ids.contains(&ub)
                        }
                        None => false,
                    }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Db;
    use serde_json::json;
    use std::sync::Arc;

    fn log() -> EventLog {
        let db = Arc::new(Db::open_in_memory().unwrap());
        EventLog::new(EventRepo::new(db)).unwrap()
    }

    #[test]
    fn seq_is_strictly_increasing_and_durable() {
        let log = log();
        let a = log.append(EventDraft::global(topic::SIGNAL_PUBLISHED, json!({}))).unwrap();
        let b = log.append(EventDraft::global(topic::SIGNAL_EXPIRED, json!({}))).unwrap();
        assert_eq!(a.seq, 1);
        assert_eq!(b.seq, 2);
        assert_eq!(log.current_seq(), 2);

        let replay = log.replay_after(0, 10).unwrap();
        assert_eq!(replay.len(), 2);
        assert_eq!(replay[0].seq, 1);
    }

    #[test]
    fn publish_follows_persist() {
        let log = log();
        let mut rx = log.subscribe();
        let appended = log
            .append(EventDraft::global(topic::ALERT_RAISED, json!({"code": "X"})))
            .unwrap();

        let received = rx.try_recv().unwrap();
        assert_eq!(received.seq, appended.seq);
        // The row was already durable when the broadcast happened.
        assert_eq!(log.replay_after(0, 10).unwrap().len(), 1);
    }

    #[test]
    fn seq_seeds_from_journal() {
        let db = Arc::new(Db::open_in_memory().unwrap());
        let log1 = EventLog::new(EventRepo::new(db.clone())).unwrap();
        log1.append(EventDraft::global(topic::SIGNAL_PUBLISHED, json!({}))).unwrap();
        log1.append(EventDraft::global(topic::SIGNAL_PUBLISHED, json!({}))).unwrap();

        let log2 = EventLog::new(EventRepo::new(db)).unwrap();
        let e = log2.append(EventDraft::global(topic::SIGNAL_PUBLISHED, json!({}))).unwrap();
        assert_eq!(e.seq, 3);
    }

    #[test]
    fn scope_filtering() {
        let user = Uuid::new_v4();
        let other_user = Uuid::new_v4();
        let ub = Uuid::new_v4();
        let other_ub = Uuid::new_v4();

        let session = WsSession::new(user, HashSet::new(), HashSet::from([ub]));

        let global = Event {
            seq: 1,
            event_type: topic::SIGNAL_PUBLISHED.to_string(),
            scope: EventScope::Global,
            user_id: None,
            broker_id: None,
            user_broker_id: None,
            correlation: Correlation::default(),
            payload: json!({}),
            ts: Utc::now(),
        };
        assert!(session.should_receive(&global));

        let mut for_user = global.clone();
        for_user.scope = EventScope::User;
        for_user.user_id = Some(user);
        assert!(session.should_receive(&for_user));
        for_user.user_id = Some(other_user);
        assert!(!session.should_receive(&for_user));

        let mut for_ub = global.clone();
        for_ub.scope = EventScope::UserBroker;
        for_ub.user_id = Some(user);
        for_ub.user_broker_id = Some(ub);
        assert!(session.should_receive(&for_ub));
        for_ub.user_broker_id = Some(other_ub);
        assert!(!session.should_receive(&for_ub));
    }

    #[test]
    fn topic_filtering() {
        let user = Uuid::new_v4();
        let session = WsSession::new(
            user,
            HashSet::from([topic::TRADE_CLOSED.to_string()]),
            HashSet::new(),
        );

        let mut event = Event {
            seq: 1,
            event_type: topic::TRADE_CLOSED.to_string(),
            scope: EventScope::Global,
            user_id: None,
            broker_id: None,
            user_broker_id: None,
            correlation: Correlation::default(),
            payload: json!({}),
            ts: Utc::now(),
        };
        assert!(session.should_receive(&event));

        event.event_type = topic::SIGNAL_PUBLISHED.to_string();
        assert!(!session.should_receive(&event));
    }
}
