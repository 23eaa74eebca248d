// =============================================================================
// Token Refresh Watchdog — session rotation detection and token reload
// =============================================================================
//
// Polls the user-broker-session store every 30 seconds and tracks the latest
// known session id per user-broker. A changed session id means the token was
// refreshed out-of-band: the watchdog hands the fresh token to the cached
// adapter, which hot-swaps credentials without dropping subscriptions where
// possible. Expired OAuth login states are purged on the same cadence.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::AdapterFactory;
use crate::events::{topic, EventDraft, EventLog};
use crate::store::user_brokers::UserBrokerRepo;

pub struct TokenWatchdog {
    user_brokers: UserBrokerRepo,
    factory: Arc<AdapterFactory>,
    events: Arc<EventLog>,
    interval: Duration,
    /// Latest session id seen per user-broker.
    known: parking_lot::Mutex<HashMap<Uuid, String>>,
}

impl TokenWatchdog {
    pub fn new(
        user_brokers: UserBrokerRepo,
        factory: Arc<AdapterFactory>,
        events: Arc<EventLog>,
        interval: Duration,
    ) -> Self {
        Self {
            user_brokers,
            factory,
            events,
            interval,
            known: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Run forever; spawned as a background task.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.interval);
        info!(interval_secs = self.interval.as_secs(), "token watchdog running");
        loop {
            ticker.tick().await;
            if let Err(e) = self.poll_once().await {
                warn!(error = %e, "watchdog poll failed");
            }
        }
    }

    /// One poll cycle. Returns the number of rotations handled.
    pub async fn poll_once(&self) -> Result<usize> {
        let sessions = self.user_brokers.all_sessions()?;
        let mut rotated = 0usize;

        for session in sessions {
            let changed = {
                let mut known = self.known.lock();
                match known.insert(session.user_broker_id, session.session_id.clone()) {
                    // First observation is baseline, not a rotation.
                    None => false,
                    Some(previous) => previous != session.session_id,
                }
            };
            if !changed {
                continue;
            }

            debug!(
                user_broker_id = %session.user_broker_id,
                "session id rotated — reloading adapter token"
            );
            match self
                .factory
                .reload_token(
                    session.user_broker_id,
                    &session.access_token,
                    &session.session_id,
                )
                .await
            {
                Ok(()) => {
                    rotated += 1;
                    self.user_brokers
                        .set_session_expiry(session.user_broker_id, session.expires_at)?;
                    self.events.append(EventDraft::global(
                        topic::BROKER_SESSION_ROTATED,
                        json!({"userBrokerId": session.user_broker_id}),
                    ))?;
                }
                Err(e) => {
                    warn!(
                        user_broker_id = %session.user_broker_id,
                        error = %e,
                        "token reload failed — will retry next cycle"
                    );
                    // Forget the observation so the next poll retries.
                    self.known.lock().remove(&session.user_broker_id);
                }
            }
        }

        let purged = self.user_brokers.purge_expired_oauth_states(Utc::now())?;
        if purged > 0 {
            debug!(purged, "expired oauth states purged");
        }
        Ok(rotated)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::paper::PaperBroker;
    use crate::broker::BrokerAdapter;
    use crate::store::events::EventRepo;
    use crate::store::user_brokers::BrokerSession;
    use crate::store::Db;

    fn fixture() -> (Arc<TokenWatchdog>, UserBrokerRepo, Arc<AdapterFactory>) {
        let db = Arc::new(Db::open_in_memory().unwrap());
        let user_brokers = UserBrokerRepo::new(db.clone());
        let factory = Arc::new(AdapterFactory::new(true));
        let events = Arc::new(EventLog::new(EventRepo::new(db)).unwrap());
        let watchdog = Arc::new(TokenWatchdog::new(
            user_brokers.clone(),
            factory.clone(),
            events,
            Duration::from_secs(30),
        ));
        (watchdog, user_brokers, factory)
    }

    fn session(ub: Uuid, session_id: &str, token: &str) -> BrokerSession {
        let now = Utc::now();
        BrokerSession {
            user_broker_id: ub,
            session_id: session_id.to_string(),
            access_token: token.to_string(),
            created_at: now,
            expires_at: now + chrono::Duration::hours(8),
        }
    }

    #[tokio::test]
    async fn first_observation_is_not_a_rotation() {
        let (watchdog, repo, _) = fixture();
        let ub = Uuid::new_v4();
        repo.upsert_session(&session(ub, "sess-1", "tok-1")).unwrap();

        assert_eq!(watchdog.poll_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn rotation_reloads_cached_adapter() {
        let (watchdog, repo, factory) = fixture();
        let ub = Uuid::new_v4();
        let paper = Arc::new(PaperBroker::new());
        factory.register(ub, paper.clone());

        repo.upsert_session(&session(ub, "sess-1", "tok-1")).unwrap();
        watchdog.poll_once().await.unwrap();

        repo.upsert_session(&session(ub, "sess-2", "tok-2")).unwrap();
        assert_eq!(watchdog.poll_once().await.unwrap(), 1);

        // The paper adapter records the new session id on reload.
        let result = paper.connect().await.unwrap();
        assert_eq!(result.session_id, "sess-2");
    }

    #[tokio::test]
    async fn unchanged_session_does_nothing() {
        let (watchdog, repo, factory) = fixture();
        let ub = Uuid::new_v4();
        factory.register(ub, Arc::new(PaperBroker::new()));

        repo.upsert_session(&session(ub, "sess-1", "tok-1")).unwrap();
        watchdog.poll_once().await.unwrap();
        assert_eq!(watchdog.poll_once().await.unwrap(), 0);
    }
}
