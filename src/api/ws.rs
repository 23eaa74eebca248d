// =============================================================================
// Event Stream WebSocket — scoped subscription over the event log
// =============================================================================
//
// A connecting session presents its user id plus optional topic and
// user-broker filters in the query string. Events are forwarded live from
// the broadcaster through `WsSession::should_receive`; on connect the
// client may request a catch-up from a known sequence number with
// `?after=<seq>`, replayed from the journal before live delivery begins.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::events::{EventLog, WsSession};

/// Catch-up page size per replay query.
const REPLAY_PAGE: usize = 500;

pub struct WsState {
    pub events: Arc<EventLog>,
}

pub fn router(state: Arc<WsState>) -> Router {
    Router::new()
        .route("/ws/events", get(upgrade))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct SubscribeParams {
    user_id: Uuid,
    /// Comma-separated topic list; empty or absent subscribes to all.
    #[serde(default)]
    topics: Option<String>,
    /// Comma-separated user-broker ids; empty means all of the user's.
    #[serde(default)]
    user_brokers: Option<String>,
    /// Replay events after this sequence number before going live.
    #[serde(default)]
    after: Option<i64>,
}

async fn upgrade(
    ws: WebSocketUpgrade,
    Query(params): Query<SubscribeParams>,
    State(state): State<Arc<WsState>>,
) -> Response {
    let topics: HashSet<String> = params
        .topics
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .filter(|t| !t.is_empty())
        .map(|t| t.trim().to_string())
        .collect();
    let user_brokers: HashSet<Uuid> = params
        .user_brokers
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .filter_map(|s| Uuid::parse_str(s.trim()).ok())
        .collect();

    let session = WsSession::new(params.user_id, topics, user_brokers);
    let after = params.after;
    ws.on_upgrade(move |socket| run_session(socket, session, state, after))
}

async fn run_session(
    mut socket: WebSocket,
    mut session: WsSession,
    state: Arc<WsState>,
    after: Option<i64>,
) {
    info!(
        session_id = %session.session_id,
        user_id = %session.user_id,
        topics = session.topics.len(),
        "event stream session connected"
    );

    // Subscribe before the replay so nothing falls in the gap.
    let mut rx = state.events.subscribe();

    // Catch-up from the journal.
    if let Some(mut cursor) = after {
        loop {
            let page = match state.events.replay_after(cursor, REPLAY_PAGE) {
                Ok(page) => page,
                Err(e) => {
                    warn!(error = %e, "event replay failed");
                    break;
                }
            };
            if page.is_empty() {
                break;
            }
            cursor = page.last().map(|e| e.seq).unwrap_or(cursor);
            for event in page {
                if session.should_receive(&event) && !send_event(&mut socket, &event).await {
                    return;
                }
            }
        }
    }

    let mut last_sent = after.unwrap_or(0);
    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Ok(event) => {
                    // The replay may already have covered this event.
                    if event.seq <= last_sent {
                        continue;
                    }
                    if session.should_receive(&event) {
                        if !send_event(&mut socket, &event).await {
                            break;
                        }
                        last_sent = event.seq;
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(
                        session_id = %session.session_id,
                        missed,
                        "event stream lagged — client should re-sync from the journal"
                    );
                }
                Err(RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {
                    // Pings are answered by axum; any traffic counts as
                    // activity.
                    session.last_activity = chrono::Utc::now();
                }
                Some(Err(e)) => {
                    debug!(error = %e, "event stream socket error");
                    break;
                }
            },
        }
    }

    info!(
        session_id = %session.session_id,
        idle_secs = (chrono::Utc::now() - session.last_activity).num_seconds(),
        "event stream session closed"
    );
}

async fn send_event(socket: &mut WebSocket, event: &crate::events::Event) -> bool {
    match serde_json::to_string(event) {
        Ok(text) => socket.send(Message::Text(text)).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "failed to serialise event");
            true
        }
    }
}
