// =============================================================================
// Admin API — engine status and trading configuration
// =============================================================================
//
// Thin axum router over the config store. POSTs validate before anything is
// stored: a validation failure or an unknown enum value returns 400 and the
// stored config is untouched. Config changes mark dependent ACTIVE signals
// stale through the signal service (scoped to the symbol for overrides).
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::info;
use uuid::Uuid;

use crate::config::{MtfConfig, MtfOverride, TrailingStopsConfig};
use crate::events::{topic, EventDraft, EventLog};
use crate::market_data::aggregator::CandleAggregator;
use crate::market_data::price_cache::PriceCache;
use crate::signal_service::SignalService;
use crate::store::config_store::ConfigStore;
use crate::store::trades::TradeRepo;
use crate::store::user_brokers::UserBrokerRepo;
use crate::trade_actor::TradeActor;

pub struct AdminState {
    pub config: ConfigStore,
    pub signal_service: Arc<SignalService>,
    pub events: Arc<EventLog>,
    pub aggregator: Arc<CandleAggregator>,
    pub price_cache: Arc<PriceCache>,
    pub user_brokers: UserBrokerRepo,
    pub trades: TradeRepo,
    pub actor: Arc<TradeActor>,
    pub started_at: Instant,
}

pub fn router(state: Arc<AdminState>) -> Router {
    Router::new()
        .route("/api/status", get(status))
        .route("/api/prices", get(prices))
        .route(
            "/api/config/trailing-stops",
            get(get_trailing).post(set_trailing),
        )
        .route("/api/config/mtf", get(get_mtf).post(set_mtf))
        .route(
            "/api/config/mtf/:symbol",
            get(get_symbol_override).post(set_symbol_override),
        )
        .route("/api/signals/:id/cancel", post(cancel_signal))
        .route("/api/trades/:id/cancel", post(cancel_trade))
        .route("/api/trades/:id", delete(archive_trade))
        .route("/api/brokers/:id/oauth-state", post(create_oauth_state))
        .route("/api/oauth/callback", get(oauth_callback))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn bad_request(message: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": message.into()})),
    )
        .into_response()
}

fn internal(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": err.to_string()})),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

async fn status(State(state): State<Arc<AdminState>>) -> Response {
    Json(json!({
        "uptimeSecs": state.started_at.elapsed().as_secs(),
        "eventSeq": state.events.current_seq(),
        "symbolsTracked": state.price_cache.len(),
        "ingress": state.aggregator.stats(),
    }))
    .into_response()
}

async fn prices(State(state): State<Arc<AdminState>>) -> Response {
    Json(state.price_cache.snapshot()).into_response()
}

// ---------------------------------------------------------------------------
// Operator actions
// ---------------------------------------------------------------------------

async fn cancel_signal(State(state): State<Arc<AdminState>>, Path(id): Path<Uuid>) -> Response {
    match state.signal_service.cancel(id) {
        Ok(true) => Json(json!({"cancelled": true})).into_response(),
        Ok(false) => bad_request("signal is not ACTIVE"),
        Err(e) => internal(e),
    }
}

async fn cancel_trade(State(state): State<Arc<AdminState>>, Path(id): Path<Uuid>) -> Response {
    match state.actor.cancel_trade(id).await {
        Ok(()) => Json(json!({"requested": true})).into_response(),
        Err(e) => internal(e),
    }
}

/// Soft-delete a terminal trade for the audit trail.
async fn archive_trade(State(state): State<Arc<AdminState>>, Path(id): Path<Uuid>) -> Response {
    match state.trades.find_by_id(id) {
        Ok(Some(trade)) if trade.status.is_terminal() => {
            match state.trades.soft_delete(id, chrono::Utc::now()) {
                Ok(true) => Json(json!({"archived": true})).into_response(),
                Ok(false) => bad_request("trade already archived"),
                Err(e) => internal(e),
            }
        }
        Ok(Some(trade)) => bad_request(format!("trade is {} — only terminal trades archive", trade.status)),
        Ok(None) => bad_request("unknown trade id"),
        Err(e) => internal(e),
    }
}

// ---------------------------------------------------------------------------
// OAuth login flow
// ---------------------------------------------------------------------------

async fn create_oauth_state(
    State(state): State<Arc<AdminState>>,
    Path(id): Path<Uuid>,
) -> Response {
    match state.user_brokers.get(id) {
        Ok(Some(_)) => match state.user_brokers.create_oauth_state(id, chrono::Utc::now()) {
            Ok(nonce) => Json(json!({"state": nonce})).into_response(),
            Err(e) => internal(e),
        },
        Ok(None) => bad_request("unknown user broker"),
        Err(e) => internal(e),
    }
}

#[derive(Debug, Deserialize)]
struct OauthCallback {
    state: String,
    /// Request token appended by the broker's login redirect.
    #[serde(default)]
    request_token: Option<String>,
}

/// Complete a broker login: consume the state nonce, exchange the request
/// token for an access token, and store the rotated session. The watchdog
/// picks up the rotation and reloads any cached adapter.
async fn oauth_callback(
    State(state): State<Arc<AdminState>>,
    Query(query): Query<OauthCallback>,
) -> Response {
    let now = chrono::Utc::now();
    let user_broker_id = match state.user_brokers.consume_oauth_state(&query.state, now) {
        Ok(Some(id)) => id,
        Ok(None) => return bad_request("unknown, expired, or already-consumed state"),
        Err(e) => return internal(e),
    };
    let user_broker = match state.user_brokers.get(user_broker_id) {
        Ok(Some(ub)) => ub,
        Ok(None) => return bad_request("unknown user broker"),
        Err(e) => return internal(e),
    };

    if user_broker.broker_kind == "kite" {
        let Some(request_token) = query.request_token.as_deref() else {
            return bad_request("missing request_token");
        };
        let (Some(api_key), Some(api_secret)) = (
            user_broker.credentials.get("api_key").and_then(|v| v.as_str()),
            user_broker.credentials.get("api_secret").and_then(|v| v.as_str()),
        ) else {
            return bad_request("kite credentials missing api_key/api_secret");
        };

        let broker = crate::broker::kite::KiteBroker::new(api_key, "");
        let connection = match broker.exchange_request_token(request_token, api_secret).await {
            Ok(connection) => connection,
            Err(e) => return bad_request(format!("token exchange failed: {e}")),
        };

        let expires_at = connection
            .expires_at
            .unwrap_or_else(|| now + chrono::Duration::hours(8));
        let session = crate::store::user_brokers::BrokerSession {
            user_broker_id,
            session_id: if connection.session_id.is_empty() {
                Uuid::new_v4().simple().to_string()
            } else {
                connection.session_id
            },
            access_token: broker.current_access_token(),
            created_at: now,
            expires_at,
        };
        if let Err(e) = state.user_brokers.upsert_session(&session) {
            return internal(e);
        }
        if let Err(e) = state.user_brokers.set_session_expiry(user_broker_id, expires_at) {
            return internal(e);
        }
        info!(%user_broker_id, "broker login completed; session stored");
    }

    Json(json!({"userBrokerId": user_broker_id})).into_response()
}

// ---------------------------------------------------------------------------
// Trailing stops
// ---------------------------------------------------------------------------

async fn get_trailing(State(state): State<Arc<AdminState>>) -> Response {
    match state.config.trailing() {
        Ok(cfg) => Json(cfg).into_response(),
        Err(e) => internal(e),
    }
}

async fn set_trailing(
    State(state): State<Arc<AdminState>>,
    Json(body): Json<serde_json::Value>,
) -> Response {
    // Manual decode so malformed enums return 400, not 422.
    let cfg: TrailingStopsConfig = match serde_json::from_value(body) {
        Ok(cfg) => cfg,
        Err(e) => return bad_request(format!("invalid trailing-stops config: {e}")),
    };
    if let Err(msg) = cfg.validate() {
        return bad_request(msg);
    }
    if let Err(e) = state.config.set_trailing(&cfg, chrono::Utc::now()) {
        return internal(e);
    }
    let _ = state.events.append(EventDraft::global(
        topic::CONFIG_UPDATED,
        json!({"kind": "trailing-stops"}),
    ));
    info!("trailing-stops config updated");
    Json(cfg).into_response()
}

// ---------------------------------------------------------------------------
// MTF global config
// ---------------------------------------------------------------------------

async fn get_mtf(State(state): State<Arc<AdminState>>) -> Response {
    match state.config.mtf_global() {
        Ok(cfg) => Json(cfg).into_response(),
        Err(e) => internal(e),
    }
}

async fn set_mtf(
    State(state): State<Arc<AdminState>>,
    Json(body): Json<serde_json::Value>,
) -> Response {
    let cfg: MtfConfig = match serde_json::from_value(body) {
        Ok(cfg) => cfg,
        Err(e) => return bad_request(format!("invalid mtf config: {e}")),
    };
    if let Err(msg) = cfg.validate() {
        return bad_request(msg);
    }
    if let Err(e) = state.config.set_mtf_global(&cfg, chrono::Utc::now()) {
        return internal(e);
    }
    // Every symbol's ACTIVE signals now derive from a stale config.
    match state.signal_service.on_config_updated(None) {
        Ok(stale) => {
            let _ = state.events.append(EventDraft::global(
                topic::CONFIG_UPDATED,
                json!({"kind": "mtf-global", "signalsMarkedStale": stale}),
            ));
            Json(cfg).into_response()
        }
        Err(e) => internal(e),
    }
}

// ---------------------------------------------------------------------------
// Per-symbol overrides
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct OverrideQuery {
    #[serde(default)]
    user_broker_id: Option<Uuid>,
}

async fn get_symbol_override(
    State(state): State<Arc<AdminState>>,
    Path(symbol): Path<String>,
    Query(query): Query<OverrideQuery>,
) -> Response {
    let ov = match state.config.symbol_override(&symbol, query.user_broker_id) {
        Ok(ov) => ov,
        Err(e) => return internal(e),
    };
    let resolved = match state.config.resolve(&symbol, query.user_broker_id) {
        Ok(cfg) => cfg,
        Err(e) => return internal(e),
    };
    Json(json!({"override": ov, "effective": resolved})).into_response()
}

async fn set_symbol_override(
    State(state): State<Arc<AdminState>>,
    Path(symbol): Path<String>,
    Query(query): Query<OverrideQuery>,
    Json(body): Json<serde_json::Value>,
) -> Response {
    let ov: MtfOverride = match serde_json::from_value(body) {
        Ok(ov) => ov,
        Err(e) => return bad_request(format!("invalid symbol override: {e}")),
    };
    // The merged result must still be a valid config.
    let merged = match state.config.mtf_global() {
        Ok(global) => global.merged_with(&ov),
        Err(e) => return internal(e),
    };
    if let Err(msg) = merged.validate() {
        return bad_request(msg);
    }
    if let Err(e) =
        state
            .config
            .set_symbol_override(&symbol, query.user_broker_id, &ov, chrono::Utc::now())
    {
        return internal(e);
    }
    // Scope-aware stale marking: only this symbol's signals.
    match state.signal_service.on_config_updated(Some(&symbol)) {
        Ok(stale) => {
            let _ = state.events.append(EventDraft::global(
                topic::CONFIG_UPDATED,
                json!({"kind": "mtf-symbol", "symbol": symbol, "signalsMarkedStale": stale}),
            ));
            Json(json!({"override": ov, "effective": merged})).into_response()
        }
        Err(e) => internal(e),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SessionClock;
    use crate::events::EventLog;
    use crate::market_data::price_cache::PriceCache;
    use crate::store::candles::CandleRepo;
    use crate::store::events::EventRepo;
    use crate::store::signals::{DeliveryRegistry, SignalRepo};
    use crate::store::user_brokers::UserBrokerRepo;
    use crate::store::Db;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn app() -> Router {
        build().0
    }

    fn build() -> (Router, UserBrokerRepo) {
        let db = Arc::new(Db::open_in_memory().unwrap());
        let config = ConfigStore::new(db.clone());
        let events = Arc::new(EventLog::new(EventRepo::new(db.clone())).unwrap());
        let user_brokers = UserBrokerRepo::new(db.clone());
        let trades = TradeRepo::new(db.clone());
        let signal_service = Arc::new(SignalService::new(
            SignalRepo::new(db.clone()),
            DeliveryRegistry::new(db.clone()),
            user_brokers.clone(),
            CandleRepo::new(db.clone()),
            config.clone(),
            Arc::new(PriceCache::new()),
            events.clone(),
            Arc::new(tokio::sync::Notify::new()),
            900,
        ));
        let actor = TradeActor::spawn(
            2,
            Arc::new(crate::trade_actor::worker::WorkerDeps {
                trades: trades.clone(),
                intents: crate::store::trades::IntentRepo::new(db.clone()),
                exits: crate::store::trades::ExitIntentRepo::new(db.clone()),
                user_brokers: user_brokers.clone(),
                factory: Arc::new(crate::broker::AdapterFactory::new(true)),
                events: events.clone(),
                config: config.clone(),
                exit_qual: crate::exit_rules::ExitQualification::new(SessionClock::nse(), 5),
                broker_max_attempts: 3,
                broker_backoff_ms: 1,
            }),
        );
        let router = router(Arc::new(AdminState {
            config,
            signal_service,
            events,
            aggregator: Arc::new(CandleAggregator::new(SessionClock::nse())),
            price_cache: Arc::new(PriceCache::new()),
            user_brokers: user_brokers.clone(),
            trades,
            actor,
            started_at: Instant::now(),
        }));
        (router, user_brokers)
    }

    async fn post_json(app: &Router, uri: &str, body: serde_json::Value) -> StatusCode {
        let response = app
            .clone()
            .oneshot(
                Request::post(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        response.status()
    }

    #[tokio::test]
    async fn status_endpoint_responds() {
        let app = app();
        let response = app
            .oneshot(Request::get("/api/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn trailing_config_roundtrip() {
        let app = app();
        let status = post_json(
            &app,
            "/api/config/trailing-stops",
            json!({
                "activationPercent": 1.0,
                "trailingPercent": 0.5,
                "updateFrequency": "BRICK",
                "minMovePercent": 0.05,
                "maxLossPercent": 2.0,
                "lockProfitPercent": 0.25
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn out_of_range_percent_is_400() {
        let app = app();
        let status = post_json(
            &app,
            "/api/config/trailing-stops",
            json!({"trailingPercent": 0.0}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let status = post_json(
            &app,
            "/api/config/trailing-stops",
            json!({"maxLossPercent": 101.0}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_enum_value_is_400() {
        let app = app();
        let status = post_json(
            &app,
            "/api/config/trailing-stops",
            json!({"updateFrequency": "HOURLY"}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn invalid_mtf_weights_are_400() {
        let app = app();
        let status = post_json(
            &app,
            "/api/config/mtf",
            json!({"weightHtf": 0.0, "weightItf": 0.0, "weightLtf": 0.0}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn oauth_state_roundtrip() {
        let (app, user_brokers) = build();
        let ub = crate::store::user_brokers::UserBroker {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            broker_kind: "paper".to_string(),
            role: crate::types::BrokerRole::Exec,
            credentials: json!({"api_key": "k"}),
            active: true,
            connection_status: crate::types::ConnectionStatus::Disconnected,
            session_expires_at: None,
            created_at: chrono::Utc::now(),
        };
        user_brokers.insert(&ub).unwrap();

        let response = app
            .clone()
            .oneshot(
                Request::post(format!("/api/brokers/{}/oauth-state", ub.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), 4096).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let state = body["state"].as_str().unwrap().to_string();

        // Consuming the state twice: first succeeds, second is a 400.
        let uri = format!("/api/oauth/callback?state={state}");
        let response = app
            .clone()
            .oneshot(Request::get(uri.as_str()).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let response = app
            .oneshot(Request::get(uri.as_str()).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn archive_unknown_trade_is_400() {
        let app = app();
        let response = app
            .oneshot(
                Request::delete(format!("/api/trades/{}", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn symbol_override_posts_and_resolves() {
        let app = app();
        let status = post_json(
            &app,
            "/api/config/mtf/RELIANCE",
            json!({"entryOffsetPct": 0.3}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let response = app
            .oneshot(
                Request::get("/api/config/mtf/RELIANCE")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
