// =============================================================================
// Broker Adapter Contract — one adapter instance per user-broker
// =============================================================================
//
// The core never sees a broker's wire format: adapters translate the
// operations below to each vendor's API. The engine uses the intent id as
// the broker-side client order tag, so a retried placement is recognised by
// the broker instead of duplicated.
//
// Timeouts are mandatory: 5s for order mutations, 2s for status queries,
// 30s for historical fetches. Adapter construction is a factory selection by
// broker kind; instances are cached per user-broker id.
// =============================================================================

pub mod error;
pub mod kite;
pub mod paper;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

pub use error::{BrokerError, BrokerResult};

use crate::market_data::Candle;
use crate::store::user_brokers::{BrokerSession, UserBroker};
use crate::types::{Direction, OrderType, ProductType, Tick, Timeframe};

/// Timeout for place / modify / cancel.
pub const ORDER_TIMEOUT: Duration = Duration::from_secs(5);
/// Timeout for order-status and snapshot queries.
pub const STATUS_TIMEOUT: Duration = Duration::from_secs(2);
/// Timeout for historical candle fetches.
pub const HISTORY_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Wire-neutral order types
// ---------------------------------------------------------------------------

/// Order submission request. `client_order_tag` carries the intent id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub client_order_tag: String,
    pub symbol: String,
    pub direction: Direction,
    pub order_type: OrderType,
    pub product_type: ProductType,
    pub quantity: i64,
    pub limit_price: Option<Decimal>,
}

/// Broker-side status of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BrokerOrderState {
    Accepted,
    PartiallyFilled,
    Filled,
    Rejected,
    Cancelled,
}

impl std::fmt::Display for BrokerOrderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Accepted => "ACCEPTED",
            Self::PartiallyFilled => "PARTIALLY_FILLED",
            Self::Filled => "FILLED",
            Self::Rejected => "REJECTED",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// Acknowledgement of a placement or modification.
#[derive(Debug, Clone)]
pub struct OrderAck {
    pub broker_order_id: String,
    pub state: BrokerOrderState,
}

/// Full order status as reported by the broker.
#[derive(Debug, Clone)]
pub struct OrderStatus {
    pub broker_order_id: String,
    pub client_order_tag: Option<String>,
    pub state: BrokerOrderState,
    pub filled_qty: i64,
    pub avg_fill_price: Option<Decimal>,
    pub reason: Option<String>,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PositionInfo {
    pub symbol: String,
    pub quantity: i64,
    pub avg_price: Decimal,
    pub pnl: Decimal,
}

#[derive(Debug, Clone)]
pub struct HoldingInfo {
    pub symbol: String,
    pub quantity: i64,
    pub avg_price: Decimal,
}

#[derive(Debug, Clone, Copy)]
pub struct FundsInfo {
    pub available: Decimal,
    pub utilized: Decimal,
}

#[derive(Debug, Clone)]
pub struct Instrument {
    pub symbol: String,
    pub exchange: String,
    pub lot_size: i64,
    pub tick_size: Decimal,
}

/// Result of `connect`.
#[derive(Debug, Clone)]
pub struct ConnectionResult {
    pub session_id: String,
    pub expires_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// The contract
// ---------------------------------------------------------------------------

/// One adapter per user-broker. All operations carry the timeouts above and
/// fail with a typed [`BrokerError`] kind.
#[async_trait]
pub trait BrokerAdapter: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> &'static str;

    async fn connect(&self) -> BrokerResult<ConnectionResult>;
    async fn disconnect(&self) -> BrokerResult<()>;
    fn is_connected(&self) -> bool;

    async fn place_order(&self, req: &OrderRequest) -> BrokerResult<OrderAck>;
    async fn modify_order(&self, broker_order_id: &str, req: &OrderRequest)
        -> BrokerResult<OrderAck>;
    async fn cancel_order(&self, broker_order_id: &str) -> BrokerResult<()>;
    async fn get_order_status(&self, broker_order_id: &str) -> BrokerResult<OrderStatus>;
    async fn get_open_orders(&self) -> BrokerResult<Vec<OrderStatus>>;

    async fn get_positions(&self) -> BrokerResult<Vec<PositionInfo>>;
    async fn get_holdings(&self) -> BrokerResult<Vec<HoldingInfo>>;
    async fn get_funds(&self) -> BrokerResult<FundsInfo>;

    /// Stream ticks for `symbols` into `sink` until unsubscribed or
    /// disconnected.
    async fn subscribe_ticks(
        &self,
        symbols: &[String],
        sink: mpsc::Sender<Tick>,
    ) -> BrokerResult<()>;
    async fn unsubscribe_ticks(&self, symbols: &[String]) -> BrokerResult<()>;
    async fn get_ltp(&self, symbol: &str) -> BrokerResult<Decimal>;

    async fn get_historical_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> BrokerResult<Vec<Candle>>;
    async fn get_instruments(&self) -> BrokerResult<Vec<Instrument>>;

    /// Hot-swap credentials after a session rotation, keeping subscriptions
    /// where possible.
    async fn reload_token(&self, access_token: &str, session_id: &str) -> BrokerResult<()>;
}

// ---------------------------------------------------------------------------
// Factory + adapter cache
// ---------------------------------------------------------------------------

/// Process-wide adapter cache keyed by user-broker id. Construction-time
/// selection by broker kind; `paper_mode` forces the paper adapter for
/// every binding.
pub struct AdapterFactory {
    cache: RwLock<HashMap<Uuid, Arc<dyn BrokerAdapter>>>,
    paper_mode: bool,
}

impl AdapterFactory {
    pub fn new(paper_mode: bool) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            paper_mode,
        }
    }

    /// Get or build the adapter for a binding.
    pub fn adapter_for(
        &self,
        ub: &UserBroker,
        session: Option<&BrokerSession>,
    ) -> BrokerResult<Arc<dyn BrokerAdapter>> {
        if let Some(existing) = self.cache.read().get(&ub.id) {
            return Ok(existing.clone());
        }

        let adapter: Arc<dyn BrokerAdapter> = if self.paper_mode {
            Arc::new(paper::PaperBroker::new())
        } else {
            match ub.broker_kind.as_str() {
                "paper" => Arc::new(paper::PaperBroker::new()),
                "kite" => {
                    let api_key = ub
                        .credentials
                        .get("api_key")
                        .and_then(|v| v.as_str())
                        .ok_or_else(|| {
                            BrokerError::InvalidArgument("kite credentials missing api_key".into())
                        })?;
                    let access_token = session.map(|s| s.access_token.clone()).unwrap_or_default();
                    Arc::new(kite::KiteBroker::new(api_key, access_token))
                }
                other => {
                    return Err(BrokerError::InvalidArgument(format!(
                        "unknown broker kind: {other}"
                    )))
                }
            }
        };

        info!(user_broker_id = %ub.id, kind = adapter.kind(), "broker adapter constructed");
        self.cache.write().insert(ub.id, adapter.clone());
        Ok(adapter)
    }

    pub fn cached(&self, user_broker_id: Uuid) -> Option<Arc<dyn BrokerAdapter>> {
        self.cache.read().get(&user_broker_id).cloned()
    }

    /// Pre-register a constructed adapter (startup wiring and tests).
    pub fn register(&self, user_broker_id: Uuid, adapter: Arc<dyn BrokerAdapter>) {
        self.cache.write().insert(user_broker_id, adapter);
    }

    /// Token rotation hook used by the watchdog.
    pub async fn reload_token(
        &self,
        user_broker_id: Uuid,
        access_token: &str,
        session_id: &str,
    ) -> BrokerResult<()> {
        match self.cached(user_broker_id) {
            Some(adapter) => adapter.reload_token(access_token, session_id).await,
            None => {
                warn!(%user_broker_id, "token reload for unknown adapter — ignored");
                Ok(())
            }
        }
    }

    /// Disconnect every cached adapter, each bounded by `timeout`.
    pub async fn disconnect_all(&self, timeout: Duration) {
        let adapters: Vec<(Uuid, Arc<dyn BrokerAdapter>)> = self
            .cache
            .read()
            .iter()
            .map(|(id, a)| (*id, a.clone()))
            .collect();
        for (id, adapter) in adapters {
            match tokio::time::timeout(timeout, adapter.disconnect()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(user_broker_id = %id, error = %e, "adapter disconnect failed"),
                Err(_) => warn!(user_broker_id = %id, "adapter disconnect timed out"),
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
    use crate::types::{BrokerRole, ConnectionStatus};
    use serde_json::json;

    fn ub(kind: &str) -> UserBroker {
        UserBroker {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            broker_kind: kind.to_string(),
            role: BrokerRole::Exec,
            credentials: json!({"api_key": "key"}),
            active: true,
            connection_status: ConnectionStatus::Disconnected,
            session_expires_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn factory_caches_per_user_broker() {
        let factory = AdapterFactory::new(true);
        let binding = ub("paper");
        let a = factory.adapter_for(&binding, None).unwrap();
        let b = factory.adapter_for(&binding, None).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(factory.cached(binding.id).is_some());
    }

    #[test]
    fn paper_mode_overrides_kind() {
        let factory = AdapterFactory::new(true);
        let adapter = factory.adapter_for(&ub("kite"), None).unwrap();
        assert_eq!(adapter.kind(), "paper");
    }

    #[test]
    fn unknown_kind_is_invalid_argument() {
        let factory = AdapterFactory::new(false);
        let err = factory.adapter_for(&ub("groww"), None).unwrap_err();
        assert!(matches!(err, BrokerError::InvalidArgument(_)));
    }
}
