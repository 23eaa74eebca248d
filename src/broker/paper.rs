// =============================================================================
// Paper Broker — in-process simulated adapter
// =============================================================================
//
// Deterministic stand-in for a real vendor: orders are accepted with
// sequential ids and fill at the limit price (or the symbol's mark price for
// market orders) on the next status query. Test hooks script rejections and
// transient failures.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::broker::{
    BrokerAdapter, BrokerError, BrokerOrderState, BrokerResult, ConnectionResult, FundsInfo,
    HoldingInfo, Instrument, OrderAck, OrderRequest, OrderStatus, PositionInfo,
};
use crate::market_data::Candle;
use crate::types::{OrderType, Tick, Timeframe};

#[derive(Debug, Clone)]
struct PaperOrder {
    req: OrderRequest,
    state: BrokerOrderState,
    filled_qty: i64,
    avg_price: Option<Decimal>,
    reason: Option<String>,
    ts: DateTime<Utc>,
}

/// Simulated broker. One instance per user-broker, like any adapter.
#[derive(Debug)]
pub struct PaperBroker {
    connected: AtomicBool,
    next_id: AtomicU64,
    orders: RwLock<HashMap<String, PaperOrder>>,
    marks: RwLock<HashMap<String, Decimal>>,
    sinks: RwLock<Vec<(Vec<String>, mpsc::Sender<Tick>)>>,
    funds: RwLock<FundsInfo>,
    session_id: RwLock<String>,
    /// When set, the next placement fails with a broker rejection.
    scripted_rejection: Mutex<Option<(String, String)>>,
    /// Number of upcoming placements that fail transiently.
    scripted_transient: AtomicU32,
    /// Orders fill on the next status query when true (the default).
    auto_fill: AtomicBool,
}

impl PaperBroker {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            orders: RwLock::new(HashMap::new()),
            marks: RwLock::new(HashMap::new()),
            sinks: RwLock::new(Vec::new()),
            funds: RwLock::new(FundsInfo {
                available: Decimal::from(1_000_000),
                utilized: Decimal::ZERO,
            }),
            session_id: RwLock::new("paper-session-1".to_string()),
            scripted_rejection: Mutex::new(None),
            scripted_transient: AtomicU32::new(0),
            auto_fill: AtomicBool::new(true),
        }
    }

    // -------------------------------------------------------------------------
    // Simulation controls
    // -------------------------------------------------------------------------

    /// Set the reference price used for market-order fills and `get_ltp`.
    pub fn set_mark(&self, symbol: &str, price: Decimal) {
        self.marks.write().insert(symbol.to_string(), price);
    }

    pub fn set_funds(&self, available: Decimal, utilized: Decimal) {
        *self.funds.write() = FundsInfo { available, utilized };
    }

    /// The next placement fails with BROKER_REJECTION.
    pub fn reject_next(&self, code: &str, message: &str) {
        *self.scripted_rejection.lock() = Some((code.to_string(), message.to_string()));
    }

    /// The next `n` placements fail transiently.
    pub fn fail_transient(&self, n: u32) {
        self.scripted_transient.store(n, Ordering::SeqCst);
    }

    /// Keep orders in ACCEPTED until `fill_order` is called.
    pub fn hold_fills(&self) {
        self.auto_fill.store(false, Ordering::SeqCst);
    }

    /// Fill a held order at `price`.
    pub fn fill_order(&self, broker_order_id: &str, price: Decimal) {
        if let Some(order) = self.orders.write().get_mut(broker_order_id) {
            order.state = BrokerOrderState::Filled;
            order.filled_qty = order.req.quantity;
            order.avg_price = Some(price);
            order.ts = Utc::now();
        }
    }

    /// Push a tick to every subscribed sink (demo feed and tests).
    pub async fn push_tick(&self, tick: Tick) {
        let sinks: Vec<mpsc::Sender<Tick>> = self
            .sinks
            .read()
            .iter()
            .filter(|(symbols, _)| symbols.iter().any(|s| s == &tick.symbol))
            .map(|(_, tx)| tx.clone())
            .collect();
        for tx in sinks {
            let _ = tx.send(tick.clone()).await;
        }
    }

    fn fill_price_for(&self, order: &PaperOrder) -> Decimal {
        match (order.req.order_type, order.req.limit_price) {
            (OrderType::Limit, Some(limit)) => limit,
            _ => self
                .marks
                .read()
                .get(&order.req.symbol)
                .copied()
                .unwrap_or_else(|| order.req.limit_price.unwrap_or(Decimal::ONE)),
        }
    }
}

impl Default for PaperBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerAdapter for PaperBroker {
    fn kind(&self) -> &'static str {
        "paper"
    }

    async fn connect(&self) -> BrokerResult<ConnectionResult> {
        self.connected.store(true, Ordering::SeqCst);
        info!("paper broker connected");
        Ok(ConnectionResult {
            session_id: self.session_id.read().clone(),
            expires_at: None,
        })
    }

    async fn disconnect(&self) -> BrokerResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn place_order(&self, req: &OrderRequest) -> BrokerResult<OrderAck> {
        if !self.is_connected() {
            return Err(BrokerError::NotConnected);
        }
        if self.scripted_transient.load(Ordering::SeqCst) > 0 {
            self.scripted_transient.fetch_sub(1, Ordering::SeqCst);
            return Err(BrokerError::Transient("scripted transient failure".into()));
        }
        if let Some((code, message)) = self.scripted_rejection.lock().take() {
            return Err(BrokerError::Rejection { code, message });
        }

        // Idempotency by client order tag: a retried placement returns the
        // existing order.
        {
            let orders = self.orders.read();
            if let Some((id, _)) = orders
                .iter()
                .find(|(_, o)| o.req.client_order_tag == req.client_order_tag)
            {
                debug!(tag = %req.client_order_tag, "duplicate placement — returning existing order");
                return Ok(OrderAck {
                    broker_order_id: id.clone(),
                    state: BrokerOrderState::Accepted,
                });
            }
        }

        let id = format!("P-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.orders.write().insert(
            id.clone(),
            PaperOrder {
                req: req.clone(),
                state: BrokerOrderState::Accepted,
                filled_qty: 0,
                avg_price: None,
                reason: None,
                ts: Utc::now(),
            },
        );
        debug!(order_id = %id, symbol = %req.symbol, qty = req.quantity, "paper order placed");
        Ok(OrderAck {
            broker_order_id: id,
            state: BrokerOrderState::Accepted,
        })
    }

    async fn modify_order(
        &self,
        broker_order_id: &str,
        req: &OrderRequest,
    ) -> BrokerResult<OrderAck> {
        let mut orders = self.orders.write();
        let order = orders
            .get_mut(broker_order_id)
            .ok_or_else(|| BrokerError::rejection("UNKNOWN_ORDER", "no such order"))?;
        if order.state != BrokerOrderState::Accepted {
            return Err(BrokerError::rejection(
                "ORDER_NOT_OPEN",
                format!("order is {}", order.state),
            ));
        }
        order.req.limit_price = req.limit_price;
        order.req.quantity = req.quantity;
        Ok(OrderAck {
            broker_order_id: broker_order_id.to_string(),
            state: BrokerOrderState::Accepted,
        })
    }

    async fn cancel_order(&self, broker_order_id: &str) -> BrokerResult<()> {
        let mut orders = self.orders.write();
        let order = orders
            .get_mut(broker_order_id)
            .ok_or_else(|| BrokerError::rejection("UNKNOWN_ORDER", "no such order"))?;
        if order.state == BrokerOrderState::Filled {
            return Err(BrokerError::rejection("ALREADY_FILLED", "order already filled"));
        }
        order.state = BrokerOrderState::Cancelled;
        Ok(())
    }

    async fn get_order_status(&self, broker_order_id: &str) -> BrokerResult<OrderStatus> {
        // Auto-fill pass: accepted orders fill when queried.
        if self.auto_fill.load(Ordering::SeqCst) {
            let mut orders = self.orders.write();
            if let Some(order) = orders.get_mut(broker_order_id) {
                if order.state == BrokerOrderState::Accepted {
                    order.state = BrokerOrderState::Filled;
                    order.filled_qty = order.req.quantity;
                    order.avg_price = Some(self.fill_price_for(order));
                    order.ts = Utc::now();
                }
            }
        }

        let orders = self.orders.read();
        let order = orders
            .get(broker_order_id)
            .ok_or_else(|| BrokerError::rejection("UNKNOWN_ORDER", "no such order"))?;
        Ok(OrderStatus {
            broker_order_id: broker_order_id.to_string(),
            client_order_tag: Some(order.req.client_order_tag.clone()),
            state: order.state,
            filled_qty: order.filled_qty,
            avg_fill_price: order.avg_price,
            reason: order.reason.clone(),
            ts: order.ts,
        })
    }

    async fn get_open_orders(&self) -> BrokerResult<Vec<OrderStatus>> {
        let orders = self.orders.read();
        Ok(orders
            .iter()
            .filter(|(_, o)| {
                matches!(
                    o.state,
                    BrokerOrderState::Accepted | BrokerOrderState::PartiallyFilled
                )
            })
            .map(|(id, o)| OrderStatus {
                broker_order_id: id.clone(),
                client_order_tag: Some(o.req.client_order_tag.clone()),
                state: o.state,
                filled_qty: o.filled_qty,
                avg_fill_price: o.avg_price,
                reason: o.reason.clone(),
                ts: o.ts,
            })
            .collect())
    }

    async fn get_positions(&self) -> BrokerResult<Vec<PositionInfo>> {
        Ok(Vec::new())
    }

    async fn get_holdings(&self) -> BrokerResult<Vec<HoldingInfo>> {
        Ok(Vec::new())
    }

    async fn get_funds(&self) -> BrokerResult<FundsInfo> {
        Ok(*self.funds.read())
    }

    async fn subscribe_ticks(
        &self,
        symbols: &[String],
        sink: mpsc::Sender<Tick>,
    ) -> BrokerResult<()> {
        self.sinks.write().push((symbols.to_vec(), sink));
        Ok(())
    }

    async fn unsubscribe_ticks(&self, symbols: &[String]) -> BrokerResult<()> {
        self.sinks.write().retain(|(subscribed, _)| {
            !subscribed.iter().all(|s| symbols.contains(s))
        });
        Ok(())
    }

    async fn get_ltp(&self, symbol: &str) -> BrokerResult<Decimal> {
        self.marks
            .read()
            .get(symbol)
            .copied()
            .ok_or_else(|| BrokerError::InvalidArgument(format!("no mark price for {symbol}")))
    }

    async fn get_historical_candles(
        &self,
        _symbol: &str,
        _timeframe: Timeframe,
        _from: DateTime<Utc>,
        _to: DateTime<Utc>,
    ) -> BrokerResult<Vec<Candle>> {
        Ok(Vec::new())
    }

    async fn get_instruments(&self) -> BrokerResult<Vec<Instrument>> {
        Ok(self
            .marks
            .read()
            .keys()
            .map(|symbol| Instrument {
                symbol: symbol.clone(),
                exchange: "NSE".to_string(),
                lot_size: 1,
                tick_size: Decimal::new(5, 2),
            })
            .collect())
    }

    async fn reload_token(&self, _access_token: &str, session_id: &str) -> BrokerResult<()> {
        *self.session_id.write() = session_id.to_string();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Direction, ProductType};
    use rust_decimal_macros::dec;

    fn req(tag: &str) -> OrderRequest {
        OrderRequest {
            client_order_tag: tag.to_string(),
            symbol: "RELIANCE".to_string(),
            direction: Direction::Buy,
            order_type: OrderType::Limit,
            product_type: ProductType::Delivery,
            quantity: 10,
            limit_price: Some(dec!(2900.10)),
        }
    }

    #[tokio::test]
    async fn place_then_fill_at_limit() {
        let broker = PaperBroker::new();
        broker.connect().await.unwrap();

        let ack = broker.place_order(&req("intent-1")).await.unwrap();
        assert_eq!(ack.state, BrokerOrderState::Accepted);

        let status = broker.get_order_status(&ack.broker_order_id).await.unwrap();
        assert_eq!(status.state, BrokerOrderState::Filled);
        assert_eq!(status.filled_qty, 10);
        assert_eq!(status.avg_fill_price, Some(dec!(2900.10)));
        assert_eq!(status.client_order_tag.as_deref(), Some("intent-1"));
    }

    #[tokio::test]
    async fn duplicate_tag_returns_same_order() {
        let broker = PaperBroker::new();
        broker.connect().await.unwrap();

        let a = broker.place_order(&req("intent-1")).await.unwrap();
        let b = broker.place_order(&req("intent-1")).await.unwrap();
        assert_eq!(a.broker_order_id, b.broker_order_id);
    }

    #[tokio::test]
    async fn scripted_rejection_fires_once() {
        let broker = PaperBroker::new();
        broker.connect().await.unwrap();
        broker.reject_next("RMS-101", "margin insufficient");

        let err = broker.place_order(&req("intent-1")).await.unwrap_err();
        assert!(matches!(err, BrokerError::Rejection { .. }));

        assert!(broker.place_order(&req("intent-2")).await.is_ok());
    }

    #[tokio::test]
    async fn held_orders_stay_accepted_until_filled() {
        let broker = PaperBroker::new();
        broker.connect().await.unwrap();
        broker.hold_fills();

        let ack = broker.place_order(&req("intent-1")).await.unwrap();
        let status = broker.get_order_status(&ack.broker_order_id).await.unwrap();
        assert_eq!(status.state, BrokerOrderState::Accepted);

        broker.fill_order(&ack.broker_order_id, dec!(2899.95));
        let status = broker.get_order_status(&ack.broker_order_id).await.unwrap();
        assert_eq!(status.state, BrokerOrderState::Filled);
        assert_eq!(status.avg_fill_price, Some(dec!(2899.95)));
    }

    #[tokio::test]
    async fn placement_requires_connection() {
        let broker = PaperBroker::new();
        let err = broker.place_order(&req("intent-1")).await.unwrap_err();
        assert!(matches!(err, BrokerError::NotConnected));
    }

    #[tokio::test]
    async fn ticks_reach_subscribed_sinks() {
        let broker = PaperBroker::new();
        let (tx, mut rx) = mpsc::channel(8);
        broker
            .subscribe_ticks(&["RELIANCE".to_string()], tx)
            .await
            .unwrap();

        broker
            .push_tick(Tick {
                symbol: "RELIANCE".to_string(),
                ltp: dec!(2901),
                volume: 50,
                ts: Utc::now(),
            })
            .await;
        broker
            .push_tick(Tick {
                symbol: "TCS".to_string(),
                ltp: dec!(3900),
                volume: 10,
                ts: Utc::now(),
            })
            .await;

        let got = rx.recv().await.unwrap();
        assert_eq!(got.symbol, "RELIANCE");
        assert!(rx.try_recv().is_err());
    }
}
