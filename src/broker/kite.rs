// =============================================================================
// Kite Broker Adapter — Zerodha Kite Connect v3 REST + ticker WebSocket
// =============================================================================
//
// SECURITY: the API secret is used once, for the session-token exchange
// checksum (SHA-256 of api_key + request_token + api_secret). It is never
// stored on the adapter and never logged. Signed requests carry
// `Authorization: token api_key:access_token`.
//
// The access token is hot-swappable: the watchdog calls `reload_token` after
// a session rotation and subsequent requests pick up the new token. The tick
// stream reconnects with the fresh token on its next cycle.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, instrument, warn};

use crate::broker::error::ApiErrorBody;
use crate::broker::{
    BrokerAdapter, BrokerError, BrokerOrderState, BrokerResult, ConnectionResult, FundsInfo,
    HoldingInfo, Instrument, OrderAck, OrderRequest, OrderStatus, PositionInfo, HISTORY_TIMEOUT,
    ORDER_TIMEOUT, STATUS_TIMEOUT,
};
use crate::market_data::Candle;
use crate::types::{Direction, OrderType, ProductType, Tick, Timeframe};

const BASE_URL: &str = "https://api.kite.trade";
const WS_URL: &str = "wss://ws.kite.trade";
const KITE_VERSION: &str = "3";

/// Compute the login checksum: SHA-256 over api_key + request_token + secret.
pub fn login_checksum(api_key: &str, request_token: &str, api_secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(api_key.as_bytes());
    hasher.update(request_token.as_bytes());
    hasher.update(api_secret.as_bytes());
    hex::encode(hasher.finalize())
}

/// Kite Connect adapter. One instance per user-broker.
#[derive(Debug)]
pub struct KiteBroker {
    api_key: String,
    access_token: RwLock<String>,
    session_id: RwLock<String>,
    client: reqwest::Client,
    connected: AtomicBool,
    /// tradingsymbol → instrument token, filled from the instrument dump.
    tokens: RwLock<HashMap<String, u32>>,
    /// instrument token → tradingsymbol, for decoding ticker packets.
    symbols: RwLock<HashMap<u32, String>>,
    /// Symbols with a live tick subscription.
    subscriptions: RwLock<Vec<String>>,
}

impl KiteBroker {
    pub fn new(api_key: impl Into<String>, access_token: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            api_key: api_key.into(),
            access_token: RwLock::new(access_token.into()),
            session_id: RwLock::new(String::new()),
            client,
            connected: AtomicBool::new(false),
            tokens: RwLock::new(HashMap::new()),
            symbols: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(Vec::new()),
        }
    }

    fn auth_header(&self) -> String {
        format!("token {}:{}", self.api_key, self.access_token.read())
    }

    /// The access token currently in use (after a token exchange).
    pub fn current_access_token(&self) -> String {
        self.access_token.read().clone()
    }

    /// Exchange a login request token for an access token.
    /// `api_secret` is consumed here and not retained.
    #[instrument(skip(self, request_token, api_secret), name = "kite::exchange_token")]
    pub async fn exchange_request_token(
        &self,
        request_token: &str,
        api_secret: &str,
    ) -> BrokerResult<ConnectionResult> {
        let checksum = login_checksum(&self.api_key, request_token, api_secret);
        let form = [
            ("api_key", self.api_key.as_str()),
            ("request_token", request_token),
            ("checksum", checksum.as_str()),
        ];

        let resp = self
            .client
            .post(format!("{BASE_URL}/session/token"))
            .header("X-Kite-Version", KITE_VERSION)
            .form(&form)
            .send()
            .await?;
        let data = Self::unwrap_envelope(resp).await?;

        let access_token = data["access_token"]
            .as_str()
            .ok_or_else(|| BrokerError::InvalidArgument("token response missing access_token".into()))?
            .to_string();
        let session_id = data["login_time"]
            .as_str()
            .unwrap_or_default()
            .to_string();

        *self.access_token.write() = access_token;
        *self.session_id.write() = session_id.clone();
        info!("kite session token exchanged");
        Ok(ConnectionResult {
            session_id,
            expires_at: None,
        })
    }

    /// Unwrap Kite's `{"status": "...", "data": ...}` envelope, mapping
    /// error responses to typed kinds.
    async fn unwrap_envelope(resp: reqwest::Response) -> BrokerResult<serde_json::Value> {
        let status = resp.status();
        let body: serde_json::Value = resp.json().await?;

        if status.is_success() {
            return Ok(body["data"].clone());
        }

        let error: ApiErrorBody = serde_json::from_value(body.clone()).unwrap_or(ApiErrorBody {
            error_type: None,
            error_code: None,
            message: None,
        });
        let error_type = error.error_type.as_deref().unwrap_or("");

        if error_type == "TokenException" {
            return Err(BrokerError::SessionExpired);
        }
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(BrokerError::Transient(format!("HTTP {status}: {error}")));
        }
        Err(BrokerError::Rejection {
            code: error
                .error_code
                .or(error.error_type)
                .unwrap_or_else(|| status.to_string()),
            message: error.message.unwrap_or_else(|| "request rejected".into()),
        })
    }

    async fn get_json(&self, path: &str, timeout: Duration) -> BrokerResult<serde_json::Value> {
        let fut = async {
            let resp = self
                .client
                .get(format!("{BASE_URL}{path}"))
                .header("X-Kite-Version", KITE_VERSION)
                .header("Authorization", self.auth_header())
                .send()
                .await?;
            Self::unwrap_envelope(resp).await
        };
        tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| BrokerError::Timeout(timeout))?
    }

    fn map_order_state(status: &str) -> BrokerOrderState {
        match status {
            "COMPLETE" => BrokerOrderState::Filled,
            "REJECTED" => BrokerOrderState::Rejected,
            "CANCELLED" => BrokerOrderState::Cancelled,
            "OPEN" | "TRIGGER PENDING" | "AMO REQ RECEIVED" => BrokerOrderState::Accepted,
            other => {
                if other.contains("PARTIAL") {
                    BrokerOrderState::PartiallyFilled
                } else {
                    BrokerOrderState::Accepted
                }
            }
        }
    }

    fn order_status_from_json(order: &serde_json::Value) -> OrderStatus {
        let filled_qty = order["filled_quantity"].as_i64().unwrap_or(0);
        let state = match Self::map_order_state(order["status"].as_str().unwrap_or("")) {
            BrokerOrderState::Accepted if filled_qty > 0 => BrokerOrderState::PartiallyFilled,
            s => s,
        };
        OrderStatus {
            broker_order_id: order["order_id"].as_str().unwrap_or_default().to_string(),
            client_order_tag: order["tag"].as_str().map(|s| s.to_string()),
            state,
            filled_qty,
            avg_fill_price: order["average_price"]
                .as_f64()
                .and_then(Decimal::from_f64_retain)
                .filter(|p| !p.is_zero()),
            reason: order["status_message"].as_str().map(|s| s.to_string()),
            ts: Utc::now(),
        }
    }

    fn interval_name(tf: Timeframe) -> &'static str {
        match tf {
            Timeframe::M1 => "minute",
            Timeframe::M25 => "25minute",
            Timeframe::M125 => "125minute",
        }
    }

    /// Ensure the instrument dump is loaded so symbols map to tokens.
    async fn ensure_instruments(&self) -> BrokerResult<()> {
        if !self.tokens.read().is_empty() {
            return Ok(());
        }
        self.get_instruments().await?;
        Ok(())
    }

    /// Decode one binary ticker frame in LTP mode: a 2-byte packet count,
    /// then per packet a 2-byte length and an 8-byte payload of
    /// (instrument_token: i32be, ltp_in_paise: i32be).
    fn decode_ltp_frame(&self, frame: &[u8]) -> Vec<Tick> {
        let mut ticks = Vec::new();
        if frame.len() < 2 {
            return ticks;
        }
        let count = u16::from_be_bytes([frame[0], frame[1]]) as usize;
        let mut offset = 2;
        let symbols = self.symbols.read();
        for _ in 0..count {
            if frame.len() < offset + 2 {
                break;
            }
            let len = u16::from_be_bytes([frame[offset], frame[offset + 1]]) as usize;
            offset += 2;
            if frame.len() < offset + len || len < 8 {
                break;
            }
            let token = u32::from_be_bytes([
                frame[offset],
                frame[offset + 1],
                frame[offset + 2],
                frame[offset + 3],
            ]);
            let paise = i32::from_be_bytes([
                frame[offset + 4],
                frame[offset + 5],
                frame[offset + 6],
                frame[offset + 7],
            ]);
            offset += len;

            if let Some(symbol) = symbols.get(&token) {
                ticks.push(Tick {
                    symbol: symbol.clone(),
                    ltp: Decimal::new(paise as i64, 2),
                    volume: 0,
                    ts: Utc::now(),
                });
            }
        }
        ticks
    }
}

#[async_trait]
impl BrokerAdapter for KiteBroker {
    fn kind(&self) -> &'static str {
        "kite"
    }

    async fn connect(&self) -> BrokerResult<ConnectionResult> {
        // Validate the token with a cheap profile call.
        let data = self.get_json("/user/profile", STATUS_TIMEOUT).await?;
        self.connected.store(true, Ordering::SeqCst);
        info!(user = %data["user_id"].as_str().unwrap_or("?"), "kite adapter connected");
        Ok(ConnectionResult {
            session_id: self.session_id.read().clone(),
            expires_at: None,
        })
    }

    async fn disconnect(&self) -> BrokerResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        self.subscriptions.write().clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    #[instrument(skip(self, req), fields(symbol = %req.symbol, qty = req.quantity), name = "kite::place_order")]
    async fn place_order(&self, req: &OrderRequest) -> BrokerResult<OrderAck> {
        if !self.is_connected() {
            return Err(BrokerError::NotConnected);
        }
        let transaction_type = match req.direction {
            Direction::Buy => "BUY",
            Direction::Sell => "SELL",
        };
        let product = match req.product_type {
            ProductType::Delivery => "CNC",
            ProductType::Intraday => "MIS",
        };
        let price = req
            .limit_price
            .map(|p| p.to_string())
            .unwrap_or_default();

        let mut form: Vec<(&str, String)> = vec![
            ("tradingsymbol", req.symbol.clone()),
            ("exchange", "NSE".to_string()),
            ("transaction_type", transaction_type.to_string()),
            ("order_type", req.order_type.as_str().to_string()),
            ("quantity", req.quantity.to_string()),
            ("product", product.to_string()),
            ("validity", "DAY".to_string()),
            ("tag", req.client_order_tag.clone()),
        ];
        if req.order_type == OrderType::Limit {
            form.push(("price", price));
        }

        let fut = async {
            let resp = self
                .client
                .post(format!("{BASE_URL}/orders/regular"))
                .header("X-Kite-Version", KITE_VERSION)
                .header("Authorization", self.auth_header())
                .form(&form)
                .send()
                .await?;
            Self::unwrap_envelope(resp).await
        };
        let data = tokio::time::timeout(ORDER_TIMEOUT, fut)
            .await
            .map_err(|_| BrokerError::Timeout(ORDER_TIMEOUT))??;

        let order_id = data["order_id"]
            .as_str()
            .ok_or_else(|| BrokerError::InvalidArgument("order response missing order_id".into()))?
            .to_string();
        debug!(order_id = %order_id, "kite order placed");
        Ok(OrderAck {
            broker_order_id: order_id,
            state: BrokerOrderState::Accepted,
        })
    }

    async fn modify_order(
        &self,
        broker_order_id: &str,
        req: &OrderRequest,
    ) -> BrokerResult<OrderAck> {
        let mut form: Vec<(&str, String)> = vec![
            ("quantity", req.quantity.to_string()),
            ("order_type", req.order_type.as_str().to_string()),
        ];
        if let Some(price) = req.limit_price {
            form.push(("price", price.to_string()));
        }

        let fut = async {
            let resp = self
                .client
                .put(format!("{BASE_URL}/orders/regular/{broker_order_id}"))
                .header("X-Kite-Version", KITE_VERSION)
                .header("Authorization", self.auth_header())
                .form(&form)
                .send()
                .await?;
            Self::unwrap_envelope(resp).await
        };
        let data = tokio::time::timeout(ORDER_TIMEOUT, fut)
            .await
            .map_err(|_| BrokerError::Timeout(ORDER_TIMEOUT))??;

        Ok(OrderAck {
            broker_order_id: data["order_id"]
                .as_str()
                .unwrap_or(broker_order_id)
                .to_string(),
            state: BrokerOrderState::Accepted,
        })
    }

    async fn cancel_order(&self, broker_order_id: &str) -> BrokerResult<()> {
        let fut = async {
            let resp = self
                .client
                .delete(format!("{BASE_URL}/orders/regular/{broker_order_id}"))
                .header("X-Kite-Version", KITE_VERSION)
                .header("Authorization", self.auth_header())
                .send()
                .await?;
            Self::unwrap_envelope(resp).await
        };
        tokio::time::timeout(ORDER_TIMEOUT, fut)
            .await
            .map_err(|_| BrokerError::Timeout(ORDER_TIMEOUT))??;
        Ok(())
    }

    async fn get_order_status(&self, broker_order_id: &str) -> BrokerResult<OrderStatus> {
        let data = self
            .get_json(&format!("/orders/{broker_order_id}"), STATUS_TIMEOUT)
            .await?;
        // Kite returns the order's full history; the last entry is current.
        let history = data
            .as_array()
            .ok_or_else(|| BrokerError::InvalidArgument("order history is not an array".into()))?;
        let last = history
            .last()
            .ok_or_else(|| BrokerError::rejection("UNKNOWN_ORDER", "empty order history"))?;
        Ok(Self::order_status_from_json(last))
    }

    async fn get_open_orders(&self) -> BrokerResult<Vec<OrderStatus>> {
        let data = self.get_json("/orders", STATUS_TIMEOUT).await?;
        let orders = data.as_array().cloned().unwrap_or_default();
        Ok(orders
            .iter()
            .map(Self::order_status_from_json)
            .filter(|o| {
                matches!(
                    o.state,
                    BrokerOrderState::Accepted | BrokerOrderState::PartiallyFilled
                )
            })
            .collect())
    }

    async fn get_positions(&self) -> BrokerResult<Vec<PositionInfo>> {
        let data = self.get_json("/portfolio/positions", STATUS_TIMEOUT).await?;
        let net = data["net"].as_array().cloned().unwrap_or_default();
        Ok(net
            .iter()
            .map(|p| PositionInfo {
                symbol: p["tradingsymbol"].as_str().unwrap_or_default().to_string(),
                quantity: p["quantity"].as_i64().unwrap_or(0),
                avg_price: p["average_price"]
                    .as_f64()
                    .and_then(Decimal::from_f64_retain)
                    .unwrap_or(Decimal::ZERO),
                pnl: p["pnl"]
                    .as_f64()
                    .and_then(Decimal::from_f64_retain)
                    .unwrap_or(Decimal::ZERO),
            })
            .collect())
    }

    async fn get_holdings(&self) -> BrokerResult<Vec<HoldingInfo>> {
        let data = self.get_json("/portfolio/holdings", STATUS_TIMEOUT).await?;
        let rows = data.as_array().cloned().unwrap_or_default();
        Ok(rows
            .iter()
            .map(|h| HoldingInfo {
                symbol: h["tradingsymbol"].as_str().unwrap_or_default().to_string(),
                quantity: h["quantity"].as_i64().unwrap_or(0),
                avg_price: h["average_price"]
                    .as_f64()
                    .and_then(Decimal::from_f64_retain)
                    .unwrap_or(Decimal::ZERO),
            })
            .collect())
    }

    async fn get_funds(&self) -> BrokerResult<FundsInfo> {
        let data = self.get_json("/user/margins/equity", STATUS_TIMEOUT).await?;
        Ok(FundsInfo {
            available: data["available"]["live_balance"]
                .as_f64()
                .and_then(Decimal::from_f64_retain)
                .unwrap_or(Decimal::ZERO),
            utilized: data["utilised"]["debits"]
                .as_f64()
                .and_then(Decimal::from_f64_retain)
                .unwrap_or(Decimal::ZERO),
        })
    }

    /// Connect the ticker, subscribe in LTP mode, and forward ticks until
    /// the stream ends. The caller owns reconnection.
    async fn subscribe_ticks(
        &self,
        symbols: &[String],
        sink: mpsc::Sender<Tick>,
    ) -> BrokerResult<()> {
        self.ensure_instruments().await?;
        let tokens: Vec<u32> = {
            let map = self.tokens.read();
            symbols.iter().filter_map(|s| map.get(s).copied()).collect()
        };
        if tokens.is_empty() {
            return Err(BrokerError::InvalidArgument(
                "no instrument tokens for requested symbols".into(),
            ));
        }
        {
            let mut subs = self.subscriptions.write();
            for s in symbols {
                if !subs.contains(s) {
                    subs.push(s.clone());
                }
            }
        }

        let url = format!(
            "{WS_URL}?api_key={}&access_token={}",
            self.api_key,
            self.access_token.read()
        );
        info!(symbols = symbols.len(), "connecting kite ticker");
        let (ws, _resp) = connect_async(&url).await?;
        let (mut write, mut read) = ws.split();

        let subscribe = serde_json::json!({"a": "subscribe", "v": tokens});
        write.send(Message::Text(subscribe.to_string())).await?;
        let mode = serde_json::json!({"a": "mode", "v": ["ltp", tokens]});
        write.send(Message::Text(mode.to_string())).await?;

        while let Some(msg) = read.next().await {
            match msg {
                Ok(Message::Binary(frame)) => {
                    for tick in self.decode_ltp_frame(&frame) {
                        if sink.send(tick).await.is_err() {
                            // Receiver dropped: the engine is shutting down.
                            return Ok(());
                        }
                    }
                }
                Ok(Message::Text(text)) => {
                    debug!(msg = %text, "kite ticker text message");
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "kite ticker read error");
                    return Err(e.into());
                }
            }
        }
        warn!("kite ticker stream ended");
        Ok(())
    }

    async fn unsubscribe_ticks(&self, symbols: &[String]) -> BrokerResult<()> {
        self.subscriptions
            .write()
            .retain(|s| !symbols.contains(s));
        Ok(())
    }

    async fn get_ltp(&self, symbol: &str) -> BrokerResult<Decimal> {
        let data = self
            .get_json(&format!("/quote/ltp?i=NSE:{symbol}"), STATUS_TIMEOUT)
            .await?;
        data[&format!("NSE:{symbol}")]["last_price"]
            .as_f64()
            .and_then(Decimal::from_f64_retain)
            .ok_or_else(|| BrokerError::InvalidArgument(format!("no LTP for {symbol}")))
    }

    async fn get_historical_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> BrokerResult<Vec<Candle>> {
        self.ensure_instruments().await?;
        let token = self
            .tokens
            .read()
            .get(symbol)
            .copied()
            .ok_or_else(|| BrokerError::InvalidArgument(format!("unknown symbol {symbol}")))?;

        let path = format!(
            "/instruments/historical/{token}/{}?from={}&to={}",
            Self::interval_name(timeframe),
            from.format("%Y-%m-%d %H:%M:%S"),
            to.format("%Y-%m-%d %H:%M:%S"),
        );
        let data = self.get_json(&path, HISTORY_TIMEOUT).await?;

        let rows = data["candles"].as_array().cloned().unwrap_or_default();
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let cols = match row.as_array() {
                Some(c) if c.len() >= 6 => c.clone(),
                _ => continue,
            };
            let ts = cols[0].as_i64().or_else(|| {
                cols[0]
                    .as_str()
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|d| d.timestamp())
            });
            let Some(ts) = ts else { continue };
            let dec = |v: &serde_json::Value| {
                v.as_f64().and_then(Decimal::from_f64_retain).unwrap_or(Decimal::ZERO)
            };
            out.push(Candle {
                symbol: symbol.to_string(),
                timeframe,
                bucket_start: Utc.timestamp_opt(ts, 0).single().unwrap_or_else(Utc::now),
                open: dec(&cols[1]),
                high: dec(&cols[2]),
                low: dec(&cols[3]),
                close: dec(&cols[4]),
                volume: cols[5].as_i64().unwrap_or(0),
                closed: true,
            });
        }
        Ok(out)
    }

    /// Fetch the instrument dump (CSV) and build the symbol/token maps.
    async fn get_instruments(&self) -> BrokerResult<Vec<Instrument>> {
        let fut = async {
            let resp = self
                .client
                .get(format!("{BASE_URL}/instruments/NSE"))
                .header("X-Kite-Version", KITE_VERSION)
                .header("Authorization", self.auth_header())
                .send()
                .await?;
            let status = resp.status();
            let text = resp.text().await?;
            if !status.is_success() {
                return Err(BrokerError::Transient(format!(
                    "instrument dump failed: HTTP {status}"
                )));
            }
            Ok(text)
        };
        let csv = tokio::time::timeout(HISTORY_TIMEOUT, fut)
            .await
            .map_err(|_| BrokerError::Timeout(HISTORY_TIMEOUT))??;

        let mut lines = csv.lines();
        let header: Vec<&str> = lines.next().unwrap_or_default().split(',').collect();
        let col = |name: &str| header.iter().position(|h| *h == name);
        let (Some(tok_i), Some(sym_i), Some(lot_i), Some(tick_i), Some(exch_i)) = (
            col("instrument_token"),
            col("tradingsymbol"),
            col("lot_size"),
            col("tick_size"),
            col("exchange"),
        ) else {
            return Err(BrokerError::InvalidArgument(
                "instrument dump missing expected columns".into(),
            ));
        };

        let mut instruments = Vec::new();
        let mut tokens = HashMap::new();
        let mut symbols = HashMap::new();
        for line in lines {
            let cols: Vec<&str> = line.split(',').collect();
            if cols.len() <= tick_i.max(sym_i).max(tok_i) {
                continue;
            }
            let Ok(token) = cols[tok_i].parse::<u32>() else { continue };
            let symbol = cols[sym_i].to_string();
            instruments.push(Instrument {
                symbol: symbol.clone(),
                exchange: cols[exch_i].to_string(),
                lot_size: cols[lot_i].parse().unwrap_or(1),
                tick_size: cols[tick_i].parse().unwrap_or(Decimal::new(5, 2)),
            });
            tokens.insert(symbol.clone(), token);
            symbols.insert(token, symbol);
        }

        *self.tokens.write() = tokens;
        *self.symbols.write() = symbols;
        info!(count = instruments.len(), "kite instrument dump loaded");
        Ok(instruments)
    }

    async fn reload_token(&self, access_token: &str, session_id: &str) -> BrokerResult<()> {
        *self.access_token.write() = access_token.to_string();
        *self.session_id.write() = session_id.to_string();
        info!("kite access token reloaded");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn checksum_is_sha256_of_concatenation() {
        // Stable against any refactor of the hashing code.
        let sum = login_checksum("key", "reqtok", "secret");
        assert_eq!(sum.len(), 64);
        assert_eq!(sum, login_checksum("key", "reqtok", "secret"));
        assert_ne!(sum, login_checksum("key", "other", "secret"));
    }

    #[test]
    fn order_state_mapping() {
        assert_eq!(KiteBroker::map_order_state("COMPLETE"), BrokerOrderState::Filled);
        assert_eq!(KiteBroker::map_order_state("REJECTED"), BrokerOrderState::Rejected);
        assert_eq!(KiteBroker::map_order_state("CANCELLED"), BrokerOrderState::Cancelled);
        assert_eq!(KiteBroker::map_order_state("OPEN"), BrokerOrderState::Accepted);
    }

    #[test]
    fn order_status_json_mapping() {
        let status = KiteBroker::order_status_from_json(&json!({
            "order_id": "230101000001",
            "status": "COMPLETE",
            "filled_quantity": 10,
            "average_price": 2900.55,
            "tag": "intent-abc",
            "status_message": null,
        }));
        assert_eq!(status.broker_order_id, "230101000001");
        assert_eq!(status.state, BrokerOrderState::Filled);
        assert_eq!(status.filled_qty, 10);
        assert_eq!(status.client_order_tag.as_deref(), Some("intent-abc"));
        assert!(status.avg_fill_price.is_some());
    }

    #[test]
    fn partial_fill_detected_from_quantity() {
        let status = KiteBroker::order_status_from_json(&json!({
            "order_id": "1",
            "status": "OPEN",
            "filled_quantity": 4,
            "average_price": 100.0,
        }));
        assert_eq!(status.state, BrokerOrderState::PartiallyFilled);
    }

    #[test]
    fn ltp_frame_decoding() {
        let broker = KiteBroker::new("k", "t");
        broker
            .symbols
            .write()
            .insert(408065, "RELIANCE".to_string());

        // One packet: token 408065, ltp 290010 paise (2900.10).
        let mut frame = Vec::new();
        frame.extend_from_slice(&1u16.to_be_bytes());
        frame.extend_from_slice(&8u16.to_be_bytes());
        frame.extend_from_slice(&408065u32.to_be_bytes());
        frame.extend_from_slice(&290010i32.to_be_bytes());

        let ticks = broker.decode_ltp_frame(&frame);
        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].symbol, "RELIANCE");
        assert_eq!(ticks[0].ltp, Decimal::new(290010, 2));
    }

    #[test]
    fn unknown_token_is_skipped() {
        let broker = KiteBroker::new("k", "t");
        let mut frame = Vec::new();
        frame.extend_from_slice(&1u16.to_be_bytes());
        frame.extend_from_slice(&8u16.to_be_bytes());
        frame.extend_from_slice(&1u32.to_be_bytes());
        frame.extend_from_slice(&100i32.to_be_bytes());
        assert!(broker.decode_ltp_frame(&frame).is_empty());
    }
}
