// =============================================================================
// Partition Worker — owns every state transition for its trades
// =============================================================================
//
// One worker per partition, draining its queue FIFO. The worker keeps an
// in-memory index of its non-terminal trades (symbol + last evaluated price
// for the brick filter), rebuilt from the repository at startup and on
// reconcile ticks.
//
// Illegal transitions are never applied: they log a warning, raise a HIGH
// alert, and no-op — a violation indicates a bug, not a recoverable state.
// =============================================================================

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use rust_decimal::{Decimal, RoundingStrategy};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::{AdapterFactory, BrokerAdapter, BrokerOrderState, OrderAck, OrderRequest};
use crate::events::{topic, Correlation, EventDraft, EventLog};
use crate::exit_rules::{brick_moved, evaluate_price_update, ExitQualification};
use crate::store::config_store::ConfigStore;
use crate::store::signals::Signal;
use crate::store::trades::{ExitIntent, ExitIntentRepo, IntentRepo, Trade, TradeIntent, TradeRepo};
use crate::store::user_brokers::UserBrokerRepo;
use crate::trade_actor::{trade_id_for_intent, OrderUpdate, TradeActor, TradeMsg};
use crate::types::{
    AlertSeverity, EntryKind, ExitIntentStatus, ExitReason, IntentStatus, Tick, TradeStatus,
};

/// Price decimals for money rounding (HALF_UP).
const MONEY_DECIMALS: u32 = 2;

/// Shared dependencies for every partition.
pub struct WorkerDeps {
    pub trades: TradeRepo,
    pub intents: IntentRepo,
    pub exits: ExitIntentRepo,
    pub user_brokers: UserBrokerRepo,
    pub factory: Arc<AdapterFactory>,
    pub events: Arc<EventLog>,
    pub config: ConfigStore,
    pub exit_qual: ExitQualification,
    pub broker_max_attempts: u32,
    pub broker_backoff_ms: u64,
}

/// Partition assignment for a trade id.
pub(crate) fn partition_index(trade_id: Uuid, partitions: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    trade_id.hash(&mut hasher);
    (hasher.finish() % partitions.max(1) as u64) as usize
}

/// Resolve which trade an order update belongs to. The client order tag is
/// the intent id for entry orders and the exit-intent id for exit orders;
/// untagged updates resolve through the broker order id.
pub(crate) fn resolve_trade_id(deps: &WorkerDeps, update: &OrderUpdate) -> Result<Option<Uuid>> {
    if let Some(tag) = update
        .client_order_tag
        .as_deref()
        .and_then(|t| Uuid::parse_str(t).ok())
    {
        let candidate = trade_id_for_intent(tag);
        if deps.trades.find_by_id(candidate)?.is_some() {
            return Ok(Some(candidate));
        }
        if let Some(exit) = deps.exits.get(tag)? {
            return Ok(Some(exit.trade_id));
        }
    }
    if let Some(order_id) = &update.broker_order_id {
        return Ok(deps.trades.find_by_broker_order_id(order_id)?.map(|t| t.id));
    }
    Ok(None)
}

#[derive(Debug)]
struct ActiveEntry {
    symbol: String,
    /// Last price the exit conditions were evaluated at (brick filter).
    last_eval: Option<Decimal>,
}

/// One partition of the trade actor.
pub(crate) struct Partition {
    index: usize,
    total: usize,
    deps: Arc<WorkerDeps>,
    active: HashMap<Uuid, ActiveEntry>,
}

impl Partition {
    pub(crate) fn new(index: usize, total: usize, deps: Arc<WorkerDeps>) -> Self {
        Self {
            index,
            total,
            deps,
            active: HashMap::new(),
        }
    }

    fn owns(&self, trade_id: Uuid) -> bool {
        partition_index(trade_id, self.total) == self.index
    }

    /// Consume the queue until it closes, then stop (drain semantics).
    pub(crate) async fn run(&mut self, mut rx: mpsc::Receiver<TradeMsg>) {
        if let Err(e) = self.rebuild_index() {
            error!(partition = self.index, error = %e, "failed to rebuild active index");
        }
        info!(
            partition = self.index,
            active = self.active.len(),
            "trade partition running"
        );

        while let Some(msg) = rx.recv().await {
            let result = match msg {
                TradeMsg::IntentApproved { intent, signal } => {
                    self.handle_intent_approved(intent, signal).await
                }
                TradeMsg::BrokerOrderUpdate(update) => self.handle_order_update(update).await,
                TradeMsg::PriceUpdate(tick) => self.handle_price_update(tick).await,
                TradeMsg::Cancel { trade_id } => self.handle_cancel(trade_id).await,
                TradeMsg::ReconcileTick => self.rebuild_index(),
                TradeMsg::Barrier(ack) => {
                    let _ = ack.send(());
                    Ok(())
                }
            };
            if let Err(e) = result {
                error!(partition = self.index, error = %e, "trade message failed");
            }
        }
        debug!(partition = self.index, "trade partition drained");
    }

    /// Rebuild the in-memory active index from the repository.
    fn rebuild_index(&mut self) -> Result<()> {
        let trades = self.deps.trades.list_by_status(TradeActor::indexed_statuses())?;
        let previous: HashMap<Uuid, Option<Decimal>> = self
            .active
            .drain()
            .map(|(id, e)| (id, e.last_eval))
            .collect();
        for trade in trades {
            if self.owns(trade.id) {
                self.active.insert(
                    trade.id,
                    ActiveEntry {
                        symbol: trade.symbol.clone(),
                        last_eval: previous.get(&trade.id).copied().flatten(),
                    },
                );
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Intent approved → create trade, place entry order
    // -------------------------------------------------------------------------

    async fn handle_intent_approved(&mut self, intent: TradeIntent, signal: Signal) -> Result<()> {
        if !intent.validation_passed {
            warn!(intent_id = %intent.id, "rejected intent reached the actor — ignored");
            return Ok(());
        }

        let mut trade = self.create_trade_for_intent(&intent, &signal)?;
        if trade.status != TradeStatus::Created {
            // Replay of an intent whose trade already progressed.
            debug!(trade_id = %trade.id, status = %trade.status, "intent replay — trade already progressed");
            return Ok(());
        }

        let req = OrderRequest {
            client_order_tag: intent.id.to_string(),
            symbol: intent.symbol.clone(),
            direction: intent.direction,
            order_type: intent.order_type,
            product_type: intent.product_type,
            quantity: intent.quantity,
            limit_price: intent.limit_price,
        };

        let placement = match self.adapter_for(trade.user_broker_id).await {
            Ok(adapter) => self.place_with_retry(adapter.as_ref(), &req).await,
            Err(e) => Err(crate::broker::BrokerError::Transient(e.to_string())),
        };

        match placement {
            Ok(ack) => {
                trade.broker_order_id = Some(ack.broker_order_id.clone());
                self.apply_transition(&mut trade, TradeStatus::EntrySubmitted)?;
                self.deps.intents.set_status(intent.id, IntentStatus::Executed)?;
                self.active.insert(
                    trade.id,
                    ActiveEntry {
                        symbol: trade.symbol.clone(),
                        last_eval: None,
                    },
                );
                // Some brokers report acceptance synchronously.
                if ack.state == BrokerOrderState::Filled {
                    let status = OrderUpdate {
                        broker_order_id: Some(ack.broker_order_id),
                        client_order_tag: Some(intent.id.to_string()),
                        state: BrokerOrderState::Filled,
                        filled_qty: intent.quantity,
                        avg_fill_price: intent.limit_price,
                        reason: None,
                    };
                    self.handle_order_update(status).await?;
                }
            }
            Err(e) => {
                self.mark_trade_rejected(&mut trade, &e.to_string())?;
                self.deps.intents.set_status(intent.id, IntentStatus::Failed)?;
                self.emit(
                    EventDraft::user_broker(
                        topic::INTENT_FAILED,
                        trade.user_id,
                        trade.user_broker_id,
                        json!({
                            "symbol": trade.symbol,
                            "error": e.to_string(),
                        }),
                    )
                    .correlate(Correlation {
                        signal_id: Some(trade.signal_id),
                        intent_id: Some(trade.intent_id),
                        trade_id: Some(trade.id),
                        order_id: None,
                    }),
                );
            }
        }
        Ok(())
    }

    /// Sole creator of trade rows. Classifies NEWBUY vs REBUY, derives the
    /// trade id from the intent id, and upserts — calling this twice with
    /// the same intent returns the same trade.
    fn create_trade_for_intent(&self, intent: &TradeIntent, signal: &Signal) -> Result<Trade> {
        let active = self
            .deps
            .trades
            .count_active(intent.user_id, &intent.symbol)?;
        let entry_kind = if active > 0 {
            EntryKind::Rebuy
        } else {
            EntryKind::NewBuy
        };
        let now = Utc::now();

        let draft = Trade {
            id: trade_id_for_intent(intent.id),
            intent_id: intent.id,
            signal_id: signal.id,
            user_id: intent.user_id,
            user_broker_id: intent.user_broker_id,
            symbol: intent.symbol.clone(),
            direction: intent.direction,
            entry_kind,
            product_type: intent.product_type,
            order_type: intent.order_type,
            entry_qty: intent.quantity,
            filled_qty: 0,
            limit_price: intent.limit_price,
            entry_price: None,
            entry_time: None,
            stop_price: None,
            target_price: None,
            trailing: Default::default(),
            broker_order_id: None,
            exit_order_id: None,
            exit_price: None,
            exit_qty: 0,
            exit_reason: None,
            exit_time: None,
            realized_pnl: None,
            log_return: None,
            error_code: None,
            error_message: None,
            status: TradeStatus::Created,
            version: 1,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };

        let (trade, fresh) = {
            let before = self.deps.trades.find_by_intent_id(intent.id)?;
            let trade = self.deps.trades.upsert_for_intent(&draft)?;
            (trade, before.is_none())
        };

        if fresh {
            self.emit(
                EventDraft::user_broker(
                    topic::TRADE_CREATED,
                    trade.user_id,
                    trade.user_broker_id,
                    json!({
                        "symbol": trade.symbol,
                        "direction": trade.direction.as_str(),
                        "entryKind": trade.entry_kind.as_str(),
                        "quantity": trade.entry_qty,
                    }),
                )
                .correlate(Correlation {
                    signal_id: Some(trade.signal_id),
                    intent_id: Some(trade.intent_id),
                    trade_id: Some(trade.id),
                    order_id: None,
                }),
            );
        }
        Ok(trade)
    }

    fn mark_trade_rejected(&mut self, trade: &mut Trade, message: &str) -> Result<()> {
        trade.error_code = Some("BROKER_REJECTION".to_string());
        trade.error_message = Some(message.to_string());
        self.apply_transition(trade, TradeStatus::Rejected)?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Broker order updates
    // -------------------------------------------------------------------------

    async fn handle_order_update(&mut self, update: OrderUpdate) -> Result<()> {
        let Some(trade_id) = resolve_trade_id(&self.deps, &update)? else {
            warn!(
                order_id = update.broker_order_id.as_deref().unwrap_or("?"),
                "order update matches no trade — dropped"
            );
            return Ok(());
        };
        let Some(mut trade) = self.deps.trades.find_by_id(trade_id)? else {
            warn!(%trade_id, "order update for missing trade — dropped");
            return Ok(());
        };

        let is_exit = match (&update.broker_order_id, &trade.exit_order_id) {
            (Some(id), Some(exit_id)) => id == exit_id,
            // Untagged updates without an order id can't be exits.
            _ => update
                .client_order_tag
                .as_deref()
                .and_then(|t| Uuid::parse_str(t).ok())
                .is_some_and(|tag| tag != trade.intent_id),
        };

        if is_exit {
            self.apply_exit_update(&mut trade, &update)?;
        } else {
            self.apply_entry_update(&mut trade, &update)?;
        }
        Ok(())
    }

    fn apply_entry_update(&mut self, trade: &mut Trade, update: &OrderUpdate) -> Result<()> {
        match update.state {
            BrokerOrderState::Accepted => {
                if trade.status == TradeStatus::EntrySubmitted {
                    self.apply_transition(trade, TradeStatus::Pending)?;
                }
            }
            BrokerOrderState::PartiallyFilled => {
                if trade.status == TradeStatus::EntrySubmitted {
                    self.apply_transition(trade, TradeStatus::Pending)?;
                }
                trade.filled_qty = update.filled_qty;
                self.deps.trades.update(trade)?;
            }
            BrokerOrderState::Filled => {
                if trade.status == TradeStatus::EntrySubmitted {
                    self.apply_transition(trade, TradeStatus::Pending)?;
                }
                if trade.status == TradeStatus::Pending {
                    self.open_trade_on_fill(trade, update)?;
                }
            }
            BrokerOrderState::Rejected => {
                if !trade.status.is_terminal() {
                    let reason = update
                        .reason
                        .clone()
                        .unwrap_or_else(|| "order rejected by broker".to_string());
                    self.mark_trade_rejected(trade, &reason)?;
                    self.deps
                        .intents
                        .set_status(trade.intent_id, IntentStatus::Failed)?;
                    self.emit(
                        EventDraft::user_broker(
                            topic::INTENT_FAILED,
                            trade.user_id,
                            trade.user_broker_id,
                            json!({"symbol": trade.symbol, "error": reason}),
                        )
                        .correlate(correlate_trade(trade)),
                    );
                }
            }
            BrokerOrderState::Cancelled => {
                if !trade.status.is_terminal() {
                    self.mark_trade_rejected(trade, "entry order cancelled at broker")?;
                    self.deps
                        .intents
                        .set_status(trade.intent_id, IntentStatus::Failed)?;
                }
            }
        }
        Ok(())
    }

    /// PENDING → OPEN: record the fill, derive stop and target from the
    /// effective config, and start watching the symbol.
    fn open_trade_on_fill(&mut self, trade: &mut Trade, update: &OrderUpdate) -> Result<()> {
        let avg = update
            .avg_fill_price
            .or(trade.limit_price)
            .context("fill update carries no price")?;
        let filled = if update.filled_qty > 0 {
            update.filled_qty
        } else {
            trade.entry_qty
        };

        let cfg = self
            .deps
            .config
            .resolve(&trade.symbol, Some(trade.user_broker_id))?;
        let stop_frac = Decimal::from_f64_retain(cfg.stop_loss_pct).unwrap_or(Decimal::ONE)
            / Decimal::from(100);
        let target_r = Decimal::from_f64_retain(cfg.target_r).unwrap_or(Decimal::from(2));
        let stop_distance = (avg * stop_frac)
            .round_dp_with_strategy(MONEY_DECIMALS, RoundingStrategy::MidpointAwayFromZero);
        let (stop, target) = match trade.direction {
            crate::types::Direction::Buy => {
                (avg - stop_distance, avg + target_r * stop_distance)
            }
            crate::types::Direction::Sell => {
                (avg + stop_distance, avg - target_r * stop_distance)
            }
        };

        trade.entry_price = Some(avg);
        trade.entry_qty = filled;
        trade.filled_qty = filled;
        trade.entry_time = Some(Utc::now());
        trade.stop_price = Some(stop);
        trade.target_price = Some(target);
        self.apply_transition(trade, TradeStatus::Open)?;

        self.emit(
            EventDraft::user_broker(
                topic::TRADE_OPENED,
                trade.user_id,
                trade.user_broker_id,
                json!({
                    "symbol": trade.symbol,
                    "entryPrice": avg.to_string(),
                    "quantity": filled,
                    "stopPrice": stop.to_string(),
                    "targetPrice": target.to_string(),
                }),
            )
            .correlate(correlate_trade(trade)),
        );
        Ok(())
    }

    fn apply_exit_update(&mut self, trade: &mut Trade, update: &OrderUpdate) -> Result<()> {
        let exit_intent = self.deps.exits.non_terminal_for_trade(trade.id)?;
        match update.state {
            BrokerOrderState::Filled => self.close_trade_on_exit_fill(trade, update, exit_intent),
            BrokerOrderState::Rejected | BrokerOrderState::Cancelled => {
                let now = Utc::now();
                if let Some(intent) = exit_intent {
                    let status = if update.state == BrokerOrderState::Rejected {
                        ExitIntentStatus::Rejected
                    } else {
                        ExitIntentStatus::Cancelled
                    };
                    self.deps
                        .exits
                        .set_status(intent.id, status, update.reason.as_deref(), now)?;
                }
                // Back on the open book for a fresh episode.
                if trade.status == TradeStatus::Exiting {
                    trade.exit_order_id = None;
                    trade.exit_reason = None;
                    self.apply_transition(trade, TradeStatus::Open)?;
                }
                self.emit(
                    EventDraft::user_broker(
                        topic::EXIT_INTENT_REJECTED,
                        trade.user_id,
                        trade.user_broker_id,
                        json!({
                            "symbol": trade.symbol,
                            "reason": update.reason,
                        }),
                    )
                    .correlate(correlate_trade(trade)),
                );
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// EXITING → CLOSED. Required before any P&L is visible externally.
    fn close_trade_on_exit_fill(
        &mut self,
        trade: &mut Trade,
        update: &OrderUpdate,
        exit_intent: Option<ExitIntent>,
    ) -> Result<()> {
        if trade.status != TradeStatus::Exiting {
            warn!(trade_id = %trade.id, status = %trade.status, "exit fill for non-exiting trade");
            return Ok(());
        }
        let exit_price = update
            .avg_fill_price
            .or_else(|| exit_intent.as_ref().and_then(|i| i.limit_price))
            .context("exit fill carries no price")?;
        let entry_price = trade.entry_price.context("closing a trade with no entry price")?;
        let qty = if update.filled_qty > 0 {
            update.filled_qty
        } else {
            trade.filled_qty
        };
        let sign = trade.direction.sign();
        let now = Utc::now();

        let pnl = ((exit_price - entry_price) * Decimal::from(qty) * sign)
            .round_dp_with_strategy(MONEY_DECIMALS, RoundingStrategy::MidpointAwayFromZero);
        let log_return = if entry_price > Decimal::ZERO && exit_price > Decimal::ZERO {
            use rust_decimal::prelude::ToPrimitive;
            let ratio = (exit_price / entry_price).to_f64().unwrap_or(1.0);
            let sign_f = if trade.direction == crate::types::Direction::Buy {
                1.0
            } else {
                -1.0
            };
            Some(ratio.ln() * sign_f)
        } else {
            None
        };

        trade.exit_price = Some(exit_price);
        trade.exit_qty = qty;
        trade.exit_time = Some(now);
        trade.realized_pnl = Some(pnl);
        trade.log_return = log_return;
        self.apply_transition(trade, TradeStatus::Closed)?;

        if let Some(intent) = exit_intent {
            self.deps
                .exits
                .set_status(intent.id, ExitIntentStatus::Filled, None, now)?;
        }

        let holding_mins = trade
            .entry_time
            .map(|t| (now - t).num_minutes())
            .unwrap_or(0);
        self.emit(
            EventDraft::user_broker(
                topic::TRADE_CLOSED,
                trade.user_id,
                trade.user_broker_id,
                json!({
                    "symbol": trade.symbol,
                    "exitPrice": exit_price.to_string(),
                    "realizedPnl": pnl.to_string(),
                    "logReturn": log_return,
                    "exitReason": trade.exit_reason.map(|r| r.as_str()),
                    "holdingMinutes": holding_mins,
                }),
            )
            .correlate(correlate_trade(trade)),
        );
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Operator cancel
    // -------------------------------------------------------------------------

    /// Cancel an OPEN or EXITING trade. An in-flight exit order is cancelled
    /// at the broker first; failures there are logged but do not block the
    /// trade-side cancellation.
    async fn handle_cancel(&mut self, trade_id: Uuid) -> Result<()> {
        let Some(mut trade) = self.deps.trades.find_by_id(trade_id)? else {
            warn!(%trade_id, "cancel for unknown trade — ignored");
            return Ok(());
        };
        if !matches!(trade.status, TradeStatus::Open | TradeStatus::Exiting) {
            warn!(%trade_id, status = %trade.status, "cancel refused: trade not OPEN/EXITING");
            return Ok(());
        }

        if trade.status == TradeStatus::Exiting {
            if let Some(order_id) = trade.exit_order_id.clone() {
                match self.adapter_for(trade.user_broker_id).await {
                    Ok(adapter) => {
                        if let Err(e) = adapter.cancel_order(&order_id).await {
                            warn!(%trade_id, error = %e, "exit order cancel failed at broker");
                        }
                    }
                    Err(e) => warn!(%trade_id, error = %e, "no adapter for exit cancel"),
                }
            }
            if let Some(intent) = self.deps.exits.non_terminal_for_trade(trade.id)? {
                self.deps.exits.set_status(
                    intent.id,
                    ExitIntentStatus::Cancelled,
                    Some("operator cancel"),
                    Utc::now(),
                )?;
            }
        }

        self.apply_transition(&mut trade, TradeStatus::Cancelled)?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Price updates → exit conditions + trailing stop
    // -------------------------------------------------------------------------

    async fn handle_price_update(&mut self, tick: Tick) -> Result<()> {
        let candidates: Vec<Uuid> = self
            .active
            .iter()
            .filter(|(_, e)| e.symbol == tick.symbol)
            .map(|(id, _)| *id)
            .collect();

        for trade_id in candidates {
            let Some(mut trade) = self.deps.trades.find_by_id(trade_id)? else {
                self.active.remove(&trade_id);
                continue;
            };
            if trade.status != TradeStatus::Open {
                if trade.status.is_terminal() {
                    self.active.remove(&trade_id);
                }
                continue;
            }

            let trailing_cfg = self.deps.config.trailing()?;

            // Brick filter: skip unless price moved enough since the last
            // evaluation of this trade.
            let last_eval = self.active.get(&trade_id).and_then(|e| e.last_eval);
            if !brick_moved(last_eval, tick.ltp, trailing_cfg.min_move_percent) {
                continue;
            }
            if let Some(entry) = self.active.get_mut(&trade_id) {
                entry.last_eval = Some(tick.ltp);
            }

            let mtf_cfg = self
                .deps
                .config
                .resolve(&trade.symbol, Some(trade.user_broker_id))?;
            let eval = evaluate_price_update(&trade, tick.ltp, tick.ts, &trailing_cfg, &mtf_cfg);

            if eval.trailing_changed {
                let stop_moved = eval.trailing.stop_price != trade.trailing.stop_price;
                trade.trailing = eval.trailing;
                self.deps.trades.update(&mut trade)?;
                if stop_moved {
                    self.emit(
                        EventDraft::user_broker(
                            topic::TRAILING_STOP_UPDATED,
                            trade.user_id,
                            trade.user_broker_id,
                            json!({
                                "symbol": trade.symbol,
                                "highestPrice": trade.trailing.highest_price.map(|p| p.to_string()),
                                "stopPrice": trade.trailing.stop_price.map(|p| p.to_string()),
                                "active": trade.trailing.active,
                            }),
                        )
                        .correlate(correlate_trade(&trade)),
                    );
                }
            }

            if let Some((reason, price)) = eval.trigger {
                self.try_exit(&mut trade, reason, price, tick.ts).await?;
            }
        }
        Ok(())
    }

    /// Qualify and submit an exit order; on success the trade turns EXITING.
    /// `now` is the observation time of the triggering price.
    async fn try_exit(
        &mut self,
        trade: &mut Trade,
        reason: ExitReason,
        detected_price: Decimal,
        now: chrono::DateTime<Utc>,
    ) -> Result<()> {
        let in_flight = self.deps.exits.non_terminal_for_trade(trade.id)?.is_some();
        let adapter = self.adapter_for(trade.user_broker_id).await;
        let connected = adapter.as_ref().map(|a| a.is_connected()).unwrap_or(false);

        let decision = self.deps.exit_qual.qualify(
            trade,
            reason,
            detected_price,
            connected,
            in_flight,
            None,
            now,
        );
        if !decision.passed {
            debug!(
                trade_id = %trade.id,
                reason = %reason,
                errors = ?decision.errors,
                "exit attempt did not qualify"
            );
            self.emit(
                EventDraft::user_broker(
                    topic::EXIT_INTENT_REJECTED,
                    trade.user_id,
                    trade.user_broker_id,
                    json!({
                        "symbol": trade.symbol,
                        "exitReason": reason.as_str(),
                        "errors": decision.errors,
                    }),
                )
                .correlate(correlate_trade(trade)),
            );
            return Ok(());
        }
        let adapter = adapter?;

        let episode = self.deps.exits.next_episode(trade.id, reason)?;
        let exit_intent = ExitIntent {
            id: Uuid::new_v4(),
            trade_id: trade.id,
            reason,
            episode,
            status: ExitIntentStatus::Approved,
            order_type: decision.order_type,
            quantity: decision.quantity,
            limit_price: decision.limit_price,
            detected_price,
            error_message: None,
            created_at: now,
            updated_at: now,
        };
        self.deps.exits.insert(&exit_intent)?;

        let req = OrderRequest {
            client_order_tag: exit_intent.id.to_string(),
            symbol: trade.symbol.clone(),
            direction: trade.direction.opposite(),
            order_type: decision.order_type,
            product_type: trade.product_type,
            quantity: decision.quantity,
            limit_price: decision.limit_price,
        };

        match self.place_with_retry(adapter.as_ref(), &req).await {
            Ok(ack) => {
                self.deps.exits.set_status(
                    exit_intent.id,
                    ExitIntentStatus::Placed,
                    None,
                    Utc::now(),
                )?;
                trade.exit_order_id = Some(ack.broker_order_id.clone());
                trade.exit_reason = Some(reason);
                self.apply_transition(trade, TradeStatus::Exiting)?;
                self.emit(
                    EventDraft::user_broker(
                        topic::EXIT_PLACED,
                        trade.user_id,
                        trade.user_broker_id,
                        json!({
                            "symbol": trade.symbol,
                            "exitReason": reason.as_str(),
                            "orderType": decision.order_type.as_str(),
                            "quantity": decision.quantity,
                            "limitPrice": decision.limit_price.map(|p| p.to_string()),
                        }),
                    )
                    .correlate(Correlation {
                        signal_id: Some(trade.signal_id),
                        intent_id: Some(trade.intent_id),
                        trade_id: Some(trade.id),
                        order_id: Some(ack.broker_order_id),
                    }),
                );
            }
            Err(e) => {
                self.deps.exits.set_status(
                    exit_intent.id,
                    ExitIntentStatus::Failed,
                    Some(&e.to_string()),
                    Utc::now(),
                )?;
                warn!(trade_id = %trade.id, error = %e, "exit order placement failed");
                self.deps.events.alert(
                    AlertSeverity::High,
                    "EXIT_PLACEMENT_FAILED",
                    &format!("exit order for {} failed: {e}", trade.symbol),
                );
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Shared plumbing
    // -------------------------------------------------------------------------

    /// Guarded transition: illegal edges log, alert HIGH, and no-op.
    fn apply_transition(&mut self, trade: &mut Trade, to: TradeStatus) -> Result<bool> {
        let from = trade.status;
        if !from.can_transition(to) {
            warn!(trade_id = %trade.id, %from, %to, "illegal trade transition requested");
            self.deps.events.alert(
                AlertSeverity::High,
                "STATE_VIOLATION",
                &format!("illegal transition {from} -> {to} for trade {}", trade.id),
            );
            return Ok(false);
        }

        trade.status = to;
        self.deps.trades.update(trade)?;

        if to.is_terminal() {
            self.active.remove(&trade.id);
        }

        self.emit(
            EventDraft::user_broker(
                topic::TRADE_STATUS_CHANGED,
                trade.user_id,
                trade.user_broker_id,
                json!({
                    "symbol": trade.symbol,
                    "from": from.as_str(),
                    "to": to.as_str(),
                }),
            )
            .correlate(correlate_trade(trade)),
        );
        Ok(true)
    }

    async fn adapter_for(&self, user_broker_id: Uuid) -> Result<Arc<dyn BrokerAdapter>> {
        let ub = self
            .deps
            .user_brokers
            .get(user_broker_id)?
            .context("unknown user broker")?;
        let session = self.deps.user_brokers.session(user_broker_id)?;
        let adapter = self.deps.factory.adapter_for(&ub, session.as_ref())?;
        if !adapter.is_connected() {
            if let Err(e) = adapter.connect().await {
                warn!(%user_broker_id, error = %e, "adapter connect failed");
            }
        }
        Ok(adapter)
    }

    /// Exponential backoff on transient failures only.
    async fn place_with_retry(
        &self,
        adapter: &dyn BrokerAdapter,
        req: &OrderRequest,
    ) -> crate::broker::BrokerResult<OrderAck> {
        let mut attempt: u32 = 0;
        loop {
            match adapter.place_order(req).await {
                Ok(ack) => return Ok(ack),
                Err(e) if e.is_transient() && attempt + 1 < self.deps.broker_max_attempts => {
                    attempt += 1;
                    let delay = self.deps.broker_backoff_ms * 2u64.pow(attempt - 1);
                    warn!(
                        attempt,
                        delay_ms = delay,
                        error = %e,
                        "transient placement failure — retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn emit(&self, draft: EventDraft) {
        if let Err(e) = self.deps.events.append(draft) {
            error!(error = %e, "failed to append event");
        }
    }
}

fn correlate_trade(trade: &Trade) -> Correlation {
    Correlation {
        signal_id: Some(trade.signal_id),
        intent_id: Some(trade.intent_id),
        trade_id: Some(trade.id),
        order_id: trade.broker_order_id.clone(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
