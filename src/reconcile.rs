// =============================================================================
// Reconciliation Engine — heal state drift between trades and the broker
// =============================================================================
//
// Periodically queries the broker for every trade stuck in an in-flight
// status (ENTRY_SUBMITTED, PENDING, EXITING), synthesizes a broker order
// update from the answer, and feeds it back through the trade actor so the
// healing write goes through the same single-writer path as a live update.
//
// The reconciler never mutates trades itself and never cancels anything at
// the broker; it only reports what the broker already did.
// =============================================================================

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::broker::AdapterFactory;
use crate::store::trades::{Trade, TradeRepo};
use crate::store::user_brokers::UserBrokerRepo;
use crate::trade_actor::{OrderUpdate, TradeActor};
use crate::types::TradeStatus;

/// Summary of a single reconciliation pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    /// In-flight trades examined.
    pub checked: u32,
    /// Synthesized updates fed back into the actor.
    pub updates_sent: u32,
    /// Status queries that failed (retried next cycle).
    pub failures: u32,
    pub timestamp: String,
}

pub struct Reconciler {
    trades: TradeRepo,
    user_brokers: UserBrokerRepo,
    factory: Arc<AdapterFactory>,
    actor: Arc<TradeActor>,
}

impl Reconciler {
    pub fn new(
        trades: TradeRepo,
        user_brokers: UserBrokerRepo,
        factory: Arc<AdapterFactory>,
        actor: Arc<TradeActor>,
    ) -> Self {
        Self {
            trades,
            user_brokers,
            factory,
            actor,
        }
    }

    /// Run forever at `interval`; spawned as a background task.
    pub async fn run(self: Arc<Self>, interval: std::time::Duration) {
        let mut ticker = tokio::time::interval(interval);
        info!(interval_secs = interval.as_secs(), "reconciler running");
        loop {
            ticker.tick().await;
            // Let partitions refresh their in-memory indexes first.
            let _ = self.actor.reconcile_tick().await;
            match self.reconcile_pending_trades().await {
                Ok(report) => {
                    if report.updates_sent > 0 || report.failures > 0 {
                        info!(
                            checked = report.checked,
                            updates = report.updates_sent,
                            failures = report.failures,
                            "reconciliation cycle completed"
                        );
                    }
                }
                Err(e) => warn!(error = %e, "reconciliation cycle failed"),
            }
        }
    }

    /// One reconciliation pass over every in-flight trade.
    pub async fn reconcile_pending_trades(&self) -> Result<ReconcileReport> {
        let pending = self.trades.list_by_status(&[
            TradeStatus::EntrySubmitted,
            TradeStatus::Pending,
            TradeStatus::Exiting,
        ])?;

        let mut report = ReconcileReport {
            timestamp: Utc::now().to_rfc3339(),
            ..ReconcileReport::default()
        };

        for trade in pending {
            report.checked += 1;
            match self.reconcile_one(&trade).await {
                Ok(true) => report.updates_sent += 1,
                Ok(false) => {}
                Err(e) => {
                    report.failures += 1;
                    warn!(trade_id = %trade.id, error = %e, "trade reconciliation failed");
                }
            }
        }
        Ok(report)
    }

    /// Returns whether a synthesized update was fed back into the actor.
    async fn reconcile_one(&self, trade: &Trade) -> Result<bool> {
        // EXITING trades reconcile their exit order, the rest their entry.
        let order_id = if trade.status == TradeStatus::Exiting {
            trade.exit_order_id.as_deref()
        } else {
            trade.broker_order_id.as_deref()
        };
        let Some(order_id) = order_id else {
            debug!(trade_id = %trade.id, "in-flight trade has no broker order id — skipped");
            return Ok(false);
        };

        let ub = self
            .user_brokers
            .get(trade.user_broker_id)?
            .ok_or_else(|| anyhow::anyhow!("unknown user broker {}", trade.user_broker_id))?;
        let session = self.user_brokers.session(ub.id)?;
        let adapter = self.factory.adapter_for(&ub, session.as_ref())?;

        let status = adapter.get_order_status(order_id).await?;
        debug!(
            trade_id = %trade.id,
            order_id,
            state = %status.state,
            filled = status.filled_qty,
            "broker order state fetched"
        );

        self.actor
            .submit_order_update(OrderUpdate {
                broker_order_id: Some(status.broker_order_id),
                client_order_tag: status.client_order_tag,
                state: status.state,
                filled_qty: status.filled_qty,
                avg_fill_price: status.avg_fill_price,
                reason: status.reason,
            })
            .await?;
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::mtf::TimeframeAnalysis;
    use crate::analysis::Confluence;
    use crate::broker::paper::PaperBroker;
    use crate::broker::BrokerAdapter;
    use crate::clock::SessionClock;
    use crate::events::EventLog;
    use crate::exit_rules::ExitQualification;
    use crate::store::config_store::ConfigStore;
    use crate::store::events::EventRepo;
    use crate::store::signals::Signal;
    use crate::store::trades::{ExitIntentRepo, IntentRepo, TradeIntent};
    use crate::store::user_brokers::UserBroker;
    use crate::store::Db;
    use crate::trade_actor::worker::WorkerDeps;
    use crate::types::{
        BrokerRole, ConfluenceStrength, ConnectionStatus, Direction, IntentStatus, OrderType,
        ProductType, SignalStatus, Timeframe,
    };
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn tf(timeframe: Timeframe) -> TimeframeAnalysis {
        TimeframeAnalysis {
            timeframe,
            candles: 50,
            tf_low: dec!(95),
            tf_high: dec!(110),
            range: dec!(15),
            max_drop: dec!(8),
            max_drop_pct: 0.08,
            num_zones: 13,
            current_zone: 1,
            in_buy_zone: true,
            buy_zone_score: 0.2,
            in_sell_zone: false,
            sell_zone_score: 1.0,
            drop_distribution: vec![1.0],
        }
    }

    #[tokio::test]
    async fn reconciler_heals_filled_entry_to_open() {
        let db = Arc::new(Db::open_in_memory().unwrap());
        let trades = TradeRepo::new(db.clone());
        let intents = IntentRepo::new(db.clone());
        let exits = ExitIntentRepo::new(db.clone());
        let user_brokers = UserBrokerRepo::new(db.clone());
        let config = ConfigStore::new(db.clone());
        let events = Arc::new(EventLog::new(EventRepo::new(db)).unwrap());
        let factory = Arc::new(AdapterFactory::new(true));

        let ub = UserBroker {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            broker_kind: "paper".to_string(),
            role: BrokerRole::Exec,
            credentials: serde_json::json!({}),
            active: true,
            connection_status: ConnectionStatus::Connected,
            session_expires_at: None,
            created_at: Utc::now(),
        };
        user_brokers.insert(&ub).unwrap();

        // Auto-fill stays ON: the status query reports FILLED, as a broker
        // would after a fill the engine never heard about.
        let paper = Arc::new(PaperBroker::new());
        paper.connect().await.unwrap();
        factory.register(ub.id, paper.clone());

        let deps = Arc::new(WorkerDeps {
            trades: trades.clone(),
            intents: intents.clone(),
            exits,
            user_brokers: user_brokers.clone(),
            factory: factory.clone(),
            events: events.clone(),
            config,
            exit_qual: ExitQualification::new(SessionClock::nse(), 5),
            broker_max_attempts: 3,
            broker_backoff_ms: 1,
        });
        let actor = TradeActor::spawn(2, deps);

        // Drive a trade to ENTRY_SUBMITTED through the actor.
        let now = Utc::now();
        let signal = Signal {
            id: Uuid::new_v4(),
            symbol: "RELIANCE".to_string(),
            direction: Direction::Buy,
            strength: ConfluenceStrength::Strong,
            price: dec!(500),
            confluence: Confluence {
                direction: Direction::Buy,
                score: 0.3,
                strength: ConfluenceStrength::Strong,
                htf: tf(Timeframe::M125),
                itf: tf(Timeframe::M25),
                ltf: tf(Timeframe::M1),
            },
            status: SignalStatus::Active,
            created_at: now,
            expires_at: now + chrono::Duration::minutes(15),
        };
        let intent = TradeIntent {
            id: Uuid::new_v4(),
            signal_id: signal.id,
            user_broker_id: ub.id,
            user_id: ub.user_id,
            symbol: "RELIANCE".to_string(),
            direction: Direction::Buy,
            validation_passed: true,
            errors: Vec::new(),
            quantity: 10,
            limit_price: Some(dec!(500.50)),
            order_type: OrderType::Limit,
            product_type: ProductType::Delivery,
            log_impact: -0.002,
            exposure_after: dec!(5005),
            status: IntentStatus::Approved,
            created_at: now,
        };
        intents.insert(&intent).unwrap();
        actor.submit_intent(intent.clone(), signal).await.unwrap();
        actor.flush().await.unwrap();

        let stuck = trades.find_by_intent_id(intent.id).unwrap().unwrap();
        assert_eq!(stuck.status, TradeStatus::EntrySubmitted);

        // The reconciler queries the broker and feeds the fill back in.
        let reconciler = Reconciler::new(trades.clone(), user_brokers, factory, actor.clone());
        let report = reconciler.reconcile_pending_trades().await.unwrap();
        assert_eq!(report.checked, 1);
        assert_eq!(report.updates_sent, 1);
        actor.flush().await.unwrap();

        let healed = trades.find_by_id(stuck.id).unwrap().unwrap();
        assert_eq!(healed.status, TradeStatus::Open);
        // The broker's average price became the entry price.
        assert_eq!(healed.entry_price, Some(dec!(500.50)));
    }
}
