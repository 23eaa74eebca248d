// =============================================================================
// Execution Orchestrator — parallel delivery validation, two-phase consume
// =============================================================================
//
// Pulls CREATED/DELIVERED rows (periodically and when nudged by the signal
// service) and dispatches them to a bounded worker pool. Per delivery the
// steps are strictly ordered:
//
//   load signal + user-broker → load user context → validate → persist the
//   intent → consume the delivery → forward approved intents to the actor.
//
// The intent is persisted BEFORE the consume: if the consume loses a race
// the extra intent stays unreferenced and harmless, while a consume-first
// ordering could mark the delivery consumed and then fail to record why.
// Ordering between deliveries is unspecified.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::json;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::AdapterFactory;
use crate::events::{topic, Correlation, EventDraft, EventLog};
use crate::market_data::price_cache::PriceCache;
use crate::store::config_store::ConfigStore;
use crate::store::signals::{Delivery, DeliveryRegistry, SignalRepo};
use crate::store::trades::{IntentRepo, TradeIntent};
use crate::store::user_brokers::{UserBroker, UserBrokerRepo};
use crate::trade_actor::TradeActor;
use crate::types::{IntentStatus, SignalStatus};
use crate::validation::{UserContext, UserContextProvider, ValidationService};

/// How many deliveries one pass pulls.
const BATCH_SIZE: usize = 128;

pub struct Orchestrator {
    deliveries: DeliveryRegistry,
    signals: SignalRepo,
    intents: IntentRepo,
    user_brokers: UserBrokerRepo,
    validation: ValidationService,
    config: ConfigStore,
    price_cache: Arc<PriceCache>,
    provider: Arc<dyn UserContextProvider>,
    actor: Arc<TradeActor>,
    events: Arc<EventLog>,
    pool: Arc<Semaphore>,
    nudge: Arc<Notify>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        deliveries: DeliveryRegistry,
        signals: SignalRepo,
        intents: IntentRepo,
        user_brokers: UserBrokerRepo,
        validation: ValidationService,
        config: ConfigStore,
        price_cache: Arc<PriceCache>,
        provider: Arc<dyn UserContextProvider>,
        actor: Arc<TradeActor>,
        events: Arc<EventLog>,
        workers: usize,
        nudge: Arc<Notify>,
    ) -> Arc<Self> {
        let workers = if workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            workers
        };
        Arc::new(Self {
            deliveries,
            signals,
            intents,
            user_brokers,
            validation,
            config,
            price_cache,
            provider,
            actor,
            events,
            pool: Arc::new(Semaphore::new(workers)),
            nudge,
        })
    }

    /// Periodic + on-publish processing loop. Runs until the task is
    /// aborted at shutdown.
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(2));
        info!("orchestrator running");
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.nudge.notified() => {}
            }
            if let Err(e) = self.clone().process_pending().await {
                warn!(error = %e, "orchestrator pass failed");
            }
        }
    }

    /// One pass over the pending deliveries. Returns how many were handled.
    pub async fn process_pending(self: Arc<Self>) -> Result<usize> {
        let pending = self.deliveries.pending(BATCH_SIZE)?;
        if pending.is_empty() {
            return Ok(0);
        }
        debug!(count = pending.len(), "processing pending deliveries");

        let mut handles = Vec::with_capacity(pending.len());
        for delivery in pending {
            let permit = self
                .pool
                .clone()
                .acquire_owned()
                .await
                .context("orchestrator pool closed")?;
            let this = self.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                let delivery_id = delivery.id;
                if let Err(e) = this.process_delivery(delivery).await {
                    warn!(%delivery_id, error = %e, "delivery processing failed");
                }
            }));
        }
        let count = handles.len();
        for handle in handles {
            let _ = handle.await;
        }
        Ok(count)
    }

    /// Steps 1–6 of the per-delivery pipeline, strictly ordered.
    pub async fn process_delivery(&self, delivery: Delivery) -> Result<()> {
        let now = Utc::now();

        // 1. Load the signal and the user-broker; either missing rejects
        // the delivery.
        let Some(signal) = self.signals.get(delivery.signal_id)? else {
            self.deliveries.mark_rejected(delivery.id, now)?;
            return Ok(());
        };
        let Some(user_broker) = self.user_brokers.get(delivery.user_broker_id)? else {
            self.deliveries.mark_rejected(delivery.id, now)?;
            return Ok(());
        };
        if signal.status != SignalStatus::Active || signal.expires_at <= now {
            self.deliveries.mark_expired(delivery.id, now)?;
            return Ok(());
        }

        self.deliveries.mark_delivered(delivery.id, now).ok();

        // 2. User context via the provider supplied at construction.
        let ctx = self.provider.load(&user_broker).await?;

        // 3. Validate.
        let cfg = self
            .config
            .resolve(&signal.symbol, Some(user_broker.id))?;
        let price = self
            .price_cache
            .ltp(&signal.symbol)
            .unwrap_or(signal.price);
        let decision = self
            .validation
            .validate_entry(&signal, &user_broker, &ctx, &cfg, price, now)?;

        // 4. Persist the intent (natural-key duplicates return the
        // existing row — treated as success).
        let intent = TradeIntent {
            id: Uuid::new_v4(),
            signal_id: signal.id,
            user_broker_id: user_broker.id,
            user_id: user_broker.user_id,
            symbol: signal.symbol.clone(),
            direction: signal.direction,
            validation_passed: decision.passed,
            errors: decision.errors.clone(),
            quantity: decision.quantity,
            limit_price: decision.limit_price,
            order_type: decision.order_type,
            product_type: decision.product_type,
            log_impact: decision.log_impact,
            exposure_after: decision.exposure_after,
            status: if decision.passed {
                IntentStatus::Approved
            } else {
                IntentStatus::Rejected
            },
            created_at: now,
        };
        let stored = self.intents.insert(&intent)?;

        // 5. Atomic consume. Losing the race means another orchestrator
        // already handled this delivery — log and stop.
        if !self.deliveries.consume(delivery.id, stored.id, now)? {
            debug!(
                delivery_id = %delivery.id,
                "delivery already consumed — skipping"
            );
            return Ok(());
        }

        let correlation = Correlation {
            signal_id: Some(signal.id),
            intent_id: Some(stored.id),
            trade_id: None,
            order_id: None,
        };
        if stored.validation_passed {
            self.events.append(
                EventDraft::user_broker(
                    topic::INTENT_APPROVED,
                    user_broker.user_id,
                    user_broker.id,
                    json!({
                        "symbol": stored.symbol,
                        "quantity": stored.quantity,
                        "orderType": stored.order_type.as_str(),
                        "limitPrice": stored.limit_price.map(|p| p.to_string()),
                    }),
                )
                .correlate(correlation),
            )?;
            // 6. Forward to the trade actor.
            self.actor.submit_intent(stored, signal).await?;
        } else {
            self.events.append(
                EventDraft::user_broker(
                    topic::INTENT_REJECTED,
                    user_broker.user_id,
                    user_broker.id,
                    json!({
                        "symbol": stored.symbol,
                        "errors": stored.errors,
                    }),
                )
                .correlate(correlation),
            )?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Broker-funds context provider
// ---------------------------------------------------------------------------

/// Loads user context from broker funds, with engine-level defaults for the
/// risk preferences. A portfolio service would replace this wholesale.
pub struct BrokerFundsProvider {
    factory: Arc<AdapterFactory>,
    pub kelly_fraction: Decimal,
    pub max_position_log_loss: f64,
    pub max_portfolio_log_loss: f64,
    pub exposure_fraction: Decimal,
}

impl BrokerFundsProvider {
    pub fn new(factory: Arc<AdapterFactory>) -> Self {
        Self {
            factory,
            kelly_fraction: Decimal::new(2, 1), // 0.2
            max_position_log_loss: 0.05,
            max_portfolio_log_loss: 0.15,
            exposure_fraction: Decimal::new(5, 1), // 0.5
        }
    }
}

#[async_trait::async_trait]
impl UserContextProvider for BrokerFundsProvider {
    async fn load(&self, user_broker: &UserBroker) -> Result<UserContext> {
        let adapter = self
            .factory
            .cached(user_broker.id)
            .context("no adapter for user broker")?;
        let funds = adapter.get_funds().await?;
        let total = funds.available + funds.utilized;

        Ok(UserContext {
            user_id: user_broker.user_id,
            total_capital: total,
            available_capital: funds.available,
            current_exposure: funds.utilized,
            portfolio_frozen: false,
            allowed_symbols: None,
            kelly_fraction: self.kelly_fraction,
            lot_sizes: Default::default(),
            max_position_log_loss: self.max_position_log_loss,
            max_portfolio_log_loss: self.max_portfolio_log_loss,
            max_exposure: total * self.exposure_fraction,
        })
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
    use crate::exit_rules::ExitQualification;
    use crate::store::events::EventRepo;
    use crate::store::signals::Signal;
    use crate::store::trades::{ExitIntentRepo, TradeRepo};
    use crate::store::Db;
    use crate::trade_actor::worker::WorkerDeps;
    use crate::types::{
        BrokerRole, ConfluenceStrength, ConnectionStatus, DeliveryStatus, Direction, Timeframe,
        TradeStatus,
    };
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    struct StaticProvider;

    #[async_trait::async_trait]
    impl UserContextProvider for StaticProvider {
        async fn load(&self, user_broker: &UserBroker) -> Result<UserContext> {
            Ok(UserContext {
                user_id: user_broker.user_id,
                total_capital: dec!(100000),
                available_capital: dec!(100000),
                current_exposure: Decimal::ZERO,
                portfolio_frozen: false,
                allowed_symbols: None,
                kelly_fraction: dec!(0.2),
                lot_sizes: HashMap::new(),
                max_position_log_loss: 0.05,
                max_portfolio_log_loss: 0.15,
                max_exposure: dec!(50000),
            })
        }
    }

    struct Fixture {
        orchestrator: Arc<Orchestrator>,
        signals: SignalRepo,
        deliveries: DeliveryRegistry,
        trades: TradeRepo,
        intents: IntentRepo,
        user_brokers: UserBrokerRepo,
        actor: Arc<TradeActor>,
        ub: UserBroker,
    }

    async fn fixture() -> Fixture {
        let db = Arc::new(Db::open_in_memory().unwrap());
        let signals = SignalRepo::new(db.clone());
        let deliveries = DeliveryRegistry::new(db.clone());
        let trades = TradeRepo::new(db.clone());
        let intents = IntentRepo::new(db.clone());
        let exits = ExitIntentRepo::new(db.clone());
        let user_brokers = UserBrokerRepo::new(db.clone());
        let config = ConfigStore::new(db.clone());
        let price_cache = Arc::new(PriceCache::new());
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

        let paper = Arc::new(PaperBroker::new());
        paper.connect().await.unwrap();
        paper.hold_fills();
        factory.register(ub.id, paper.clone());

        let deps = Arc::new(WorkerDeps {
            trades: trades.clone(),
            intents: intents.clone(),
            exits,
            user_brokers: user_brokers.clone(),
            factory,
            events: events.clone(),
            config: config.clone(),
            exit_qual: ExitQualification::new(SessionClock::nse(), 5),
            broker_max_attempts: 3,
            broker_backoff_ms: 1,
        });
        let actor = TradeActor::spawn(4, deps);

        let orchestrator = Orchestrator::new(
            deliveries.clone(),
            signals.clone(),
            intents.clone(),
            user_brokers.clone(),
            ValidationService::new(trades.clone()),
            config,
            price_cache,
            Arc::new(StaticProvider),
            actor.clone(),
            events,
            4,
            Arc::new(Notify::new()),
        );

        Fixture {
            orchestrator,
            signals,
            deliveries,
            trades,
            intents,
            user_brokers,
            actor,
            ub,
        }
    }

    fn tf(timeframe: Timeframe) -> TimeframeAnalysis {
        TimeframeAnalysis {
            timeframe,
            candles: 50,
            tf_low: dec!(480),
            tf_high: dec!(540),
            range: dec!(60),
            max_drop: dec!(30),
            max_drop_pct: 0.06,
            num_zones: 17,
            current_zone: 1,
            in_buy_zone: true,
            buy_zone_score: 0.2,
            in_sell_zone: false,
            sell_zone_score: 1.0,
            drop_distribution: vec![1.0],
        }
    }

    fn active_signal(symbol: &str) -> Signal {
        let now = Utc::now();
        Signal {
            id: Uuid::new_v4(),
            symbol: symbol.to_string(),
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
        }
    }

    #[tokio::test]
    async fn approved_delivery_becomes_a_trade() {
        let f = fixture().await;
        let signal = active_signal("RELIANCE");
        f.signals.insert(&signal).unwrap();
        let delivery = f
            .deliveries
            .create_for_signal(signal.id, &[f.ub.id], Utc::now())
            .unwrap()
            .remove(0);

        f.orchestrator.clone().process_pending().await.unwrap();
        f.actor.flush().await.unwrap();

        let stored = f.deliveries.get(delivery.id).unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Consumed);
        let intent_id = stored.intent_id.unwrap();

        let intent = f.intents.get(intent_id).unwrap().unwrap();
        assert!(intent.validation_passed);
        // 0.2 * 1.0 * 100_000 / 500 = 40 shares.
        assert_eq!(intent.quantity, 40);

        let trade = f.trades.find_by_intent_id(intent_id).unwrap().unwrap();
        assert_eq!(trade.status, TradeStatus::EntrySubmitted);
    }

    #[tokio::test]
    async fn concurrent_processing_consumes_exactly_once() {
        let f = fixture().await;
        let signal = active_signal("TCS");
        f.signals.insert(&signal).unwrap();
        let delivery = f
            .deliveries
            .create_for_signal(signal.id, &[f.ub.id], Utc::now())
            .unwrap()
            .remove(0);

        // Two orchestrator passes race over the same delivery.
        let a = {
            let orch = f.orchestrator.clone();
            let d = delivery.clone();
            tokio::spawn(async move { orch.process_delivery(d).await })
        };
        let b = {
            let orch = f.orchestrator.clone();
            let d = delivery.clone();
            tokio::spawn(async move { orch.process_delivery(d).await })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();
        f.actor.flush().await.unwrap();

        let stored = f.deliveries.get(delivery.id).unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Consumed);

        // Exactly one approved trade exists for the (signal, user-broker).
        let intent = f
            .intents
            .find_by_natural_key(signal.id, f.ub.id)
            .unwrap()
            .unwrap();
        let trade = f.trades.find_by_intent_id(stored.intent_id.unwrap()).unwrap();
        assert!(trade.is_some());
        assert_eq!(stored.intent_id, Some(intent.id));
    }

    #[tokio::test]
    async fn missing_signal_rejects_delivery() {
        let f = fixture().await;
        let ghost = active_signal("INFY");
        // Delivery exists but the signal row was never written.
        let delivery = f
            .deliveries
            .create_for_signal(ghost.id, &[f.ub.id], Utc::now())
            .unwrap()
            .remove(0);

        f.orchestrator.clone().process_pending().await.unwrap();

        let stored = f.deliveries.get(delivery.id).unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Rejected);
        assert!(stored.intent_id.is_none());
    }

    #[tokio::test]
    async fn expired_signal_expires_delivery() {
        let f = fixture().await;
        let mut signal = active_signal("SBIN");
        signal.expires_at = Utc::now() - chrono::Duration::minutes(1);
        f.signals.insert(&signal).unwrap();
        let delivery = f
            .deliveries
            .create_for_signal(signal.id, &[f.ub.id], Utc::now())
            .unwrap()
            .remove(0);

        f.orchestrator.clone().process_pending().await.unwrap();
        let stored = f.deliveries.get(delivery.id).unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Expired);
    }

    #[tokio::test]
    async fn failed_validation_persists_rejected_intent_and_consumes() {
        let f = fixture().await;
        // Disconnect the broker binding so validation fails.
        f.user_brokers
            .set_connection_status(f.ub.id, ConnectionStatus::Disconnected)
            .unwrap();

        let signal = active_signal("HDFCBANK");
        f.signals.insert(&signal).unwrap();
        let delivery = f
            .deliveries
            .create_for_signal(signal.id, &[f.ub.id], Utc::now())
            .unwrap()
            .remove(0);

        f.orchestrator.clone().process_pending().await.unwrap();
        f.actor.flush().await.unwrap();

        let stored = f.deliveries.get(delivery.id).unwrap().unwrap();
        // Validation failure still consumes the delivery (the decision is
        // recorded; the signal is spent for this user-broker).
        assert_eq!(stored.status, DeliveryStatus::Consumed);

        let intent = f.intents.get(stored.intent_id.unwrap()).unwrap().unwrap();
        assert!(!intent.validation_passed);
        assert_eq!(intent.status, IntentStatus::Rejected);
        // No trade was created.
        assert!(f.trades.find_by_intent_id(intent.id).unwrap().is_none());
    }
}
