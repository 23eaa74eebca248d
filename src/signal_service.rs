// =============================================================================
// Signal Service — confluence evaluation, publication, fan-out, expiry
// =============================================================================
//
// Runs off closed candles: every 1-minute close re-evaluates the symbol's
// multi-timeframe confluence at the latest price. A signal is emitted when
// the confluence strength meets the configured minimum AND every timeframe
// sits inside the zone for the direction, with at most one ACTIVE signal
// per (symbol, direction).
//
// Publication is persist-then-event-then-fan-out: the signal row lands
// first, the GLOBAL event follows, then one delivery row per active EXEC
// user-broker. Expiry and stale-marking cascade to unconsumed deliveries.
// =============================================================================

use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, Utc};
use serde_json::json;
use tokio::sync::Notify;
use tracing::{debug, info};
use uuid::Uuid;

use crate::analysis::{analyze_timeframe, Confluence};
use crate::events::{topic, Correlation, EventDraft, EventLog};
use crate::market_data::price_cache::PriceCache;
use crate::market_data::Candle;
use crate::store::candles::CandleRepo;
use crate::store::config_store::ConfigStore;
use crate::store::signals::{DeliveryRegistry, Signal, SignalRepo};
use crate::store::user_brokers::UserBrokerRepo;
use crate::types::{Direction, SignalStatus, Timeframe};

pub struct SignalService {
    signals: SignalRepo,
    deliveries: DeliveryRegistry,
    user_brokers: UserBrokerRepo,
    candles: CandleRepo,
    config: ConfigStore,
    price_cache: Arc<PriceCache>,
    events: Arc<EventLog>,
    /// Wakes the orchestrator when new deliveries exist.
    orchestrator_nudge: Arc<Notify>,
    ttl_secs: i64,
}

impl SignalService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        signals: SignalRepo,
        deliveries: DeliveryRegistry,
        user_brokers: UserBrokerRepo,
        candles: CandleRepo,
        config: ConfigStore,
        price_cache: Arc<PriceCache>,
        events: Arc<EventLog>,
        orchestrator_nudge: Arc<Notify>,
        ttl_secs: i64,
    ) -> Self {
        Self {
            signals,
            deliveries,
            user_brokers,
            candles,
            config,
            price_cache,
            events,
            orchestrator_nudge,
            ttl_secs,
        }
    }

    // -------------------------------------------------------------------------
    // Emission
    // -------------------------------------------------------------------------

    /// Re-evaluate a symbol after a candle close. Only 1-minute closes
    /// trigger evaluation (higher timeframes close together with one).
    pub fn on_candle_closed(&self, candle: &Candle) -> Result<Option<Signal>> {
        if candle.timeframe != Timeframe::M1 {
            return Ok(None);
        }
        self.evaluate_symbol(&candle.symbol)
    }

    /// Evaluate confluence for a symbol at the latest price and emit a
    /// signal when it qualifies.
    pub fn evaluate_symbol(&self, symbol: &str) -> Result<Option<Signal>> {
        let cfg = self.config.resolve(symbol, None)?;
        let Some(price) = self.price_cache.ltp(symbol) else {
            return Ok(None);
        };

        let ltf_candles = self.candles.recent_closed(symbol, Timeframe::M1, cfg.ltf_depth)?;
        let itf_candles = self.candles.recent_closed(symbol, Timeframe::M25, cfg.itf_depth)?;
        let htf_candles = self.candles.recent_closed(symbol, Timeframe::M125, cfg.htf_depth)?;

        let (Some(ltf), Some(itf), Some(htf)) = (
            analyze_timeframe(Timeframe::M1, &ltf_candles, price),
            analyze_timeframe(Timeframe::M25, &itf_candles, price),
            analyze_timeframe(Timeframe::M125, &htf_candles, price),
        ) else {
            debug!(symbol, "signal evaluation skipped: thin candle history");
            return Ok(None);
        };

        for direction in [Direction::Buy, Direction::Sell] {
            let confluence =
                Confluence::evaluate(direction, htf.clone(), itf.clone(), ltf.clone(), &cfg);

            if confluence.strength < cfg.min_strength || !confluence.all_in_zone() {
                continue;
            }
            if self.signals.has_active(symbol, direction)? {
                debug!(symbol, direction = %direction, "active signal exists — not re-emitting");
                continue;
            }
            return self.publish(symbol, direction, price, confluence).map(Some);
        }
        Ok(None)
    }

    fn publish(
        &self,
        symbol: &str,
        direction: Direction,
        price: rust_decimal::Decimal,
        confluence: Confluence,
    ) -> Result<Signal> {
        let now = Utc::now();
        let signal = Signal {
            id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            direction,
            strength: confluence.strength,
            price,
            confluence,
            status: SignalStatus::Active,
            created_at: now,
            expires_at: now + Duration::seconds(self.ttl_secs),
        };

        // Persist before the event, event before the fan-out.
        self.signals.insert(&signal)?;
        self.events.append(
            EventDraft::global(
                topic::SIGNAL_PUBLISHED,
                json!({
                    "symbol": signal.symbol,
                    "direction": signal.direction.as_str(),
                    "strength": signal.strength.as_str(),
                    "price": signal.price.to_string(),
                    "score": signal.confluence.score,
                }),
            )
            .correlate(Correlation {
                signal_id: Some(signal.id),
                ..Correlation::default()
            }),
        )?;

        let audience: Vec<_> = self.user_brokers.active_exec()?;
        let ids: Vec<Uuid> = audience.iter().map(|ub| ub.id).collect();
        let created = self.deliveries.create_for_signal(signal.id, &ids, now)?;
        for delivery in &created {
            let Some(ub) = audience.iter().find(|u| u.id == delivery.user_broker_id) else {
                continue;
            };
            self.events.append(
                EventDraft::user_broker(
                    topic::DELIVERY_CREATED,
                    ub.user_id,
                    ub.id,
                    json!({"symbol": signal.symbol}),
                )
                .correlate(Correlation {
                    signal_id: Some(signal.id),
                    ..Correlation::default()
                }),
            )?;
        }

        info!(
            signal_id = %signal.id,
            symbol,
            direction = %direction,
            strength = %signal.strength,
            deliveries = created.len(),
            "signal published"
        );
        self.orchestrator_nudge.notify_one();
        Ok(signal)
    }

    // -------------------------------------------------------------------------
    // Expiry, stale-marking, cancellation
    // -------------------------------------------------------------------------

    /// TTL pass: expire elapsed ACTIVE signals and their open deliveries.
    pub fn expire_cycle(&self) -> Result<usize> {
        let now = Utc::now();
        let expired = self.signals.expire_due(now)?;
        for signal_id in &expired {
            self.deliveries.expire_for_signal(*signal_id, now)?;
            self.events.append(
                EventDraft::global(topic::SIGNAL_EXPIRED, json!({}))
                    .correlate(Correlation {
                        signal_id: Some(*signal_id),
                        ..Correlation::default()
                    }),
            )?;
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "signals expired");
        }
        Ok(expired.len())
    }

    /// Config-change hook: mark dependent ACTIVE signals STALE (scoped to a
    /// symbol when given) unless a trade already references them, and
    /// expire their open deliveries.
    pub fn on_config_updated(&self, symbol: Option<&str>) -> Result<usize> {
        let now = Utc::now();
        let stale = self.signals.mark_stale(symbol)?;
        for signal_id in &stale {
            self.deliveries.expire_for_signal(*signal_id, now)?;
            self.events.append(
                EventDraft::global(
                    topic::SIGNAL_STALE,
                    json!({"symbol": symbol}),
                )
                .correlate(Correlation {
                    signal_id: Some(*signal_id),
                    ..Correlation::default()
                }),
            )?;
        }
        if !stale.is_empty() {
            info!(count = stale.len(), symbol = symbol.unwrap_or("*"), "signals marked stale");
        }
        Ok(stale.len())
    }

    /// Operator cancellation of a single ACTIVE signal.
    pub fn cancel(&self, signal_id: Uuid) -> Result<bool> {
        let cancelled = self.signals.set_status(signal_id, SignalStatus::Cancelled)?;
        if cancelled {
            self.deliveries.expire_for_signal(signal_id, Utc::now())?;
        }
        Ok(cancelled)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
