// =============================================================================
// Meridian Trade Engine — Main Entry Point
// =============================================================================
//
// Initialization is leaves-first: store → adapters → trade actor →
// orchestrator → signal service → market-data ingress. The engine starts in
// paper mode unless the config says otherwise; real brokers require stored
// sessions before they connect.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod analysis;
mod api;
mod broker;
mod clock;
mod config;
mod events;
mod exit_rules;
mod market_data;
mod orchestrator;
mod reconcile;
mod signal_service;
mod store;
mod trade_actor;
mod types;
mod validation;
mod watchdog;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::{Decimal, RoundingStrategy};
use tokio::sync::{mpsc, Notify};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::broker::paper::PaperBroker;
use crate::broker::{AdapterFactory, BrokerAdapter};
use crate::clock::SessionClock;
use crate::config::EngineConfig;
use crate::events::EventLog;
use crate::exit_rules::ExitQualification;
use crate::market_data::aggregator::CandleAggregator;
use crate::market_data::price_cache::PriceCache;
use crate::orchestrator::{BrokerFundsProvider, Orchestrator};
use crate::reconcile::Reconciler;
use crate::signal_service::SignalService;
use crate::store::candles::CandleRepo;
use crate::store::config_store::ConfigStore;
use crate::store::events::EventRepo;
use crate::store::signals::{DeliveryRegistry, SignalRepo};
use crate::store::trades::{ExitIntentRepo, IntentRepo, TradeRepo};
use crate::store::user_brokers::{UserBroker, UserBrokerRepo};
use crate::store::Db;
use crate::trade_actor::worker::WorkerDeps;
use crate::trade_actor::TradeActor;
use crate::types::{AlertSeverity, BrokerRole, ConnectionStatus, Tick};
use crate::validation::ValidationService;
use crate::watchdog::TokenWatchdog;

/// Tick intake queue between the data broker and the aggregator. Overflow
/// drops the newest tick; the price cache is last-writer-wins anyway.
const TICK_QUEUE_DEPTH: usize = 4096;

/// Demo watchlist used to seed an empty paper-mode database.
const DEMO_SYMBOLS: &[&str] = &["RELIANCE", "TCS", "INFY", "HDFCBANK", "SBIN"];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║            Meridian Trade Engine — Starting Up           ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config_path =
        std::env::var("MERIDIAN_CONFIG").unwrap_or_else(|_| "engine_config.json".into());
    let engine_config = EngineConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load engine config, using defaults");
        EngineConfig::default()
    });
    info!(
        partitions = engine_config.partitions,
        paper_mode = engine_config.paper_mode,
        db = %engine_config.db_path,
        "engine configured"
    );

    // ── 2. Store & repositories (leaves first) ───────────────────────────
    let db = Arc::new(Db::open(&engine_config.db_path)?);
    let candle_repo = CandleRepo::new(db.clone());
    let signal_repo = SignalRepo::new(db.clone());
    let delivery_registry = DeliveryRegistry::new(db.clone());
    let trade_repo = TradeRepo::new(db.clone());
    let intent_repo = IntentRepo::new(db.clone());
    let exit_repo = ExitIntentRepo::new(db.clone());
    let user_broker_repo = UserBrokerRepo::new(db.clone());
    let config_store = ConfigStore::new(db.clone());
    let events = Arc::new(EventLog::new(EventRepo::new(db.clone()))?);

    let clock = SessionClock::nse();
    let price_cache = Arc::new(PriceCache::new());
    let aggregator = Arc::new(CandleAggregator::new(clock.clone()));

    // ── 3. Broker adapters ───────────────────────────────────────────────
    let factory = Arc::new(AdapterFactory::new(engine_config.paper_mode));

    if engine_config.paper_mode {
        seed_demo_bindings(&user_broker_repo)?;
    }

    let mut bindings = user_broker_repo.active_exec()?;
    if let Some(data) = user_broker_repo.data_broker()? {
        bindings.push(data);
    }
    let mut paper_adapters: Vec<Arc<PaperBroker>> = Vec::new();
    for ub in &bindings {
        let adapter: Arc<dyn BrokerAdapter> = if engine_config.paper_mode {
            let paper = Arc::new(PaperBroker::new());
            factory.register(ub.id, paper.clone());
            paper_adapters.push(paper.clone());
            paper
        } else {
            let session = user_broker_repo.session(ub.id)?;
            match factory.adapter_for(ub, session.as_ref()) {
                Ok(adapter) => adapter,
                Err(e) => {
                    warn!(user_broker_id = %ub.id, error = %e, "adapter construction failed");
                    continue;
                }
            }
        };
        match adapter.connect().await {
            Ok(_) => {
                user_broker_repo.set_connection_status(ub.id, ConnectionStatus::Connected)?;
                info!(user_broker_id = %ub.id, kind = adapter.kind(), "broker connected");
            }
            Err(e) => {
                user_broker_repo.set_connection_status(ub.id, ConnectionStatus::Disconnected)?;
                warn!(user_broker_id = %ub.id, error = %e, "broker connect failed");
            }
        }
    }

    // ── 4. Trade actor ───────────────────────────────────────────────────
    let deps = Arc::new(WorkerDeps {
        trades: trade_repo.clone(),
        intents: intent_repo.clone(),
        exits: exit_repo.clone(),
        user_brokers: user_broker_repo.clone(),
        factory: factory.clone(),
        events: events.clone(),
        config: config_store.clone(),
        exit_qual: ExitQualification::new(clock.clone(), engine_config.closing_window_mins),
        broker_max_attempts: engine_config.broker_max_attempts,
        broker_backoff_ms: engine_config.broker_backoff_ms,
    });
    let actor = TradeActor::spawn(engine_config.partitions, deps);

    // ── 5. Orchestrator ──────────────────────────────────────────────────
    let nudge = Arc::new(Notify::new());
    let orchestrator = Orchestrator::new(
        delivery_registry.clone(),
        signal_repo.clone(),
        intent_repo.clone(),
        user_broker_repo.clone(),
        ValidationService::new(trade_repo.clone()),
        config_store.clone(),
        price_cache.clone(),
        Arc::new(BrokerFundsProvider::new(factory.clone())),
        actor.clone(),
        events.clone(),
        engine_config.orchestrator_workers,
        nudge.clone(),
    );
    tokio::spawn(orchestrator.clone().run());

    // ── 6. Signal service ────────────────────────────────────────────────
    let signal_service = Arc::new(SignalService::new(
        signal_repo.clone(),
        delivery_registry.clone(),
        user_broker_repo.clone(),
        candle_repo.clone(),
        config_store.clone(),
        price_cache.clone(),
        events.clone(),
        nudge.clone(),
        engine_config.signal_ttl_secs,
    ));

    // Signal TTL sweeper.
    {
        let service = signal_service.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(30));
            loop {
                ticker.tick().await;
                if let Err(e) = service.expire_cycle() {
                    warn!(error = %e, "signal expiry cycle failed");
                }
            }
        });
    }

    // ── 7. Market data ingress ───────────────────────────────────────────
    let (tick_tx, tick_rx) = mpsc::channel::<Tick>(TICK_QUEUE_DEPTH);

    let symbols = {
        let selected = user_broker_repo.active_symbols()?;
        if selected.is_empty() {
            DEMO_SYMBOLS.iter().map(|s| s.to_string()).collect()
        } else {
            selected
        }
    };
    info!(symbols = ?symbols, "watchlist resolved");

    if engine_config.paper_mode {
        tokio::spawn(run_demo_feed(
            symbols.clone(),
            paper_adapters,
            tick_tx.clone(),
        ));
    } else if let Some(data_ub) = user_broker_repo.data_broker()? {
        let repo = user_broker_repo.clone();
        let factory_for_feed = factory.clone();
        let feed_symbols = symbols.clone();
        let tx = tick_tx.clone();
        tokio::spawn(async move {
            loop {
                let result = async {
                    let session = repo.session(data_ub.id)?;
                    let adapter = factory_for_feed.adapter_for(&data_ub, session.as_ref())?;
                    adapter.subscribe_ticks(&feed_symbols, tx.clone()).await?;
                    anyhow::Ok(())
                }
                .await;
                if let Err(e) = result {
                    error!(error = %e, "tick stream error — reconnecting in 5s");
                }
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        });
    } else {
        warn!("no DATA broker configured — engine runs without market data");
    }

    // The ingress pump: cache → aggregator → candle repo → signal service,
    // and a price broadcast to the trade actor.
    {
        let price_cache = price_cache.clone();
        let aggregator = aggregator.clone();
        let candle_repo = candle_repo.clone();
        let signal_service = signal_service.clone();
        let actor = actor.clone();
        let events_for_ingress = events.clone();
        tokio::spawn(async move {
            run_tick_ingress(
                tick_rx,
                price_cache,
                aggregator,
                candle_repo,
                signal_service,
                actor,
                events_for_ingress,
            )
            .await;
        });
    }

    // Close stalled candle buckets when ticks pause mid-session.
    {
        let aggregator = aggregator.clone();
        let candle_repo = candle_repo.clone();
        let signal_service = signal_service.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(15));
            loop {
                ticker.tick().await;
                for candle in aggregator.flush_expired(Utc::now()) {
                    if let Err(e) = candle_repo.upsert(&candle) {
                        error!(error = %e, "failed to persist flushed candle");
                        continue;
                    }
                    if let Err(e) = signal_service.on_candle_closed(&candle) {
                        warn!(error = %e, "signal evaluation failed");
                    }
                }
            }
        });
    }

    // ── 8. Reconciler ────────────────────────────────────────────────────
    let reconciler = Arc::new(Reconciler::new(
        trade_repo.clone(),
        user_broker_repo.clone(),
        factory.clone(),
        actor.clone(),
    ));
    tokio::spawn(
        reconciler
            .clone()
            .run(Duration::from_secs(engine_config.reconcile_interval_secs)),
    );

    // ── 9. Token watchdog ────────────────────────────────────────────────
    let watchdog = Arc::new(TokenWatchdog::new(
        user_broker_repo.clone(),
        factory.clone(),
        events.clone(),
        Duration::from_secs(engine_config.watchdog_interval_secs),
    ));
    tokio::spawn(watchdog.clone().run());

    // ── 10. API server (admin + event stream) ────────────────────────────
    let app = api::admin::router(Arc::new(api::admin::AdminState {
        config: config_store.clone(),
        signal_service: signal_service.clone(),
        events: events.clone(),
        aggregator: aggregator.clone(),
        price_cache: price_cache.clone(),
        user_brokers: user_broker_repo.clone(),
        trades: trade_repo.clone(),
        actor: actor.clone(),
        started_at: std::time::Instant::now(),
    }))
    .merge(api::ws::router(Arc::new(api::ws::WsState {
        events: events.clone(),
    })));
    let bind_addr = engine_config.bind_addr.clone();
    tokio::spawn(async move {
        match tokio::net::TcpListener::bind(&bind_addr).await {
            Ok(listener) => {
                info!(addr = %bind_addr, "API server listening");
                if let Err(e) = axum::serve(listener, app).await {
                    error!(error = %e, "API server failed");
                }
            }
            Err(e) => error!(addr = %bind_addr, error = %e, "failed to bind API server"),
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 11. Graceful shutdown ────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — draining");

    // Persist any open candle state before the actor drains.
    for candle in aggregator.flush_all() {
        if let Err(e) = candle_repo.upsert(&candle) {
            error!(error = %e, "failed to persist candle during shutdown");
        }
    }

    actor.shutdown(Duration::from_secs(10)).await;
    factory.disconnect_all(Duration::from_secs(5)).await;

    events.alert(AlertSeverity::Info, "ENGINE_STOPPED", "clean shutdown");
    info!("Meridian Trade Engine shut down complete.");
    Ok(())
}

// ---------------------------------------------------------------------------
// Ingress pump
// ---------------------------------------------------------------------------

/// Drain the tick queue: update the price cache, aggregate candles, persist
/// closed buckets, re-evaluate signals, and fan the price out to the actor.
async fn run_tick_ingress(
    mut rx: mpsc::Receiver<Tick>,
    price_cache: Arc<PriceCache>,
    aggregator: Arc<CandleAggregator>,
    candle_repo: CandleRepo,
    signal_service: Arc<SignalService>,
    actor: Arc<TradeActor>,
    events: Arc<EventLog>,
) {
    info!("tick ingress running");
    while let Some(tick) = rx.recv().await {
        price_cache.update(&tick);

        match aggregator.on_tick(&tick) {
            Ok(closed) => {
                for candle in closed {
                    if let Err(e) = candle_repo.upsert(&candle) {
                        error!(symbol = %candle.symbol, error = %e, "candle persist failed");
                        continue;
                    }
                    if let Err(e) = signal_service.on_candle_closed(&candle) {
                        warn!(symbol = %candle.symbol, error = %e, "signal evaluation failed");
                    }
                }
            }
            Err(reject) => {
                // Malformed ticks are dropped and counted by the aggregator.
                warn!(error = %reject, "tick rejected");
                let stats = aggregator.stats();
                if stats.rejected_ticks % 1000 == 1 {
                    events.alert(
                        AlertSeverity::Medium,
                        "INGRESS_REJECT",
                        &format!("{} malformed ticks dropped", stats.rejected_ticks),
                    );
                }
                continue;
            }
        }

        if let Err(e) = actor.broadcast_price(tick).await {
            warn!(error = %e, "price broadcast refused");
        }
    }
    info!("tick ingress stopped");
}

// ---------------------------------------------------------------------------
// Paper-mode bootstrap
// ---------------------------------------------------------------------------

/// Seed a demo user with an EXEC and a DATA paper binding plus a default
/// watchlist when the database is empty.
fn seed_demo_bindings(repo: &UserBrokerRepo) -> anyhow::Result<()> {
    if repo.data_broker()?.is_some() || !repo.active_exec()?.is_empty() {
        return Ok(());
    }

    let user_id = uuid::Uuid::new_v4();
    let now = Utc::now();
    let exec = UserBroker {
        id: uuid::Uuid::new_v4(),
        user_id,
        broker_kind: "paper".to_string(),
        role: BrokerRole::Exec,
        credentials: serde_json::json!({}),
        active: true,
        connection_status: ConnectionStatus::Disconnected,
        session_expires_at: None,
        created_at: now,
    };
    let data = UserBroker {
        id: uuid::Uuid::new_v4(),
        user_id,
        broker_kind: "paper".to_string(),
        role: BrokerRole::Data,
        credentials: serde_json::json!({}),
        active: true,
        connection_status: ConnectionStatus::Disconnected,
        session_expires_at: None,
        created_at: now,
    };
    repo.insert(&exec)?;
    repo.insert(&data)?;

    let symbols: Vec<String> = DEMO_SYMBOLS.iter().map(|s| s.to_string()).collect();
    let template = repo.create_watchlist_template("demo-nifty", &symbols, now)?;
    repo.select_watchlist(exec.id, template, now)?;

    info!(user_id = %user_id, "seeded demo paper bindings");
    Ok(())
}

/// Deterministic demo price feed: a slow oscillation with a faster ripple,
/// enough to walk prices into buy zones and through trailing stops.
async fn run_demo_feed(
    symbols: Vec<String>,
    paper_adapters: Vec<Arc<PaperBroker>>,
    tx: mpsc::Sender<Tick>,
) {
    let bases: Vec<Decimal> = symbols
        .iter()
        .enumerate()
        .map(|(i, _)| Decimal::from(500 + 700 * i as i64))
        .collect();

    info!(symbols = symbols.len(), "demo feed running");
    let mut step: u64 = 0;
    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    loop {
        ticker.tick().await;
        step += 1;
        let t = step as f64;

        for (i, symbol) in symbols.iter().enumerate() {
            let wave = 0.02 * (t * 0.011 + i as f64).sin() + 0.004 * (t * 0.17).sin();
            let factor = Decimal::from_f64_retain(1.0 + wave).unwrap_or(Decimal::ONE);
            let price = (bases[i] * factor)
                .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);

            for paper in &paper_adapters {
                paper.set_mark(symbol, price);
            }
            let tick = Tick {
                symbol: symbol.clone(),
                ltp: price,
                volume: 100,
                ts: Utc::now(),
            };
            // Drop-latest on overflow: the cache and the next tick carry on.
            if tx.try_send(tick).is_err() {
                continue;
            }
        }
    }
}
