// =============================================================================
// Trade Management Actor — single writer per trade, partitioned by trade id
// =============================================================================
//
// Every mutation to a trade flows through one of P partition queues; the
// partition index is `hash(trade_id) % P`, so all messages for a trade are
// handled FIFO by exactly one worker while different trades run in parallel.
// The partition queue is the lock: no row locks, no user-level locks.
//
// Trade ids are UUIDv5 of the intent id under a fixed namespace, which makes
// creation idempotent and lets the router compute the partition for an
// intent before the trade row exists. Broker order updates carry the intent
// id as the client order tag, so they route the same way without a lookup;
// updates known only by broker order id fall back to a repository read.
//
// Shutdown closes the intake, lets each worker drain its queue, and joins
// with a bounded timeout; workers still running after the timeout are
// aborted and an alert records the possibility of uncommitted writes.
// =============================================================================

pub mod worker;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::broker::BrokerOrderState;
use crate::store::signals::Signal;
use crate::store::trades::TradeIntent;
use crate::types::{AlertSeverity, Tick, TradeStatus};
use worker::{Partition, WorkerDeps};

/// Namespace for deriving trade ids from intent ids.
const TRADE_NAMESPACE: Uuid = Uuid::from_bytes([
    0x6d, 0x65, 0x72, 0x69, 0x64, 0x69, 0x61, 0x6e, 0x2d, 0x74, 0x72, 0x61, 0x64, 0x65, 0x73,
    0x00,
]);

/// Trade id for an intent: deterministic, idempotent, routable before the
/// row exists.
pub fn trade_id_for_intent(intent_id: Uuid) -> Uuid {
    Uuid::new_v5(&TRADE_NAMESPACE, intent_id.as_bytes())
}

/// Queue depth per partition.
const PARTITION_QUEUE_DEPTH: usize = 256;

/// A broker-side order update, native or synthesized by the reconciler.
#[derive(Debug, Clone)]
pub struct OrderUpdate {
    pub broker_order_id: Option<String>,
    /// Client order tag — the intent id, when the broker echoes it.
    pub client_order_tag: Option<String>,
    pub state: BrokerOrderState,
    pub filled_qty: i64,
    pub avg_fill_price: Option<Decimal>,
    pub reason: Option<String>,
}

/// Messages handled by a partition worker, FIFO per trade.
#[derive(Debug)]
pub enum TradeMsg {
    IntentApproved {
        intent: TradeIntent,
        signal: Signal,
    },
    BrokerOrderUpdate(OrderUpdate),
    PriceUpdate(Tick),
    /// Operator cancellation of an OPEN or EXITING trade.
    Cancel { trade_id: Uuid },
    ReconcileTick,
    /// Completion barrier: replied to once every prior message on this
    /// partition has been handled.
    Barrier(oneshot::Sender<()>),
}

/// The partitioned actor front-end.
pub struct TradeActor {
    senders: RwLock<Option<Vec<mpsc::Sender<TradeMsg>>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    partitions: usize,
    deps: Arc<WorkerDeps>,
}

impl TradeActor {
    /// Spawn `partitions` workers. Each rebuilds its in-memory active index
    /// from the trade repository before consuming messages.
    pub fn spawn(partitions: usize, deps: Arc<WorkerDeps>) -> Arc<Self> {
        let partitions = partitions.max(1);
        let mut senders = Vec::with_capacity(partitions);
        let mut handles = Vec::with_capacity(partitions);

        for index in 0..partitions {
            let (tx, rx) = mpsc::channel(PARTITION_QUEUE_DEPTH);
            let mut partition = Partition::new(index, partitions, deps.clone());
            handles.push(tokio::spawn(async move {
                partition.run(rx).await;
            }));
            senders.push(tx);
        }

        info!(partitions, "trade actor started");
        Arc::new(Self {
            senders: RwLock::new(Some(senders)),
            handles: Mutex::new(handles),
            partitions,
            deps,
        })
    }

    fn partition_for(&self, trade_id: Uuid) -> usize {
        worker::partition_index(trade_id, self.partitions)
    }

    fn sender_for(&self, trade_id: Uuid) -> Result<mpsc::Sender<TradeMsg>> {
        match self.senders.read().as_ref() {
            Some(senders) => Ok(senders[self.partition_for(trade_id)].clone()),
            None => bail!("trade actor is draining; message refused"),
        }
    }

    fn all_senders(&self) -> Result<Vec<mpsc::Sender<TradeMsg>>> {
        match self.senders.read().as_ref() {
            Some(senders) => Ok(senders.clone()),
            None => bail!("trade actor is draining; message refused"),
        }
    }

    /// Route an approved intent to the partition that will own its trade.
    pub async fn submit_intent(&self, intent: TradeIntent, signal: Signal) -> Result<()> {
        let tx = self.sender_for(trade_id_for_intent(intent.id))?;
        tx.send(TradeMsg::IntentApproved { intent, signal })
            .await
            .map_err(|_| anyhow::anyhow!("trade actor partition closed"))
    }

    /// Route a broker order update. Prefers the client order tag (the
    /// intent id for entries, the exit-intent id for exits); falls back to a
    /// repository lookup by broker order id.
    pub async fn submit_order_update(&self, update: OrderUpdate) -> Result<()> {
        let trade_id = worker::resolve_trade_id(&self.deps, &update)?;

        let Some(trade_id) = trade_id else {
            warn!(
                order_id = update.broker_order_id.as_deref().unwrap_or("?"),
                "order update matches no trade — dropped"
            );
            return Ok(());
        };

        let tx = self.sender_for(trade_id)?;
        tx.send(TradeMsg::BrokerOrderUpdate(update))
            .await
            .map_err(|_| anyhow::anyhow!("trade actor partition closed"))
    }

    /// Broadcast a price update; each partition filters for its own OPEN
    /// trades on the symbol.
    pub async fn broadcast_price(&self, tick: Tick) -> Result<()> {
        for tx in self.all_senders()? {
            if tx.send(TradeMsg::PriceUpdate(tick.clone())).await.is_err() {
                bail!("trade actor partition closed");
            }
        }
        Ok(())
    }

    /// Operator cancel, serialized like every other mutation.
    pub async fn cancel_trade(&self, trade_id: Uuid) -> Result<()> {
        let tx = self.sender_for(trade_id)?;
        tx.send(TradeMsg::Cancel { trade_id })
            .await
            .map_err(|_| anyhow::anyhow!("trade actor partition closed"))
    }

    /// Periodic index-heal tick for every partition.
    pub async fn reconcile_tick(&self) -> Result<()> {
        for tx in self.all_senders()? {
            let _ = tx.send(TradeMsg::ReconcileTick).await;
        }
        Ok(())
    }

    /// Wait until every message enqueued before this call has been handled.
    pub async fn flush(&self) -> Result<()> {
        let senders = self.all_senders()?;
        let mut waiters = Vec::with_capacity(senders.len());
        for tx in senders {
            let (ack, done) = oneshot::channel();
            if tx.send(TradeMsg::Barrier(ack)).await.is_ok() {
                waiters.push(done);
            }
        }
        for done in waiters {
            let _ = done.await;
        }
        Ok(())
    }

    /// Drain and stop. In-flight messages finish; new messages are refused.
    /// Workers still running after `timeout` are aborted.
    pub async fn shutdown(&self, timeout: Duration) {
        // Closing the channels is the drain signal.
        let senders = self.senders.write().take();
        drop(senders);

        let mut handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        let drain = async {
            for handle in handles.iter_mut() {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(timeout, drain).await.is_err() {
            warn!("trade actor drain timed out — aborting workers");
            for handle in &handles {
                handle.abort();
            }
            self.deps.events.alert(
                AlertSeverity::Critical,
                "ACTOR_DRAIN_TIMEOUT",
                "trade actor workers aborted during shutdown; writes may be uncommitted",
            );
        }
        info!("trade actor stopped");
    }

    /// Statuses a partition tracks in its in-memory active index.
    pub(crate) fn indexed_statuses() -> &'static [TradeStatus] {
        &[
            TradeStatus::EntrySubmitted,
            TradeStatus::Pending,
            TradeStatus::Open,
            TradeStatus::Exiting,
        ]
    }

}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
