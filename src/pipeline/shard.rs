//! Per-exchange worker shard.
//!
//! Each shard drains its own queue with a pool of workers. Every raw tick
//! is teed (non-blocking, lossy) to the cache and persistence queues, then
//! folded into its symbol's aggregation bucket. Full buckets and a 500 ms
//! flusher emit aggregates toward persistence.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::stats::SymbolStats;
use crate::models::PriceUpdate;

pub const WORKERS_PER_EXCHANGE: usize = 10;
const FLUSH_INTERVAL: Duration = Duration::from_millis(500);

/// Coarse map lock around fine per-bucket locks; always outer before inner,
/// and neither held across a queue send.
type StatsMap = Mutex<HashMap<String, Arc<Mutex<SymbolStats>>>>;

pub struct ExchangeShard {
    exchange: String,
    stats: StatsMap,
    to_cache: mpsc::Sender<PriceUpdate>,
    to_store: mpsc::Sender<PriceUpdate>,
}

impl ExchangeShard {
    /// Spawns the shard's worker pool and periodic flusher. Workers exit
    /// when `rx` closes; the flusher exits on `cancel`, releasing the
    /// shard's sink senders so the downstream queues can close.
    pub fn spawn(
        exchange: String,
        rx: mpsc::Receiver<PriceUpdate>,
        to_cache: mpsc::Sender<PriceUpdate>,
        to_store: mpsc::Sender<PriceUpdate>,
        cancel: CancellationToken,
    ) {
        let shard = Arc::new(Self {
            exchange,
            stats: Mutex::new(HashMap::new()),
            to_cache,
            to_store,
        });

        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        for worker_id in 0..WORKERS_PER_EXCHANGE {
            tokio::spawn(shard.clone().run_worker(worker_id, rx.clone()));
        }
        tokio::spawn(shard.run_flusher(cancel));
    }

    async fn run_worker(
        self: Arc<Self>,
        worker_id: usize,
        rx: Arc<tokio::sync::Mutex<mpsc::Receiver<PriceUpdate>>>,
    ) {
        loop {
            let update = { rx.lock().await.recv().await };
            let Some(update) = update else {
                debug!(exchange = %self.exchange, worker = worker_id, "Shard queue closed");
                return;
            };
            self.process(worker_id, update);
        }
    }

    fn process(&self, worker_id: usize, update: PriceUpdate) {
        if let Err(TrySendError::Full(_)) = self.to_cache.try_send(update.clone()) {
            warn!(
                exchange = %self.exchange,
                symbol = %update.symbol,
                worker = worker_id,
                "Cache queue full, dropping tick"
            );
        }
        if let Err(TrySendError::Full(_)) = self.to_store.try_send(update.clone()) {
            warn!(
                exchange = %self.exchange,
                symbol = %update.symbol,
                worker = worker_id,
                "Persistence queue full, dropping tick"
            );
        }

        let bucket = {
            let mut stats = self.stats.lock();
            stats.entry(update.symbol.clone()).or_default().clone()
        };
        let aggregate = { bucket.lock().record(&update) };
        if let Some(aggregate) = aggregate {
            debug!(
                exchange = %self.exchange,
                symbol = %aggregate.symbol,
                worker = worker_id,
                "Aggregate ready"
            );
            self.send_aggregate(aggregate);
        }
    }

    /// Flushes every non-empty bucket on a fixed cadence so aggregates stay
    /// bounded-stale even at low tick rates. The flusher holds the last
    /// strong reference to the shard, so it must exit on cancellation
    /// rather than wait for the sink queues to close.
    async fn run_flusher(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(exchange = %self.exchange, "Shard flusher stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }

            let buckets: Vec<Arc<Mutex<SymbolStats>>> =
                self.stats.lock().values().cloned().collect();
            for bucket in buckets {
                let aggregate = { bucket.lock().drain() };
                if let Some(aggregate) = aggregate {
                    self.send_aggregate(aggregate);
                }
            }
        }
    }

    fn send_aggregate(&self, aggregate: PriceUpdate) {
        if let Err(TrySendError::Full(_)) = self.to_store.try_send(aggregate) {
            warn!(exchange = %self.exchange, "Persistence queue full, dropping aggregate");
        }
    }
}
