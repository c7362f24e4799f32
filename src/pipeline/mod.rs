//! The streaming pipeline: sources → fan-in → demux → per-exchange shards
//! → cache and persistence sinks, supervised by the mode controller.

pub mod demux;
pub mod shard;
pub mod stats;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cache::HotCache;
use crate::feeds::{generator, listener};
use crate::mode::ModeController;
use crate::models::{Config, Mode, PriceUpdate};
use crate::storage::{batcher, PriceStore};

pub const FAN_IN_CAPACITY: usize = 10_000;
pub const CACHE_QUEUE_CAPACITY: usize = 10_000;
pub const PERSIST_QUEUE_CAPACITY: usize = 20_000;
pub const SHARD_QUEUE_CAPACITY: usize = 1_000;
pub const CACHE_WORKERS: usize = 20;

const MODE_POLL_INTERVAL: Duration = Duration::from_secs(10);
const CACHE_OP_TIMEOUT: Duration = Duration::from_millis(100);
const CACHE_ERROR_BACKOFF: Duration = Duration::from_millis(100);

pub struct PipelineHandles {
    /// The persistence sink; awaited at shutdown so final batches land.
    pub persistence: JoinHandle<()>,
}

/// Wires up and spawns every pipeline stage.
///
/// Teardown is a cascade from `cancel`: sources and the supervisor drop
/// their fan-in senders, the demux drops the shard senders, shard workers
/// drop the sink senders, and the sinks drain and exit.
pub fn start_ingestion(
    config: &Config,
    cache: Arc<HotCache>,
    store: Arc<PriceStore>,
    mode: Arc<ModeController>,
    cancel: CancellationToken,
) -> PipelineHandles {
    let (fan_in_tx, fan_in_rx) = mpsc::channel(FAN_IN_CAPACITY);
    let (cache_tx, cache_rx) = mpsc::channel(CACHE_QUEUE_CAPACITY);
    let (persist_tx, persist_rx) = mpsc::channel(PERSIST_QUEUE_CAPACITY);

    let mut shards = HashMap::new();
    for endpoint in &config.exchanges {
        let (shard_tx, shard_rx) = mpsc::channel(SHARD_QUEUE_CAPACITY);
        shard::ExchangeShard::spawn(
            endpoint.name.clone(),
            shard_rx,
            cache_tx.clone(),
            persist_tx.clone(),
            cancel.clone(),
        );
        shards.insert(endpoint.name.clone(), shard_tx);
    }
    // The shards now hold the only sink senders; the queues close once
    // every shard task exits.
    drop(cache_tx);
    drop(persist_tx);

    tokio::spawn(demux::run_demux(fan_in_rx, shards));

    spawn_cache_workers(cache_rx, cache);

    let persistence = tokio::spawn(batcher::run_persistence_sink(persist_rx, store));

    tokio::spawn(run_mode_supervisor(config.clone(), mode, fan_in_tx, cancel));

    info!(
        exchanges = config.exchanges.len(),
        workers_per_exchange = shard::WORKERS_PER_EXCHANGE,
        cache_workers = CACHE_WORKERS,
        "Ingestion pipeline started"
    );

    PipelineHandles { persistence }
}

/// Pool of workers writing ticks into the hot cache. Errors are logged and
/// the tick abandoned; a short sleep keeps a dead cache from spinning the
/// pool.
fn spawn_cache_workers(rx: mpsc::Receiver<PriceUpdate>, cache: Arc<HotCache>) {
    let rx = Arc::new(tokio::sync::Mutex::new(rx));
    for worker_id in 0..CACHE_WORKERS {
        let rx = rx.clone();
        let cache = cache.clone();
        tokio::spawn(async move {
            loop {
                let update = { rx.lock().await.recv().await };
                let Some(update) = update else {
                    return;
                };
                if let Err(e) = cache
                    .add_price(
                        &update.exchange,
                        &update.symbol,
                        update.price,
                        CACHE_OP_TIMEOUT,
                    )
                    .await
                {
                    warn!(
                        worker = worker_id,
                        exchange = %update.exchange,
                        symbol = %update.symbol,
                        error = %e,
                        "Failed to write price to cache"
                    );
                    tokio::time::sleep(CACHE_ERROR_BACKOFF).await;
                }
            }
        });
    }
}

/// Observes the mode every 10 s and keeps exactly one source set running:
/// on a transition the outgoing set is cancelled before the new one starts,
/// so toggling never leaks tasks.
async fn run_mode_supervisor(
    config: Config,
    mode: Arc<ModeController>,
    fan_in: mpsc::Sender<PriceUpdate>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(MODE_POLL_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut running: Option<(Mode, CancellationToken)> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                if let Some((_, sources)) = running.take() {
                    sources.cancel();
                }
                info!("Mode supervisor stopped");
                return;
            }
            _ = ticker.tick() => {}
        }

        let current = mode.get();
        info!(mode = %current.as_str(), "Current ingestion mode");

        if matches!(&running, Some((active, _)) if *active == current) {
            continue;
        }

        if let Some((previous, sources)) = running.take() {
            info!(
                from = %previous.as_str(),
                to = %current.as_str(),
                "Mode changed, stopping previous sources"
            );
            sources.cancel();
        }

        let sources = cancel.child_token();
        match current {
            Mode::Live => {
                info!("Starting live mode listeners");
                for endpoint in &config.exchanges {
                    tokio::spawn(listener::listen_to_exchange(
                        endpoint.addr.clone(),
                        endpoint.name.clone(),
                        fan_in.clone(),
                        sources.clone(),
                    ));
                }
            }
            Mode::Test => {
                info!("Starting test mode generators");
                for endpoint in &config.exchanges {
                    tokio::spawn(generator::generate_test_data(
                        endpoint.name.clone(),
                        config.symbols.clone(),
                        fan_in.clone(),
                        sources.clone(),
                    ));
                }
            }
        }
        running = Some((current, sources));
    }
}
