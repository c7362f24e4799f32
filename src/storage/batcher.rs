//! Persistence sink: batches raw and aggregate ticks separately and flushes
//! on size or time. Persistence is best-effort; a failed flush drops the
//! batch.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::PriceStore;
use crate::models::{PriceUpdate, TickKind};

pub const BATCH_SIZE: usize = 100;
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Drains the persistence queue until it closes, then flushes whatever is
/// left and exits.
pub async fn run_persistence_sink(mut rx: mpsc::Receiver<PriceUpdate>, store: Arc<PriceStore>) {
    let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut raw_batch: Vec<PriceUpdate> = Vec::with_capacity(BATCH_SIZE);
    let mut agg_batch: Vec<PriceUpdate> = Vec::with_capacity(BATCH_SIZE);

    loop {
        tokio::select! {
            update = rx.recv() => match update {
                Some(update) => {
                    match update.kind {
                        TickKind::Raw => raw_batch.push(update),
                        TickKind::Aggregate(_) => agg_batch.push(update),
                    }
                    if raw_batch.len() >= BATCH_SIZE {
                        flush_raw(&store, &mut raw_batch);
                    }
                    if agg_batch.len() >= BATCH_SIZE {
                        flush_agg(&store, &mut agg_batch);
                    }
                }
                None => {
                    flush_raw(&store, &mut raw_batch);
                    flush_agg(&store, &mut agg_batch);
                    info!("Persistence queue closed, sink drained");
                    return;
                }
            },
            _ = ticker.tick() => {
                flush_raw(&store, &mut raw_batch);
                flush_agg(&store, &mut agg_batch);
            }
        }
    }
}

fn flush_raw(store: &PriceStore, batch: &mut Vec<PriceUpdate>) {
    if batch.is_empty() {
        return;
    }
    match store.insert_raw_batch(batch) {
        Ok(rows) => debug!(rows, "Inserted raw batch"),
        Err(e) => warn!(error = %e, dropped = batch.len(), "Failed to insert raw batch"),
    }
    batch.clear();
}

fn flush_agg(store: &PriceStore, batch: &mut Vec<PriceUpdate>) {
    if batch.is_empty() {
        return;
    }
    match store.insert_agg_batch(batch) {
        Ok(rows) => debug!(rows, "Inserted aggregated batch"),
        Err(e) => warn!(error = %e, dropped = batch.len(), "Failed to insert aggregated batch"),
    }
    batch.clear();
}
