//! Routes fan-in traffic to per-exchange shard queues.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::models::PriceUpdate;

/// Drains the fan-in bus and forwards each tick to its exchange's shard.
/// Shard sends are blocking, so fan-in backpressure reaches producers.
/// Ticks for exchanges without a shard are dropped with a warning.
pub async fn run_demux(
    mut fan_in: mpsc::Receiver<PriceUpdate>,
    shards: HashMap<String, mpsc::Sender<PriceUpdate>>,
) {
    while let Some(update) = fan_in.recv().await {
        match shards.get(&update.exchange) {
            Some(shard) => {
                if shard.send(update).await.is_err() {
                    // Shard gone mid-shutdown; keep draining so producers
                    // are never wedged on a full bus.
                    continue;
                }
            }
            None => {
                warn!(
                    exchange = %update.exchange,
                    symbol = %update.symbol,
                    "Tick for unknown exchange, dropping"
                );
            }
        }
    }
    info!("Fan-in closed, demux exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn routes_by_exchange_and_drops_unknown() {
        let (fan_in_tx, fan_in_rx) = mpsc::channel(16);
        let (binance_tx, mut binance_rx) = mpsc::channel(16);
        let (coinbase_tx, mut coinbase_rx) = mpsc::channel(16);

        let mut shards = HashMap::new();
        shards.insert("binance".to_string(), binance_tx);
        shards.insert("coinbase".to_string(), coinbase_tx);
        tokio::spawn(run_demux(fan_in_rx, shards));

        for (exchange, symbol) in [
            ("binance", "BTCUSDT"),
            ("kraken", "BTCUSDT"),
            ("coinbase", "ETHUSDT"),
        ] {
            fan_in_tx
                .send(PriceUpdate::raw(
                    exchange.to_string(),
                    symbol.to_string(),
                    1.0,
                ))
                .await
                .unwrap();
        }

        let routed = timeout(Duration::from_secs(1), binance_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(routed.exchange, "binance");

        let routed = timeout(Duration::from_secs(1), coinbase_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(routed.exchange, "coinbase");

        // The kraken tick was dropped, not routed anywhere.
        drop(fan_in_tx);
        assert!(binance_rx.recv().await.is_none());
        assert!(coinbase_rx.recv().await.is_none());
    }
}
