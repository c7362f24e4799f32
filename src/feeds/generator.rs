//! Synthetic tick generator for test mode.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::models::PriceUpdate;

const TICK_INTERVAL: Duration = Duration::from_millis(200);
const PRICE_FLOOR: f64 = 30_000.0;
const PRICE_SPAN: f64 = 20_000.0;

/// Emits a tick per configured symbol every 200 ms with a uniformly random
/// price in `[30000, 50000)`. Sends are non-blocking: a full fan-in drops
/// the tick with a warning. Terminates within one interval of cancellation.
pub async fn generate_test_data(
    exchange: String,
    symbols: Vec<String>,
    out: mpsc::Sender<PriceUpdate>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(TICK_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!(exchange = %exchange, "Test generator stopped");
                return;
            }
            _ = ticker.tick() => {}
        }

        for symbol in &symbols {
            let price = PRICE_FLOOR + rand::random::<f64>() * PRICE_SPAN;
            let update = PriceUpdate::raw(exchange.clone(), symbol.clone(), price);
            match out.try_send(update) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(exchange = %exchange, symbol = %symbol, "Fan-in full, dropping synthetic tick");
                }
                Err(TrySendError::Closed(_)) => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TickKind;
    use tokio::time::timeout;

    #[tokio::test]
    async fn emits_ticks_in_configured_range() {
        let (tx, mut rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        tokio::spawn(generate_test_data(
            "coinbase".to_string(),
            vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
            tx,
            cancel.clone(),
        ));

        for expected in ["BTCUSDT", "ETHUSDT"] {
            let tick = timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(tick.exchange, "coinbase");
            assert_eq!(tick.symbol, expected);
            assert!(tick.price >= PRICE_FLOOR && tick.price < PRICE_FLOOR + PRICE_SPAN);
            assert!(matches!(tick.kind, TickKind::Raw));
        }

        cancel.cancel();
    }

    #[tokio::test]
    async fn stops_within_one_interval_of_cancellation() {
        let (tx, mut rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(generate_test_data(
            "binance".to_string(),
            vec!["BTCUSDT".to_string()],
            tx,
            cancel.clone(),
        ));

        // Wait for at least one emission so the loop is running.
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();

        cancel.cancel();
        timeout(TICK_INTERVAL * 2, handle)
            .await
            .expect("generator should stop within one tick interval")
            .unwrap();
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_blocking() {
        let (tx, mut rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        tokio::spawn(generate_test_data(
            "kucoin".to_string(),
            vec!["SOLUSDT".to_string()],
            tx,
            cancel.clone(),
        ));

        // Never drain; the generator must keep running and dropping.
        tokio::time::sleep(TICK_INTERVAL * 4).await;
        let tick = rx.recv().await.unwrap();
        assert_eq!(tick.symbol, "SOLUSDT");
        cancel.cancel();
    }
}
