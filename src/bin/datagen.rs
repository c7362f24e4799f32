//! Synthetic exchange feed server.
//!
//! Listens on one TCP port per exchange and streams random
//! `{symbol, price, timestamp}` JSON lines to every connected client at a
//! 200 ms cadence, mimicking the live feed wire format.

use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info};

const EMIT_INTERVAL: Duration = Duration::from_millis(200);
const SYMBOLS: &[&str] = &["BTCUSDT", "ETHUSDT", "DOGEUSDT", "SOLUSDT", "TONUSDT"];
const EXCHANGES: &[(&str, &str)] = &[
    ("0.0.0.0:40101", "binance"),
    ("0.0.0.0:40102", "coinbase"),
    ("0.0.0.0:40103", "kucoin"),
];

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "datagen=info".into()),
        )
        .init();

    for &(addr, exchange) in EXCHANGES {
        tokio::spawn(run_exchange(addr, exchange));
    }

    std::future::pending::<()>().await;
    Ok(())
}

async fn run_exchange(addr: &'static str, exchange: &'static str) {
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(exchange, addr, error = %e, "Failed to bind synthetic exchange");
            std::process::exit(1);
        }
    };
    info!(exchange, addr, "Synthetic exchange listening");

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                info!(exchange, peer = %peer, "Client connected");
                tokio::spawn(feed_client(stream, exchange));
            }
            Err(e) => error!(exchange, error = %e, "Accept failed"),
        }
    }
}

async fn feed_client(mut stream: TcpStream, exchange: &'static str) {
    let mut ticker = tokio::time::interval(EMIT_INTERVAL);
    loop {
        ticker.tick().await;

        let (symbol, price) = {
            let mut rng = rand::thread_rng();
            let symbol = SYMBOLS[rng.gen_range(0..SYMBOLS.len())];
            let price = rng.gen_range(30_000.0..50_000.0);
            (symbol, price)
        };

        let frame = json!({
            "symbol": symbol,
            "price": price,
            "timestamp": chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default(),
        });
        let line = format!("{frame}\n");

        if stream.write_all(line.as_bytes()).await.is_err() {
            info!(exchange, "Client disconnected");
            return;
        }
    }
}
