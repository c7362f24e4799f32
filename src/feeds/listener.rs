//! Live exchange feed adapter.
//!
//! One listener per exchange: connects over TCP, reads newline-delimited
//! JSON frames, and pushes normalized raw ticks onto the fan-in bus.
//! Connection loss triggers a reconnect loop; nothing is buffered across
//! disconnects.

use std::time::Duration;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::models::PriceUpdate;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// One frame of the feed wire format. Extra fields are ignored.
#[derive(Debug, Deserialize)]
struct FeedMessage {
    symbol: String,
    price: f64,
    /// Feed-supplied nanosecond timestamp; ticks are stamped with ingestion
    /// time instead.
    #[serde(default)]
    #[allow(dead_code)]
    timestamp: i64,
}

/// Streams ticks from one exchange into `out` until cancelled.
pub async fn listen_to_exchange(
    addr: String,
    exchange: String,
    out: mpsc::Sender<PriceUpdate>,
    cancel: CancellationToken,
) {
    loop {
        let stream = tokio::select! {
            _ = cancel.cancelled() => return,
            connected = TcpStream::connect(&addr) => match connected {
                Ok(stream) => stream,
                Err(e) => {
                    error!(exchange = %exchange, addr = %addr, error = %e, "Failed to connect to exchange feed");
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = sleep(RECONNECT_DELAY) => continue,
                    }
                }
            }
        };

        info!(exchange = %exchange, addr = %addr, "Connected to exchange feed");

        let mut lines = BufReader::new(stream).lines();
        loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => return,
                line = lines.next_line() => line,
            };

            match line {
                Ok(Some(line)) => {
                    let msg: FeedMessage = match serde_json::from_str(&line) {
                        Ok(msg) => msg,
                        Err(e) => {
                            warn!(exchange = %exchange, message = %line, error = %e, "Failed to parse feed frame");
                            continue;
                        }
                    };
                    let update = PriceUpdate::raw(exchange.clone(), msg.symbol, msg.price);
                    if out.send(update).await.is_err() {
                        info!(exchange = %exchange, "Fan-in closed, stopping feed listener");
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!(exchange = %exchange, error = %e, "Feed connection error");
                    break;
                }
            }
        }

        info!(exchange = %exchange, "Feed connection closed, reconnecting");
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = sleep(RECONNECT_DELAY) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TickKind;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    #[tokio::test]
    async fn parses_frames_and_skips_malformed() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (mut sock, _) = server.accept().await.unwrap();
            sock.write_all(
                b"{\"symbol\":\"BTCUSDT\",\"price\":40000.5,\"timestamp\":1}\n\
                  not json\n\
                  {\"symbol\":\"ETHUSDT\",\"price\":2000.25,\"timestamp\":2}\n",
            )
            .await
            .unwrap();
            sleep(Duration::from_millis(200)).await;
        });

        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        tokio::spawn(listen_to_exchange(
            addr,
            "binance".to_string(),
            tx,
            cancel.clone(),
        ));

        let first = timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.exchange, "binance");
        assert_eq!(first.symbol, "BTCUSDT");
        assert_eq!(first.price, 40000.5);
        assert!(matches!(first.kind, TickKind::Raw));

        // The malformed middle frame is skipped.
        let second = timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.symbol, "ETHUSDT");

        cancel.cancel();
    }

    #[test]
    fn extra_frame_fields_are_ignored() {
        let msg: FeedMessage = serde_json::from_str(
            r#"{"symbol":"SOLUSDT","price":150.0,"timestamp":3,"volume":12.5}"#,
        )
        .unwrap();
        assert_eq!(msg.symbol, "SOLUSDT");
        assert_eq!(msg.price, 150.0);
    }

    #[tokio::test]
    async fn stops_promptly_when_cancelled_while_disconnected() {
        // Nothing listens on this port; the listener sits in its reconnect loop.
        let (tx, _rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(listen_to_exchange(
            "127.0.0.1:1".to_string(),
            "binance".to_string(),
            tx,
            cancel.clone(),
        ));

        sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        timeout(Duration::from_secs(1), handle)
            .await
            .expect("listener should exit on cancellation")
            .unwrap();
    }
}
