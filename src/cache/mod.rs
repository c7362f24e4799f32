//! Pooled client for the hot price cache.
//!
//! Speaks the length-prefixed array protocol from [`resp`] over a fixed-size
//! pool of TCP connections. Latest prices live in one sorted set per
//! exchange and symbol (`price:<exchange>:<symbol>`), scored by epoch
//! second and expired after two minutes.

pub mod resp;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use self::resp::{encode_command, read_reply, Reply, RespError};

pub const PRICE_TTL_SECONDS: i64 = 120;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const ACQUIRE_TIMEOUT: Duration = Duration::from_millis(500);
const HEALTH_INTERVAL: Duration = Duration::from_secs(1);
const HEALTH_PING_TIMEOUT: Duration = Duration::from_millis(500);
const GET_LATEST_TIMEOUT: Duration = Duration::from_millis(100);
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("connection pool timeout")]
    PoolExhausted,
    #[error("cache operation timed out")]
    Deadline,
    #[error("no prices found")]
    NoPrices,
    #[error(transparent)]
    Wire(#[from] RespError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),
}

/// Connection-pooled cache client.
///
/// The pool is a bounded queue of established connections; a lease holds a
/// connection exclusively for one command. A background sweep pings every
/// pooled connection each second and replaces the ones that fail, contending
/// with `acquire` for bounded pauses while it runs.
pub struct HotCache {
    addr: String,
    pool_tx: mpsc::Sender<TcpStream>,
    pool_rx: Mutex<mpsc::Receiver<TcpStream>>,
    pool_size: usize,
    /// Connections currently alive: pooled + leased + awaiting replacement.
    live: AtomicUsize,
}

impl HotCache {
    /// Dials and PING-validates `pool_size` connections; any failure aborts
    /// construction and drops the connections made so far. The health sweep
    /// runs until `cancel` fires.
    pub async fn connect(
        addr: &str,
        pool_size: usize,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>, CacheError> {
        let mut conns = Vec::with_capacity(pool_size);
        for _ in 0..pool_size {
            conns.push(Self::create_connection(addr).await?);
        }

        let (pool_tx, pool_rx) = mpsc::channel(pool_size.max(1));
        for conn in conns {
            let _ = pool_tx.try_send(conn);
        }

        let cache = Arc::new(Self {
            addr: addr.to_string(),
            pool_tx,
            pool_rx: Mutex::new(pool_rx),
            pool_size,
            live: AtomicUsize::new(pool_size),
        });

        tokio::spawn(cache.clone().run_health_sweep(cancel));

        Ok(cache)
    }

    /// `ZADD` the price scored by the current epoch second, refresh the key
    /// TTL, and kick off a best-effort background trim of expired entries.
    /// `deadline` bounds the two foreground commands together.
    pub async fn add_price(
        self: &Arc<Self>,
        exchange: &str,
        symbol: &str,
        price: f64,
        deadline: Duration,
    ) -> Result<(), CacheError> {
        let started = Instant::now();
        let key = format!("price:{exchange}:{symbol}");
        let now = Utc::now().timestamp();

        self.exec_command(
            &["ZADD", &key, &now.to_string(), &price.to_string()],
            deadline,
        )
        .await?;

        let remaining = deadline.saturating_sub(started.elapsed());
        if let Err(e) = self
            .exec_command(&["EXPIRE", &key, &PRICE_TTL_SECONDS.to_string()], remaining)
            .await
        {
            warn!(key = %key, error = %e, "Failed to refresh TTL on price key");
        }

        let cache = self.clone();
        tokio::spawn(async move {
            if let Err(e) = cache.clean_old_prices(CLEANUP_TIMEOUT).await {
                debug!(error = %e, "Background price cleanup failed");
            }
        });

        Ok(())
    }

    /// Latest price for a symbol; an empty `exchange` searches every
    /// exchange's key and returns the most recently scored member.
    pub async fn get_latest_price(
        &self,
        exchange: &str,
        symbol: &str,
    ) -> Result<f64, CacheError> {
        let started = Instant::now();
        let deadline = GET_LATEST_TIMEOUT;

        let keys: Vec<String> = if exchange.is_empty() {
            self.exec_command(&["KEYS", &format!("price:*:{symbol}")], deadline)
                .await?
                .into_strings()
        } else {
            vec![format!("price:{exchange}:{symbol}")]
        };

        let mut best: Option<(f64, i64)> = None;
        for key in &keys {
            let remaining = deadline.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                break;
            }
            let reply = match self
                .exec_command(&["ZREVRANGE", key, "0", "0", "WITHSCORES"], remaining)
                .await
            {
                Ok(reply) => reply,
                Err(_) => continue,
            };
            let fields = reply.into_strings();
            if fields.len() < 2 {
                continue;
            }
            let (Ok(price), Ok(score)) = (fields[0].parse::<f64>(), fields[1].parse::<i64>())
            else {
                continue;
            };
            if best.map_or(true, |(_, seen)| score > seen) {
                best = Some((price, score));
            }
        }

        best.map(|(price, _)| price).ok_or(CacheError::NoPrices)
    }

    /// Trims members older than the TTL from every price key.
    pub async fn clean_old_prices(&self, deadline: Duration) -> Result<(), CacheError> {
        let started = Instant::now();
        let keys = self
            .exec_command(&["KEYS", "price:*"], deadline)
            .await?
            .into_strings();
        let cutoff = Utc::now().timestamp() - PRICE_TTL_SECONDS;

        for key in &keys {
            let remaining = deadline.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                break;
            }
            if let Err(e) = self
                .exec_command(
                    &["ZREMRANGEBYSCORE", key, "-inf", &cutoff.to_string()],
                    remaining,
                )
                .await
            {
                warn!(key = %key, error = %e, "Failed to trim expired prices");
            }
        }
        Ok(())
    }

    pub async fn ping(&self, deadline: Duration) -> Result<(), CacheError> {
        let reply = self.exec_command(&["PING"], deadline).await?;
        expect_pong(reply)
    }

    async fn exec_command(&self, args: &[&str], deadline: Duration) -> Result<Reply, CacheError> {
        let mut conn = self.acquire().await?;
        match Self::roundtrip(&mut conn, args, deadline).await {
            Ok(reply) => {
                self.release(conn);
                Ok(reply)
            }
            Err(err) => {
                // A server error leaves the stream synchronized; anything
                // else may have left unread bytes behind, so the connection
                // is discarded and replaced out of band.
                if matches!(err, CacheError::Wire(RespError::Server(_))) {
                    self.release(conn);
                } else {
                    drop(conn);
                    self.live.fetch_sub(1, Ordering::Relaxed);
                }
                Err(err)
            }
        }
    }

    async fn acquire(&self) -> Result<TcpStream, CacheError> {
        let leased = timeout(ACQUIRE_TIMEOUT, async {
            let mut rx = self.pool_rx.lock().await;
            rx.recv().await
        })
        .await;
        match leased {
            Ok(Some(conn)) => Ok(conn),
            Ok(None) | Err(_) => Err(CacheError::PoolExhausted),
        }
    }

    fn release(&self, conn: TcpStream) {
        if self.pool_tx.try_send(conn).is_err() {
            self.live.fetch_sub(1, Ordering::Relaxed);
        }
    }

    async fn roundtrip(
        conn: &mut TcpStream,
        args: &[&str],
        deadline: Duration,
    ) -> Result<Reply, CacheError> {
        let command = encode_command(args);
        let op = async {
            conn.write_all(&command).await?;
            let mut reader = BufReader::new(&mut *conn);
            let reply = read_reply(&mut reader).await?;
            Ok::<_, CacheError>(reply)
        };
        timeout(deadline, op).await.map_err(|_| CacheError::Deadline)?
    }

    async fn create_connection(addr: &str) -> Result<TcpStream, CacheError> {
        let mut conn = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| CacheError::Deadline)??;
        conn.set_nodelay(true)?;
        let reply = Self::roundtrip(&mut conn, &["PING"], CONNECT_TIMEOUT).await?;
        expect_pong(reply)?;
        Ok(conn)
    }

    /// Drains the pool under the acquire-side lock, pings every connection,
    /// closes the ones that fail, and tops the pool back up to capacity.
    async fn run_health_sweep(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(HEALTH_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Cache health sweep stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }

            let mut rx = self.pool_rx.lock().await;

            let mut healthy = Vec::new();
            let mut closed = 0usize;
            while let Ok(mut conn) = rx.try_recv() {
                match Self::roundtrip(&mut conn, &["PING"], HEALTH_PING_TIMEOUT).await {
                    Ok(Reply::Simple(s)) if s.contains("PONG") => healthy.push(conn),
                    _ => {
                        closed += 1;
                        self.live.fetch_sub(1, Ordering::Relaxed);
                    }
                }
            }
            for conn in healthy {
                let _ = self.pool_tx.try_send(conn);
            }

            let mut replaced = 0usize;
            while self.live.load(Ordering::Relaxed) < self.pool_size {
                match Self::create_connection(&self.addr).await {
                    Ok(conn) => {
                        self.live.fetch_add(1, Ordering::Relaxed);
                        let _ = self.pool_tx.try_send(conn);
                        replaced += 1;
                    }
                    Err(e) => {
                        debug!(error = %e, "Cannot replace cache connection yet");
                        break;
                    }
                }
            }
            drop(rx);

            if closed > 0 || replaced > 0 {
                warn!(closed, replaced, "Health sweep recycled cache connections");
            }
        }
    }
}

fn expect_pong(reply: Reply) -> Result<(), CacheError> {
    match reply {
        Reply::Simple(s) if s.contains("PONG") => Ok(()),
        other => Err(CacheError::UnexpectedReply(format!("{other:?}"))),
    }
}
