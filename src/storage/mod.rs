//! Durable price storage on SQLite.
//!
//! Raw ticks land in `price_raw`, bucket aggregates in `aggregated_prices`.
//! One WAL-mode connection behind a mutex; batch inserts run inside explicit
//! transactions and whole batches are dropped on error.

pub mod batcher;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::sync::Arc;
use tracing::{info, warn};

use crate::models::{PriceUpdate, TickKind};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS price_raw (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol TEXT NOT NULL,
    exchange TEXT NOT NULL,
    price REAL NOT NULL,
    timestamp INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_price_raw_symbol_ts
    ON price_raw(symbol, timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_price_raw_exchange_symbol_ts
    ON price_raw(exchange, symbol, timestamp DESC);

CREATE TABLE IF NOT EXISTS aggregated_prices (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol TEXT NOT NULL,
    exchange TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    average_price REAL NOT NULL,
    min_price REAL NOT NULL,
    max_price REAL NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_aggregated_symbol_ts
    ON aggregated_prices(symbol, timestamp DESC);
"#;

/// Which aggregated column a query reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggKind {
    Highest,
    Lowest,
    Average,
}

/// Most recent raw row for a symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct LatestRow {
    pub exchange: String,
    pub price: f64,
    pub timestamp_ms: i64,
}

/// One aggregated-query result.
#[derive(Debug, Clone, PartialEq)]
pub struct AggRow {
    pub exchange: Option<String>,
    pub value: f64,
}

pub struct PriceStore {
    conn: Arc<Mutex<Connection>>,
}

impl PriceStore {
    pub fn open(path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(path, flags)
            .with_context(|| format!("Failed to open database at {path}"))?;

        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize database schema")?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" {
            warn!(journal_mode = %journal_mode, "WAL mode not active");
        }

        info!(path = %path, "📊 Price store initialized");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize database schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Inserts a batch of raw ticks in one transaction. Any failure rolls
    /// the whole batch back.
    pub fn insert_raw_batch(&self, batch: &[PriceUpdate]) -> Result<usize> {
        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO price_raw (symbol, exchange, price, timestamp)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for update in batch {
                stmt.execute(params![
                    update.symbol,
                    update.exchange,
                    update.price,
                    update.received_at.timestamp_millis(),
                ])?;
            }
        }
        tx.commit()?;
        Ok(batch.len())
    }

    /// Inserts a batch of aggregate ticks in one transaction; non-aggregate
    /// entries are skipped.
    pub fn insert_agg_batch(&self, batch: &[PriceUpdate]) -> Result<usize> {
        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;
        let mut inserted = 0usize;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO aggregated_prices
                     (symbol, exchange, timestamp, average_price, min_price, max_price)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for update in batch {
                let TickKind::Aggregate(stats) = &update.kind else {
                    continue;
                };
                stmt.execute(params![
                    update.symbol,
                    update.exchange,
                    update.received_at.timestamp_millis(),
                    stats.avg_price,
                    stats.min_price,
                    stats.max_price,
                ])?;
                inserted += 1;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// Most recent raw row for a symbol, optionally scoped to one exchange.
    pub fn latest_raw(&self, symbol: &str, exchange: Option<&str>) -> Result<Option<LatestRow>> {
        let conn = self.conn.lock();
        let row = match exchange {
            Some(exchange) => conn
                .query_row(
                    "SELECT exchange, price, timestamp FROM price_raw
                     WHERE exchange = ?1 AND symbol = ?2
                     ORDER BY timestamp DESC LIMIT 1",
                    params![exchange, symbol],
                    map_latest,
                )
                .optional()?,
            None => conn
                .query_row(
                    "SELECT exchange, price, timestamp FROM price_raw
                     WHERE symbol = ?1
                     ORDER BY timestamp DESC LIMIT 1",
                    params![symbol],
                    map_latest,
                )
                .optional()?,
        };
        Ok(row)
    }

    /// Aggregated-price query behind the highest/lowest/average endpoints.
    /// `since` bounds the window; `None` means all history.
    pub fn aggregated_value(
        &self,
        kind: AggKind,
        symbol: &str,
        exchange: Option<&str>,
        since: Option<DateTime<Utc>>,
    ) -> Result<Option<AggRow>> {
        let since_ms = since.map(|s| s.timestamp_millis());

        let mut filters = String::from(" WHERE symbol = ?");
        let mut args: Vec<&dyn rusqlite::ToSql> = vec![&symbol];
        if let Some(exchange) = exchange.as_ref() {
            filters.push_str(" AND exchange = ?");
            args.push(exchange);
        }
        if let Some(since_ms) = since_ms.as_ref() {
            filters.push_str(" AND timestamp >= ?");
            args.push(since_ms);
        }

        let conn = self.conn.lock();
        match kind {
            AggKind::Average => {
                let sql = format!("SELECT AVG(average_price) FROM aggregated_prices{filters}");
                let value: Option<f64> = conn.query_row(&sql, &args[..], |row| row.get(0))?;
                Ok(value.map(|value| AggRow {
                    exchange: exchange.map(str::to_string),
                    value,
                }))
            }
            AggKind::Highest => {
                let sql = format!(
                    "SELECT exchange, max_price FROM aggregated_prices{filters}
                     ORDER BY max_price DESC LIMIT 1"
                );
                let row = conn
                    .query_row(&sql, &args[..], map_agg)
                    .optional()?;
                Ok(row)
            }
            AggKind::Lowest => {
                let sql = format!(
                    "SELECT exchange, min_price FROM aggregated_prices{filters}
                     ORDER BY min_price ASC LIMIT 1"
                );
                let row = conn
                    .query_row(&sql, &args[..], map_agg)
                    .optional()?;
                Ok(row)
            }
        }
    }

    /// Liveness probe for the health endpoint.
    pub fn ping(&self) -> Result<()> {
        self.conn
            .lock()
            .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .map(|_| ())
            .context("storage ping failed")
    }
}

fn map_latest(row: &rusqlite::Row<'_>) -> rusqlite::Result<LatestRow> {
    Ok(LatestRow {
        exchange: row.get(0)?,
        price: row.get(1)?,
        timestamp_ms: row.get(2)?,
    })
}

fn map_agg(row: &rusqlite::Row<'_>) -> rusqlite::Result<AggRow> {
    Ok(AggRow {
        exchange: Some(row.get(0)?),
        value: row.get(1)?,
    })
}
