use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};

/// Min/max/average over one aggregation bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggregateStats {
    pub min_price: f64,
    pub max_price: f64,
    pub avg_price: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickKind {
    Raw,
    Aggregate(AggregateStats),
}

/// A single price observation flowing through the pipeline.
///
/// Owned exclusively by whichever stage currently holds it; stages hand it
/// on by bounded-queue send.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceUpdate {
    pub exchange: String,
    pub symbol: String,
    pub price: f64,
    pub received_at: DateTime<Utc>,
    pub kind: TickKind,
}

impl PriceUpdate {
    /// A raw tick stamped with the ingestion time, not the feed's own clock.
    pub fn raw(exchange: String, symbol: String, price: f64) -> Self {
        Self {
            exchange,
            symbol,
            price,
            received_at: Utc::now(),
            kind: TickKind::Raw,
        }
    }

    pub fn is_raw(&self) -> bool {
        matches!(self.kind, TickKind::Raw)
    }
}

/// Ingestion source selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Live,
    Test,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Live => "live",
            Mode::Test => "test",
        }
    }
}

/// A named exchange feed endpoint.
#[derive(Debug, Clone)]
pub struct ExchangeEndpoint {
    pub name: String,
    pub addr: String,
}

/// Application configuration.
///
/// The exchange and symbol enumerations are configuration rather than
/// compile-time constants; validation at the API boundary reads these lists.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_path: String,
    pub cache_addr: String,
    pub cache_pool_size: usize,
    pub exchanges: Vec<ExchangeEndpoint>,
    pub symbols: Vec<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let port = env_or("PORT", "8080").parse().context("invalid PORT")?;

        let database_path = env_or("DATABASE_PATH", "./marketpulse.db");
        let cache_addr = env_or("CACHE_ADDR", "127.0.0.1:6379");
        let cache_pool_size = env_or("CACHE_POOL_SIZE", "50")
            .parse()
            .context("invalid CACHE_POOL_SIZE")?;

        let exchanges = parse_exchange_feeds(&env_or(
            "EXCHANGE_FEEDS",
            "binance=127.0.0.1:40101,coinbase=127.0.0.1:40102,kucoin=127.0.0.1:40103",
        ))?;

        let symbols = parse_symbols(&env_or(
            "SYMBOLS",
            "BTCUSDT,ETHUSDT,DOGEUSDT,SOLUSDT,TONUSDT",
        ))?;

        Ok(Self {
            port,
            database_path,
            cache_addr,
            cache_pool_size,
            exchanges,
            symbols,
        })
    }

    pub fn is_known_symbol(&self, symbol: &str) -> bool {
        self.symbols.iter().any(|s| s == symbol)
    }

    pub fn is_known_exchange(&self, exchange: &str) -> bool {
        self.exchanges.iter().any(|e| e.name == exchange)
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Parses `name=host:port` entries separated by commas.
fn parse_exchange_feeds(raw: &str) -> Result<Vec<ExchangeEndpoint>> {
    let mut endpoints = Vec::new();
    for entry in raw.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (name, addr) = entry.split_once('=').with_context(|| {
            format!("invalid EXCHANGE_FEEDS entry {entry:?}, expected name=host:port")
        })?;
        endpoints.push(ExchangeEndpoint {
            name: name.trim().to_string(),
            addr: addr.trim().to_string(),
        });
    }
    if endpoints.is_empty() {
        bail!("EXCHANGE_FEEDS must name at least one exchange");
    }
    Ok(endpoints)
}

fn parse_symbols(raw: &str) -> Result<Vec<String>> {
    let symbols: Vec<String> = raw
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if symbols.is_empty() {
        bail!("SYMBOLS must name at least one trading pair");
    }
    Ok(symbols)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            port: 8080,
            database_path: ":memory:".to_string(),
            cache_addr: "127.0.0.1:6379".to_string(),
            cache_pool_size: 2,
            exchanges: parse_exchange_feeds("binance=127.0.0.1:40101,coinbase=127.0.0.1:40102")
                .unwrap(),
            symbols: parse_symbols("BTCUSDT,ETHUSDT").unwrap(),
        }
    }

    #[test]
    fn parses_exchange_feeds() {
        let feeds = parse_exchange_feeds("binance=host1:40101, coinbase=host2:40102").unwrap();
        assert_eq!(feeds.len(), 2);
        assert_eq!(feeds[0].name, "binance");
        assert_eq!(feeds[0].addr, "host1:40101");
        assert_eq!(feeds[1].name, "coinbase");
    }

    #[test]
    fn rejects_malformed_exchange_feeds() {
        assert!(parse_exchange_feeds("binance:40101").is_err());
        assert!(parse_exchange_feeds("").is_err());
    }

    #[test]
    fn rejects_empty_symbols() {
        assert!(parse_symbols(" , ,").is_err());
    }

    #[test]
    fn validates_against_configured_enumerations() {
        let config = test_config();
        assert!(config.is_known_symbol("BTCUSDT"));
        assert!(!config.is_known_symbol("XRPUSDT"));
        assert!(config.is_known_exchange("coinbase"));
        assert!(!config.is_known_exchange("kraken"));
    }

    #[test]
    fn raw_tick_carries_ingestion_kind() {
        let tick = PriceUpdate::raw("binance".to_string(), "BTCUSDT".to_string(), 40000.0);
        assert!(tick.is_raw());
        assert_eq!(tick.price, 40000.0);
    }

    #[test]
    fn mode_labels() {
        assert_eq!(Mode::Live.as_str(), "live");
        assert_eq!(Mode::Test.as_str(), "test");
    }
}
