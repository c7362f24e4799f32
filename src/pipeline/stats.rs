//! Per-symbol aggregation buckets.

use chrono::Utc;

use crate::models::{AggregateStats, PriceUpdate, TickKind};

/// Bucket fills to this size before a size-triggered aggregate is emitted.
pub const BUCKET_SIZE: usize = 5;

/// Running bucket for one exchange × symbol, owned by one worker shard and
/// serialized by its lock.
#[derive(Debug, Default)]
pub struct SymbolStats {
    prices: Vec<f64>,
    last_tick: Option<PriceUpdate>,
}

impl SymbolStats {
    /// Appends a raw tick. Returns the aggregate when the bucket fills.
    pub fn record(&mut self, tick: &PriceUpdate) -> Option<PriceUpdate> {
        self.prices.push(tick.price);
        self.last_tick = Some(tick.clone());
        if self.prices.len() >= BUCKET_SIZE {
            self.drain()
        } else {
            None
        }
    }

    /// Aggregates whatever the bucket holds and resets it; `None` when the
    /// bucket is empty.
    pub fn drain(&mut self) -> Option<PriceUpdate> {
        let last = self.last_tick.as_ref()?;
        if self.prices.is_empty() {
            return None;
        }
        let agg = aggregate(&self.prices, &last.exchange, &last.symbol);
        self.prices.clear();
        Some(agg)
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }
}

/// Min/max/mean over a non-empty price slice, stamped with the emission
/// time rather than the last sample's time.
fn aggregate(prices: &[f64], exchange: &str, symbol: &str) -> PriceUpdate {
    let mut min = prices[0];
    let mut max = prices[0];
    let mut sum = 0.0;
    for &price in prices {
        if price < min {
            min = price;
        }
        if price > max {
            max = price;
        }
        sum += price;
    }
    let avg = sum / prices.len() as f64;

    PriceUpdate {
        exchange: exchange.to_string(),
        symbol: symbol.to_string(),
        price: 0.0,
        received_at: Utc::now(),
        kind: TickKind::Aggregate(AggregateStats {
            min_price: min,
            max_price: max,
            avg_price: avg,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(price: f64) -> PriceUpdate {
        PriceUpdate::raw("binance".to_string(), "ETHUSDT".to_string(), price)
    }

    fn stats_of(update: &PriceUpdate) -> &AggregateStats {
        match &update.kind {
            TickKind::Aggregate(stats) => stats,
            TickKind::Raw => panic!("expected an aggregate"),
        }
    }

    #[test]
    fn fifth_sample_emits_and_resets() {
        let mut bucket = SymbolStats::default();
        for price in [100.0, 200.0, 150.0, 50.0] {
            assert!(bucket.record(&raw(price)).is_none());
        }
        let agg = bucket.record(&raw(300.0)).expect("bucket should emit at five samples");
        let stats = stats_of(&agg);
        assert_eq!(stats.min_price, 50.0);
        assert_eq!(stats.max_price, 300.0);
        assert_eq!(stats.avg_price, 160.0);
        assert!(bucket.is_empty());

        // Nothing further until a new sample arrives.
        assert!(bucket.drain().is_none());
    }

    #[test]
    fn min_avg_max_ordering_holds() {
        let mut bucket = SymbolStats::default();
        for price in [3.0, 1.0, 4.0, 1.0, 5.0] {
            if let Some(agg) = bucket.record(&raw(price)) {
                let stats = stats_of(&agg);
                assert!(stats.min_price <= stats.avg_price);
                assert!(stats.avg_price <= stats.max_price);
            }
        }
    }

    #[test]
    fn single_sample_flush_collapses_to_that_sample() {
        let mut bucket = SymbolStats::default();
        assert!(bucket.record(&raw(10.5)).is_none());
        let agg = bucket.drain().expect("one-sample bucket should flush");
        let stats = stats_of(&agg);
        assert_eq!(stats.min_price, 10.5);
        assert_eq!(stats.max_price, 10.5);
        assert_eq!(stats.avg_price, 10.5);
    }

    #[test]
    fn empty_bucket_never_flushes() {
        let mut bucket = SymbolStats::default();
        assert!(bucket.drain().is_none());

        // Also after an emission has drained it.
        for price in [1.0, 2.0, 3.0, 4.0, 5.0] {
            bucket.record(&raw(price));
        }
        assert!(bucket.drain().is_none());
    }

    #[test]
    fn aggregate_carries_the_bucket_identity() {
        let mut bucket = SymbolStats::default();
        bucket.record(&raw(42.0));
        let agg = bucket.drain().unwrap();
        assert_eq!(agg.exchange, "binance");
        assert_eq!(agg.symbol, "ETHUSDT");
        assert!(!agg.is_raw());
    }
}
