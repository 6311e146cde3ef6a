// =============================================================================
// Exchange Adapter (C1) — thin gateway to a futures venue
// =============================================================================

pub mod binance;

pub use binance::BinanceAdapter;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ExchangeError;

/// A single OHLCV bar.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KlineBar {
    pub open_time_ms: i64,
    pub close_time_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Latest traded price for a symbol.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TickerPrice {
    pub price: f64,
    pub ts_ms: i64,
}

/// 24h rolling statistics for a symbol.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Ticker24h {
    pub price_change_pct: f64,
    pub quote_volume: f64,
    pub high_price: f64,
    pub low_price: f64,
    pub open_price: f64,
    pub last_price: f64,
    pub count: u64,
}

/// Gateway to a futures exchange's public market-data surface. Order
/// placement is intentionally out of scope for this trait — the Decision
/// Applier (C8) only ever needs price discovery to size and value positions;
/// execution itself is simulated in `Demo` mode and is a pluggable side
/// effect in `Live` mode.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    async fn ticker_price(&self, symbol: &str) -> Result<TickerPrice, ExchangeError>;

    async fn ticker_24h(&self, symbol: &str) -> Result<Ticker24h, ExchangeError>;

    /// Fetch klines. When `start_ms`/`end_ms` are `None` the adapter computes
    /// them so that the still-open bar is included: `end_ms = now +
    /// one(interval)`, `start_ms = end_ms - limit * one(interval)`.
    async fn klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
    ) -> Result<Vec<KlineBar>, ExchangeError>;
}

/// Milliseconds spanned by one bar of the given interval, or `None` if the
/// interval string is not recognized.
pub fn interval_millis(interval: &str) -> Option<i64> {
    let (num_part, unit) = interval.split_at(interval.len() - 1);
    let n: i64 = num_part.parse().ok()?;
    let unit_ms = match unit {
        "m" if interval != "1M" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        "w" => 7 * 86_400_000,
        "M" => 30 * 86_400_000,
        _ => return None,
    };
    Some(n * unit_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_millis_minute_vs_month() {
        assert_eq!(interval_millis("1m"), Some(60_000));
        assert_eq!(interval_millis("1M"), Some(30 * 86_400_000));
        assert_ne!(interval_millis("1m"), interval_millis("1M"));
    }

    #[test]
    fn interval_millis_unknown_unit() {
        assert_eq!(interval_millis("1x"), None);
    }
}
