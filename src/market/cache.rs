// =============================================================================
// Market Cache (C2) — live quotes + bounded per-(symbol, interval) kline rings
// =============================================================================
//
// Generalizes the teacher's `market_data/candle_buffer.rs` `CandleBuffer`
// (single-symbol `RwLock<HashMap<Interval, VecDeque<Candle>>>`, trim-to-cap
// on insert) to many symbols, and adds the live-quote side and the
// at-most-one-in-flight-request bookkeeping the teacher didn't need with a
// single tracked pair.
// =============================================================================

use std::collections::{HashMap, HashSet, VecDeque};

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, warn};

use crate::exchange::KlineBar;

/// Minimum ring capacity: MA20 needs 20 closed bars plus the still-open one.
pub const MIN_RING_CAPACITY: usize = 21;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QuoteSource {
    /// Symbol is in the operator-configured watch set.
    Configured,
    /// Symbol is only tracked because some model currently holds a position in it.
    Position,
}

#[derive(Debug, Clone, Serialize)]
pub struct LiveQuote {
    pub symbol: String,
    pub price: Option<f64>,
    pub change24h: Option<f64>,
    pub quote_volume: Option<f64>,
    pub last_updated_ms: Option<i64>,
    pub source: QuoteSource,
}

impl LiveQuote {
    fn new(symbol: impl Into<String>, source: QuoteSource) -> Self {
        Self {
            symbol: symbol.into(),
            price: None,
            change24h: None,
            quote_volume: None,
            last_updated_ms: None,
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum InflightOp {
    Price,
    Ticker24h,
    Klines,
}

/// Shared cache of live quotes and kline rings, read by the Leaderboard
/// Builder, the Strategy Prompt Builder, and the REST/WS surfaces; written
/// only by the refresh loops spawned from `main.rs`.
#[derive(Debug, Default)]
pub struct MarketCache {
    quotes: RwLock<HashMap<String, LiveQuote>>,
    klines: RwLock<HashMap<(String, String), VecDeque<KlineBar>>>,
    inflight: RwLock<HashSet<(String, InflightOp)>>,
}

impl MarketCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ensure a symbol has a quote row, marking its source. Called once per
    /// configured symbol at startup, and again whenever a model opens a
    /// position in a symbol outside the configured set.
    pub fn ensure_tracked(&self, symbol: &str, source: QuoteSource) {
        let mut quotes = self.quotes.write();
        quotes
            .entry(symbol.to_string())
            .or_insert_with(|| LiveQuote::new(symbol, source));
    }

    pub fn tracked_symbols(&self) -> Vec<String> {
        self.quotes.read().keys().cloned().collect()
    }

    /// Try to reserve the (symbol, price) in-flight slot. Returns `false`
    /// (and the caller should skip this tick) if a previous request for the
    /// same pair has not completed yet.
    pub fn try_begin_price(&self, symbol: &str) -> bool {
        self.try_begin(symbol, InflightOp::Price)
    }

    pub fn end_price(&self, symbol: &str) {
        self.end(symbol, InflightOp::Price);
    }

    pub fn try_begin_ticker_24h(&self, symbol: &str) -> bool {
        self.try_begin(symbol, InflightOp::Ticker24h)
    }

    pub fn end_ticker_24h(&self, symbol: &str) {
        self.end(symbol, InflightOp::Ticker24h);
    }

    pub fn try_begin_klines(&self, symbol: &str) -> bool {
        self.try_begin(symbol, InflightOp::Klines)
    }

    pub fn end_klines(&self, symbol: &str) {
        self.end(symbol, InflightOp::Klines);
    }

    fn try_begin(&self, symbol: &str, op: InflightOp) -> bool {
        let mut inflight = self.inflight.write();
        let key = (symbol.to_string(), op);
        if inflight.contains(&key) {
            debug!(symbol, ?op, "skipping tick, request already in flight");
            false
        } else {
            inflight.insert(key);
            true
        }
    }

    fn end(&self, symbol: &str, op: InflightOp) {
        self.inflight.write().remove(&(symbol.to_string(), op));
    }

    /// Apply a fresh price read. Per-symbol failures never poison the cache:
    /// callers simply don't call this on error, leaving the prior value.
    pub fn update_price(&self, symbol: &str, price: f64, ts_ms: i64) {
        let mut quotes = self.quotes.write();
        let q = quotes
            .entry(symbol.to_string())
            .or_insert_with(|| LiveQuote::new(symbol, QuoteSource::Configured));
        q.price = Some(price);
        q.last_updated_ms = Some(ts_ms);
    }

    pub fn update_24h(&self, symbol: &str, change24h: f64, quote_volume: f64) {
        let mut quotes = self.quotes.write();
        let q = quotes
            .entry(symbol.to_string())
            .or_insert_with(|| LiveQuote::new(symbol, QuoteSource::Configured));
        q.change24h = Some(change24h);
        q.quote_volume = Some(quote_volume);
    }

    /// Replace the kline ring for `(symbol, interval)` with freshly fetched
    /// bars, keeping only the most recent `cap` entries.
    pub fn put_klines(&self, symbol: &str, interval: &str, mut bars: Vec<KlineBar>, cap: usize) {
        let cap = cap.max(MIN_RING_CAPACITY);
        bars.sort_by_key(|b| b.open_time_ms);
        let mut ring: VecDeque<KlineBar> = bars.into();
        while ring.len() > cap {
            ring.pop_front();
        }
        let n = ring.len();
        self.klines
            .write()
            .insert((symbol.to_string(), interval.to_string()), ring);
        debug!(symbol, interval, bars = n, "klines cached");
    }

    pub fn klines(&self, symbol: &str, interval: &str) -> Vec<KlineBar> {
        self.klines
            .read()
            .get(&(symbol.to_string(), interval.to_string()))
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Latest close price for a symbol, or `None` if it has never successfully
    /// refreshed.
    pub fn price(&self, symbol: &str) -> Option<f64> {
        self.quotes.read().get(symbol).and_then(|q| q.price)
    }

    pub fn quote(&self, symbol: &str) -> Option<LiveQuote> {
        self.quotes.read().get(symbol).cloned()
    }

    /// `getSnapshot()` — one row per tracked symbol, in insertion-independent
    /// (HashMap) order.
    pub fn snapshot(&self) -> Vec<LiveQuote> {
        self.quotes.read().values().cloned().collect()
    }

    /// All `(symbol, change24h, quoteVolume)` triples with both 24h fields
    /// present, for the Leaderboard Builder.
    pub fn snapshot_24h(&self) -> Vec<(String, f64, f64, f64)> {
        self.quotes
            .read()
            .values()
            .filter_map(|q| match (q.price, q.change24h, q.quote_volume) {
                (Some(price), Some(change), Some(volume)) => {
                    Some((q.symbol.clone(), price, change, volume))
                }
                _ => None,
            })
            .collect()
    }
}

pub fn warn_if_never_priced(cache: &MarketCache, symbol: &str) {
    if cache.price(symbol).is_none() {
        warn!(symbol, "symbol has never successfully priced");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(open_time_ms: i64, close: f64) -> KlineBar {
        KlineBar {
            open_time_ms,
            close_time_ms: open_time_ms + 59_999,
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
        }
    }

    #[test]
    fn ensure_tracked_is_idempotent_and_keeps_first_source() {
        let cache = MarketCache::new();
        cache.ensure_tracked("BTCUSDT", QuoteSource::Configured);
        cache.ensure_tracked("BTCUSDT", QuoteSource::Position);
        let q = cache.quote("BTCUSDT").unwrap();
        assert_eq!(q.source, QuoteSource::Configured);
    }

    #[test]
    fn update_price_retains_prior_value_on_missing_update() {
        let cache = MarketCache::new();
        cache.update_price("BTCUSDT", 100.0, 1_000);
        assert_eq!(cache.price("BTCUSDT"), Some(100.0));
        // a failed refresh simply never calls update_price again
        assert_eq!(cache.price("BTCUSDT"), Some(100.0));
    }

    #[test]
    fn unknown_symbol_has_no_price() {
        let cache = MarketCache::new();
        assert_eq!(cache.price("DOESNOTEXIST"), None);
    }

    #[test]
    fn put_klines_trims_to_capacity_and_sorts() {
        let cache = MarketCache::new();
        let bars: Vec<_> = (0..30).rev().map(|i| bar(i * 60_000, i as f64)).collect();
        cache.put_klines("BTCUSDT", "1m", bars, MIN_RING_CAPACITY);
        let ring = cache.klines("BTCUSDT", "1m");
        assert_eq!(ring.len(), MIN_RING_CAPACITY);
        assert!(ring.windows(2).all(|w| w[0].open_time_ms < w[1].open_time_ms));
    }

    #[test]
    fn inflight_guard_prevents_double_reservation() {
        let cache = MarketCache::new();
        assert!(cache.try_begin_price("BTCUSDT"));
        assert!(!cache.try_begin_price("BTCUSDT"));
        cache.end_price("BTCUSDT");
        assert!(cache.try_begin_price("BTCUSDT"));
    }

    #[test]
    fn snapshot_24h_only_includes_fully_priced_symbols() {
        let cache = MarketCache::new();
        cache.update_price("BTCUSDT", 100.0, 1);
        cache.update_24h("BTCUSDT", 2.5, 1_000_000.0);
        cache.ensure_tracked("ETHUSDT", QuoteSource::Configured);
        let rows = cache.snapshot_24h();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, "BTCUSDT");
    }
}
