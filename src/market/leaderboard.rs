// =============================================================================
// Leaderboard Builder (C3) — gainers/losers, swap-pointer published snapshot
// =============================================================================
//
// No direct teacher analog; modeled on the teacher's `Arc<RwLock<T>>`
// rebuilt-wholesale-then-swapped pattern (the way `app_state.rs` republishes
// a whole snapshot rather than patching fields in place).
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::info;

use crate::bus::EventBus;
use crate::market::cache::MarketCache;

#[derive(Debug, Clone, Serialize)]
pub struct LeaderboardRow {
    pub rank: u32,
    pub symbol: String,
    pub contract_symbol: String,
    pub price: f64,
    pub change24h: f64,
    pub quote_volume: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LeaderboardSnapshot {
    pub gainers: Vec<LeaderboardRow>,
    pub losers: Vec<LeaderboardRow>,
}

fn build_rows(
    mut rows: Vec<(String, f64, f64, f64)>,
    min_volume: f64,
    limit: usize,
    descending: bool,
) -> Vec<LeaderboardRow> {
    rows.retain(|(_, _, _, volume)| *volume >= min_volume);
    if descending {
        rows.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));
    } else {
        rows.sort_by(|a, b| a.2.partial_cmp(&b.2).unwrap_or(std::cmp::Ordering::Equal));
    }
    rows.truncate(limit);
    rows.into_iter()
        .enumerate()
        .map(|(i, (symbol, price, change24h, quote_volume))| LeaderboardRow {
            rank: (i + 1) as u32,
            contract_symbol: format!("{symbol}.P"),
            symbol,
            price,
            change24h,
            quote_volume,
        })
        .collect()
}

/// Periodically rebuilds gainers/losers from the Market Cache's 24h stats
/// and atomically swaps the published snapshot in. Can be paused without
/// stopping the underlying ticker, so operators can throttle downstream
/// fan-out (WS broadcast, bus publish) without losing the last good read.
pub struct LeaderboardBuilder {
    min_volume: f64,
    limit: usize,
    published: RwLock<Arc<LeaderboardSnapshot>>,
    paused: AtomicBool,
}

impl LeaderboardBuilder {
    pub fn new(min_volume: f64, limit: usize) -> Self {
        Self {
            min_volume,
            limit,
            published: RwLock::new(Arc::new(LeaderboardSnapshot::default())),
            paused: AtomicBool::new(false),
        }
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> Arc<LeaderboardSnapshot> {
        self.published.read().clone()
    }

    /// One tick: scan the cache, rebuild, swap in, and (unless paused)
    /// publish `leaderboard:update` on the bus.
    pub fn tick(&self, cache: &MarketCache, bus: &EventBus) {
        let rows = cache.snapshot_24h();
        let gainers = build_rows(rows.clone(), self.min_volume, self.limit, true);
        let losers = build_rows(rows, self.min_volume, self.limit, false);
        let snapshot = Arc::new(LeaderboardSnapshot { gainers, losers });

        *self.published.write() = snapshot.clone();

        if self.is_paused() {
            return;
        }
        bus.publish(
            "leaderboard:update",
            serde_json::to_value(&*snapshot).unwrap_or(serde_json::Value::Null),
        );
        info!(
            gainers = snapshot.gainers.len(),
            losers = snapshot.losers.len(),
            "leaderboard rebuilt"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_rows_filters_by_min_volume_and_ranks_from_one() {
        let rows = vec![
            ("AAA".into(), 1.0, 10.0, 50.0),
            ("BBB".into(), 1.0, 20.0, 5_000.0),
            ("CCC".into(), 1.0, 5.0, 5_000.0),
        ];
        let gainers = build_rows(rows, 1_000.0, 10, true);
        assert_eq!(gainers.len(), 2);
        assert_eq!(gainers[0].symbol, "BBB");
        assert_eq!(gainers[0].rank, 1);
        assert_eq!(gainers[1].symbol, "CCC");
    }

    #[test]
    fn build_rows_truncates_to_limit() {
        let rows: Vec<_> = (0..10)
            .map(|i| (format!("S{i}"), 1.0, i as f64, 10_000.0))
            .collect();
        let gainers = build_rows(rows, 0.0, 3, true);
        assert_eq!(gainers.len(), 3);
    }

    #[test]
    fn paused_builder_still_swaps_snapshot_but_does_not_publish() {
        let cache = MarketCache::new();
        cache.update_price("BTCUSDT", 100.0, 1);
        cache.update_24h("BTCUSDT", 5.0, 10_000.0);
        let bus = EventBus::new();
        let lb = LeaderboardBuilder::new(0.0, 10);
        lb.pause();
        lb.tick(&cache, &bus);
        assert_eq!(lb.snapshot().gainers.len(), 1);
    }
}
