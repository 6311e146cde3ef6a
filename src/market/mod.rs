// =============================================================================
// Market module (C2 Market Cache, C3 Leaderboard Builder)
// =============================================================================

pub mod cache;
pub mod indicators;
pub mod leaderboard;

pub use cache::{LiveQuote, MarketCache, QuoteSource};
pub use indicators::{IndicatorSnapshot, MovingAverages};
pub use leaderboard::{LeaderboardBuilder, LeaderboardRow};
