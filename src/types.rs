// =============================================================================
// Shared types used across the trading core
// =============================================================================

use serde::{Deserialize, Serialize};

/// Long or short side of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// +1.0 for long, -1.0 for short. Multiplying by this turns a raw
    /// `(exit - entry)` price delta into a signed PnL contribution.
    pub fn direction(self) -> f64 {
        match self {
            Side::Long => 1.0,
            Side::Short => -1.0,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Long => write!(f, "long"),
            Side::Short => write!(f, "short"),
        }
    }
}

/// The kind of trade recorded in the append-only Trade log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeSignal {
    BuyToEnter,
    SellToEnter,
    ClosePosition,
    StopLoss,
    TakeProfit,
}

impl std::fmt::Display for TradeSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TradeSignal::BuyToEnter => "buy_to_enter",
            TradeSignal::SellToEnter => "sell_to_enter",
            TradeSignal::ClosePosition => "close_position",
            TradeSignal::StopLoss => "stop_loss",
            TradeSignal::TakeProfit => "take_profit",
        };
        write!(f, "{s}")
    }
}

/// Status of a recorded Trade row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeStatus {
    Success,
    Failed,
}

/// Role of a single Conversation entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationRole {
    System,
    User,
    Assistant,
}

/// Which pass of the trading cycle produced a Conversation entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleKind {
    Buy,
    Sell,
}

/// Whether the Decision Applier should route a fill through the real
/// exchange client or simulate it locally. The engine always starts in
/// `Demo` mode; switching to `Live` is an explicit operator action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionMode {
    Demo,
    Live,
}

impl Default for ExecutionMode {
    fn default() -> Self {
        Self::Demo
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Demo => write!(f, "Demo"),
            Self::Live => write!(f, "Live"),
        }
    }
}

/// Validate (and case-normalize) a kline interval string.
///
/// `1m` (minute) and `1M` (month) are distinct and must never be folded
/// together by a case-insensitive match.
pub fn is_valid_interval(interval: &str) -> bool {
    const INTERVALS: &[&str] = &[
        "1m", "3m", "5m", "15m", "30m", "1h", "2h", "4h", "6h", "8h", "12h", "1d", "3d", "1w",
        "1M",
    ];
    INTERVALS.contains(&interval)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_direction_signs() {
        assert_eq!(Side::Long.direction(), 1.0);
        assert_eq!(Side::Short.direction(), -1.0);
    }

    #[test]
    fn interval_case_sensitivity() {
        assert!(is_valid_interval("1m"));
        assert!(is_valid_interval("1M"));
        assert!(!is_valid_interval("1Min"));
        assert!(!is_valid_interval("1MM"));
    }

    #[test]
    fn trade_signal_display() {
        assert_eq!(TradeSignal::BuyToEnter.to_string(), "buy_to_enter");
        assert_eq!(TradeSignal::ClosePosition.to_string(), "close_position");
    }
}
