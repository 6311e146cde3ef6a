// =============================================================================
// Strategy Prompt Builder (C6) — pure LLM-input composer
// =============================================================================
//
// Loosely grounded on the teacher's `strategy.rs` `evaluate_symbol` shape
// (a pure function taking state plus a symbol and returning a decision
// artifact, no I/O); the actual prompt text is new since the teacher never
// talked to an LLM.
// =============================================================================

use crate::market::indicators::IndicatorSnapshot;
use crate::models::Model;
use crate::portfolio::{PortfolioSnapshot, Position};
use crate::types::CycleKind;

const DEFAULT_BUY_PROMPT: &str = "You manage a simulated USDT-margined futures portfolio. \
Given the market snapshot and your available cash, choose at most one symbol to open a new \
position in this cycle, or choose to hold. Respond with a structured decision.";

const DEFAULT_SELL_PROMPT: &str = "You manage a simulated USDT-margined futures portfolio. \
Given your open positions and their current prices, choose zero or more positions to close \
this cycle, or choose to hold. Respond with a structured decision.";

#[derive(Debug, Clone)]
pub struct MarketLine {
    pub symbol: String,
    pub price: f64,
    pub indicators: IndicatorSnapshot,
}

#[derive(Debug, Clone)]
pub struct RecentTrade {
    pub symbol: String,
    pub signal: String,
    pub pnl: f64,
}

#[derive(Debug, Clone)]
pub struct PromptInputs<'a> {
    pub model: &'a Model,
    pub portfolio: &'a PortfolioSnapshot,
    pub market: &'a [MarketLine],
    pub recent_trades: &'a [RecentTrade],
}

#[derive(Debug, Clone)]
pub struct BuiltPrompt {
    pub system_message: String,
    pub user_message: String,
    pub kind: CycleKind,
}

fn portfolio_block(portfolio: &PortfolioSnapshot) -> String {
    let mut lines = vec![format!(
        "Cash: {:.2}  Realized PnL: {:.2}  Unrealized PnL: {:.2}  Total value: {:.2}",
        portfolio.cash, portfolio.realized_pnl, portfolio.unrealized_pnl, portfolio.total_value
    )];
    if portfolio.positions.is_empty() {
        lines.push("No open positions.".to_string());
    } else {
        for p in &portfolio.positions {
            lines.push(position_line(p));
        }
    }
    lines.join("\n")
}

fn position_line(p: &Position) -> String {
    format!(
        "- {} {} qty={:.6} avgPrice={:.4} leverage={}x",
        p.symbol, p.side, p.qty, p.avg_price, p.leverage
    )
}

fn market_block(market: &[MarketLine]) -> String {
    if market.is_empty() {
        return "No market data available.".to_string();
    }
    market
        .iter()
        .map(|m| {
            format!(
                "- {} price={:.4} change24h={:?} ma5={:?} ma10={:?} ma20={:?}",
                m.symbol,
                m.price,
                m.indicators.change24h,
                m.indicators.ma.ma5,
                m.indicators.ma.ma10,
                m.indicators.ma.ma20,
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn trades_block(trades: &[RecentTrade]) -> String {
    if trades.is_empty() {
        return "No recent trades.".to_string();
    }
    trades
        .iter()
        .map(|t| format!("- {} {} pnl={:.2}", t.symbol, t.signal, t.pnl))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Build the buy-pass prompt. Caller must only invoke this when
/// `model.auto_buy_enabled` is true — a disabled pass is simply never built,
/// which is how the system avoids emitting a no-op cycle.
pub fn build_buy_prompt(inputs: &PromptInputs, resolved_leverage: u32) -> BuiltPrompt {
    let system_message = if inputs.model.buy_prompt.is_empty() {
        DEFAULT_BUY_PROMPT.to_string()
    } else {
        inputs.model.buy_prompt.clone()
    };

    let open_symbols: Vec<&MarketLine> = inputs
        .market
        .iter()
        .filter(|m| {
            !inputs
                .portfolio
                .positions
                .iter()
                .any(|p| p.symbol == m.symbol)
        })
        .collect();

    let batch_note = inputs
        .model
        .buy_batch_size
        .map(|n| format!("At most {n} new position(s) may be opened this cycle.\n"))
        .unwrap_or_default();

    let user_message = format!(
        "Resolved leverage for this cycle: {leverage}x\n{batch_note}\n\
Portfolio:\n{portfolio}\n\nCandidate symbols (no current position):\n{candidates}\n\nRecent trades:\n{trades}",
        leverage = resolved_leverage,
        batch_note = batch_note,
        portfolio = portfolio_block(inputs.portfolio),
        candidates = market_block(
            &open_symbols
                .into_iter()
                .cloned()
                .collect::<Vec<_>>()
        ),
        trades = trades_block(inputs.recent_trades),
    );

    BuiltPrompt {
        system_message,
        user_message,
        kind: CycleKind::Buy,
    }
}

/// Build the sell-pass prompt. Caller must only invoke this when
/// `model.auto_sell_enabled` is true, mirroring the buy pass.
pub fn build_sell_prompt(inputs: &PromptInputs) -> BuiltPrompt {
    let system_message = if inputs.model.sell_prompt.is_empty() {
        DEFAULT_SELL_PROMPT.to_string()
    } else {
        inputs.model.sell_prompt.clone()
    };

    let held: Vec<MarketLine> = inputs
        .portfolio
        .positions
        .iter()
        .filter_map(|p| {
            inputs
                .market
                .iter()
                .find(|m| m.symbol == p.symbol)
                .cloned()
        })
        .collect();

    let user_message = format!(
        "Portfolio:\n{portfolio}\n\nHeld symbols and current prices:\n{held}\n\nRecent trades:\n{trades}",
        portfolio = portfolio_block(inputs.portfolio),
        held = market_block(&held),
        trades = trades_block(inputs.recent_trades),
    );

    BuiltPrompt {
        system_message,
        user_message,
        kind: CycleKind::Sell,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::indicators::MovingAverages;
    use chrono::Utc;
    use uuid::Uuid;

    fn model() -> Model {
        Model::new("test", Uuid::new_v4(), "gpt-4o", 10_000.0)
    }

    fn empty_portfolio() -> PortfolioSnapshot {
        PortfolioSnapshot {
            model_id: "m1".into(),
            cash: 10_000.0,
            initial_capital: 10_000.0,
            realized_pnl: 0.0,
            unrealized_pnl: 0.0,
            total_value: 10_000.0,
            positions: vec![],
        }
    }

    #[test]
    fn buy_prompt_excludes_symbols_with_open_positions() {
        let mut portfolio = empty_portfolio();
        portfolio.positions.push(crate::portfolio::Position {
            symbol: "BTCUSDT".into(),
            side: crate::types::Side::Long,
            qty: 0.1,
            avg_price: 30_000.0,
            leverage: 10,
            opened_at: Utc::now(),
        });
        let market = vec![
            MarketLine {
                symbol: "BTCUSDT".into(),
                price: 31_000.0,
                indicators: IndicatorSnapshot {
                    change24h: Some(1.0),
                    ma: MovingAverages::default(),
                },
            },
            MarketLine {
                symbol: "ETHUSDT".into(),
                price: 2_000.0,
                indicators: IndicatorSnapshot {
                    change24h: Some(2.0),
                    ma: MovingAverages::default(),
                },
            },
        ];
        let model = model();
        let inputs = PromptInputs {
            model: &model,
            portfolio: &portfolio,
            market: &market,
            recent_trades: &[],
        };
        let prompt = build_buy_prompt(&inputs, 10);
        assert!(prompt.user_message.contains("ETHUSDT"));
        assert!(!prompt.user_message.contains("BTCUSDT"));
        assert_eq!(prompt.kind, CycleKind::Buy);
    }

    #[test]
    fn sell_prompt_only_lists_held_symbols() {
        let mut portfolio = empty_portfolio();
        portfolio.positions.push(crate::portfolio::Position {
            symbol: "BTCUSDT".into(),
            side: crate::types::Side::Long,
            qty: 0.1,
            avg_price: 30_000.0,
            leverage: 10,
            opened_at: Utc::now(),
        });
        let market = vec![MarketLine {
            symbol: "BTCUSDT".into(),
            price: 31_000.0,
            indicators: IndicatorSnapshot {
                change24h: Some(1.0),
                ma: MovingAverages::default(),
            },
        }];
        let model = model();
        let inputs = PromptInputs {
            model: &model,
            portfolio: &portfolio,
            market: &market,
            recent_trades: &[],
        };
        let prompt = build_sell_prompt(&inputs);
        assert!(prompt.user_message.contains("BTCUSDT"));
        assert_eq!(prompt.kind, CycleKind::Sell);
    }

    #[test]
    fn custom_prompt_overrides_default() {
        let mut model = model();
        model.buy_prompt = "custom buy prompt".to_string();
        let portfolio = empty_portfolio();
        let inputs = PromptInputs {
            model: &model,
            portfolio: &portfolio,
            market: &[],
            recent_trades: &[],
        };
        let prompt = build_buy_prompt(&inputs, 5);
        assert_eq!(prompt.system_message, "custom buy prompt");
    }
}
