// =============================================================================
// Decision Applier (C8) — validates and commits a parsed decision batch
// =============================================================================
//
// Grounded on the teacher's `execution.rs` `ExecutionEngine`: a struct that
// orchestrates its collaborators (here, the Portfolio Engine) behind a
// uniform outcome type, with every failure turned into a recorded row
// rather than aborting the batch — the same shape as `execution.rs`'s
// demo/live branching always producing a fill-or-rejection record.
// =============================================================================

use chrono::Utc;
use tracing::warn;
use uuid::Uuid;

use crate::llm::ParsedAction;
use crate::models::Model;
use crate::portfolio::{Decision, PortfolioEngine, TradeRecord};
use crate::types::{CycleKind, TradeSignal, TradeStatus};

/// Resolve the leverage to use for one `Open` this cycle. `0` is the
/// "unresolved" sentinel: a model pinned to a concrete leverage always uses
/// it; a model left at `0` defers to whatever the LLM proposed for this
/// action, and if the LLM proposed nothing either, the sentinel survives and
/// the caller must reject the action.
pub fn resolve_leverage(model_leverage: u32, llm_proposed: Option<u32>) -> u32 {
    if model_leverage != 0 {
        model_leverage
    } else {
        llm_proposed.unwrap_or(0)
    }
}

fn failed_trade(model_id: &str, symbol: &str, signal: TradeSignal, message: impl Into<String>) -> TradeRecord {
    TradeRecord {
        id: Uuid::new_v4(),
        model_id: model_id.to_string(),
        symbol: symbol.to_string(),
        signal,
        price: 0.0,
        quantity: 0.0,
        pnl: 0.0,
        fee: 0.0,
        status: TradeStatus::Failed,
        message: message.into(),
        timestamp: Utc::now(),
    }
}

fn open_signal(side: crate::types::Side) -> TradeSignal {
    match side {
        crate::types::Side::Long => TradeSignal::BuyToEnter,
        crate::types::Side::Short => TradeSignal::SellToEnter,
    }
}

/// Apply one pass's (buy or sell) decision list to a model's portfolio.
/// Each decision is attempted independently: a failure never aborts the
/// remaining decisions in the batch, matching §4.8. The buy pass additionally
/// enforces `buy_batch_size`: once that many `Open`s have been applied,
/// further `Open`s in the same batch are dropped and a single warning `Trade`
/// row records the truncation.
pub fn apply_batch(
    portfolio: &PortfolioEngine,
    model_id: &str,
    model: &Model,
    kind: CycleKind,
    actions: Vec<ParsedAction>,
    price_of: impl Fn(&str) -> Option<f64>,
) -> Vec<TradeRecord> {
    let mut trades = Vec::new();
    let mut opens_applied: u32 = 0;
    let mut truncated = 0u32;
    let batch_cap = match kind {
        CycleKind::Buy => model.buy_batch_size,
        CycleKind::Sell => None,
    };

    for action in actions {
        match action {
            ParsedAction::Hold => continue,
            ParsedAction::Open {
                symbol,
                side,
                qty,
                leverage,
            } => {
                if let Some(cap) = batch_cap {
                    if opens_applied >= cap {
                        truncated += 1;
                        continue;
                    }
                }

                let resolved_leverage = resolve_leverage(model.leverage, leverage);
                if resolved_leverage == 0 {
                    trades.push(failed_trade(
                        model_id,
                        &symbol,
                        open_signal(side),
                        "leverage unresolved: model leverage is 0 and the LLM proposed none",
                    ));
                    continue;
                }

                let price = price_of(&symbol);
                match portfolio.apply(
                    model_id,
                    Decision::Open {
                        symbol: symbol.clone(),
                        side,
                        qty,
                        leverage: resolved_leverage,
                    },
                    price,
                ) {
                    Ok(Some(trade)) => {
                        opens_applied += 1;
                        trades.push(trade);
                    }
                    Ok(None) => unreachable!("Open decisions always emit a Trade"),
                    Err(e) => trades.push(failed_trade(model_id, &symbol, open_signal(side), e.to_string())),
                }
            }
            ParsedAction::Close { symbol, side, qty } => {
                let price = price_of(&symbol);
                match portfolio.apply(model_id, Decision::Close { symbol: symbol.clone(), side, qty }, price) {
                    Ok(Some(trade)) => trades.push(trade),
                    Ok(None) => unreachable!("Close decisions always emit a Trade"),
                    Err(e) => trades.push(failed_trade(
                        model_id,
                        &symbol,
                        TradeSignal::ClosePosition,
                        e.to_string(),
                    )),
                }
            }
        }
    }

    if truncated > 0 {
        warn!(model_id, truncated, "buy batch size exceeded, excess opens dropped");
        trades.push(failed_trade(
            model_id,
            "-",
            TradeSignal::BuyToEnter,
            format!("buy batch size exceeded: {truncated} open action(s) dropped"),
        ));
    }

    trades
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::portfolio::TradingConfig;
    use crate::types::Side;
    use uuid::Uuid;

    fn model_with(leverage: u32, buy_batch_size: Option<u32>) -> Model {
        let mut m = Model::new("m", Uuid::new_v4(), "gpt-4o", 10_000.0);
        m.leverage = leverage;
        m.buy_batch_size = buy_batch_size;
        m
    }

    fn engine() -> PortfolioEngine {
        let engine = PortfolioEngine::new(0.001);
        engine.register(
            "m1",
            100_000.0,
            TradingConfig {
                max_positions: 10,
                leverage: 10,
                auto_buy_enabled: true,
                auto_sell_enabled: true,
            },
        );
        engine
    }

    #[test]
    fn resolve_leverage_prefers_model_pin() {
        assert_eq!(resolve_leverage(10, Some(5)), 10);
        assert_eq!(resolve_leverage(0, Some(5)), 5);
        assert_eq!(resolve_leverage(0, None), 0);
    }

    #[test]
    fn unresolved_leverage_yields_failed_trade_without_mutating_portfolio() {
        let engine = engine();
        let model = model_with(0, None);
        let actions = vec![ParsedAction::Open {
            symbol: "BTCUSDT".into(),
            side: Side::Long,
            qty: 0.1,
            leverage: None,
        }];
        let trades = apply_batch(&engine, "m1", &model, CycleKind::Buy, actions, |_| Some(100.0));
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].status, TradeStatus::Failed);
        assert!(trades[0].message.contains("unresolved"));
    }

    #[test]
    fn buy_batch_cap_truncates_and_emits_one_warning_row() {
        let engine = engine();
        let model = model_with(10, Some(1));
        let actions = vec![
            ParsedAction::Open {
                symbol: "AAAUSDT".into(),
                side: Side::Long,
                qty: 0.01,
                leverage: None,
            },
            ParsedAction::Open {
                symbol: "BBBUSDT".into(),
                side: Side::Long,
                qty: 0.01,
                leverage: None,
            },
            ParsedAction::Open {
                symbol: "CCCUSDT".into(),
                side: Side::Long,
                qty: 0.01,
                leverage: None,
            },
        ];
        let trades = apply_batch(&engine, "m1", &model, CycleKind::Buy, actions, |_| Some(100.0));
        // one success + one warning row
        assert_eq!(trades.len(), 2);
        assert_eq!(trades[0].status, TradeStatus::Success);
        assert!(trades[1].message.contains("batch size exceeded"));
    }

    #[test]
    fn one_failure_does_not_block_remaining_decisions_in_batch() {
        let engine = engine();
        let model = model_with(10, None);
        let actions = vec![
            ParsedAction::Close {
                symbol: "BTCUSDT".into(),
                side: Side::Long,
                qty: None,
            },
            ParsedAction::Open {
                symbol: "ETHUSDT".into(),
                side: Side::Long,
                qty: 0.1,
                leverage: None,
            },
        ];
        let trades = apply_batch(&engine, "m1", &model, CycleKind::Sell, actions, |_| Some(100.0));
        assert_eq!(trades.len(), 2);
        assert_eq!(trades[0].status, TradeStatus::Failed);
        assert_eq!(trades[1].status, TradeStatus::Success);
    }

    #[test]
    fn hold_action_emits_no_trade() {
        let engine = engine();
        let model = model_with(10, None);
        let trades = apply_batch(&engine, "m1", &model, CycleKind::Buy, vec![ParsedAction::Hold], |_| Some(100.0));
        assert!(trades.is_empty());
    }
}
