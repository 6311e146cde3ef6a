// =============================================================================
// Portfolio Engine (C5) — per-model accounting, pure state machine
// =============================================================================
//
// Grounded on the teacher's `position_engine.rs` (`PositionManager` holding
// `RwLock<Vec<Position>>`, open/close methods, a `Debug` impl that summarizes
// counts rather than dumping every row) and `risk.rs` (an `Inner`-behind-
// `RwLock` struct carrying per-account accounting state, with a `can_trade`
// precheck before any mutation lands). The leverage/margin math itself is
// new business logic, but the error-enum-then-precheck shape comes straight
// from `risk.rs`.
// =============================================================================

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::ApplyError;
use crate::types::{Side, TradeSignal, TradeStatus};

const MIN_LEVERAGE: u32 = 1;
const MAX_LEVERAGE: u32 = 125;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    pub avg_price: f64,
    pub leverage: u32,
    pub opened_at: chrono::DateTime<Utc>,
}

impl Position {
    /// Margin currently posted for this position, i.e. what re-enters cash
    /// if the whole position is closed at any price.
    fn posted_margin(&self) -> f64 {
        self.qty * self.avg_price / self.leverage as f64
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Portfolio {
    pub model_id: String,
    pub cash: f64,
    pub initial_capital: f64,
    pub realized_pnl: f64,
    pub positions: Vec<Position>,
}

impl Portfolio {
    fn new(model_id: impl Into<String>, initial_capital: f64) -> Self {
        Self {
            model_id: model_id.into(),
            cash: initial_capital,
            initial_capital,
            realized_pnl: 0.0,
            positions: Vec::new(),
        }
    }

    fn find(&self, symbol: &str, side: Side) -> Option<usize> {
        self.positions
            .iter()
            .position(|p| p.symbol == symbol && p.side == side)
    }
}

/// Per-model trading flags. Portfolio Engine owns the subset of Model fields
/// that gate or size its own mutations; everything else (display name,
/// provider, prompts) lives on the `Model` record in `src/models.rs`.
#[derive(Debug, Clone, Copy)]
pub struct TradingConfig {
    pub max_positions: u32,
    /// `0` means "resolve per cycle"; by the time it reaches `apply` it must
    /// already be a concrete value in `[1, 125]`.
    pub leverage: u32,
    pub auto_buy_enabled: bool,
    pub auto_sell_enabled: bool,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            max_positions: 5,
            leverage: 10,
            auto_buy_enabled: true,
            auto_sell_enabled: true,
        }
    }
}

struct Account {
    portfolio: Portfolio,
    config: TradingConfig,
}

/// A decision to apply to one model's portfolio. `leverage` in `Open` must
/// already be resolved (never `0`) — that resolution happens upstream in the
/// Decision Applier before the decision reaches here.
#[derive(Debug, Clone)]
pub enum Decision {
    Open {
        symbol: String,
        side: Side,
        qty: f64,
        leverage: u32,
    },
    Close {
        symbol: String,
        side: Side,
        qty: Option<f64>,
    },
    Adjust(AdjustFields),
}

#[derive(Debug, Clone, Default)]
pub struct AdjustFields {
    pub max_positions: Option<u32>,
    pub leverage: Option<u32>,
    pub auto_buy_enabled: Option<bool>,
    pub auto_sell_enabled: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TradeRecord {
    pub id: Uuid,
    pub model_id: String,
    pub symbol: String,
    pub signal: TradeSignal,
    pub price: f64,
    pub quantity: f64,
    pub pnl: f64,
    pub fee: f64,
    pub status: TradeStatus,
    pub message: String,
    pub timestamp: chrono::DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PortfolioSnapshot {
    pub model_id: String,
    pub cash: f64,
    pub initial_capital: f64,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub total_value: f64,
    pub positions: Vec<Position>,
}

fn make_trade(
    model_id: &str,
    symbol: &str,
    signal: TradeSignal,
    price: f64,
    quantity: f64,
    pnl: f64,
    fee: f64,
    message: impl Into<String>,
) -> TradeRecord {
    TradeRecord {
        id: Uuid::new_v4(),
        model_id: model_id.to_string(),
        symbol: symbol.to_string(),
        signal,
        price,
        quantity,
        pnl,
        fee,
        status: TradeStatus::Success,
        message: message.into(),
        timestamp: Utc::now(),
    }
}

/// Owns every model's portfolio and trading config. All mutation is
/// single-writer-per-model by construction: the Per-Model Scheduler (C9)
/// holds a `tokio::sync::Mutex<()>` per model and only ever calls `apply`
/// from within that lock, so the internal `RwLock` here only needs to
/// protect against concurrent *reads* racing a write, never writer-writer
/// races.
#[derive(Default)]
pub struct PortfolioEngine {
    accounts: RwLock<HashMap<String, Account>>,
    fee_rate: RwLock<f64>,
}

impl PortfolioEngine {
    pub fn new(fee_rate: f64) -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            fee_rate: RwLock::new(fee_rate),
        }
    }

    pub fn set_fee_rate(&self, fee_rate: f64) {
        *self.fee_rate.write() = fee_rate;
    }

    fn fee_rate(&self) -> f64 {
        *self.fee_rate.read()
    }

    /// Register a model, seeding a fresh portfolio. No-op if already present
    /// (so restart recovery can call this unconditionally before replaying
    /// trades).
    pub fn register(&self, model_id: &str, initial_capital: f64, config: TradingConfig) {
        let mut accounts = self.accounts.write();
        accounts.entry(model_id.to_string()).or_insert_with(|| Account {
            portfolio: Portfolio::new(model_id, initial_capital),
            config,
        });
    }

    pub fn unregister(&self, model_id: &str) {
        self.accounts.write().remove(model_id);
    }

    pub fn config(&self, model_id: &str) -> Option<TradingConfig> {
        self.accounts.read().get(model_id).map(|a| a.config)
    }

    /// Pure read. `price_of` supplies the latest Market Cache price per
    /// symbol; symbols with no price contribute zero unrealized PnL rather
    /// than failing the whole snapshot.
    pub fn snapshot(
        &self,
        model_id: &str,
        price_of: impl Fn(&str) -> Option<f64>,
    ) -> Option<PortfolioSnapshot> {
        let accounts = self.accounts.read();
        let account = accounts.get(model_id)?;
        let portfolio = &account.portfolio;

        let unrealized_pnl: f64 = portfolio
            .positions
            .iter()
            .map(|p| {
                price_of(&p.symbol)
                    .map(|price| (price - p.avg_price) * p.qty * p.side.direction())
                    .unwrap_or(0.0)
            })
            .sum();

        let position_value: f64 = portfolio
            .positions
            .iter()
            .map(|p| p.posted_margin())
            .sum::<f64>()
            + unrealized_pnl;

        Some(PortfolioSnapshot {
            model_id: model_id.to_string(),
            cash: portfolio.cash,
            initial_capital: portfolio.initial_capital,
            realized_pnl: portfolio.realized_pnl,
            unrealized_pnl,
            total_value: portfolio.cash + position_value,
            positions: portfolio.positions.clone(),
        })
    }

    fn flag_for(side: Side, config: &TradingConfig) -> bool {
        match side {
            Side::Long => config.auto_buy_enabled,
            Side::Short => config.auto_sell_enabled,
        }
    }

    /// Commit a decision. `current_price` is the Market Cache's latest price
    /// for the decision's symbol, looked up by the caller (C8) so this
    /// function stays a pure state machine over explicit inputs. Returns
    /// `None` for `Adjust` (it emits no Trade).
    pub fn apply(
        &self,
        model_id: &str,
        decision: Decision,
        current_price: Option<f64>,
    ) -> Result<Option<TradeRecord>, ApplyError> {
        let fee_rate = self.fee_rate();
        let mut accounts = self.accounts.write();
        let account = accounts
            .get_mut(model_id)
            .ok_or_else(|| ApplyError::UnknownSymbol("<no such model>".to_string()))?;

        match decision {
            Decision::Open {
                symbol,
                side,
                qty,
                leverage,
            } => Self::apply_open(account, model_id, &symbol, side, qty, leverage, current_price, fee_rate)
                .map(Some),
            Decision::Close { symbol, side, qty } => {
                Self::apply_close(account, model_id, &symbol, side, qty, current_price, fee_rate).map(Some)
            }
            Decision::Adjust(fields) => {
                Self::apply_adjust(account, fields);
                Ok(None)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_open(
        account: &mut Account,
        model_id: &str,
        symbol: &str,
        side: Side,
        qty: f64,
        leverage: u32,
        current_price: Option<f64>,
        fee_rate: f64,
    ) -> Result<TradeRecord, ApplyError> {
        if !Self::flag_for(side, &account.config) {
            return Err(ApplyError::Disabled);
        }
        if !(qty > 0.0) {
            return Err(ApplyError::BadQuantity);
        }
        if leverage < MIN_LEVERAGE || leverage > MAX_LEVERAGE {
            return Err(ApplyError::Overleveraged(leverage));
        }
        let price = current_price.ok_or_else(|| ApplyError::UnknownSymbol(symbol.to_string()))?;

        let existing = account.portfolio.find(symbol, side);
        if existing.is_none() && account.portfolio.positions.len() as u32 >= account.config.max_positions
        {
            return Err(ApplyError::MaxPositionsReached(account.config.max_positions));
        }

        let notional = qty * price;
        let fee = notional * fee_rate;
        let margin = notional / leverage as f64;
        let needed = margin + fee;
        if needed > account.portfolio.cash {
            return Err(ApplyError::InsufficientMargin {
                needed,
                available: account.portfolio.cash,
            });
        }

        account.portfolio.cash -= needed;
        // Open fee is realized immediately, not deferred to the matching close,
        // or totalValue == initialCapital + realizedPnl + unrealizedPnl breaks
        // the instant a position opens.
        account.portfolio.realized_pnl -= fee;
        match existing {
            Some(idx) => {
                let pos = &mut account.portfolio.positions[idx];
                let total_qty = pos.qty + qty;
                pos.avg_price = (pos.avg_price * pos.qty + price * qty) / total_qty;
                pos.qty = total_qty;
                pos.leverage = leverage;
            }
            None => {
                account.portfolio.positions.push(Position {
                    symbol: symbol.to_string(),
                    side,
                    qty,
                    avg_price: price,
                    leverage,
                    opened_at: Utc::now(),
                });
            }
        }

        let signal = match side {
            Side::Long => TradeSignal::BuyToEnter,
            Side::Short => TradeSignal::SellToEnter,
        };
        info!(model_id, symbol, %side, qty, leverage, "position opened");
        Ok(make_trade(
            model_id, symbol, signal, price, qty, 0.0, fee, "opened",
        ))
    }

    fn apply_close(
        account: &mut Account,
        model_id: &str,
        symbol: &str,
        side: Side,
        qty: Option<f64>,
        current_price: Option<f64>,
        fee_rate: f64,
    ) -> Result<TradeRecord, ApplyError> {
        if !Self::flag_for(side, &account.config) {
            return Err(ApplyError::Disabled);
        }
        let idx = account.portfolio.find(symbol, side).ok_or_else(|| {
            ApplyError::NoSuchPosition {
                symbol: symbol.to_string(),
                side: side.to_string(),
            }
        })?;
        let price = current_price.ok_or_else(|| ApplyError::UnknownSymbol(symbol.to_string()))?;

        let pos = account.portfolio.positions[idx].clone();
        let close_qty = qty.unwrap_or(pos.qty).min(pos.qty);
        if !(close_qty > 0.0) {
            return Err(ApplyError::BadQuantity);
        }

        let fraction = close_qty / pos.qty;
        let margin_returned = pos.posted_margin() * fraction;
        let gross_pnl = (price - pos.avg_price) * close_qty * side.direction();
        let fee = close_qty * price * fee_rate;
        let net_pnl = gross_pnl - fee;

        account.portfolio.cash += margin_returned + net_pnl;
        account.portfolio.realized_pnl += net_pnl;

        let remaining = pos.qty - close_qty;
        if remaining <= f64::EPSILON {
            account.portfolio.positions.remove(idx);
        } else {
            account.portfolio.positions[idx].qty = remaining;
        }

        info!(model_id, symbol, %side, close_qty, net_pnl, "position closed");
        Ok(make_trade(
            model_id,
            symbol,
            TradeSignal::ClosePosition,
            price,
            close_qty,
            net_pnl,
            fee,
            "closed",
        ))
    }

    fn apply_adjust(account: &mut Account, fields: AdjustFields) {
        if let Some(v) = fields.max_positions {
            account.config.max_positions = v;
        }
        if let Some(v) = fields.leverage {
            account.config.leverage = v;
        }
        if let Some(v) = fields.auto_buy_enabled {
            account.config.auto_buy_enabled = v;
        }
        if let Some(v) = fields.auto_sell_enabled {
            account.config.auto_sell_enabled = v;
        }
        warn!("portfolio config adjusted");
    }

    /// Force-close every open position at `price_of`, used only by restart
    /// recovery to materialize a trade-log replay into live state without
    /// going through the validation gates meant for live decisions.
    pub fn replay_open(&self, model_id: &str, position: Position) {
        let mut accounts = self.accounts.write();
        if let Some(account) = accounts.get_mut(model_id) {
            account.portfolio.positions.push(position);
        }
    }

    pub fn set_cash(&self, model_id: &str, cash: f64, realized_pnl: f64) {
        let mut accounts = self.accounts.write();
        if let Some(account) = accounts.get_mut(model_id) {
            account.portfolio.cash = cash;
            account.portfolio.realized_pnl = realized_pnl;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_with_model(cash: f64) -> PortfolioEngine {
        let engine = PortfolioEngine::new(0.001);
        engine.register(
            "m1",
            cash,
            TradingConfig {
                max_positions: 5,
                leverage: 10,
                auto_buy_enabled: true,
                auto_sell_enabled: true,
            },
        );
        engine
    }

    // Scenario S1.
    #[test]
    fn s1_open_long_debits_margin_and_fee() {
        let engine = engine_with_model(10_000.0);
        let trade = engine
            .apply(
                "m1",
                Decision::Open {
                    symbol: "BTCUSDT".into(),
                    side: Side::Long,
                    qty: 0.1,
                    leverage: 10,
                },
                Some(30_000.0),
            )
            .unwrap()
            .unwrap();
        assert_eq!(trade.signal, TradeSignal::BuyToEnter);
        assert!((trade.fee - 3.0).abs() < 1e-9);

        let snap = engine.snapshot("m1", |_| Some(30_000.0)).unwrap();
        assert!((snap.cash - 9_697.0).abs() < 1e-9);
        assert_eq!(snap.positions.len(), 1);
    }

    // Scenario S2, continuing S1.
    #[test]
    fn s2_close_long_credits_margin_plus_pnl_minus_fee() {
        let engine = engine_with_model(10_000.0);
        engine
            .apply(
                "m1",
                Decision::Open {
                    symbol: "BTCUSDT".into(),
                    side: Side::Long,
                    qty: 0.1,
                    leverage: 10,
                },
                Some(30_000.0),
            )
            .unwrap();

        let snap_mid = engine.snapshot("m1", |_| Some(31_000.0)).unwrap();
        assert!((snap_mid.unrealized_pnl - 100.0).abs() < 1e-9);

        let trade = engine
            .apply(
                "m1",
                Decision::Close {
                    symbol: "BTCUSDT".into(),
                    side: Side::Long,
                    qty: None,
                },
                Some(31_000.0),
            )
            .unwrap()
            .unwrap();
        assert!((trade.pnl - 96.9).abs() < 1e-6);

        let snap = engine.snapshot("m1", |_| Some(31_000.0)).unwrap();
        assert!((snap.cash - 10_093.9).abs() < 1e-6);
        assert!(snap.positions.is_empty());
        // 96.9 net close pnl minus the 3.0 open fee realized at S1.
        assert!((snap.realized_pnl - 93.9).abs() < 1e-6);
    }

    // Scenario S3.
    #[test]
    fn s3_max_positions_rejects_without_mutating_state() {
        let engine = PortfolioEngine::new(0.001);
        engine.register(
            "m1",
            10_000.0,
            TradingConfig {
                max_positions: 2,
                leverage: 10,
                auto_buy_enabled: true,
                auto_sell_enabled: true,
            },
        );
        engine
            .apply(
                "m1",
                Decision::Open {
                    symbol: "AAAUSDT".into(),
                    side: Side::Long,
                    qty: 0.01,
                    leverage: 10,
                },
                Some(100.0),
            )
            .unwrap();
        engine
            .apply(
                "m1",
                Decision::Open {
                    symbol: "BBBUSDT".into(),
                    side: Side::Long,
                    qty: 0.01,
                    leverage: 10,
                },
                Some(100.0),
            )
            .unwrap();

        let cash_before = engine.snapshot("m1", |_| Some(100.0)).unwrap().cash;
        let err = engine
            .apply(
                "m1",
                Decision::Open {
                    symbol: "CCCUSDT".into(),
                    side: Side::Long,
                    qty: 0.01,
                    leverage: 10,
                },
                Some(100.0),
            )
            .unwrap_err();
        assert_eq!(err, ApplyError::MaxPositionsReached(2));
        let cash_after = engine.snapshot("m1", |_| Some(100.0)).unwrap().cash;
        assert_eq!(cash_before, cash_after);
    }

    #[test]
    fn open_then_close_at_same_price_yields_negative_double_fee() {
        let engine = engine_with_model(10_000.0);
        engine
            .apply(
                "m1",
                Decision::Open {
                    symbol: "BTCUSDT".into(),
                    side: Side::Long,
                    qty: 1.0,
                    leverage: 1,
                },
                Some(100.0),
            )
            .unwrap();
        let fee_open = 100.0 * 0.001;
        let trade = engine
            .apply(
                "m1",
                Decision::Close {
                    symbol: "BTCUSDT".into(),
                    side: Side::Long,
                    qty: None,
                },
                Some(100.0),
            )
            .unwrap()
            .unwrap();
        let fee_close = 100.0 * 0.001;
        let snap = engine.snapshot("m1", |_| Some(100.0)).unwrap();
        assert!(snap.positions.is_empty());
        assert!((snap.realized_pnl - (-(fee_open + fee_close))).abs() < 1e-9);
        // Net trade pnl at an unchanged price is just the close fee, negative.
        assert!((trade.pnl - (-fee_close)).abs() < 1e-9);
    }

    #[test]
    fn disabled_auto_buy_rejects_open_without_mutation() {
        let engine = PortfolioEngine::new(0.001);
        engine.register(
            "m1",
            1_000.0,
            TradingConfig {
                max_positions: 5,
                leverage: 10,
                auto_buy_enabled: false,
                auto_sell_enabled: true,
            },
        );
        let err = engine
            .apply(
                "m1",
                Decision::Open {
                    symbol: "BTCUSDT".into(),
                    side: Side::Long,
                    qty: 1.0,
                    leverage: 10,
                },
                Some(100.0),
            )
            .unwrap_err();
        assert_eq!(err, ApplyError::Disabled);
    }

    #[test]
    fn insufficient_margin_is_rejected() {
        let engine = engine_with_model(100.0);
        let err = engine
            .apply(
                "m1",
                Decision::Open {
                    symbol: "BTCUSDT".into(),
                    side: Side::Long,
                    qty: 10.0,
                    leverage: 1,
                },
                Some(30_000.0),
            )
            .unwrap_err();
        matches!(err, ApplyError::InsufficientMargin { .. });
    }

    #[test]
    fn overleveraged_is_rejected() {
        let engine = engine_with_model(10_000.0);
        let err = engine
            .apply(
                "m1",
                Decision::Open {
                    symbol: "BTCUSDT".into(),
                    side: Side::Long,
                    qty: 0.1,
                    leverage: 200,
                },
                Some(30_000.0),
            )
            .unwrap_err();
        assert_eq!(err, ApplyError::Overleveraged(200));
    }

    #[test]
    fn close_without_position_is_rejected() {
        let engine = engine_with_model(10_000.0);
        let err = engine
            .apply(
                "m1",
                Decision::Close {
                    symbol: "BTCUSDT".into(),
                    side: Side::Long,
                    qty: None,
                },
                Some(30_000.0),
            )
            .unwrap_err();
        assert_eq!(
            err,
            ApplyError::NoSuchPosition {
                symbol: "BTCUSDT".into(),
                side: "long".into(),
            }
        );
    }

    #[test]
    fn same_side_reentry_uses_quantity_weighted_average_price() {
        let engine = engine_with_model(100_000.0);
        engine
            .apply(
                "m1",
                Decision::Open {
                    symbol: "BTCUSDT".into(),
                    side: Side::Long,
                    qty: 1.0,
                    leverage: 1,
                },
                Some(100.0),
            )
            .unwrap();
        engine
            .apply(
                "m1",
                Decision::Open {
                    symbol: "BTCUSDT".into(),
                    side: Side::Long,
                    qty: 1.0,
                    leverage: 1,
                },
                Some(200.0),
            )
            .unwrap();
        let snap = engine.snapshot("m1", |_| Some(200.0)).unwrap();
        assert_eq!(snap.positions.len(), 1);
        assert!((snap.positions[0].avg_price - 150.0).abs() < 1e-9);
        assert!((snap.positions[0].qty - 2.0).abs() < 1e-9);
    }

    #[test]
    fn adjust_changes_config_and_emits_no_trade() {
        let engine = engine_with_model(10_000.0);
        let outcome = engine
            .apply(
                "m1",
                Decision::Adjust(AdjustFields {
                    max_positions: Some(1),
                    ..Default::default()
                }),
                None,
            )
            .unwrap();
        assert!(outcome.is_none());
        assert_eq!(engine.config("m1").unwrap().max_positions, 1);
    }
}
