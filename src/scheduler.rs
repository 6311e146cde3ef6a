// =============================================================================
// Per-Model Scheduler (C9) — drives one trading cycle per enabled model
// =============================================================================
//
// Grounded on the teacher's `main.rs` per-symbol `tokio::spawn` +
// `tokio::time::interval` reconnect loops, generalized to one task per model.
// The per-model lock is `tokio::sync::Mutex<()>` rather than the teacher's
// `parking_lot` locks, because it must be held across the LLM call's
// `.await` (§5): a concurrent manual `/execute` while a cycle is already
// running must fail fast with `Busy` rather than queue behind the lock, so
// every acquisition goes through `try_lock()`, never `.lock().await`.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::decision::apply_batch;
use crate::error::Busy;
use crate::llm::parse_decisions;
use crate::market::indicators::moving_averages;
use crate::portfolio::{PortfolioSnapshot, TradeRecord};
use crate::prompt::{build_buy_prompt, build_sell_prompt, MarketLine, PromptInputs, RecentTrade};
use crate::store::ConversationEntry;
use crate::types::{ConversationRole, CycleKind};

/// The per-cycle state machine named in the design notes. Transitions are
/// logged via `tracing`, not retained as a stored field — the lock plus
/// `running` flag is the only state that outlives one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CycleState {
    GatheringMarket,
    PromptingLlm(CycleKind),
    Applying(CycleKind),
    Persisting,
    Done,
    Failed,
}

fn trace_transition(model_id: &str, state: CycleState) {
    debug!(model_id, ?state, "cycle state transition");
}

struct ModelSlot {
    enabled: AtomicBool,
    running: AtomicBool,
    last_run_at: RwLock<Option<DateTime<Utc>>>,
    lock: tokio::sync::Mutex<()>,
}

impl ModelSlot {
    fn new() -> Self {
        Self {
            enabled: AtomicBool::new(true),
            running: AtomicBool::new(false),
            last_run_at: RwLock::new(None),
            lock: tokio::sync::Mutex::new(()),
        }
    }
}

/// Which passes a manual execute request narrows to. `Both` is what the
/// background driver always uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecuteScope {
    Both,
    BuyOnly,
    SellOnly,
}

#[derive(Debug, Clone, Default)]
pub struct CycleOutcome {
    pub buy_trades: Vec<TradeRecord>,
    pub sell_trades: Vec<TradeRecord>,
}

#[derive(Default)]
pub struct Scheduler {
    slots: RwLock<HashMap<String, Arc<ModelSlot>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, model_id: &str) {
        self.slots
            .write()
            .entry(model_id.to_string())
            .or_insert_with(|| Arc::new(ModelSlot::new()));
    }

    pub fn unregister(&self, model_id: &str) {
        self.slots.write().remove(model_id);
    }

    /// Disabling mid-cycle lets the in-flight cycle finish; it simply stops
    /// being picked up by the driver loop afterwards.
    pub fn set_enabled(&self, model_id: &str, enabled: bool) {
        if let Some(slot) = self.slots.read().get(model_id) {
            slot.enabled.store(enabled, Ordering::SeqCst);
        }
    }

    pub fn is_running(&self, model_id: &str) -> bool {
        self.slots
            .read()
            .get(model_id)
            .map(|s| s.running.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    fn due_models(&self, frequency_minutes: u32) -> Vec<String> {
        let now = Utc::now();
        self.slots
            .read()
            .iter()
            .filter_map(|(model_id, slot)| {
                if !slot.enabled.load(Ordering::SeqCst) || slot.running.load(Ordering::SeqCst) {
                    return None;
                }
                let due = match *slot.last_run_at.read() {
                    None => true,
                    Some(last) => now.signed_duration_since(last).num_minutes() >= frequency_minutes as i64,
                };
                due.then(|| model_id.clone())
            })
            .collect()
    }

    /// Background driver: wakes on `settings.trading_frequency_minutes` and
    /// spawns a cycle for every enabled, idle, due model. Cycles across
    /// models run in parallel with no ordering guarantee (§5).
    pub async fn run_driver(self: Arc<Self>, app: Arc<AppState>) {
        loop {
            let frequency = app.settings.read().trading_frequency_minutes;
            tokio::time::sleep(std::time::Duration::from_secs(frequency as u64 * 60)).await;

            for model_id in self.due_models(frequency) {
                let app = app.clone();
                let scheduler = self.clone();
                tokio::spawn(async move {
                    if let Err(Busy) = scheduler.execute(&app, &model_id, ExecuteScope::Both).await {
                        debug!(model_id, "driver skipped model: cycle already running");
                    }
                });
            }
        }
    }

    /// Run one cycle for `model_id`, or return `Busy` immediately if a cycle
    /// is already in flight — never queues behind the lock (§5, Scenario S4).
    #[instrument(skip(self, app), name = "scheduler::execute")]
    pub async fn execute(
        &self,
        app: &Arc<AppState>,
        model_id: &str,
        scope: ExecuteScope,
    ) -> Result<CycleOutcome, Busy> {
        self.register(model_id);
        let slot = self.slots.read().get(model_id).cloned().expect("just registered");

        let guard = slot.lock.try_lock().map_err(|_| Busy)?;
        slot.running.store(true, Ordering::SeqCst);
        let result = self.run_cycle(app, model_id, scope).await;
        slot.running.store(false, Ordering::SeqCst);
        *slot.last_run_at.write() = Some(Utc::now());
        drop(guard);

        Ok(result)
    }

    async fn run_cycle(&self, app: &Arc<AppState>, model_id: &str, scope: ExecuteScope) -> CycleOutcome {
        trace_transition(model_id, CycleState::GatheringMarket);
        let Some(model) = Uuid::parse_str(model_id).ok().and_then(|id| app.find_model(id)) else {
            warn!(model_id, "cycle skipped: model no longer exists");
            trace_transition(model_id, CycleState::Failed);
            return CycleOutcome::default();
        };
        if !model.enabled {
            trace_transition(model_id, CycleState::Done);
            return CycleOutcome::default();
        }

        let Some(provider) = app.find_provider(model.provider_id) else {
            warn!(model_id, "cycle skipped: no provider configured");
            app.push_error(Some(model_id.to_string()), "no provider configured");
            trace_transition(model_id, CycleState::Failed);
            return CycleOutcome::default();
        };

        let market_lines = self.build_market_lines(app);
        let recent_trades = app
            .store
            .list_trades(model_id, 5)
            .await
            .unwrap_or_default()
            .into_iter()
            .map(|t| RecentTrade {
                symbol: t.symbol,
                signal: t.signal.to_string(),
                pnl: t.pnl,
            })
            .collect::<Vec<_>>();

        // Snapshotted once, before either pass runs: §4.9 requires the sell
        // pass to see only positions that existed at cycle start, not ones
        // the buy pass just opened.
        let Some(cycle_start_snapshot) = app.portfolio.snapshot(model_id, |s| app.market.price(s)) else {
            warn!(model_id, "cycle skipped: model not registered with the portfolio engine");
            trace_transition(model_id, CycleState::Failed);
            return CycleOutcome::default();
        };

        let mut outcome = CycleOutcome::default();

        if model.auto_buy_enabled && scope != ExecuteScope::SellOnly {
            trace_transition(model_id, CycleState::PromptingLlm(CycleKind::Buy));
            outcome.buy_trades = self
                .run_pass(
                    app,
                    model_id,
                    &model,
                    &provider,
                    CycleKind::Buy,
                    &market_lines,
                    &recent_trades,
                    &cycle_start_snapshot,
                )
                .await;
        }

        if model.auto_sell_enabled && scope != ExecuteScope::BuyOnly {
            trace_transition(model_id, CycleState::PromptingLlm(CycleKind::Sell));
            outcome.sell_trades = self
                .run_pass(
                    app,
                    model_id,
                    &model,
                    &provider,
                    CycleKind::Sell,
                    &market_lines,
                    &recent_trades,
                    &cycle_start_snapshot,
                )
                .await;
        }

        trace_transition(model_id, CycleState::Persisting);
        if let Some(snapshot) = app.portfolio.snapshot(model_id, |s| app.market.price(s)) {
            let stored = crate::store::StoredSnapshot {
                model_id: model_id.to_string(),
                cash: snapshot.cash,
                initial_capital: snapshot.initial_capital,
                realized_pnl: snapshot.realized_pnl,
                positions: snapshot.positions,
            };
            if let Err(e) = app.store.save_snapshot(&stored).await {
                warn!(model_id, error = %e, "failed to persist portfolio snapshot");
            }
        }

        trace_transition(model_id, CycleState::Done);
        info!(
            model_id,
            buy_trades = outcome.buy_trades.len(),
            sell_trades = outcome.sell_trades.len(),
            "cycle complete"
        );
        outcome
    }

    fn build_market_lines(&self, app: &Arc<AppState>) -> Vec<MarketLine> {
        app.market
            .tracked_symbols()
            .into_iter()
            .filter_map(|symbol| {
                let price = app.market.price(&symbol)?;
                let quote = app.market.quote(&symbol);
                let bars = app.market.klines(&symbol, "1h");
                let ma = moving_averages(&bars);
                Some(MarketLine {
                    symbol,
                    price,
                    indicators: crate::market::IndicatorSnapshot {
                        change24h: quote.and_then(|q| q.change24h),
                        ma,
                    },
                })
            })
            .collect()
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_pass(
        &self,
        app: &Arc<AppState>,
        model_id: &str,
        model: &crate::models::Model,
        provider: &crate::models::Provider,
        kind: CycleKind,
        market_lines: &[MarketLine],
        recent_trades: &[RecentTrade],
        portfolio_snapshot: &PortfolioSnapshot,
    ) -> Vec<TradeRecord> {
        let inputs = PromptInputs {
            model,
            portfolio: portfolio_snapshot,
            market: market_lines,
            recent_trades,
        };

        let built = match kind {
            CycleKind::Buy => build_buy_prompt(&inputs, model.leverage),
            CycleKind::Sell => build_sell_prompt(&inputs),
        };

        if app.settings.read().show_system_prompt {
            self.persist_conversation(app, model_id, kind, ConversationRole::System, &built.system_message)
                .await;
        }
        self.persist_conversation(app, model_id, kind, ConversationRole::User, &built.user_message)
            .await;

        let response = app
            .llm
            .invoke(provider, &model.provider_model_id, &built.system_message, &built.user_message, 800)
            .await;

        let raw = match response {
            Ok(r) => r.content,
            Err(e) => {
                warn!(model_id, error = %e, "llm call failed, pass produces no trades");
                app.push_error(Some(model_id.to_string()), e.to_string());
                return Vec::new();
            }
        };

        self.persist_conversation(app, model_id, kind, ConversationRole::Assistant, &raw).await;

        let actions = match parse_decisions(&raw) {
            Ok(a) => a,
            Err(e) => {
                warn!(model_id, error = %e.reason, "failed to parse decisions, pass produces no trades");
                app.push_error(Some(model_id.to_string()), e.reason.clone());
                return Vec::new();
            }
        };

        trace_transition(model_id, CycleState::Applying(kind));
        let trades = apply_batch(&app.portfolio, model_id, model, kind, actions, |s| app.market.price(s));
        for trade in &trades {
            if let Err(e) = app.store.append_trade(trade).await {
                warn!(model_id, error = %e, "failed to persist trade");
            }
        }
        trades
    }

    async fn persist_conversation(
        &self,
        app: &Arc<AppState>,
        model_id: &str,
        kind: CycleKind,
        role: ConversationRole,
        content: &str,
    ) {
        let entry = ConversationEntry {
            id: Uuid::new_v4(),
            model_id: model_id.to_string(),
            cycle_kind: kind,
            role,
            content: content.to_string(),
            timestamp: Utc::now(),
        };
        if let Err(e) = app.store.append_conversation(&entry).await {
            warn!(model_id, error = %e, "failed to persist conversation entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn concurrent_execute_returns_busy_to_the_loser() {
        // Scenario S4: two concurrent manual executes on the same model,
        // within the same tick — exactly one proceeds, the other gets Busy.
        let scheduler = Arc::new(Scheduler::new());
        scheduler.register("m1");
        let slot = scheduler.slots.read().get("m1").cloned().unwrap();

        let guard = slot.lock.try_lock().unwrap();
        slot.running.store(true, Ordering::SeqCst);

        let second = slot.lock.try_lock();
        assert!(second.is_err(), "a second concurrent acquisition must fail fast");

        drop(guard);
        slot.running.store(false, Ordering::SeqCst);
        assert!(slot.lock.try_lock().is_ok());
    }

    #[test]
    fn due_models_skips_running_and_disabled() {
        let scheduler = Scheduler::new();
        scheduler.register("idle");
        scheduler.register("running");
        scheduler.register("disabled");
        scheduler.set_enabled("disabled", false);
        scheduler
            .slots
            .read()
            .get("running")
            .unwrap()
            .running
            .store(true, Ordering::SeqCst);

        let due = scheduler.due_models(15);
        assert!(due.contains(&"idle".to_string()));
        assert!(!due.contains(&"running".to_string()));
        assert!(!due.contains(&"disabled".to_string()));
    }

    #[test]
    fn due_models_respects_frequency_since_last_run() {
        let scheduler = Scheduler::new();
        scheduler.register("m1");
        *scheduler.slots.read().get("m1").unwrap().last_run_at.write() = Some(Utc::now());
        assert!(!scheduler.due_models(15).contains(&"m1".to_string()));
    }
}
