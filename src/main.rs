// =============================================================================
// Nexus Trade — Main Entry Point
// =============================================================================
//
// Mirrors the teacher's `main.rs`: module declarations, `dotenvy`/
// `tracing_subscriber` bootstrap, a shared `AppState` built once, one
// `tokio::spawn` reconnect-loop per background subsystem (market data,
// leaderboard, the per-model scheduler), the Axum server spawned via
// `axum::serve`, and a `tokio::signal::ctrl_c()` graceful shutdown that
// persists settings before exiting.
// =============================================================================

mod api;
mod app_state;
mod bus;
mod config;
mod decision;
mod error;
mod exchange;
mod llm;
mod market;
mod models;
mod portfolio;
mod prompt;
mod scheduler;
mod settings;
mod store;
mod types;

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::bus::EventBus;
use crate::exchange::{BinanceAdapter, ExchangeAdapter};
use crate::llm::LlmClient;
use crate::market::{LeaderboardBuilder, MarketCache, QuoteSource};
use crate::portfolio::{PortfolioEngine, TradingConfig};
use crate::settings::Settings;
use crate::store::Store;

const PRICE_REFRESH: Duration = Duration::from_secs(5);
const TICKER_24H_REFRESH: Duration = Duration::from_secs(30);
const KLINE_REFRESH: Duration = Duration::from_secs(60);
const LEADERBOARD_REFRESH: Duration = Duration::from_secs(10);
const KLINE_INTERVAL: &str = "1h";
const KLINE_RING_CAP: usize = 200;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("nexus-trade starting up");

    let config = config::EngineConfig::from_env();

    let settings = Settings::load(&config.settings_path).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load settings file, using defaults");
        Settings::default()
    });

    let store = Arc::new(Store::connect(&config.db_path).await?);
    let models = store.list_models().await?;
    let providers = store.list_providers().await?;
    let futures = store.list_futures().await?;

    let bus = Arc::new(EventBus::new());
    let market = Arc::new(MarketCache::new());
    let leaderboard = Arc::new(LeaderboardBuilder::new(0.0, 20));
    let portfolio = Arc::new(PortfolioEngine::new(settings.trading_fee_rate));
    let exchange: Arc<dyn ExchangeAdapter> =
        Arc::new(BinanceAdapter::new(config.exchange_base_url.clone(), config.exchange_timeout));
    let llm = Arc::new(LlmClient::new(config.llm_timeout));

    for future in &futures {
        market.ensure_tracked(&future.contract_symbol, QuoteSource::Configured);
    }

    // Restore every model's portfolio from its latest snapshot rather than
    // replaying the trade log (§8 property 10: the trade log is audit-only).
    let snapshots = store.load_all_snapshots().await?;
    for model in &models {
        let model_id = model.id.to_string();
        let config = TradingConfig {
            max_positions: model.max_positions,
            leverage: if model.leverage == 0 { 10 } else { model.leverage },
            auto_buy_enabled: model.auto_buy_enabled,
            auto_sell_enabled: model.auto_sell_enabled,
        };
        match snapshots.iter().find(|s| s.model_id == model_id) {
            Some(snap) => {
                portfolio.register(&model_id, snap.initial_capital, config);
                portfolio.set_cash(&model_id, snap.cash, snap.realized_pnl);
                for position in snap.positions.clone() {
                    portfolio.replay_open(&model_id, position);
                }
            }
            None => portfolio.register(&model_id, model.initial_capital, config),
        }
    }

    info!(
        models = models.len(),
        providers = providers.len(),
        futures = futures.len(),
        "restored state from store"
    );

    let state = AppState::new(
        config.clone(),
        bus,
        market.clone(),
        leaderboard.clone(),
        portfolio,
        exchange.clone(),
        llm,
        store,
        settings,
        models,
        providers,
        futures,
    );

    for model_id in state.models.read().iter().map(|m| m.id.to_string()) {
        state.scheduler.register(&model_id);
    }

    // ── Market data refresh loops ────────────────────────────────────────

    {
        let market = market.clone();
        let exchange = exchange.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PRICE_REFRESH);
            loop {
                interval.tick().await;
                for symbol in market.tracked_symbols() {
                    if !market.try_begin_price(&symbol) {
                        continue;
                    }
                    match exchange.ticker_price(&symbol).await {
                        Ok(ticker) => market.update_price(&symbol, ticker.price, ticker.ts_ms),
                        Err(e) => warn!(symbol, error = %e, "price refresh failed, keeping last value"),
                    }
                    market.end_price(&symbol);
                }
            }
        });
    }

    {
        let market = market.clone();
        let exchange = exchange.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICKER_24H_REFRESH);
            loop {
                interval.tick().await;
                for symbol in market.tracked_symbols() {
                    if !market.try_begin_ticker_24h(&symbol) {
                        continue;
                    }
                    match exchange.ticker_24h(&symbol).await {
                        Ok(t) => market.update_24h(&symbol, t.price_change_pct, t.quote_volume),
                        Err(e) => warn!(symbol, error = %e, "24h ticker refresh failed, keeping last value"),
                    }
                    market.end_ticker_24h(&symbol);
                }
            }
        });
    }

    {
        let market = market.clone();
        let exchange = exchange.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(KLINE_REFRESH);
            loop {
                interval.tick().await;
                for symbol in market.tracked_symbols() {
                    if !market.try_begin_klines(&symbol) {
                        continue;
                    }
                    match exchange.klines(&symbol, KLINE_INTERVAL, KLINE_RING_CAP as u32, None, None).await {
                        Ok(bars) => market.put_klines(&symbol, KLINE_INTERVAL, bars, KLINE_RING_CAP),
                        Err(e) => warn!(symbol, error = %e, "kline refresh failed, keeping last rung"),
                    }
                    market.end_klines(&symbol);
                }
            }
        });
    }

    // ── Leaderboard loop ──────────────────────────────────────────────────

    {
        let market = market.clone();
        let leaderboard = leaderboard.clone();
        let bus = state.bus.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(LEADERBOARD_REFRESH);
            loop {
                interval.tick().await;
                leaderboard.tick(&market, &bus);
            }
        });
    }

    // ── Per-model scheduler driver ────────────────────────────────────────

    {
        let scheduler = state.scheduler.clone();
        let state = state.clone();
        tokio::spawn(async move {
            scheduler.run_driver(state).await;
        });
    }

    // ── HTTP/WS server ─────────────────────────────────────────────────────

    let bind_addr = config.bind_addr.clone();
    {
        let state = state.clone();
        tokio::spawn(async move {
            let app = api::router(state);
            let listener = tokio::net::TcpListener::bind(&bind_addr)
                .await
                .expect("failed to bind API server");
            info!(addr = %bind_addr, "API server listening");
            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "API server failed");
            }
        });
    }

    info!("all subsystems running, press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received, stopping gracefully");

    if let Err(e) = state.settings.read().save(&state.config.settings_path) {
        error!(error = %e, "failed to save settings on shutdown");
    }

    // Give any in-flight cycle a chance to finish its current step rather
    // than being killed mid-write.
    tokio::time::sleep(Duration::from_millis(200).min(SHUTDOWN_GRACE)).await;

    info!("nexus-trade shut down complete");
    Ok(())
}
