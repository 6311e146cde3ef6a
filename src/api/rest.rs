// =============================================================================
// REST surface (§6) — CRUD-lite over models/providers/futures/settings, plus
// the trading-core operations (execute, portfolio, trades, conversations)
// =============================================================================
//
// Grounded on the teacher's `api/rest.rs`: one `router(state)` building a
// permissive `CorsLayer`, routes chained with `.route(path, get/post(handler))`,
// `AuthBearer` gating every mutating endpoint, ad hoc `serde_json::json!({...})`
// response bodies, and the `apply_flag!` macro for diffing partial-update
// request bodies onto existing state.
// =============================================================================

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::api::auth::AuthBearer;
use crate::api::ws::ws_handler;
use crate::app_state::AppState;
use crate::error::{AppError, ApplyError};
use crate::models::{Future, Model, Provider};
use crate::portfolio::{AdjustFields, Decision, TradingConfig};
use crate::scheduler::ExecuteScope;
use crate::settings::Settings;
use crate::store::ConversationEntry;

/// Set `$target` to `$source` only if the latter is `Some`, leaving it
/// untouched otherwise — the teacher's idiom for partial-update bodies.
macro_rules! apply_flag {
    ($target:expr, $source:expr) => {
        if let Some(v) = $source {
            $target = v;
        }
    };
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/models", get(list_models).post(create_model))
        .route("/api/models/:id", get(get_model).delete(delete_model))
        .route("/api/models/:id/portfolio", get(get_portfolio))
        .route("/api/models/:id/trades", get(list_trades))
        .route("/api/models/:id/conversations", get(list_conversations))
        .route("/api/models/:id/prompts", get(get_prompts).put(put_prompts))
        .route("/api/models/:id/execute", post(execute))
        .route("/api/models/:id/execute-buy", post(execute_buy))
        .route("/api/models/:id/execute-sell", post(execute_sell))
        .route("/api/models/:id/auto-trading", post(set_auto_trading))
        .route("/api/models/:id/leverage", post(set_leverage))
        .route("/api/models/:id/max_positions", post(set_max_positions))
        .route("/api/aggregated/portfolio", get(aggregated_portfolio))
        .route("/api/market/prices", get(market_prices))
        .route("/api/market/leaderboard", get(leaderboard_all))
        .route("/api/market/leaderboard/gainers", get(leaderboard_gainers))
        .route("/api/market/leaderboard/losers", get(leaderboard_losers))
        .route("/api/market/klines", get(market_klines))
        .route("/api/market/indicators/:symbol", get(market_indicators))
        .route("/api/futures", get(list_futures).post(create_future))
        .route("/api/futures/:id", axum::routing::delete(delete_future))
        .route("/api/providers", get(list_providers).post(create_provider))
        .route("/api/providers/:id", axum::routing::delete(delete_provider))
        .route("/api/settings", get(get_settings).put(put_settings))
        .route("/ws", get(ws_handler))
        .layer(cors)
        .with_state(state)
}

fn success() -> Json<Value> {
    Json(json!({ "success": true }))
}

fn parse_id(raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw).map_err(|_| AppError::BadRequest(format!("invalid id: {raw}")))
}

fn require_model(state: &AppState, id: Uuid) -> Result<Model, AppError> {
    state
        .find_model(id)
        .ok_or_else(|| AppError::NotFound(format!("model {id}")))
}

// ── Models ──────────────────────────────────────────────────────────────────

async fn list_models(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "success": true, "models": state.models.read().clone() }))
}

async fn get_model(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let model = require_model(&state, parse_id(&id)?)?;
    Ok(Json(json!({ "success": true, "model": model })))
}

#[derive(Debug, Deserialize)]
struct CreateModelRequest {
    provider_id: Uuid,
    model_name: String,
    name: String,
    initial_capital: f64,
    #[serde(default)]
    leverage: u32,
}

async fn create_model(
    State(state): State<Arc<AppState>>,
    _auth: AuthBearer,
    Json(req): Json<CreateModelRequest>,
) -> Result<Json<Value>, AppError> {
    if req.initial_capital <= 0.0 {
        return Err(AppError::BadRequest("initial_capital must be positive".into()));
    }
    let mut model = Model::new(req.name, req.provider_id, req.model_name, req.initial_capital);
    model.leverage = req.leverage;

    state.store.save_model(&model).await?;
    state.portfolio.register(
        &model.id.to_string(),
        model.initial_capital,
        TradingConfig {
            max_positions: model.max_positions,
            leverage: if model.leverage == 0 { 10 } else { model.leverage },
            auto_buy_enabled: model.auto_buy_enabled,
            auto_sell_enabled: model.auto_sell_enabled,
        },
    );
    state.scheduler.register(&model.id.to_string());
    state.replace_model(model.clone());

    Ok(Json(json!({ "success": true, "model": model })))
}

async fn delete_model(
    State(state): State<Arc<AppState>>,
    _auth: AuthBearer,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let id = parse_id(&id)?;
    state.store.delete_model(id).await?;
    state.scheduler.unregister(&id.to_string());
    state.remove_model(id);
    Ok(success())
}

// ── Portfolio / trades / conversations ──────────────────────────────────────

async fn get_portfolio(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let id = parse_id(&id)?;
    let model_id = id.to_string();
    require_model(&state, id)?;

    let snapshot = state
        .portfolio
        .snapshot(&model_id, |s| state.market.price(s))
        .ok_or_else(|| AppError::NotFound(format!("model {id}")))?;
    let config = state.portfolio.config(&model_id).unwrap_or_default();

    Ok(Json(json!({
        "success": true,
        "portfolio": snapshot,
        "account_value_history": Vec::<f64>::new(),
        "auto_buy_enabled": config.auto_buy_enabled,
        "auto_sell_enabled": config.auto_sell_enabled,
        "leverage": config.leverage,
    })))
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<u32>,
}

async fn list_trades(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(q): Query<LimitQuery>,
) -> Result<Json<Value>, AppError> {
    let id = parse_id(&id)?;
    require_model(&state, id)?;
    let trades = state.store.list_trades(&id.to_string(), q.limit.unwrap_or(50)).await?;
    Ok(Json(json!({ "success": true, "trades": trades })))
}

fn conversation_json(entry: &ConversationEntry) -> Value {
    json!({
        "id": entry.id,
        "model_id": entry.model_id,
        "modelId": entry.model_id,
        "cycle_kind": entry.cycle_kind,
        "cycleKind": entry.cycle_kind,
        "role": entry.role,
        "content": entry.content,
        "timestamp": entry.timestamp,
    })
}

async fn list_conversations(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(q): Query<LimitQuery>,
) -> Result<Json<Value>, AppError> {
    let id = parse_id(&id)?;
    require_model(&state, id)?;
    let entries = state
        .store
        .list_conversations(&id.to_string(), q.limit.unwrap_or(20))
        .await?;
    let rows: Vec<Value> = entries.iter().map(conversation_json).collect();
    Ok(Json(json!({ "success": true, "conversations": rows })))
}

// ── Prompts ──────────────────────────────────────────────────────────────────

async fn get_prompts(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let model = require_model(&state, parse_id(&id)?)?;
    Ok(Json(json!({
        "success": true,
        "buy_prompt": model.buy_prompt,
        "sell_prompt": model.sell_prompt,
    })))
}

#[derive(Debug, Deserialize)]
struct PromptsRequest {
    buy_prompt: Option<String>,
    sell_prompt: Option<String>,
}

async fn put_prompts(
    State(state): State<Arc<AppState>>,
    _auth: AuthBearer,
    Path(id): Path<String>,
    Json(req): Json<PromptsRequest>,
) -> Result<Json<Value>, AppError> {
    let mut model = require_model(&state, parse_id(&id)?)?;
    apply_flag!(model.buy_prompt, req.buy_prompt);
    apply_flag!(model.sell_prompt, req.sell_prompt);
    state.store.save_model(&model).await?;
    state.replace_model(model);
    Ok(success())
}

// ── Execute ──────────────────────────────────────────────────────────────────

async fn run_execute(
    state: Arc<AppState>,
    id: String,
    scope: ExecuteScope,
) -> Result<Json<Value>, AppError> {
    let model_id = parse_id(&id)?;
    require_model(&state, model_id)?;
    match state.scheduler.execute(&state, &model_id.to_string(), scope).await {
        Ok(outcome) => Ok(Json(json!({
            "success": true,
            "buy_trades": outcome.buy_trades.len(),
            "sell_trades": outcome.sell_trades.len(),
        }))),
        Err(_busy) => Ok(Json(json!({ "success": false, "busy": true, "error": "busy" }))),
    }
}

async fn execute(
    State(state): State<Arc<AppState>>,
    _auth: AuthBearer,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    run_execute(state, id, ExecuteScope::Both).await
}

async fn execute_buy(
    State(state): State<Arc<AppState>>,
    _auth: AuthBearer,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    run_execute(state, id, ExecuteScope::BuyOnly).await
}

async fn execute_sell(
    State(state): State<Arc<AppState>>,
    _auth: AuthBearer,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    run_execute(state, id, ExecuteScope::SellOnly).await
}

// ── Auto-trading / leverage / max_positions ────────────────────────────────

#[derive(Debug, Deserialize)]
struct AutoTradingRequest {
    enabled: Option<bool>,
    auto_buy_enabled: Option<bool>,
    auto_sell_enabled: Option<bool>,
}

async fn set_auto_trading(
    State(state): State<Arc<AppState>>,
    _auth: AuthBearer,
    Path(id): Path<String>,
    Json(req): Json<AutoTradingRequest>,
) -> Result<Json<Value>, AppError> {
    let model_id = parse_id(&id)?;
    let mut model = require_model(&state, model_id)?;
    let (auto_buy, auto_sell) = match req.enabled {
        Some(v) => (Some(v), Some(v)),
        None => (req.auto_buy_enabled, req.auto_sell_enabled),
    };
    apply_flag!(model.auto_buy_enabled, auto_buy);
    apply_flag!(model.auto_sell_enabled, auto_sell);

    state.portfolio.apply(
        &model_id.to_string(),
        Decision::Adjust(AdjustFields {
            auto_buy_enabled: auto_buy,
            auto_sell_enabled: auto_sell,
            ..Default::default()
        }),
        None,
    )?;
    state.store.save_model(&model).await?;
    state.replace_model(model);
    Ok(success())
}

#[derive(Debug, Deserialize)]
struct LeverageRequest {
    leverage: u32,
}

async fn set_leverage(
    State(state): State<Arc<AppState>>,
    _auth: AuthBearer,
    Path(id): Path<String>,
    Json(req): Json<LeverageRequest>,
) -> Result<Json<Value>, AppError> {
    if req.leverage > 125 {
        return Err(AppError::from(ApplyError::Overleveraged(req.leverage)));
    }
    let model_id = parse_id(&id)?;
    let mut model = require_model(&state, model_id)?;
    model.leverage = req.leverage;

    // `0` is the "ask the LLM" sentinel on the Model record; the Portfolio
    // Engine's own per-account leverage only ever needs a live value for the
    // next `apply`, which the Decision Applier resolves at cycle time — so
    // only push a nonzero pin down into the account's config.
    if req.leverage != 0 {
        state.portfolio.apply(
            &model_id.to_string(),
            Decision::Adjust(AdjustFields {
                leverage: Some(req.leverage),
                ..Default::default()
            }),
            None,
        )?;
    }
    state.store.save_model(&model).await?;
    state.replace_model(model);
    Ok(success())
}

#[derive(Debug, Deserialize)]
struct MaxPositionsRequest {
    max_positions: u32,
}

async fn set_max_positions(
    State(state): State<Arc<AppState>>,
    _auth: AuthBearer,
    Path(id): Path<String>,
    Json(req): Json<MaxPositionsRequest>,
) -> Result<Json<Value>, AppError> {
    let model_id = parse_id(&id)?;
    let mut model = require_model(&state, model_id)?;
    model.max_positions = req.max_positions;

    state.portfolio.apply(
        &model_id.to_string(),
        Decision::Adjust(AdjustFields {
            max_positions: Some(req.max_positions),
            ..Default::default()
        }),
        None,
    )?;
    state.store.save_model(&model).await?;
    state.replace_model(model);
    Ok(success())
}

// ── Aggregated portfolio ─────────────────────────────────────────────────────

async fn aggregated_portfolio(State(state): State<Arc<AppState>>) -> Json<Value> {
    let models = state.models.read().clone();
    let mut total_value = 0.0;
    let mut total_cash = 0.0;
    let mut per_model = Vec::with_capacity(models.len());

    for model in &models {
        let model_id = model.id.to_string();
        if let Some(snapshot) = state.portfolio.snapshot(&model_id, |s| state.market.price(s)) {
            total_value += snapshot.total_value;
            total_cash += snapshot.cash;
            per_model.push(json!({
                "model_id": model.id,
                "name": model.name,
                "total_value": snapshot.total_value,
                "cash": snapshot.cash,
                "realized_pnl": snapshot.realized_pnl,
                "unrealized_pnl": snapshot.unrealized_pnl,
            }));
        }
    }

    Json(json!({
        "success": true,
        "total_value": total_value,
        "total_cash": total_cash,
        "models": per_model,
    }))
}

// ── Market data ──────────────────────────────────────────────────────────────

async fn market_prices(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "success": true, "prices": state.market.snapshot() }))
}

#[derive(Debug, Deserialize)]
struct LeaderboardQuery {
    limit: Option<usize>,
}

async fn leaderboard_all(State(state): State<Arc<AppState>>, Query(q): Query<LeaderboardQuery>) -> Json<Value> {
    let snapshot = state.leaderboard.snapshot();
    let limit = q.limit.unwrap_or(usize::MAX);
    Json(json!({
        "success": true,
        "gainers": snapshot.gainers.iter().take(limit).collect::<Vec<_>>(),
        "losers": snapshot.losers.iter().take(limit).collect::<Vec<_>>(),
    }))
}

async fn leaderboard_gainers(
    State(state): State<Arc<AppState>>,
    Query(q): Query<LeaderboardQuery>,
) -> Json<Value> {
    let snapshot = state.leaderboard.snapshot();
    let limit = q.limit.unwrap_or(usize::MAX);
    Json(json!({ "success": true, "gainers": snapshot.gainers.iter().take(limit).collect::<Vec<_>>() }))
}

async fn leaderboard_losers(
    State(state): State<Arc<AppState>>,
    Query(q): Query<LeaderboardQuery>,
) -> Json<Value> {
    let snapshot = state.leaderboard.snapshot();
    let limit = q.limit.unwrap_or(usize::MAX);
    Json(json!({ "success": true, "losers": snapshot.losers.iter().take(limit).collect::<Vec<_>>() }))
}

#[derive(Debug, Deserialize)]
struct KlinesQuery {
    symbol: String,
    interval: String,
    limit: Option<u32>,
    #[serde(alias = "startTime")]
    start_time: Option<i64>,
    #[serde(alias = "endTime")]
    end_time: Option<i64>,
}

async fn market_klines(
    State(state): State<Arc<AppState>>,
    Query(q): Query<KlinesQuery>,
) -> Result<Json<Value>, AppError> {
    if !crate::types::is_valid_interval(&q.interval) {
        return Err(AppError::BadRequest(format!("invalid interval: {}", q.interval)));
    }
    let bars = state
        .exchange
        .klines(&q.symbol, &q.interval, q.limit.unwrap_or(50), q.start_time, q.end_time)
        .await?;
    Ok(Json(json!({ "success": true, "klines": bars })))
}

#[derive(Debug, Deserialize)]
struct IndicatorsQuery {
    interval: Option<String>,
}

async fn market_indicators(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Query(q): Query<IndicatorsQuery>,
) -> Result<Json<Value>, AppError> {
    let interval = q.interval.unwrap_or_else(|| "1h".to_string());
    if !crate::types::is_valid_interval(&interval) {
        return Err(AppError::BadRequest(format!("invalid interval: {interval}")));
    }
    let bars = state.market.klines(&symbol, &interval);
    let ma = crate::market::indicators::moving_averages(&bars);
    Ok(Json(json!({ "success": true, "symbol": symbol, "interval": interval, "ma": ma })))
}

// ── Futures ──────────────────────────────────────────────────────────────────

async fn list_futures(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "success": true, "futures": state.futures.read().clone() }))
}

#[derive(Debug, Deserialize)]
struct CreateFutureRequest {
    symbol: String,
    contract_symbol: String,
    display_name: String,
    exchange_tag: String,
    #[serde(default)]
    sort_key: i32,
}

async fn create_future(
    State(state): State<Arc<AppState>>,
    _auth: AuthBearer,
    Json(req): Json<CreateFutureRequest>,
) -> Result<Json<Value>, AppError> {
    let future = Future {
        id: Uuid::new_v4(),
        symbol: req.symbol,
        contract_symbol: req.contract_symbol,
        display_name: req.display_name,
        exchange_tag: req.exchange_tag,
        sort_key: req.sort_key,
    };
    state.store.save_future(&future).await?;
    state.market.ensure_tracked(&future.contract_symbol, crate::market::QuoteSource::Configured);
    state.futures.write().push(future.clone());
    state.increment_version();
    Ok(Json(json!({ "success": true, "future": future })))
}

async fn delete_future(
    State(state): State<Arc<AppState>>,
    _auth: AuthBearer,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let id = parse_id(&id)?;
    state.store.delete_future(id).await?;
    state.futures.write().retain(|f| f.id != id);
    state.increment_version();
    Ok(success())
}

// ── Providers ────────────────────────────────────────────────────────────────

async fn list_providers(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "success": true, "providers": state.providers.read().clone() }))
}

#[derive(Debug, Deserialize)]
struct CreateProviderRequest {
    name: String,
    base_url: String,
    secret_key: String,
    #[serde(default)]
    model_ids: Vec<String>,
}

async fn create_provider(
    State(state): State<Arc<AppState>>,
    _auth: AuthBearer,
    Json(req): Json<CreateProviderRequest>,
) -> Result<Json<Value>, AppError> {
    let provider = Provider {
        id: Uuid::new_v4(),
        name: req.name,
        base_url: req.base_url,
        secret_key: req.secret_key,
        model_ids: req.model_ids,
    };
    state.store.save_provider(&provider).await?;
    state.providers.write().push(provider.clone());
    state.increment_version();
    Ok(Json(json!({ "success": true, "provider": provider })))
}

async fn delete_provider(
    State(state): State<Arc<AppState>>,
    _auth: AuthBearer,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let id = parse_id(&id)?;
    state.store.delete_provider(id).await?;
    state.providers.write().retain(|p| p.id != id);
    state.increment_version();
    Ok(success())
}

// ── Settings ─────────────────────────────────────────────────────────────────

async fn get_settings(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "success": true, "settings": state.settings.read().clone() }))
}

async fn put_settings(
    State(state): State<Arc<AppState>>,
    _auth: AuthBearer,
    Json(req): Json<Settings>,
) -> Result<Json<Value>, AppError> {
    let settings = Settings {
        trading_frequency_minutes: Settings::clamp_frequency(req.trading_frequency_minutes),
        trading_fee_rate: Settings::clamp_fee_rate(req.trading_fee_rate),
        show_system_prompt: req.show_system_prompt,
    };
    state.store.save_settings(&settings).await?;
    state.portfolio.set_fee_rate(settings.trading_fee_rate);
    *state.settings.write() = settings.clone();
    state.increment_version();
    Ok(Json(json!({ "success": true, "settings": settings })))
}
