// =============================================================================
// AppState — composition root
// =============================================================================
//
// Grounded on the teacher's `app_state.rs`: a struct tying together every
// subsystem behind `Arc`, an `AtomicU64` version counter bumped on mutation,
// and a `build_snapshot()` that assembles one flat DTO by reading each
// subsystem under its own lock rather than holding a single giant lock. The
// teacher's ring-buffer-capped `push_error`/`push_decision` audit logs are
// reused verbatim in shape for the new domain's recent-errors log.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use uuid::Uuid;

use crate::bus::EventBus;
use crate::config::EngineConfig;
use crate::exchange::ExchangeAdapter;
use crate::llm::LlmClient;
use crate::market::{LeaderboardBuilder, MarketCache};
use crate::models::{Future, Model, Provider};
use crate::portfolio::PortfolioEngine;
use crate::scheduler::Scheduler;
use crate::settings::Settings;
use crate::store::Store;

const MAX_RECENT_ERRORS: usize = 50;

#[derive(Debug, Clone, Serialize)]
pub struct RecentError {
    pub model_id: Option<String>,
    pub message: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Process-wide composition root. One instance, `Arc`-shared into every
/// Axum handler and background task.
pub struct AppState {
    pub config: EngineConfig,
    pub bus: Arc<EventBus>,
    pub market: Arc<MarketCache>,
    pub leaderboard: Arc<LeaderboardBuilder>,
    pub portfolio: Arc<PortfolioEngine>,
    pub exchange: Arc<dyn ExchangeAdapter>,
    pub llm: Arc<LlmClient>,
    pub store: Arc<Store>,
    pub scheduler: Arc<Scheduler>,
    pub settings: RwLock<Settings>,

    pub models: RwLock<Vec<Model>>,
    pub providers: RwLock<Vec<Provider>>,
    pub futures: RwLock<Vec<Future>>,

    state_version: AtomicU64,
    recent_errors: RwLock<Vec<RecentError>>,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: EngineConfig,
        bus: Arc<EventBus>,
        market: Arc<MarketCache>,
        leaderboard: Arc<LeaderboardBuilder>,
        portfolio: Arc<PortfolioEngine>,
        exchange: Arc<dyn ExchangeAdapter>,
        llm: Arc<LlmClient>,
        store: Arc<Store>,
        settings: Settings,
        models: Vec<Model>,
        providers: Vec<Provider>,
        futures: Vec<Future>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            bus,
            market,
            leaderboard,
            portfolio,
            exchange,
            llm,
            store,
            scheduler: Arc::new(Scheduler::new()),
            settings: RwLock::new(settings),
            models: RwLock::new(models),
            providers: RwLock::new(providers),
            futures: RwLock::new(futures),
            state_version: AtomicU64::new(0),
            recent_errors: RwLock::new(Vec::new()),
        })
    }

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    /// Ring-buffer-capped audit log of the most recent operational failures,
    /// surfaced for operators without needing to grep logs.
    pub fn push_error(&self, model_id: Option<String>, message: impl Into<String>) {
        let mut errors = self.recent_errors.write();
        errors.push(RecentError {
            model_id,
            message: message.into(),
            timestamp: chrono::Utc::now(),
        });
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }
    }

    pub fn recent_errors(&self) -> Vec<RecentError> {
        self.recent_errors.read().clone()
    }

    pub fn find_model(&self, id: Uuid) -> Option<Model> {
        self.models.read().iter().find(|m| m.id == id).cloned()
    }

    pub fn replace_model(&self, model: Model) {
        let mut models = self.models.write();
        if let Some(existing) = models.iter_mut().find(|m| m.id == model.id) {
            *existing = model;
        } else {
            models.push(model);
        }
        self.increment_version();
    }

    pub fn remove_model(&self, id: Uuid) {
        self.models.write().retain(|m| m.id != id);
        self.portfolio.unregister(&id.to_string());
        self.increment_version();
    }

    pub fn find_provider(&self, id: Uuid) -> Option<Provider> {
        self.providers.read().iter().find(|p| p.id == id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExchangeError;
    use crate::exchange::{KlineBar, Ticker24h, TickerPrice};
    use async_trait::async_trait;
    use std::time::Duration;

    struct NullExchange;

    #[async_trait]
    impl ExchangeAdapter for NullExchange {
        async fn ticker_price(&self, _symbol: &str) -> Result<TickerPrice, ExchangeError> {
            Err(ExchangeError::PermanentUpstream("unused in test".into()))
        }
        async fn ticker_24h(&self, _symbol: &str) -> Result<Ticker24h, ExchangeError> {
            Err(ExchangeError::PermanentUpstream("unused in test".into()))
        }
        async fn klines(
            &self,
            _symbol: &str,
            _interval: &str,
            _limit: u32,
            _start_ms: Option<i64>,
            _end_ms: Option<i64>,
        ) -> Result<Vec<KlineBar>, ExchangeError> {
            Ok(vec![])
        }
    }

    async fn test_state() -> Arc<AppState> {
        let store = Store::connect(":memory:").await.unwrap();
        AppState::new(
            EngineConfig::from_env(),
            Arc::new(EventBus::new()),
            Arc::new(MarketCache::new()),
            Arc::new(LeaderboardBuilder::new(0.0, 10)),
            Arc::new(PortfolioEngine::new(0.001)),
            Arc::new(NullExchange),
            Arc::new(LlmClient::new(Duration::from_secs(60))),
            Arc::new(store),
            Settings::default(),
            vec![],
            vec![],
            vec![],
        )
    }

    #[tokio::test]
    async fn version_increments_monotonically() {
        let state = test_state().await;
        assert_eq!(state.current_state_version(), 0);
        state.increment_version();
        state.increment_version();
        assert_eq!(state.current_state_version(), 2);
    }

    #[tokio::test]
    async fn recent_errors_ring_buffer_caps_at_fifty() {
        let state = test_state().await;
        for i in 0..60 {
            state.push_error(None, format!("error {i}"));
        }
        let errors = state.recent_errors();
        assert_eq!(errors.len(), MAX_RECENT_ERRORS);
        assert_eq!(errors.last().unwrap().message, "error 59");
    }

    #[tokio::test]
    async fn replace_model_upserts_by_id() {
        let state = test_state().await;
        let model = Model::new("m", Uuid::new_v4(), "gpt-4o", 10_000.0);
        state.replace_model(model.clone());
        assert_eq!(state.models.read().len(), 1);
        let mut updated = model.clone();
        updated.leverage = 5;
        state.replace_model(updated);
        assert_eq!(state.models.read().len(), 1);
        assert_eq!(state.find_model(model.id).unwrap().leverage, 5);
    }
}
