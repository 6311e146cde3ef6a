// =============================================================================
// Domain records: Model, Provider, Future
// =============================================================================
//
// These are the CRUD-lite entities the API layer lists/mutates directly;
// the trading core only reads them. Shaped after the teacher's plain
// `#[derive(Serialize, Deserialize)]` domain structs in `types.rs`, with no
// business logic attached (that lives in `portfolio`, `prompt`, `decision`).
// =============================================================================

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::ExecutionMode;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
    pub id: Uuid,
    pub name: String,
    pub base_url: String,
    pub secret_key: String,
    pub model_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Future {
    pub id: Uuid,
    /// Short symbol, e.g. `BTC`.
    pub symbol: String,
    /// Exchange contract symbol, e.g. `BTCUSDT`.
    pub contract_symbol: String,
    pub display_name: String,
    pub exchange_tag: String,
    pub sort_key: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    pub id: Uuid,
    pub name: String,
    pub provider_id: Uuid,
    /// Provider-side model identifier, e.g. `gpt-4o`.
    pub provider_model_id: String,
    pub initial_capital: f64,
    /// `0` = resolve per cycle (ask the LLM); otherwise a concrete leverage.
    pub leverage: u32,
    pub auto_buy_enabled: bool,
    pub auto_sell_enabled: bool,
    pub max_positions: u32,
    pub buy_batch_size: Option<u32>,
    pub sell_batch_size: Option<u32>,
    /// Empty string ⇒ fall back to the global default prompt template.
    pub buy_prompt: String,
    pub sell_prompt: String,
    pub enabled: bool,
    pub execution_mode: ExecutionMode,
}

impl Model {
    pub fn new(name: impl Into<String>, provider_id: Uuid, provider_model_id: impl Into<String>, initial_capital: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            provider_id,
            provider_model_id: provider_model_id.into(),
            initial_capital,
            leverage: 0,
            auto_buy_enabled: true,
            auto_sell_enabled: true,
            max_positions: 5,
            buy_batch_size: None,
            sell_batch_size: None,
            buy_prompt: String::new(),
            sell_prompt: String::new(),
            enabled: true,
            execution_mode: ExecutionMode::Demo,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_model_defaults_to_demo_and_leverage_sentinel() {
        let m = Model::new("gpt-trader", Uuid::new_v4(), "gpt-4o", 10_000.0);
        assert_eq!(m.leverage, 0);
        assert_eq!(m.execution_mode, ExecutionMode::Demo);
        assert!(m.buy_prompt.is_empty());
    }
}
