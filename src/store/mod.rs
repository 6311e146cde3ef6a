// =============================================================================
// Store (C10) — durable tables behind sqlx/SQLite
// =============================================================================
//
// The teacher only ever persists `RuntimeConfig` as a JSON file; this is new,
// enriched from Zuytan-rustrade's `infrastructure/persistence/database.rs`
// (`SqliteConnectOptions::from_str(..).create_if_missing(true).journal_mode
// (Wal)`, a bootstrap `init()` issuing plain `CREATE TABLE IF NOT EXISTS`
// statements, `SqlitePoolOptions::max_connections`) and
// `repositories/strategy_repository.rs` (dynamic `sqlx::query`/`Row::try_get`
// rather than the compile-time-checked `query!` macro, since this process
// never has a live DB reachable at build time).
//
// Recovery (§8 property 10) is snapshot-based, not full trade replay: §4.5
// appends a `portfolio_snapshots` row after every applied decision, so on
// restart the cheapest correct reconstruction is "load each model's latest
// snapshot row and restore it verbatim" — the trade log stays purely an
// audit/journal, never re-derived from.
// =============================================================================

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use tracing::info;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{Future, Model, Provider};
use crate::portfolio::{Position, TradeRecord};
use crate::settings::Settings;
use crate::types::{ConversationRole, CycleKind, ExecutionMode, TradeSignal, TradeStatus};

/// One row of the append-only conversation log (§4.10).
#[derive(Debug, Clone)]
pub struct ConversationEntry {
    pub id: Uuid,
    pub model_id: String,
    pub cycle_kind: CycleKind,
    pub role: ConversationRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// A model's durable portfolio state, as last written by `save_snapshot`.
#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub model_id: String,
    pub cash: f64,
    pub initial_capital: f64,
    pub realized_pnl: f64,
    pub positions: Vec<Position>,
}

/// Owns the SQLite pool and every durable table. Writes are grouped per
/// cycle by the caller (Scheduler); the Store itself does no batching.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn connect(db_path: &str) -> Result<Self, StoreError> {
        let url = if db_path.starts_with("sqlite:") {
            db_path.to_string()
        } else if db_path == ":memory:" {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{db_path}")
        };
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(StoreError::Database)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(StoreError::Database)?;

        let store = Self { pool };
        store.bootstrap().await?;
        info!(db_path, "store connected and bootstrapped");
        Ok(store)
    }

    async fn bootstrap(&self) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await.map_err(StoreError::Database)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS providers (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                base_url TEXT NOT NULL,
                secret_key TEXT NOT NULL,
                model_ids TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .map_err(StoreError::Database)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS models (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                provider_id TEXT NOT NULL,
                provider_model_id TEXT NOT NULL,
                initial_capital REAL NOT NULL,
                leverage INTEGER NOT NULL,
                auto_buy_enabled INTEGER NOT NULL,
                auto_sell_enabled INTEGER NOT NULL,
                max_positions INTEGER NOT NULL,
                buy_batch_size INTEGER,
                sell_batch_size INTEGER,
                buy_prompt TEXT NOT NULL,
                sell_prompt TEXT NOT NULL,
                enabled INTEGER NOT NULL,
                execution_mode TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .map_err(StoreError::Database)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS futures (
                id TEXT PRIMARY KEY,
                symbol TEXT NOT NULL,
                contract_symbol TEXT NOT NULL,
                display_name TEXT NOT NULL,
                exchange_tag TEXT NOT NULL,
                sort_key INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .map_err(StoreError::Database)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                id TEXT PRIMARY KEY,
                model_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                signal TEXT NOT NULL,
                price REAL NOT NULL,
                quantity REAL NOT NULL,
                pnl REAL NOT NULL,
                fee REAL NOT NULL,
                status TEXT NOT NULL,
                message TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_trades_model_time ON trades (model_id, timestamp);
            "#,
        )
        .execute(&mut *conn)
        .await
        .map_err(StoreError::Database)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                model_id TEXT NOT NULL,
                cycle_kind TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_conversations_model_time ON conversations (model_id, timestamp);
            "#,
        )
        .execute(&mut *conn)
        .await
        .map_err(StoreError::Database)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS portfolio_snapshots (
                model_id TEXT PRIMARY KEY,
                cash REAL NOT NULL,
                initial_capital REAL NOT NULL,
                realized_pnl REAL NOT NULL,
                positions TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .map_err(StoreError::Database)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS settings (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                trading_frequency_minutes INTEGER NOT NULL,
                trading_fee_rate REAL NOT NULL,
                show_system_prompt INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .map_err(StoreError::Database)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS strategies (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .map_err(StoreError::Database)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS model_strategies (
                model_id TEXT NOT NULL,
                strategy_id TEXT NOT NULL,
                PRIMARY KEY (model_id, strategy_id)
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .map_err(StoreError::Database)?;

        Ok(())
    }

    // ── Models ──────────────────────────────────────────────────────────

    pub async fn save_model(&self, model: &Model) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO models (
                id, name, provider_id, provider_model_id, initial_capital, leverage,
                auto_buy_enabled, auto_sell_enabled, max_positions, buy_batch_size,
                sell_batch_size, buy_prompt, sell_prompt, enabled, execution_mode,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                provider_id = excluded.provider_id,
                provider_model_id = excluded.provider_model_id,
                initial_capital = excluded.initial_capital,
                leverage = excluded.leverage,
                auto_buy_enabled = excluded.auto_buy_enabled,
                auto_sell_enabled = excluded.auto_sell_enabled,
                max_positions = excluded.max_positions,
                buy_batch_size = excluded.buy_batch_size,
                sell_batch_size = excluded.sell_batch_size,
                buy_prompt = excluded.buy_prompt,
                sell_prompt = excluded.sell_prompt,
                enabled = excluded.enabled,
                execution_mode = excluded.execution_mode,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(model.id.to_string())
        .bind(&model.name)
        .bind(model.provider_id.to_string())
        .bind(&model.provider_model_id)
        .bind(model.initial_capital)
        .bind(model.leverage as i64)
        .bind(model.auto_buy_enabled)
        .bind(model.auto_sell_enabled)
        .bind(model.max_positions as i64)
        .bind(model.buy_batch_size.map(|v| v as i64))
        .bind(model.sell_batch_size.map(|v| v as i64))
        .bind(&model.buy_prompt)
        .bind(&model.sell_prompt)
        .bind(model.enabled)
        .bind(model.execution_mode.to_string())
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(StoreError::Database)?;
        Ok(())
    }

    pub async fn delete_model(&self, id: Uuid) -> Result<(), StoreError> {
        let id = id.to_string();
        sqlx::query("DELETE FROM models WHERE id = ?")
            .bind(&id)
            .execute(&self.pool)
            .await
            .map_err(StoreError::Database)?;
        sqlx::query("DELETE FROM trades WHERE model_id = ?")
            .bind(&id)
            .execute(&self.pool)
            .await
            .map_err(StoreError::Database)?;
        sqlx::query("DELETE FROM conversations WHERE model_id = ?")
            .bind(&id)
            .execute(&self.pool)
            .await
            .map_err(StoreError::Database)?;
        sqlx::query("DELETE FROM portfolio_snapshots WHERE model_id = ?")
            .bind(&id)
            .execute(&self.pool)
            .await
            .map_err(StoreError::Database)?;
        sqlx::query("DELETE FROM model_strategies WHERE model_id = ?")
            .bind(&id)
            .execute(&self.pool)
            .await
            .map_err(StoreError::Database)?;
        Ok(())
    }

    pub async fn list_models(&self) -> Result<Vec<Model>, StoreError> {
        let rows = sqlx::query("SELECT * FROM models")
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::Database)?;
        rows.iter().map(Self::model_from_row).collect()
    }

    fn model_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Model, StoreError> {
        let id_str: String = row.try_get("id").map_err(StoreError::Database)?;
        let provider_id_str: String = row.try_get("provider_id").map_err(StoreError::Database)?;
        let execution_mode_str: String = row.try_get("execution_mode").map_err(StoreError::Database)?;
        Ok(Model {
            id: Uuid::parse_str(&id_str).unwrap_or_default(),
            name: row.try_get("name").map_err(StoreError::Database)?,
            provider_id: Uuid::parse_str(&provider_id_str).unwrap_or_default(),
            provider_model_id: row.try_get("provider_model_id").map_err(StoreError::Database)?,
            initial_capital: row.try_get("initial_capital").map_err(StoreError::Database)?,
            leverage: row.try_get::<i64, _>("leverage").map_err(StoreError::Database)? as u32,
            auto_buy_enabled: row.try_get("auto_buy_enabled").map_err(StoreError::Database)?,
            auto_sell_enabled: row.try_get("auto_sell_enabled").map_err(StoreError::Database)?,
            max_positions: row.try_get::<i64, _>("max_positions").map_err(StoreError::Database)? as u32,
            buy_batch_size: row
                .try_get::<Option<i64>, _>("buy_batch_size")
                .map_err(StoreError::Database)?
                .map(|v| v as u32),
            sell_batch_size: row
                .try_get::<Option<i64>, _>("sell_batch_size")
                .map_err(StoreError::Database)?
                .map(|v| v as u32),
            buy_prompt: row.try_get("buy_prompt").map_err(StoreError::Database)?,
            sell_prompt: row.try_get("sell_prompt").map_err(StoreError::Database)?,
            enabled: row.try_get("enabled").map_err(StoreError::Database)?,
            execution_mode: if execution_mode_str == "Live" {
                ExecutionMode::Live
            } else {
                ExecutionMode::Demo
            },
        })
    }

    // ── Providers ───────────────────────────────────────────────────────

    pub async fn save_provider(&self, provider: &Provider) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let model_ids = serde_json::to_string(&provider.model_ids).unwrap_or_default();
        sqlx::query(
            r#"
            INSERT INTO providers (id, name, base_url, secret_key, model_ids, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                base_url = excluded.base_url,
                secret_key = excluded.secret_key,
                model_ids = excluded.model_ids,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(provider.id.to_string())
        .bind(&provider.name)
        .bind(&provider.base_url)
        .bind(&provider.secret_key)
        .bind(&model_ids)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(StoreError::Database)?;
        Ok(())
    }

    pub async fn delete_provider(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM providers WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(StoreError::Database)?;
        Ok(())
    }

    pub async fn list_providers(&self) -> Result<Vec<Provider>, StoreError> {
        let rows = sqlx::query("SELECT * FROM providers")
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::Database)?;
        rows.iter()
            .map(|row| {
                let id_str: String = row.try_get("id").map_err(StoreError::Database)?;
                let model_ids_raw: String = row.try_get("model_ids").map_err(StoreError::Database)?;
                Ok(Provider {
                    id: Uuid::parse_str(&id_str).unwrap_or_default(),
                    name: row.try_get("name").map_err(StoreError::Database)?,
                    base_url: row.try_get("base_url").map_err(StoreError::Database)?,
                    secret_key: row.try_get("secret_key").map_err(StoreError::Database)?,
                    model_ids: serde_json::from_str(&model_ids_raw).unwrap_or_default(),
                })
            })
            .collect()
    }

    // ── Futures ─────────────────────────────────────────────────────────

    pub async fn save_future(&self, future: &Future) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO futures (id, symbol, contract_symbol, display_name, exchange_tag, sort_key, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                symbol = excluded.symbol,
                contract_symbol = excluded.contract_symbol,
                display_name = excluded.display_name,
                exchange_tag = excluded.exchange_tag,
                sort_key = excluded.sort_key,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(future.id.to_string())
        .bind(&future.symbol)
        .bind(&future.contract_symbol)
        .bind(&future.display_name)
        .bind(&future.exchange_tag)
        .bind(future.sort_key as i64)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(StoreError::Database)?;
        Ok(())
    }

    pub async fn delete_future(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM futures WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(StoreError::Database)?;
        Ok(())
    }

    pub async fn list_futures(&self) -> Result<Vec<Future>, StoreError> {
        let rows = sqlx::query("SELECT * FROM futures ORDER BY sort_key ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::Database)?;
        rows.iter()
            .map(|row| {
                let id_str: String = row.try_get("id").map_err(StoreError::Database)?;
                Ok(Future {
                    id: Uuid::parse_str(&id_str).unwrap_or_default(),
                    symbol: row.try_get("symbol").map_err(StoreError::Database)?,
                    contract_symbol: row.try_get("contract_symbol").map_err(StoreError::Database)?,
                    display_name: row.try_get("display_name").map_err(StoreError::Database)?,
                    exchange_tag: row.try_get("exchange_tag").map_err(StoreError::Database)?,
                    sort_key: row.try_get::<i64, _>("sort_key").map_err(StoreError::Database)? as i32,
                })
            })
            .collect()
    }

    // ── Trades ──────────────────────────────────────────────────────────

    pub async fn append_trade(&self, trade: &TradeRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO trades (id, model_id, symbol, signal, price, quantity, pnl, fee, status, message, timestamp, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(trade.id.to_string())
        .bind(&trade.model_id)
        .bind(&trade.symbol)
        .bind(trade.signal.to_string())
        .bind(trade.price)
        .bind(trade.quantity)
        .bind(trade.pnl)
        .bind(trade.fee)
        .bind(if trade.status == TradeStatus::Success { "success" } else { "failed" })
        .bind(&trade.message)
        .bind(trade.timestamp.to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(StoreError::Database)?;
        Ok(())
    }

    /// Newest-first, per §6 `GET /api/models/{id}/trades?limit=N`.
    pub async fn list_trades(&self, model_id: &str, limit: u32) -> Result<Vec<TradeRecord>, StoreError> {
        let rows = sqlx::query("SELECT * FROM trades WHERE model_id = ? ORDER BY timestamp DESC LIMIT ?")
            .bind(model_id)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::Database)?;

        rows.iter()
            .map(|row| {
                let id_str: String = row.try_get("id").map_err(StoreError::Database)?;
                let signal_str: String = row.try_get("signal").map_err(StoreError::Database)?;
                let status_str: String = row.try_get("status").map_err(StoreError::Database)?;
                let timestamp_str: String = row.try_get("timestamp").map_err(StoreError::Database)?;
                Ok(TradeRecord {
                    id: Uuid::parse_str(&id_str).unwrap_or_default(),
                    model_id: model_id.to_string(),
                    symbol: row.try_get("symbol").map_err(StoreError::Database)?,
                    signal: parse_signal(&signal_str),
                    price: row.try_get("price").map_err(StoreError::Database)?,
                    quantity: row.try_get("quantity").map_err(StoreError::Database)?,
                    pnl: row.try_get("pnl").map_err(StoreError::Database)?,
                    fee: row.try_get("fee").map_err(StoreError::Database)?,
                    status: if status_str == "success" { TradeStatus::Success } else { TradeStatus::Failed },
                    message: row.try_get("message").map_err(StoreError::Database)?,
                    timestamp: timestamp_str.parse().unwrap_or_else(|_| Utc::now()),
                })
            })
            .collect()
    }

    // ── Conversations ───────────────────────────────────────────────────

    pub async fn append_conversation(&self, entry: &ConversationEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO conversations (id, model_id, cycle_kind, role, content, timestamp, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.id.to_string())
        .bind(&entry.model_id)
        .bind(match entry.cycle_kind {
            CycleKind::Buy => "buy",
            CycleKind::Sell => "sell",
        })
        .bind(match entry.role {
            ConversationRole::System => "system",
            ConversationRole::User => "user",
            ConversationRole::Assistant => "assistant",
        })
        .bind(&entry.content)
        .bind(entry.timestamp.to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(StoreError::Database)?;
        Ok(())
    }

    /// Defaults to the newest 20 rows (§6); each row is returned with both
    /// snake_case and camelCase keys by the REST layer, not here.
    pub async fn list_conversations(
        &self,
        model_id: &str,
        limit: u32,
    ) -> Result<Vec<ConversationEntry>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM conversations WHERE model_id = ? ORDER BY timestamp DESC LIMIT ?",
        )
        .bind(model_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::Database)?;

        rows.iter()
            .map(|row| {
                let id_str: String = row.try_get("id").map_err(StoreError::Database)?;
                let cycle_kind_str: String = row.try_get("cycle_kind").map_err(StoreError::Database)?;
                let role_str: String = row.try_get("role").map_err(StoreError::Database)?;
                let timestamp_str: String = row.try_get("timestamp").map_err(StoreError::Database)?;
                Ok(ConversationEntry {
                    id: Uuid::parse_str(&id_str).unwrap_or_default(),
                    model_id: model_id.to_string(),
                    cycle_kind: if cycle_kind_str == "buy" { CycleKind::Buy } else { CycleKind::Sell },
                    role: match role_str.as_str() {
                        "system" => ConversationRole::System,
                        "assistant" => ConversationRole::Assistant,
                        _ => ConversationRole::User,
                    },
                    content: row.try_get("content").map_err(StoreError::Database)?,
                    timestamp: timestamp_str.parse().unwrap_or_else(|_| Utc::now()),
                })
            })
            .collect()
    }

    // ── Portfolio snapshots ─────────────────────────────────────────────

    /// Replace-by-key: one row per model, overwritten on every cycle.
    pub async fn save_snapshot(&self, snapshot: &StoredSnapshot) -> Result<(), StoreError> {
        let positions = serde_json::to_string(&snapshot.positions).unwrap_or_default();
        sqlx::query(
            r#"
            INSERT INTO portfolio_snapshots (model_id, cash, initial_capital, realized_pnl, positions, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(model_id) DO UPDATE SET
                cash = excluded.cash,
                initial_capital = excluded.initial_capital,
                realized_pnl = excluded.realized_pnl,
                positions = excluded.positions,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&snapshot.model_id)
        .bind(snapshot.cash)
        .bind(snapshot.initial_capital)
        .bind(snapshot.realized_pnl)
        .bind(&positions)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(StoreError::Database)?;
        Ok(())
    }

    pub async fn load_snapshot(&self, model_id: &str) -> Result<Option<StoredSnapshot>, StoreError> {
        let row = sqlx::query("SELECT * FROM portfolio_snapshots WHERE model_id = ?")
            .bind(model_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::Database)?;
        row.map(Self::snapshot_from_row).transpose()
    }

    /// Every model's latest snapshot, for restart recovery (§8 property 10).
    pub async fn load_all_snapshots(&self) -> Result<Vec<StoredSnapshot>, StoreError> {
        let rows = sqlx::query("SELECT * FROM portfolio_snapshots")
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::Database)?;
        rows.iter().map(Self::snapshot_from_row).collect()
    }

    fn snapshot_from_row(row: sqlx::sqlite::SqliteRow) -> Result<StoredSnapshot, StoreError> {
        let positions_raw: String = row.try_get("positions").map_err(StoreError::Database)?;
        Ok(StoredSnapshot {
            model_id: row.try_get("model_id").map_err(StoreError::Database)?,
            cash: row.try_get("cash").map_err(StoreError::Database)?,
            initial_capital: row.try_get("initial_capital").map_err(StoreError::Database)?,
            realized_pnl: row.try_get("realized_pnl").map_err(StoreError::Database)?,
            positions: serde_json::from_str(&positions_raw).unwrap_or_default(),
        })
    }

    // ── Settings ────────────────────────────────────────────────────────

    pub async fn load_settings(&self) -> Result<Option<Settings>, StoreError> {
        let row = sqlx::query("SELECT * FROM settings WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::Database)?;
        Ok(row.map(|row| Settings {
            trading_frequency_minutes: row
                .try_get::<i64, _>("trading_frequency_minutes")
                .unwrap_or(15) as u32,
            trading_fee_rate: row.try_get("trading_fee_rate").unwrap_or(0.001),
            show_system_prompt: row.try_get("show_system_prompt").unwrap_or(false),
        }))
    }

    pub async fn save_settings(&self, settings: &Settings) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO settings (id, trading_frequency_minutes, trading_fee_rate, show_system_prompt, updated_at)
            VALUES (1, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                trading_frequency_minutes = excluded.trading_frequency_minutes,
                trading_fee_rate = excluded.trading_fee_rate,
                show_system_prompt = excluded.show_system_prompt,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(settings.trading_frequency_minutes as i64)
        .bind(settings.trading_fee_rate)
        .bind(settings.show_system_prompt)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(StoreError::Database)?;
        Ok(())
    }
}

fn parse_signal(raw: &str) -> TradeSignal {
    match raw {
        "buy_to_enter" => TradeSignal::BuyToEnter,
        "sell_to_enter" => TradeSignal::SellToEnter,
        "close_position" => TradeSignal::ClosePosition,
        "stop_loss" => TradeSignal::StopLoss,
        "take_profit" => TradeSignal::TakeProfit,
        _ => TradeSignal::ClosePosition,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;
    use uuid::Uuid;

    async fn store() -> Store {
        Store::connect(":memory:").await.unwrap()
    }

    #[tokio::test]
    async fn bootstrap_is_idempotent() {
        let s = store().await;
        s.bootstrap().await.unwrap();
    }

    #[tokio::test]
    async fn model_round_trips_through_save_and_list() {
        let s = store().await;
        let model = Model::new("gpt-trader", Uuid::new_v4(), "gpt-4o", 10_000.0);
        s.save_model(&model).await.unwrap();
        let loaded = s.list_models().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "gpt-trader");
        assert_eq!(loaded[0].leverage, 0);
    }

    #[tokio::test]
    async fn deleting_a_model_cascades_its_trades() {
        let s = store().await;
        let model = Model::new("m", Uuid::new_v4(), "gpt-4o", 10_000.0);
        s.save_model(&model).await.unwrap();
        let trade = TradeRecord {
            id: Uuid::new_v4(),
            model_id: model.id.to_string(),
            symbol: "BTCUSDT".into(),
            signal: TradeSignal::BuyToEnter,
            price: 100.0,
            quantity: 1.0,
            pnl: 0.0,
            fee: 0.1,
            status: TradeStatus::Success,
            message: "opened".into(),
            timestamp: Utc::now(),
        };
        s.append_trade(&trade).await.unwrap();
        s.delete_model(model.id).await.unwrap();
        let trades = s.list_trades(&model.id.to_string(), 10).await.unwrap();
        assert!(trades.is_empty());
    }

    #[tokio::test]
    async fn trades_round_trip_newest_first() {
        let s = store().await;
        let model_id = "m1";
        for i in 0..3 {
            let trade = TradeRecord {
                id: Uuid::new_v4(),
                model_id: model_id.to_string(),
                symbol: "BTCUSDT".into(),
                signal: TradeSignal::BuyToEnter,
                price: 100.0 + i as f64,
                quantity: 1.0,
                pnl: 0.0,
                fee: 0.1,
                status: TradeStatus::Success,
                message: "opened".into(),
                timestamp: Utc::now() + chrono::Duration::seconds(i),
            };
            s.append_trade(&trade).await.unwrap();
        }
        let trades = s.list_trades(model_id, 10).await.unwrap();
        assert_eq!(trades.len(), 3);
        assert!(trades[0].price > trades[1].price);
    }

    #[tokio::test]
    async fn snapshot_replace_by_key_keeps_only_latest() {
        let s = store().await;
        let snap1 = StoredSnapshot {
            model_id: "m1".into(),
            cash: 1_000.0,
            initial_capital: 1_000.0,
            realized_pnl: 0.0,
            positions: vec![],
        };
        s.save_snapshot(&snap1).await.unwrap();
        let snap2 = StoredSnapshot {
            model_id: "m1".into(),
            cash: 900.0,
            initial_capital: 1_000.0,
            realized_pnl: -100.0,
            positions: vec![Position {
                symbol: "BTCUSDT".into(),
                side: Side::Long,
                qty: 0.1,
                avg_price: 30_000.0,
                leverage: 10,
                opened_at: Utc::now(),
            }],
        };
        s.save_snapshot(&snap2).await.unwrap();

        let loaded = s.load_snapshot("m1").await.unwrap().unwrap();
        assert_eq!(loaded.cash, 900.0);
        assert_eq!(loaded.positions.len(), 1);
        assert_eq!(loaded.positions[0].symbol, "BTCUSDT");
    }

    #[tokio::test]
    async fn settings_round_trip() {
        let s = store().await;
        assert!(s.load_settings().await.unwrap().is_none());
        let settings = Settings {
            trading_frequency_minutes: 30,
            trading_fee_rate: 0.002,
            show_system_prompt: true,
        };
        s.save_settings(&settings).await.unwrap();
        let loaded = s.load_settings().await.unwrap().unwrap();
        assert_eq!(loaded.trading_frequency_minutes, 30);
        assert!(loaded.show_system_prompt);
    }
}
