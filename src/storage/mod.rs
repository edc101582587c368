//! Persistence layer.
//!
//! The engine reads and writes user configs, execution records, bot state
//! and the transaction-cost reference table through the `Store` trait.
//! `MemoryStore` keeps everything in process; `SqliteStore` persists rows
//! as JSON bodies in SQLite via `sqlx`.

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::types::{normalize_symbol, BotState, ExecutionRecord, TransactionCost, UserTradingConfig, ANY_SYMBOL};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// CRUD contract the engine persists through.
#[async_trait]
pub trait Store: Send + Sync {
    async fn user_config(&self, user_id: &str) -> Result<Option<UserTradingConfig>>;

    async fn list_user_configs(&self) -> Result<Vec<UserTradingConfig>>;

    async fn save_user_config(&self, config: &UserTradingConfig) -> Result<()>;

    async fn execution(&self, id: Uuid) -> Result<Option<ExecutionRecord>>;

    /// Insert or overwrite the record with the same id.
    async fn save_execution(&self, record: &ExecutionRecord) -> Result<()>;

    /// Most recent first.
    async fn executions_for_user(&self, user_id: &str, limit: usize) -> Result<Vec<ExecutionRecord>>;

    /// Records not yet Completed or Failed, oldest first.
    async fn unfinished_executions(&self) -> Result<Vec<ExecutionRecord>>;

    async fn bot_state(&self, user_id: &str) -> Result<Option<BotState>>;

    async fn save_bot_state(&self, state: &BotState) -> Result<()>;

    /// Every cost row, active or not.
    async fn transaction_costs(&self) -> Result<Vec<TransactionCost>>;

    /// Insert or overwrite the row for (exchange, symbol).
    async fn save_transaction_cost(&self, cost: &TransactionCost) -> Result<()>;
}

/// Lookup key of a cost row: lowercase exchange, canonical symbol.
pub(crate) fn cost_key(cost: &TransactionCost) -> (String, String) {
    let symbol = if cost.symbol == ANY_SYMBOL {
        cost.symbol.clone()
    } else {
        normalize_symbol(&cost.symbol)
    };
    (cost.exchange.to_lowercase(), symbol)
}

/// Open the store named by a `[storage] url`: `memory` or a `sqlite:` URL.
pub async fn open(url: &str) -> Result<Arc<dyn Store>> {
    if url.trim().eq_ignore_ascii_case("memory") {
        info!("Using in-memory store");
        return Ok(Arc::new(MemoryStore::new()));
    }
    let store = SqliteStore::connect(url).await?;
    info!(url, "Using SQLite store");
    Ok(Arc::new(store))
}
