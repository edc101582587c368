//! In-process store for tests and ephemeral runs.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{cost_key, Store};
use crate::types::{BotState, ExecutionRecord, TransactionCost, UserTradingConfig};

#[derive(Default)]
pub struct MemoryStore {
    configs: RwLock<HashMap<String, UserTradingConfig>>,
    executions: RwLock<HashMap<Uuid, ExecutionRecord>>,
    states: RwLock<HashMap<String, BotState>>,
    costs: RwLock<HashMap<(String, String), TransactionCost>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn user_config(&self, user_id: &str) -> Result<Option<UserTradingConfig>> {
        Ok(self.configs.read().await.get(user_id).cloned())
    }

    async fn list_user_configs(&self) -> Result<Vec<UserTradingConfig>> {
        let mut out: Vec<_> = self.configs.read().await.values().cloned().collect();
        out.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        Ok(out)
    }

    async fn save_user_config(&self, config: &UserTradingConfig) -> Result<()> {
        self.configs
            .write()
            .await
            .insert(config.user_id.clone(), config.clone());
        Ok(())
    }

    async fn execution(&self, id: Uuid) -> Result<Option<ExecutionRecord>> {
        Ok(self.executions.read().await.get(&id).cloned())
    }

    async fn save_execution(&self, record: &ExecutionRecord) -> Result<()> {
        self.executions.write().await.insert(record.id, record.clone());
        Ok(())
    }

    async fn executions_for_user(&self, user_id: &str, limit: usize) -> Result<Vec<ExecutionRecord>> {
        let mut out: Vec<_> = self
            .executions
            .read()
            .await
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        out.truncate(limit);
        Ok(out)
    }

    async fn unfinished_executions(&self) -> Result<Vec<ExecutionRecord>> {
        let mut out: Vec<_> = self
            .executions
            .read()
            .await
            .values()
            .filter(|r| !r.is_terminal())
            .cloned()
            .collect();
        out.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(out)
    }

    async fn bot_state(&self, user_id: &str) -> Result<Option<BotState>> {
        Ok(self.states.read().await.get(user_id).cloned())
    }

    async fn save_bot_state(&self, state: &BotState) -> Result<()> {
        self.states
            .write()
            .await
            .insert(state.user_id.clone(), state.clone());
        Ok(())
    }

    async fn transaction_costs(&self) -> Result<Vec<TransactionCost>> {
        let mut out: Vec<_> = self.costs.read().await.values().cloned().collect();
        out.sort_by(|a, b| a.exchange.cmp(&b.exchange).then_with(|| a.symbol.cmp(&b.symbol)));
        Ok(out)
    }

    async fn save_transaction_cost(&self, cost: &TransactionCost) -> Result<()> {
        self.costs.write().await.insert(cost_key(cost), cost.clone());
        Ok(())
    }
}
