//! SQLite store.
//!
//! One table per entity. Each row carries its lookup columns plus the
//! entity itself as a JSON `body`, so the schema never has to track the
//! model field by field.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use tracing::debug;
use uuid::Uuid;

use super::{cost_key, Store};
use crate::types::{BotState, ExecutionRecord, TransactionCost, UserTradingConfig};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS user_configs (
        user_id TEXT PRIMARY KEY,
        body    TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS executions (
        id         TEXT PRIMARY KEY,
        user_id    TEXT NOT NULL,
        symbol     TEXT NOT NULL,
        status     TEXT NOT NULL,
        started_at INTEGER NOT NULL,
        body       TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_executions_user ON executions (user_id, started_at)",
    "CREATE TABLE IF NOT EXISTS bot_states (
        user_id TEXT PRIMARY KEY,
        body    TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS transaction_costs (
        exchange TEXT NOT NULL,
        symbol   TEXT NOT NULL,
        body     TEXT NOT NULL,
        PRIMARY KEY (exchange, symbol)
    )",
];

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect and create the schema if needed.
    ///
    /// `sqlite::memory:` databases live per connection, so they get a
    /// single-connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("Invalid SQLite URL: {url}"))?
            .create_if_missing(true);
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open SQLite database {url}"))?;

        for stmt in SCHEMA {
            sqlx::query(stmt)
                .execute(&pool)
                .await
                .context("Failed to create SQLite schema")?;
        }
        debug!(url, "SQLite schema ready");
        Ok(Self { pool })
    }

    fn bodies<T: DeserializeOwned>(rows: Vec<String>, what: &str) -> Result<Vec<T>> {
        rows.iter()
            .map(|body| serde_json::from_str(body).with_context(|| format!("Corrupt {what} row")))
            .collect()
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).context("Failed to serialise row body")
}

#[async_trait]
impl Store for SqliteStore {
    async fn user_config(&self, user_id: &str) -> Result<Option<UserTradingConfig>> {
        let body: Option<String> = sqlx::query_scalar("SELECT body FROM user_configs WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load user config")?;
        body.map(|b| serde_json::from_str(&b).context("Corrupt user config row"))
            .transpose()
    }

    async fn list_user_configs(&self) -> Result<Vec<UserTradingConfig>> {
        let rows: Vec<String> = sqlx::query_scalar("SELECT body FROM user_configs ORDER BY user_id")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list user configs")?;
        Self::bodies(rows, "user config")
    }

    async fn save_user_config(&self, config: &UserTradingConfig) -> Result<()> {
        sqlx::query(
            "INSERT INTO user_configs (user_id, body) VALUES (?, ?)
             ON CONFLICT(user_id) DO UPDATE SET body = excluded.body",
        )
        .bind(&config.user_id)
        .bind(to_json(config)?)
        .execute(&self.pool)
        .await
        .context("Failed to save user config")?;
        Ok(())
    }

    async fn execution(&self, id: Uuid) -> Result<Option<ExecutionRecord>> {
        let body: Option<String> = sqlx::query_scalar("SELECT body FROM executions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load execution")?;
        body.map(|b| serde_json::from_str(&b).context("Corrupt execution row"))
            .transpose()
    }

    async fn save_execution(&self, record: &ExecutionRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO executions (id, user_id, symbol, status, started_at, body)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET status = excluded.status, body = excluded.body",
        )
        .bind(record.id.to_string())
        .bind(&record.user_id)
        .bind(&record.opportunity.symbol)
        .bind(record.status.as_str())
        .bind(record.started_at.timestamp_micros())
        .bind(to_json(record)?)
        .execute(&self.pool)
        .await
        .context("Failed to save execution")?;
        Ok(())
    }

    async fn executions_for_user(&self, user_id: &str, limit: usize) -> Result<Vec<ExecutionRecord>> {
        let rows: Vec<String> = sqlx::query_scalar(
            "SELECT body FROM executions WHERE user_id = ? ORDER BY started_at DESC LIMIT ?",
        )
        .bind(user_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .context("Failed to list executions")?;
        Self::bodies(rows, "execution")
    }

    async fn unfinished_executions(&self) -> Result<Vec<ExecutionRecord>> {
        let rows: Vec<String> = sqlx::query_scalar(
            "SELECT body FROM executions WHERE status NOT IN ('completed', 'failed') ORDER BY started_at",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list unfinished executions")?;
        Self::bodies(rows, "execution")
    }

    async fn bot_state(&self, user_id: &str) -> Result<Option<BotState>> {
        let body: Option<String> = sqlx::query_scalar("SELECT body FROM bot_states WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load bot state")?;
        body.map(|b| serde_json::from_str(&b).context("Corrupt bot state row"))
            .transpose()
    }

    async fn save_bot_state(&self, state: &BotState) -> Result<()> {
        sqlx::query(
            "INSERT INTO bot_states (user_id, body) VALUES (?, ?)
             ON CONFLICT(user_id) DO UPDATE SET body = excluded.body",
        )
        .bind(&state.user_id)
        .bind(to_json(state)?)
        .execute(&self.pool)
        .await
        .context("Failed to save bot state")?;
        Ok(())
    }

    async fn transaction_costs(&self) -> Result<Vec<TransactionCost>> {
        let rows: Vec<String> =
            sqlx::query_scalar("SELECT body FROM transaction_costs ORDER BY exchange, symbol")
                .fetch_all(&self.pool)
                .await
                .context("Failed to list transaction costs")?;
        Self::bodies(rows, "transaction cost")
    }

    async fn save_transaction_cost(&self, cost: &TransactionCost) -> Result<()> {
        let (exchange, symbol) = cost_key(cost);
        sqlx::query(
            "INSERT INTO transaction_costs (exchange, symbol, body) VALUES (?, ?, ?)
             ON CONFLICT(exchange, symbol) DO UPDATE SET body = excluded.body",
        )
        .bind(exchange)
        .bind(symbol)
        .bind(to_json(cost)?)
        .execute(&self.pool)
        .await
        .context("Failed to save transaction cost")?;
        Ok(())
    }
}
