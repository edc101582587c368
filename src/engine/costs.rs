//! Transaction cost model.
//!
//! A pure lookup over the fee reference table. Rows are keyed by
//! (exchange, symbol); an exchange may also carry a default row under the
//! `*` symbol, used when no symbol-specific row exists.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::debug;

use crate::storage::Store;
use crate::types::{normalize_symbol, EngineError, TransactionCost, ANY_SYMBOL};

/// Immutable snapshot of the active cost rows.
#[derive(Debug, Clone, Default)]
pub struct CostModel {
    rows: HashMap<(String, String), TransactionCost>,
}

impl CostModel {
    /// Build from raw rows. Inactive rows are dropped; invalid ones are an error.
    pub fn new(rows: Vec<TransactionCost>) -> Result<Self, EngineError> {
        let mut map = HashMap::new();
        for row in rows {
            row.validate()?;
            if !row.is_active {
                continue;
            }
            let symbol = if row.symbol == ANY_SYMBOL {
                ANY_SYMBOL.to_string()
            } else {
                normalize_symbol(&row.symbol)
            };
            map.insert((row.exchange.to_lowercase(), symbol), row);
        }
        Ok(Self { rows: map })
    }

    /// Fees for trading `symbol` on `exchange`.
    ///
    /// Fails with `CostDataMissing` when neither a symbol row nor an
    /// exchange default row is active. Callers skip the pair.
    pub fn cost(&self, exchange: &str, symbol: &str) -> Result<&TransactionCost, EngineError> {
        let exchange_key = exchange.to_lowercase();
        self.rows
            .get(&(exchange_key.clone(), normalize_symbol(symbol)))
            .or_else(|| self.rows.get(&(exchange_key, ANY_SYMBOL.to_string())))
            .ok_or_else(|| EngineError::CostDataMissing {
                exchange: exchange.to_string(),
                symbol: symbol.to_string(),
            })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Cost model loaded from the store, reused until `ttl` elapses.
///
/// The table changes slowly; one load serves many scan cycles. A model
/// handed out stays valid for the whole cycle that took it.
pub struct CostCache {
    store: Arc<dyn Store>,
    ttl: Duration,
    cached: RwLock<Option<(Instant, Arc<CostModel>)>>,
}

impl CostCache {
    pub fn new(store: Arc<dyn Store>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            cached: RwLock::new(None),
        }
    }

    pub async fn model(&self) -> Result<Arc<CostModel>, EngineError> {
        if let Some((loaded_at, model)) = self.cached.read().await.as_ref() {
            if loaded_at.elapsed() < self.ttl {
                return Ok(model.clone());
            }
        }

        let mut slot = self.cached.write().await;
        // Another task may have refreshed while we waited for the lock.
        if let Some((loaded_at, model)) = slot.as_ref() {
            if loaded_at.elapsed() < self.ttl {
                return Ok(model.clone());
            }
        }

        let rows = self.store.transaction_costs().await?;
        let model = Arc::new(CostModel::new(rows)?);
        debug!(rows = model.len(), "Cost model reloaded");
        *slot = Some((Instant::now(), model.clone()));
        Ok(model)
    }

    /// Force the next `model()` call to reload.
    pub async fn invalidate(&self) {
        *self.cached.write().await = None;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
