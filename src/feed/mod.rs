//! Price feeds.
//!
//! Defines the `PriceFeed` trait the scheduler polls once per cycle, and
//! a publishable in-memory feed. `HttpPriceFeed` polls a JSON ticker
//! endpoint; `SimulatedExchange` also implements the trait in paper mode.

pub mod http;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::types::{normalize_symbol, PriceSnapshot};

pub use http::HttpPriceFeed;

/// Source of current cross-exchange price snapshots.
#[async_trait]
pub trait PriceFeed: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Latest snapshots for the given symbols, across every exchange the
    /// feed knows about. Symbols may be given in any accepted notation.
    async fn snapshots(&self, symbols: &[String]) -> Result<Vec<PriceSnapshot>>;
}

/// Feed backed by whatever batch was last published to it.
#[derive(Default)]
pub struct StaticPriceFeed {
    batch: RwLock<Vec<PriceSnapshot>>,
}

impl StaticPriceFeed {
    pub fn new(batch: Vec<PriceSnapshot>) -> Self {
        Self {
            batch: RwLock::new(batch),
        }
    }

    /// Replace the current batch.
    pub async fn publish(&self, batch: Vec<PriceSnapshot>) {
        *self.batch.write().await = batch;
    }
}

#[async_trait]
impl PriceFeed for StaticPriceFeed {
    fn name(&self) -> &str {
        "static"
    }

    async fn snapshots(&self, symbols: &[String]) -> Result<Vec<PriceSnapshot>> {
        let wanted: Vec<String> = symbols.iter().map(|s| normalize_symbol(s)).collect();
        let batch = self.batch.read().await;
        Ok(batch
            .iter()
            .filter(|s| wanted.contains(&normalize_symbol(&s.symbol)))
            .cloned()
            .collect())
    }
}
