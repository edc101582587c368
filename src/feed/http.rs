//! REST ticker poller.
//!
//! Polls an aggregator endpoint returning a JSON array of tickers:
//!
//! ```json
//! [{"exchange": "binance", "symbol": "BTCUSDT", "price": "64000.1", "volume": 1234.5, "timestamp": 1718000000000}]
//! ```
//!
//! Prices and volumes may be strings or numbers. `timestamp` is in
//! milliseconds and optional; a missing one means "as of now".

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

use super::PriceFeed;
use crate::types::{normalize_symbol, PriceSnapshot};

#[derive(Debug, Deserialize)]
struct Ticker {
    exchange: String,
    symbol: String,
    #[serde(deserialize_with = "flexible_decimal")]
    price: Decimal,
    #[serde(default, deserialize_with = "flexible_decimal")]
    volume: Decimal,
    #[serde(default)]
    timestamp: Option<i64>,
}

/// Accept `"1.5"` as well as `1.5`.
fn flexible_decimal<'de, D>(de: D) -> Result<Decimal, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(f64),
    }

    match Raw::deserialize(de)? {
        Raw::Text(s) => Decimal::from_str(s.trim()).map_err(serde::de::Error::custom),
        Raw::Number(n) => Decimal::try_from(n).map_err(serde::de::Error::custom),
    }
}

/// Parse a ticker payload into snapshots, dropping rows that are unusable.
pub fn parse_tickers(body: &str, now: DateTime<Utc>) -> Result<Vec<PriceSnapshot>> {
    let tickers: Vec<Ticker> = serde_json::from_str(body).context("Failed to parse ticker payload")?;
    Ok(tickers
        .into_iter()
        .filter(|t| t.price > Decimal::ZERO)
        .map(|t| PriceSnapshot {
            exchange: t.exchange.to_lowercase(),
            symbol: normalize_symbol(&t.symbol),
            price: t.price,
            volume: t.volume,
            timestamp: t
                .timestamp
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                .unwrap_or(now),
        })
        .collect())
}

pub struct HttpPriceFeed {
    http: Client,
    url: String,
}

impl HttpPriceFeed {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent("XARB/0.1.0")
            .build()
            .context("Failed to build price feed HTTP client")?;
        Ok(Self {
            http,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl PriceFeed for HttpPriceFeed {
    fn name(&self) -> &str {
        "http"
    }

    async fn snapshots(&self, symbols: &[String]) -> Result<Vec<PriceSnapshot>> {
        let resp = self
            .http
            .get(&self.url)
            .send()
            .await
            .context("Price feed request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            warn!(url = %self.url, %status, "Price feed returned an error status");
            anyhow::bail!("Price feed error: {status}");
        }

        let body = resp.text().await.context("Failed to read price feed body")?;
        let wanted: Vec<String> = symbols.iter().map(|s| normalize_symbol(s)).collect();
        let snapshots: Vec<PriceSnapshot> = parse_tickers(&body, Utc::now())?
            .into_iter()
            .filter(|s| wanted.contains(&s.symbol))
            .collect();

        debug!(count = snapshots.len(), "Fetched price snapshots");
        Ok(snapshots)
    }
}
