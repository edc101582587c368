//! Exchange integrations.
//!
//! Defines the `ExchangeClient` trait, the uniform capability the engine
//! drives orders, conversions, transfers and balance queries through, and
//! the raw `ExchangeError` it returns. Concrete REST clients (signing,
//! request shapes) live outside this crate; `SimulatedExchange` is the
//! deterministic in-process implementation used for paper trading and tests.

pub mod simulated;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::types::{AccountKind, OrderFill, OrderSide};

pub use simulated::SimulatedExchange;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Raw failure reported by an exchange call.
///
/// Carries whatever the venue gave us: a numeric error code, the HTTP
/// status, and the message text. Interpretation is left to
/// `engine::classifier`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{exchange}: {message}{}", code_suffix(.code, .http_status))]
pub struct ExchangeError {
    pub exchange: String,
    pub code: Option<i64>,
    pub http_status: Option<u16>,
    pub message: String,
}

impl ExchangeError {
    pub fn new(exchange: &str, message: impl Into<String>) -> Self {
        Self {
            exchange: exchange.to_string(),
            code: None,
            http_status: None,
            message: message.into(),
        }
    }

    pub fn with_code(mut self, code: i64) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    /// The call did not answer within its deadline.
    pub fn timeout(exchange: &str, after: Duration) -> Self {
        Self::new(
            exchange,
            format!("request timed out after {}ms", after.as_millis()),
        )
    }
}

fn code_suffix(code: &Option<i64>, status: &Option<u16>) -> String {
    match (code, status) {
        (Some(code), Some(status)) => format!(" (code {code}, HTTP {status})"),
        (Some(code), None) => format!(" (code {code})"),
        (None, Some(status)) => format!(" (HTTP {status})"),
        (None, None) => String::new(),
    }
}

// ---------------------------------------------------------------------------
// Balances
// ---------------------------------------------------------------------------

/// Balance of one asset in the spot account.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AssetBalance {
    pub free: Decimal,
    pub locked: Decimal,
}

impl AssetBalance {
    pub fn total(&self) -> Decimal {
        self.free + self.locked
    }
}

// ---------------------------------------------------------------------------
// Client trait
// ---------------------------------------------------------------------------

/// Abstraction over exchange REST clients.
///
/// One client may front several venues; every call names the exchange it
/// targets. All calls are request/response. Implementors must not retry
/// internally; retry and adaptation belong to `engine::retry`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Place a market order for `quantity` base units and report the fill.
    async fn place_market_order(
        &self,
        exchange: &str,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
    ) -> Result<OrderFill, ExchangeError>;

    /// Convert `amount` of `from_token` into `to_token`.
    /// Returns the amount of `to_token` received.
    async fn convert(
        &self,
        exchange: &str,
        from_token: &str,
        to_token: &str,
        amount: Decimal,
    ) -> Result<Decimal, ExchangeError>;

    /// Move `amount` of `asset` between two accounts on the same exchange.
    async fn transfer(
        &self,
        exchange: &str,
        asset: &str,
        amount: Decimal,
        from: AccountKind,
        to: AccountKind,
    ) -> Result<(), ExchangeError>;

    /// Spot balances per asset.
    async fn balances(&self, exchange: &str) -> Result<HashMap<String, AssetBalance>, ExchangeError>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
