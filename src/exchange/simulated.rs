//! Deterministic in-process exchange for paper trading and tests.
//!
//! Holds quotes, balances and lot sizes for any number of named venues.
//! Fills execute at the quoted price moved against the taker by a fixed
//! slippage, and charge a flat fee rate. Failures are scripted per
//! operation with `fail_next`, so every error path can be driven exactly.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

use super::{AssetBalance, ExchangeClient, ExchangeError};
use crate::feed::PriceFeed;
use crate::types::{normalize_symbol, split_symbol, AccountKind, OrderFill, OrderSide, PriceSnapshot};

/// Stable coins treated as 1:1 with each other by `convert`.
const USD_STABLES: &[&str] = &["USDT", "USDC", "BUSD", "FDUSD", "USD"];

/// Key under which an exchange-wide quantity step is stored.
const ANY_SYMBOL: &str = "*";

/// The exchange call a scripted failure or log entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Buy,
    Sell,
    Convert,
    Transfer,
    Balances,
}

/// One call received by the simulator, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub struct SimCall {
    pub operation: Operation,
    pub exchange: String,
    /// Symbol for orders, asset for conversions and transfers.
    pub subject: String,
    pub amount: Decimal,
    pub succeeded: bool,
}

#[derive(Debug, Clone, Copy)]
struct Quote {
    price: Decimal,
    volume: Decimal,
}

#[derive(Default)]
struct SimState {
    quotes: HashMap<(String, String), Quote>,
    balances: HashMap<(String, AccountKind, String), Decimal>,
    steps: HashMap<(String, String), Decimal>,
    failures: HashMap<Operation, VecDeque<ExchangeError>>,
    calls: Vec<SimCall>,
    next_order: u64,
}

impl SimState {
    fn balance(&self, exchange: &str, account: AccountKind, asset: &str) -> Decimal {
        self.balances
            .get(&(exchange.to_string(), account, asset.to_string()))
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    fn adjust(&mut self, exchange: &str, account: AccountKind, asset: &str, delta: Decimal) {
        *self
            .balances
            .entry((exchange.to_string(), account, asset.to_string()))
            .or_insert(Decimal::ZERO) += delta;
    }

    fn record(&mut self, operation: Operation, exchange: &str, subject: &str, amount: Decimal, succeeded: bool) {
        self.calls.push(SimCall {
            operation,
            exchange: exchange.to_string(),
            subject: subject.to_string(),
            amount,
            succeeded,
        });
    }

    fn take_failure(&mut self, operation: Operation) -> Option<ExchangeError> {
        self.failures.get_mut(&operation).and_then(|q| q.pop_front())
    }
}

/// Paper exchange. Cheap to share behind an `Arc`.
pub struct SimulatedExchange {
    state: Mutex<SimState>,
    fee_rate: Decimal,
    slippage_bps: Decimal,
    enforce_balances: bool,
    latency: Duration,
}

impl Default for SimulatedExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedExchange {
    /// 10 bps fee, no slippage, balances not enforced, no latency.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState::default()),
            fee_rate: dec!(0.001),
            slippage_bps: Decimal::ZERO,
            enforce_balances: false,
            latency: Duration::ZERO,
        }
    }

    pub fn with_fee_rate(mut self, fee_rate: Decimal) -> Self {
        self.fee_rate = fee_rate;
        self
    }

    pub fn with_slippage_bps(mut self, bps: Decimal) -> Self {
        self.slippage_bps = bps;
        self
    }

    /// Reject orders, conversions and transfers the account cannot cover.
    pub fn with_balance_checks(mut self) -> Self {
        self.enforce_balances = true;
        self
    }

    /// Delay every call by `latency` before answering.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Quote `symbol` on `exchange`.
    pub fn set_price(&self, exchange: &str, symbol: &str, price: Decimal, volume: Decimal) {
        let mut state = self.lock();
        state
            .quotes
            .insert((exchange.to_lowercase(), normalize_symbol(symbol)), Quote { price, volume });
    }

    pub fn set_balance(&self, exchange: &str, account: AccountKind, asset: &str, amount: Decimal) {
        let mut state = self.lock();
        state
            .balances
            .insert((exchange.to_lowercase(), account, asset.to_uppercase()), amount);
    }

    pub fn balance(&self, exchange: &str, account: AccountKind, asset: &str) -> Decimal {
        self.lock()
            .balance(&exchange.to_lowercase(), account, &asset.to_uppercase())
    }

    /// Orders whose quantity is not a whole multiple of `step` fail with LOT_SIZE.
    pub fn set_quantity_step(&self, exchange: &str, symbol: &str, step: Decimal) {
        self.lock()
            .steps
            .insert((exchange.to_lowercase(), normalize_symbol(symbol)), step);
    }

    /// Step for every symbol on `exchange` that has none of its own.
    pub fn set_default_quantity_step(&self, exchange: &str, step: Decimal) {
        self.lock()
            .steps
            .insert((exchange.to_lowercase(), ANY_SYMBOL.to_string()), step);
    }

    /// Queue `error` as the answer to the next call of `operation`.
    /// Multiple queued errors are returned in order.
    pub fn fail_next(&self, operation: Operation, error: ExchangeError) {
        self.lock()
            .failures
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    pub fn calls(&self) -> Vec<SimCall> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self, operation: Operation) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.operation == operation)
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        // A panicking test thread must not wedge the others.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn delay(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    fn conversion_rate(state: &SimState, exchange: &str, from: &str, to: &str) -> Option<Decimal> {
        if from == to || (USD_STABLES.contains(&from) && USD_STABLES.contains(&to)) {
            return Some(Decimal::ONE);
        }
        if let Some(q) = state.quotes.get(&(exchange.to_string(), format!("{from}/{to}"))) {
            return Some(q.price);
        }
        state
            .quotes
            .get(&(exchange.to_string(), format!("{to}/{from}")))
            .filter(|q| q.price > Decimal::ZERO)
            .map(|q| Decimal::ONE / q.price)
    }
}

#[async_trait]
impl ExchangeClient for SimulatedExchange {
    async fn place_market_order(
        &self,
        exchange: &str,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
    ) -> Result<OrderFill, ExchangeError> {
        self.delay().await;
        let venue = exchange.to_lowercase();
        let symbol = normalize_symbol(symbol);
        let operation = match side {
            OrderSide::Buy => Operation::Buy,
            OrderSide::Sell => Operation::Sell,
        };

        let mut state = self.lock();
        if let Some(err) = state.take_failure(operation) {
            state.record(operation, &venue, &symbol, quantity, false);
            return Err(err);
        }

        let Some(quote) = state.quotes.get(&(venue.clone(), symbol.clone())).copied() else {
            state.record(operation, &venue, &symbol, quantity, false);
            return Err(ExchangeError::new(exchange, "Invalid symbol.").with_code(-1121));
        };

        let step = state
            .steps
            .get(&(venue.clone(), symbol.clone()))
            .or_else(|| state.steps.get(&(venue.clone(), ANY_SYMBOL.to_string())))
            .copied();
        let off_step = step.is_some_and(|s| s > Decimal::ZERO && !(quantity % s).is_zero());
        if quantity <= Decimal::ZERO || off_step {
            state.record(operation, &venue, &symbol, quantity, false);
            return Err(ExchangeError::new(exchange, "Filter failure: LOT_SIZE").with_code(-1013));
        }

        let slip = self.slippage_bps / dec!(10000);
        let average_price = match side {
            OrderSide::Buy => quote.price * (Decimal::ONE + slip),
            OrderSide::Sell => quote.price * (Decimal::ONE - slip),
        };
        let notional = quantity * average_price;
        let fee = notional * self.fee_rate;
        let (base, quote_asset) = split_symbol(&symbol);

        if self.enforce_balances {
            let short = match side {
                OrderSide::Buy => state.balance(&venue, AccountKind::Spot, &quote_asset) < notional + fee,
                OrderSide::Sell => state.balance(&venue, AccountKind::Spot, &base) < quantity,
            };
            if short {
                state.record(operation, &venue, &symbol, quantity, false);
                return Err(ExchangeError::new(
                    exchange,
                    "Account has insufficient balance for requested action.",
                )
                .with_code(-2010));
            }
        }

        match side {
            OrderSide::Buy => {
                state.adjust(&venue, AccountKind::Spot, &quote_asset, -(notional + fee));
                state.adjust(&venue, AccountKind::Spot, &base, quantity);
            }
            OrderSide::Sell => {
                state.adjust(&venue, AccountKind::Spot, &base, -quantity);
                state.adjust(&venue, AccountKind::Spot, &quote_asset, notional - fee);
            }
        }

        state.next_order += 1;
        let order_id = format!("SIM-{}-{}", venue.to_uppercase(), state.next_order);
        state.record(operation, &venue, &symbol, quantity, true);
        debug!(exchange = %venue, symbol = %symbol, side = %side, qty = %quantity, price = %average_price, "Simulated fill");

        Ok(OrderFill {
            order_id,
            exchange: venue,
            symbol,
            side,
            quantity,
            average_price,
            fee,
        })
    }

    async fn convert(
        &self,
        exchange: &str,
        from_token: &str,
        to_token: &str,
        amount: Decimal,
    ) -> Result<Decimal, ExchangeError> {
        self.delay().await;
        let venue = exchange.to_lowercase();
        let from = from_token.to_uppercase();
        let to = to_token.to_uppercase();

        let mut state = self.lock();
        if let Some(err) = state.take_failure(Operation::Convert) {
            state.record(Operation::Convert, &venue, &from, amount, false);
            return Err(err);
        }

        let Some(rate) = Self::conversion_rate(&state, &venue, &from, &to) else {
            state.record(Operation::Convert, &venue, &from, amount, false);
            return Err(ExchangeError::new(exchange, format!("Invalid symbol. No market for {from}/{to}")).with_code(-1121));
        };

        if self.enforce_balances && state.balance(&venue, AccountKind::Spot, &from) < amount {
            state.record(Operation::Convert, &venue, &from, amount, false);
            return Err(ExchangeError::new(exchange, "Insufficient balance for conversion").with_code(-2010));
        }

        let received = amount * rate * (Decimal::ONE - self.fee_rate);
        state.adjust(&venue, AccountKind::Spot, &from, -amount);
        state.adjust(&venue, AccountKind::Spot, &to, received);
        state.record(Operation::Convert, &venue, &from, amount, true);
        Ok(received)
    }

    async fn transfer(
        &self,
        exchange: &str,
        asset: &str,
        amount: Decimal,
        from: AccountKind,
        to: AccountKind,
    ) -> Result<(), ExchangeError> {
        self.delay().await;
        let venue = exchange.to_lowercase();
        let asset = asset.to_uppercase();

        let mut state = self.lock();
        if let Some(err) = state.take_failure(Operation::Transfer) {
            state.record(Operation::Transfer, &venue, &asset, amount, false);
            return Err(err);
        }

        if self.enforce_balances && state.balance(&venue, from, &asset) < amount {
            state.record(Operation::Transfer, &venue, &asset, amount, false);
            return Err(ExchangeError::new(exchange, format!("Insufficient {asset} in {from} account")).with_code(-2010));
        }

        state.adjust(&venue, from, &asset, -amount);
        state.adjust(&venue, to, &asset, amount);
        state.record(Operation::Transfer, &venue, &asset, amount, true);
        Ok(())
    }

    async fn balances(&self, exchange: &str) -> Result<HashMap<String, AssetBalance>, ExchangeError> {
        self.delay().await;
        let venue = exchange.to_lowercase();

        let mut state = self.lock();
        if let Some(err) = state.take_failure(Operation::Balances) {
            state.record(Operation::Balances, &venue, "", Decimal::ZERO, false);
            return Err(err);
        }

        let out = state
            .balances
            .iter()
            .filter(|((ex, account, _), _)| *ex == venue && *account == AccountKind::Spot)
            .map(|((_, _, asset), free)| {
                (
                    asset.clone(),
                    AssetBalance {
                        free: *free,
                        locked: Decimal::ZERO,
                    },
                )
            })
            .collect();
        state.record(Operation::Balances, &venue, "", Decimal::ZERO, true);
        Ok(out)
    }
}

#[async_trait]
impl PriceFeed for SimulatedExchange {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn snapshots(&self, symbols: &[String]) -> anyhow::Result<Vec<PriceSnapshot>> {
        let wanted: Vec<String> = symbols.iter().map(|s| normalize_symbol(s)).collect();
        let now = Utc::now();
        let state = self.lock();
        let mut out: Vec<PriceSnapshot> = state
            .quotes
            .iter()
            .filter(|((_, symbol), _)| wanted.contains(symbol))
            .map(|((exchange, symbol), quote)| PriceSnapshot {
                exchange: exchange.clone(),
                symbol: symbol.clone(),
                price: quote.price,
                volume: quote.volume,
                timestamp: now,
            })
            .collect();
        out.sort_by(|a, b| a.symbol.cmp(&b.symbol).then_with(|| a.exchange.cmp(&b.exchange)));
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
