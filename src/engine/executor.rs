//! Execution orchestrator.
//!
//! Drives one admitted `ExecutionRecord` through
//! `Pending → Converting? → Transferring? → Executing → Completed | Failed`.
//! Every exchange call goes through `RetryPolicy`; every state change is
//! persisted before the next call is made.
//!
//! Money-safety rules:
//! - the sell leg is only issued once the buy leg filled
//! - a failed sell after a filled buy is an unbalanced position and says so
//! - cancellation is honoured only before the buy order goes out
//! - a record that already reached a terminal state is never re-run
//! - an interrupted record resumes from its stored progress: a recorded
//!   buy goes straight to the sell, an unrecorded one is never repeated

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::retry::{RetryLog, RetryPolicy, StepFailure};
use crate::exchange::ExchangeClient;
use crate::storage::Store;
use crate::types::{
    floor_to_step, AccountKind, EngineError, ExecutionRecord, ExecutionStatus, FailureKind, OrderFill, OrderSide,
    UserTradingConfig,
};

/// Exchange calls one execution can make: balances, convert, transfer, buy, sell.
const MAX_CALLS: u32 = 5;

/// Result of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The execution will stop before its buy order.
    Requested,
    /// The buy order is already out; the execution runs to the end.
    TooLate,
    /// Nothing with that id is running here.
    NotRunning,
}

#[derive(Debug, Default)]
struct Flight {
    cancel_requested: bool,
    past_buy: bool,
}

/// Clears the flight entry however the run ends, including when the
/// caller drops the future on timeout.
struct FlightGuard<'a> {
    flights: &'a Mutex<HashMap<Uuid, Flight>>,
    id: Uuid,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.flights
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}

/// Why a run stopped short of `Completed`.
struct Abort {
    kind: FailureKind,
    message: String,
}

impl Abort {
    fn cancelled() -> Self {
        Self {
            kind: FailureKind::Cancelled,
            message: "cancelled".to_string(),
        }
    }

    fn from_step(failure: StepFailure) -> Self {
        Self {
            kind: failure.failure_kind(),
            message: failure.into_engine_error().to_string(),
        }
    }
}

pub struct ExecutionOrchestrator {
    exchange: Arc<dyn ExchangeClient>,
    store: Arc<dyn Store>,
    retry: RetryPolicy,
    flights: Mutex<HashMap<Uuid, Flight>>,
}

impl ExecutionOrchestrator {
    pub fn new(exchange: Arc<dyn ExchangeClient>, store: Arc<dyn Store>, retry: RetryPolicy) -> Self {
        Self {
            exchange,
            store,
            retry,
            flights: Mutex::new(HashMap::new()),
        }
    }

    /// Upper bound on the wall time of one `execute` call.
    pub fn execution_budget(&self) -> Duration {
        self.retry.worst_case().saturating_mul(MAX_CALLS)
    }

    fn flights(&self) -> MutexGuard<'_, HashMap<Uuid, Flight>> {
        self.flights.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_running(&self, id: Uuid) -> bool {
        self.flights().contains_key(&id)
    }

    /// Ask a running execution to stop. Only effective before its buy order.
    pub fn cancel(&self, id: Uuid) -> CancelOutcome {
        let mut flights = self.flights();
        match flights.get_mut(&id) {
            None => CancelOutcome::NotRunning,
            Some(flight) if flight.past_buy => CancelOutcome::TooLate,
            Some(flight) => {
                flight.cancel_requested = true;
                info!(execution_id = %id, "Cancellation requested");
                CancelOutcome::Requested
            }
        }
    }

    fn cancel_requested(&self, id: Uuid) -> bool {
        self.flights().get(&id).is_some_and(|f| f.cancel_requested)
    }

    /// Cross the point of no return. Returns false if cancelled first.
    fn enter_buy(&self, id: Uuid) -> bool {
        let mut flights = self.flights();
        match flights.get_mut(&id) {
            Some(flight) if flight.cancel_requested => false,
            Some(flight) => {
                flight.past_buy = true;
                true
            }
            None => false,
        }
    }

    /// Run `record` to a terminal state and return it.
    ///
    /// Exchange failures end up in the returned record (`Failed`, with
    /// `failure` and `error_message` set). `Err` is reserved for the
    /// orchestrator's own problems: storage, or the same id already running.
    pub async fn execute(
        &self,
        record: ExecutionRecord,
        config: &UserTradingConfig,
    ) -> Result<ExecutionRecord, EngineError> {
        // The stored copy carries any progress a previous run made.
        let record = match self.store.execution(record.id).await? {
            Some(stored) if stored.is_terminal() => {
                debug!(execution_id = %record.id, status = %stored.status, "Already finished, nothing to do");
                return Ok(stored);
            }
            Some(stored) => stored,
            None => record,
        };
        if record.is_terminal() {
            return Ok(record);
        }

        {
            let mut flights = self.flights();
            if flights.contains_key(&record.id) {
                return Err(EngineError::InternalState(format!(
                    "execution {} is already running",
                    record.id
                )));
            }
            flights.insert(record.id, Flight::default());
        }

        let _flight = FlightGuard {
            flights: &self.flights,
            id: record.id,
        };
        self.run(record, config).await
    }

    async fn run(&self, mut record: ExecutionRecord, config: &UserTradingConfig) -> Result<ExecutionRecord, EngineError> {
        let mut log = RetryLog {
            retries: record.retry_count,
            adaptations: record.adaptations_applied.clone(),
        };

        info!(
            execution_id = %record.id,
            user_id = %record.user_id,
            symbol = %record.opportunity.symbol,
            buy = %record.opportunity.buy_exchange,
            sell = %record.opportunity.sell_exchange,
            amount = format!("${:.2}", record.amount_invested),
            quantity = %record.quantity,
            "Starting execution"
        );

        let outcome = self.drive(&mut record, config, &mut log).await;
        sync_log(&mut record, &log);
        record.completed_at = Some(Utc::now());

        match outcome {
            Ok(()) => {
                record.status = ExecutionStatus::Completed;
                info!(
                    execution_id = %record.id,
                    profit = format!("${:.4}", record.actual_profit.unwrap_or_default()),
                    estimated = format!("${:.4}", record.opportunity.net_profit),
                    retries = record.retry_count,
                    "Execution completed"
                );
            }
            Err(abort) => {
                record.status = ExecutionStatus::Failed;
                record.failure = Some(abort.kind);
                record.error_message = Some(abort.message);
                if abort.kind == FailureKind::UnbalancedPosition {
                    error!(
                        execution_id = %record.id,
                        user_id = %record.user_id,
                        error = record.error_message.as_deref().unwrap_or_default(),
                        "Execution left an unbalanced position"
                    );
                } else {
                    warn!(
                        execution_id = %record.id,
                        user_id = %record.user_id,
                        failure = ?abort.kind,
                        error = record.error_message.as_deref().unwrap_or_default(),
                        "Execution failed"
                    );
                }
            }
        }

        self.store.save_execution(&record).await?;
        Ok(record)
    }

    async fn drive(
        &self,
        record: &mut ExecutionRecord,
        config: &UserTradingConfig,
        log: &mut RetryLog,
    ) -> Result<(), Abort> {
        let opp = record.opportunity.clone();
        let quote = opp.quote_asset();
        let base = opp.base_asset();
        let capital = config.capital_currency.to_uppercase();
        let stage = record.status;

        // -- Resuming --
        if let Some(buy) = record.buy_fill.clone() {
            self.enter_buy(record.id);
            info!(
                execution_id = %record.id,
                quantity = %buy.quantity,
                exchange = %buy.exchange,
                "Resuming at the sell leg"
            );
            return self.sell_leg(record, buy, &base, log).await;
        }
        if stage == ExecutionStatus::Executing {
            // The buy may be out with its fill unrecorded; buying again could double the position.
            return Err(Abort {
                kind: FailureKind::Internal,
                message: format!(
                    "interrupted during the buy on {}: outcome unknown, check {} holdings there",
                    opp.buy_exchange, base
                ),
            });
        }

        if self.cancel_requested(record.id) {
            return Err(Abort::cancelled());
        }

        // -- Converting --
        if capital != quote && matches!(stage, ExecutionStatus::Pending | ExecutionStatus::Converting) {
            let held = self
                .retry
                .run("balances", &opp.buy_exchange, Decimal::ZERO, None, log, |_| {
                    self.exchange.balances(&opp.buy_exchange)
                })
                .await
                .map_err(Abort::from_step)?;
            let free_quote = held.get(&quote).map(|b| b.free).unwrap_or_default();
            let shortfall = record.amount_invested - free_quote;

            if shortfall > Decimal::ZERO {
                record.status = ExecutionStatus::Converting;
                sync_log(record, log);
                self.persist(record).await;

                let received = self
                    .retry
                    .run("convert", &opp.buy_exchange, shortfall, None, log, |amount| {
                        self.exchange.convert(&opp.buy_exchange, &capital, &quote, amount)
                    })
                    .await
                    .map_err(Abort::from_step)?;
                info!(
                    execution_id = %record.id,
                    from = %capital,
                    to = %quote,
                    amount = %shortfall,
                    received = %received,
                    "Capital converted"
                );
            }
        }

        if self.cancel_requested(record.id) {
            return Err(Abort::cancelled());
        }

        // -- Transferring --
        let funded = stage == ExecutionStatus::Transferring && self.spot_covers(record, &quote, log).await?;
        if config.funding_account != AccountKind::Spot && !funded {
            record.status = ExecutionStatus::Transferring;
            sync_log(record, log);
            self.persist(record).await;

            let from = config.funding_account;
            self.retry
                .run("transfer", &opp.buy_exchange, record.amount_invested, None, log, |amount| {
                    self.exchange
                        .transfer(&opp.buy_exchange, &quote, amount, from, AccountKind::Spot)
                })
                .await
                .map_err(Abort::from_step)?;
            debug!(execution_id = %record.id, asset = %quote, from = %from, "Capital moved to spot");
        }

        // -- Executing --
        record.status = ExecutionStatus::Executing;
        sync_log(record, log);
        self.persist(record).await;

        if !self.enter_buy(record.id) {
            return Err(Abort::cancelled());
        }

        let buy = self
            .retry
            .run("buy", &opp.buy_exchange, record.quantity, opp.buy_quantity_step, log, |qty| {
                self.exchange
                    .place_market_order(&opp.buy_exchange, &opp.symbol, OrderSide::Buy, qty)
            })
            .await
            .map_err(Abort::from_step)?;

        record.buy_fill = Some(buy.clone());
        self.check_stop_loss(record, config, &buy, log);
        sync_log(record, log);
        self.persist(record).await;

        self.sell_leg(record, buy, &base, log).await
    }

    /// Whether spot already holds the amount, so an interrupted transfer
    /// went through.
    async fn spot_covers(&self, record: &ExecutionRecord, quote: &str, log: &mut RetryLog) -> Result<bool, Abort> {
        let exchange = &record.opportunity.buy_exchange;
        let held = self
            .retry
            .run("balances", exchange, Decimal::ZERO, None, log, |_| self.exchange.balances(exchange))
            .await
            .map_err(Abort::from_step)?;
        let free = held.get(quote).map(|b| b.free).unwrap_or_default();
        Ok(free >= record.amount_invested)
    }

    /// Close the position opened by `buy`.
    async fn sell_leg(
        &self,
        record: &mut ExecutionRecord,
        buy: OrderFill,
        base: &str,
        log: &mut RetryLog,
    ) -> Result<(), Abort> {
        let opp = record.opportunity.clone();
        let sell_quantity = match opp.sell_quantity_step {
            Some(step) => floor_to_step(buy.quantity, step),
            None => buy.quantity,
        };
        if sell_quantity <= Decimal::ZERO {
            return Err(unbalanced(
                &buy,
                base,
                format!("filled quantity is below the lot size on {}", opp.sell_exchange),
            ));
        }

        let sell = self
            .retry
            .run("sell", &opp.sell_exchange, sell_quantity, opp.sell_quantity_step, log, |qty| {
                self.exchange
                    .place_market_order(&opp.sell_exchange, &opp.symbol, OrderSide::Sell, qty)
            })
            .await
            .map_err(|failure| {
                let message = format!("sell on {} failed: {}", opp.sell_exchange, failure.into_engine_error());
                unbalanced(&buy, base, message)
            })?;

        let residual = buy.quantity - sell.quantity;
        if residual > Decimal::ZERO {
            let note = format!("residual {} {base} left on {} after lot-size rounding", residual.normalize(), buy.exchange);
            warn!(execution_id = %record.id, "{note}");
            log.adaptations.push(note);
        }

        record.actual_profit = Some(realized_profit(&buy, &sell, opp.transfer_fees));
        record.sell_fill = Some(sell);
        Ok(())
    }

    /// Record buy-side slippage past the user's stop-loss. The sell still
    /// goes out: closing the exposure beats holding it.
    fn check_stop_loss(&self, record: &ExecutionRecord, config: &UserTradingConfig, buy: &OrderFill, log: &mut RetryLog) {
        let quoted = record.opportunity.buy_price;
        if config.stop_loss_percentage <= Decimal::ZERO || quoted <= Decimal::ZERO {
            return;
        }
        let slippage = (buy.average_price - quoted) / quoted * dec!(100);
        if slippage > config.stop_loss_percentage {
            let note = format!(
                "stop-loss: buy filled at {} vs quoted {quoted} ({slippage:.3}% > {}%)",
                buy.average_price, config.stop_loss_percentage
            );
            warn!(execution_id = %record.id, slippage = format!("{slippage:.3}%"), "{note}");
            log.adaptations.push(note);
        }
    }

    /// Intermediate saves never abort a run that may already hold a position.
    async fn persist(&self, record: &ExecutionRecord) {
        if let Err(e) = self.store.save_execution(record).await {
            warn!(execution_id = %record.id, status = %record.status, error = %e, "Failed to persist execution progress");
        }
    }
}

fn sync_log(record: &mut ExecutionRecord, log: &RetryLog) {
    record.retry_count = log.retries;
    record.adaptations_applied = log.adaptations.clone();
}

fn unbalanced(buy: &OrderFill, asset: &str, message: String) -> Abort {
    let error = EngineError::UnbalancedPosition {
        exchange: buy.exchange.clone(),
        asset: asset.to_string(),
        quantity: buy.quantity.normalize(),
        message,
    };
    Abort {
        kind: FailureKind::UnbalancedPosition,
        message: error.to_string(),
    }
}

/// Profit from the fills: what the sold quantity earned over its cost,
/// less both fees and the fixed transfer fees.
fn realized_profit(buy: &OrderFill, sell: &OrderFill, transfer_fees: Decimal) -> Decimal {
    sell.quantity * (sell.average_price - buy.average_price) - buy.fee - sell.fee - transfer_fees
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::classifier::ErrorClassifier;
    use crate::exchange::simulated::Operation;
    use crate::exchange::{AssetBalance, ExchangeError, MockExchangeClient, SimulatedExchange};
    use crate::storage::MemoryStore;
    use crate::types::ArbitrageOpportunity;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn opportunity(buy: &str, sell: &str) -> ArbitrageOpportunity {
        ArbitrageOpportunity {
            symbol: "BTC/USDT".into(),
            buy_exchange: buy.into(),
            sell_exchange: sell.into(),
            buy_price: dec!(100),
            sell_price: dec!(102),
            spread_percentage: dec!(2),
            quantity: dec!(1),
            investment: dec!(100),
            gross_profit: dec!(2),
            trading_fees: dec!(0.2),
            transfer_fees: Decimal::ZERO,
            total_costs: dec!(0.2),
            net_profit: dec!(1.8),
            roi_percentage: dec!(1.8),
            execution_time_estimate_minutes: 10,
            buy_quantity_step: None,
            sell_quantity_step: None,
            detected_at: Utc::now(),
        }
    }

    fn record(buy: &str, sell: &str) -> ExecutionRecord {
        ExecutionRecord::new("alice", opportunity(buy, sell), dec!(100), dec!(1))
    }

    fn fill(exchange: &str, side: OrderSide, quantity: Decimal, price: Decimal) -> OrderFill {
        OrderFill {
            order_id: format!("{exchange}-{side}"),
            exchange: exchange.into(),
            symbol: "BTC/USDT".into(),
            side,
            quantity,
            average_price: price,
            fee: dec!(0.1),
        }
    }

    fn orchestrator(exchange: impl ExchangeClient + 'static, store: Arc<MemoryStore>) -> ExecutionOrchestrator {
        let retry = RetryPolicy::new(ErrorClassifier::default(), 3, Duration::from_secs(10));
        ExecutionOrchestrator::new(Arc::new(exchange), store, retry)
    }

    fn sim() -> SimulatedExchange {
        let sim = SimulatedExchange::new().with_fee_rate(Decimal::ZERO);
        sim.set_price("binance", "BTC/USDT", dec!(100), dec!(1000));
        sim.set_price("kraken", "BTC/USDT", dec!(102), dec!(1000));
        sim
    }

    #[tokio::test]
    async fn test_completes_with_realized_profit() {
        let mut mock = MockExchangeClient::new();
        mock.expect_place_market_order()
            .withf(|ex, _, side, _| ex == "binance" && *side == OrderSide::Buy)
            .times(1)
            .returning(|ex, _, side, q| Ok(fill(ex, side, q, dec!(100.5))));
        mock.expect_place_market_order()
            .withf(|ex, _, side, _| ex == "kraken" && *side == OrderSide::Sell)
            .times(1)
            .returning(|ex, _, side, q| Ok(fill(ex, side, q, dec!(102))));
        mock.expect_balances().times(0);
        mock.expect_convert().times(0);
        mock.expect_transfer().times(0);

        let store = Arc::new(MemoryStore::new());
        let orch = orchestrator(mock, store.clone());
        let done = orch.execute(record("binance", "kraken"), &UserTradingConfig::new("alice")).await.unwrap();

        assert_eq!(done.status, ExecutionStatus::Completed);
        // 1 × (102 - 100.5) - 0.1 - 0.1
        assert_eq!(done.actual_profit, Some(dec!(1.3)));
        assert_eq!(done.retry_count, 0);
        assert!(done.completed_at.is_some());
        let stored = store.execution(done.id).await.unwrap().unwrap();
        assert_eq!(stored, done);
    }

    #[tokio::test]
    async fn test_sell_failure_discloses_unbalanced_position() {
        let mut mock = MockExchangeClient::new();
        mock.expect_place_market_order()
            .withf(|_, _, side, _| *side == OrderSide::Buy)
            .times(1)
            .returning(|ex, _, side, q| Ok(fill(ex, side, q, dec!(100))));
        mock.expect_place_market_order()
            .withf(|_, _, side, _| *side == OrderSide::Sell)
            .times(1)
            .returning(|ex, _, _, _| {
                Err(ExchangeError::new(ex, "Account has insufficient balance for requested action.").with_code(-2010))
            });

        let orch = orchestrator(mock, Arc::new(MemoryStore::new()));
        let done = orch.execute(record("okx", "binance"), &UserTradingConfig::new("alice")).await.unwrap();

        assert_eq!(done.status, ExecutionStatus::Failed);
        assert_eq!(done.failure, Some(FailureKind::UnbalancedPosition));
        let msg = done.error_message.unwrap();
        assert!(msg.contains("UNBALANCED POSITION"), "{msg}");
        assert!(msg.contains("1 BTC on okx"), "{msg}");
        assert!(done.buy_fill.is_some());
        assert!(done.sell_fill.is_none());
        assert!(done.actual_profit.is_none());
    }

    #[tokio::test]
    async fn test_permanent_buy_failure_skips_sell() {
        let mut mock = MockExchangeClient::new();
        mock.expect_place_market_order()
            .withf(|_, _, side, _| *side == OrderSide::Buy)
            .times(1)
            .returning(|ex, _, _, _| Err(ExchangeError::new(ex, "Invalid API-key").with_code(-2015)));
        mock.expect_place_market_order()
            .withf(|_, _, side, _| *side == OrderSide::Sell)
            .times(0);

        let orch = orchestrator(mock, Arc::new(MemoryStore::new()));
        let done = orch.execute(record("binance", "kraken"), &UserTradingConfig::new("alice")).await.unwrap();

        assert_eq!(done.status, ExecutionStatus::Failed);
        assert_eq!(done.failure, Some(FailureKind::Permanent));
        assert!(done.buy_fill.is_none());
        assert!(done.error_message.unwrap().contains("Permanent"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_twice_then_fill() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let mut mock = MockExchangeClient::new();
        mock.expect_place_market_order()
            .withf(|_, _, side, _| *side == OrderSide::Buy)
            .times(3)
            .returning(move |ex, _, side, q| {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ExchangeError::new(ex, "Too many requests").with_status(429))
                } else {
                    Ok(fill(ex, side, q, dec!(100)))
                }
            });
        mock.expect_place_market_order()
            .withf(|_, _, side, _| *side == OrderSide::Sell)
            .times(1)
            .returning(|ex, _, side, q| Ok(fill(ex, side, q, dec!(102))));

        let orch = orchestrator(mock, Arc::new(MemoryStore::new()));
        let done = orch.execute(record("binance", "kraken"), &UserTradingConfig::new("alice")).await.unwrap();

        assert_eq!(done.status, ExecutionStatus::Completed);
        assert_eq!(done.retry_count, 2);
        let rate_limits = done.adaptations_applied.iter().filter(|a| a.contains("rate limit")).count();
        assert_eq!(rate_limits, 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_converts_and_transfers_before_buying() {
        let mut mock = MockExchangeClient::new();
        mock.expect_balances().times(1).returning(|_| {
            let mut out = HashMap::new();
            out.insert(
                "USDT".to_string(),
                AssetBalance {
                    free: dec!(40),
                    locked: Decimal::ZERO,
                },
            );
            Ok(out)
        });
        mock.expect_convert()
            .withf(|ex, from, to, amount| ex == "binance" && from == "USDC" && to == "USDT" && *amount == dec!(60))
            .times(1)
            .returning(|_, _, _, amount| Ok(amount));
        mock.expect_transfer()
            .withf(|_, asset, amount, from, to| {
                asset == "USDT" && *amount == dec!(100) && *from == AccountKind::Funding && *to == AccountKind::Spot
            })
            .times(1)
            .returning(|_, _, _, _, _| Ok(()));
        mock.expect_place_market_order()
            .returning(|ex, _, side, q| Ok(fill(ex, side, q, dec!(100))));

        let mut cfg = UserTradingConfig::new("alice");
        cfg.capital_currency = "usdc".into();
        cfg.funding_account = AccountKind::Funding;

        let orch = orchestrator(mock, Arc::new(MemoryStore::new()));
        let done = orch.execute(record("binance", "kraken"), &cfg).await.unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_conversion_failure_fails_whole_execution() {
        let mut mock = MockExchangeClient::new();
        mock.expect_balances().returning(|_| Ok(HashMap::new()));
        mock.expect_convert()
            .returning(|ex, _, _, _| Err(ExchangeError::new(ex, "Invalid symbol.").with_code(-1121)));
        mock.expect_place_market_order().times(0);

        let mut cfg = UserTradingConfig::new("alice");
        cfg.capital_currency = "EUR".into();

        let orch = orchestrator(mock, Arc::new(MemoryStore::new()));
        let done = orch.execute(record("binance", "kraken"), &cfg).await.unwrap();
        assert_eq!(done.status, ExecutionStatus::Failed);
        assert_eq!(done.failure, Some(FailureKind::Permanent));
    }

    #[tokio::test]
    async fn test_terminal_record_is_noop() {
        let mut mock = MockExchangeClient::new();
        mock.expect_place_market_order()
            .times(2)
            .returning(|ex, _, side, q| Ok(fill(ex, side, q, dec!(100))));

        let store = Arc::new(MemoryStore::new());
        let orch = orchestrator(mock, store);
        let cfg = UserTradingConfig::new("alice");
        let rec = record("binance", "kraken");

        let first = orch.execute(rec.clone(), &cfg).await.unwrap();
        // Same id again: served from the store, no exchange calls
        let second = orch.execute(rec, &cfg).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_buy() {
        let exchange = Arc::new(sim().with_latency(Duration::from_secs(1)));
        let store = Arc::new(MemoryStore::new());
        let retry = RetryPolicy::new(ErrorClassifier::default(), 3, Duration::from_secs(10));
        let orch = Arc::new(ExecutionOrchestrator::new(exchange.clone(), store, retry));

        let mut cfg = UserTradingConfig::new("alice");
        cfg.funding_account = AccountKind::Funding;
        let rec = record("binance", "kraken");
        let id = rec.id;

        let task = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.execute(rec, &cfg).await })
        };
        // Mid-transfer
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(orch.cancel(id), CancelOutcome::Requested);

        let done = task.await.unwrap().unwrap();
        assert_eq!(done.status, ExecutionStatus::Failed);
        assert_eq!(done.failure, Some(FailureKind::Cancelled));
        assert_eq!(done.error_message.as_deref(), Some("cancelled"));
        assert_eq!(exchange.call_count(Operation::Buy), 0);
        assert!(!orch.is_running(id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_buy_is_too_late() {
        let exchange = Arc::new(sim().with_latency(Duration::from_secs(1)));
        let retry = RetryPolicy::new(ErrorClassifier::default(), 3, Duration::from_secs(10));
        let orch = Arc::new(ExecutionOrchestrator::new(exchange.clone(), Arc::new(MemoryStore::new()), retry));
        let rec = record("binance", "kraken");
        let id = rec.id;

        let task = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.execute(rec, &UserTradingConfig::new("alice")).await })
        };
        // Buy is out, sell pending
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(orch.cancel(id), CancelOutcome::TooLate);

        let done = task.await.unwrap().unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);
        assert_eq!(done.actual_profit, Some(dec!(2)));
        assert_eq!(orch.cancel(id), CancelOutcome::NotRunning);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_id_twice_in_flight_is_internal_error() {
        let exchange = Arc::new(sim().with_latency(Duration::from_secs(1)));
        let retry = RetryPolicy::new(ErrorClassifier::default(), 3, Duration::from_secs(10));
        let orch = Arc::new(ExecutionOrchestrator::new(exchange, Arc::new(MemoryStore::new()), retry));
        let rec = record("binance", "kraken");
        let cfg = UserTradingConfig::new("alice");

        let task = {
            let (orch, rec, cfg) = (orch.clone(), rec.clone(), cfg.clone());
            tokio::spawn(async move { orch.execute(rec, &cfg).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        let err = orch.execute(rec, &cfg).await.unwrap_err();
        assert!(matches!(err, EngineError::InternalState(_)));
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_stop_loss_slippage_recorded() {
        let exchange = sim().with_slippage_bps(dec!(300));
        let orch = orchestrator(exchange, Arc::new(MemoryStore::new()));
        let done = orch.execute(record("binance", "kraken"), &UserTradingConfig::new("alice")).await.unwrap();

        // Sell still went out
        assert!(done.sell_fill.is_some());
        assert!(done.adaptations_applied.iter().any(|a| a.starts_with("stop-loss")));
    }

    #[tokio::test]
    async fn test_sell_rounded_to_lot_size_reports_residual() {
        let exchange = sim();
        exchange.set_quantity_step("kraken", "BTC/USDT", dec!(0.1));
        let mut rec = record("binance", "kraken");
        rec.quantity = dec!(1.05);
        rec.opportunity.sell_quantity_step = Some(dec!(0.1));

        let orch = orchestrator(exchange, Arc::new(MemoryStore::new()));
        let done = orch.execute(rec, &UserTradingConfig::new("alice")).await.unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);
        assert_eq!(done.sell_fill.as_ref().unwrap().quantity, dec!(1.0));
        assert!(done.adaptations_applied.iter().any(|a| a.contains("residual 0.05 BTC")));
    }

    #[tokio::test]
    async fn test_recorded_buy_resumes_at_the_sell() {
        let exchange = Arc::new(sim());
        let store = Arc::new(MemoryStore::new());
        let retry = RetryPolicy::new(ErrorClassifier::default(), 3, Duration::from_secs(10));
        let orch = ExecutionOrchestrator::new(exchange.clone(), store.clone(), retry);

        let pending = record("binance", "kraken");
        let mut interrupted = pending.clone();
        interrupted.status = ExecutionStatus::Executing;
        interrupted.buy_fill = Some(fill("binance", OrderSide::Buy, dec!(1), dec!(100)));
        store.save_execution(&interrupted).await.unwrap();

        // Handed the stale pending copy: the stored progress wins
        let done = orch.execute(pending, &UserTradingConfig::new("alice")).await.unwrap();

        assert_eq!(done.status, ExecutionStatus::Completed);
        assert_eq!(exchange.call_count(Operation::Buy), 0);
        assert_eq!(exchange.call_count(Operation::Sell), 1);
        assert_eq!(done.buy_fill, interrupted.buy_fill);
        // 1 × (102 - 100) - 0.1 buy fee
        assert_eq!(done.actual_profit, Some(dec!(1.9)));
    }

    #[tokio::test]
    async fn test_interrupted_buy_without_fill_is_never_repeated() {
        let mut mock = MockExchangeClient::new();
        mock.expect_place_market_order().times(0);
        mock.expect_balances().times(0);

        let store = Arc::new(MemoryStore::new());
        let mut rec = record("binance", "kraken");
        rec.status = ExecutionStatus::Executing;
        store.save_execution(&rec).await.unwrap();

        let orch = orchestrator(mock, store);
        let done = orch.execute(rec, &UserTradingConfig::new("alice")).await.unwrap();

        assert_eq!(done.status, ExecutionStatus::Failed);
        assert_eq!(done.failure, Some(FailureKind::Internal));
        let msg = done.error_message.unwrap();
        assert!(msg.contains("outcome unknown"), "{msg}");
        assert!(msg.contains("binance"), "{msg}");
    }

    #[tokio::test]
    async fn test_interrupted_transfer_not_repeated_once_spot_is_funded() {
        let exchange = Arc::new(sim());
        exchange.set_balance("binance", AccountKind::Spot, "USDT", dec!(100));
        let store = Arc::new(MemoryStore::new());
        let retry = RetryPolicy::new(ErrorClassifier::default(), 3, Duration::from_secs(10));
        let orch = ExecutionOrchestrator::new(exchange.clone(), store.clone(), retry);

        let mut rec = record("binance", "kraken");
        rec.status = ExecutionStatus::Transferring;
        store.save_execution(&rec).await.unwrap();

        let mut cfg = UserTradingConfig::new("alice");
        cfg.funding_account = AccountKind::Funding;
        let done = orch.execute(rec, &cfg).await.unwrap();

        assert_eq!(done.status, ExecutionStatus::Completed);
        assert_eq!(exchange.call_count(Operation::Transfer), 0);
        assert_eq!(exchange.call_count(Operation::Buy), 1);
    }

    #[test]
    fn test_execution_budget_covers_every_call() {
        let retry = RetryPolicy::new(ErrorClassifier::default(), 3, Duration::from_secs(10));
        let orch = ExecutionOrchestrator::new(Arc::new(SimulatedExchange::new()), Arc::new(MemoryStore::new()), retry);
        assert_eq!(orch.execution_budget(), Duration::from_secs(70 * 5));
    }
}
