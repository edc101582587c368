//! Shared wiring for the integration suites.
//!
//! Builds the full engine (store, simulated venues, governor, orchestrator,
//! scheduler) the same way the binary does, with blackout windows off so
//! tests do not depend on the wall clock.

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;

use xarb::engine::classifier::ErrorClassifier;
use xarb::engine::costs::CostCache;
use xarb::engine::executor::ExecutionOrchestrator;
use xarb::engine::retry::RetryPolicy;
use xarb::engine::scanner::{OpportunityScanner, ScannerConfig};
use xarb::engine::scheduler::{BotScheduler, SchedulerConfig};
use xarb::exchange::SimulatedExchange;
use xarb::storage::{MemoryStore, Store};
use xarb::strategy::blackout::BlackoutSchedule;
use xarb::strategy::governor::ConcurrencyGovernor;
use xarb::strategy::risk::RiskPolicy;
use xarb::types::{ArbitrageOpportunity, TransactionCost, UserTradingConfig};

pub struct Harness {
    pub store: Arc<dyn Store>,
    pub sim: Arc<SimulatedExchange>,
    pub governor: Arc<ConcurrencyGovernor>,
    pub orchestrator: Arc<ExecutionOrchestrator>,
    pub scheduler: Arc<BotScheduler>,
}

impl Harness {
    /// Engine over an in-memory store.
    pub async fn new(sim: SimulatedExchange, costs: &[TransactionCost], users: &[UserTradingConfig]) -> Self {
        Self::with_store(Arc::new(MemoryStore::new()), sim, costs, users).await
    }

    pub async fn with_store(
        store: Arc<dyn Store>,
        sim: SimulatedExchange,
        costs: &[TransactionCost],
        users: &[UserTradingConfig],
    ) -> Self {
        for cost in costs {
            store.save_transaction_cost(cost).await.unwrap();
        }
        for user in users {
            store.save_user_config(user).await.unwrap();
        }

        let sim = Arc::new(sim);
        let governor = Arc::new(ConcurrencyGovernor::new(
            store.clone(),
            RiskPolicy::default(),
            BlackoutSchedule::disabled(),
        ));
        let retry = RetryPolicy::new(ErrorClassifier::default(), 3, Duration::from_secs(10));
        let orchestrator = Arc::new(ExecutionOrchestrator::new(sim.clone(), store.clone(), retry));
        let scheduler = Arc::new(BotScheduler::new(
            store.clone(),
            sim.clone(),
            CostCache::new(store.clone(), Duration::from_secs(60)),
            OpportunityScanner::new(ScannerConfig::default(), RiskPolicy::default()),
            governor.clone(),
            orchestrator.clone(),
            SchedulerConfig::default(),
        ));

        Self {
            store,
            sim,
            governor,
            orchestrator,
            scheduler,
        }
    }
}

/// Exchange-wide cost row.
pub fn cost(exchange: &str, taker: Decimal, withdrawal: Decimal, deposit: Decimal) -> TransactionCost {
    TransactionCost {
        exchange: exchange.into(),
        symbol: "*".into(),
        trading_fee_maker: taker,
        trading_fee_taker: taker,
        withdrawal_fee_fixed: withdrawal,
        deposit_fee_fixed: deposit,
        processing_time_minutes: 10,
        quantity_step: None,
        is_active: true,
    }
}

pub fn free_cost(exchange: &str) -> TransactionCost {
    cost(exchange, Decimal::ZERO, Decimal::ZERO, Decimal::ZERO)
}

/// $100 per trade on BTC/USDT, no profit floor.
pub fn user(user_id: &str) -> UserTradingConfig {
    let mut cfg = UserTradingConfig::new(user_id);
    cfg.symbols = vec!["BTC/USDT".into()];
    cfg.min_spread_percentage = dec!(0.5);
    cfg.min_profit_threshold = Decimal::ZERO;
    cfg.max_investment_per_trade = dec!(100);
    cfg
}

/// Zero-fee venue simulator.
pub fn venues() -> SimulatedExchange {
    SimulatedExchange::new().with_fee_rate(Decimal::ZERO)
}

/// A $100 candidate buying one unit of `symbol` at 100 and selling at 102.
pub fn opportunity(symbol: &str) -> ArbitrageOpportunity {
    ArbitrageOpportunity {
        symbol: symbol.into(),
        buy_exchange: "binance".into(),
        sell_exchange: "kraken".into(),
        buy_price: dec!(100),
        sell_price: dec!(102),
        spread_percentage: dec!(2),
        quantity: dec!(1),
        investment: dec!(100),
        gross_profit: dec!(2),
        trading_fees: Decimal::ZERO,
        transfer_fees: Decimal::ZERO,
        total_costs: Decimal::ZERO,
        net_profit: dec!(2),
        roi_percentage: dec!(2),
        execution_time_estimate_minutes: 20,
        buy_quantity_step: None,
        sell_quantity_step: None,
        detected_at: Utc::now(),
    }
}
