//! Execution lifecycle across the whole engine: idempotent re-runs,
//! capital conversion, per-user single flight, durable storage, and
//! recovery from interrupted cycles and restarts.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;

use xarb::exchange::simulated::Operation;
use xarb::exchange::ExchangeClient;
use xarb::storage::{SqliteStore, Store};
use xarb::strategy::governor::Admission;
use xarb::types::{
    AccountKind, EngineError, ExecutionRecord, ExecutionStatus, FailureKind, OrderFill, OrderSide,
};

use crate::harness::{free_cost, opportunity, user, venues, Harness};

fn btc_venues() -> xarb::exchange::SimulatedExchange {
    let sim = venues();
    sim.set_price("binance", "BTC/USDT", dec!(100), Decimal::ZERO);
    sim.set_price("kraken", "BTC/USDT", dec!(102), Decimal::ZERO);
    sim
}

#[tokio::test]
async fn test_reexecuting_a_completed_record_is_a_noop() {
    let h = Harness::new(btc_venues(), &[], &[]).await;
    let cfg = user("alice");

    let Admission::Admitted(pending) = h
        .governor
        .admit(&cfg, &opportunity("BTC/USDT"), chrono::Utc::now())
        .await
        .unwrap()
    else {
        panic!("expected admission");
    };

    let first = h.orchestrator.execute(pending.clone(), &cfg).await.unwrap();
    assert_eq!(first.status, ExecutionStatus::Completed);
    let calls = h.sim.calls().len();

    // Same id, stale pending copy: the stored terminal record wins
    let second = h.orchestrator.execute(pending, &cfg).await.unwrap();
    assert_eq!(second, first);
    assert_eq!(h.sim.calls().len(), calls);

    let third = h.orchestrator.execute(first.clone(), &cfg).await.unwrap();
    assert_eq!(third, first);
    assert_eq!(h.sim.calls().len(), calls);
}

#[tokio::test]
async fn test_capital_converted_before_buying() {
    let sim = btc_venues().with_balance_checks();
    sim.set_balance("binance", AccountKind::Spot, "USDC", dec!(500));
    sim.set_balance("kraken", AccountKind::Spot, "BTC", dec!(1));

    let mut cfg = user("alice");
    cfg.capital_currency = "USDC".into();
    let h = Harness::new(sim, &[free_cost("binance"), free_cost("kraken")], &[cfg]).await;

    let summary = h.scheduler.run_cycle("alice").await.unwrap();
    assert_eq!(summary.executed, 1, "{:?}", summary.failures);

    assert_eq!(h.sim.call_count(Operation::Convert), 1);
    assert_eq!(h.sim.call_count(Operation::Transfer), 0);
    assert_eq!(h.sim.balance("binance", AccountKind::Spot, "USDC"), dec!(400));
    assert_eq!(h.sim.balance("binance", AccountKind::Spot, "BTC"), dec!(1));
    assert_eq!(h.sim.balance("kraken", AccountKind::Spot, "USDT"), dec!(102));
}

#[tokio::test]
async fn test_failed_conversion_never_reaches_the_buy() {
    let sim = btc_venues().with_balance_checks();
    sim.set_balance("binance", AccountKind::Spot, "USDC", dec!(10));

    let mut cfg = user("alice");
    cfg.capital_currency = "USDC".into();
    let h = Harness::new(sim, &[free_cost("binance"), free_cost("kraken")], &[cfg]).await;

    let summary = h.scheduler.run_cycle("alice").await.unwrap();
    assert_eq!(summary.executed, 0);
    assert_eq!(summary.errors, 1);
    assert_eq!(h.sim.call_count(Operation::Buy), 0);

    let record = h.store.executions_for_user("alice", 10).await.unwrap().remove(0);
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert!(record.buy_fill.is_none());

    // Nothing filled, so nothing counts against the day
    let state = h.store.bot_state("alice").await.unwrap().unwrap();
    assert_eq!(state.daily_volume, Decimal::ZERO);
    assert_eq!(h.governor.reserved("alice").await, Decimal::ZERO);
}

#[tokio::test(start_paused = true)]
async fn test_single_flight_per_user_not_across_users() {
    let sim = btc_venues().with_latency(Duration::from_secs(1));
    let h = Harness::new(
        sim,
        &[free_cost("binance"), free_cost("kraken")],
        &[user("alice"), user("bob")],
    )
    .await;

    let (a1, a2, b) = tokio::join!(
        h.scheduler.run_cycle("alice"),
        h.scheduler.run_cycle("alice"),
        h.scheduler.run_cycle("bob"),
    );

    let outcomes = [a1, a2];
    let busy = outcomes
        .iter()
        .filter(|r| matches!(r, Err(EngineError::CycleInProgress { .. })))
        .count();
    assert_eq!(busy, 1);
    let ran = outcomes.iter().find_map(|r| r.as_ref().ok()).unwrap();
    assert_eq!(ran.executed, 1);
    assert_eq!(b.unwrap().executed, 1);
    assert_eq!(h.sim.call_count(Operation::Buy), 2);
}

#[tokio::test]
async fn test_cycle_against_sqlite() {
    let store = Arc::new(SqliteStore::connect("sqlite::memory:").await.unwrap());
    let h = Harness::with_store(
        store,
        btc_venues(),
        &[free_cost("binance"), free_cost("kraken")],
        &[user("alice")],
    )
    .await;

    let summary = h.scheduler.run_cycle("alice").await.unwrap();
    assert_eq!(summary.executed, 1);

    let records = h.store.executions_for_user("alice", 10).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, ExecutionStatus::Completed);
    assert_eq!(records[0].actual_profit, Some(dec!(2)));

    let state = h.store.bot_state("alice").await.unwrap().unwrap();
    assert_eq!(state.trades_executed, 1);
    assert_eq!(state.total_profit, dec!(2));
}

#[tokio::test]
async fn test_state_carries_over_between_cycles() {
    let h = Harness::new(btc_venues(), &[free_cost("binance"), free_cost("kraken")], &[user("alice")]).await;

    for _ in 0..3 {
        h.scheduler.run_cycle("alice").await.unwrap();
    }
    let state = h.store.bot_state("alice").await.unwrap().unwrap();
    assert_eq!(state.trades_executed, 3);
    assert_eq!(state.total_profit, dec!(6));
    assert_eq!(state.daily_volume, dec!(300));
    assert_eq!(h.store.executions_for_user("alice", 10).await.unwrap().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_aborted_cycle_leaves_nothing_reserved() {
    let sim = btc_venues().with_latency(Duration::from_secs(1));
    let h = Harness::new(sim, &[free_cost("binance"), free_cost("kraken")], &[user("alice")]).await;

    let cycle = {
        let scheduler = h.scheduler.clone();
        tokio::spawn(async move { scheduler.run_cycle("alice").await })
    };
    tokio::time::sleep(Duration::from_millis(500)).await;
    cycle.abort();
    assert!(cycle.await.unwrap_err().is_cancelled());
    tokio::time::sleep(Duration::from_secs(600)).await;

    let records = h.store.executions_for_user("alice", 10).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, ExecutionStatus::Completed);
    assert_eq!(h.governor.in_flight_count("alice").await, 0);
    assert_eq!(h.governor.reserved("alice").await, Decimal::ZERO);

    let state = h.store.bot_state("alice").await.unwrap().unwrap();
    assert_eq!(state.trades_executed, 1);
    assert_eq!(state.daily_volume, dec!(100));

    // The symbol is free again
    let next = h.scheduler.run_cycle("alice").await.unwrap();
    assert_eq!(next.executed, 1, "{:?}", next.failures);
    assert_eq!(h.sim.call_count(Operation::Buy), 2);
}

#[tokio::test]
async fn test_partial_record_resumes_without_buying_again() {
    let h = Harness::new(btc_venues(), &[], &[]).await;
    let cfg = user("alice");

    let Admission::Admitted(pending) = h
        .governor
        .admit(&cfg, &opportunity("BTC/USDT"), chrono::Utc::now())
        .await
        .unwrap()
    else {
        panic!("expected admission");
    };

    // A run that got as far as the buy fill
    let buy = h
        .sim
        .place_market_order("binance", "BTC/USDT", OrderSide::Buy, dec!(1))
        .await
        .unwrap();
    let mut partial = pending.clone();
    partial.status = ExecutionStatus::Executing;
    partial.buy_fill = Some(buy.clone());
    h.store.save_execution(&partial).await.unwrap();

    let done = h.orchestrator.execute(pending, &cfg).await.unwrap();
    assert_eq!(done.status, ExecutionStatus::Completed);
    assert_eq!(done.buy_fill, Some(buy));
    assert_eq!(done.actual_profit, Some(dec!(2)));
    assert_eq!(h.sim.call_count(Operation::Buy), 1);
    assert_eq!(h.sim.call_count(Operation::Sell), 1);
    assert_eq!(h.sim.balance("binance", AccountKind::Spot, "BTC"), dec!(1));
}

fn interrupted(symbol: &str, status: ExecutionStatus, filled: bool) -> ExecutionRecord {
    let mut record = ExecutionRecord::new("alice", opportunity(symbol), dec!(100), dec!(1));
    record.status = status;
    if filled {
        record.buy_fill = Some(OrderFill {
            order_id: "binance-1".into(),
            exchange: "binance".into(),
            symbol: symbol.into(),
            side: OrderSide::Buy,
            quantity: dec!(1),
            average_price: dec!(100),
            fee: Decimal::ZERO,
        });
    }
    record
}

#[tokio::test]
async fn test_restart_reconciles_unfinished_records() {
    let store = Arc::new(SqliteStore::connect("sqlite::memory:").await.unwrap());
    let bought = interrupted("BTC/USDT", ExecutionStatus::Executing, true);
    let queued = interrupted("ETH/USDT", ExecutionStatus::Pending, false);
    let mid_buy = interrupted("SOL/USDT", ExecutionStatus::Executing, false);
    for record in [&bought, &queued, &mid_buy] {
        store.save_execution(record).await.unwrap();
    }

    // A fresh process over the same store
    let h = Harness::with_store(
        store,
        btc_venues(),
        &[free_cost("binance"), free_cost("kraken")],
        &[user("alice")],
    )
    .await;
    let closed = h.scheduler.reconcile().await.unwrap();
    assert_eq!(closed.len(), 3);
    assert!(h.store.unfinished_executions().await.unwrap().is_empty());

    let bought = h.store.execution(bought.id).await.unwrap().unwrap();
    assert_eq!(bought.status, ExecutionStatus::Completed);
    assert_eq!(bought.actual_profit, Some(dec!(2)));

    let queued = h.store.execution(queued.id).await.unwrap().unwrap();
    assert_eq!(queued.status, ExecutionStatus::Failed);
    assert_eq!(queued.failure, Some(FailureKind::Internal));
    assert!(queued.error_message.unwrap().contains("nothing traded"));

    let mid_buy = h.store.execution(mid_buy.id).await.unwrap().unwrap();
    assert_eq!(mid_buy.status, ExecutionStatus::Failed);
    assert!(mid_buy.error_message.unwrap().contains("outcome unknown"));

    // Only the resumed record sold; nothing bought
    assert_eq!(h.sim.call_count(Operation::Buy), 0);
    assert_eq!(h.sim.call_count(Operation::Sell), 1);

    let state = h.store.bot_state("alice").await.unwrap().unwrap();
    assert_eq!(state.trades_executed, 1);
    assert_eq!(state.daily_volume, dec!(100));
    assert_eq!(h.governor.in_flight_count("alice").await, 0);

    // Reconciling again finds nothing
    assert!(h.scheduler.reconcile().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_restart_discloses_a_position_it_cannot_close() {
    let sim = btc_venues();
    sim.fail_next(
        Operation::Sell,
        xarb::exchange::ExchangeError::new("kraken", "Account has insufficient balance for requested action.")
            .with_code(-2010),
    );
    let store = Arc::new(SqliteStore::connect("sqlite::memory:").await.unwrap());
    let bought = interrupted("BTC/USDT", ExecutionStatus::Executing, true);
    store.save_execution(&bought).await.unwrap();

    let h = Harness::with_store(store, sim, &[], &[user("alice")]).await;
    h.scheduler.reconcile().await.unwrap();

    let record = h.store.execution(bought.id).await.unwrap().unwrap();
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(record.failure, Some(FailureKind::UnbalancedPosition));
    let msg = record.error_message.unwrap();
    assert!(msg.contains("1 BTC on binance"), "{msg}");

    let state = h.store.bot_state("alice").await.unwrap().unwrap();
    assert_eq!(state.trades_executed, 0);
    assert_eq!(state.daily_volume, dec!(100));
}
