//! Reference scenarios, each driven through a full `run_cycle`.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use xarb::exchange::simulated::Operation;
use xarb::exchange::ExchangeError;
use xarb::types::{AccountKind, BotState, ExecutionStatus, FailureKind, RejectionReason};
use xarb::strategy::governor::Admission;

use crate::harness::{cost, free_cost, opportunity, user, venues, Harness};

/// X offers BTC at $100, Y bids $101; fixed fees add up to $0.50.
async fn scenario_a(min_profit: Decimal, min_spread: Decimal) -> Harness {
    let sim = venues();
    sim.set_price("x", "BTC/USDT", dec!(100), Decimal::ZERO);
    sim.set_price("y", "BTC/USDT", dec!(101), Decimal::ZERO);

    let mut cfg = user("alice");
    cfg.min_profit_threshold = min_profit;
    cfg.min_spread_percentage = min_spread;

    Harness::new(
        sim,
        &[
            cost("x", Decimal::ZERO, dec!(0.25), Decimal::ZERO),
            cost("y", Decimal::ZERO, Decimal::ZERO, dec!(0.25)),
        ],
        &[cfg],
    )
    .await
}

#[tokio::test]
async fn test_scenario_a_emits_and_executes_at_threshold() {
    let h = scenario_a(dec!(0.5), dec!(0.5)).await;
    let summary = h.scheduler.run_cycle("alice").await.unwrap();

    assert_eq!(summary.opportunities_found, 1);
    assert_eq!(summary.executed, 1);
    assert_eq!(summary.errors, 0);

    let records = h.store.executions_for_user("alice", 10).await.unwrap();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!(record.opportunity.gross_profit, dec!(1));
    assert_eq!(record.opportunity.total_costs, dec!(0.5));
    assert_eq!(record.opportunity.net_profit, dec!(0.5));
    // Fills at quote with no venue fee: 1 × (101 - 100) - 0.50 transfer
    assert_eq!(record.actual_profit, Some(dec!(0.5)));

    let state = h.store.bot_state("alice").await.unwrap().unwrap();
    assert_eq!(state.trades_executed, 1);
    assert_eq!(state.total_profit, dec!(0.5));
    assert_eq!(state.daily_volume, dec!(100));
}

#[tokio::test]
async fn test_scenario_a_below_threshold_emits_nothing() {
    let h = scenario_a(dec!(0.51), dec!(0.5)).await;
    let summary = h.scheduler.run_cycle("alice").await.unwrap();

    assert_eq!(summary.opportunities_found, 0);
    assert_eq!(summary.executed, 0);
    assert!(h.sim.calls().is_empty());
}

#[tokio::test]
async fn test_scenario_b_spread_below_minimum() {
    let h = scenario_a(Decimal::ZERO, dec!(2)).await;
    let summary = h.scheduler.run_cycle("alice").await.unwrap();

    assert_eq!(summary.opportunities_found, 0);
    assert_eq!(summary.rejected, 0);
    assert!(h.sim.calls().is_empty());
    assert!(h.store.executions_for_user("alice", 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_scenario_c_sell_failure_discloses_position() {
    let sim = venues();
    sim.set_price("kraken", "BTC/USDT", dec!(100), Decimal::ZERO);
    sim.set_price("binance", "BTC/USDT", dec!(102), Decimal::ZERO);
    sim.fail_next(
        Operation::Sell,
        ExchangeError::new("binance", "Account has insufficient balance for requested action.").with_code(-2010),
    );
    let h = Harness::new(sim, &[free_cost("kraken"), free_cost("binance")], &[user("alice")]).await;

    let summary = h.scheduler.run_cycle("alice").await.unwrap();
    assert_eq!(summary.executed, 0);
    assert_eq!(summary.errors, 1);
    assert!(summary.failures[0].contains("UNBALANCED POSITION"), "{:?}", summary.failures);

    let record = h.store.executions_for_user("alice", 10).await.unwrap().remove(0);
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(record.failure, Some(FailureKind::UnbalancedPosition));
    let msg = record.error_message.clone().unwrap();
    assert!(msg.contains("1 BTC on kraken"), "{msg}");

    // Permanent: the sell is not retried
    assert_eq!(h.sim.call_count(Operation::Sell), 1);
    assert_eq!(h.sim.balance("kraken", AccountKind::Spot, "BTC"), dec!(1));

    // The filled buy still counts against today's volume
    let state = h.store.bot_state("alice").await.unwrap().unwrap();
    assert_eq!(state.trades_executed, 0);
    assert_eq!(state.daily_volume, dec!(100));
}

#[tokio::test(start_paused = true)]
async fn test_scenario_d_rate_limited_twice_then_completes() {
    let sim = venues();
    sim.set_price("binance", "BTC/USDT", dec!(100), Decimal::ZERO);
    sim.set_price("kraken", "BTC/USDT", dec!(102), Decimal::ZERO);
    for _ in 0..2 {
        sim.fail_next(
            Operation::Buy,
            ExchangeError::new("binance", "Too many requests").with_status(429),
        );
    }
    let h = Harness::new(sim, &[free_cost("binance"), free_cost("kraken")], &[user("alice")]).await;

    let summary = h.scheduler.run_cycle("alice").await.unwrap();
    assert_eq!(summary.executed, 1);

    let record = h.store.executions_for_user("alice", 10).await.unwrap().remove(0);
    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!(record.retry_count, 2);
    let rate_limits = record
        .adaptations_applied
        .iter()
        .filter(|a| a.contains("rate limit"))
        .count();
    assert_eq!(rate_limits, 2, "{:?}", record.adaptations_applied);
    assert_eq!(h.sim.call_count(Operation::Buy), 3);
    assert_eq!(record.actual_profit, Some(dec!(2)));
}

#[tokio::test]
async fn test_scenario_e_daily_limit_at_95_percent() {
    let h = Harness::new(venues(), &[], &[]).await;
    let mut cfg = user("alice");
    cfg.daily_limit_usd = dec!(1000);

    let mut state = BotState::new("alice", chrono::Utc::now());
    state.daily_volume = dec!(950);
    h.store.save_bot_state(&state).await.unwrap();

    let admission = h
        .governor
        .admit(&cfg, &opportunity("BTC/USDT"), chrono::Utc::now())
        .await
        .unwrap();
    match admission {
        Admission::Rejected(reason) => {
            assert_eq!(reason.code(), "daily_limit");
            assert!(matches!(reason, RejectionReason::DailyLimit { .. }));
        }
        Admission::Admitted(record) => panic!("admitted {record}"),
    }
    assert_eq!(h.governor.in_flight_count("alice").await, 0);
}

#[tokio::test]
async fn test_scenario_e_through_a_cycle() {
    let sim = venues();
    sim.set_price("binance", "BTC/USDT", dec!(100), Decimal::ZERO);
    sim.set_price("kraken", "BTC/USDT", dec!(102), Decimal::ZERO);
    let mut cfg = user("alice");
    cfg.daily_limit_usd = dec!(1000);
    let h = Harness::new(sim, &[free_cost("binance"), free_cost("kraken")], &[cfg]).await;

    let mut state = BotState::new("alice", chrono::Utc::now());
    state.daily_volume = dec!(950);
    h.store.save_bot_state(&state).await.unwrap();

    let summary = h.scheduler.run_cycle("alice").await.unwrap();
    assert_eq!(summary.opportunities_found, 1);
    assert_eq!(summary.rejected, 1);
    assert_eq!(summary.executed, 0);
    assert!(summary.rejections[0].reason.starts_with("daily_limit"));
    assert!(h.sim.calls().is_empty());
}
