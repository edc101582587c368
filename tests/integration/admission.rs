//! Admission limits under parallel load.

use chrono::Utc;
use proptest::prelude::*;
use rust_decimal::Decimal;
use std::sync::Arc;

use xarb::strategy::governor::Admission;
use xarb::types::BotState;

use crate::harness::{opportunity, user, venues, Harness};

struct Outcome {
    admitted: Vec<Decimal>,
    in_flight: usize,
}

async fn admit_in_parallel(
    max_concurrent: u32,
    attempts: usize,
    limit: Decimal,
    prior_volume: Decimal,
    total_profit: Decimal,
    compounding: bool,
) -> Outcome {
    let h = Harness::new(venues(), &[], &[]).await;
    let mut state = BotState::new("alice", Utc::now());
    state.daily_volume = prior_volume;
    state.total_profit = total_profit;
    h.store.save_bot_state(&state).await.unwrap();

    let mut cfg = user("alice");
    cfg.max_concurrent_operations = max_concurrent;
    cfg.daily_limit_usd = limit;
    cfg.compounding_enabled = compounding;
    let cfg = Arc::new(cfg);

    let handles: Vec<_> = (0..attempts)
        .map(|i| {
            let governor = h.governor.clone();
            let cfg = cfg.clone();
            tokio::spawn(async move {
                let opp = opportunity(&format!("C{i}/USDT"));
                governor.admit(&cfg, &opp, Utc::now()).await
            })
        })
        .collect();

    let mut admitted = Vec::new();
    for handle in handles {
        if let Admission::Admitted(record) = handle.await.unwrap().unwrap() {
            admitted.push(record.amount_invested);
        }
    }
    let in_flight = h.governor.in_flight_count("alice").await;
    Outcome { admitted, in_flight }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_parallel_admissions_never_exceed_limits(
        max_concurrent in 1u32..6,
        attempts in 1usize..24,
        limit_units in 1i64..20,
        prior_units in 0i64..10,
        profit in 0i64..400,
        compounding in any::<bool>(),
    ) {
        let limit = Decimal::from(limit_units * 100);
        let prior = Decimal::from(prior_units * 100);
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .unwrap();
        let outcome = runtime.block_on(admit_in_parallel(
            max_concurrent,
            attempts,
            limit,
            prior,
            Decimal::from(profit),
            compounding,
        ));

        prop_assert!(outcome.admitted.len() <= max_concurrent as usize);
        prop_assert_eq!(outcome.admitted.len(), outcome.in_flight);

        let total: Decimal = outcome.admitted.iter().copied().sum();
        prop_assert!(total.is_zero() || prior + total <= limit, "prior {} + admitted {} > limit {}", prior, total, limit);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_saturates_exactly_at_max_concurrency() {
    let outcome = admit_in_parallel(3, 10, Decimal::from(10_000), Decimal::ZERO, Decimal::ZERO, false).await;
    assert_eq!(outcome.admitted.len(), 3);
    assert_eq!(outcome.in_flight, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_compounding_never_breaches_daily_limit() {
    // $900 used, $1000 limit, $10k profit: compounding would add $5k
    let outcome = admit_in_parallel(5, 5, Decimal::from(1000), Decimal::from(900), Decimal::from(10_000), true).await;
    assert_eq!(outcome.admitted, vec![Decimal::from(100)]);
}
