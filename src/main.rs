//! XARB: cross-exchange arbitrage engine.
//!
//! Entry point. Loads configuration, initialises structured logging,
//! seeds the store, wires the engine together and runs every enabled
//! user's bot until Ctrl+C.

use anyhow::{bail, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use xarb::api::{self, ApiState};
use xarb::config::{self, Mode};
use xarb::engine::costs::CostCache;
use xarb::engine::executor::ExecutionOrchestrator;
use xarb::engine::scanner::OpportunityScanner;
use xarb::engine::scheduler::BotScheduler;
use xarb::exchange::simulated::SimulatedExchange;
use xarb::exchange::ExchangeClient;
use xarb::feed::http::HttpPriceFeed;
use xarb::feed::PriceFeed;
use xarb::storage::{self, Store};
use xarb::strategy::governor::ConcurrencyGovernor;
use xarb::types::ExecutionStatus;

const BANNER: &str = r#"
 __  __    _    ____  ____
 \ \/ /   / \  |  _ \| __ )
  \  /   / _ \ | |_) |  _ \
  /  \  / ___ \|  _ <| |_) |
 /_/\_\/_/   \_\_| \_\____/

  Cost-aware cross-exchange arbitrage
  v0.1.0
"#;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let cfg = config::AppConfig::from_env()?;

    init_logging();

    println!("{BANNER}");
    info!(
        mode = ?cfg.engine.mode,
        users = cfg.users.len(),
        cost_rows = cfg.costs.len(),
        storage = %cfg.storage.url,
        "XARB starting up"
    );

    // -- Storage -----------------------------------------------------------

    let store = storage::open(&cfg.storage.url).await?;
    seed_store(&*store, &cfg).await?;

    // -- Exchange and prices -------------------------------------------------

    let (exchange, feed): (Arc<dyn ExchangeClient>, Arc<dyn PriceFeed>) = match cfg.engine.mode {
        Mode::Live => bail!("live mode needs an exchange client; only paper mode ships"),
        Mode::Paper => {
            let sim = Arc::new(paper_exchange(&cfg));
            let feed: Arc<dyn PriceFeed> = match &cfg.feed.url {
                Some(url) => Arc::new(HttpPriceFeed::new(url, Duration::from_secs(cfg.feed.timeout_secs))?),
                None => sim.clone(),
            };
            info!(
                fee_rate = %cfg.paper.fee_rate,
                slippage_bps = %cfg.paper.slippage_bps,
                quotes = cfg.paper.prices.len(),
                feed = feed.name(),
                "Paper trading"
            );
            (sim as Arc<dyn ExchangeClient>, feed)
        }
    };

    // -- Engine --------------------------------------------------------------

    let governor = Arc::new(ConcurrencyGovernor::new(
        store.clone(),
        cfg.risk_policy(),
        cfg.blackout_schedule(),
    ));
    let orchestrator = Arc::new(ExecutionOrchestrator::new(
        exchange,
        store.clone(),
        cfg.retry_policy(),
    ));
    let costs = CostCache::new(store.clone(), Duration::from_secs(cfg.engine.cost_cache_ttl_secs));
    let scanner = OpportunityScanner::new(cfg.scanner_config(), cfg.risk_policy());
    let scheduler = Arc::new(BotScheduler::new(
        store.clone(),
        feed,
        costs,
        scanner,
        governor,
        orchestrator,
        cfg.scheduler_config(),
    ));

    // Executions a previous run left behind, before anything new is admitted
    let reconciled = scheduler.reconcile().await?;
    if !reconciled.is_empty() {
        let failed = reconciled
            .iter()
            .filter(|r| r.status != ExecutionStatus::Completed)
            .count();
        warn!(count = reconciled.len(), failed, "Closed out executions from the previous run");
    }

    if cfg.api.enabled {
        api::spawn_api(
            Arc::new(ApiState {
                scheduler: scheduler.clone(),
            }),
            cfg.api.port,
        )
        .await?;
    }

    // -- Main loop -------------------------------------------------------

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let bots = tokio::spawn(scheduler.clone().run(shutdown_rx));

    info!(
        min_interval_secs = cfg.engine.min_interval_secs,
        "Entering main loop. Press Ctrl+C to stop."
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received.");
    let _ = shutdown_tx.send(true);
    if let Err(e) = bots.await {
        warn!(error = %e, "Scheduler task ended abnormally");
    }

    info!("XARB shut down cleanly.");
    Ok(())
}

/// Cost rows from the file always win. Users are only inserted when the
/// store has no config for them yet, so API edits survive restarts.
async fn seed_store(store: &dyn Store, cfg: &config::AppConfig) -> Result<()> {
    for cost in &cfg.costs {
        store.save_transaction_cost(cost).await?;
    }
    let mut seeded = 0;
    for user in &cfg.users {
        if store.user_config(&user.user_id).await?.is_none() {
            store.save_user_config(user).await?;
            seeded += 1;
        }
    }
    info!(costs = cfg.costs.len(), users_seeded = seeded, "Store seeded");
    Ok(())
}

fn paper_exchange(cfg: &config::AppConfig) -> SimulatedExchange {
    let sim = SimulatedExchange::new()
        .with_fee_rate(cfg.paper.fee_rate)
        .with_slippage_bps(cfg.paper.slippage_bps);
    for quote in &cfg.paper.prices {
        sim.set_price(&quote.exchange, &quote.symbol, quote.price, quote.volume);
    }
    for balance in &cfg.paper.balances {
        sim.set_balance(&balance.exchange, balance.account, &balance.asset, balance.amount);
    }
    for cost in &cfg.costs {
        match (cost.quantity_step, cost.symbol.as_str()) {
            (Some(step), "*") => sim.set_default_quantity_step(&cost.exchange, step),
            (Some(step), symbol) => sim.set_quantity_step(&cost.exchange, symbol, step),
            (None, _) => {}
        }
    }
    sim
}

fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("xarb=info"));

    let json_logging = std::env::var("XARB_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
