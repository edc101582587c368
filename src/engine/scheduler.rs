//! Bot scheduler: the per-user scan → admit → execute cycle.
//!
//! `run_cycle` is the single entry point, used both by the per-user timers
//! started from `run` and by manual "check now" requests. At most one cycle
//! per user runs at a time; a second caller gets `CycleInProgress`.
//! `reconcile` closes out what a previous process left unfinished.

use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::costs::CostCache;
use super::executor::ExecutionOrchestrator;
use super::scanner::OpportunityScanner;
use crate::feed::PriceFeed;
use crate::storage::Store;
use crate::strategy::governor::{Admission, ConcurrencyGovernor};
use crate::types::{
    normalize_symbol, ArbitrageOpportunity, CycleSummary, EngineError, ExecutionRecord, ExecutionStatus,
    FailureKind, RejectionNote, RejectionReason, UserTradingConfig,
};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// No user's cycle runs more often than this.
    pub min_interval: Duration,
    /// How often `run` re-reads the user list.
    pub user_refresh_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(5),
            user_refresh_interval: Duration::from_secs(60),
        }
    }
}

// ---------------------------------------------------------------------------
// Single-flight guard
// ---------------------------------------------------------------------------

struct CycleGuard<'a> {
    active: &'a Mutex<HashSet<String>>,
    user_id: String,
}

impl<'a> CycleGuard<'a> {
    fn acquire(active: &'a Mutex<HashSet<String>>, user_id: &str) -> Result<Self, EngineError> {
        let mut set = active.lock().unwrap_or_else(|e| e.into_inner());
        if !set.insert(user_id.to_string()) {
            return Err(EngineError::CycleInProgress {
                user_id: user_id.to_string(),
            });
        }
        Ok(Self {
            active,
            user_id: user_id.to_string(),
        })
    }
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.user_id);
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct BotScheduler {
    store: Arc<dyn Store>,
    feed: Arc<dyn PriceFeed>,
    costs: CostCache,
    scanner: OpportunityScanner,
    governor: Arc<ConcurrencyGovernor>,
    orchestrator: Arc<ExecutionOrchestrator>,
    config: SchedulerConfig,
    active: Mutex<HashSet<String>>,
}

impl BotScheduler {
    pub fn new(
        store: Arc<dyn Store>,
        feed: Arc<dyn PriceFeed>,
        costs: CostCache,
        scanner: OpportunityScanner,
        governor: Arc<ConcurrencyGovernor>,
        orchestrator: Arc<ExecutionOrchestrator>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            feed,
            costs,
            scanner,
            governor,
            orchestrator,
            config,
            active: Mutex::new(HashSet::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn governor(&self) -> &Arc<ConcurrencyGovernor> {
        &self.governor
    }

    pub fn orchestrator(&self) -> &Arc<ExecutionOrchestrator> {
        &self.orchestrator
    }

    pub fn costs(&self) -> &CostCache {
        &self.costs
    }

    /// Timer period for a user: their interval, never below the floor.
    pub fn interval_for(&self, config: &UserTradingConfig) -> Duration {
        Duration::from_secs(config.check_interval_secs).max(self.config.min_interval)
    }

    /// One full cycle for `user_id`.
    ///
    /// Candidates are admitted in rank order until the list runs out or the
    /// user's concurrency is saturated. Admitted executions run as separate
    /// tasks, each bounded by the orchestrator's execution budget, and are
    /// settled into the user's state as they finish.
    pub async fn run_cycle(&self, user_id: &str) -> Result<CycleSummary, EngineError> {
        let _guard = CycleGuard::acquire(&self.active, user_id)?;
        let mut summary = CycleSummary::new(user_id);

        let config = self
            .store
            .user_config(user_id)
            .await?
            .ok_or_else(|| EngineError::ConfigMissing {
                user_id: user_id.to_string(),
            })?;

        if !config.is_enabled {
            debug!(user_id, "Bot disabled, skipping cycle");
            summary.skipped = true;
            summary.finished_at = Utc::now();
            return Ok(summary);
        }

        let snapshots = match self.feed.snapshots(&config.symbols).await {
            Ok(s) => s,
            Err(e) => {
                warn!(user_id, feed = self.feed.name(), error = %e, "Price feed failed");
                summary.errors += 1;
                summary.failures.push(format!("price feed {}: {e:#}", self.feed.name()));
                summary.finished_at = Utc::now();
                return Ok(summary);
            }
        };
        let costs = self.costs.model().await?;

        let now = Utc::now();
        let report = self.scanner.scan(&snapshots, &config, &costs, now);
        summary.opportunities_found = report.opportunities.len();
        if report.opportunities.is_empty() {
            debug!(
                user_id,
                reason = %EngineError::NoViableOpportunity(format!("{} snapshots", snapshots.len())),
                "Nothing to do"
            );
        }

        let admitted = self.admit_ranked(&config, report.opportunities, &mut summary).await;

        // Each task settles its own execution, so the reservation is
        // released even if this future is dropped mid-cycle.
        let mut running: FuturesUnordered<_> = admitted
            .into_iter()
            .map(|record| {
                let id = record.id;
                let orchestrator = self.orchestrator.clone();
                let store = self.store.clone();
                let governor = self.governor.clone();
                let cfg = config.clone();
                let handle = tokio::spawn(async move {
                    let finished = run_to_end(&orchestrator, store.as_ref(), record, &cfg).await;
                    let settled = governor.settle(&finished, Utc::now()).await;
                    (finished, settled)
                });
                async move { (id, handle.await) }
            })
            .collect();

        while let Some((id, joined)) = running.next().await {
            let (finished, settled) = match joined {
                Ok(outcome) => outcome,
                Err(join) => {
                    error!(user_id, execution_id = %id, error = %join, "Execution task lost");
                    summary.errors += 1;
                    summary.failures.push(format!("execution {id} task lost: {join}"));
                    continue;
                }
            };

            match finished.status {
                ExecutionStatus::Completed => summary.executed += 1,
                _ => {
                    summary.errors += 1;
                    summary
                        .failures
                        .push(finished.error_message.clone().unwrap_or_else(|| finished.to_string()));
                }
            }

            if let Err(e) = settled {
                error!(user_id, execution_id = %finished.id, error = %e, "Failed to settle execution");
                summary.errors += 1;
                summary.failures.push(e.to_string());
            }
        }

        summary.finished_at = Utc::now();
        info!(
            user_id,
            found = summary.opportunities_found,
            executed = summary.executed,
            rejected = summary.rejected,
            errors = summary.errors,
            elapsed_ms = (summary.finished_at - summary.started_at).num_milliseconds(),
            "Cycle complete"
        );
        Ok(summary)
    }

    /// Admit candidates best-first, one per symbol.
    async fn admit_ranked(
        &self,
        config: &UserTradingConfig,
        opportunities: Vec<ArbitrageOpportunity>,
        summary: &mut CycleSummary,
    ) -> Vec<ExecutionRecord> {
        let mut admitted = Vec::new();
        let mut symbols = HashSet::new();

        for opportunity in opportunities {
            if !symbols.insert(normalize_symbol(&opportunity.symbol)) {
                continue;
            }
            match self.governor.admit(config, &opportunity, Utc::now()).await {
                Ok(Admission::Admitted(record)) => admitted.push(record),
                Ok(Admission::Rejected(reason)) => {
                    summary.rejected += 1;
                    summary.rejections.push(RejectionNote {
                        symbol: opportunity.symbol.clone(),
                        buy_exchange: opportunity.buy_exchange.clone(),
                        sell_exchange: opportunity.sell_exchange.clone(),
                        reason: reason.to_string(),
                    });
                    if matches!(reason, RejectionReason::MaxConcurrency { .. }) {
                        break;
                    }
                }
                Err(e) => {
                    warn!(user_id = %config.user_id, symbol = %opportunity.symbol, error = %e, "Admission error");
                    summary.errors += 1;
                    summary.failures.push(e.to_string());
                }
            }
        }
        admitted
    }

    /// Finish executions a previous process left unfinished.
    ///
    /// A record holding a filled buy is resumed at its sell leg. Anything
    /// earlier is closed without trading: its prices are stale. Every
    /// record is folded into its user's state. Call before `run`.
    pub async fn reconcile(&self) -> Result<Vec<ExecutionRecord>, EngineError> {
        let unfinished = self.store.unfinished_executions().await?;
        if unfinished.is_empty() {
            return Ok(Vec::new());
        }
        info!(count = unfinished.len(), "Reconciling unfinished executions");

        let mut closed = Vec::with_capacity(unfinished.len());
        for record in unfinished {
            let finished = if record.buy_fill.is_some() {
                let config = self
                    .store
                    .user_config(&record.user_id)
                    .await?
                    .unwrap_or_else(|| UserTradingConfig::new(&record.user_id));
                run_to_end(&self.orchestrator, self.store.as_ref(), record, &config).await
            } else {
                let reason = match record.status {
                    ExecutionStatus::Executing => format!(
                        "interrupted by a restart during the buy on {}: outcome unknown, check {} holdings there",
                        record.opportunity.buy_exchange,
                        record.opportunity.base_asset()
                    ),
                    _ => "interrupted by a restart before the buy: nothing traded".to_string(),
                };
                close_abandoned(self.store.as_ref(), record, reason).await
            };

            info!(
                execution_id = %finished.id,
                user_id = %finished.user_id,
                status = %finished.status,
                "Reconciled execution"
            );
            self.governor.settle_recovered(&finished, Utc::now()).await?;
            closed.push(finished);
        }
        Ok(closed)
    }

    // -----------------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------------

    /// Drive every enabled user on their own interval until `shutdown`
    /// flips to true. The user list is re-read periodically so config
    /// changes take effect without a restart.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut timers: HashMap<String, (Duration, JoinHandle<()>)> = HashMap::new();
        let mut refresh = tokio::time::interval(self.config.user_refresh_interval);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            floor_secs = self.config.min_interval.as_secs(),
            refresh_secs = self.config.user_refresh_interval.as_secs(),
            "Scheduler started"
        );

        loop {
            tokio::select! {
                _ = refresh.tick() => {
                    if let Err(e) = self.sync_timers(&mut timers).await {
                        warn!(error = %e, "Failed to refresh user list");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        for (user_id, (_, handle)) in timers.drain() {
            handle.abort();
            self.mark_running(&user_id, false).await;
        }
        info!("Scheduler stopped");
    }

    async fn sync_timers(
        self: &Arc<Self>,
        timers: &mut HashMap<String, (Duration, JoinHandle<()>)>,
    ) -> Result<(), EngineError> {
        let configs = self.store.list_user_configs().await?;
        let wanted: HashMap<String, Duration> = configs
            .iter()
            .filter(|c| c.is_enabled)
            .map(|c| (c.user_id.clone(), self.interval_for(c)))
            .collect();

        let stale: Vec<String> = timers
            .iter()
            .filter(|(user, (period, _))| wanted.get(*user) != Some(period))
            .map(|(user, _)| user.clone())
            .collect();
        for user_id in stale {
            if let Some((_, handle)) = timers.remove(&user_id) {
                handle.abort();
            }
            if !wanted.contains_key(&user_id) {
                info!(user_id = %user_id, "Stopping bot");
                self.mark_running(&user_id, false).await;
            }
        }

        for (user_id, period) in wanted {
            if timers.contains_key(&user_id) {
                continue;
            }
            info!(user_id = %user_id, interval_secs = period.as_secs(), "Starting bot");
            self.mark_running(&user_id, true).await;
            let handle = tokio::spawn(self.clone().user_loop(user_id.clone(), period));
            timers.insert(user_id, (period, handle));
        }
        Ok(())
    }

    async fn user_loop(self: Arc<Self>, user_id: String, period: Duration) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.run_cycle(&user_id).await {
                Ok(summary) => debug!(user_id = %user_id, "{summary}"),
                Err(EngineError::CycleInProgress { .. }) => {
                    debug!(user_id = %user_id, "Previous cycle still running, skipping tick");
                }
                Err(e) => warn!(user_id = %user_id, error = %e, "Cycle failed"),
            }
        }
    }

    async fn mark_running(&self, user_id: &str, running: bool) {
        if let Err(e) = self.governor.set_running(user_id, running, Utc::now()).await {
            warn!(user_id, error = %e, "Failed to update running flag");
        }
    }
}

/// Execute within the orchestrator's budget; whatever stops it short is
/// closed out from the latest stored progress.
async fn run_to_end(
    orchestrator: &ExecutionOrchestrator,
    store: &dyn Store,
    record: ExecutionRecord,
    config: &UserTradingConfig,
) -> ExecutionRecord {
    let budget = orchestrator.execution_budget();
    let id = record.id;
    let run = AssertUnwindSafe(tokio::time::timeout(budget, orchestrator.execute(record.clone(), config)));

    let reason = match run.catch_unwind().await {
        Ok(Ok(Ok(done))) => return done,
        Ok(Ok(Err(e))) => e.to_string(),
        Ok(Err(_)) => {
            EngineError::InternalState(format!("execution {id} exceeded its {}s budget", budget.as_secs())).to_string()
        }
        Err(_) => EngineError::InternalState(format!("execution {id} panicked")).to_string(),
    };
    close_abandoned(store, record, reason).await
}

/// Mark an execution that did not come back on its own as failed.
///
/// Uses the latest persisted progress, so a filled buy leg is still
/// counted and disclosed.
async fn close_abandoned(store: &dyn Store, record: ExecutionRecord, reason: String) -> ExecutionRecord {
    let mut latest = match store.execution(record.id).await {
        Ok(Some(stored)) => stored,
        _ => record,
    };
    if latest.is_terminal() {
        return latest;
    }

    latest.status = ExecutionStatus::Failed;
    latest.completed_at = Some(Utc::now());
    match latest.buy_fill.clone() {
        Some(buy) => {
            let err = EngineError::UnbalancedPosition {
                exchange: buy.exchange,
                asset: latest.opportunity.base_asset(),
                quantity: buy.quantity.normalize(),
                message: reason,
            };
            latest.failure = Some(FailureKind::UnbalancedPosition);
            latest.error_message = Some(err.to_string());
            error!(execution_id = %latest.id, error = %err, "Abandoned execution holds a position");
        }
        None => {
            latest.failure = Some(FailureKind::Internal);
            latest.error_message = Some(reason);
            warn!(execution_id = %latest.id, "Abandoned execution before its buy leg");
        }
    }

    if let Err(e) = store.save_execution(&latest).await {
        error!(execution_id = %latest.id, error = %e, "Failed to persist abandoned execution");
    }
    latest
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
