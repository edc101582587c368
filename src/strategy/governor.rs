//! Per-user admission control.
//!
//! The governor owns each user's live book: the persisted `BotState`, the
//! executions currently in flight, and the capital those executions have
//! reserved against today's limit. Admission and settlement both run under
//! the user's lock, so limits hold under any number of concurrent callers.
//!
//! Admission rules, in order:
//! 1. today's volume + reservations + amount must not exceed the daily limit
//! 2. in-flight executions must be below `max_concurrent_operations`
//! 3. no blackout window may be active
//! 4. compounding may enlarge the amount, never past the remaining headroom

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use super::blackout::BlackoutSchedule;
use super::risk::RiskPolicy;
use crate::engine::accountant::Accountant;
use crate::storage::Store;
use crate::types::{
    floor_to_step, normalize_symbol, ArbitrageOpportunity, BotState, EngineError, ExecutionRecord,
    RejectionReason, UserTradingConfig,
};

/// Outcome of one admission check.
#[derive(Debug, Clone)]
pub enum Admission {
    /// Reserved and persisted as `Pending`; hand it to the orchestrator.
    Admitted(ExecutionRecord),
    Rejected(RejectionReason),
}

#[derive(Debug, Clone)]
struct Reservation {
    symbol: String,
    amount: Decimal,
}

#[derive(Debug)]
struct UserBook {
    state: BotState,
    in_flight: HashMap<Uuid, Reservation>,
    reserved: Decimal,
}

pub struct ConcurrencyGovernor {
    store: Arc<dyn Store>,
    risk: RiskPolicy,
    blackout: BlackoutSchedule,
    books: Mutex<HashMap<String, Arc<Mutex<UserBook>>>>,
}

impl ConcurrencyGovernor {
    pub fn new(store: Arc<dyn Store>, risk: RiskPolicy, blackout: BlackoutSchedule) -> Self {
        Self {
            store,
            risk,
            blackout,
            books: Mutex::new(HashMap::new()),
        }
    }

    pub fn risk(&self) -> &RiskPolicy {
        &self.risk
    }

    /// The user's book, loading persisted state on first use.
    async fn book(&self, user_id: &str, now: DateTime<Utc>) -> Result<Arc<Mutex<UserBook>>, EngineError> {
        let mut books = self.books.lock().await;
        if let Some(book) = books.get(user_id) {
            return Ok(book.clone());
        }
        let state = self
            .store
            .bot_state(user_id)
            .await?
            .unwrap_or_else(|| BotState::new(user_id, now));
        let book = Arc::new(Mutex::new(UserBook {
            state,
            in_flight: HashMap::new(),
            reserved: Decimal::ZERO,
        }));
        books.insert(user_id.to_string(), book.clone());
        Ok(book)
    }

    /// Decide whether `opportunity` may execute now for this user.
    ///
    /// A second admission for a symbol the user already has in flight is an
    /// `InternalState` error: callers de-duplicate candidates first.
    pub async fn admit(
        &self,
        config: &UserTradingConfig,
        opportunity: &ArbitrageOpportunity,
        now: DateTime<Utc>,
    ) -> Result<Admission, EngineError> {
        let book = self.book(&config.user_id, now).await?;
        let mut book = book.lock().await;
        Accountant::roll_day(&mut book.state, now);

        let symbol = normalize_symbol(&opportunity.symbol);
        if book.in_flight.values().any(|r| r.symbol == symbol) {
            return Err(EngineError::InternalState(format!(
                "user {} already has an execution in flight for {symbol}",
                config.user_id
            )));
        }

        let base = opportunity.investment;
        let used = book.state.daily_volume + book.reserved;
        let limit = config.daily_limit_usd;

        let rejection = if used + base > limit {
            Some(RejectionReason::DailyLimit {
                requested: base,
                used,
                limit,
            })
        } else if book.in_flight.len() as u32 >= config.max_concurrent_operations {
            Some(RejectionReason::MaxConcurrency {
                in_flight: book.in_flight.len() as u32,
                max: config.max_concurrent_operations,
            })
        } else {
            self.blackout
                .active_window(now)
                .map(|w| RejectionReason::Blackout {
                    window_start: w.start,
                    window_end: w.end,
                })
        };

        if let Some(reason) = rejection {
            info!(
                user_id = %config.user_id,
                symbol = %symbol,
                buy = %opportunity.buy_exchange,
                sell = %opportunity.sell_exchange,
                reason = reason.code(),
                detail = %reason,
                "Admission rejected"
            );
            return Ok(Admission::Rejected(reason));
        }

        let (amount, quantity) = self.size_with_compounding(config, opportunity, book.state.total_profit, limit - used);

        let record = ExecutionRecord::new(&config.user_id, opportunity.clone(), amount, quantity);
        self.store.save_execution(&record).await?;

        book.reserved += amount;
        book.in_flight.insert(
            record.id,
            Reservation {
                symbol: symbol.clone(),
                amount,
            },
        );

        info!(
            user_id = %config.user_id,
            execution_id = %record.id,
            symbol = %symbol,
            amount = format!("${:.2}", amount),
            quantity = %quantity,
            in_flight = book.in_flight.len(),
            "Opportunity admitted"
        );
        Ok(Admission::Admitted(record))
    }

    /// Trade size after compounding, clamped to `headroom`.
    ///
    /// Without a bonus the scanner's sizing stands untouched. With one, the
    /// quantity is re-derived from the enlarged amount and floored to both
    /// legs' lot sizes, and the amount re-priced from that quantity.
    fn size_with_compounding(
        &self,
        config: &UserTradingConfig,
        opportunity: &ArbitrageOpportunity,
        total_profit: Decimal,
        headroom: Decimal,
    ) -> (Decimal, Decimal) {
        let base = opportunity.investment;
        let bonus = self
            .risk
            .compounding_bonus(config, total_profit)
            .min(headroom - base)
            .max(Decimal::ZERO);
        if bonus.is_zero() || opportunity.buy_price <= Decimal::ZERO {
            return (base, opportunity.quantity);
        }

        let mut quantity = (base + bonus) / opportunity.buy_price;
        for step in [opportunity.buy_quantity_step, opportunity.sell_quantity_step].into_iter().flatten() {
            quantity = floor_to_step(quantity, step);
        }
        if quantity <= opportunity.quantity {
            return (base, opportunity.quantity);
        }
        let amount = quantity * opportunity.buy_price;
        debug!(
            user_id = %config.user_id,
            bonus = format!("${:.2}", bonus),
            amount = format!("${:.2}", amount),
            "Compounding applied"
        );
        (amount, quantity)
    }

    /// Release a finished execution's reservation and fold it into the
    /// user's state, persisting the result. Runs under the user's lock.
    pub async fn settle(&self, record: &ExecutionRecord, now: DateTime<Utc>) -> Result<BotState, EngineError> {
        let book = self.book(&record.user_id, now).await?;
        let mut book = book.lock().await;

        let Some(reservation) = book.in_flight.remove(&record.id) else {
            return Err(EngineError::InternalState(format!(
                "execution {} is not in flight for user {}",
                record.id, record.user_id
            )));
        };
        book.reserved = (book.reserved - reservation.amount).max(Decimal::ZERO);

        Accountant::roll_day(&mut book.state, now);
        Accountant::apply(&mut book.state, record);
        self.store.save_bot_state(&book.state).await?;
        Ok(book.state.clone())
    }

    /// Fold in an execution this process never admitted, such as one
    /// finished during startup reconciliation. Any reservation for it is
    /// released as well.
    pub async fn settle_recovered(&self, record: &ExecutionRecord, now: DateTime<Utc>) -> Result<BotState, EngineError> {
        let book = self.book(&record.user_id, now).await?;
        let mut book = book.lock().await;

        if let Some(reservation) = book.in_flight.remove(&record.id) {
            book.reserved = (book.reserved - reservation.amount).max(Decimal::ZERO);
        }
        Accountant::roll_day(&mut book.state, now);
        Accountant::apply(&mut book.state, record);
        self.store.save_bot_state(&book.state).await?;
        Ok(book.state.clone())
    }

    /// Current state, including the day rollover.
    pub async fn bot_state(&self, user_id: &str, now: DateTime<Utc>) -> Result<BotState, EngineError> {
        let book = self.book(user_id, now).await?;
        let mut book = book.lock().await;
        Accountant::roll_day(&mut book.state, now);
        Ok(book.state.clone())
    }

    pub async fn in_flight_count(&self, user_id: &str) -> usize {
        let book = self.books.lock().await.get(user_id).cloned();
        match book {
            Some(book) => book.lock().await.in_flight.len(),
            None => 0,
        }
    }

    /// Capital reserved by in-flight executions.
    pub async fn reserved(&self, user_id: &str) -> Decimal {
        let book = self.books.lock().await.get(user_id).cloned();
        match book {
            Some(book) => book.lock().await.reserved,
            None => Decimal::ZERO,
        }
    }

    /// Flag whether a scheduler timer currently drives this user.
    pub async fn set_running(&self, user_id: &str, running: bool, now: DateTime<Utc>) -> Result<(), EngineError> {
        let book = self.book(user_id, now).await?;
        let mut book = book.lock().await;
        if book.state.is_running != running {
            book.state.is_running = running;
            self.store.save_bot_state(&book.state).await?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
