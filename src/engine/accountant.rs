//! Accountant: folds finished executions into per-user bot state.
//!
//! Pure functions over `BotState`. Callers hold the per-user lock while
//! applying them, so concurrent completions never lose an update.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::types::{BotState, ExecutionRecord, ExecutionStatus};

pub struct Accountant;

impl Accountant {
    /// Reset `daily_volume` when `now` is on a later UTC day than the
    /// volume was accumulated on. Returns whether a reset happened.
    pub fn roll_day(state: &mut BotState, now: DateTime<Utc>) -> bool {
        let today = now.date_naive();
        if today <= state.volume_date {
            return false;
        }
        info!(
            user_id = %state.user_id,
            previous_day = %state.volume_date,
            volume = format!("${:.2}", state.daily_volume),
            "Daily volume reset"
        );
        state.daily_volume = Decimal::ZERO;
        state.volume_date = today;
        true
    }

    /// Fold one terminal record into the state.
    ///
    /// Completed records add a trade, their realised profit and their
    /// volume. Failed records add volume only if the buy leg filled.
    /// Non-terminal records are ignored; returns whether anything changed.
    pub fn apply(state: &mut BotState, record: &ExecutionRecord) -> bool {
        let volume = record.traded_volume();
        match record.status {
            ExecutionStatus::Completed => {
                let profit = record.actual_profit.unwrap_or(Decimal::ZERO);
                state.trades_executed += 1;
                state.total_profit += profit;
                state.daily_volume += volume;
                state.last_execution_time = Some(record.completed_at.unwrap_or_else(Utc::now));
                info!(
                    user_id = %state.user_id,
                    execution_id = %record.id,
                    profit = format!("${:.4}", profit),
                    total_profit = format!("${:.4}", state.total_profit),
                    trades = state.trades_executed,
                    "Execution settled"
                );
                true
            }
            ExecutionStatus::Failed if volume > Decimal::ZERO => {
                state.daily_volume += volume;
                state.last_execution_time = Some(record.completed_at.unwrap_or_else(Utc::now));
                true
            }
            ExecutionStatus::Failed => false,
            other => {
                debug!(execution_id = %record.id, status = %other, "Not folding non-terminal record");
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
