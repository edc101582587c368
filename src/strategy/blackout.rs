//! Blackout windows around funding settlement.
//!
//! Perpetual funding settles at fixed UTC hours; prices around those
//! instants are noisy and transfers slow down. New executions are not
//! admitted within `padding` of any settlement instant.

use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// A closed interval during which admissions are suspended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlackoutWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl BlackoutWindow {
    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.start <= t && t <= self.end
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlackoutSchedule {
    /// Settlement hours, UTC.
    settlement_hours: Vec<u32>,
    padding: Duration,
}

impl Default for BlackoutSchedule {
    /// Funding at 00:00, 08:00 and 16:00 UTC, ±30 minutes.
    fn default() -> Self {
        Self::new(vec![0, 8, 16], 30)
    }
}

impl BlackoutSchedule {
    /// Hours outside 0..24 are ignored.
    pub fn new(settlement_hours: Vec<u32>, padding_minutes: i64) -> Self {
        let mut hours: Vec<u32> = settlement_hours.into_iter().filter(|h| *h < 24).collect();
        hours.sort_unstable();
        hours.dedup();
        Self {
            settlement_hours: hours,
            padding: Duration::minutes(padding_minutes.max(0)),
        }
    }

    /// No windows at all.
    pub fn disabled() -> Self {
        Self {
            settlement_hours: Vec::new(),
            padding: Duration::zero(),
        }
    }

    /// The window `now` falls in, if any.
    ///
    /// Settlement instants on the previous and next day are checked too,
    /// so a window straddling midnight is found from either side.
    pub fn active_window(&self, now: DateTime<Utc>) -> Option<BlackoutWindow> {
        if self.padding <= Duration::zero() {
            return None;
        }
        let today = now.date_naive();
        [today.pred_opt(), Some(today), today.succ_opt()]
            .into_iter()
            .flatten()
            .flat_map(|day| {
                self.settlement_hours.iter().filter_map(move |hour| {
                    NaiveTime::from_hms_opt(*hour, 0, 0).map(|t| day.and_time(t).and_utc())
                })
            })
            .map(|instant| BlackoutWindow {
                start: instant - self.padding,
                end: instant + self.padding,
            })
            .find(|w| w.contains(now))
    }
}
