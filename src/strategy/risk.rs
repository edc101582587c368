//! Risk-level strategy table.
//!
//! Each `RiskLevel` maps to a tier of plain numeric multipliers: how much
//! of the per-trade investment cap the scanner may size into, and what
//! share of accumulated profit compounding may add to a trade.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::types::{RiskLevel, UserTradingConfig};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Multipliers for one risk level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskTier {
    /// Fraction of `max_investment_per_trade` a trade may use.
    pub position_size_factor: Decimal,
    /// Fraction of `total_profit` compounding adds to a trade.
    pub compounding_share: Decimal,
}

impl RiskTier {
    pub fn defaults(level: RiskLevel) -> Self {
        match level {
            RiskLevel::Low => Self {
                position_size_factor: dec!(0.5),
                compounding_share: dec!(0.25),
            },
            RiskLevel::Medium => Self {
                position_size_factor: Decimal::ONE,
                compounding_share: dec!(0.5),
            },
            RiskLevel::High => Self {
                position_size_factor: Decimal::ONE,
                compounding_share: dec!(0.75),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct RiskPolicy {
    tiers: HashMap<RiskLevel, RiskTier>,
}

impl Default for RiskPolicy {
    fn default() -> Self {
        Self::new(HashMap::new())
    }
}

impl RiskPolicy {
    /// Configured tiers, with defaults filling any level left out.
    pub fn new(overrides: HashMap<RiskLevel, RiskTier>) -> Self {
        let tiers = RiskLevel::ALL
            .iter()
            .map(|level| {
                let tier = overrides
                    .get(level)
                    .copied()
                    .unwrap_or_else(|| RiskTier::defaults(*level));
                (*level, tier)
            })
            .collect();
        Self { tiers }
    }

    pub fn tier(&self, level: RiskLevel) -> RiskTier {
        self.tiers
            .get(&level)
            .copied()
            .unwrap_or_else(|| RiskTier::defaults(level))
    }

    /// Quote capital one trade may commit before compounding.
    pub fn investment_cap(&self, config: &UserTradingConfig) -> Decimal {
        config.max_investment_per_trade * self.tier(config.risk_level).position_size_factor
    }

    /// Extra capital compounding adds, before any daily-limit clamp.
    /// Zero when compounding is off or there is no profit to reinvest.
    pub fn compounding_bonus(&self, config: &UserTradingConfig, total_profit: Decimal) -> Decimal {
        if !config.compounding_enabled || total_profit <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        total_profit * self.tier(config.risk_level).compounding_share
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
