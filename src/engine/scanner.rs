//! Cross-exchange opportunity scanner.
//!
//! Turns a batch of price snapshots into net-profit-ranked opportunities
//! for one user. For every symbol on the user's allow-list and every pair
//! of exchanges quoting it, both directions are evaluated: size the trade,
//! cost both legs with the `CostModel`, and keep the candidate only if it
//! clears the user's spread and profit thresholds after costs.
//!
//! The scan is deterministic: identical inputs give an identical, totally
//! ordered result. It is also the only place trade size is computed.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, info};

use super::costs::CostModel;
use crate::strategy::risk::RiskPolicy;
use crate::types::{floor_to_step, normalize_symbol, ArbitrageOpportunity, PriceSnapshot, UserTradingConfig};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// Snapshots older than this are ignored.
    pub max_snapshot_age: Duration,
    /// Largest share of the thinner venue's 24h volume one trade may take.
    /// Zero disables the liquidity cap.
    pub max_volume_share: Decimal,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            max_snapshot_age: Duration::from_secs(60),
            max_volume_share: dec!(0.1),
        }
    }
}

/// What one scan produced, plus counters for the cycle log.
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    /// Ranked best first.
    pub opportunities: Vec<ArbitrageOpportunity>,
    /// Directed (buy, sell) pairs looked at.
    pub pairs_evaluated: usize,
    /// Pairs skipped because a leg had no cost row.
    pub skipped_missing_costs: usize,
    pub stale_snapshots: usize,
}

// ---------------------------------------------------------------------------
// Scanner
// ---------------------------------------------------------------------------

pub struct OpportunityScanner {
    config: ScannerConfig,
    risk: RiskPolicy,
}

impl OpportunityScanner {
    pub fn new(config: ScannerConfig, risk: RiskPolicy) -> Self {
        Self { config, risk }
    }

    pub fn scan(
        &self,
        snapshots: &[PriceSnapshot],
        user: &UserTradingConfig,
        costs: &CostModel,
        now: DateTime<Utc>,
    ) -> ScanReport {
        let mut report = ScanReport::default();
        let quotes = self.latest_quotes(snapshots, now, &mut report);

        let mut seen = Vec::new();
        for raw in &user.symbols {
            let symbol = normalize_symbol(raw);
            if seen.contains(&symbol) {
                continue;
            }
            seen.push(symbol.clone());

            let Some(by_exchange) = quotes.get(&symbol) else {
                debug!(symbol = %symbol, "No fresh quotes");
                continue;
            };
            let venues: Vec<&PriceSnapshot> = by_exchange.values().copied().collect();
            if venues.len() < 2 {
                continue;
            }

            for i in 0..venues.len() {
                for j in (i + 1)..venues.len() {
                    for (buy, sell) in [(venues[i], venues[j]), (venues[j], venues[i])] {
                        report.pairs_evaluated += 1;
                        if let Some(opp) = self.evaluate(&symbol, buy, sell, user, costs, now, &mut report) {
                            report.opportunities.push(opp);
                        }
                    }
                }
            }
        }

        report.opportunities.sort_by(rank);

        info!(
            user_id = %user.user_id,
            symbols = seen.len(),
            pairs = report.pairs_evaluated,
            found = report.opportunities.len(),
            missing_costs = report.skipped_missing_costs,
            stale = report.stale_snapshots,
            "Scan complete"
        );
        report
    }

    /// Newest usable snapshot per (symbol, exchange). Exchanges are kept in
    /// name order so pair enumeration is stable.
    fn latest_quotes<'a>(
        &self,
        snapshots: &'a [PriceSnapshot],
        now: DateTime<Utc>,
        report: &mut ScanReport,
    ) -> HashMap<String, BTreeMap<String, &'a PriceSnapshot>> {
        let max_age = chrono::Duration::from_std(self.config.max_snapshot_age)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let mut quotes: HashMap<String, BTreeMap<String, &PriceSnapshot>> = HashMap::new();

        for snap in snapshots {
            if snap.price <= Decimal::ZERO {
                continue;
            }
            if now - snap.timestamp > max_age {
                report.stale_snapshots += 1;
                continue;
            }
            let slot = quotes
                .entry(normalize_symbol(&snap.symbol))
                .or_default()
                .entry(snap.exchange.to_lowercase());
            match slot {
                std::collections::btree_map::Entry::Vacant(v) => {
                    v.insert(snap);
                }
                std::collections::btree_map::Entry::Occupied(mut o) => {
                    if snap.timestamp > o.get().timestamp {
                        o.insert(snap);
                    }
                }
            }
        }
        quotes
    }

    #[allow(clippy::too_many_arguments)]
    fn evaluate(
        &self,
        symbol: &str,
        buy: &PriceSnapshot,
        sell: &PriceSnapshot,
        user: &UserTradingConfig,
        costs: &CostModel,
        now: DateTime<Utc>,
        report: &mut ScanReport,
    ) -> Option<ArbitrageOpportunity> {
        let (buy_cost, sell_cost) = match (costs.cost(&buy.exchange, symbol), costs.cost(&sell.exchange, symbol)) {
            (Ok(b), Ok(s)) => (b, s),
            (Err(e), _) | (_, Err(e)) => {
                debug!(symbol, buy = %buy.exchange, sell = %sell.exchange, error = %e, "Skipping pair");
                report.skipped_missing_costs += 1;
                return None;
            }
        };

        let spread_percentage = (sell.price - buy.price) / buy.price * dec!(100);
        if spread_percentage.abs() < user.min_spread_percentage {
            return None;
        }

        let quantity = self.size(buy, sell, user, buy_cost.quantity_step, sell_cost.quantity_step);
        if quantity <= Decimal::ZERO {
            return None;
        }

        let investment = quantity * buy.price;
        let fee_buy = quantity * buy.price * buy_cost.trading_fee_taker;
        let fee_sell = quantity * sell.price * sell_cost.trading_fee_taker;
        let trading_fees = fee_buy + fee_sell;
        let transfer_fees = buy_cost.withdrawal_fee_fixed + sell_cost.deposit_fee_fixed;
        let total_costs = trading_fees + transfer_fees;
        let gross_profit = quantity * (sell.price - buy.price);
        let net_profit = gross_profit - total_costs;

        if net_profit <= Decimal::ZERO || net_profit < user.min_profit_threshold {
            return None;
        }

        let opportunity = ArbitrageOpportunity {
            symbol: symbol.to_string(),
            buy_exchange: buy.exchange.to_lowercase(),
            sell_exchange: sell.exchange.to_lowercase(),
            buy_price: buy.price,
            sell_price: sell.price,
            spread_percentage,
            quantity,
            investment,
            gross_profit,
            trading_fees,
            transfer_fees,
            total_costs,
            net_profit,
            roi_percentage: net_profit / investment * dec!(100),
            execution_time_estimate_minutes: buy_cost.processing_time_minutes + sell_cost.processing_time_minutes,
            buy_quantity_step: buy_cost.quantity_step,
            sell_quantity_step: sell_cost.quantity_step,
            detected_at: now,
        };
        debug!(%opportunity, "Opportunity found");
        Some(opportunity)
    }

    /// Base quantity: the user's (tier-scaled) investment cap at the buy
    /// price, capped by venue liquidity, floored to both legs' lot sizes.
    fn size(
        &self,
        buy: &PriceSnapshot,
        sell: &PriceSnapshot,
        user: &UserTradingConfig,
        buy_step: Option<Decimal>,
        sell_step: Option<Decimal>,
    ) -> Decimal {
        let mut quantity = self.risk.investment_cap(user) / buy.price;

        if self.config.max_volume_share > Decimal::ZERO {
            let thinnest = [buy.volume, sell.volume]
                .into_iter()
                .filter(|v| *v > Decimal::ZERO)
                .min();
            if let Some(volume) = thinnest {
                quantity = quantity.min(volume * self.config.max_volume_share);
            }
        }

        for step in [buy_step, sell_step].into_iter().flatten() {
            quantity = floor_to_step(quantity, step);
        }
        quantity
    }
}

/// ROI descending, then net profit descending, then names for a total order.
fn rank(a: &ArbitrageOpportunity, b: &ArbitrageOpportunity) -> Ordering {
    b.roi_percentage
        .cmp(&a.roi_percentage)
        .then_with(|| b.net_profit.cmp(&a.net_profit))
        .then_with(|| a.symbol.cmp(&b.symbol))
        .then_with(|| a.buy_exchange.cmp(&b.buy_exchange))
        .then_with(|| a.sell_exchange.cmp(&b.sell_exchange))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
