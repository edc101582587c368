//! Shared types for the XARB engine.
//!
//! These types form the data model used across all modules.
//! They are kept free of engine logic so that the exchange, strategy,
//! storage and engine modules can depend on them without cycles.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Market data
// ---------------------------------------------------------------------------

/// A single price observation for one symbol on one exchange.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriceSnapshot {
    pub exchange: String,
    pub symbol: String,
    pub price: Decimal,
    /// 24-hour volume in base units.
    pub volume: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl fmt::Display for PriceSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} @ {} (vol {})",
            self.exchange, self.symbol, self.price, self.volume
        )
    }
}

/// Quote currencies recognised when a symbol has no separator.
/// Longer suffixes first so that `FDUSD` wins over `USD`.
const QUOTE_SUFFIXES: &[&str] = &["FDUSD", "USDT", "USDC", "BUSD", "USD"];

/// Quote currency assumed when a bare asset ("BTC") is given as a symbol.
pub const DEFAULT_QUOTE: &str = "USDT";

/// Split a symbol into `(base, quote)`.
///
/// Accepts `BTC/USDT`, `BTC-USDT`, `BTC_USDT`, `BTCUSDT` and bare `BTC`.
pub fn split_symbol(symbol: &str) -> (String, String) {
    let upper = symbol.trim().to_uppercase();

    if let Some((base, quote)) = upper.split_once(['/', '-', '_']) {
        return (base.to_string(), quote.to_string());
    }

    for suffix in QUOTE_SUFFIXES {
        if upper.len() > suffix.len() && upper.ends_with(suffix) {
            let base = &upper[..upper.len() - suffix.len()];
            return (base.to_string(), suffix.to_string());
        }
    }

    (upper, DEFAULT_QUOTE.to_string())
}

/// Canonical `BASE/QUOTE` form of a symbol.
pub fn normalize_symbol(symbol: &str) -> String {
    let (base, quote) = split_symbol(symbol);
    format!("{base}/{quote}")
}

/// Round `value` down to a whole multiple of `step`.
pub fn floor_to_step(value: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return value;
    }
    (value / step).floor() * step
}

// ---------------------------------------------------------------------------
// Transaction costs
// ---------------------------------------------------------------------------

/// Symbol placeholder for an exchange-wide default cost row.
pub const ANY_SYMBOL: &str = "*";

fn default_true() -> bool {
    true
}

/// Fee schedule for one (exchange, symbol) pair.
///
/// Trading fees are fractions of notional (0.001 = 10 bps). Withdrawal and
/// deposit fees are fixed amounts in the quote currency.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransactionCost {
    pub exchange: String,
    pub symbol: String,
    pub trading_fee_maker: Decimal,
    pub trading_fee_taker: Decimal,
    pub withdrawal_fee_fixed: Decimal,
    pub deposit_fee_fixed: Decimal,
    pub processing_time_minutes: u32,
    /// Lot size for order quantities, when the exchange publishes one.
    #[serde(default)]
    pub quantity_step: Option<Decimal>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

impl TransactionCost {
    /// Reject rows with negative fees or a non-positive lot size.
    pub fn validate(&self) -> Result<(), EngineError> {
        let fees = [
            ("trading_fee_maker", self.trading_fee_maker),
            ("trading_fee_taker", self.trading_fee_taker),
            ("withdrawal_fee_fixed", self.withdrawal_fee_fixed),
            ("deposit_fee_fixed", self.deposit_fee_fixed),
        ];
        for (name, value) in fees {
            if value < Decimal::ZERO {
                return Err(EngineError::InvalidConfig(format!(
                    "cost row {}/{}: {name} is negative ({value})",
                    self.exchange, self.symbol
                )));
            }
        }
        if let Some(step) = self.quantity_step {
            if step <= Decimal::ZERO {
                return Err(EngineError::InvalidConfig(format!(
                    "cost row {}/{}: quantity_step must be positive",
                    self.exchange, self.symbol
                )));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Opportunities
// ---------------------------------------------------------------------------

/// A net-profitable cross-exchange spread, sized and costed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArbitrageOpportunity {
    pub symbol: String,
    pub buy_exchange: String,
    pub sell_exchange: String,
    pub buy_price: Decimal,
    pub sell_price: Decimal,
    /// (sell - buy) / buy × 100.
    pub spread_percentage: Decimal,
    /// Trade size in base units.
    pub quantity: Decimal,
    /// Quote capital committed on the buy leg (quantity × buy price).
    pub investment: Decimal,
    pub gross_profit: Decimal,
    /// Taker fees on both legs.
    pub trading_fees: Decimal,
    /// Fixed withdrawal + deposit fees.
    pub transfer_fees: Decimal,
    pub total_costs: Decimal,
    pub net_profit: Decimal,
    pub roi_percentage: Decimal,
    pub execution_time_estimate_minutes: u32,
    #[serde(default)]
    pub buy_quantity_step: Option<Decimal>,
    #[serde(default)]
    pub sell_quantity_step: Option<Decimal>,
    pub detected_at: DateTime<Utc>,
}

impl ArbitrageOpportunity {
    pub fn base_asset(&self) -> String {
        split_symbol(&self.symbol).0
    }

    pub fn quote_asset(&self) -> String {
        split_symbol(&self.symbol).1
    }
}

impl fmt::Display for ArbitrageOpportunity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} buy {}@{} → sell {}@{} | spread={:.3}% qty={} net=${:.4} roi={:.3}%",
            self.symbol,
            self.buy_exchange,
            self.buy_price,
            self.sell_exchange,
            self.sell_price,
            self.spread_percentage,
            self.quantity,
            self.net_profit,
            self.roi_percentage,
        )
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// User risk appetite. Drives the tier table in `strategy::risk`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    #[default]
    Medium,
    High,
}

impl RiskLevel {
    pub const ALL: &'static [RiskLevel] = &[RiskLevel::Low, RiskLevel::Medium, RiskLevel::High];
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "low"),
            RiskLevel::Medium => write!(f, "medium"),
            RiskLevel::High => write!(f, "high"),
        }
    }
}

impl std::str::FromStr for RiskLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" | "conservative" => Ok(RiskLevel::Low),
            "medium" | "moderate" => Ok(RiskLevel::Medium),
            "high" | "aggressive" => Ok(RiskLevel::High),
            _ => Err(anyhow::anyhow!("Unknown risk level: {s}")),
        }
    }
}

/// Sub-account on an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AccountKind {
    #[default]
    Spot,
    Futures,
    Funding,
}

impl fmt::Display for AccountKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccountKind::Spot => write!(f, "spot"),
            AccountKind::Futures => write!(f, "futures"),
            AccountKind::Funding => write!(f, "funding"),
        }
    }
}

/// Order direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

// ---------------------------------------------------------------------------
// User configuration
// ---------------------------------------------------------------------------

fn default_check_interval() -> u64 {
    30
}

fn default_capital_currency() -> String {
    DEFAULT_QUOTE.to_string()
}

/// Per-user trading limits and preferences.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserTradingConfig {
    pub user_id: String,
    pub is_enabled: bool,
    pub min_spread_percentage: Decimal,
    pub max_investment_per_trade: Decimal,
    pub min_profit_threshold: Decimal,
    pub daily_limit_usd: Decimal,
    pub max_concurrent_operations: u32,
    pub compounding_enabled: bool,
    #[serde(default)]
    pub risk_level: RiskLevel,
    pub stop_loss_percentage: Decimal,
    /// Symbol allow-list. Empty means "nothing to scan".
    #[serde(default)]
    pub symbols: Vec<String>,
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
    /// Currency the user's trading capital is held in.
    #[serde(default = "default_capital_currency")]
    pub capital_currency: String,
    /// Account the capital sits in; anything but spot needs a transfer first.
    #[serde(default)]
    pub funding_account: AccountKind,
}

impl UserTradingConfig {
    /// A config with conservative defaults and no symbols.
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            is_enabled: true,
            min_spread_percentage: dec!(0.5),
            max_investment_per_trade: dec!(100),
            min_profit_threshold: Decimal::ZERO,
            daily_limit_usd: dec!(1000),
            max_concurrent_operations: 3,
            compounding_enabled: false,
            risk_level: RiskLevel::Medium,
            stop_loss_percentage: dec!(2),
            symbols: Vec::new(),
            check_interval_secs: default_check_interval(),
            capital_currency: default_capital_currency(),
            funding_account: AccountKind::Spot,
        }
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        let invalid = |msg: &str| -> Result<(), EngineError> {
            Err(EngineError::InvalidConfig(format!(
                "user {}: {msg}",
                self.user_id
            )))
        };
        if self.user_id.trim().is_empty() {
            return Err(EngineError::InvalidConfig("user_id is empty".into()));
        }
        if self.min_spread_percentage < Decimal::ZERO {
            return invalid("min_spread_percentage is negative");
        }
        if self.max_investment_per_trade <= Decimal::ZERO {
            return invalid("max_investment_per_trade must be positive");
        }
        if self.daily_limit_usd < Decimal::ZERO {
            return invalid("daily_limit_usd is negative");
        }
        if self.max_concurrent_operations == 0 {
            return invalid("max_concurrent_operations must be at least 1");
        }
        if self.stop_loss_percentage < Decimal::ZERO {
            return invalid("stop_loss_percentage is negative");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Execution records
// ---------------------------------------------------------------------------

/// Lifecycle of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Converting,
    Transferring,
    Executing,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Converting => "converting",
            ExecutionStatus::Transferring => "transferring",
            ExecutionStatus::Executing => "executing",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a record ended up `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Permanent,
    RetriesExhausted,
    UnbalancedPosition,
    Cancelled,
    Internal,
}

/// A filled market order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderFill {
    pub order_id: String,
    pub exchange: String,
    pub symbol: String,
    pub side: OrderSide,
    /// Filled base quantity.
    pub quantity: Decimal,
    pub average_price: Decimal,
    /// Fee paid, in quote currency.
    pub fee: Decimal,
}

impl OrderFill {
    pub fn notional(&self) -> Decimal {
        self.quantity * self.average_price
    }
}

/// One admitted opportunity and everything that happened to it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub user_id: String,
    pub opportunity: ArbitrageOpportunity,
    pub status: ExecutionStatus,
    /// Quote capital committed, after compounding.
    pub amount_invested: Decimal,
    /// Base quantity to buy.
    pub quantity: Decimal,
    pub actual_profit: Option<Decimal>,
    pub retry_count: u32,
    pub adaptations_applied: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub failure: Option<FailureKind>,
    pub buy_fill: Option<OrderFill>,
    pub sell_fill: Option<OrderFill>,
}

impl ExecutionRecord {
    pub fn new(
        user_id: &str,
        opportunity: ArbitrageOpportunity,
        amount_invested: Decimal,
        quantity: Decimal,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            opportunity,
            status: ExecutionStatus::Pending,
            amount_invested,
            quantity,
            actual_profit: None,
            retry_count: 0,
            adaptations_applied: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
            error_message: None,
            failure: None,
            buy_fill: None,
            sell_fill: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Volume that counts against the daily limit: anything whose buy leg filled.
    pub fn traded_volume(&self) -> Decimal {
        if self.buy_fill.is_some() {
            self.amount_invested
        } else {
            Decimal::ZERO
        }
    }
}

impl fmt::Display for ExecutionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {} {}→{} ${:.2} retries={}",
            self.status,
            self.id,
            self.opportunity.symbol,
            self.opportunity.buy_exchange,
            self.opportunity.sell_exchange,
            self.amount_invested,
            self.retry_count,
        )?;
        if let Some(profit) = self.actual_profit {
            write!(f, " profit=${profit:.4}")?;
        }
        if let Some(ref err) = self.error_message {
            write!(f, " error=\"{err}\"")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Bot state
// ---------------------------------------------------------------------------

/// Aggregated per-user state, folded from terminal execution records.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BotState {
    pub user_id: String,
    pub is_running: bool,
    pub total_profit: Decimal,
    pub trades_executed: u64,
    pub daily_volume: Decimal,
    /// UTC calendar day `daily_volume` belongs to.
    pub volume_date: NaiveDate,
    pub last_execution_time: Option<DateTime<Utc>>,
}

impl BotState {
    pub fn new(user_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.to_string(),
            is_running: false,
            total_profit: Decimal::ZERO,
            trades_executed: 0,
            daily_volume: Decimal::ZERO,
            volume_date: now.date_naive(),
            last_execution_time: None,
        }
    }
}

impl fmt::Display for BotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} | running={} | profit=${:.2} | trades={} | volume today=${:.2} ({})",
            self.user_id,
            self.is_running,
            self.total_profit,
            self.trades_executed,
            self.daily_volume,
            self.volume_date,
        )
    }
}

// ---------------------------------------------------------------------------
// Admission
// ---------------------------------------------------------------------------

/// Why the governor turned an opportunity away.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectionReason {
    DailyLimit {
        requested: Decimal,
        used: Decimal,
        limit: Decimal,
    },
    MaxConcurrency {
        in_flight: u32,
        max: u32,
    },
    Blackout {
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    },
}

impl RejectionReason {
    /// Stable short code for logs and summaries.
    pub fn code(&self) -> &'static str {
        match self {
            RejectionReason::DailyLimit { .. } => "daily_limit",
            RejectionReason::MaxConcurrency { .. } => "max_concurrency",
            RejectionReason::Blackout { .. } => "blackout",
        }
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectionReason::DailyLimit { requested, used, limit } => write!(
                f,
                "daily_limit: ${requested:.2} requested, ${used:.2} of ${limit:.2} already used today"
            ),
            RejectionReason::MaxConcurrency { in_flight, max } => write!(
                f,
                "max_concurrency: {in_flight} executions in flight (max {max})"
            ),
            RejectionReason::Blackout { window_start, window_end } => write!(
                f,
                "blackout: trading suspended {} to {}",
                window_start.format("%H:%M"),
                window_end.format("%H:%M UTC")
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Cycle summary
// ---------------------------------------------------------------------------

/// A rejected candidate, kept for the cycle summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectionNote {
    pub symbol: String,
    pub buy_exchange: String,
    pub sell_exchange: String,
    pub reason: String,
}

/// Outcome of one `run_cycle` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleSummary {
    pub user_id: String,
    pub opportunities_found: usize,
    pub executed: usize,
    pub rejected: usize,
    pub errors: usize,
    /// The user's bot is disabled; nothing was scanned.
    pub skipped: bool,
    pub rejections: Vec<RejectionNote>,
    pub failures: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl CycleSummary {
    pub fn new(user_id: &str) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.to_string(),
            opportunities_found: 0,
            executed: 0,
            rejected: 0,
            errors: 0,
            skipped: false,
            rejections: Vec::new(),
            failures: Vec::new(),
            started_at: now,
            finished_at: now,
        }
    }
}

impl fmt::Display for CycleSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Cycle {}: found={} executed={} rejected={} errors={}{}",
            self.user_id,
            self.opportunities_found,
            self.executed,
            self.rejected,
            self.errors,
            if self.skipped { " (skipped)" } else { "" },
        )
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Domain error taxonomy for the engine.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("No trading configuration for user {user_id}")]
    ConfigMissing { user_id: String },

    #[error("No active cost data for {exchange}/{symbol}")]
    CostDataMissing { exchange: String, symbol: String },

    #[error("No viable opportunity: {0}")]
    NoViableOpportunity(String),

    #[error("Admission rejected: {reason}")]
    AdmissionRejected { reason: RejectionReason },

    #[error("Permanent exchange error ({exchange}): {message}")]
    ExchangePermanent { exchange: String, message: String },

    #[error("Exchange error ({exchange}) after {attempts} attempts: {message}")]
    ExchangeTransient {
        exchange: String,
        message: String,
        attempts: u32,
    },

    #[error("UNBALANCED POSITION: holding {quantity} {asset} on {exchange}: {message}")]
    UnbalancedPosition {
        exchange: String,
        asset: String,
        quantity: Decimal,
        message: String,
    },

    #[error("Internal state error: {0}")]
    InternalState(String),

    #[error("A cycle for user {user_id} is already running")]
    CycleInProgress { user_id: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Storage error: {0}")]
    Store(String),
}

impl From<anyhow::Error> for EngineError {
    fn from(e: anyhow::Error) -> Self {
        EngineError::Store(format!("{e:#}"))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
