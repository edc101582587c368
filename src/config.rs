//! Configuration loading from TOML.
//!
//! Reads `config.toml` (or the path in `XARB_CONFIG`) and deserializes it
//! into strongly-typed structs. Every section has defaults, so a minimal
//! file only needs the parts it changes.

use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::time::Duration;

use crate::engine::classifier::{ErrorClassifier, ErrorCodeMapping};
use crate::engine::retry::{RetryPolicy, DEFAULT_MAX_RETRIES};
use crate::engine::scanner::ScannerConfig;
use crate::engine::scheduler::SchedulerConfig;
use crate::strategy::blackout::BlackoutSchedule;
use crate::strategy::risk::{RiskPolicy, RiskTier};
use crate::types::{AccountKind, RiskLevel, TransactionCost, UserTradingConfig};

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "XARB_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// Shortest per-user interval the scheduler accepts.
pub const MIN_INTERVAL_FLOOR_SECS: u64 = 5;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub scanner: ScannerSection,
    pub blackout: BlackoutConfig,
    /// Keyed by risk level name (`low`, `medium`, `high`).
    pub risk_tiers: HashMap<String, RiskTier>,
    pub storage: StorageConfig,
    pub api: ApiConfig,
    pub feed: FeedConfig,
    pub costs: Vec<TransactionCost>,
    pub error_codes: Vec<ErrorCodeMapping>,
    pub users: Vec<UserTradingConfig>,
    pub paper: PaperConfig,
}

/// Where orders go.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// `SimulatedExchange` fills every order.
    #[default]
    Paper,
    /// A real `ExchangeClient`.
    Live,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EngineConfig {
    pub mode: Mode,
    pub min_interval_secs: u64,
    pub user_refresh_secs: u64,
    pub call_timeout_secs: u64,
    pub max_retries: u32,
    pub cost_cache_ttl_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Paper,
            min_interval_secs: MIN_INTERVAL_FLOOR_SECS,
            user_refresh_secs: 60,
            call_timeout_secs: 15,
            max_retries: DEFAULT_MAX_RETRIES,
            cost_cache_ttl_secs: 300,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ScannerSection {
    pub max_snapshot_age_secs: u64,
    pub max_volume_share: Decimal,
}

impl Default for ScannerSection {
    fn default() -> Self {
        let d = ScannerConfig::default();
        Self {
            max_snapshot_age_secs: d.max_snapshot_age.as_secs(),
            max_volume_share: d.max_volume_share,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BlackoutConfig {
    pub enabled: bool,
    /// Funding settlement hours, UTC.
    pub settlement_hours: Vec<u32>,
    pub padding_minutes: i64,
}

impl Default for BlackoutConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            settlement_hours: vec![0, 8, 16],
            padding_minutes: 30,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    /// `memory` or a sqlx sqlite URL.
    pub url: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://xarb.db?mode=rwc".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8080,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct FeedConfig {
    /// JSON ticker endpoint. Unset: paper mode prices from `[paper]`.
    pub url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PaperConfig {
    pub fee_rate: Decimal,
    pub slippage_bps: Decimal,
    pub prices: Vec<PaperPrice>,
    pub balances: Vec<PaperBalance>,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            fee_rate: Decimal::new(1, 3),
            slippage_bps: Decimal::ZERO,
            prices: Vec::new(),
            balances: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PaperPrice {
    pub exchange: String,
    pub symbol: String,
    pub price: Decimal,
    #[serde(default)]
    pub volume: Decimal,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PaperBalance {
    pub exchange: String,
    #[serde(default)]
    pub account: AccountKind,
    pub asset: String,
    pub amount: Decimal,
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        let config = Self::parse(&contents)
            .with_context(|| format!("Failed to parse config file: {path}"))?;
        Ok(config)
    }

    /// Load from `XARB_CONFIG`, falling back to `config.toml`.
    pub fn from_env() -> Result<Self> {
        let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load(&path)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.engine.min_interval_secs < MIN_INTERVAL_FLOOR_SECS {
            bail!(
                "engine.min_interval_secs must be at least {MIN_INTERVAL_FLOOR_SECS} (got {})",
                self.engine.min_interval_secs
            );
        }
        if self.engine.call_timeout_secs == 0 {
            bail!("engine.call_timeout_secs must be positive");
        }
        if self.scanner.max_volume_share < Decimal::ZERO || self.scanner.max_volume_share > Decimal::ONE {
            bail!("scanner.max_volume_share must be within [0, 1]");
        }
        for cost in &self.costs {
            cost.validate()?;
        }
        for user in &self.users {
            user.validate()?;
        }
        for (name, tier) in &self.risk_tiers {
            name.parse::<RiskLevel>()
                .with_context(|| format!("risk_tiers.{name}"))?;
            if tier.position_size_factor <= Decimal::ZERO || tier.compounding_share < Decimal::ZERO {
                bail!("risk_tiers.{name}: multipliers must be positive");
            }
        }
        Ok(())
    }

    pub fn scanner_config(&self) -> ScannerConfig {
        ScannerConfig {
            max_snapshot_age: Duration::from_secs(self.scanner.max_snapshot_age_secs),
            max_volume_share: self.scanner.max_volume_share,
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            min_interval: Duration::from_secs(self.engine.min_interval_secs),
            user_refresh_interval: Duration::from_secs(self.engine.user_refresh_secs),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            ErrorClassifier::with_mappings(&self.error_codes),
            self.engine.max_retries,
            Duration::from_secs(self.engine.call_timeout_secs),
        )
    }

    /// Unknown tier names are skipped; `validate` reports them.
    pub fn risk_policy(&self) -> RiskPolicy {
        let tiers = self
            .risk_tiers
            .iter()
            .filter_map(|(name, tier)| name.parse::<RiskLevel>().ok().map(|level| (level, *tier)))
            .collect();
        RiskPolicy::new(tiers)
    }

    pub fn blackout_schedule(&self) -> BlackoutSchedule {
        if self.blackout.enabled {
            BlackoutSchedule::new(self.blackout.settlement_hours.clone(), self.blackout.padding_minutes)
        } else {
            BlackoutSchedule::disabled()
        }
    }
}
