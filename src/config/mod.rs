//! Configuration management for the straddle runner.
//!
//! Loads settings from an optional config file and environment variables.

use anyhow::{Context, Result};
use chrono::NaiveTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::broker::OrderKind;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Alpaca API credentials and endpoints
    #[serde(default)]
    pub alpaca: AlpacaConfig,
    /// Entry/exit thresholds and sizing
    #[serde(default)]
    pub strategy: StrategyConfig,
    /// Polling loop timing
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Trading session gate
    #[serde(default)]
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlpacaConfig {
    /// API key ID
    #[serde(default)]
    pub api_key: String,
    /// API secret key
    #[serde(default)]
    pub secret_key: String,
    /// Trade against the paper endpoint
    #[serde(default = "default_paper")]
    pub paper: bool,
    /// Override for the trading API base URL
    #[serde(default)]
    pub trading_url: Option<String>,
    /// Override for the market data API base URL
    #[serde(default)]
    pub data_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    /// Underlyings to trade
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,
    /// Enter when current IV > entry_multiplier * historical volatility
    #[serde(default = "default_entry_multiplier")]
    pub entry_multiplier: f64,
    /// Exit when current IV < exit_iv_fraction * entry IV
    #[serde(default = "default_exit_iv_fraction")]
    pub exit_iv_fraction: f64,
    /// Exit when position value >= entry cost * (1 + profit_target)
    #[serde(default = "default_profit_target")]
    pub profit_target: Decimal,
    /// Exit when position value <= entry cost * (1 - stop_loss)
    #[serde(default = "default_stop_loss")]
    pub stop_loss: Decimal,
    /// Maximum straddles bought per entry
    #[serde(default = "default_max_straddles")]
    pub max_straddles: u32,
    /// Share of options buying power available to one entry (0.0-1.0)
    #[serde(default = "default_capital_fraction")]
    pub capital_fraction: Decimal,
    /// Calendar days of history for realized volatility
    #[serde(default = "default_lookback_days")]
    pub lookback_days: u32,
    /// Minimum price points required after forward-filling
    #[serde(default = "default_min_observations")]
    pub min_observations: usize,
    /// Nearest expiration considered, in days from today
    #[serde(default = "default_expiry_min_days")]
    pub expiry_min_days: u32,
    /// Furthest expiration considered, in days from today
    #[serde(default = "default_expiry_max_days")]
    pub expiry_max_days: u32,
    /// Submit the straddle as one multi-leg order or two single orders
    #[serde(default = "default_order_kind")]
    pub order_kind: OrderKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Sleep between full passes over the universe
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Upper bound for any single broker or data call
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Gate entries and exits on regular trading hours
    #[serde(default = "default_enforce_session")]
    pub enforce: bool,
    /// Session open, US Eastern (HH:MM)
    #[serde(default = "default_session_open")]
    pub open: String,
    /// Session close, US Eastern (HH:MM)
    #[serde(default = "default_session_close")]
    pub close: String,
}

// Default value functions
fn default_paper() -> bool {
    true
}

fn default_symbols() -> Vec<String> {
    vec!["SPY".to_string()]
}

fn default_entry_multiplier() -> f64 {
    1.2
}

fn default_exit_iv_fraction() -> f64 {
    0.8
}

fn default_profit_target() -> Decimal {
    Decimal::new(50, 2) // 0.50
}

fn default_stop_loss() -> Decimal {
    Decimal::new(50, 2) // 0.50
}

fn default_max_straddles() -> u32 {
    1
}

fn default_capital_fraction() -> Decimal {
    Decimal::ONE
}

fn default_lookback_days() -> u32 {
    30
}

fn default_min_observations() -> usize {
    20
}

fn default_expiry_min_days() -> u32 {
    5
}

fn default_expiry_max_days() -> u32 {
    60
}

fn default_order_kind() -> OrderKind {
    OrderKind::MultiLeg
}

fn default_poll_interval() -> u64 {
    3600 // Re-check hourly
}

fn default_call_timeout() -> u64 {
    30
}

fn default_enforce_session() -> bool {
    true
}

fn default_session_open() -> String {
    "09:30".to_string()
}

fn default_session_close() -> String {
    "16:00".to_string()
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .prefix("STRADDLE")
                    .list_separator(",")
                    .with_list_parse_key("strategy.symbols")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let mut config: Config = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        // Alpaca's own SDK variables work as a fallback
        if config.alpaca.api_key.is_empty() {
            config.alpaca.api_key = std::env::var("APCA_API_KEY_ID").unwrap_or_default();
        }
        if config.alpaca.secret_key.is_empty() {
            config.alpaca.secret_key = std::env::var("APCA_API_SECRET_KEY").unwrap_or_default();
        }

        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        let strategy = &self.strategy;

        anyhow::ensure!(!strategy.symbols.is_empty(), "symbols must not be empty");

        anyhow::ensure!(
            strategy.entry_multiplier.is_finite() && strategy.entry_multiplier > 0.0,
            "entry_multiplier must be positive"
        );

        anyhow::ensure!(
            strategy.exit_iv_fraction.is_finite()
                && strategy.exit_iv_fraction > 0.0
                && strategy.exit_iv_fraction <= 1.0,
            "exit_iv_fraction must be between 0 and 1"
        );

        anyhow::ensure!(
            strategy.profit_target > Decimal::ZERO,
            "profit_target must be positive"
        );

        anyhow::ensure!(
            strategy.stop_loss > Decimal::ZERO && strategy.stop_loss <= Decimal::ONE,
            "stop_loss must be between 0 and 1"
        );

        anyhow::ensure!(
            strategy.capital_fraction > Decimal::ZERO && strategy.capital_fraction <= Decimal::ONE,
            "capital_fraction must be between 0 and 1"
        );

        anyhow::ensure!(strategy.max_straddles >= 1, "max_straddles must be >= 1");

        anyhow::ensure!(
            strategy.min_observations >= 2,
            "min_observations must be >= 2"
        );

        anyhow::ensure!(
            strategy.lookback_days >= 1,
            "lookback_days must be >= 1"
        );

        anyhow::ensure!(
            strategy.expiry_min_days <= strategy.expiry_max_days,
            "expiry_min_days must be <= expiry_max_days"
        );

        anyhow::ensure!(
            self.scheduler.call_timeout_secs >= 1,
            "call_timeout_secs must be >= 1"
        );

        let (open, close) = self.session.parse_times()?;
        anyhow::ensure!(open < close, "session open must be before close");

        Ok(())
    }
}

impl SessionConfig {
    /// Parse the HH:MM open and close times.
    pub fn parse_times(&self) -> Result<(NaiveTime, NaiveTime)> {
        let open = NaiveTime::parse_from_str(&self.open, "%H:%M")
            .with_context(|| format!("Invalid session open time: {}", self.open))?;
        let close = NaiveTime::parse_from_str(&self.close, "%H:%M")
            .with_context(|| format!("Invalid session close time: {}", self.close))?;
        Ok((open, close))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            alpaca: AlpacaConfig::default(),
            strategy: StrategyConfig::default(),
            scheduler: SchedulerConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

impl Default for AlpacaConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            secret_key: String::new(),
            paper: default_paper(),
            trading_url: None,
            data_url: None,
        }
    }
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            entry_multiplier: default_entry_multiplier(),
            exit_iv_fraction: default_exit_iv_fraction(),
            profit_target: default_profit_target(),
            stop_loss: default_stop_loss(),
            max_straddles: default_max_straddles(),
            capital_fraction: default_capital_fraction(),
            lookback_days: default_lookback_days(),
            min_observations: default_min_observations(),
            expiry_min_days: default_expiry_min_days(),
            expiry_max_days: default_expiry_max_days(),
            order_kind: default_order_kind(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            call_timeout_secs: default_call_timeout(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            enforce: default_enforce_session(),
            open: default_session_open(),
            close: default_session_close(),
        }
    }
}
