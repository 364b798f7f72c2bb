//! Configuration management
//!
//! Handles loading and validation of JSON configuration files, with
//! environment overrides for the live section. A `Config` is built once and
//! handed to the engine by value; nothing reads configuration from globals.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::{Session, Symbol};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub strategy: StrategyConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub backtest: BacktestConfig,
    #[serde(default)]
    pub live: LiveConfig,
    /// Sweep grid: strategy field name -> values to test
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grid: Option<HashMap<String, Vec<serde_json::Value>>>,
}

impl Config {
    /// Load configuration from JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config: Config =
            serde_json::from_str(&contents).context("Failed to parse config JSON")?;

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Live-section overrides from the environment (after `.env` is loaded)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(symbol) = std::env::var("SR_BOUNCE_SYMBOL") {
            self.live.symbol = symbol;
        }
        if let Ok(dir) = std::env::var("SR_BOUNCE_STATE_DIR") {
            self.live.state_dir = dir;
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.strategy.validate()?;

        if self.risk.account_size <= 0.0 {
            bail!("risk.account_size must be positive");
        }
        if self.backtest.account_size <= 0.0 {
            bail!("backtest.account_size must be positive");
        }
        if self.live.poll_interval_secs == 0 {
            bail!("live.poll_interval_secs must be at least 1");
        }
        if self.live.history_bars < 2 {
            bail!("live.history_bars must be at least 2");
        }
        Ok(())
    }
}

/// Which signal generator drives the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Mean-reversion entries at support/resistance
    #[default]
    Bounce,
    /// Donchian channel breakouts
    Breakout,
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StrategyKind::Bounce => write!(f, "bounce"),
            StrategyKind::Breakout => write!(f, "breakout"),
        }
    }
}

impl std::str::FromStr for StrategyKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "bounce" | "sr_bounce" => Ok(StrategyKind::Bounce),
            "breakout" | "donchian" => Ok(StrategyKind::Breakout),
            _ => bail!("Unknown strategy: {}. Use 'bounce' or 'breakout'", s),
        }
    }
}

/// How close to a level counts as touching it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToleranceMode {
    /// `close * sr_tolerance_pct / 100`
    #[default]
    PercentOfPrice,
    /// `atr * sr_tolerance_atr`
    AtrMultiple,
}

/// Strategy parameters shared by both signal variants and the position lifecycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    pub strategy: StrategyKind,

    // Support / resistance
    pub sr_lookback: usize,
    pub sr_tolerance_pct: f64,
    pub tolerance_mode: ToleranceMode,
    pub sr_tolerance_atr: f64,

    // Trend and contrarian filters
    pub trend_lookback: usize,
    pub use_trend_filter: bool,
    pub ct_bars: usize,
    pub use_ct_filter: bool,

    // ATR stops
    pub atr_period: usize,
    pub stop_atr_mult: f64,
    pub target_atr_mult: f64,

    // Trailing stop / runner mode
    pub use_trailing_stop: bool,
    pub trail_activation_atr: f64,
    pub trail_distance_atr: f64,

    // Time management
    pub max_hold_bars: usize,
    pub min_gap_bars: usize,

    // RSI exit
    pub rsi_period: usize,
    pub rsi_exit_high: f64,
    pub rsi_exit_low: f64,

    // Session filter
    pub use_session_filter: bool,
    pub allowed_sessions: Vec<Session>,

    // Round-number levels
    pub use_round_number_sr: bool,
    pub round_number_weight: f64,
    /// Asset whose round-number grid applies; defaults to the traded symbol
    pub round_number_asset: Option<String>,

    // Breakout channels
    pub breakout_atr_mult: f64,
    pub entry_period: usize,
    pub exit_period: usize,

    // Sizing
    pub risk_per_trade_pct: f64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::Bounce,
            sr_lookback: 10,
            sr_tolerance_pct: 0.1,
            tolerance_mode: ToleranceMode::PercentOfPrice,
            sr_tolerance_atr: 0.5,
            trend_lookback: 30,
            use_trend_filter: true,
            ct_bars: 2,
            use_ct_filter: true,
            atr_period: 14,
            stop_atr_mult: 1.5,
            target_atr_mult: 2.0,
            use_trailing_stop: true,
            trail_activation_atr: 1.0,
            trail_distance_atr: 0.3,
            max_hold_bars: 10,
            min_gap_bars: 5,
            rsi_period: 14,
            rsi_exit_high: 70.0,
            rsi_exit_low: 30.0,
            use_session_filter: false,
            allowed_sessions: vec![Session::Europe, Session::Us, Session::Overlap],
            use_round_number_sr: true,
            round_number_weight: 0.5,
            round_number_asset: None,
            breakout_atr_mult: 0.5,
            entry_period: 10,
            exit_period: 5,
            risk_per_trade_pct: 0.5,
        }
    }
}

impl StrategyConfig {
    /// Donchian breakout settings: 3 ATR stop, trail 0.5 ATR once the trade
    /// is 75% of its initial risk in profit, no RSI exit.
    pub fn donchian_preset() -> Self {
        Self {
            strategy: StrategyKind::Breakout,
            stop_atr_mult: 3.0,
            target_atr_mult: 6.0,
            use_trailing_stop: true,
            trail_activation_atr: 2.25,
            trail_distance_atr: 0.5,
            max_hold_bars: 240,
            min_gap_bars: 0,
            rsi_exit_high: 100.0,
            rsi_exit_low: 0.0,
            use_round_number_sr: false,
            risk_per_trade_pct: 1.0,
            ..Self::default()
        }
    }

    /// Bars the rolling window keeps: the longest lookback plus a buffer
    pub fn history_capacity(&self) -> usize {
        [
            self.sr_lookback,
            self.trend_lookback,
            self.rsi_period + 1,
            self.atr_period + 1,
            self.entry_period + 1,
            self.exit_period + 1,
            self.ct_bars,
        ]
        .into_iter()
        .max()
        .unwrap_or(0)
            + 20
    }

    /// Round-number grid asset for a traded symbol
    pub fn round_number_asset_for(&self, symbol: &Symbol) -> String {
        self.round_number_asset
            .clone()
            .unwrap_or_else(|| symbol.base_asset().to_string())
    }

    pub fn validate(&self) -> Result<()> {
        let periods = [
            ("sr_lookback", self.sr_lookback),
            ("trend_lookback", self.trend_lookback),
            ("ct_bars", self.ct_bars),
            ("atr_period", self.atr_period),
            ("rsi_period", self.rsi_period),
            ("entry_period", self.entry_period),
            ("exit_period", self.exit_period),
        ];
        for (name, value) in periods {
            if value == 0 {
                bail!("strategy.{} must be at least 1", name);
            }
        }

        let positive = [
            ("stop_atr_mult", self.stop_atr_mult),
            ("target_atr_mult", self.target_atr_mult),
            ("risk_per_trade_pct", self.risk_per_trade_pct),
        ];
        for (name, value) in positive {
            if !(value > 0.0) {
                bail!("strategy.{} must be positive, got {}", name, value);
            }
        }

        let non_negative = [
            ("sr_tolerance_pct", self.sr_tolerance_pct),
            ("sr_tolerance_atr", self.sr_tolerance_atr),
            ("trail_activation_atr", self.trail_activation_atr),
            ("trail_distance_atr", self.trail_distance_atr),
            ("breakout_atr_mult", self.breakout_atr_mult),
        ];
        for (name, value) in non_negative {
            if !(value >= 0.0) {
                bail!("strategy.{} must be >= 0, got {}", name, value);
            }
        }

        if !(0.0..=1.0).contains(&self.round_number_weight) {
            bail!(
                "strategy.round_number_weight must be within [0, 1], got {}",
                self.round_number_weight
            );
        }
        if self.rsi_exit_low >= self.rsi_exit_high {
            bail!(
                "strategy.rsi_exit_low ({}) must be below rsi_exit_high ({})",
                self.rsi_exit_low,
                self.rsi_exit_high
            );
        }
        if self.exit_period > self.entry_period {
            bail!(
                "strategy.exit_period ({}) must not exceed entry_period ({})",
                self.exit_period,
                self.entry_period
            );
        }
        if self.use_session_filter && self.allowed_sessions.is_empty() {
            bail!("strategy.allowed_sessions is empty while the session filter is on");
        }
        Ok(())
    }
}

/// Sizing parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Reference account for backtest USD P&L
    #[serde(default = "default_account_size")]
    pub account_size: f64,
    /// Decimal places kept on order sizes
    #[serde(default = "default_size_precision")]
    pub size_precision: u32,
}

fn default_account_size() -> f64 {
    10_000.0
}

fn default_size_precision() -> u32 {
    4
}

impl Default for RiskConfig {
    fn default() -> Self {
        RiskConfig {
            account_size: default_account_size(),
            size_precision: default_size_precision(),
        }
    }
}

/// Backtest configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestConfig {
    #[serde(default = "default_data_file")]
    pub data_file: String,
    #[serde(default = "default_symbol")]
    pub symbol: String,
    #[serde(default = "default_account_size")]
    pub account_size: f64,
}

fn default_data_file() -> String {
    "data/BTCUSD_1h.csv".to_string()
}

fn default_symbol() -> String {
    "BTC".to_string()
}

impl Default for BacktestConfig {
    fn default() -> Self {
        BacktestConfig {
            data_file: default_data_file(),
            symbol: default_symbol(),
            account_size: default_account_size(),
        }
    }
}

/// Live polling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveConfig {
    #[serde(default = "default_symbol")]
    pub symbol: String,
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Bars fetched at startup to rebuild the rolling window
    #[serde(default = "default_history_bars")]
    pub history_bars: usize,
    /// Starting balance of the shadow executor
    #[serde(default = "default_account_size")]
    pub paper_balance: f64,
}

fn default_state_dir() -> String {
    "state".to_string()
}

fn default_poll_interval() -> u64 {
    300
}

fn default_history_bars() -> usize {
    100
}

impl Default for LiveConfig {
    fn default() -> Self {
        LiveConfig {
            symbol: default_symbol(),
            state_dir: default_state_dir(),
            poll_interval_secs: default_poll_interval(),
            history_bars: default_history_bars(),
            paper_balance: default_account_size(),
        }
    }
}
