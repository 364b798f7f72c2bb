//! Core data types used across the engine

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Validation errors for bar data
#[derive(Debug, Error, PartialEq)]
pub enum BarValidationError {
    #[error("prices must be finite: open={open}, high={high}, low={low}, close={close}")]
    NonFinitePrice {
        open: f64,
        high: f64,
        low: f64,
        close: f64,
    },

    #[error("prices must be positive: open={open}, high={high}, low={low}, close={close}")]
    NonPositivePrice {
        open: f64,
        high: f64,
        low: f64,
        close: f64,
    },

    #[error("high ({high}) must be >= low ({low})")]
    HighLessThanLow { high: f64, low: f64 },

    #[error("volume ({0}) must be >= 0")]
    NegativeVolume(f64),

    #[error("open ({open}) must be between low ({low}) and high ({high})")]
    OpenOutOfRange { open: f64, low: f64, high: f64 },

    #[error("close ({close}) must be between low ({low}) and high ({high})")]
    CloseOutOfRange { close: f64, low: f64, high: f64 },
}

/// OHLCV bar. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    /// Create a new bar with validation
    pub fn new(
        timestamp: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Result<Self, BarValidationError> {
        let bar = Self::new_unchecked(timestamp, open, high, low, close, volume);
        bar.validate()?;
        Ok(bar)
    }

    /// Create a bar without validation (synthetic data, trusted feeds)
    pub fn new_unchecked(
        timestamp: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Self {
        Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    pub fn validate(&self) -> Result<(), BarValidationError> {
        let prices = [self.open, self.high, self.low, self.close];

        if prices.iter().any(|p| !p.is_finite()) {
            return Err(BarValidationError::NonFinitePrice {
                open: self.open,
                high: self.high,
                low: self.low,
                close: self.close,
            });
        }

        if prices.iter().any(|&p| p <= 0.0) {
            return Err(BarValidationError::NonPositivePrice {
                open: self.open,
                high: self.high,
                low: self.low,
                close: self.close,
            });
        }

        if self.high < self.low {
            return Err(BarValidationError::HighLessThanLow {
                high: self.high,
                low: self.low,
            });
        }

        if self.volume < 0.0 {
            return Err(BarValidationError::NegativeVolume(self.volume));
        }

        if self.open < self.low || self.open > self.high {
            return Err(BarValidationError::OpenOutOfRange {
                open: self.open,
                low: self.low,
                high: self.high,
            });
        }

        if self.close < self.low || self.close > self.high {
            return Err(BarValidationError::CloseOutOfRange {
                close: self.close,
                low: self.low,
                high: self.high,
            });
        }

        Ok(())
    }

    /// True range against the previous bar's close
    pub fn true_range(&self, prev_close: f64) -> f64 {
        (self.high - self.low)
            .max((self.high - prev_close).abs())
            .max((self.low - prev_close).abs())
    }

    /// Trading session of the bar's UTC hour
    pub fn session(&self) -> Session {
        Session::from_hour(self.timestamp.hour())
    }
}

/// Traded instrument
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(pub String);

impl Symbol {
    pub fn new(s: impl Into<String>) -> Self {
        Symbol(s.into().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Base asset of a pair: "BTC" for "BTCUSD", "BTC-USD", "BTC/USDT" or "BTC"
    pub fn base_asset(&self) -> &str {
        if let Some((base, _)) = self.0.split_once(['-', '/', '_']) {
            return base;
        }
        for quote in ["USDT", "USDC", "USD", "EUR", "INR"] {
            if let Some(base) = self.0.strip_suffix(quote) {
                if !base.is_empty() {
                    return base;
                }
            }
        }
        &self.0
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// +1 for long, -1 for short
    pub fn sign(self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Long => "long",
            Direction::Short => "short",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Directional classification used for trend and contrarian readings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Trend {
    Up,
    Down,
    None,
}

/// Trading session keyed by UTC hour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Session {
    Asia,
    Europe,
    Us,
    Overlap,
}

impl Session {
    /// Overlap (14-16 UTC) wins over europe and us.
    pub fn from_hour(hour: u32) -> Self {
        match hour {
            14..=15 => Session::Overlap,
            0..=7 => Session::Asia,
            8..=13 => Session::Europe,
            16..=21 => Session::Us,
            _ => Session::Asia,
        }
    }
}

/// Why a position was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    Stop,
    Trail,
    Target,
    Time,
    Rsi,
    ChannelExit,
}

impl ExitReason {
    /// Reporting order
    pub const ALL: [ExitReason; 6] = [
        ExitReason::Trail,
        ExitReason::Target,
        ExitReason::Stop,
        ExitReason::Time,
        ExitReason::Rsi,
        ExitReason::ChannelExit,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ExitReason::Stop => "stop",
            ExitReason::Trail => "trail",
            ExitReason::Target => "target",
            ExitReason::Time => "time",
            ExitReason::Rsi => "rsi",
            ExitReason::ChannelExit => "channel_exit",
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single open position of an instrument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub direction: Direction,
    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    pub stop_price: f64,
    pub target_price: f64,
    pub atr_at_entry: f64,
    pub trailing_active: bool,
    pub runner_mode: bool,
    pub size: f64,
    /// Bars processed since entry
    #[serde(default)]
    pub bars_held: usize,
}

impl Position {
    /// Price move in the position's favour (negative when underwater)
    pub fn favorable_excursion(&self, price: f64) -> f64 {
        (price - self.entry_price) * self.direction.sign()
    }

    /// Signed percentage return if closed at `exit_price`
    pub fn pnl_pct(&self, exit_price: f64) -> f64 {
        self.favorable_excursion(exit_price) / self.entry_price * 100.0
    }
}

/// Closed trade. Created once and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub direction: Direction,
    pub entry_price: f64,
    pub exit_price: f64,
    pub pnl_pct: f64,
    pub pnl_usd: f64,
    pub exit_reason: ExitReason,
    pub atr_at_entry: f64,
    pub size: f64,
}

impl TradeRecord {
    pub fn is_win(&self) -> bool {
        self.pnl_pct > 0.0
    }
}
