//! Fixed-fraction position sizing
//!
//! The dollar amount at risk is a fixed percent of equity. The position is
//! sized so that hitting the stop loses exactly that amount:
//! ```text
//! risk_usd      = equity * risk_pct / 100
//! notional      = risk_usd / (stop_distance / price)
//! size (units)  = round(notional / price, precision)
//! ```
//!
//! Rounding is done in `Decimal` so that a size printed with `precision`
//! places is the size that gets sent.

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};

use crate::config::{RiskConfig, StrategyConfig};

#[derive(Debug, Clone, PartialEq)]
pub struct PositionSizer {
    risk_per_trade_pct: f64,
    size_precision: u32,
}

impl PositionSizer {
    pub fn new(risk_per_trade_pct: f64, size_precision: u32) -> Self {
        Self {
            risk_per_trade_pct,
            size_precision,
        }
    }

    pub fn from_config(strategy: &StrategyConfig, risk: &RiskConfig) -> Self {
        Self::new(strategy.risk_per_trade_pct, risk.size_precision)
    }

    /// Set the decimal places kept on sizes
    pub fn with_precision(mut self, precision: u32) -> Self {
        self.size_precision = precision;
        self
    }

    pub fn risk_per_trade_pct(&self) -> f64 {
        self.risk_per_trade_pct
    }

    /// Units to trade, rounded. 0.0 means the entry should be rejected.
    pub fn size(&self, equity: f64, price: f64, stop_distance: f64) -> f64 {
        self.size_decimal(equity, price, stop_distance)
            .and_then(|d| d.to_f64())
            .unwrap_or(0.0)
    }

    pub fn size_decimal(&self, equity: f64, price: f64, stop_distance: f64) -> Option<Decimal> {
        if !(equity > 0.0 && price > 0.0 && stop_distance > 0.0) {
            return None;
        }
        let risk_usd = equity * self.risk_per_trade_pct / 100.0;
        let notional = risk_usd / (stop_distance / price);
        let units = Decimal::from_f64(notional / price)?;
        let rounded =
            units.round_dp_with_strategy(self.size_precision, RoundingStrategy::MidpointNearestEven);
        (rounded > Decimal::ZERO).then_some(rounded)
    }
}
