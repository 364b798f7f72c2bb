//! Donchian Channel Breakout
//!
//! Entry: close punches through the N-bar high/low (excluding the current bar)
//! by more than `breakout_atr_mult * ATR`
//! Exit: the newest bar crosses the shorter M-bar channel

use crate::config::StrategyConfig;
use crate::indicators::{IndicatorSnapshot, RollingWindow};
use crate::strategies::{SignalGenerator, SignalStats};
use crate::Direction;

pub struct BreakoutSignal {
    config: StrategyConfig,
    stats: SignalStats,
}

/// (highest high, lowest low) of the `period` bars before the newest one
fn channel(window: &RollingWindow, period: usize) -> Option<(f64, f64)> {
    if period == 0 {
        return None;
    }
    let prior = window.prior(period)?;
    Some(prior.fold((f64::NEG_INFINITY, f64::INFINITY), |(hi, lo), bar| {
        (hi.max(bar.high), lo.min(bar.low))
    }))
}

impl BreakoutSignal {
    pub fn new(config: StrategyConfig) -> Self {
        Self {
            config,
            stats: SignalStats::default(),
        }
    }

    pub fn entry_channel(&self, window: &RollingWindow) -> Option<(f64, f64)> {
        channel(window, self.config.entry_period)
    }

    pub fn exit_channel(&self, window: &RollingWindow) -> Option<(f64, f64)> {
        channel(window, self.config.exit_period)
    }
}

impl SignalGenerator for BreakoutSignal {
    fn name(&self) -> &'static str {
        "breakout"
    }

    fn evaluate(
        &mut self,
        window: &RollingWindow,
        snapshot: &IndicatorSnapshot,
    ) -> Option<Direction> {
        if !snapshot.is_ready() {
            return None;
        }
        let bar = window.last()?;
        let (entry_high, entry_low) = self.entry_channel(window)?;
        let margin = self.config.breakout_atr_mult * snapshot.atr;

        let direction = if bar.close > entry_high + margin {
            Some(Direction::Long)
        } else if bar.close < entry_low - margin {
            Some(Direction::Short)
        } else {
            None
        };

        if let Some(dir) = direction {
            self.stats.signals_generated += 1;
            tracing::debug!(
                direction = %dir,
                close = bar.close,
                entry_high,
                entry_low,
                margin,
                "Channel breakout"
            );
        }
        direction
    }

    fn channel_exit(&self, window: &RollingWindow, direction: Direction) -> Option<f64> {
        let bar = window.last()?;
        let (exit_high, exit_low) = self.exit_channel(window)?;
        match direction {
            Direction::Long if bar.low <= exit_low => Some(exit_low),
            Direction::Short if bar.high >= exit_high => Some(exit_high),
            _ => None,
        }
    }

    fn stats(&self) -> SignalStats {
        self.stats
    }
}
