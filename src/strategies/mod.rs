//! Entry signal generators
//!
//! Both variants implement `SignalGenerator` and are chosen once, at
//! construction, from `StrategyConfig::strategy`:
//! - `bounce`: mean-reversion entries at support/resistance
//! - `breakout`: Donchian channel breakouts with a strength filter

pub mod bounce;
pub mod breakout;

pub use bounce::BounceSignal;
pub use breakout::BreakoutSignal;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::config::{StrategyConfig, StrategyKind};
use crate::indicators::{IndicatorSnapshot, RollingWindow};
use crate::Direction;

// =============================================================================
// SignalGenerator Trait
// =============================================================================

/// Maps the newest bar and its indicators to an entry direction.
///
/// Implementations keep their configuration from construction and tally the
/// signals they emit or filter out.
pub trait SignalGenerator: Send + Sync {
    /// Variant identifier (matches `StrategyKind`)
    fn name(&self) -> &'static str;

    /// Entry direction for the newest bar in `window`, if any
    fn evaluate(
        &mut self,
        window: &RollingWindow,
        snapshot: &IndicatorSnapshot,
    ) -> Option<Direction>;

    /// Exit price when the newest bar crosses the variant's exit channel.
    /// Variants without an exit channel never report one.
    fn channel_exit(&self, _window: &RollingWindow, _direction: Direction) -> Option<f64> {
        None
    }

    /// Tallies accumulated so far
    fn stats(&self) -> SignalStats;
}

/// Signal tallies reported alongside backtest results
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalStats {
    pub signals_generated: usize,
    pub filtered_by_trend: usize,
    pub filtered_by_session: usize,
}

// =============================================================================
// Factory
// =============================================================================

/// Create the configured signal generator
pub fn create_signal_generator(config: &StrategyConfig) -> Result<Box<dyn SignalGenerator>> {
    config.validate()?;

    let generator: Box<dyn SignalGenerator> = match config.strategy {
        StrategyKind::Bounce => Box::new(BounceSignal::new(config.clone())),
        StrategyKind::Breakout => Box::new(BreakoutSignal::new(config.clone())),
    };
    tracing::debug!(strategy = generator.name(), "Signal generator created");
    Ok(generator)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_selects_variant() {
        let bounce = create_signal_generator(&StrategyConfig::default()).unwrap();
        assert_eq!(bounce.name(), "bounce");

        let breakout = create_signal_generator(&StrategyConfig::donchian_preset()).unwrap();
        assert_eq!(breakout.name(), "breakout");
        assert_eq!(breakout.stats(), SignalStats::default());
    }

    #[test]
    fn test_factory_rejects_invalid_config() {
        let config = StrategyConfig {
            sr_lookback: 0,
            ..Default::default()
        };
        assert!(create_signal_generator(&config).is_err());
    }
}
