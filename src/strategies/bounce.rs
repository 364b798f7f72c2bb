//! Support/Resistance Bounce
//!
//! Entry: bar touches support (long) or resistance (short) within a tolerance
//! Filters: trend must agree; with no trend, fade the last short-term move
//! (contrarian) when enabled; optional trading-session allow-list

use crate::config::{StrategyConfig, ToleranceMode};
use crate::indicators::{IndicatorSnapshot, RollingWindow};
use crate::strategies::{SignalGenerator, SignalStats};
use crate::{Bar, Direction, Trend};

pub struct BounceSignal {
    config: StrategyConfig,
    stats: SignalStats,
}

impl BounceSignal {
    pub fn new(config: StrategyConfig) -> Self {
        Self {
            config,
            stats: SignalStats::default(),
        }
    }

    fn tolerance(&self, bar: &Bar, atr: f64) -> f64 {
        match self.config.tolerance_mode {
            ToleranceMode::PercentOfPrice => bar.close * self.config.sr_tolerance_pct / 100.0,
            ToleranceMode::AtrMultiple => atr * self.config.sr_tolerance_atr,
        }
    }

    fn session_allowed(&self, bar: &Bar) -> bool {
        !self.config.use_session_filter || self.config.allowed_sessions.contains(&bar.session())
    }
}

impl SignalGenerator for BounceSignal {
    fn name(&self) -> &'static str {
        "bounce"
    }

    fn evaluate(
        &mut self,
        window: &RollingWindow,
        snapshot: &IndicatorSnapshot,
    ) -> Option<Direction> {
        let bar = window.last()?;
        let (support, resistance) = (snapshot.support?, snapshot.resistance?);
        if !snapshot.is_ready() {
            return None;
        }

        if !self.session_allowed(bar) {
            self.stats.filtered_by_session += 1;
            return None;
        }

        let tolerance = self.tolerance(bar, snapshot.atr);
        let near_support = bar.low <= support + tolerance;
        let near_resistance = bar.high >= resistance - tolerance;
        if !near_support && !near_resistance {
            return None;
        }

        let trend = if self.config.use_trend_filter {
            snapshot.trend
        } else {
            Trend::None
        };
        let contrarian_enabled = self.config.use_ct_filter;

        let mut direction = None;

        if near_support {
            match trend {
                Trend::Up => direction = Some(Direction::Long),
                Trend::Down => {
                    self.stats.filtered_by_trend += 1;
                    direction = None;
                }
                Trend::None => {
                    if contrarian_enabled && snapshot.contrarian == Trend::Down {
                        direction = Some(Direction::Long);
                    }
                }
            }
        }

        // Evaluated after support, so a bar touching both levels takes this result
        if near_resistance {
            match trend {
                Trend::Down => direction = Some(Direction::Short),
                Trend::Up => {
                    self.stats.filtered_by_trend += 1;
                    direction = None;
                }
                Trend::None => {
                    if contrarian_enabled && snapshot.contrarian == Trend::Up {
                        direction = Some(Direction::Short);
                    }
                }
            }
        }

        if direction.is_some() {
            self.stats.signals_generated += 1;
        }
        direction
    }

    fn stats(&self) -> SignalStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Session;
    use chrono::{TimeZone, Utc};

    fn window_with(hour: u32, open: f64, high: f64, low: f64, close: f64) -> RollingWindow {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap();
        RollingWindow::from_bars(vec![Bar::new_unchecked(ts, open, high, low, close, 1.0)], 10)
    }

    fn snapshot(trend: Trend, contrarian: Trend) -> IndicatorSnapshot {
        IndicatorSnapshot {
            atr: 10.0,
            rsi: 50.0,
            support: Some(100.0),
            resistance: Some(200.0),
            trend,
            contrarian,
        }
    }

    fn config() -> StrategyConfig {
        StrategyConfig {
            sr_tolerance_pct: 0.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_support_touch_with_uptrend_goes_long() {
        let mut signal = BounceSignal::new(config());
        let window = window_with(10, 105.0, 110.0, 99.0, 104.0);
        assert_eq!(
            signal.evaluate(&window, &snapshot(Trend::Up, Trend::None)),
            Some(Direction::Long)
        );
        assert_eq!(signal.stats().signals_generated, 1);
    }

    #[test]
    fn test_support_touch_against_downtrend_is_filtered() {
        let mut signal = BounceSignal::new(config());
        let window = window_with(10, 105.0, 110.0, 99.0, 104.0);
        assert_eq!(signal.evaluate(&window, &snapshot(Trend::Down, Trend::Down)), None);
        assert_eq!(signal.stats().filtered_by_trend, 1);
        assert_eq!(signal.stats().signals_generated, 0);
    }

    #[test]
    fn test_contrarian_entries_without_trend() {
        let mut signal = BounceSignal::new(config());
        let at_support = window_with(10, 105.0, 110.0, 99.0, 104.0);
        assert_eq!(
            signal.evaluate(&at_support, &snapshot(Trend::None, Trend::Down)),
            Some(Direction::Long)
        );
        assert_eq!(signal.evaluate(&at_support, &snapshot(Trend::None, Trend::Up)), None);

        let at_resistance = window_with(10, 195.0, 201.0, 190.0, 198.0);
        assert_eq!(
            signal.evaluate(&at_resistance, &snapshot(Trend::None, Trend::Up)),
            Some(Direction::Short)
        );

        let mut no_ct = BounceSignal::new(StrategyConfig {
            use_ct_filter: false,
            ..config()
        });
        assert_eq!(no_ct.evaluate(&at_support, &snapshot(Trend::None, Trend::Down)), None);
    }

    #[test]
    fn test_resistance_branch_overrides_support() {
        // One bar spanning both levels
        let window = window_with(10, 150.0, 205.0, 95.0, 150.0);
        let mut signal = BounceSignal::new(config());

        // Up trend: support says long, resistance filters it out again
        assert_eq!(signal.evaluate(&window, &snapshot(Trend::Up, Trend::None)), None);
        assert_eq!(signal.stats().filtered_by_trend, 1);

        // Down trend: support filters, resistance assigns short
        assert_eq!(
            signal.evaluate(&window, &snapshot(Trend::Down, Trend::None)),
            Some(Direction::Short)
        );
        assert_eq!(signal.stats().filtered_by_trend, 2);
    }

    #[test]
    fn test_tolerance_policies() {
        // low sits 1.0 above support
        let window = window_with(10, 105.0, 110.0, 101.0, 104.0);

        let mut pct = BounceSignal::new(StrategyConfig {
            sr_tolerance_pct: 1.0,
            ..Default::default()
        });
        assert_eq!(
            pct.evaluate(&window, &snapshot(Trend::Up, Trend::None)),
            Some(Direction::Long)
        );

        let mut atr = BounceSignal::new(StrategyConfig {
            tolerance_mode: ToleranceMode::AtrMultiple,
            sr_tolerance_atr: 0.05,
            ..Default::default()
        });
        assert_eq!(atr.evaluate(&window, &snapshot(Trend::Up, Trend::None)), None);

        let mut wide_atr = BounceSignal::new(StrategyConfig {
            tolerance_mode: ToleranceMode::AtrMultiple,
            sr_tolerance_atr: 0.5,
            ..Default::default()
        });
        assert_eq!(
            wide_atr.evaluate(&window, &snapshot(Trend::Up, Trend::None)),
            Some(Direction::Long)
        );
    }

    #[test]
    fn test_session_filter_tallies_rejections() {
        let mut signal = BounceSignal::new(StrategyConfig {
            use_session_filter: true,
            allowed_sessions: vec![Session::Us],
            ..config()
        });
        let asia = window_with(3, 105.0, 110.0, 99.0, 104.0);
        assert_eq!(signal.evaluate(&asia, &snapshot(Trend::Up, Trend::None)), None);
        assert_eq!(signal.stats().filtered_by_session, 1);

        let us = window_with(18, 105.0, 110.0, 99.0, 104.0);
        assert_eq!(
            signal.evaluate(&us, &snapshot(Trend::Up, Trend::None)),
            Some(Direction::Long)
        );
    }

    #[test]
    fn test_not_ready_snapshot_never_signals() {
        let mut signal = BounceSignal::new(config());
        let window = window_with(10, 105.0, 110.0, 99.0, 104.0);

        let no_atr = IndicatorSnapshot {
            atr: 0.0,
            ..snapshot(Trend::Up, Trend::None)
        };
        assert_eq!(signal.evaluate(&window, &no_atr), None);

        let no_levels = IndicatorSnapshot {
            support: None,
            ..snapshot(Trend::Up, Trend::None)
        };
        assert_eq!(signal.evaluate(&window, &no_levels), None);
    }
}
