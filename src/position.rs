//! Position lifecycle state machine
//!
//! FLAT -> OPEN -> FLAT, at most one position at a time. While OPEN, each bar
//! is evaluated in a fixed order and the first exit that matches wins:
//! 1. trailing-stop maintenance (never an exit by itself)
//! 2. RSI exit, unless in runner mode
//! 3. stop (reported as `trail` once trailing is active), channel exit, then
//!    target unless in runner mode
//! 4. time exit, unless in runner mode
//!
//! Exits are two-phase: `evaluate_*` decides, `close` commits. Live trading
//! only commits after the order went through, so a failed exit leaves the
//! position open.

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::debug;

use crate::config::StrategyConfig;
use crate::indicators::IndicatorSnapshot;
use crate::{Bar, Direction, ExitReason, Position, TradeRecord};

#[derive(Debug, Error, PartialEq)]
pub enum LifecycleError {
    #[error("a {0} position is already open")]
    AlreadyOpen(Direction),

    #[error("ATR not ready ({0})")]
    AtrNotReady(f64),

    #[error("invalid entry price {0}")]
    InvalidPrice(f64),

    #[error("invalid position size {0}")]
    InvalidSize(f64),
}

/// How closed-trade percentage returns turn into dollars
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PnlModel {
    /// Every trade is marked against the same reference account
    FixedNotional { account_size: f64 },
    /// Marked against the traded size (`size * entry_price`)
    PositionSize,
}

impl PnlModel {
    pub fn pnl_usd(&self, position: &Position, pnl_pct: f64) -> f64 {
        match *self {
            PnlModel::FixedNotional { account_size } => account_size * pnl_pct / 100.0,
            PnlModel::PositionSize => pnl_pct / 100.0 * position.size * position.entry_price,
        }
    }
}

/// A matched exit, not yet committed
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExitDecision {
    pub price: f64,
    pub reason: ExitReason,
}

pub struct PositionLifecycle {
    config: StrategyConfig,
    pnl_model: PnlModel,
    position: Option<Position>,
}

impl PositionLifecycle {
    pub fn new(config: &StrategyConfig, pnl_model: PnlModel) -> Self {
        Self {
            config: config.clone(),
            pnl_model,
            position: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.position.is_some()
    }

    pub fn position(&self) -> Option<&Position> {
        self.position.as_ref()
    }

    pub fn pnl_model(&self) -> PnlModel {
        self.pnl_model
    }

    /// FLAT -> OPEN with ATR-derived stop and target
    pub fn open(
        &mut self,
        direction: Direction,
        entry_price: f64,
        entry_time: DateTime<Utc>,
        atr: f64,
        size: f64,
    ) -> Result<&Position, LifecycleError> {
        if let Some(existing) = &self.position {
            return Err(LifecycleError::AlreadyOpen(existing.direction));
        }
        if !(atr > 0.0 && atr.is_finite()) {
            return Err(LifecycleError::AtrNotReady(atr));
        }
        if !(entry_price > 0.0 && entry_price.is_finite()) {
            return Err(LifecycleError::InvalidPrice(entry_price));
        }
        if !(size > 0.0 && size.is_finite()) {
            return Err(LifecycleError::InvalidSize(size));
        }

        let sign = direction.sign();
        let position = Position {
            direction,
            entry_price,
            entry_time,
            stop_price: entry_price - sign * self.config.stop_atr_mult * atr,
            target_price: entry_price + sign * self.config.target_atr_mult * atr,
            atr_at_entry: atr,
            trailing_active: false,
            runner_mode: false,
            size,
            bars_held: 0,
        };
        Ok(&*self.position.insert(position))
    }

    /// Reinstate a persisted position (crash recovery)
    pub fn restore(&mut self, position: Position) -> Result<(), LifecycleError> {
        if let Some(existing) = &self.position {
            return Err(LifecycleError::AlreadyOpen(existing.direction));
        }
        self.position = Some(position);
        Ok(())
    }

    /// Count a completed bar against the open position's holding time
    pub fn mark_bar(&mut self) {
        if let Some(position) = self.position.as_mut() {
            position.bars_held += 1;
        }
    }

    /// Per-bar exit evaluation. Updates the trailing stop as a side effect.
    ///
    /// `channel_exit` is the exit-channel price reported by the signal
    /// generator for this bar, if it was crossed.
    pub fn evaluate_bar(
        &mut self,
        bar: &Bar,
        snapshot: &IndicatorSnapshot,
        channel_exit: Option<f64>,
    ) -> Option<ExitDecision> {
        self.maintain_trailing(bar.close);

        let cfg = &self.config;
        let position = self.position.as_ref()?;

        if !position.runner_mode && rsi_exit(position.direction, snapshot.rsi, cfg) {
            return Some(ExitDecision {
                price: bar.close,
                reason: ExitReason::Rsi,
            });
        }

        let (stop_hit, target_hit) = match position.direction {
            Direction::Long => (
                bar.low <= position.stop_price,
                bar.high >= position.target_price,
            ),
            Direction::Short => (
                bar.high >= position.stop_price,
                bar.low <= position.target_price,
            ),
        };

        if stop_hit {
            return Some(ExitDecision {
                price: position.stop_price,
                reason: stop_reason(position),
            });
        }
        if let Some(price) = channel_exit {
            return Some(ExitDecision {
                price,
                reason: ExitReason::ChannelExit,
            });
        }
        if position.runner_mode {
            return None;
        }
        if target_hit {
            return Some(ExitDecision {
                price: position.target_price,
                reason: ExitReason::Target,
            });
        }
        if position.bars_held >= cfg.max_hold_bars {
            return Some(ExitDecision {
                price: bar.close,
                reason: ExitReason::Time,
            });
        }
        None
    }

    /// Exit check against a bare price between bars: stop, then target, RSI
    /// and time unless in runner mode. Indicators and the trailing stop are
    /// left alone.
    pub fn evaluate_price(&self, price: f64, rsi: f64) -> Option<ExitDecision> {
        let position = self.position.as_ref()?;
        let favorable = position.favorable_excursion(price);

        if position.favorable_excursion(position.stop_price) >= favorable {
            return Some(ExitDecision {
                price,
                reason: stop_reason(position),
            });
        }
        if position.runner_mode {
            return None;
        }
        if favorable >= position.favorable_excursion(position.target_price) {
            return Some(ExitDecision {
                price,
                reason: ExitReason::Target,
            });
        }
        if rsi_exit(position.direction, rsi, &self.config) {
            return Some(ExitDecision {
                price,
                reason: ExitReason::Rsi,
            });
        }
        if position.bars_held >= self.config.max_hold_bars {
            return Some(ExitDecision {
                price,
                reason: ExitReason::Time,
            });
        }
        None
    }

    /// OPEN -> FLAT, producing the trade record
    pub fn close(&mut self, decision: ExitDecision, exit_time: DateTime<Utc>) -> Option<TradeRecord> {
        let position = self.position.take()?;
        let pnl_pct = position.pnl_pct(decision.price);

        Some(TradeRecord {
            entry_time: position.entry_time,
            exit_time,
            direction: position.direction,
            entry_price: position.entry_price,
            exit_price: decision.price,
            pnl_pct,
            pnl_usd: self.pnl_model.pnl_usd(&position, pnl_pct),
            exit_reason: decision.reason,
            atr_at_entry: position.atr_at_entry,
            size: position.size,
        })
    }

    /// Activate, then tighten, the trailing stop from the bar close.
    /// Distances are measured in ATR at entry.
    fn maintain_trailing(&mut self, price: f64) {
        if !self.config.use_trailing_stop {
            return;
        }
        let cfg = &self.config;
        let Some(position) = self.position.as_mut() else {
            return;
        };

        let atr = position.atr_at_entry;
        let sign = position.direction.sign();
        let excursion = position.favorable_excursion(price);
        let candidate = price - sign * cfg.trail_distance_atr * atr;

        if !position.trailing_active && excursion >= cfg.trail_activation_atr * atr {
            position.trailing_active = true;
            position.stop_price = candidate;
            debug!(
                direction = %position.direction,
                stop = candidate,
                "Trailing stop activated"
            );
        }

        if !position.trailing_active {
            return;
        }

        let tightens = match position.direction {
            Direction::Long => candidate > position.stop_price,
            Direction::Short => candidate < position.stop_price,
        };
        if tightens {
            position.stop_price = candidate;
        }

        if !position.runner_mode && excursion >= cfg.target_atr_mult * atr {
            position.runner_mode = true;
            debug!(direction = %position.direction, "Runner mode engaged");
        }
    }
}

fn rsi_exit(direction: Direction, rsi: f64, config: &StrategyConfig) -> bool {
    match direction {
        Direction::Long => rsi > config.rsi_exit_high,
        Direction::Short => rsi < config.rsi_exit_low,
    }
}

fn stop_reason(position: &Position) -> ExitReason {
    if position.trailing_active {
        ExitReason::Trail
    } else {
        ExitReason::Stop
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Trend;
    use approx::assert_relative_eq;
    use chrono::TimeZone;

    fn t(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 1, hour, 0, 0).unwrap()
    }

    fn bar(high: f64, low: f64, close: f64) -> Bar {
        Bar::new_unchecked(t(12), close, high, low, close, 1.0)
    }

    fn snap(rsi: f64) -> IndicatorSnapshot {
        IndicatorSnapshot {
            atr: 10.0,
            rsi,
            support: None,
            resistance: None,
            trend: Trend::None,
            contrarian: Trend::None,
        }
    }

    fn lifecycle(config: StrategyConfig) -> PositionLifecycle {
        PositionLifecycle::new(
            &config,
            PnlModel::FixedNotional {
                account_size: 10_000.0,
            },
        )
    }

    fn no_trail() -> StrategyConfig {
        StrategyConfig {
            use_trailing_stop: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_entry_levels_from_atr() {
        let mut lc = lifecycle(StrategyConfig {
            stop_atr_mult: 2.0,
            target_atr_mult: 4.0,
            ..Default::default()
        });
        let pos = lc.open(Direction::Long, 100.0, t(0), 10.0, 1.0).unwrap();
        assert_eq!(pos.stop_price, 80.0);
        assert_eq!(pos.target_price, 140.0);
        assert_eq!(pos.atr_at_entry, 10.0);
        assert!(!pos.trailing_active);
        assert!(!pos.runner_mode);

        let mut lc = lifecycle(StrategyConfig {
            stop_atr_mult: 2.0,
            target_atr_mult: 4.0,
            ..Default::default()
        });
        let pos = lc.open(Direction::Short, 100.0, t(0), 10.0, 1.0).unwrap();
        assert_eq!(pos.stop_price, 120.0);
        assert_eq!(pos.target_price, 60.0);
    }

    #[test]
    fn test_single_position_and_entry_guards() {
        let mut lc = lifecycle(StrategyConfig::default());
        assert_eq!(
            lc.open(Direction::Long, 100.0, t(0), 0.0, 1.0).unwrap_err(),
            LifecycleError::AtrNotReady(0.0)
        );
        assert_eq!(
            lc.open(Direction::Long, 100.0, t(0), 5.0, 0.0).unwrap_err(),
            LifecycleError::InvalidSize(0.0)
        );
        lc.open(Direction::Long, 100.0, t(0), 5.0, 1.0).unwrap();
        assert_eq!(
            lc.open(Direction::Short, 100.0, t(1), 5.0, 1.0).unwrap_err(),
            LifecycleError::AlreadyOpen(Direction::Long)
        );
    }

    #[test]
    fn test_stop_hit_without_trailing_reports_stop() {
        let mut lc = lifecycle(StrategyConfig {
            stop_atr_mult: 1.0,
            ..no_trail()
        });
        lc.open(Direction::Long, 110.0, t(0), 10.0, 1.0).unwrap();
        assert_eq!(lc.position().unwrap().stop_price, 100.0);

        lc.mark_bar();
        let decision = lc.evaluate_bar(&bar(105.0, 99.0, 104.0), &snap(50.0), None).unwrap();
        assert_eq!(decision.price, 100.0);
        assert_eq!(decision.reason, ExitReason::Stop);

        let trade = lc.close(decision, t(1)).unwrap();
        assert_relative_eq!(trade.pnl_pct, (100.0 - 110.0) / 110.0 * 100.0);
        assert_relative_eq!(trade.pnl_usd, 10_000.0 * trade.pnl_pct / 100.0);
        assert!(!lc.is_open());
    }

    #[test]
    fn test_trailing_stop_is_monotonic() {
        let mut lc = lifecycle(StrategyConfig {
            stop_atr_mult: 1.5,
            target_atr_mult: 100.0,
            trail_activation_atr: 1.0,
            trail_distance_atr: 0.5,
            rsi_exit_high: 100.0,
            max_hold_bars: 1000,
            ..Default::default()
        });
        lc.open(Direction::Long, 100.0, t(0), 10.0, 1.0).unwrap();

        let closes = [105.0, 111.0, 120.0, 117.0, 125.0, 122.0, 130.0, 127.0];
        let mut last_stop = lc.position().unwrap().stop_price;
        for close in closes {
            lc.mark_bar();
            let decision = lc.evaluate_bar(&bar(close + 1.0, close - 1.0, close), &snap(50.0), None);
            assert!(decision.is_none(), "unexpected exit at {}", close);
            let stop = lc.position().unwrap().stop_price;
            assert!(stop >= last_stop, "stop loosened from {} to {}", last_stop, stop);
            last_stop = stop;
        }
        assert!(lc.position().unwrap().trailing_active);
        assert_eq!(last_stop, 125.0);
    }

    #[test]
    fn test_short_trailing_stop_is_monotonic() {
        let mut lc = lifecycle(StrategyConfig {
            target_atr_mult: 100.0,
            trail_activation_atr: 1.0,
            trail_distance_atr: 0.5,
            rsi_exit_low: 0.0,
            max_hold_bars: 1000,
            ..Default::default()
        });
        lc.open(Direction::Short, 100.0, t(0), 10.0, 1.0).unwrap();

        let mut last_stop = lc.position().unwrap().stop_price;
        for close in [95.0, 88.0, 80.0, 82.0, 76.0, 79.0] {
            lc.mark_bar();
            assert!(lc
                .evaluate_bar(&bar(close + 1.0, close - 1.0, close), &snap(50.0), None)
                .is_none());
            let stop = lc.position().unwrap().stop_price;
            assert!(stop <= last_stop);
            last_stop = stop;
        }
        assert_eq!(last_stop, 81.0);
    }

    #[test]
    fn test_trail_exit_reason_after_activation() {
        let mut lc = lifecycle(StrategyConfig {
            target_atr_mult: 5.0,
            trail_activation_atr: 1.0,
            trail_distance_atr: 0.3,
            ..Default::default()
        });
        lc.open(Direction::Long, 100.0, t(0), 10.0, 1.0).unwrap();

        lc.mark_bar();
        assert!(lc.evaluate_bar(&bar(113.0, 110.0, 112.0), &snap(50.0), None).is_none());
        assert_relative_eq!(lc.position().unwrap().stop_price, 109.0);

        lc.mark_bar();
        let decision = lc.evaluate_bar(&bar(111.0, 108.0, 110.0), &snap(50.0), None).unwrap();
        assert_eq!(decision.reason, ExitReason::Trail);
        assert_relative_eq!(decision.price, 109.0);
    }

    #[test]
    fn test_runner_mode_suppresses_target_rsi_and_time() {
        let mut lc = lifecycle(StrategyConfig {
            stop_atr_mult: 1.0,
            target_atr_mult: 2.0,
            trail_activation_atr: 1.0,
            trail_distance_atr: 0.5,
            max_hold_bars: 2,
            ..Default::default()
        });
        lc.open(Direction::Long, 100.0, t(0), 10.0, 1.0).unwrap();

        // excursion of 2.5 ATR: trailing on and runner engaged in one bar
        lc.mark_bar();
        assert!(lc.evaluate_bar(&bar(126.0, 123.0, 125.0), &snap(50.0), None).is_none());
        let pos = lc.position().unwrap();
        assert!(pos.runner_mode);
        assert_eq!(pos.stop_price, 120.0);

        // high through target, overbought RSI, past max hold: still open
        for _ in 0..3 {
            lc.mark_bar();
            assert!(lc.evaluate_bar(&bar(150.0, 124.0, 126.0), &snap(90.0), None).is_none());
        }
        assert!(lc.position().unwrap().runner_mode);

        // only the trailing stop can close it now
        lc.mark_bar();
        let decision = lc.evaluate_bar(&bar(126.0, 119.0, 121.0), &snap(90.0), None).unwrap();
        assert_eq!(decision.reason, ExitReason::Trail);
    }

    #[test]
    fn test_runner_mode_keeps_channel_exit() {
        let mut lc = lifecycle(StrategyConfig {
            stop_atr_mult: 1.0,
            target_atr_mult: 2.0,
            trail_activation_atr: 1.0,
            trail_distance_atr: 0.5,
            ..Default::default()
        });
        lc.open(Direction::Long, 100.0, t(0), 10.0, 1.0).unwrap();
        lc.mark_bar();
        lc.evaluate_bar(&bar(126.0, 123.0, 125.0), &snap(50.0), None);
        assert!(lc.position().unwrap().runner_mode);

        lc.mark_bar();
        let decision = lc
            .evaluate_bar(&bar(128.0, 123.0, 127.0), &snap(50.0), Some(121.5))
            .unwrap();
        assert_eq!(decision.reason, ExitReason::ChannelExit);
        assert_eq!(decision.price, 121.5);
    }

    #[test]
    fn test_exit_priority_order() {
        // RSI beats stop
        let mut lc = lifecycle(StrategyConfig {
            stop_atr_mult: 1.0,
            ..no_trail()
        });
        lc.open(Direction::Long, 100.0, t(0), 10.0, 1.0).unwrap();
        lc.mark_bar();
        let decision = lc.evaluate_bar(&bar(101.0, 85.0, 95.0), &snap(75.0), None).unwrap();
        assert_eq!(decision.reason, ExitReason::Rsi);
        assert_eq!(decision.price, 95.0);

        // stop beats target on a wide bar
        let mut lc = lifecycle(StrategyConfig {
            stop_atr_mult: 1.0,
            target_atr_mult: 1.0,
            ..no_trail()
        });
        lc.open(Direction::Long, 100.0, t(0), 10.0, 1.0).unwrap();
        lc.mark_bar();
        let decision = lc.evaluate_bar(&bar(115.0, 85.0, 100.0), &snap(50.0), None).unwrap();
        assert_eq!(decision.reason, ExitReason::Stop);

        // target beats time
        let mut lc = lifecycle(StrategyConfig {
            max_hold_bars: 1,
            ..no_trail()
        });
        lc.open(Direction::Short, 100.0, t(0), 10.0, 1.0).unwrap();
        lc.mark_bar();
        let decision = lc.evaluate_bar(&bar(100.0, 79.0, 85.0), &snap(50.0), None).unwrap();
        assert_eq!(decision.reason, ExitReason::Target);
        assert_eq!(decision.price, 80.0);
    }

    #[test]
    fn test_time_exit_at_close() {
        let mut lc = lifecycle(StrategyConfig {
            max_hold_bars: 3,
            ..no_trail()
        });
        lc.open(Direction::Long, 100.0, t(0), 10.0, 1.0).unwrap();
        for _ in 0..2 {
            lc.mark_bar();
            assert!(lc.evaluate_bar(&bar(102.0, 99.0, 101.0), &snap(50.0), None).is_none());
        }
        lc.mark_bar();
        let decision = lc.evaluate_bar(&bar(103.0, 99.0, 102.0), &snap(50.0), None).unwrap();
        assert_eq!(decision.reason, ExitReason::Time);
        assert_eq!(decision.price, 102.0);
    }

    #[test]
    fn test_price_check_between_bars() {
        let mut lc = PositionLifecycle::new(&no_trail(), PnlModel::PositionSize);
        lc.open(Direction::Short, 100.0, t(0), 10.0, 2.0).unwrap();
        // stop 115, target 80
        assert!(lc.evaluate_price(100.0, 50.0).is_none());
        assert_eq!(lc.evaluate_price(116.0, 50.0).unwrap().reason, ExitReason::Stop);
        assert_eq!(lc.evaluate_price(79.0, 50.0).unwrap().reason, ExitReason::Target);
        assert_eq!(lc.evaluate_price(95.0, 20.0).unwrap().reason, ExitReason::Rsi);

        let decision = lc.evaluate_price(79.0, 50.0).unwrap();
        let trade = lc.close(decision, t(3)).unwrap();
        // 21% on 2 units of 100
        assert_relative_eq!(trade.pnl_usd, 42.0, epsilon = 1e-9);
    }

    #[test]
    fn test_price_check_time_exit() {
        let mut lc = PositionLifecycle::new(
            &StrategyConfig {
                max_hold_bars: 2,
                ..no_trail()
            },
            PnlModel::PositionSize,
        );
        lc.open(Direction::Long, 100.0, t(0), 10.0, 1.0).unwrap();
        lc.mark_bar();
        assert!(lc.evaluate_price(101.0, 50.0).is_none());

        lc.mark_bar();
        let decision = lc.evaluate_price(101.0, 50.0).unwrap();
        assert_eq!(decision.reason, ExitReason::Time);
        assert_eq!(decision.price, 101.0);
    }

    #[test]
    fn test_price_check_runner_skips_time() {
        let mut lc = lifecycle(StrategyConfig {
            stop_atr_mult: 1.0,
            target_atr_mult: 2.0,
            trail_activation_atr: 1.0,
            trail_distance_atr: 0.5,
            max_hold_bars: 1,
            ..Default::default()
        });
        lc.open(Direction::Long, 100.0, t(0), 10.0, 1.0).unwrap();
        lc.mark_bar();
        assert!(lc.evaluate_bar(&bar(126.0, 123.0, 125.0), &snap(50.0), None).is_none());
        assert!(lc.position().unwrap().runner_mode);

        // past max hold and above target, but the runner stays open
        assert!(lc.evaluate_price(130.0, 90.0).is_none());
        assert_eq!(lc.evaluate_price(119.0, 50.0).unwrap().reason, ExitReason::Trail);
    }

    #[test]
    fn test_restore_rejects_second_position() {
        let mut lc = lifecycle(StrategyConfig::default());
        lc.open(Direction::Long, 100.0, t(0), 10.0, 1.0).unwrap();
        let copy = lc.position().unwrap().clone();
        assert!(lc.restore(copy).is_err());
    }
}
