//! Rolling indicator pipeline
//!
//! `IndicatorEngine` owns a fixed-capacity `RollingWindow` of bars and
//! recomputes an `IndicatorSnapshot` from it on every ingested bar:
//! - ATR: simple mean of true range (0.0 until `atr_period + 1` bars exist)
//! - RSI: simple mean gain / mean loss (50.0 until `rsi_period + 1` bars exist)
//! - Support/resistance: lowest low / highest high, optionally blended with
//!   psychological round-number levels
//! - Trend: half-window comparison of highs, lows and mean closes
//! - Contrarian: sign of the move over the last `ct_bars` bars
//!
//! Means are taken with the `ta` crate's `SimpleMovingAverage`.

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::vec_deque;
use std::collections::VecDeque;
use std::ops::Range;
use ta::indicators::SimpleMovingAverage;
use ta::Next;

use crate::config::StrategyConfig;
use crate::{Bar, Symbol, Trend};

// =============================================================================
// Rolling Window
// =============================================================================

/// Bounded, ordered bar history. Appends and evictions are O(1).
#[derive(Debug, Clone)]
pub struct RollingWindow {
    bars: VecDeque<Bar>,
    capacity: usize,
}

impl RollingWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            bars: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Build a window from existing bars, keeping the newest `capacity` of them
    pub fn from_bars(bars: impl IntoIterator<Item = Bar>, capacity: usize) -> Self {
        let mut window = Self::new(capacity);
        for bar in bars {
            window.push(bar);
        }
        window
    }

    /// Append a bar, returning the evicted oldest bar when full
    pub fn push(&mut self, bar: Bar) -> Option<Bar> {
        let evicted = if self.bars.len() == self.capacity {
            self.bars.pop_front()
        } else {
            None
        };
        self.bars.push_back(bar);
        evicted
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn last(&self) -> Option<&Bar> {
        self.bars.back()
    }

    pub fn get(&self, index: usize) -> Option<&Bar> {
        self.bars.get(index)
    }

    pub fn iter(&self) -> vec_deque::Iter<'_, Bar> {
        self.bars.iter()
    }

    pub fn range(&self, range: Range<usize>) -> vec_deque::Iter<'_, Bar> {
        self.bars.range(range)
    }

    /// The newest `n` bars, or `None` if fewer exist
    pub fn recent(&self, n: usize) -> Option<vec_deque::Iter<'_, Bar>> {
        let len = self.bars.len();
        (n <= len).then(|| self.bars.range(len - n..len))
    }

    /// The `n` bars before the newest one, or `None` if fewer exist
    pub fn prior(&self, n: usize) -> Option<vec_deque::Iter<'_, Bar>> {
        let len = self.bars.len();
        (n < len).then(|| self.bars.range(len - n - 1..len - 1))
    }
}

// =============================================================================
// Indicator Functions
// =============================================================================

/// Simple mean of exactly `period` values
fn sma_of(values: impl IntoIterator<Item = f64>, period: usize) -> f64 {
    let mut sma = match SimpleMovingAverage::new(period) {
        Ok(indicator) => indicator,
        Err(_) => return 0.0,
    };
    values.into_iter().fold(0.0, |_, v| sma.next(v))
}

/// Mean true range over the last `period` bars. 0.0 when not ready.
pub fn atr(window: &RollingWindow, period: usize) -> f64 {
    if period == 0 {
        return 0.0;
    }
    match window.recent(period + 1) {
        Some(recent) => sma_of(
            recent
                .tuple_windows()
                .map(|(prev, bar)| bar.true_range(prev.close)),
            period,
        ),
        None => 0.0,
    }
}

/// RSI from simple mean gain / loss over the last `period` close deltas
pub fn rsi(window: &RollingWindow, period: usize) -> f64 {
    let recent = match window.recent(period + 1) {
        Some(recent) if period > 0 => recent,
        _ => return 50.0,
    };

    let deltas: Vec<f64> = recent
        .tuple_windows()
        .map(|(prev, bar)| bar.close - prev.close)
        .collect();
    let avg_gain = sma_of(deltas.iter().map(|d| d.max(0.0)), period);
    let avg_loss = sma_of(deltas.iter().map(|d| (-d).max(0.0)), period);

    if avg_loss == 0.0 {
        return 100.0;
    }
    let rs = avg_gain / avg_loss;
    100.0 - 100.0 / (1.0 + rs)
}

/// Raw support (lowest low) and resistance (highest high) over `lookback` bars
pub fn support_resistance(window: &RollingWindow, lookback: usize) -> Option<(f64, f64)> {
    if lookback == 0 {
        return None;
    }
    let recent = window.recent(lookback)?;
    Some(recent.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), bar| {
        (lo.min(bar.low), hi.max(bar.high))
    }))
}

/// Round-number grid step (minor, major) for an asset at a given price
pub fn round_number_steps(price: f64, asset: &str) -> Option<(f64, f64)> {
    match asset.to_uppercase().as_str() {
        "BTC" | "BITCOIN" | "XBT" => Some((1000.0, 5000.0)),
        "ETH" | "ETHEREUM" => Some((100.0, 500.0)),
        _ => {
            // 1% of price rounded to one significant figure
            let step = price * 0.01;
            if !(step.is_finite() && step > 0.0) {
                return None;
            }
            let magnitude = 10f64.powi(step.log10().floor() as i32);
            let base = (step / magnitude).round() * magnitude;
            (base > 0.0).then_some((base, base * 5.0))
        }
    }
}

/// Nearby psychological levels: minor and major grid lines around `price`
pub fn round_levels(price: f64, asset: &str) -> Vec<f64> {
    let Some((base, major)) = round_number_steps(price, asset) else {
        return Vec::new();
    };
    let lower_base = (price / base).floor() * base;
    let lower_major = (price / major).floor() * major;
    vec![lower_base, lower_base + base, lower_major, lower_major + major]
}

/// Nearest round level strictly below (support) and strictly above (resistance)
pub fn nearest_round_levels(price: f64, asset: &str) -> (Option<f64>, Option<f64>) {
    let levels = round_levels(price, asset);
    let below = levels
        .iter()
        .copied()
        .filter(|&l| l < price)
        .fold(None, |best: Option<f64>, l| Some(best.map_or(l, |b| b.max(l))));
    let above = levels
        .iter()
        .copied()
        .filter(|&l| l > price)
        .fold(None, |best: Option<f64>, l| Some(best.map_or(l, |b| b.min(l))));
    (below, above)
}

/// Linear blend toward a round level; the raw value is kept when there is none
pub fn blend_level(raw: f64, round_level: Option<f64>, weight: f64) -> f64 {
    match round_level {
        Some(level) => raw * (1.0 - weight) + level * weight,
        None => raw,
    }
}

/// Half-window trend classification over the last `lookback` bars
pub fn trend(window: &RollingWindow, lookback: usize) -> Trend {
    let half = lookback / 2;
    let recent: Vec<&Bar> = match window.recent(lookback) {
        Some(recent) if half > 0 => recent.collect(),
        _ => return Trend::None,
    };
    let (first, second) = recent.split_at(half);

    let stats = |bars: &[&Bar]| {
        let high = bars.iter().map(|b| b.high).fold(f64::NEG_INFINITY, f64::max);
        let low = bars.iter().map(|b| b.low).fold(f64::INFINITY, f64::min);
        let avg = bars.iter().map(|b| b.close).sum::<f64>() / bars.len() as f64;
        (high, low, avg)
    };
    let (first_high, first_low, first_avg) = stats(first);
    let (second_high, second_low, second_avg) = stats(second);

    if second_high > first_high && second_low > first_low && second_avg > first_avg {
        Trend::Up
    } else if second_high < first_high && second_low < first_low && second_avg < first_avg {
        Trend::Down
    } else {
        Trend::None
    }
}

/// Direction of the move from the open `ct_bars` back to the latest close
pub fn contrarian(window: &RollingWindow, ct_bars: usize) -> Trend {
    let len = window.len();
    if ct_bars == 0 || len < ct_bars {
        return Trend::None;
    }
    let (Some(first), Some(last)) = (window.get(len - ct_bars), window.last()) else {
        return Trend::None;
    };

    let change = last.close - first.open;
    if change > 0.0 {
        Trend::Up
    } else if change < 0.0 {
        Trend::Down
    } else {
        Trend::None
    }
}

// =============================================================================
// Indicator Engine
// =============================================================================

/// Indicator values for the newest bar. Recomputed on every ingest.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub atr: f64,
    pub rsi: f64,
    pub support: Option<f64>,
    pub resistance: Option<f64>,
    pub trend: Trend,
    pub contrarian: Trend,
}

impl Default for IndicatorSnapshot {
    fn default() -> Self {
        Self {
            atr: 0.0,
            rsi: 50.0,
            support: None,
            resistance: None,
            trend: Trend::None,
            contrarian: Trend::None,
        }
    }
}

impl IndicatorSnapshot {
    /// Trading is gated on a non-zero ATR
    pub fn is_ready(&self) -> bool {
        self.atr > 0.0
    }
}

pub struct IndicatorEngine {
    config: StrategyConfig,
    round_asset: String,
    window: RollingWindow,
    snapshot: IndicatorSnapshot,
}

impl IndicatorEngine {
    pub fn new(config: &StrategyConfig, symbol: &Symbol) -> Self {
        Self {
            round_asset: config.round_number_asset_for(symbol),
            window: RollingWindow::new(config.history_capacity()),
            snapshot: IndicatorSnapshot::default(),
            config: config.clone(),
        }
    }

    /// Append a bar and recompute the snapshot
    pub fn ingest(&mut self, bar: Bar) -> &IndicatorSnapshot {
        self.window.push(bar);
        self.snapshot = self.compute();
        &self.snapshot
    }

    pub fn snapshot(&self) -> &IndicatorSnapshot {
        &self.snapshot
    }

    pub fn window(&self) -> &RollingWindow {
        &self.window
    }

    fn compute(&self) -> IndicatorSnapshot {
        let cfg = &self.config;
        let (support, resistance) = match self.levels() {
            Some((s, r)) => (Some(s), Some(r)),
            None => (None, None),
        };

        IndicatorSnapshot {
            atr: atr(&self.window, cfg.atr_period),
            rsi: rsi(&self.window, cfg.rsi_period),
            support,
            resistance,
            trend: trend(&self.window, cfg.trend_lookback),
            contrarian: contrarian(&self.window, cfg.ct_bars),
        }
    }

    fn levels(&self) -> Option<(f64, f64)> {
        let (support, resistance) = support_resistance(&self.window, self.config.sr_lookback)?;
        if !self.config.use_round_number_sr {
            return Some((support, resistance));
        }

        let close = self.window.last()?.close;
        let (round_support, round_resistance) = nearest_round_levels(close, &self.round_asset);
        let w = self.config.round_number_weight;
        Some((
            blend_level(support, round_support, w),
            blend_level(resistance, round_resistance, w),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::{Duration, TimeZone, Utc};

    fn bar(i: i64, open: f64, high: f64, low: f64, close: f64) -> Bar {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        Bar::new_unchecked(t0 + Duration::hours(i), open, high, low, close, 1.0)
    }

    fn closes(values: &[f64]) -> RollingWindow {
        RollingWindow::from_bars(
            values
                .iter()
                .enumerate()
                .map(|(i, &c)| bar(i as i64, c, c + 1.0, c - 1.0, c)),
            100,
        )
    }

    #[test]
    fn test_ring_buffer_evicts_oldest() {
        let mut window = RollingWindow::new(3);
        for i in 0..3 {
            assert!(window.push(bar(i, 1.0, 1.0, 1.0, 1.0)).is_none());
        }
        let evicted = window.push(bar(3, 2.0, 2.0, 2.0, 2.0)).unwrap();
        assert_eq!(evicted.timestamp, bar(0, 1.0, 1.0, 1.0, 1.0).timestamp);
        assert_eq!(window.len(), 3);
        assert_eq!(window.last().unwrap().close, 2.0);
        assert_eq!(window.prior(2).unwrap().count(), 2);
        assert!(window.prior(3).is_none());
    }

    #[test]
    fn test_atr_not_ready_until_period_plus_one() {
        let window = closes(&[100.0, 101.0, 102.0]);
        assert_eq!(atr(&window, 3), 0.0);
        let window = closes(&[100.0, 101.0, 102.0, 103.0]);
        assert!(atr(&window, 3) > 0.0);
    }

    #[test]
    fn test_atr_is_mean_true_range() {
        // ranges of 2.0 with 1.0 gaps between closes
        let window = closes(&[100.0, 101.0, 102.0, 103.0, 104.0]);
        assert_relative_eq!(atr(&window, 4), 2.0);

        let gap = RollingWindow::from_bars(
            vec![bar(0, 100.0, 101.0, 99.0, 100.0), bar(1, 110.0, 112.0, 108.0, 111.0)],
            10,
        );
        assert_relative_eq!(atr(&gap, 1), 12.0);
    }

    #[test]
    fn test_rsi_bounds_and_defaults() {
        assert_eq!(rsi(&closes(&[100.0, 101.0]), 14), 50.0);
        assert_eq!(rsi(&closes(&[100.0, 101.0, 101.0, 103.0]), 3), 100.0);

        let falling = closes(&[110.0, 108.0, 107.0, 104.0]);
        assert_relative_eq!(rsi(&falling, 3), 0.0);

        // gains 2 + 1, losses 1 -> rs = 3
        let mixed = closes(&[100.0, 102.0, 101.0, 102.0]);
        assert_relative_eq!(rsi(&mixed, 3), 75.0, epsilon = 1e-9);
    }

    #[test]
    fn test_support_resistance_requires_lookback() {
        let window = closes(&[100.0, 105.0, 95.0]);
        assert!(support_resistance(&window, 4).is_none());
        assert_eq!(support_resistance(&window, 3), Some((94.0, 106.0)));
        assert_eq!(support_resistance(&window, 2), Some((94.0, 106.0)));
    }

    #[test]
    fn test_round_number_blend() {
        assert_eq!(blend_level(50_000.0, Some(49_000.0), 0.5), 49_500.0);
        assert_eq!(blend_level(50_000.0, None, 0.5), 50_000.0);
        assert_eq!(blend_level(50_000.0, Some(49_000.0), 0.0), 50_000.0);
    }

    #[test]
    fn test_round_levels_by_asset() {
        assert_eq!(nearest_round_levels(49_600.0, "BTC"), (Some(49_000.0), Some(50_000.0)));
        assert_eq!(nearest_round_levels(3_420.0, "ETH"), (Some(3_400.0), Some(3_500.0)));
        // 1% of 150 is 1.5, rounded to 2
        assert_eq!(round_number_steps(150.0, "SOL"), Some((2.0, 10.0)));
        // levels at the price itself are not strictly below or above
        assert_eq!(nearest_round_levels(50_000.0, "BTC"), (None, Some(51_000.0)));
        assert!(round_levels(0.0, "DOGE").is_empty());
    }

    #[test]
    fn test_trend_classification() {
        let up: Vec<f64> = (0..10).map(|i| 100.0 + i as f64).collect();
        assert_eq!(trend(&closes(&up), 10), Trend::Up);

        let down: Vec<f64> = (0..10).map(|i| 100.0 - i as f64).collect();
        assert_eq!(trend(&closes(&down), 10), Trend::Down);

        assert_eq!(trend(&closes(&[100.0; 10]), 10), Trend::None);
        assert_eq!(trend(&closes(&up[..9]), 10), Trend::None);
    }

    #[test]
    fn test_contrarian_direction() {
        let window = RollingWindow::from_bars(
            vec![bar(0, 100.0, 101.0, 98.0, 99.0), bar(1, 99.0, 99.5, 96.0, 97.0)],
            10,
        );
        assert_eq!(contrarian(&window, 2), Trend::Down);
        assert_eq!(contrarian(&window, 1), Trend::Down);
        assert_eq!(contrarian(&window, 3), Trend::None);

        let flat = RollingWindow::from_bars(vec![bar(0, 100.0, 101.0, 99.0, 100.0)], 10);
        assert_eq!(contrarian(&flat, 1), Trend::None);
    }

    #[test]
    fn test_engine_snapshot_and_capacity() {
        let config = StrategyConfig {
            sr_lookback: 3,
            trend_lookback: 4,
            atr_period: 2,
            rsi_period: 2,
            entry_period: 3,
            exit_period: 2,
            use_round_number_sr: false,
            ..Default::default()
        };
        let mut engine = IndicatorEngine::new(&config, &Symbol::new("BTC"));

        let first = *engine.ingest(bar(0, 100.0, 101.0, 99.0, 100.0));
        assert!(!first.is_ready());
        assert_eq!(first.rsi, 50.0);
        assert!(first.support.is_none());

        for i in 1..40 {
            let c = 100.0 + i as f64;
            engine.ingest(bar(i, c, c + 1.0, c - 1.0, c));
        }
        let snap = engine.snapshot();
        assert!(snap.is_ready());
        assert_eq!(snap.trend, Trend::Up);
        assert_eq!(snap.support, Some(136.0));
        assert_eq!(snap.resistance, Some(140.0));
        assert_eq!(engine.window().len(), config.history_capacity());
    }

    #[test]
    fn test_engine_blends_round_numbers() {
        let config = StrategyConfig {
            sr_lookback: 2,
            round_number_weight: 0.5,
            ..Default::default()
        };
        let mut engine = IndicatorEngine::new(&config, &Symbol::new("BTCUSD"));
        engine.ingest(bar(0, 49_700.0, 49_900.0, 49_600.0, 49_800.0));
        let snap = engine.ingest(bar(1, 49_800.0, 49_900.0, 49_400.0, 49_600.0));
        // raw 49_400 / 49_900, round 49_000 / 50_000
        assert_eq!(snap.support, Some(49_200.0));
        assert_eq!(snap.resistance, Some(49_950.0));
    }
}
