//! Integration tests for the sr-bounce engine
//!
//! These tests drive the public API end to end: replays through the
//! backtester, CSV persistence, and the live trader over the paper executor.

use anyhow::{bail, Result};
use approx::assert_relative_eq;
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::{Arc, Mutex};

use sr_bounce::backtest::Backtester;
use sr_bounce::config::ToleranceMode;
use sr_bounce::data::{self, MarketData};
use sr_bounce::exchange::{OrderExecutor, PaperExecutor};
use sr_bounce::live::{CycleOutcome, LiveTrader};
use sr_bounce::state_manager::SqliteStateManager;
use sr_bounce::stats::{summarize, GROSS_LOSS_EPSILON};
use sr_bounce::{
    Bar, Config, Direction, ExitReason, StrategyConfig, StrategyKind, Symbol, TradeRecord,
};

// =============================================================================
// Test Utilities
// =============================================================================

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
}

fn bar(i: i64, open: f64, high: f64, low: f64, close: f64) -> Bar {
    Bar::new(t0() + Duration::hours(i), open, high, low, close, 10.0).unwrap()
}

/// Rising bars of constant true range 50: base 1000 + 20i, +-25 around it
fn uptrend_bar(i: i64) -> Bar {
    let base = 1000.0 + 20.0 * i as f64;
    bar(i, base, base + 25.0, base - 25.0, base)
}

/// Closes at the high, above the previous high; true range 50
fn climbing_bar(i: i64) -> Bar {
    let base = 1000.0 + 50.0 * i as f64;
    bar(i, base, base + 20.0, base - 30.0, base + 20.0)
}

/// Smooth oscillation that breaks out of short channels on every upswing
fn oscillating(n: i64) -> Vec<Bar> {
    (0..n)
        .map(|i| {
            let close = 30_000.0 + 500.0 * (i as f64 * 0.5).sin();
            let open = 30_000.0 + 500.0 * ((i - 1) as f64 * 0.5).sin();
            bar(i, open, open.max(close) + 50.0, open.min(close) - 50.0, close)
        })
        .collect()
}

fn fast_breakout(min_gap: usize) -> StrategyConfig {
    StrategyConfig {
        strategy: StrategyKind::Breakout,
        entry_period: 3,
        exit_period: 2,
        breakout_atr_mult: 0.0,
        atr_period: 3,
        stop_atr_mult: 2.0,
        target_atr_mult: 3.0,
        use_trailing_stop: true,
        trail_activation_atr: 1.0,
        trail_distance_atr: 0.5,
        max_hold_bars: 3,
        min_gap_bars: min_gap,
        rsi_exit_high: 100.0,
        rsi_exit_low: 0.0,
        use_round_number_sr: false,
        ..Default::default()
    }
}

fn hours_between(a: DateTime<Utc>, b: DateTime<Utc>) -> i64 {
    (b - a).num_hours()
}

// =============================================================================
// Bounce scenario
// =============================================================================

#[test]
fn test_uptrend_support_touch_yields_single_long() {
    // 19 staircase bars, then a pullback bar (TR still 50) that sets the
    // 2-bar support, then two bars to let the time exit fire
    let mut bars: Vec<Bar> = (0..19).map(uptrend_bar).collect();
    bars.push(bar(19, 1360.0, 1365.0, 1315.0, 1340.0));
    bars.push(bar(20, 1360.0, 1385.0, 1335.0, 1360.0));
    bars.push(bar(21, 1380.0, 1405.0, 1355.0, 1380.0));

    let config = StrategyConfig {
        strategy: StrategyKind::Bounce,
        sr_lookback: 2,
        tolerance_mode: ToleranceMode::PercentOfPrice,
        sr_tolerance_pct: 0.1,
        trend_lookback: 20,
        use_trend_filter: true,
        use_ct_filter: false,
        atr_period: 5,
        stop_atr_mult: 1.5,
        target_atr_mult: 2.0,
        use_trailing_stop: false,
        max_hold_bars: 2,
        min_gap_bars: 100,
        rsi_exit_high: 100.0,
        rsi_exit_low: 0.0,
        use_round_number_sr: false,
        ..Default::default()
    };

    let result = Backtester::new(config, Symbol::new("BTC"), 10_000.0)
        .run(&bars)
        .unwrap();

    assert_eq!(result.trades.len(), 1);
    let trade = &result.trades[0];
    assert_eq!(trade.direction, Direction::Long);
    assert_eq!(trade.entry_time, bars[19].timestamp);
    assert_eq!(trade.entry_price, 1340.0);
    assert_relative_eq!(trade.atr_at_entry, 50.0);
    assert_eq!(trade.exit_reason, ExitReason::Time);
    assert_eq!(trade.exit_price, 1380.0);
    assert_relative_eq!(trade.pnl_pct, 40.0 / 1340.0 * 100.0);
    assert_relative_eq!(trade.pnl_usd, 10_000.0 * trade.pnl_pct / 100.0);

    assert_eq!(result.signal_stats.signals_generated, 1);
    assert!(result.open_position.is_none());
    assert_eq!(result.summary.total_trades, 1);
    assert_eq!(result.summary.winning_trades, 1);
}

// =============================================================================
// Runner properties
// =============================================================================

#[test]
fn test_min_gap_between_exit_and_next_entry() {
    let bars = oscillating(400);

    for min_gap in [0usize, 3, 8, 20] {
        let result = Backtester::new(fast_breakout(min_gap), Symbol::new("BTC"), 10_000.0)
            .run(&bars)
            .unwrap();
        assert!(!result.trades.is_empty(), "no trades with min_gap {}", min_gap);

        for pair in result.trades.windows(2) {
            let gap = hours_between(pair[0].exit_time, pair[1].entry_time);
            assert!(
                gap >= min_gap as i64,
                "re-entered {} bars after exit with min_gap {}",
                gap,
                min_gap
            );
        }
    }
}

#[test]
fn test_at_most_one_position_open() {
    let bars = oscillating(400);
    let result = Backtester::new(fast_breakout(0), Symbol::new("BTC"), 10_000.0)
        .run(&bars)
        .unwrap();

    for trade in &result.trades {
        assert!(trade.exit_time >= trade.entry_time);
    }
    for pair in result.trades.windows(2) {
        assert!(pair[1].entry_time >= pair[0].exit_time);
    }
    if let (Some(open), Some(last)) = (&result.open_position, result.trades.last()) {
        assert!(open.entry_time >= last.exit_time);
    }
}

#[test]
fn test_no_trading_before_atr_ready() {
    let bars = oscillating(400);
    let config = fast_breakout(0);
    let result = Backtester::new(config.clone(), Symbol::new("BTC"), 10_000.0)
        .run(&bars)
        .unwrap();

    assert_eq!(result.bars_skipped, config.atr_period);
    let first = result.trades.first().unwrap();
    assert!(hours_between(t0(), first.entry_time) >= config.atr_period as i64);
}

#[test]
fn test_breakout_entries_clear_the_channel() {
    let bars = oscillating(400);
    let config = fast_breakout(0);
    let result = Backtester::new(config.clone(), Symbol::new("BTC"), 10_000.0)
        .run(&bars)
        .unwrap();

    for trade in &result.trades {
        let idx = hours_between(t0(), trade.entry_time) as usize;
        let prior = &bars[idx - config.entry_period..idx];
        match trade.direction {
            Direction::Long => {
                let high = prior.iter().map(|b| b.high).fold(f64::MIN, f64::max);
                assert!(trade.entry_price > high);
            }
            Direction::Short => {
                let low = prior.iter().map(|b| b.low).fold(f64::MAX, f64::min);
                assert!(trade.entry_price < low);
            }
        }
        assert_relative_eq!(trade.pnl_usd, 10_000.0 * trade.pnl_pct / 100.0);
    }

    let reasons: usize = result.summary.by_reason.iter().map(|(_, b)| b.count).sum();
    assert_eq!(reasons, result.trades.len());
}

// =============================================================================
// Statistics
// =============================================================================

fn winner(pnl_pct: f64) -> TradeRecord {
    TradeRecord {
        entry_time: t0(),
        exit_time: t0() + Duration::hours(2),
        direction: Direction::Long,
        entry_price: 100.0,
        exit_price: 100.0 + pnl_pct,
        pnl_pct,
        pnl_usd: pnl_pct * 100.0,
        exit_reason: ExitReason::Target,
        atr_at_entry: 1.0,
        size: 1.0,
    }
}

#[test]
fn test_profit_factor_finite_without_losses() {
    let summary = summarize(&[winner(1.0), winner(2.5)]);
    assert!(summary.profit_factor.is_finite());
    assert_relative_eq!(summary.profit_factor, 3.5 / GROSS_LOSS_EPSILON);
    assert_eq!(summary.win_rate, 100.0);
    assert_eq!(summary.max_drawdown_usd, 0.0);
}

// =============================================================================
// Data round trip
// =============================================================================

#[test]
fn test_csv_replay_matches_in_memory() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("BTCUSD_1h.csv");
    let bars = oscillating(250);
    data::save_csv(&bars, &path).unwrap();

    let loaded = data::load_csv(&path).unwrap();
    assert_eq!(loaded, bars);

    let bt = Backtester::new(fast_breakout(2), Symbol::new("BTC"), 10_000.0);
    assert_eq!(bt.run(&loaded).unwrap().trades, bt.run(&bars).unwrap().trades);

    let start = data::parse_date("2024-03-02").unwrap();
    let window = data::filter_by_date(&loaded, Some(start), None);
    assert_eq!(window.len(), bars.len() - 24);
}

// =============================================================================
// Live trader over the paper executor
// =============================================================================

struct ScriptedMarket {
    bars: Mutex<Vec<Bar>>,
    price: Mutex<Option<f64>>,
}

#[async_trait]
impl MarketData for ScriptedMarket {
    async fn recent_bars(&self, _symbol: &Symbol, limit: usize) -> Result<Vec<Bar>> {
        let bars = self.bars.lock().unwrap();
        let start = bars.len().saturating_sub(limit);
        Ok(bars[start..].to_vec())
    }

    async fn latest_price(&self, _symbol: &Symbol) -> Result<f64> {
        match *self.price.lock().unwrap() {
            Some(price) => Ok(price),
            None => bail!("no quote"),
        }
    }
}

#[tokio::test]
async fn test_shadow_trading_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("shadow_trades.jsonl");

    let history: Vec<Bar> = (0..30).map(climbing_bar).collect();
    let market = Arc::new(ScriptedMarket {
        bars: Mutex::new(history),
        price: Mutex::new(None),
    });
    let executor = Arc::new(PaperExecutor::new(10_000.0, &log));

    let mut config = Config::default();
    config.strategy = StrategyConfig {
        entry_period: 2,
        exit_period: 1,
        breakout_atr_mult: 0.0,
        atr_period: 5,
        stop_atr_mult: 1.0,
        target_atr_mult: 10.0,
        use_trailing_stop: false,
        max_hold_bars: 50,
        rsi_exit_high: 100.0,
        rsi_exit_low: 0.0,
        ..StrategyConfig::donchian_preset()
    };
    config.live.history_bars = 30;

    let mut trader = LiveTrader::new(
        &config,
        Symbol::new("BTC"),
        market.clone(),
        executor.clone(),
        SqliteStateManager::in_memory().unwrap(),
    )
    .unwrap();

    let now = t0() + Duration::hours(30);
    let CycleOutcome::NewBar { entry: Some(pos), .. } = trader.start_at(now).await.unwrap() else {
        panic!("expected an entry on the last history bar");
    };
    assert_eq!(pos.direction, Direction::Long);
    assert_eq!(pos.entry_price, 2470.0);
    assert_eq!(pos.stop_price, 2420.0);
    // 1% of 10k risked over a 50 stop distance
    assert_relative_eq!(pos.size, 2.0);

    // between bars the quote falls through the stop
    *market.price.lock().unwrap() = Some(2410.0);
    let outcome = trader.poll_at(now + Duration::minutes(5)).await;
    let CycleOutcome::PriceCheck { exit: Some(trade), .. } = outcome else {
        panic!("expected a stop exit, got {:?}", outcome);
    };
    assert_eq!(trade.exit_reason, ExitReason::Stop);
    assert_eq!(trade.exit_price, 2410.0);
    assert_relative_eq!(trade.pnl_usd, -120.0, epsilon = 1e-9);

    assert_relative_eq!(executor.equity().await.unwrap(), 9_880.0);
    assert_relative_eq!(trader.state().daily_pnl, -120.0, epsilon = 1e-9);
    assert_eq!(trader.state_manager().load_trades("BTC").unwrap(), vec![trade]);

    let fills = std::fs::read_to_string(&log).unwrap();
    assert_eq!(fills.lines().count(), 2);
}
