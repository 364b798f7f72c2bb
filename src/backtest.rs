//! Backtesting engine
//!
//! Deterministic replay of a bar series through the same `Runner` the live
//! trader uses. Entries fill at the signal bar's close; stop/target exits
//! fill at their level, RSI/time exits at the close.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::config::StrategyConfig;
use crate::position::PnlModel;
use crate::runner::Runner;
use crate::stats::{PerformanceSummary, StatsAggregator};
use crate::strategies::SignalStats;
use crate::{Bar, Position, Symbol, TradeRecord};

/// Backtest engine
pub struct Backtester {
    config: StrategyConfig,
    symbol: Symbol,
    account_size: f64,
}

impl Backtester {
    pub fn new(config: StrategyConfig, symbol: Symbol, account_size: f64) -> Self {
        Backtester {
            config,
            symbol,
            account_size,
        }
    }

    /// Replay `bars` in order
    pub fn run(&self, bars: &[Bar]) -> Result<BacktestResult> {
        let mut runner = Runner::new(
            &self.config,
            &self.symbol,
            PnlModel::FixedNotional {
                account_size: self.account_size,
            },
        )?;
        let mut stats = StatsAggregator::new();
        let mut bars_skipped = 0;
        let account_size = self.account_size;

        for bar in bars {
            let outcome = runner.process_bar(bar.clone(), |price| account_size / price);
            if !outcome.ready {
                bars_skipped += 1;
            }
            if let Some(trade) = outcome.exit {
                stats.record(trade);
            }
        }

        let summary = stats.summary();
        tracing::debug!(
            symbol = %self.symbol,
            strategy = runner.strategy_name(),
            bars = bars.len(),
            trades = summary.total_trades,
            "Backtest finished"
        );

        Ok(BacktestResult {
            strategy: runner.strategy_name().to_string(),
            bars_processed: bars.len(),
            bars_skipped,
            signal_stats: runner.signal_stats(),
            open_position: runner.position().cloned(),
            trades: stats.into_trades(),
            summary,
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BacktestResult {
    pub strategy: String,
    pub bars_processed: usize,
    /// Bars seen before ATR was ready
    pub bars_skipped: usize,
    pub trades: Vec<TradeRecord>,
    pub summary: PerformanceSummary,
    pub signal_stats: SignalStats,
    /// Position still open when the data ran out (not counted in stats)
    pub open_position: Option<Position>,
}
