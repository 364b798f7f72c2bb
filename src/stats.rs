//! Trade-log statistics
//!
//! Win rate, profit factor, drawdown of cumulative USD P&L, and breakdowns
//! by exit reason and by direction.

use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;

use crate::{Direction, ExitReason, TradeRecord};

/// Floor applied to gross loss before dividing
pub const GROSS_LOSS_EPSILON: f64 = 0.001;

/// Aggregates for one group of trades
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Breakdown {
    pub count: usize,
    pub wins: usize,
    pub total_pnl_pct: f64,
    pub total_pnl_usd: f64,
    /// Percent of trades in the group with positive return
    pub win_rate: f64,
}

impl Breakdown {
    fn from_trades<'a>(trades: impl Iterator<Item = &'a TradeRecord>) -> Self {
        let mut breakdown = trades.fold(Breakdown::default(), |mut b, t| {
            b.count += 1;
            b.wins += usize::from(t.is_win());
            b.total_pnl_pct += t.pnl_pct;
            b.total_pnl_usd += t.pnl_usd;
            b
        });
        if breakdown.count > 0 {
            breakdown.win_rate = breakdown.wins as f64 / breakdown.count as f64 * 100.0;
        }
        breakdown
    }
}

/// Summary over a full trade log
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSummary {
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    /// Percent, 0-100
    pub win_rate: f64,
    pub total_pnl_pct: f64,
    pub total_pnl_usd: f64,
    pub gross_profit_pct: f64,
    pub gross_loss_pct: f64,
    pub profit_factor: f64,
    /// Deepest fall of cumulative USD P&L below its running peak (<= 0)
    pub max_drawdown_usd: f64,
    pub avg_pnl_pct: f64,
    pub std_pnl_pct: f64,
    pub avg_win_pct: f64,
    pub avg_loss_pct: f64,
    pub by_reason: Vec<(ExitReason, Breakdown)>,
    pub by_direction: Vec<(Direction, Breakdown)>,
}

impl PerformanceSummary {
    pub fn reason(&self, reason: ExitReason) -> Option<&Breakdown> {
        self.by_reason.iter().find(|(r, _)| *r == reason).map(|(_, b)| b)
    }

    pub fn direction(&self, direction: Direction) -> Option<&Breakdown> {
        self.by_direction
            .iter()
            .find(|(d, _)| *d == direction)
            .map(|(_, b)| b)
    }
}

/// Collects closed trades in order
#[derive(Debug, Clone, Default)]
pub struct StatsAggregator {
    trades: Vec<TradeRecord>,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, trade: TradeRecord) {
        self.trades.push(trade);
    }

    pub fn trades(&self) -> &[TradeRecord] {
        &self.trades
    }

    pub fn into_trades(self) -> Vec<TradeRecord> {
        self.trades
    }

    pub fn summary(&self) -> PerformanceSummary {
        summarize(&self.trades)
    }
}

/// Compute the summary for a trade log
pub fn summarize(trades: &[TradeRecord]) -> PerformanceSummary {
    if trades.is_empty() {
        return PerformanceSummary::default();
    }

    let returns: Vec<f64> = trades.iter().map(|t| t.pnl_pct).collect();
    let wins: Vec<f64> = returns.iter().copied().filter(|r| *r > 0.0).collect();
    let losses: Vec<f64> = returns.iter().copied().filter(|r| *r <= 0.0).collect();

    let gross_profit: f64 = wins.iter().sum();
    let gross_loss: f64 = losses.iter().map(|r| r.abs()).sum();

    let mean_of = |values: &[f64]| if values.is_empty() { 0.0 } else { values.mean() };
    let std_pnl_pct = if returns.len() > 1 { returns.iter().std_dev() } else { 0.0 };

    let by_reason = ExitReason::ALL
        .iter()
        .map(|&reason| {
            (
                reason,
                Breakdown::from_trades(trades.iter().filter(|t| t.exit_reason == reason)),
            )
        })
        .filter(|(_, b)| b.count > 0)
        .collect();

    let by_direction = [Direction::Long, Direction::Short]
        .iter()
        .map(|&direction| {
            (
                direction,
                Breakdown::from_trades(trades.iter().filter(|t| t.direction == direction)),
            )
        })
        .filter(|(_, b)| b.count > 0)
        .collect();

    PerformanceSummary {
        total_trades: trades.len(),
        winning_trades: wins.len(),
        losing_trades: losses.len(),
        win_rate: wins.len() as f64 / trades.len() as f64 * 100.0,
        total_pnl_pct: returns.iter().sum(),
        total_pnl_usd: trades.iter().map(|t| t.pnl_usd).sum(),
        gross_profit_pct: gross_profit,
        gross_loss_pct: gross_loss,
        profit_factor: gross_profit / gross_loss.max(GROSS_LOSS_EPSILON),
        max_drawdown_usd: max_drawdown(trades.iter().map(|t| t.pnl_usd)),
        avg_pnl_pct: mean_of(&returns),
        std_pnl_pct,
        avg_win_pct: mean_of(&wins),
        avg_loss_pct: mean_of(&losses),
        by_reason,
        by_direction,
    }
}

/// min(cumulative - running max of cumulative), 0.0 for an empty series
pub fn max_drawdown(pnls: impl IntoIterator<Item = f64>) -> f64 {
    let mut cumulative = 0.0;
    let mut peak = f64::NEG_INFINITY;
    let mut worst: f64 = 0.0;
    for pnl in pnls {
        cumulative += pnl;
        peak = peak.max(cumulative);
        worst = worst.min(cumulative - peak);
    }
    worst
}
