//! Parameter sweeps
//!
//! A grid maps `StrategyConfig` field names to candidate values. Every
//! combination is applied to the base config through its JSON form, replayed
//! in parallel over the same bars, and ranked by a summary metric.

use anyhow::{bail, Context, Result};
use indicatif::ProgressBar;
use itertools::Itertools;
use ordered_float::OrderedFloat;
use rayon::prelude::*;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use tracing::{debug, info};

use crate::backtest::Backtester;
use crate::config::StrategyConfig;
use crate::stats::PerformanceSummary;
use crate::{Bar, Symbol};

pub type Grid = HashMap<String, Vec<Value>>;

// =============================================================================
// Grid generation
// =============================================================================

/// One parameter assignment from the grid
pub type ParamSet = BTreeMap<String, Value>;

/// Every valid config in the grid, in deterministic (sorted-key) order.
/// Unknown field names are an error; combinations that fail validation are
/// dropped.
pub fn generate_grid_configs(
    base: &StrategyConfig,
    grid: &Grid,
) -> Result<Vec<(ParamSet, StrategyConfig)>> {
    let base_json = serde_json::to_value(base)?;
    let Some(base_obj) = base_json.as_object() else {
        bail!("Strategy config did not serialize to an object");
    };

    let keys: Vec<&String> = grid.keys().sorted().collect();
    for key in &keys {
        if !base_obj.contains_key(key.as_str()) {
            bail!("Unknown strategy parameter in grid: {}", key);
        }
    }
    if keys.is_empty() {
        return Ok(vec![(ParamSet::new(), base.clone())]);
    }

    let mut configs = Vec::new();
    for combo in keys
        .iter()
        .map(|k| grid[*k].iter())
        .multi_cartesian_product()
    {
        let mut obj = base_obj.clone();
        let mut params = ParamSet::new();
        for (key, value) in keys.iter().zip(combo) {
            obj.insert((*key).clone(), value.clone());
            params.insert((*key).clone(), value.clone());
        }

        let config: StrategyConfig = serde_json::from_value(Value::Object(obj))
            .with_context(|| format!("Bad grid values: {}", format_params(&params)))?;
        match config.validate() {
            Ok(()) => configs.push((params, config)),
            Err(e) => debug!(params = %format_params(&params), error = %e, "Skipping invalid combination"),
        }
    }
    Ok(configs)
}

/// Size of the full cartesian product, before validation
pub fn total_combinations(grid: &Grid) -> usize {
    grid.values().map(Vec::len).product()
}

/// Parse a CLI override: "param=val1,val2,val3"
pub fn parse_grid_override(s: &str) -> Option<(String, Vec<Value>)> {
    let (key, values) = s.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }

    let values: Vec<Value> = values
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| {
            if let Ok(n) = v.parse::<i64>() {
                Value::from(n)
            } else if let Ok(n) = v.parse::<f64>() {
                Value::from(n)
            } else if let Ok(b) = v.parse::<bool>() {
                Value::from(b)
            } else {
                Value::from(v)
            }
        })
        .collect();

    (!values.is_empty()).then(|| (key.to_string(), values))
}

/// Merge CLI overrides into `grid`, replacing keys that already exist
pub fn apply_overrides(grid: &mut Grid, overrides: &[String]) -> Result<()> {
    for raw in overrides {
        let Some((key, values)) = parse_grid_override(raw) else {
            bail!("Invalid grid override '{}', expected name=v1,v2", raw);
        };
        grid.insert(key, values);
    }
    Ok(())
}

pub fn format_params(params: &ParamSet) -> String {
    params
        .iter()
        .map(|(k, v)| match v {
            Value::String(s) => format!("{}={}", k, s),
            other => format!("{}={}", k, other),
        })
        .join(", ")
}

// =============================================================================
// Sweep
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct SweepResult {
    pub params: ParamSet,
    pub summary: PerformanceSummary,
}

/// Ranking metric, best first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortBy {
    #[default]
    TotalPnl,
    ProfitFactor,
    WinRate,
    /// Shallowest drawdown first
    Drawdown,
    Trades,
}

impl SortBy {
    fn key(self, summary: &PerformanceSummary) -> OrderedFloat<f64> {
        OrderedFloat(match self {
            SortBy::TotalPnl => summary.total_pnl_pct,
            SortBy::ProfitFactor => summary.profit_factor,
            SortBy::WinRate => summary.win_rate,
            SortBy::Drawdown => summary.max_drawdown_usd,
            SortBy::Trades => summary.total_trades as f64,
        })
    }
}

impl FromStr for SortBy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "pnl" | "total_pnl" => SortBy::TotalPnl,
            "pf" | "profit_factor" => SortBy::ProfitFactor,
            "win_rate" => SortBy::WinRate,
            "drawdown" => SortBy::Drawdown,
            "trades" => SortBy::Trades,
            other => bail!(
                "Unknown sort metric '{}' (pnl, profit_factor, win_rate, drawdown, trades)",
                other
            ),
        })
    }
}

pub struct Optimizer {
    symbol: Symbol,
    account_size: f64,
}

impl Optimizer {
    pub fn new(symbol: Symbol, account_size: f64) -> Self {
        Optimizer {
            symbol,
            account_size,
        }
    }

    /// Backtest every config over `bars` in parallel
    pub fn run(
        &self,
        bars: &[Bar],
        configs: Vec<(ParamSet, StrategyConfig)>,
        progress: Option<&ProgressBar>,
    ) -> Result<Vec<SweepResult>> {
        info!("Testing {} parameter combinations", configs.len());

        configs
            .into_par_iter()
            .map(|(params, config)| {
                let backtester = Backtester::new(config, self.symbol.clone(), self.account_size);
                let result = backtester.run(bars)?;
                if let Some(pb) = progress {
                    pb.inc(1);
                }
                Ok(SweepResult {
                    params,
                    summary: result.summary,
                })
            })
            .collect()
    }

    /// Best first. Ties keep grid order.
    pub fn sort_results(results: &mut [SweepResult], sort_by: SortBy) {
        results.sort_by_key(|r| std::cmp::Reverse(sort_by.key(&r.summary)));
    }
}
