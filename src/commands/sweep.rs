//! Sweep command: parallel grid search with progress tracking

use anyhow::{bail, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use sr_bounce::data;
use sr_bounce::optimizer::{
    apply_overrides, format_params, generate_grid_configs, total_combinations, Optimizer, SortBy,
    SweepResult,
};
use sr_bounce::{Config, Symbol};
use std::path::Path;
use std::time::Instant;
use tracing::info;

pub fn run(
    config_path: String,
    data_override: Option<String>,
    grid_overrides: Vec<String>,
    sort_by: String,
    top: usize,
    min_trades: usize,
    output: Option<String>,
) -> Result<()> {
    info!("Starting sweep");
    let sort_by: SortBy = sort_by.parse()?;

    let mut config = Config::from_file(&config_path)?;
    info!("Loaded configuration from: {}", config_path);
    if let Some(path) = data_override {
        config.backtest.data_file = path;
    }

    let mut grid = config.grid.clone().unwrap_or_default();
    apply_overrides(&mut grid, &grid_overrides)?;
    if grid.is_empty() {
        bail!("Empty grid: add a `grid` section to the config or pass --grid name=v1,v2");
    }

    let bars = data::load_csv(&config.backtest.data_file)?;
    info!("Loaded {} bars from {}", bars.len(), config.backtest.data_file);

    let configs = generate_grid_configs(&config.strategy, &grid)?;
    let total = total_combinations(&grid);
    if configs.len() < total {
        info!("{} of {} combinations failed validation", total - configs.len(), total);
    }

    println!("\n{}", "=".repeat(60));
    println!("PARAMETER SWEEP");
    println!("{}", "=".repeat(60));
    println!("  Strategy:     {}", config.strategy.strategy);
    println!("  Symbol:       {}", config.backtest.symbol);
    println!("  Bars:         {}", bars.len());
    println!("  Combinations: {}", configs.len());
    println!("{}\n", "=".repeat(60));

    let progress = ProgressBar::new(configs.len() as u64);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
            .context("Invalid progress template")?
            .progress_chars("#>-"),
    );

    let started = Instant::now();
    let optimizer = Optimizer::new(
        Symbol::new(config.backtest.symbol.clone()),
        config.backtest.account_size,
    );
    let mut results = optimizer.run(&bars, configs, Some(&progress))?;
    progress.finish_and_clear();
    info!("Sweep finished in {:.1}s", started.elapsed().as_secs_f64());

    Optimizer::sort_results(&mut results, sort_by);

    if let Some(path) = output {
        write_results(&results, &path)?;
        println!("All results written to {}", path);
    }

    let shown: Vec<&SweepResult> = results
        .iter()
        .filter(|r| r.summary.total_trades >= min_trades)
        .take(top)
        .collect();

    println!("TOP {} BY {:?}", shown.len(), sort_by);
    println!("{}", "-".repeat(60));
    for (rank, r) in shown.iter().enumerate() {
        let s = &r.summary;
        println!(
            "#{:<3} trades {:>4}  win {:>5.1}%  pnl {:>8.2}%  pf {:>5.2}  dd ${:>9.2}",
            rank + 1,
            s.total_trades,
            s.win_rate,
            s.total_pnl_pct,
            s.profit_factor,
            s.max_drawdown_usd
        );
        println!("     {}", format_params(&r.params));
    }
    println!("{}", "=".repeat(60));

    Ok(())
}

fn write_results(results: &[SweepResult], path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    writer.write_record([
        "params",
        "total_trades",
        "win_rate",
        "total_pnl_pct",
        "total_pnl_usd",
        "profit_factor",
        "max_drawdown_usd",
    ])?;
    for r in results {
        let s = &r.summary;
        writer.write_record([
            format_params(&r.params),
            s.total_trades.to_string(),
            format!("{:.2}", s.win_rate),
            format!("{:.4}", s.total_pnl_pct),
            format!("{:.2}", s.total_pnl_usd),
            format!("{:.4}", s.profit_factor),
            format!("{:.2}", s.max_drawdown_usd),
        ])?;
    }
    writer.flush()?;
    Ok(())
}
