//! Backtest command implementation

use anyhow::{Context, Result};
use sr_bounce::backtest::{BacktestResult, Backtester};
use sr_bounce::data::{self, parse_date};
use sr_bounce::{Config, StrategyConfig, StrategyKind, Symbol, TradeRecord};
use std::path::Path;
use tracing::{debug, info, warn};

pub struct BacktestArgs {
    pub config_path: String,
    pub data: Option<String>,
    pub strategy: Option<String>,
    pub symbol: Option<String>,
    pub capital: Option<f64>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub trades_out: Option<String>,
}

pub fn run(args: BacktestArgs) -> Result<()> {
    info!("Starting backtest");

    let mut config = Config::from_file(&args.config_path)?;
    info!("Loaded configuration from: {}", args.config_path);

    if let Some(strategy) = args.strategy {
        let kind: StrategyKind = strategy.parse()?;
        if kind != config.strategy.strategy {
            info!("Overriding strategy to: {}", kind);
            config.strategy = match kind {
                // switching variants picks up that variant's stop/trail defaults
                StrategyKind::Breakout => StrategyConfig::donchian_preset(),
                StrategyKind::Bounce => StrategyConfig::default(),
            };
        }
    }
    if let Some(capital) = args.capital {
        info!("Overriding account size to: ${:.2}", capital);
        config.backtest.account_size = capital;
    }
    if let Some(symbol) = args.symbol {
        config.backtest.symbol = symbol;
    }
    if let Some(path) = args.data {
        config.backtest.data_file = path;
    }
    config.validate()?;

    info!("Loading data from: {}", config.backtest.data_file);
    let bars = data::load_csv(&config.backtest.data_file)?;
    let start = args.start.as_deref().map(parse_date).transpose()?;
    let end = args.end.as_deref().map(parse_date).transpose()?;
    let bars = if start.is_some() || end.is_some() {
        let filtered = data::filter_by_date(&bars, start, end);
        info!("Date filter kept {} of {} bars", filtered.len(), bars.len());
        filtered
    } else {
        bars
    };
    if bars.is_empty() {
        warn!("No bars to replay");
    }
    debug!(strategy = ?config.strategy, "Strategy parameters");

    let symbol = Symbol::new(config.backtest.symbol.clone());
    let backtester = Backtester::new(
        config.strategy.clone(),
        symbol.clone(),
        config.backtest.account_size,
    );

    info!("Running backtest...");
    let result = backtester.run(&bars)?;
    print_results(&symbol, config.backtest.account_size, &result);

    if let Some(path) = args.trades_out {
        write_trades(&result.trades, &path)?;
        info!("Trade log written to {}", path);
    }

    info!("Backtest completed successfully");
    Ok(())
}

fn print_results(symbol: &Symbol, account_size: f64, result: &BacktestResult) {
    let s = &result.summary;

    println!("\n{}", "=".repeat(60));
    println!("BACKTEST RESULTS - {} ({})", symbol, result.strategy);
    println!("{}", "=".repeat(60));
    println!("Bars Processed:     {}", result.bars_processed);
    println!("Warm-up Bars:       {}", result.bars_skipped);
    println!("Account Size:       ${:.2}", account_size);
    println!("Total Trades:       {}", s.total_trades);
    println!("Winning Trades:     {}", s.winning_trades);
    println!("Losing Trades:      {}", s.losing_trades);
    println!("Win Rate:           {:.2}%", s.win_rate);
    println!("Total P&L:          {:.2}% (${:.2})", s.total_pnl_pct, s.total_pnl_usd);
    println!("Profit Factor:      {:.2}", s.profit_factor);
    println!("Max Drawdown:       ${:.2}", s.max_drawdown_usd);
    println!("Avg Trade:          {:.3}% (std {:.3}%)", s.avg_pnl_pct, s.std_pnl_pct);
    println!("Avg Win:            {:.3}%", s.avg_win_pct);
    println!("Avg Loss:           {:.3}%", s.avg_loss_pct);

    if !s.by_reason.is_empty() {
        println!("{}", "-".repeat(60));
        println!("EXIT REASONS");
        for (reason, b) in &s.by_reason {
            println!(
                "  {:<14} {:>4} trades  {:>6.1}% win  {:>8.2}%",
                reason.as_str(),
                b.count,
                b.win_rate,
                b.total_pnl_pct
            );
        }
    }
    if !s.by_direction.is_empty() {
        println!("{}", "-".repeat(60));
        println!("DIRECTIONS");
        for (direction, b) in &s.by_direction {
            println!(
                "  {:<14} {:>4} trades  {:>6.1}% win  {:>8.2}%",
                direction.as_str(),
                b.count,
                b.win_rate,
                b.total_pnl_pct
            );
        }
    }

    let signals = &result.signal_stats;
    println!("{}", "-".repeat(60));
    println!("Signals Generated:  {}", signals.signals_generated);
    println!("Filtered (trend):   {}", signals.filtered_by_trend);
    println!("Filtered (session): {}", signals.filtered_by_session);
    if let Some(pos) = &result.open_position {
        println!(
            "Open at end:        {} @ {:.2} since {}",
            pos.direction, pos.entry_price, pos.entry_time
        );
    }
    println!("{}", "=".repeat(60));
}

fn write_trades(trades: &[TradeRecord], path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    for trade in trades {
        writer.serialize(trade)?;
    }
    writer.flush()?;
    Ok(())
}
