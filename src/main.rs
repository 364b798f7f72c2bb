//! sr-bounce - main entry point
//!
//! Subcommands:
//! - backtest: replay a CSV through one strategy
//! - sweep: parallel parameter grid search
//! - live: shadow-trade a symbol by polling hourly bars
//! - status: print persisted live state
//! - download: fetch hourly history to CSV

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

const DEFAULT_CONFIG: &str = "configs/bounce_btc_1h.json";

#[derive(Parser, Debug)]
#[command(name = "sr-bounce")]
#[command(about = "S/R bounce and Donchian breakout engine with backtesting, sweeps, and shadow trading", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run strategy backtest
    Backtest {
        /// Path to configuration file
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        config: String,

        /// CSV file (overrides backtest.data_file)
        #[arg(short, long)]
        data: Option<String>,

        /// Strategy variant: bounce or breakout (overrides config file)
        #[arg(short, long)]
        strategy: Option<String>,

        /// Traded symbol (overrides backtest.symbol)
        #[arg(long)]
        symbol: Option<String>,

        /// Reference account size for USD P&L
        #[arg(long)]
        capital: Option<f64>,

        /// Start date (YYYY-MM-DD, inclusive)
        #[arg(long)]
        start: Option<String>,

        /// End date (YYYY-MM-DD, exclusive)
        #[arg(long)]
        end: Option<String>,

        /// Write the trade log to this CSV file
        #[arg(long)]
        trades_out: Option<String>,
    },

    /// Grid search over strategy parameters
    Sweep {
        /// Path to base configuration file (its `grid` section is the default grid)
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        config: String,

        /// CSV file (overrides backtest.data_file)
        #[arg(short, long)]
        data: Option<String>,

        /// Grid override, repeatable. E.g. --grid stop_atr_mult=1.0,1.5,2.0
        #[arg(short, long)]
        grid: Vec<String>,

        /// Sort results by metric (pnl, profit_factor, win_rate, drawdown, trades)
        #[arg(long, default_value = "pnl")]
        sort_by: String,

        /// Number of top results to show
        #[arg(short, long, default_value = "10")]
        top: usize,

        /// Hide results with fewer trades
        #[arg(long, default_value = "1")]
        min_trades: usize,

        /// Write all results to this CSV file
        #[arg(short, long)]
        output: Option<String>,
    },

    /// Run the polling trader
    Live {
        /// Path to configuration file
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        config: String,

        /// Shadow mode: simulated fills, no real orders (the default)
        #[arg(long)]
        paper: bool,

        /// Real-money mode (not available)
        #[arg(long)]
        live: bool,

        /// Poll interval in seconds (overrides live.poll_interval_secs)
        #[arg(long)]
        interval: Option<u64>,

        /// Symbol to trade (overrides live.symbol)
        #[arg(long)]
        symbol: Option<String>,

        /// Run startup and a single poll cycle, then exit
        #[arg(long)]
        once: bool,
    },

    /// Print persisted live state as JSON
    Status {
        /// Path to configuration file
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        config: String,

        /// Symbol to show (overrides live.symbol)
        #[arg(long)]
        symbol: Option<String>,

        /// Number of recent events to include
        #[arg(long, default_value = "10")]
        events: usize,
    },

    /// Download hourly history from CryptoCompare
    Download {
        /// Assets to download (comma-separated). E.g. "BTC,ETH"
        #[arg(short, long, default_value = "BTC")]
        symbols: String,

        /// Hours of history to fetch
        #[arg(long, default_value = "8760")]
        hours: usize,

        /// Output directory
        #[arg(short, long, default_value = "data")]
        output: String,
    },
}

fn setup_logging(verbose: bool, command_name: &str, file_only: bool) -> Result<()> {
    std::fs::create_dir_all("logs")?;

    // {command}_{date}.log
    let log_filename = format!(
        "{}_{}.log",
        command_name,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = PathBuf::from("logs").join(&log_filename);

    // Filter out noisy external crates
    let level = if verbose { "debug" } else { "info" };
    let filter_str = format!(
        "{},hyper=warn,hyper_util=warn,reqwest=warn,rustls=warn,h2=warn",
        level
    );
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let file_appender = tracing_appender::rolling::never("logs", &log_filename);
    fn make_file_layer<S>(
        file_appender: tracing_appender::rolling::RollingFileAppender,
    ) -> impl tracing_subscriber::Layer<S>
    where
        S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    {
        tracing_subscriber::fmt::layer()
            .with_writer(file_appender)
            .with_target(true)
            .with_line_number(true)
            .with_file(true)
            .with_ansi(false)
    }

    if file_only {
        // Sweep: keep the console clean for the progress bar
        tracing_subscriber::registry()
            .with(env_filter)
            .with(make_file_layer(file_appender))
            .init();
    } else {
        let console_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_line_number(true)
            .with_file(true)
            .with_ansi(true);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(make_file_layer(file_appender))
            .init();

        info!("Logging initialized");
        info!("Log file: {}", log_path.display());
    }

    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let (command_name, file_only) = match &cli.command {
        Commands::Backtest { .. } => ("backtest", false),
        Commands::Sweep { .. } => ("sweep", true),
        Commands::Live { .. } => ("live", false),
        Commands::Status { .. } => ("status", false),
        Commands::Download { .. } => ("download", false),
    };

    setup_logging(cli.verbose, command_name, file_only)?;

    match cli.command {
        Commands::Backtest {
            config,
            data,
            strategy,
            symbol,
            capital,
            start,
            end,
            trades_out,
        } => commands::backtest::run(commands::backtest::BacktestArgs {
            config_path: config,
            data,
            strategy,
            symbol,
            capital,
            start,
            end,
            trades_out,
        }),

        Commands::Sweep {
            config,
            data,
            grid,
            sort_by,
            top,
            min_trades,
            output,
        } => commands::sweep::run(config, data, grid, sort_by, top, min_trades, output),

        Commands::Live {
            config,
            paper,
            live,
            interval,
            symbol,
            once,
        } => commands::live::run(config, paper, live, interval, symbol, once),

        Commands::Status {
            config,
            symbol,
            events,
        } => commands::status::run(config, symbol, events),

        Commands::Download {
            symbols,
            hours,
            output,
        } => commands::download::run(symbols, hours, output),
    }
}
