//! Live command: polling shadow trader
//!
//! Startup recovers persisted state and rebuilds indicators, then one poll
//! cycle runs per interval tick until Ctrl+C. Cycle errors never end the loop.

use anyhow::{bail, Context, Result};
use sr_bounce::data::CryptoCompareClient;
use sr_bounce::exchange::PaperExecutor;
use sr_bounce::live::{CycleOutcome, LiveTrader};
use sr_bounce::state_manager::create_state_manager;
use sr_bounce::{Config, Symbol};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

pub fn run(
    config_path: String,
    _paper: bool,
    live: bool,
    interval_override: Option<u64>,
    symbol_override: Option<String>,
    once: bool,
) -> Result<()> {
    if live {
        bail!("Real-money mode is not available: no exchange executor is bundled. Run without --live for shadow mode");
    }

    dotenv::dotenv().ok();

    let mut config = Config::from_file(&config_path)?;
    info!("Loaded configuration from: {}", config_path);
    if let Some(secs) = interval_override {
        config.live.poll_interval_secs = secs;
    }
    if let Some(symbol) = symbol_override {
        config.live.symbol = symbol;
    }
    config.validate()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(run_async(config, once))
}

async fn run_async(config: Config, once: bool) -> Result<()> {
    let symbol = Symbol::new(config.live.symbol.clone());
    let state_dir = Path::new(&config.live.state_dir);

    info!("{}", "=".repeat(60));
    info!("SHADOW TRADING - {}", symbol);
    info!("{}", "=".repeat(60));
    info!("Strategy:       {}", config.strategy.strategy);
    info!("Poll interval:  {}s", config.live.poll_interval_secs);
    info!("Paper balance:  ${:.2}", config.live.paper_balance);
    info!("State dir:      {}", state_dir.display());
    info!("{}", "=".repeat(60));

    let state_manager = create_state_manager(state_dir)?;
    let market = Arc::new(CryptoCompareClient::new()?);
    let executor = Arc::new(PaperExecutor::new(
        config.live.paper_balance,
        state_dir.join("shadow_trades.jsonl"),
    ));

    let mut trader = LiveTrader::new(&config, symbol, market, executor, state_manager)?;
    let outcome = trader
        .start()
        .await
        .context("Startup failed while rebuilding indicators")?;
    log_outcome(&outcome);
    log_status(&trader);

    if once {
        let outcome = trader.poll().await;
        log_outcome(&outcome);
        log_status(&trader);
        return Ok(());
    }

    let mut ticker = interval(Duration::from_secs(config.live.poll_interval_secs));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick fires immediately and startup already covered it
    ticker.tick().await;

    info!("Starting polling loop...");
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let outcome = trader.poll().await;
                log_outcome(&outcome);
            }
            result = tokio::signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("Received Ctrl+C, shutting down"),
                    Err(e) => error!("Error waiting for shutdown signal: {}", e),
                }
                break;
            }
        }
    }

    log_status(&trader);
    if let Some(path) = trader.state_manager().export_json(trader.symbol().as_str())? {
        info!("Final state exported to {}", path.display());
    }
    info!("Shadow trading session ended.");
    Ok(())
}

fn log_outcome(outcome: &CycleOutcome) {
    match outcome {
        CycleOutcome::Skipped => info!("Cycle skipped"),
        CycleOutcome::Resumed => info!("Resumed; newest bar already handled"),
        CycleOutcome::NewBar { exit, entry } => {
            if let Some(trade) = exit {
                info!(
                    "EXIT {} {} @ {:.2} ({:+.2}%)",
                    trade.direction, trade.exit_reason, trade.exit_price, trade.pnl_pct
                );
            }
            if let Some(pos) = entry {
                info!(
                    "ENTRY {} @ {:.2} size {} stop {:.2} target {:.2}",
                    pos.direction, pos.entry_price, pos.size, pos.stop_price, pos.target_price
                );
            }
        }
        CycleOutcome::PriceCheck { price, exit } => match exit {
            Some(trade) => info!(
                "EXIT {} {} @ {:.2} ({:+.2}%)",
                trade.direction, trade.exit_reason, trade.exit_price, trade.pnl_pct
            ),
            None => tracing::debug!("Price check at {:.2}", price),
        },
    }
}

fn log_status(trader: &LiveTrader) {
    let status = trader.status();
    info!(
        symbol = %status.symbol,
        price = ?status.price,
        atr = status.atr,
        rsi = status.rsi,
        bars = status.bars,
        trades_today = status.trades_today,
        daily_pnl = status.daily_pnl,
        "Status"
    );
    if let Some(pos) = &status.position {
        info!(
            "Open {} @ {:.2}, stop {:.2}, unrealized {:+.2}%",
            pos.direction,
            pos.entry_price,
            pos.stop_price,
            status.unrealized_pnl_pct.unwrap_or(0.0)
        );
    }
}
