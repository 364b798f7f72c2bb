//! Live polling trader
//!
//! Startup restores the persisted position and daily counters, then rebuilds
//! the rolling window from fetched history (never from persisted bars).
//! Each poll either processes newly closed bars in order or, between bars, checks
//! the open position against the latest price. Fetch and execution errors
//! skip the cycle and leave engine state untouched.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::data::MarketData;
use crate::exchange::OrderExecutor;
use crate::position::{ExitDecision, PnlModel};
use crate::risk::PositionSizer;
use crate::runner::Runner;
use crate::state_manager::{InstrumentState, SqliteStateManager, TradeEvent};
use crate::{Bar, Direction, Position, Symbol, TradeRecord, Trend};

/// Bars requested on each poll
const POLL_BARS: usize = 2;

/// Result of one poll cycle
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Data unavailable; nothing changed
    Skipped,
    /// Newest bar was already acted on before a restart
    Resumed,
    NewBar {
        exit: Option<TradeRecord>,
        entry: Option<Position>,
    },
    PriceCheck {
        price: f64,
        exit: Option<TradeRecord>,
    },
}

/// Snapshot for the `status` view
#[derive(Debug, Clone, Serialize)]
pub struct TraderStatus {
    pub symbol: String,
    pub strategy: String,
    pub price: Option<f64>,
    pub atr: f64,
    pub rsi: f64,
    pub support: Option<f64>,
    pub resistance: Option<f64>,
    pub trend: Trend,
    pub bars: usize,
    pub position: Option<Position>,
    pub unrealized_pnl_pct: Option<f64>,
    pub trades_today: u32,
    pub daily_pnl: f64,
    pub paper: bool,
}

pub struct LiveTrader {
    symbol: Symbol,
    history_bars: usize,
    stop_atr_mult: f64,
    runner: Runner,
    sizer: PositionSizer,
    market: Arc<dyn MarketData>,
    executor: Arc<dyn OrderExecutor>,
    state_manager: SqliteStateManager,
    state: InstrumentState,
}

impl LiveTrader {
    pub fn new(
        config: &Config,
        symbol: Symbol,
        market: Arc<dyn MarketData>,
        executor: Arc<dyn OrderExecutor>,
        state_manager: SqliteStateManager,
    ) -> Result<Self> {
        let runner = Runner::new(&config.strategy, &symbol, PnlModel::PositionSize)?;
        Ok(Self {
            history_bars: config.live.history_bars.max(config.strategy.history_capacity()),
            stop_atr_mult: config.strategy.stop_atr_mult,
            sizer: PositionSizer::from_config(&config.strategy, &config.risk),
            state: InstrumentState::new(symbol.as_str()),
            symbol,
            runner,
            market,
            executor,
            state_manager,
        })
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    pub fn position(&self) -> Option<&Position> {
        self.runner.position()
    }

    pub fn state(&self) -> &InstrumentState {
        &self.state
    }

    pub fn state_manager(&self) -> &SqliteStateManager {
        &self.state_manager
    }

    // =========================================================================
    // Startup
    // =========================================================================

    /// Restore persisted state and rebuild indicators from history
    pub async fn start(&mut self) -> Result<CycleOutcome> {
        self.start_at(Utc::now()).await
    }

    pub async fn start_at(&mut self, now: DateTime<Utc>) -> Result<CycleOutcome> {
        if let Some(saved) = self.state_manager.load_state(self.symbol.as_str())? {
            if let Some(position) = saved.position.clone() {
                info!(
                    symbol = %self.symbol,
                    direction = %position.direction,
                    entry = position.entry_price,
                    stop = position.stop_price,
                    "Restored open position"
                );
                self.runner.restore(position)?;
            }
            self.state = saved;
        }

        let mut bars = self
            .market
            .recent_bars(&self.symbol, self.history_bars)
            .await?;
        let Some(last) = bars.pop() else {
            bail!("No history available for {}", self.symbol);
        };

        for bar in bars {
            self.runner.warm_up(bar);
        }

        if self.is_handled(&last) {
            self.runner.warm_up(last);
            info!(
                symbol = %self.symbol,
                strategy = self.runner.strategy_name(),
                bars = self.runner.bars_seen(),
                "Indicators warmed up, resuming"
            );
            return Ok(CycleOutcome::Resumed);
        }

        info!(
            symbol = %self.symbol,
            strategy = self.runner.strategy_name(),
            bars = self.runner.bars_seen() + 1,
            "Indicators warmed up"
        );
        Ok(self.on_new_bar(last, now).await)
    }

    // =========================================================================
    // Polling
    // =========================================================================

    pub async fn poll(&mut self) -> CycleOutcome {
        self.poll_at(Utc::now()).await
    }

    /// One poll cycle. Never fails: errors are logged and the cycle skipped.
    pub async fn poll_at(&mut self, now: DateTime<Utc>) -> CycleOutcome {
        let bars = match self.market.recent_bars(&self.symbol, POLL_BARS).await {
            Ok(bars) => bars,
            Err(e) => {
                warn!(symbol = %self.symbol, error = %e, "Bar fetch failed, skipping cycle");
                return CycleOutcome::Skipped;
            }
        };
        if bars.is_empty() {
            warn!(symbol = %self.symbol, "No bars returned, skipping cycle");
            return CycleOutcome::Skipped;
        }

        let bars = match self.catch_up_limit(&bars) {
            Some(limit) => {
                debug!(symbol = %self.symbol, limit, "Fetching missed bars");
                match self.market.recent_bars(&self.symbol, limit).await {
                    Ok(bars) => bars,
                    Err(e) => {
                        warn!(symbol = %self.symbol, error = %e, "Catch-up fetch failed, skipping cycle");
                        return CycleOutcome::Skipped;
                    }
                }
            }
            None => bars,
        };

        let pending = self.pending_bars(bars);
        if !pending.is_empty() {
            return self.on_new_bars(pending, now).await;
        }

        let price = match self.market.latest_price(&self.symbol).await {
            Ok(price) => price,
            Err(e) => {
                warn!(symbol = %self.symbol, error = %e, "Price fetch failed, skipping cycle");
                return CycleOutcome::Skipped;
            }
        };
        self.on_price(price, now).await
    }

    /// Bars to refetch when every polled bar is new and the gap since the
    /// last handled bar may be wider than the poll
    fn catch_up_limit(&self, bars: &[Bar]) -> Option<usize> {
        let handled = self.state.last_bar_time?;
        let latest = bars.last()?;
        if bars.len() < POLL_BARS || bars.iter().any(|b| self.is_handled(b)) {
            return None;
        }
        let missed = (latest.timestamp - handled).num_hours().max(0) as usize;
        let limit = missed.min(self.history_bars);
        (limit > bars.len()).then_some(limit)
    }

    /// Bars not yet acted on, oldest first
    fn pending_bars(&self, bars: Vec<Bar>) -> Vec<Bar> {
        let mut pending: Vec<Bar> = bars.into_iter().filter(|b| !self.is_handled(b)).collect();
        pending.sort_by_key(|b| b.timestamp);
        pending.dedup_by_key(|b| b.timestamp);
        pending
    }

    /// Process bars in order; the outcome keeps the latest exit and entry
    async fn on_new_bars(&mut self, bars: Vec<Bar>, now: DateTime<Utc>) -> CycleOutcome {
        if bars.len() > 1 {
            info!(symbol = %self.symbol, count = bars.len(), "Catching up on missed bars");
        }
        let (mut last_exit, mut last_entry) = (None, None);
        for bar in bars {
            if let CycleOutcome::NewBar { exit, entry } = self.on_new_bar(bar, now).await {
                last_exit = exit.or(last_exit);
                last_entry = entry.or(last_entry);
            }
        }
        CycleOutcome::NewBar {
            exit: last_exit,
            entry: last_entry,
        }
    }

    async fn on_new_bar(&mut self, bar: Bar, now: DateTime<Utc>) -> CycleOutcome {
        self.roll_day(now);
        let (time, close) = (bar.timestamp, bar.close);
        self.state.last_bar_time = Some(time);

        let snapshot = self.runner.ingest(bar);
        self.state.current_atr = snapshot.atr;
        debug!(
            symbol = %self.symbol,
            close,
            atr = snapshot.atr,
            rsi = snapshot.rsi,
            trend = ?snapshot.trend,
            "New bar"
        );

        let mut exit = None;
        if let Some(decision) = self.runner.check_exit() {
            exit = self.execute_exit(decision, time).await;
        }

        let mut entry = None;
        if let Some(direction) = self.runner.entry_signal() {
            entry = self.execute_entry(direction, close, time).await;
        }

        self.persist(now);
        CycleOutcome::NewBar { exit, entry }
    }

    async fn on_price(&mut self, price: f64, now: DateTime<Utc>) -> CycleOutcome {
        self.roll_day(now);

        let mut exit = None;
        if let Some(decision) = self.runner.check_price(price) {
            exit = self.execute_exit(decision, now).await;
            self.persist(now);
        }
        CycleOutcome::PriceCheck { price, exit }
    }

    // =========================================================================
    // Execution
    // =========================================================================

    async fn execute_entry(
        &mut self,
        direction: Direction,
        price: f64,
        time: DateTime<Utc>,
    ) -> Option<Position> {
        let equity = match self.executor.equity().await {
            Ok(equity) => equity,
            Err(e) => {
                self.entry_failed(direction, price, &format!("Equity unavailable: {}", e));
                return None;
            }
        };

        let stop_distance = self.stop_atr_mult * self.runner.snapshot().atr;
        let size = self.sizer.size(equity, price, stop_distance);
        if size <= 0.0 {
            self.entry_failed(direction, price, "Size too small");
            return None;
        }

        let fill = match self
            .executor
            .market_order(&self.symbol, direction, size, price)
            .await
        {
            Ok(fill) => fill,
            Err(e) => {
                self.entry_failed(direction, price, &e.to_string());
                return None;
            }
        };

        let position = match self.runner.open(direction, fill.price, time, fill.size) {
            Ok(position) => position.clone(),
            Err(e) => {
                error!(symbol = %self.symbol, error = %e, "Filled entry rejected by lifecycle");
                self.entry_failed(direction, fill.price, &e.to_string());
                return None;
            }
        };

        self.state.trades_today += 1;
        info!(
            symbol = %self.symbol,
            direction = %position.direction,
            entry = position.entry_price,
            size = position.size,
            stop = position.stop_price,
            target = position.target_price,
            "Position opened"
        );
        self.log_event(
            TradeEvent::Entry,
            json!({
                "direction": position.direction,
                "price": position.entry_price,
                "size": position.size,
                "stop": position.stop_price,
                "target": position.target_price,
                "atr": position.atr_at_entry,
            }),
        );
        Some(position)
    }

    async fn execute_exit(
        &mut self,
        decision: ExitDecision,
        time: DateTime<Utc>,
    ) -> Option<TradeRecord> {
        let (direction, size) = {
            let position = self.runner.position()?;
            (position.direction, position.size)
        };

        let fill = match self
            .executor
            .close_position(&self.symbol, direction, size, decision.price)
            .await
        {
            Ok(fill) => fill,
            Err(e) => {
                warn!(
                    symbol = %self.symbol,
                    reason = %decision.reason,
                    error = %e,
                    "Exit failed, position stays open"
                );
                self.log_event(
                    TradeEvent::ExitFailed,
                    json!({ "reason": decision.reason, "price": decision.price, "error": e.to_string() }),
                );
                return None;
            }
        };

        let filled = ExitDecision {
            price: fill.price,
            reason: decision.reason,
        };
        let trade = self.runner.commit_exit(filled, time)?;
        self.state.daily_pnl += trade.pnl_usd;

        info!(
            symbol = %self.symbol,
            reason = %trade.exit_reason,
            exit = trade.exit_price,
            pnl_pct = trade.pnl_pct,
            pnl_usd = trade.pnl_usd,
            "Trade closed"
        );
        if let Err(e) = self.state_manager.record_trade(self.symbol.as_str(), &trade) {
            error!(error = %e, "Failed to record trade");
        }
        self.log_event(TradeEvent::Exit, json!(trade));
        Some(trade)
    }

    fn entry_failed(&self, direction: Direction, price: f64, reason: &str) {
        warn!(symbol = %self.symbol, %direction, price, reason, "Entry failed");
        self.log_event(
            TradeEvent::EntryFailed,
            json!({ "direction": direction, "price": price, "error": reason }),
        );
    }

    // =========================================================================
    // Bookkeeping
    // =========================================================================

    fn is_handled(&self, bar: &Bar) -> bool {
        self.state
            .last_bar_time
            .is_some_and(|t| bar.timestamp <= t)
    }

    fn roll_day(&mut self, now: DateTime<Utc>) {
        if self.state.roll_day(now.date_naive()) {
            info!(symbol = %self.symbol, day = %now.date_naive(), "Daily counters reset");
        }
    }

    fn persist(&mut self, now: DateTime<Utc>) {
        self.state.position = self.runner.position().cloned();
        self.state.last_update = Some(now);
        if let Err(e) = self.state_manager.save_state(&self.state) {
            error!(symbol = %self.symbol, error = %e, "Failed to persist state");
        }
    }

    fn log_event(&self, event: TradeEvent, payload: serde_json::Value) {
        if let Err(e) = self
            .state_manager
            .log_event(self.symbol.as_str(), event, &payload)
        {
            error!(%event, error = %e, "Failed to log event");
        }
    }

    pub fn status(&self) -> TraderStatus {
        let snapshot = self.runner.snapshot();
        let price = self.runner.last_bar().map(|b| b.close);
        let position = self.runner.position().cloned();
        let unrealized_pnl_pct = match (&position, price) {
            (Some(pos), Some(p)) => Some(pos.pnl_pct(p)),
            _ => None,
        };

        TraderStatus {
            symbol: self.symbol.to_string(),
            strategy: self.runner.strategy_name().to_string(),
            price,
            atr: snapshot.atr,
            rsi: snapshot.rsi,
            support: snapshot.support,
            resistance: snapshot.resistance,
            trend: snapshot.trend,
            bars: self.runner.window().len(),
            position,
            unrealized_pnl_pct,
            trades_today: self.state.trades_today,
            daily_pnl: self.state.daily_pnl,
            paper: self.executor.is_paper(),
        }
    }
}
