//! Bar-by-bar orchestration
//!
//! ingest -> exit check (if open) -> gap-gated entry (if flat). The step
//! methods are public so the live trader can put order execution between
//! deciding and committing; `process_bar` chains them for replays.

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::config::StrategyConfig;
use crate::indicators::{IndicatorEngine, IndicatorSnapshot, RollingWindow};
use crate::position::{ExitDecision, LifecycleError, PnlModel, PositionLifecycle};
use crate::strategies::{create_signal_generator, SignalGenerator, SignalStats};
use crate::{Bar, Direction, Position, Symbol, TradeRecord};

/// What happened on one processed bar
#[derive(Debug, Clone, Default)]
pub struct BarOutcome {
    /// False while ATR is not ready; nothing else was evaluated
    pub ready: bool,
    pub exit: Option<TradeRecord>,
    pub entry: Option<Position>,
}

pub struct Runner {
    engine: IndicatorEngine,
    signals: Box<dyn SignalGenerator>,
    lifecycle: PositionLifecycle,
    bars_seen: usize,
    last_exit_bar: Option<usize>,
    min_gap: usize,
}

impl Runner {
    pub fn new(config: &StrategyConfig, symbol: &Symbol, pnl_model: PnlModel) -> Result<Self> {
        Ok(Self {
            engine: IndicatorEngine::new(config, symbol),
            signals: create_signal_generator(config)?,
            lifecycle: PositionLifecycle::new(config, pnl_model),
            bars_seen: 0,
            last_exit_bar: None,
            min_gap: config.min_gap_bars,
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn snapshot(&self) -> &IndicatorSnapshot {
        self.engine.snapshot()
    }

    pub fn window(&self) -> &RollingWindow {
        self.engine.window()
    }

    pub fn last_bar(&self) -> Option<&Bar> {
        self.engine.window().last()
    }

    pub fn position(&self) -> Option<&Position> {
        self.lifecycle.position()
    }

    pub fn is_open(&self) -> bool {
        self.lifecycle.is_open()
    }

    pub fn signal_stats(&self) -> SignalStats {
        self.signals.stats()
    }

    pub fn strategy_name(&self) -> &'static str {
        self.signals.name()
    }

    /// Bars ingested so far, warm-up included
    pub fn bars_seen(&self) -> usize {
        self.bars_seen
    }

    /// Reinstate a persisted position after a restart
    pub fn restore(&mut self, position: Position) -> Result<(), LifecycleError> {
        self.lifecycle.restore(position)
    }

    // =========================================================================
    // Steps
    // =========================================================================

    /// Feed history without evaluating exits or entries
    pub fn warm_up(&mut self, bar: Bar) {
        self.engine.ingest(bar);
        self.bars_seen += 1;
    }

    /// Ingest a new bar. Counts toward the open position's holding time even
    /// when indicators are not ready.
    pub fn ingest(&mut self, bar: Bar) -> IndicatorSnapshot {
        let snapshot = *self.engine.ingest(bar);
        self.bars_seen += 1;
        self.lifecycle.mark_bar();
        snapshot
    }

    /// Exit decision for the newest bar. Nothing is committed.
    pub fn check_exit(&mut self) -> Option<ExitDecision> {
        let snapshot = *self.engine.snapshot();
        if !snapshot.is_ready() {
            return None;
        }
        let direction = self.lifecycle.position()?.direction;
        let window = self.engine.window();
        let bar = window.last()?;
        let channel_exit = self.signals.channel_exit(window, direction);
        self.lifecycle.evaluate_bar(bar, &snapshot, channel_exit)
    }

    /// Exit decision against a between-bar price, using the last snapshot's RSI
    pub fn check_price(&self, price: f64) -> Option<ExitDecision> {
        self.lifecycle.evaluate_price(price, self.engine.snapshot().rsi)
    }

    /// OPEN -> FLAT. Starts the min-gap countdown from the current bar.
    pub fn commit_exit(
        &mut self,
        decision: ExitDecision,
        exit_time: DateTime<Utc>,
    ) -> Option<TradeRecord> {
        let trade = self.lifecycle.close(decision, exit_time)?;
        self.last_exit_bar = Some(self.current_index());
        debug!(
            direction = %trade.direction,
            reason = %trade.exit_reason,
            exit_price = trade.exit_price,
            pnl_pct = trade.pnl_pct,
            "Position closed"
        );
        Some(trade)
    }

    /// True once `min_gap_bars` bars have passed since the last exit
    pub fn gap_satisfied(&self) -> bool {
        match self.last_exit_bar {
            Some(exit_bar) => self.current_index().saturating_sub(exit_bar) >= self.min_gap,
            None => true,
        }
    }

    /// Entry direction for the newest bar, if flat, ready and past the gap
    pub fn entry_signal(&mut self) -> Option<Direction> {
        if self.lifecycle.is_open() || !self.gap_satisfied() {
            return None;
        }
        let snapshot = *self.engine.snapshot();
        if !snapshot.is_ready() {
            return None;
        }
        self.signals.evaluate(self.engine.window(), &snapshot)
    }

    /// FLAT -> OPEN at `price` using the current ATR
    pub fn open(
        &mut self,
        direction: Direction,
        price: f64,
        time: DateTime<Utc>,
        size: f64,
    ) -> Result<&Position, LifecycleError> {
        let atr = self.engine.snapshot().atr;
        let position = self.lifecycle.open(direction, price, time, atr, size)?;
        debug!(
            direction = %position.direction,
            entry = position.entry_price,
            stop = position.stop_price,
            target = position.target_price,
            "Position opened"
        );
        Ok(position)
    }

    /// Full replay step. `size_for` maps the entry price to a position size.
    pub fn process_bar(&mut self, bar: Bar, size_for: impl FnOnce(f64) -> f64) -> BarOutcome {
        let (time, close) = (bar.timestamp, bar.close);
        let snapshot = self.ingest(bar);
        if !snapshot.is_ready() {
            return BarOutcome::default();
        }

        let mut outcome = BarOutcome {
            ready: true,
            ..Default::default()
        };

        if let Some(decision) = self.check_exit() {
            outcome.exit = self.commit_exit(decision, time);
        }

        if let Some(direction) = self.entry_signal() {
            match self.open(direction, close, time, size_for(close)) {
                Ok(position) => outcome.entry = Some(position.clone()),
                Err(e) => debug!(error = %e, "Entry rejected"),
            }
        }
        outcome
    }

    fn current_index(&self) -> usize {
        self.bars_seen.saturating_sub(1)
    }
}
