//! Support/Resistance Bounce Trading Engine
//!
//! Hourly-bar trading engine with two signal variants (S/R bounce and
//! Donchian breakout) sharing one indicator pipeline and one position
//! lifecycle. The same bar-by-bar runner drives deterministic backtests,
//! parameter sweeps, and a polling shadow trader with persisted recovery.

pub mod backtest;
pub mod config;
pub mod data;
pub mod exchange;
pub mod indicators;
pub mod live;
pub mod optimizer;
pub mod position;
pub mod risk;
pub mod runner;
pub mod state_manager;
pub mod stats;
pub mod strategies;
pub mod types;

pub use config::{Config, StrategyConfig, StrategyKind};
pub use strategies::SignalGenerator;
pub use types::*;
