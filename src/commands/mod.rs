//! Subcommand implementations

pub mod backtest;
pub mod download;
pub mod live;
pub mod status;
pub mod sweep;
