//! Order execution
//!
//! `OrderExecutor` is the seam between the live trader and a venue. Only the
//! shadow (paper) executor ships with the crate: it fills at the reference
//! price it is handed, tracks a paper balance, and appends every fill to a
//! JSONL log.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{Direction, Symbol};

/// Executed order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub symbol: String,
    /// Long = buy, Short = sell
    pub side: Direction,
    pub size: f64,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait OrderExecutor: Send + Sync {
    fn name(&self) -> &str;

    /// True when fills are simulated
    fn is_paper(&self) -> bool;

    /// Account equity used for sizing
    async fn equity(&self) -> Result<f64>;

    /// Open exposure in `side`. `reference_price` is the price the decision
    /// was made at.
    async fn market_order(
        &self,
        symbol: &Symbol,
        side: Direction,
        size: f64,
        reference_price: f64,
    ) -> Result<Fill>;

    /// Flatten a position previously opened in `direction`
    async fn close_position(
        &self,
        symbol: &Symbol,
        direction: Direction,
        size: f64,
        reference_price: f64,
    ) -> Result<Fill>;
}

// =============================================================================
// Paper Executor
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct PaperPosition {
    direction: Direction,
    size: f64,
    entry_price: f64,
}

#[derive(Debug)]
struct PaperBook {
    balance: f64,
    positions: HashMap<String, PaperPosition>,
}

#[derive(Serialize)]
struct ShadowLogEntry<'a> {
    timestamp: DateTime<Utc>,
    action: &'a str,
    symbol: &'a str,
    size: f64,
    price: f64,
    paper_balance: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    realized_pnl: Option<f64>,
}

/// Shadow-mode executor
pub struct PaperExecutor {
    book: Mutex<PaperBook>,
    log_path: PathBuf,
}

impl PaperExecutor {
    pub fn new(balance: f64, log_path: impl AsRef<Path>) -> Self {
        Self {
            book: Mutex::new(PaperBook {
                balance,
                positions: HashMap::new(),
            }),
            log_path: log_path.as_ref().to_path_buf(),
        }
    }

    pub async fn balance(&self) -> f64 {
        self.book.lock().await.balance
    }

    async fn append_log(&self, entry: &ShadowLogEntry<'_>) -> Result<()> {
        if let Some(parent) = self.log_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await
            .with_context(|| format!("Failed to open {}", self.log_path.display()))?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Log a fill. Called after the book lock is released.
    async fn record(
        &self,
        action: &str,
        symbol: &Symbol,
        size: f64,
        price: f64,
        balance: f64,
        realized_pnl: Option<f64>,
    ) -> DateTime<Utc> {
        let timestamp = Utc::now();
        let entry = ShadowLogEntry {
            timestamp,
            action,
            symbol: symbol.as_str(),
            size,
            price,
            paper_balance: balance,
            realized_pnl,
        };
        if let Err(e) = self.append_log(&entry).await {
            warn!(error = %e, "Failed to write shadow trade log");
        }
        info!("[SHADOW] {} {} {} @ ${:.2}", action, size, symbol, price);
        timestamp
    }
}

fn action(side: Direction) -> &'static str {
    match side {
        Direction::Long => "BUY",
        Direction::Short => "SELL",
    }
}

#[async_trait]
impl OrderExecutor for PaperExecutor {
    fn name(&self) -> &str {
        "paper"
    }

    fn is_paper(&self) -> bool {
        true
    }

    async fn equity(&self) -> Result<f64> {
        Ok(self.book.lock().await.balance)
    }

    async fn market_order(
        &self,
        symbol: &Symbol,
        side: Direction,
        size: f64,
        reference_price: f64,
    ) -> Result<Fill> {
        if !(size > 0.0 && reference_price > 0.0) {
            bail!("Invalid paper order: size={} price={}", size, reference_price);
        }

        let mut book = self.book.lock().await;
        if book.positions.contains_key(symbol.as_str()) {
            bail!("Paper position already open for {}", symbol);
        }
        book.positions.insert(
            symbol.as_str().to_string(),
            PaperPosition {
                direction: side,
                size,
                entry_price: reference_price,
            },
        );

        let balance = book.balance;
        drop(book);

        let timestamp = self
            .record(action(side), symbol, size, reference_price, balance, None)
            .await;
        Ok(Fill {
            symbol: symbol.as_str().to_string(),
            side,
            size,
            price: reference_price,
            timestamp,
        })
    }

    async fn close_position(
        &self,
        symbol: &Symbol,
        direction: Direction,
        size: f64,
        reference_price: f64,
    ) -> Result<Fill> {
        if !(reference_price > 0.0) {
            bail!("Invalid close price {}", reference_price);
        }

        let mut book = self.book.lock().await;
        // a position restored after a restart is unknown to a fresh paper book
        let (size, realized) = match book.positions.remove(symbol.as_str()) {
            Some(pos) => {
                let pnl = (reference_price - pos.entry_price) * pos.direction.sign() * pos.size;
                (pos.size, Some(pnl))
            }
            None => {
                warn!(%symbol, "No paper position on record, closing requested size");
                (size, None)
            }
        };
        if let Some(pnl) = realized {
            book.balance += pnl;
        }

        let side = match direction {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
        };
        let balance = book.balance;
        drop(book);

        let timestamp = self
            .record(action(side), symbol, size, reference_price, balance, realized)
            .await;
        Ok(Fill {
            symbol: symbol.as_str().to_string(),
            side,
            size,
            price: reference_price,
            timestamp,
        })
    }
}
