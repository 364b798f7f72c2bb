// State Manager for Live Trading
// SQLite-based persistence with JSON backup
//
// One row of recovery state per instrument (open position + same-day
// counters), an append-only trade audit trail, and an event log of entries,
// exits and failed executions.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

use crate::{Direction, ExitReason, Position, TradeRecord};

// =============================================================================
// Data Models
// =============================================================================

/// Persisted recovery state for one instrument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentState {
    pub symbol: String,
    pub position: Option<Position>,
    pub current_atr: f64,
    pub trades_today: u32,
    pub daily_pnl: f64,
    /// UTC date the daily counters belong to
    pub trading_day: Option<NaiveDate>,
    pub last_update: Option<DateTime<Utc>>,
    /// Open time of the newest bar already acted on
    pub last_bar_time: Option<DateTime<Utc>>,
}

impl InstrumentState {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            position: None,
            current_atr: 0.0,
            trades_today: 0,
            daily_pnl: 0.0,
            trading_day: None,
            last_update: None,
            last_bar_time: None,
        }
    }

    /// Reset the daily counters when `today` differs from the stored day.
    /// Returns true if a reset happened.
    pub fn roll_day(&mut self, today: NaiveDate) -> bool {
        if self.trading_day == Some(today) {
            return false;
        }
        let rolled = self.trading_day.is_some();
        self.trading_day = Some(today);
        self.trades_today = 0;
        self.daily_pnl = 0.0;
        rolled
    }
}

/// Audit events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeEvent {
    Entry,
    Exit,
    EntryFailed,
    ExitFailed,
}

impl TradeEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            TradeEvent::Entry => "ENTRY",
            TradeEvent::Exit => "EXIT",
            TradeEvent::EntryFailed => "ENTRY_FAILED",
            TradeEvent::ExitFailed => "EXIT_FAILED",
        }
    }
}

impl std::fmt::Display for TradeEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub timestamp: String,
    pub symbol: String,
    pub event: String,
    pub payload: serde_json::Value,
}

// =============================================================================
// State Manager Implementation
// =============================================================================

pub struct SqliteStateManager {
    conn: Arc<Mutex<Connection>>,
    backup_dir: Option<PathBuf>,
}

impl SqliteStateManager {
    /// Open (or create) the database. With `backup_dir`, every state save
    /// also writes `{SYMBOL}_state.json` there.
    pub fn new(db_path: impl AsRef<Path>, backup_dir: Option<PathBuf>) -> Result<Self> {
        let db_path = db_path.as_ref();

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if let Some(dir) = &backup_dir {
            std::fs::create_dir_all(dir)?;
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database: {}", db_path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;

        let manager = Self {
            conn: Arc::new(Mutex::new(conn)),
            backup_dir,
        };
        manager.create_tables()?;
        info!("SQLite state manager initialized at {}", db_path.display());

        Ok(manager)
    }

    /// Throwaway database with no JSON backup
    pub fn in_memory() -> Result<Self> {
        let manager = Self {
            conn: Arc::new(Mutex::new(Connection::open_in_memory()?)),
            backup_dir: None,
        };
        manager.create_tables()?;
        Ok(manager)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("State database lock poisoned"))
    }

    fn create_tables(&self) -> Result<()> {
        let conn = self.conn()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS instrument_state (
                symbol TEXT PRIMARY KEY,
                position TEXT,
                current_atr REAL NOT NULL DEFAULT 0,
                trades_today INTEGER NOT NULL DEFAULT 0,
                daily_pnl REAL NOT NULL DEFAULT 0,
                trading_day TEXT,
                last_update TEXT,
                last_bar_time TEXT,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                direction TEXT NOT NULL,
                entry_time TEXT NOT NULL,
                exit_time TEXT NOT NULL,
                entry_price REAL NOT NULL,
                exit_price REAL NOT NULL,
                size REAL NOT NULL,
                pnl_pct REAL NOT NULL,
                pnl_usd REAL NOT NULL,
                exit_reason TEXT NOT NULL,
                atr_at_entry REAL NOT NULL,
                created_at TEXT DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                symbol TEXT NOT NULL,
                event TEXT NOT NULL,
                payload TEXT NOT NULL DEFAULT '{}'
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_trades_symbol ON trades(symbol)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_events_symbol ON events(symbol)",
            [],
        )?;

        debug!("Database schema created/verified");
        Ok(())
    }

    // =========================================================================
    // Instrument state
    // =========================================================================

    pub fn save_state(&self, state: &InstrumentState) -> Result<()> {
        let conn = self.conn()?;
        let position_json = state
            .position
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        conn.execute(
            "INSERT OR REPLACE INTO instrument_state
             (symbol, position, current_atr, trades_today, daily_pnl,
              trading_day, last_update, last_bar_time, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, CURRENT_TIMESTAMP)",
            params![
                state.symbol,
                position_json,
                state.current_atr,
                state.trades_today,
                state.daily_pnl,
                state.trading_day.map(|d| d.format("%Y-%m-%d").to_string()),
                state.last_update.map(|t| t.to_rfc3339()),
                state.last_bar_time.map(|t| t.to_rfc3339()),
            ],
        )?;

        debug!(
            symbol = %state.symbol,
            open = state.position.is_some(),
            trades_today = state.trades_today,
            "State saved"
        );

        drop(conn);
        if self.backup_dir.is_some() {
            self.export_json(&state.symbol)?;
        }
        Ok(())
    }

    pub fn load_state(&self, symbol: &str) -> Result<Option<InstrumentState>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT symbol, position, current_atr, trades_today, daily_pnl,
                        trading_day, last_update, last_bar_time
                 FROM instrument_state WHERE symbol = ?1",
                params![symbol],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, f64>(2)?,
                        row.get::<_, u32>(3)?,
                        row.get::<_, f64>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, Option<String>>(6)?,
                        row.get::<_, Option<String>>(7)?,
                    ))
                },
            )
            .optional()?;

        let Some((symbol, position, current_atr, trades_today, daily_pnl, day, last_update, last_bar)) =
            row
        else {
            debug!(symbol, "No saved state");
            return Ok(None);
        };

        let position = position
            .map(|json| serde_json::from_str::<Position>(&json))
            .transpose()
            .context("Corrupt persisted position")?;
        let trading_day = day
            .map(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d"))
            .transpose()
            .context("Corrupt trading day")?;
        let last_update = parse_optional_time(last_update).context("Corrupt last_update")?;
        let last_bar_time = parse_optional_time(last_bar).context("Corrupt last_bar_time")?;

        Ok(Some(InstrumentState {
            symbol,
            position,
            current_atr,
            trades_today,
            daily_pnl,
            trading_day,
            last_update,
            last_bar_time,
        }))
    }

    // =========================================================================
    // Trades and events
    // =========================================================================

    pub fn record_trade(&self, symbol: &str, trade: &TradeRecord) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO trades
             (symbol, direction, entry_time, exit_time, entry_price, exit_price,
              size, pnl_pct, pnl_usd, exit_reason, atr_at_entry)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                symbol,
                trade.direction.as_str(),
                trade.entry_time.to_rfc3339(),
                trade.exit_time.to_rfc3339(),
                trade.entry_price,
                trade.exit_price,
                trade.size,
                trade.pnl_pct,
                trade.pnl_usd,
                trade.exit_reason.as_str(),
                trade.atr_at_entry,
            ],
        )?;

        let result = if trade.is_win() { "WIN" } else { "LOSS" };
        info!(
            "Trade recorded: {} {} {:.4} @ ${:.2} -> ${:.2} | {:+.2}% (${:+.2}) | {} | {}",
            trade.direction.as_str().to_uppercase(),
            symbol,
            trade.size,
            trade.entry_price,
            trade.exit_price,
            trade.pnl_pct,
            trade.pnl_usd,
            trade.exit_reason,
            result
        );
        Ok(())
    }

    /// Trade audit trail, oldest first
    pub fn load_trades(&self, symbol: &str) -> Result<Vec<TradeRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT direction, entry_time, exit_time, entry_price, exit_price,
                    size, pnl_pct, pnl_usd, exit_reason, atr_at_entry
             FROM trades WHERE symbol = ?1 ORDER BY id",
        )?;

        let rows = stmt
            .query_map(params![symbol], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, f64>(4)?,
                    row.get::<_, f64>(5)?,
                    row.get::<_, f64>(6)?,
                    row.get::<_, f64>(7)?,
                    row.get::<_, String>(8)?,
                    row.get::<_, f64>(9)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(
                |(direction, entry, exit, entry_price, exit_price, size, pnl_pct, pnl_usd, reason, atr)|
                 -> Result<TradeRecord> {
                    Ok(TradeRecord {
                        entry_time: parse_time(&entry)?,
                        exit_time: parse_time(&exit)?,
                        direction: parse_enum::<Direction>(&direction)?,
                        entry_price,
                        exit_price,
                        pnl_pct,
                        pnl_usd,
                        exit_reason: parse_enum::<ExitReason>(&reason)?,
                        atr_at_entry: atr,
                        size,
                    })
                },
            )
            .collect()
    }

    pub fn log_event(&self, symbol: &str, event: TradeEvent, payload: &serde_json::Value) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO events (timestamp, symbol, event, payload) VALUES (?1, ?2, ?3, ?4)",
            params![
                Utc::now().to_rfc3339(),
                symbol,
                event.as_str(),
                serde_json::to_string(payload)?,
            ],
        )?;
        debug!(symbol, %event, "Event logged");
        Ok(())
    }

    /// Most recent events first
    pub fn recent_events(&self, symbol: &str, limit: usize) -> Result<Vec<EventRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT timestamp, symbol, event, payload FROM events
             WHERE symbol = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let events = stmt
            .query_map(params![symbol, limit as i64], |row| {
                Ok(EventRecord {
                    timestamp: row.get(0)?,
                    symbol: row.get(1)?,
                    event: row.get(2)?,
                    payload: serde_json::from_str(&row.get::<_, String>(3)?)
                        .unwrap_or(serde_json::Value::Null),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    // =========================================================================
    // JSON backup
    // =========================================================================

    /// State, trades and recent events as one JSON document
    pub fn snapshot_json(&self, symbol: &str) -> Result<serde_json::Value> {
        let state = self.load_state(symbol)?;
        let trades = self.load_trades(symbol)?;
        let events = self.recent_events(symbol, 20)?;

        Ok(serde_json::json!({
            "exported_at": Utc::now().to_rfc3339(),
            "symbol": symbol,
            "state": state,
            "trades": trades,
            "recent_events": events,
        }))
    }

    /// Write `{SYMBOL}_state.json` into the backup directory
    pub fn export_json(&self, symbol: &str) -> Result<Option<PathBuf>> {
        let Some(dir) = &self.backup_dir else {
            return Ok(None);
        };
        let path = dir.join(format!("{}_state.json", symbol));
        let doc = self.snapshot_json(symbol)?;
        std::fs::write(&path, serde_json::to_string_pretty(&doc)?)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        debug!("State exported to: {}", path.display());
        Ok(Some(path))
    }
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("Bad timestamp: {}", s))?
        .with_timezone(&Utc))
}

fn parse_optional_time(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value.as_deref().map(parse_time).transpose()
}

/// Decode a snake_case enum stored as text
fn parse_enum<T: serde::de::DeserializeOwned>(s: &str) -> Result<T> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .with_context(|| format!("Unknown value in trades table: {}", s))
}

// =============================================================================
// Factory Function
// =============================================================================

/// `state_dir/trading_state.db` with JSON backups next to it
pub fn create_state_manager(state_dir: impl AsRef<Path>) -> Result<SqliteStateManager> {
    let state_dir = state_dir.as_ref();
    std::fs::create_dir_all(state_dir)
        .with_context(|| format!("Failed to create state dir {}", state_dir.display()))?;

    SqliteStateManager::new(
        state_dir.join("trading_state.db"),
        Some(state_dir.to_path_buf()),
    )
}
