//! Data loading and market data
//!
//! CSV history for backtests, and the `MarketData` seam the live trader
//! polls. `CryptoCompareClient` implements it over CryptoCompare's public
//! hourly endpoint and also downloads long histories for backtesting.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration as StdDuration;
use tracing::{debug, info, warn};

use crate::{Bar, Symbol};

// =============================================================================
// Constants
// =============================================================================

const CRYPTOCOMPARE_BASE_URL: &str = "https://min-api.cryptocompare.com/data";
const QUOTE_CURRENCY: &str = "USD";
/// Largest page the histohour endpoint serves
pub const MAX_BARS_PER_REQUEST: usize = 2000;
const REQUEST_DELAY_MS: u64 = 200;

// =============================================================================
// CSV Data Loading
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct CsvRow {
    #[serde(alias = "datetime", alias = "time")]
    timestamp: String,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

/// Parse a bar timestamp: RFC3339, `YYYY-MM-DD HH:MM:SS` with an optional
/// `+00:00` offset, or unix seconds
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%:z") {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(ndt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Ok(Utc.from_utc_datetime(&ndt));
    }
    if let Ok(secs) = s.parse::<i64>() {
        return DateTime::from_timestamp(secs, 0)
            .with_context(|| format!("Timestamp out of range: {}", s));
    }
    bail!("Unrecognised timestamp: {}", s)
}

/// Parse a `YYYY-MM-DD` date (midnight UTC) or a full timestamp
pub fn parse_date(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(date) = NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d") {
        if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
            return Ok(Utc.from_utc_datetime(&midnight));
        }
    }
    parse_timestamp(s).with_context(|| format!("Invalid date: {}", s))
}

/// Load OHLCV bars from a CSV file with a header row.
///
/// Rows that fail validation are skipped with a warning. The result is
/// sorted by time with duplicate timestamps removed.
pub fn load_csv(path: impl AsRef<Path>) -> Result<Vec<Bar>> {
    let path = path.as_ref();
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open CSV file {}", path.display()))?;

    let mut bars = Vec::new();
    let mut skipped = 0usize;

    for (row_idx, result) in reader.deserialize::<CsvRow>().enumerate() {
        let row = result.with_context(|| format!("Failed to read row {}", row_idx + 1))?;
        let timestamp = parse_timestamp(&row.timestamp)
            .with_context(|| format!("Row {}: bad timestamp", row_idx + 1))?;

        match Bar::new(timestamp, row.open, row.high, row.low, row.close, row.volume) {
            Ok(bar) => bars.push(bar),
            Err(e) => {
                skipped += 1;
                warn!(row = row_idx + 1, error = %e, "Skipping invalid bar");
            }
        }
    }

    bars.sort_by_key(|b| b.timestamp);
    bars.dedup_by_key(|b| b.timestamp);

    debug!(
        path = %path.display(),
        bars = bars.len(),
        skipped,
        "Loaded CSV"
    );
    Ok(bars)
}

/// Write bars as `timestamp,open,high,low,close,volume`
pub fn save_csv(bars: &[Bar], path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create output file {}", path.display()))?;
    for bar in bars {
        writer.serialize(CsvRow {
            timestamp: bar.timestamp.format("%Y-%m-%d %H:%M:%S+00:00").to_string(),
            open: bar.open,
            high: bar.high,
            low: bar.low,
            close: bar.close,
            volume: bar.volume,
        })?;
    }
    writer.flush()?;

    info!("Saved {} rows to {}", bars.len(), path.display());
    Ok(())
}

/// Bars with `start <= timestamp < end`; open bounds are unbounded
pub fn filter_by_date(
    bars: &[Bar],
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) -> Vec<Bar> {
    bars.iter()
        .filter(|b| start.map_or(true, |s| b.timestamp >= s))
        .filter(|b| end.map_or(true, |e| b.timestamp < e))
        .cloned()
        .collect()
}

// =============================================================================
// Market Data Trait
// =============================================================================

/// Polled source of recent bars and prices
#[async_trait]
pub trait MarketData: Send + Sync {
    /// The `limit` most recent hourly bars, oldest first
    async fn recent_bars(&self, symbol: &Symbol, limit: usize) -> Result<Vec<Bar>>;

    /// Latest traded price
    async fn latest_price(&self, symbol: &Symbol) -> Result<f64>;
}

// =============================================================================
// CryptoCompare Client
// =============================================================================

#[derive(Debug, Deserialize)]
struct HistoResponse {
    #[serde(rename = "Response", default)]
    response: String,
    #[serde(rename = "Message", default)]
    message: String,
    #[serde(rename = "Data", default)]
    data: HistoData,
}

#[derive(Debug, Default, Deserialize)]
struct HistoData {
    #[serde(rename = "Data", default)]
    data: Vec<HistoBar>,
}

#[derive(Debug, Deserialize)]
struct HistoBar {
    time: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volumefrom: f64,
}

/// Decode a histohour body into validated bars
fn parse_histo_response(body: HistoResponse) -> Result<Vec<Bar>> {
    if body.response == "Error" {
        bail!("CryptoCompare error: {}", body.message);
    }

    let bars = body
        .data
        .data
        .into_iter()
        .filter_map(|c| {
            let timestamp = DateTime::from_timestamp(c.time, 0)?;
            match Bar::new(timestamp, c.open, c.high, c.low, c.close, c.volumefrom) {
                Ok(bar) => Some(bar),
                Err(e) => {
                    debug!(time = c.time, error = %e, "Dropping invalid bar");
                    None
                }
            }
        })
        .collect();
    Ok(bars)
}

/// CryptoCompare public REST client (no key required for hourly data)
pub struct CryptoCompareClient {
    client: reqwest::Client,
    base_url: String,
    request_delay: StdDuration,
}

impl CryptoCompareClient {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(StdDuration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: CRYPTOCOMPARE_BASE_URL.to_string(),
            request_delay: StdDuration::from_millis(REQUEST_DELAY_MS),
        })
    }

    /// One page of hourly bars ending at `to_ts` (unix seconds), oldest first
    pub async fn fetch_hourly(
        &self,
        symbol: &Symbol,
        limit: usize,
        to_ts: Option<i64>,
    ) -> Result<Vec<Bar>> {
        let url = format!("{}/v2/histohour", self.base_url);
        let mut params = vec![
            ("fsym", symbol.base_asset().to_string()),
            ("tsym", QUOTE_CURRENCY.to_string()),
            ("limit", limit.clamp(1, MAX_BARS_PER_REQUEST).to_string()),
        ];
        if let Some(ts) = to_ts {
            params.push(("toTs", ts.to_string()));
        }

        let response = self
            .client
            .get(&url)
            .query(&params)
            .send()
            .await
            .context("Failed to send histohour request")?;

        if !response.status().is_success() {
            bail!("API returned status: {}", response.status());
        }

        let body: HistoResponse = response
            .json()
            .await
            .context("Failed to parse histohour response")?;
        parse_histo_response(body)
    }

    /// Walk back page by page until `hours` bars are collected or the
    /// history runs out. Zero-volume bars are dropped.
    pub async fn download_history(&self, symbol: &Symbol, hours: usize) -> Result<Vec<Bar>> {
        info!("Fetching {} hourly bars of {} from CryptoCompare", hours, symbol);

        let mut all_bars: Vec<Bar> = Vec::with_capacity(hours);
        let mut to_ts: Option<i64> = None;

        while all_bars.len() < hours {
            let page = self
                .fetch_hourly(symbol, MAX_BARS_PER_REQUEST, to_ts)
                .await?;
            let Some(oldest) = page.first().map(|b| b.timestamp.timestamp()) else {
                warn!("No more data available before {:?}", to_ts);
                break;
            };
            if to_ts.is_some_and(|ts| oldest > ts) {
                break;
            }

            all_bars.extend(page);
            to_ts = Some(oldest - 1);
            info!("  Fetched {} bars...", all_bars.len());

            tokio::time::sleep(self.request_delay).await;
        }

        all_bars.retain(|b| b.volume > 0.0);
        all_bars.sort_by_key(|b| b.timestamp);
        all_bars.dedup_by_key(|b| b.timestamp);
        if all_bars.len() > hours {
            all_bars.drain(..all_bars.len() - hours);
        }

        info!("Total bars fetched: {}", all_bars.len());
        Ok(all_bars)
    }
}

#[async_trait]
impl MarketData for CryptoCompareClient {
    async fn recent_bars(&self, symbol: &Symbol, limit: usize) -> Result<Vec<Bar>> {
        let mut bars = self.fetch_hourly(symbol, limit, None).await?;
        // the endpoint returns limit + 1 bars
        if bars.len() > limit {
            bars.drain(..bars.len() - limit);
        }
        Ok(bars)
    }

    async fn latest_price(&self, symbol: &Symbol) -> Result<f64> {
        let url = format!("{}/price", self.base_url);
        let prices: HashMap<String, f64> = self
            .client
            .get(&url)
            .query(&[("fsym", symbol.base_asset()), ("tsyms", QUOTE_CURRENCY)])
            .send()
            .await
            .context("Failed to send price request")?
            .json()
            .await
            .context("Failed to parse price response")?;

        prices
            .get(QUOTE_CURRENCY)
            .copied()
            .filter(|p| *p > 0.0)
            .with_context(|| format!("No {} price for {}", QUOTE_CURRENCY, symbol))
    }
}
