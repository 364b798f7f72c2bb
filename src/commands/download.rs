//! Download command: hourly history from CryptoCompare to CSV

use anyhow::{Context, Result};
use sr_bounce::data::{save_csv, CryptoCompareClient};
use sr_bounce::Symbol;
use std::path::PathBuf;
use tracing::{error, info};

pub fn run(symbols: String, hours: usize, output: String) -> Result<()> {
    info!("Starting data download from CryptoCompare");
    dotenv::dotenv().ok();

    let rt = tokio::runtime::Runtime::new().context("Failed to build tokio runtime")?;
    let client = CryptoCompareClient::new()?;

    let symbols: Vec<Symbol> = symbols
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(Symbol::new)
        .collect();

    println!("\n{}", "=".repeat(60));
    println!("DOWNLOADING HOURLY DATA FROM CRYPTOCOMPARE");
    println!("{}", "=".repeat(60));
    println!("  Symbols: {:?}", symbols.iter().map(Symbol::as_str).collect::<Vec<_>>());
    println!("  Hours:   {}", hours);
    println!("  Output:  {}", output);
    println!("{}\n", "=".repeat(60));

    let mut success_count = 0;
    for symbol in &symbols {
        let path = PathBuf::from(&output).join(format!("{}USD_1h.csv", symbol.base_asset()));
        print!("  Downloading {}... ", symbol);

        let result = rt
            .block_on(client.download_history(symbol, hours))
            .and_then(|bars| save_csv(&bars, &path).map(|()| bars.len()));
        match result {
            Ok(count) => {
                println!("✓ {} bars -> {}", count, path.display());
                success_count += 1;
            }
            Err(e) => {
                println!("✗ Error: {}", e);
                error!(%symbol, error = %e, "Download failed");
            }
        }
    }

    println!("\n{}", "=".repeat(60));
    println!("Downloaded {}/{} symbols", success_count, symbols.len());
    println!("{}", "=".repeat(60));
    Ok(())
}
