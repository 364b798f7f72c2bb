//! Status command: persisted live state as JSON

use anyhow::Result;
use serde_json::json;
use sr_bounce::state_manager::create_state_manager;
use sr_bounce::Config;
use tracing::info;

pub fn run(config_path: String, symbol: Option<String>, events: usize) -> Result<()> {
    let mut config = Config::from_file(&config_path)?;
    if let Some(symbol) = symbol {
        config.live.symbol = symbol;
    }

    let symbol = config.live.symbol.to_uppercase();
    info!("Reading state for {} from {}", symbol, config.live.state_dir);

    let sm = create_state_manager(&config.live.state_dir)?;
    let mut doc = sm.snapshot_json(&symbol)?;
    if let Some(obj) = doc.as_object_mut() {
        obj.insert("recent_events".to_string(), json!(sm.recent_events(&symbol, events)?));
    }

    println!("{}", serde_json::to_string_pretty(&doc)?);
    Ok(())
}
