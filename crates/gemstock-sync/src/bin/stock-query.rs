//! # Stock Query
//!
//! Prints replayed quantities straight from a local database, going through
//! the same cache and replay path the pages use.
//!
//! ## Usage
//! ```bash
//! # Every item code, as of today
//! cargo run -p gemstock-sync --bin stock-query
//!
//! # Selected codes at the end of a past day
//! cargo run -p gemstock-sync --bin stock-query -- --date 2026-10-01 CC001 KL002
//!
//! # Custom database and config
//! cargo run -p gemstock-sync --bin stock-query -- --db ./gemstock_dev.db --config ./engine.toml
//! ```

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use gemstock_core::{ItemSelection, SystemClock};
use gemstock_db::{Database, DbConfig};
use gemstock_sync::{
    CacheManager, CacheOptions, EngineConfig, EngineOptions, NoOpRender, SqliteStore, SqliteTier,
    StockEngine,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    gemstock_sync::init_tracing();

    let args: Vec<String> = env::args().collect();

    let mut db_path: Option<PathBuf> = None;
    let mut config_path: Option<PathBuf> = None;
    let mut date: Option<NaiveDate> = None;
    let mut codes: Vec<String> = Vec::new();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--db" | "-d" => {
                if i + 1 < args.len() {
                    db_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--date" => {
                if i + 1 < args.len() {
                    date = Some(NaiveDate::parse_from_str(&args[i + 1], "%Y-%m-%d")?);
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!("Gemstock Stock Query");
                println!();
                println!("Usage: stock-query [OPTIONS] [ITEM_CODE...]");
                println!();
                println!("Options:");
                println!("  -d, --db <PATH>       Database file path (default: from config)");
                println!("  -c, --config <PATH>   Engine config file (default: platform config dir)");
                println!("      --date <DATE>     Business date, YYYY-MM-DD (default: today)");
                println!("  -h, --help            Show this help message");
                return Ok(());
            }
            code => codes.push(code.to_string()),
        }
        i += 1;
    }

    let config = EngineConfig::load(config_path)?;
    let db_path = db_path.unwrap_or_else(|| config.database_path());

    let db = Database::new(
        DbConfig::new(db_path.clone()).cache_quota_bytes(config.storage.quota_bytes),
    )
    .await?;

    let cache = CacheManager::new(
        SqliteTier::new(db.cache_entries()),
        CacheOptions::from_config(&config)?,
        Arc::new(SystemClock),
    );
    let engine = StockEngine::new(
        SqliteStore::new(db.clone()),
        cache,
        EngineOptions::from_config(&config)?,
        Arc::new(NoOpRender),
    );

    let date = date.unwrap_or_else(|| engine.today());
    let selection = if codes.is_empty() {
        ItemSelection::All
    } else {
        ItemSelection::Codes(codes)
    };

    let quantities = engine.compute_quantities(&selection, date).await?;

    println!("Stock as of end of {} ({})", date, db_path.display());
    println!("==========================================");
    for (code, quantity) in &quantities {
        let marker = if *quantity < 0 { "  (negative)" } else { "" };
        println!("  {:<12} {:>6}{}", code, quantity, marker);
    }
    println!();
    println!("{} item codes", quantities.len());

    let report = engine.cache().flush_dirty().await;
    if !report.failed.is_empty() {
        eprintln!("warning: {} cache entries were not persisted", report.failed.len());
    }
    db.close().await;

    Ok(())
}
