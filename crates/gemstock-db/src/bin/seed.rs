//! # Seed Data Generator
//!
//! Fills a database with demo jewelry stock for development.
//!
//! ## Usage
//! ```bash
//! # Seed 30 days of movements (default)
//! cargo run -p gemstock-db --bin seed
//!
//! # Custom range and path
//! cargo run -p gemstock-db --bin seed -- --days 90 --db ./data/gemstock.db
//! ```
//!
//! ## Generated Data
//! - `ledger_entries`: an `initialStock` per item code, then daily
//!   additions, sales, free gifts and the occasional stock-count adjustment
//! - `documents` (`stockCategories`): one aggregate document per category,
//!   built by applying the same movements to each item-type node

use std::collections::BTreeMap;
use std::env;

use chrono::{Duration, Utc};
use gemstock_core::{CategoryDocument, HistoryItem, ItemTypeNode, LedgerEntry, MovementKind};
use gemstock_db::{Database, DbConfig};
use uuid::Uuid;

const CATEGORY_COLLECTION: &str = "stockCategories";

/// (category, item type, item code prefix, subtypes)
const CATALOGUE: &[(&str, &str, &str, &[&str])] = &[
    ("gold", "ring", "CC", &["15", "16", "17", "18"]),
    ("gold", "chain", "KL", &["40cm", "45cm", "50cm"]),
    ("gold", "bangle", "GL", &["S", "M", "L"]),
    ("gold", "earring", "AT", &["stud", "hoop"]),
    ("silver", "ring", "SCC", &["15", "16", "17"]),
    ("silver", "bracelet", "SGL", &["S", "M"]),
    ("diamond", "pendant", "DL", &["0.1ct", "0.25ct"]),
];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    let mut days: i64 = 30;
    let mut db_path = String::from("./gemstock_dev.db");

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--days" | "-n" => {
                if i + 1 < args.len() {
                    days = args[i + 1].parse().unwrap_or(30);
                    i += 1;
                }
            }
            "--db" | "-d" => {
                if i + 1 < args.len() {
                    db_path = args[i + 1].clone();
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!("Gemstock Seed Data Generator");
                println!();
                println!("Usage: seed [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -n, --days <N>     Days of movements to generate (default: 30)");
                println!("  -d, --db <PATH>    Database file path (default: ./gemstock_dev.db)");
                println!("  -h, --help         Show this help message");
                return Ok(());
            }
            _ => {}
        }
        i += 1;
    }

    println!("Gemstock Seed Data Generator");
    println!("============================");
    println!("Database: {}", db_path);
    println!("Days:     {}", days);
    println!();

    let db = Database::new(DbConfig::new(&db_path)).await?;
    println!("✓ Connected to database");
    println!("✓ Migrations applied");

    let existing = db.ledger().count().await?;
    if existing > 0 {
        println!("⚠ Ledger already has {} entries", existing);
        println!("  Skipping seed to avoid duplicates.");
        return Ok(());
    }

    let start = Utc::now() - Duration::days(days);
    let mut documents: BTreeMap<&str, CategoryDocument> = BTreeMap::new();
    let mut written = 0usize;

    for (idx, (category, item_type, prefix, subtypes)) in CATALOGUE.iter().enumerate() {
        let node = documents
            .entry(*category)
            .or_default()
            .entry(item_type.to_string())
            .or_insert_with(|| ItemTypeNode::new(start));

        for (sub_idx, subtype) in subtypes.iter().enumerate() {
            let code = format!("{}{:02}", prefix, sub_idx + 1);
            let seed = idx * 31 + sub_idx * 7;

            for (kind, quantity, at) in movements(seed, days, start) {
                let entry = LedgerEntry::new(code.clone(), kind.clone(), quantity, at)
                    .with_id(Uuid::new_v4().to_string())
                    .with_actor("seed");
                if let Err(e) = db.ledger().insert(&entry).await {
                    eprintln!("Failed to insert {}: {}", code, e);
                    continue;
                }
                written += 1;

                let mut item = HistoryItem::new(kind, quantity, at);
                item.subtype = Some(subtype.to_string());
                node.record_movement(item);
            }
        }
    }

    for (category, document) in &documents {
        let data = serde_json::to_value(document)?;
        db.documents()
            .replace(CATEGORY_COLLECTION, category, &data)
            .await?;
    }

    println!();
    println!("✓ Wrote {} ledger entries", written);
    println!("✓ Wrote {} category documents", documents.len());
    println!();
    println!("✓ Seed complete!");

    Ok(())
}

/// Deterministic movement pattern for one item code.
fn movements(
    seed: usize,
    days: i64,
    start: chrono::DateTime<Utc>,
) -> Vec<(MovementKind, i64, chrono::DateTime<Utc>)> {
    let mut out = vec![(MovementKind::InitialStock, 5 + (seed % 6) as i64, start)];

    for day in 1..days.max(1) {
        let at = start + Duration::days(day) + Duration::minutes(((seed * 13) % 480) as i64);
        let roll = (seed + day as usize * 17) % 10;
        let movement = match roll {
            0 | 1 => (MovementKind::StockAddition, 2, at),
            2..=5 => (MovementKind::Sale, 1, at),
            6 => (MovementKind::FreeGift, 1, at),
            7 if day % 10 == 0 => (MovementKind::Adjustment, 4 + (seed % 3) as i64, at),
            _ => continue,
        };
        out.push(movement);
    }
    out
}
