//! Engine-level scenarios run against both store backends.

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use gemstock_core::key::CacheTarget;
use gemstock_core::{ItemSelection, ManualClock, MovementKind, NewLedgerEntry};
use gemstock_db::{Database, DbConfig};
use gemstock_sync::{
    AggregateTarget, CacheManager, CacheOptions, ChannelRender, DocumentStore, EngineOptions,
    LedgerStore, LocalBus, MemoryStore, MemoryTier, NoOpRender, PersistentTier, RenderEvent,
    SqliteStore, SqliteTier, StockEngine, SyncError,
};
use serde_json::json;

/// 10:00 local (UTC+7) on 2026-10-16, plus `minutes`.
fn at(minutes: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 16, 3, 0, 0).unwrap() + Duration::minutes(minutes)
}

fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 10, 16).unwrap()
}

fn cache_over<P: PersistentTier>(tier: P, clock: &ManualClock) -> CacheManager<P> {
    CacheManager::new(tier, CacheOptions::default(), Arc::new(clock.clone()))
}

async fn x70_scenario<S, P>(engine: &StockEngine<S, P>)
where
    S: LedgerStore + DocumentStore + Clone,
    P: PersistentTier,
{
    for (kind, quantity, minutes) in [
        (MovementKind::InitialStock, 5, -180),
        (MovementKind::StockAddition, 2, -120),
        (MovementKind::Sale, 1, -60),
    ] {
        engine
            .record_movement(NewLedgerEntry::new("X70", kind, quantity).at(at(minutes)), None)
            .await
            .unwrap();
    }
    assert_eq!(engine.compute_quantity("X70", today()).await.unwrap(), 6);

    // The day before the opening stock.
    let yesterday = today().pred_opt().unwrap();
    assert_eq!(engine.compute_quantity("X70", yesterday).await.unwrap(), 0);

    // A stock count resets the running total.
    engine
        .record_movement(
            NewLedgerEntry::new("X70", MovementKind::Adjustment, 0).at(at(-30)),
            None,
        )
        .await
        .unwrap();
    assert_eq!(engine.compute_quantity("X70", today()).await.unwrap(), 0);

    let batch = engine
        .compute_quantities(&ItemSelection::codes(["X70", "Y10"]), today())
        .await
        .unwrap();
    assert_eq!(batch.get("X70"), Some(&0));
    assert_eq!(batch.get("Y10"), Some(&0));
}

#[tokio::test]
async fn test_x70_replay_memory_backend() {
    let clock = ManualClock::new(at(0));
    let store = MemoryStore::new(Arc::new(clock.clone()));
    let (render, _events) = ChannelRender::new();
    let engine = StockEngine::new(
        store,
        cache_over(MemoryTier::new(), &clock),
        EngineOptions::default(),
        Arc::new(render),
    );

    x70_scenario(&engine).await;

    let report = engine.cache().flush_dirty().await;
    assert!(report.written.contains(&"stock:X70:2026-10-16".to_string()));
    assert!(report.failed.is_empty());
}

#[tokio::test]
async fn test_x70_replay_sqlite_backend() {
    let db = Database::new(DbConfig::in_memory()).await.unwrap();
    let clock = ManualClock::new(at(0));
    let (render, _events) = ChannelRender::new();
    let engine = StockEngine::new(
        SqliteStore::new(db.clone()),
        cache_over(SqliteTier::new(db.cache_entries()), &clock),
        EngineOptions::default(),
        Arc::new(render),
    );

    x70_scenario(&engine).await;
    engine.dispose().await;

    let keys = SqliteTier::new(db.cache_entries()).keys().await.unwrap();
    assert!(keys.contains(&"gemstock.cache.stock:X70:2026-10-16".to_string()));
}

#[tokio::test]
async fn test_persisted_entries_serve_a_new_session_while_offline() {
    let clock = ManualClock::new(at(0));
    let store = MemoryStore::new(Arc::new(clock.clone()));
    let tier = MemoryTier::new();
    store
        .append(NewLedgerEntry::new("X70", MovementKind::InitialStock, 5).at(at(-60)))
        .await
        .unwrap();

    let first = StockEngine::new(
        store.clone(),
        cache_over(tier.clone(), &clock),
        EngineOptions::default(),
        Arc::new(NoOpRender),
    );
    assert_eq!(first.compute_quantity("X70", today()).await.unwrap(), 5);
    first.dispose().await;

    store.set_offline(true);
    let (render, mut events) = ChannelRender::new();
    let second = StockEngine::new(
        store.clone(),
        cache_over(tier.clone(), &clock),
        EngineOptions::default(),
        Arc::new(render),
    );

    // Still within the TTL: promoted from the persistent tier.
    assert_eq!(second.compute_quantity("X70", today()).await.unwrap(), 5);
    assert_eq!(second.cache().stats().promotions, 1);
    assert!(events.try_recv().is_err());

    // Expired and the store is away: stale but available.
    clock.advance(Duration::minutes(10));
    assert_eq!(second.compute_quantity("X70", today()).await.unwrap(), 5);
    assert_eq!(events.try_recv().unwrap(), RenderEvent::Stale(true));

    // Never cached: hard failure.
    let err = second.compute_quantity("Z99", today()).await.unwrap_err();
    assert!(matches!(err, SyncError::Unavailable { ref key, .. } if key == "stock:Z99:2026-10-16"));
}

#[tokio::test]
async fn test_live_feed_and_local_writes_meet_in_the_categories_entry() {
    let clock = ManualClock::new(at(0));
    let store = MemoryStore::new(Arc::new(clock.clone()));
    let (render, mut events) = ChannelRender::new();
    let engine = StockEngine::new(
        store.clone(),
        cache_over(MemoryTier::new(), &clock),
        EngineOptions::default(),
        Arc::new(render),
    );
    engine.init();

    let key = CacheTarget::Categories { date: today() }.key().into_string();
    store.push_remote_change(
        "stockCategories",
        "silver",
        json!({
            "bracelet": {
                "quantity": 3,
                "lastUpdated": "2026-10-16T02:00:00Z",
                "history": [],
                "details": {"M": 3}
            }
        }),
    );
    assert_eq!(events.recv().await, Some(RenderEvent::Render(key.clone())));

    engine
        .record_movement(
            NewLedgerEntry::new("CC001", MovementKind::StockAddition, 2),
            Some(AggregateTarget::new("gold", "ring").subtype("17")),
        )
        .await
        .unwrap();

    let entry = engine.get_cached(&key).await.unwrap();
    let categories = entry.payload.as_categories().unwrap();
    assert_eq!(categories["silver"]["bracelet"].quantity, 3);
    assert_eq!(categories["gold"]["ring"].quantity, 2);
    assert_eq!(categories["gold"]["ring"].details["17"], 2);

    // A forced refresh rebuilds the same view from the store.
    let rebuilt = engine.refresh(&key, true).await.unwrap();
    assert_eq!(rebuilt.payload, entry.payload);

    engine.dispose().await;
    assert_eq!(store.subscriber_count(), 0);
}

#[tokio::test]
async fn test_sale_in_one_tab_reaches_the_sibling() {
    let clock = ManualClock::new(at(0));
    let store = MemoryStore::new(Arc::new(clock.clone()));
    let tier = MemoryTier::new();
    let bus = LocalBus::default();
    store
        .append(NewLedgerEntry::new("X70", MovementKind::InitialStock, 5).at(at(-60)))
        .await
        .unwrap();

    let tab_a = StockEngine::new(
        store.clone(),
        cache_over(tier.clone(), &clock),
        EngineOptions::default(),
        Arc::new(NoOpRender),
    )
    .with_pubsub(Arc::new(bus.endpoint()));
    let (render, mut events) = ChannelRender::new();
    let tab_b = StockEngine::new(
        store.clone(),
        cache_over(tier.clone(), &clock),
        EngineOptions::default(),
        Arc::new(render),
    )
    .with_pubsub(Arc::new(bus.endpoint()));
    tab_b.init();

    assert_eq!(tab_a.compute_quantity("X70", today()).await.unwrap(), 5);
    assert_eq!(tab_b.compute_quantity("X70", today()).await.unwrap(), 5);

    tab_a
        .record_movement(NewLedgerEntry::new("X70", MovementKind::Sale, 1), None)
        .await
        .unwrap();

    let key = CacheTarget::Stock {
        item_code: "X70".to_string(),
        date: today(),
    }
    .key()
    .into_string();
    assert_eq!(events.recv().await, Some(RenderEvent::Render(key.clone())));
    assert!(tab_b.get_cached(&key).await.is_none());
    assert_eq!(tab_b.compute_quantity("X70", today()).await.unwrap(), 4);

    tab_b.dispose().await;
    tab_a.dispose().await;
}
