//! # Ledger Repository
//!
//! Append-only storage for stock movements.
//!
//! ```text
//! append ──► INSERT (id = uuid v4, occurred_at = caller's or server now)
//! list_until(cutoff, codes) ──► SELECT … WHERE occurred_at <= cutoff
//!                                         [AND item_code IN (…)]
//!                               ORDER BY occurred_at, seq
//! delete_older_than(cutoff) ──► the only DELETE the ledger ever sees
//! ```
//!
//! `seq` is the insertion order, so entries sharing a timestamp come back in
//! the order they were recorded.

use chrono::{DateTime, Utc};
use gemstock_core::validation::validate_new_entry;
use gemstock_core::{LedgerEntry, MovementKind, NewLedgerEntry};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::{debug, info};
use uuid::Uuid;

use super::from_millis;
use crate::error::DbResult;

#[derive(Debug, sqlx::FromRow)]
struct LedgerRow {
    id: String,
    item_code: String,
    movement_kind: String,
    quantity: i64,
    occurred_at: i64,
    note: Option<String>,
    actor: Option<String>,
}

impl LedgerRow {
    fn into_entry(self) -> DbResult<LedgerEntry> {
        Ok(LedgerEntry {
            id: self.id,
            item_code: self.item_code,
            movement_kind: MovementKind::parse(&self.movement_kind),
            quantity: self.quantity,
            occurred_at: from_millis(self.occurred_at)?,
            note: self.note,
            actor: self.actor,
        })
    }
}

/// Repository for ledger entries.
#[derive(Debug, Clone)]
pub struct LedgerRepository {
    pool: SqlitePool,
}

impl LedgerRepository {
    pub fn new(pool: SqlitePool) -> Self {
        LedgerRepository { pool }
    }

    /// Validates and appends a movement.
    ///
    /// The id is generated here; `occurred_at` defaults to the current
    /// server time when the caller leaves it unset.
    pub async fn append(&self, entry: NewLedgerEntry) -> DbResult<LedgerEntry> {
        validate_new_entry(&entry)?;

        let entry = entry.into_entry(Uuid::new_v4().to_string(), Utc::now());

        debug!(
            item_code = %entry.item_code,
            kind = %entry.movement_kind,
            quantity = entry.quantity,
            "Appending ledger entry"
        );

        self.insert(&entry).await?;
        Ok(entry)
    }

    /// Inserts a fully-formed entry as-is (seeding and imports).
    pub async fn insert(&self, entry: &LedgerEntry) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO ledger_entries (
                id, item_code, movement_kind, quantity, occurred_at, note, actor
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&entry.id)
        .bind(&entry.item_code)
        .bind(entry.movement_kind.as_str())
        .bind(entry.quantity)
        .bind(entry.occurred_at.timestamp_millis())
        .bind(&entry.note)
        .bind(&entry.actor)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Lists entries with `occurred_at <= cutoff`, oldest first.
    ///
    /// With `item_codes`, only those codes are returned; callers keep the
    /// list within the store's IN-filter limit. An empty list matches
    /// nothing.
    pub async fn list_until(
        &self,
        cutoff: DateTime<Utc>,
        item_codes: Option<&[String]>,
    ) -> DbResult<Vec<LedgerEntry>> {
        if matches!(item_codes, Some(codes) if codes.is_empty()) {
            return Ok(Vec::new());
        }

        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT id, item_code, movement_kind, quantity, occurred_at, note, actor \
             FROM ledger_entries WHERE occurred_at <= ",
        );
        builder.push_bind(cutoff.timestamp_millis());

        if let Some(codes) = item_codes {
            builder.push(" AND item_code IN (");
            let mut separated = builder.separated(", ");
            for code in codes {
                separated.push_bind(code.as_str());
            }
            separated.push_unseparated(")");
        }

        builder.push(" ORDER BY occurred_at ASC, seq ASC");

        let rows: Vec<LedgerRow> = builder.build_query_as().fetch_all(&self.pool).await?;

        debug!(
            cutoff = %cutoff,
            codes = item_codes.map(|c| c.len()),
            rows = rows.len(),
            "Ledger scan"
        );

        rows.into_iter().map(LedgerRow::into_entry).collect()
    }

    /// Retention cleanup: deletes entries strictly older than `cutoff`.
    pub async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> DbResult<u64> {
        let result = sqlx::query("DELETE FROM ledger_entries WHERE occurred_at < ?1")
            .bind(cutoff.timestamp_millis())
            .execute(&self.pool)
            .await?;

        info!(
            cutoff = %cutoff,
            deleted = result.rows_affected(),
            "Ledger retention cleanup"
        );
        Ok(result.rows_affected())
    }

    /// Total number of entries.
    pub async fn count(&self) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ledger_entries")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
