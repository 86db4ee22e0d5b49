//! # Document Repository
//!
//! JSON documents keyed by `(collection, id)`. The aggregate category
//! documents live here, one document per category with one top-level field
//! per item type.
//!
//! `merge_update` merges top-level fields inside a transaction, so writing
//! one item type never clobbers its siblings.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::SqlitePool;
use tracing::debug;

use super::from_millis;
use crate::error::{DbError, DbResult};

#[derive(Debug, sqlx::FromRow)]
struct DocumentRow {
    id: String,
    data: String,
    updated_at: i64,
}

/// A stored document.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub id: String,
    pub data: Value,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<DocumentRow> for StoredDocument {
    type Error = DbError;

    fn try_from(row: DocumentRow) -> DbResult<Self> {
        Ok(StoredDocument {
            data: serde_json::from_str(&row.data)?,
            updated_at: from_millis(row.updated_at)?,
            id: row.id,
        })
    }
}

/// Repository for JSON documents.
#[derive(Debug, Clone)]
pub struct DocumentRepository {
    pool: SqlitePool,
}

impl DocumentRepository {
    pub fn new(pool: SqlitePool) -> Self {
        DocumentRepository { pool }
    }

    pub async fn get(&self, collection: &str, id: &str) -> DbResult<Option<StoredDocument>> {
        let row: Option<DocumentRow> = sqlx::query_as(
            "SELECT id, data, updated_at FROM documents WHERE collection = ?1 AND id = ?2",
        )
        .bind(collection)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(StoredDocument::try_from).transpose()
    }

    /// All documents of a collection, ordered by id.
    pub async fn list(&self, collection: &str) -> DbResult<Vec<StoredDocument>> {
        let rows: Vec<DocumentRow> = sqlx::query_as(
            "SELECT id, data, updated_at FROM documents WHERE collection = ?1 ORDER BY id",
        )
        .bind(collection)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(StoredDocument::try_from).collect()
    }

    /// Merges the top-level fields of `patch` into the document, creating it
    /// if missing. Returns the merged document.
    pub async fn merge_update(
        &self,
        collection: &str,
        id: &str,
        patch: &Value,
    ) -> DbResult<StoredDocument> {
        let patch = patch.as_object().ok_or_else(|| {
            DbError::Serialization(format!("patch for {}/{} is not an object", collection, id))
        })?;

        let mut tx = self.pool.begin().await?;

        let existing: Option<String> =
            sqlx::query_scalar("SELECT data FROM documents WHERE collection = ?1 AND id = ?2")
                .bind(collection)
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;

        let mut merged = match existing {
            Some(raw) => match serde_json::from_str::<Value>(&raw)? {
                Value::Object(fields) => fields,
                _ => Map::new(),
            },
            None => Map::new(),
        };
        for (field, value) in patch {
            merged.insert(field.clone(), value.clone());
        }

        let data = Value::Object(merged);
        let now = Utc::now();
        upsert(&mut *tx, collection, id, &data, now).await?;
        tx.commit().await?;

        debug!(
            collection = %collection,
            id = %id,
            fields = patch.len(),
            "Merged document"
        );

        Ok(StoredDocument {
            id: id.to_string(),
            data,
            updated_at: now,
        })
    }

    /// Replaces the whole document.
    pub async fn replace(&self, collection: &str, id: &str, data: &Value) -> DbResult<StoredDocument> {
        let now = Utc::now();
        upsert(&self.pool, collection, id, data, now).await?;
        Ok(StoredDocument {
            id: id.to_string(),
            data: data.clone(),
            updated_at: now,
        })
    }

    /// Deletes a document. Returns whether it existed.
    pub async fn delete(&self, collection: &str, id: &str) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM documents WHERE collection = ?1 AND id = ?2")
            .bind(collection)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

async fn upsert<'e, E>(
    executor: E,
    collection: &str,
    id: &str,
    data: &Value,
    now: DateTime<Utc>,
) -> DbResult<()>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO documents (collection, id, data, updated_at)
        VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT (collection, id) DO UPDATE SET
            data = excluded.data,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(collection)
    .bind(id)
    .bind(serde_json::to_string(data)?)
    .bind(now.timestamp_millis())
    .execute(executor)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DbConfig};
    use serde_json::json;

    async fn repo() -> DocumentRepository {
        Database::new(DbConfig::in_memory()).await.unwrap().documents()
    }

    #[tokio::test]
    async fn test_merge_update_keeps_sibling_fields() {
        let repo = repo().await;
        repo.merge_update("stockCategories", "gold", &json!({"ring": {"quantity": 1}}))
            .await
            .unwrap();
        let merged = repo
            .merge_update("stockCategories", "gold", &json!({"chain": {"quantity": 4}}))
            .await
            .unwrap();

        assert_eq!(merged.data["ring"]["quantity"], 1);
        assert_eq!(merged.data["chain"]["quantity"], 4);

        let stored = repo.get("stockCategories", "gold").await.unwrap().unwrap();
        assert_eq!(stored.data, merged.data);
    }

    #[tokio::test]
    async fn test_merge_update_rejects_non_object_patch() {
        let repo = repo().await;
        let err = repo
            .merge_update("stockCategories", "gold", &json!([1]))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Serialization(_)));
    }

    #[tokio::test]
    async fn test_list_replace_delete() {
        let repo = repo().await;
        repo.replace("c", "b", &json!({"x": 1})).await.unwrap();
        repo.replace("c", "a", &json!({"x": 2})).await.unwrap();
        repo.replace("other", "z", &json!({})).await.unwrap();

        let ids: Vec<_> = repo
            .list("c")
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);

        assert!(repo.delete("c", "a").await.unwrap());
        assert!(!repo.delete("c", "a").await.unwrap());
        assert!(repo.get("c", "a").await.unwrap().is_none());
    }
}
