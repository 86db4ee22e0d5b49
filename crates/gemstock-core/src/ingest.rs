//! # Ingestion Adapter
//!
//! Raw documents arrive from two collections that look alike but are not:
//! ledger movements and per-category aggregate documents. This adapter
//! normalizes both into [`SourceRecord`] at the boundary, so nothing
//! downstream has to guess the shape from which fields are present.

use serde_json::Value;

use crate::error::{CoreError, CoreResult};
use crate::types::{CategoryDocument, ItemTypeNode, LedgerEntry, Provenance};

/// A store document tagged with its provenance.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceRecord {
    LedgerDerived(LedgerEntry),
    AggregateDerived {
        category: String,
        document: CategoryDocument,
    },
}

impl SourceRecord {
    /// Parses the raw JSON of document `doc_id` as the given provenance.
    ///
    /// Ledger documents must deserialize as a whole. Aggregate documents
    /// must be objects; top-level fields that are not item-type nodes
    /// (timestamps, labels) are skipped.
    pub fn from_document(provenance: Provenance, doc_id: &str, data: &Value) -> CoreResult<Self> {
        match provenance {
            Provenance::LedgerDerived => {
                let mut entry: LedgerEntry = serde_json::from_value(data.clone())
                    .map_err(|e| CoreError::invalid_document(doc_id, e.to_string()))?;
                if entry.id.is_empty() {
                    entry.id = doc_id.to_string();
                }
                Ok(SourceRecord::LedgerDerived(entry))
            }
            Provenance::AggregateDerived => Ok(SourceRecord::AggregateDerived {
                category: doc_id.to_string(),
                document: category_document(doc_id, data)?,
            }),
        }
    }

    pub fn provenance(&self) -> Provenance {
        match self {
            SourceRecord::LedgerDerived(_) => Provenance::LedgerDerived,
            SourceRecord::AggregateDerived { .. } => Provenance::AggregateDerived,
        }
    }
}

/// Reads the item-type nodes out of an aggregate document.
pub fn category_document(doc_id: &str, data: &Value) -> CoreResult<CategoryDocument> {
    let fields = data
        .as_object()
        .ok_or_else(|| CoreError::invalid_document(doc_id, "expected an object"))?;

    Ok(fields
        .iter()
        .filter(|(_, value)| value.is_object())
        .filter_map(|(item_type, value)| {
            serde_json::from_value::<ItemTypeNode>(value.clone())
                .ok()
                .map(|node| (item_type.clone(), node))
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MovementKind;
    use serde_json::json;

    #[test]
    fn test_ledger_document_takes_doc_id() {
        let raw = json!({
            "itemCode": "X70",
            "movementKind": "laku",
            "quantity": 1,
            "occurredAt": "2026-10-16T02:00:00Z"
        });
        let record = SourceRecord::from_document(Provenance::LedgerDerived, "abc", &raw).unwrap();

        match record {
            SourceRecord::LedgerDerived(entry) => {
                assert_eq!(entry.id, "abc");
                assert_eq!(entry.movement_kind, MovementKind::Sale);
            }
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[test]
    fn test_ledger_document_missing_fields_is_invalid() {
        let err = SourceRecord::from_document(Provenance::LedgerDerived, "bad", &json!({"x": 1}))
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidDocument { ref id, .. } if id == "bad"));
    }

    #[test]
    fn test_aggregate_document_skips_non_nodes() {
        let raw = json!({
            "ring": {
                "quantity": 4,
                "lastUpdated": "2026-10-16T02:00:00Z",
                "history": [],
                "details": {"17": 4}
            },
            "updatedAt": "2026-10-16T02:00:00Z",
            "broken": {"quantity": "many"}
        });
        let record =
            SourceRecord::from_document(Provenance::AggregateDerived, "gold", &raw).unwrap();

        assert_eq!(record.provenance(), Provenance::AggregateDerived);
        match record {
            SourceRecord::AggregateDerived { category, document } => {
                assert_eq!(category, "gold");
                assert_eq!(document.len(), 1);
                assert_eq!(document["ring"].details.get("17"), Some(&4));
            }
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[test]
    fn test_aggregate_document_must_be_object() {
        assert!(category_document("gold", &json!([1, 2])).is_err());
    }
}
