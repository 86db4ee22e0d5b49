//! # Error Types
//!
//! Domain-specific error types for gemstock-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  gemstock-core errors (this file)                                      │
//! │  ├── CoreError        - Malformed documents, schema mismatches         │
//! │  └── ValidationError  - Input validation failures                      │
//! │                                                                         │
//! │  gemstock-db errors (separate crate)                                   │
//! │  └── DbError          - SQLite / quota failures                        │
//! │                                                                         │
//! │  gemstock-sync errors                                                  │
//! │  └── SyncError        - What the page layer sees                       │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → SyncError → page alert (if any)   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Data-integrity anomalies (negative stock, unknown movement kinds) are NOT
//! errors. They are reported through [`crate::replay::ReplayAnomaly`].

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Core domain errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A store document could not be read as the expected shape.
    ///
    /// ## When This Occurs
    /// - Ledger document missing `itemCode` or `quantity`
    /// - Aggregate document whose top level is not an object
    #[error("Invalid document {id}: {reason}")]
    InvalidDocument { id: String, reason: String },

    /// A persisted payload was written by a different schema version.
    #[error("Schema version mismatch: expected {expected}, found {found}")]
    SchemaMismatch { expected: u32, found: u32 },

    /// A cache key does not name anything the engine knows how to rebuild.
    #[error("Unrecognized cache key: {0}")]
    UnknownCacheKey(String),

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl CoreError {
    /// Creates an InvalidDocument error.
    pub fn invalid_document(id: impl Into<String>, reason: impl Into<String>) -> Self {
        CoreError::InvalidDocument {
            id: id.into(),
            reason: reason.into(),
        }
    }
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Value must not be negative.
    #[error("{field} must not be negative")]
    MustBeNonNegative { field: String },

    /// Numeric value is out of range.
    #[error("{field} must be between {min} and {max}")]
    OutOfRange { field: String, min: i64, max: i64 },

    /// Invalid format (e.g., invalid date token).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = CoreError::invalid_document("abc", "missing itemCode");
        assert_eq!(err.to_string(), "Invalid document abc: missing itemCode");

        let err = CoreError::SchemaMismatch {
            expected: 2,
            found: 1,
        };
        assert_eq!(
            err.to_string(),
            "Schema version mismatch: expected 2, found 1"
        );
    }

    #[test]
    fn test_validation_converts_to_core_error() {
        let validation_err = ValidationError::Required {
            field: "itemCode".to_string(),
        };
        let core_err: CoreError = validation_err.into();
        assert!(matches!(core_err, CoreError::Validation(_)));
        assert_eq!(core_err.to_string(), "Validation error: itemCode is required");
    }
}
