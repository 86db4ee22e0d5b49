//! # Validation Module
//!
//! Input validation for values that reach the ledger or the cache.
//!
//! ## Validation Layers
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Layer 1: Page forms (TypeScript)   basic empty/length checks           │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: THIS MODULE               item code, quantity, cache key      │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: SQLite                    NOT NULL, CHECK (quantity >= 0)     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use gemstock_core::validation::{validate_item_code, validate_quantity};
//!
//! assert!(validate_item_code("X70").is_ok());
//! assert!(validate_quantity(0).is_ok());
//! assert!(validate_quantity(-1).is_err());
//! ```

use crate::error::ValidationError;
use crate::key::ALL_ITEMS_CODE;
use crate::types::NewLedgerEntry;
use crate::MAX_ITEM_CODE_LEN;

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Longest cache key accepted by the persistent tier.
const MAX_CACHE_KEY_LEN: usize = 200;

/// Validates an item code.
///
/// ## Rules
/// - Must not be empty
/// - At most 50 characters
/// - Letters, digits, hyphens, underscores and dots only
/// - Not `all` in any letter case, which names the all-items cache key
pub fn validate_item_code(code: &str) -> ValidationResult<()> {
    let code = code.trim();

    if code.is_empty() {
        return Err(ValidationError::Required {
            field: "itemCode".to_string(),
        });
    }

    if code.chars().count() > MAX_ITEM_CODE_LEN {
        return Err(ValidationError::TooLong {
            field: "itemCode".to_string(),
            max: MAX_ITEM_CODE_LEN,
        });
    }

    if !code
        .chars()
        .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(ValidationError::InvalidFormat {
            field: "itemCode".to_string(),
            reason: "must contain only letters, numbers, hyphens, underscores and dots"
                .to_string(),
        });
    }

    if code.eq_ignore_ascii_case(ALL_ITEMS_CODE) {
        return Err(ValidationError::InvalidFormat {
            field: "itemCode".to_string(),
            reason: format!("'{}' is reserved", ALL_ITEMS_CODE),
        });
    }

    Ok(())
}

/// Validates a ledger quantity. Zero is allowed (an adjustment to zero).
pub fn validate_quantity(qty: i64) -> ValidationResult<()> {
    if qty < 0 {
        return Err(ValidationError::MustBeNonNegative {
            field: "quantity".to_string(),
        });
    }
    Ok(())
}

/// Validates a cache key before it is written to the persistent tier.
pub fn validate_cache_key(key: &str) -> ValidationResult<()> {
    if key.trim().is_empty() {
        return Err(ValidationError::Required {
            field: "key".to_string(),
        });
    }
    if key.len() > MAX_CACHE_KEY_LEN {
        return Err(ValidationError::TooLong {
            field: "key".to_string(),
            max: MAX_CACHE_KEY_LEN,
        });
    }
    Ok(())
}

/// Validates a movement before it is appended to the ledger.
pub fn validate_new_entry(entry: &NewLedgerEntry) -> ValidationResult<()> {
    validate_item_code(&entry.item_code)?;
    validate_quantity(entry.quantity)?;
    if entry.movement_kind.as_str().trim().is_empty() {
        return Err(ValidationError::Required {
            field: "movementKind".to_string(),
        });
    }
    Ok(())
}
