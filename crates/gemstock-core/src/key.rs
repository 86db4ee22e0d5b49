//! # Cache Keys
//!
//! Cache keys are human-readable strings that embed the logical date they
//! describe, e.g. `stock:X70:2026-10-16`. The embedded date is what the TTL
//! policy classifies on, so every key the engine builds goes through
//! [`CacheKey::dated`] or [`CacheTarget::key`].

use std::fmt;

use chrono::NaiveDate;

use crate::types::Provenance;

const DATE_FORMAT: &str = "%Y-%m-%d";
const DATE_TOKEN_LEN: usize = 10;

/// Key segment naming the all-items snapshot. Not usable as an item code.
pub const ALL_ITEMS_CODE: &str = "all";

/// A cache key string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Builds `"<prefix>:<YYYY-MM-DD>"`.
    pub fn dated(prefix: &str, date: NaiveDate) -> Self {
        CacheKey(format!("{}:{}", prefix, date.format(DATE_FORMAT)))
    }

    /// Date in the key's trailing segment.
    pub fn date_token(&self) -> Option<NaiveDate> {
        date_token(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl From<String> for CacheKey {
    fn from(raw: String) -> Self {
        CacheKey(raw)
    }
}

impl From<&str> for CacheKey {
    fn from(raw: &str) -> Self {
        CacheKey(raw.to_string())
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parses the last `:`-separated segment of `raw` as `YYYY-MM-DD`.
///
/// Only the trailing segment counts, so an item code that looks like a date
/// cannot stand in for the key's own date.
pub fn date_token(raw: &str) -> Option<NaiveDate> {
    let token = raw.rsplit(':').next()?;
    if token.len() != DATE_TOKEN_LEN {
        return None;
    }
    NaiveDate::parse_from_str(token, DATE_FORMAT).ok()
}

// =============================================================================
// Cache Targets
// =============================================================================

/// The things the engine knows how to cache and rebuild.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheTarget {
    /// Replayed quantity of one item code as of `date`. The code must pass
    /// [`crate::validation::validate_item_code`], which reserves
    /// [`ALL_ITEMS_CODE`].
    Stock { item_code: String, date: NaiveDate },
    /// Replayed quantities of every item code as of `date`.
    AllStock { date: NaiveDate },
    /// Merged aggregate category documents for `date`.
    Categories { date: NaiveDate },
}

impl CacheTarget {
    pub fn key(&self) -> CacheKey {
        match self {
            CacheTarget::Stock { item_code, date } => {
                CacheKey::dated(&format!("stock:{}", item_code), *date)
            }
            CacheTarget::AllStock { date } => {
                CacheKey::dated(&format!("stock:{}", ALL_ITEMS_CODE), *date)
            }
            CacheTarget::Categories { date } => CacheKey::dated("categories", *date),
        }
    }

    /// Parses a key produced by [`CacheTarget::key`].
    pub fn parse(key: &str) -> Option<Self> {
        let (head, date) = key.rsplit_once(':')?;
        let date = NaiveDate::parse_from_str(date, DATE_FORMAT).ok()?;

        if head == "categories" {
            return Some(CacheTarget::Categories { date });
        }
        match head.strip_prefix("stock:")? {
            ALL_ITEMS_CODE => Some(CacheTarget::AllStock { date }),
            "" => None,
            code => Some(CacheTarget::Stock {
                item_code: code.to_string(),
                date,
            }),
        }
    }

    pub fn date(&self) -> NaiveDate {
        match self {
            CacheTarget::Stock { date, .. }
            | CacheTarget::AllStock { date }
            | CacheTarget::Categories { date } => *date,
        }
    }

    /// Which upstream source fills this target.
    pub fn provenance(&self) -> Provenance {
        match self {
            CacheTarget::Stock { .. } | CacheTarget::AllStock { .. } => Provenance::LedgerDerived,
            CacheTarget::Categories { .. } => Provenance::AggregateDerived,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, day).unwrap()
    }

    #[test]
    fn test_dated_key_format() {
        let key = CacheKey::dated("stock:X70", d(16));
        assert_eq!(key.as_str(), "stock:X70:2026-10-16");
        assert_eq!(key.date_token(), Some(d(16)));
    }

    #[test]
    fn test_date_token_reads_trailing_segment() {
        assert_eq!(date_token("categories:2026-10-03"), Some(d(3)));
        assert_eq!(date_token("2026-10-03"), Some(d(3)));
        assert_eq!(date_token("no-date-here"), None);
        assert_eq!(date_token("sales:2026-13-40"), None);
        assert_eq!(date_token("x"), None);

        // A date-shaped item code does not hide the key's own date.
        let key = CacheTarget::Stock {
            item_code: "2026-01-01".to_string(),
            date: d(16),
        }
        .key();
        assert_eq!(key.as_str(), "stock:2026-01-01:2026-10-16");
        assert_eq!(key.date_token(), Some(d(16)));
        assert_eq!(date_token("stock:2026-10-05:tail"), None);
    }

    #[test]
    fn test_target_keys_parse_back() {
        let targets = [
            CacheTarget::Stock {
                item_code: "X70".to_string(),
                date: d(16),
            },
            CacheTarget::AllStock { date: d(1) },
            CacheTarget::Categories { date: d(2) },
        ];
        for target in targets {
            assert_eq!(CacheTarget::parse(target.key().as_str()), Some(target));
        }
        assert_eq!(CacheTarget::parse("stock::2026-10-16"), None);
        assert_eq!(CacheTarget::parse("sales:2026-10-16"), None);
    }

    #[test]
    fn test_target_provenance() {
        assert_eq!(
            CacheTarget::AllStock { date: d(1) }.provenance(),
            Provenance::LedgerDerived
        );
        assert_eq!(
            CacheTarget::Categories { date: d(1) }.provenance(),
            Provenance::AggregateDerived
        );
    }
}
