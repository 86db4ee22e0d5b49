//! # TTL Policy
//!
//! ```text
//! key embeds today's date ──► Today       short TTL (5 min default)
//! anything else           ──► Historical  long TTL  (1 h default)
//!
//! is_valid = (now - written_at) < ttl_for(key)
//! ```
//!
//! "Today" is the business day in the configured UTC offset, not the UTC
//! calendar day.

use chrono::{DateTime, Duration, FixedOffset, Offset, Utc};

use crate::error::{CoreResult, ValidationError};
use crate::key::date_token;
use crate::replay::business_date;

/// Default business-day offset: UTC+7.
pub const DEFAULT_UTC_OFFSET_MINUTES: i32 = 7 * 60;

/// TTL class of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyClass {
    Today,
    Historical,
}

/// Short/long TTL split keyed on the date embedded in a cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlPolicy {
    pub today: Duration,
    pub historical: Duration,
    pub offset: FixedOffset,
}

impl TtlPolicy {
    pub fn new(today: Duration, historical: Duration, offset: FixedOffset) -> Self {
        TtlPolicy {
            today,
            historical,
            offset,
        }
    }

    /// Builds a policy from config-style integers.
    pub fn from_secs(
        today_secs: u64,
        historical_secs: u64,
        utc_offset_minutes: i32,
    ) -> CoreResult<Self> {
        Ok(TtlPolicy::new(
            secs(today_secs)?,
            secs(historical_secs)?,
            business_offset(utc_offset_minutes)?,
        ))
    }

    /// Classifies `key` relative to the business day containing `now`.
    pub fn classify(&self, key: &str, now: DateTime<Utc>) -> KeyClass {
        match date_token(key) {
            Some(date) if date == business_date(now, self.offset) => KeyClass::Today,
            _ => KeyClass::Historical,
        }
    }

    pub fn ttl_for(&self, key: &str, now: DateTime<Utc>) -> Duration {
        match self.classify(key, now) {
            KeyClass::Today => self.today,
            KeyClass::Historical => self.historical,
        }
    }

    /// Whether an entry for `key` written at `written_at` is still fresh.
    pub fn is_valid(&self, key: &str, written_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now - written_at < self.ttl_for(key, now)
    }

    /// Whether the periodic sweep should drop an entry of this age,
    /// regardless of key class.
    pub fn is_sweepable(&self, written_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now - written_at >= self.historical
    }
}

impl Default for TtlPolicy {
    fn default() -> Self {
        let offset = FixedOffset::east_opt(DEFAULT_UTC_OFFSET_MINUTES * 60)
            .unwrap_or_else(|| Utc.fix());
        TtlPolicy::new(Duration::seconds(300), Duration::seconds(3600), offset)
    }
}

/// Converts a UTC offset in minutes into a [`FixedOffset`].
pub fn business_offset(minutes: i32) -> CoreResult<FixedOffset> {
    minutes
        .checked_mul(60)
        .and_then(FixedOffset::east_opt)
        .ok_or_else(|| {
            ValidationError::OutOfRange {
                field: "utc_offset_minutes".to_string(),
                min: -(24 * 60 - 1),
                max: 24 * 60 - 1,
            }
            .into()
        })
}

fn secs(value: u64) -> CoreResult<Duration> {
    i64::try_from(value)
        .ok()
        .and_then(Duration::try_seconds)
        .ok_or_else(|| {
            ValidationError::OutOfRange {
                field: "ttl_secs".to_string(),
                min: 0,
                max: i64::MAX / 1000,
            }
            .into()
        })
}
