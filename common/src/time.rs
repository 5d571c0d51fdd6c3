//! Time utilities for the ledger.

use chrono::{DateTime, Utc};

/// A timestamp with timezone (always UTC).
pub type Timestamp = DateTime<Utc>;

/// Get the current timestamp, truncated to microseconds.
///
/// PostgreSQL stores microsecond precision, so records built in memory and
/// records read back from the database compare equal.
pub fn now() -> Timestamp {
    let now = Utc::now();
    DateTime::from_timestamp_micros(now.timestamp_micros()).unwrap_or(now)
}
