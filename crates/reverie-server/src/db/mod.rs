// crates/reverie-server/src/db/mod.rs
// SQLite persistence: pool, schema and migrations

pub mod migration_helpers;
pub mod pool;
mod schema;
#[cfg(test)]
pub mod test_support;

pub use pool::{DatabasePool, PoolStatus};
pub use schema::SCHEMA;

use chrono::{DateTime, Utc};

/// Timestamps are stored as RFC 3339 text with millisecond precision.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Parse a stored timestamp, mapping failures to a rusqlite conversion error
/// so row mappers can use `?`.
pub fn parse_timestamp(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}
