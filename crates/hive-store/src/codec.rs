//! Column encoding shared by every table: RFC 3339 timestamps, uuids and
//! JSON documents stored as text.
//!
//! Decoding failures surface as `FromSqlConversionFailure`, which the error
//! layer classifies as store corruption.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::types::Type;
use rusqlite::Row;
use serde::de::DeserializeOwned;
use std::str::FromStr;
use uuid::Uuid;

/// Current time at the precision timestamps are persisted with.
pub(crate) fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Fixed-width encoding, so lexical order matches chronological order.
pub(crate) fn ts(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn opt_ts(value: Option<DateTime<Utc>>) -> Option<String> {
    value.map(ts)
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

pub(crate) fn get_uuid(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

pub(crate) fn get_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(idx, &raw)
}

pub(crate) fn get_opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| parse_ts(idx, &s)).transpose()
}

/// Status and phase columns.
pub(crate) fn get_parsed<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_error(idx, e))
}

pub(crate) fn get_json<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

pub(crate) fn get_opt_json<T: DeserializeOwned>(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<T>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| serde_json::from_str(&s).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

pub(crate) fn get_u32(row: &Row<'_>, idx: usize) -> rusqlite::Result<u32> {
    let raw: i64 = row.get(idx)?;
    u32::try_from(raw).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(idx, raw))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use hive_core::{HiveError, TaskStatus};
    use rusqlite::Connection;

    #[test]
    fn test_timestamp_text_sorts_chronologically() {
        let earlier = now();
        let later = earlier + chrono::Duration::microseconds(1);
        assert!(ts(earlier) < ts(later));
        assert_eq!(ts(earlier).len(), ts(later).len());
    }

    #[test]
    fn test_timestamp_roundtrip_is_exact() {
        let conn = Connection::open_in_memory().unwrap();
        let value = now();
        let back = conn
            .query_row("SELECT ?1", [ts(value)], |row| get_ts(row, 0))
            .unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn test_bad_status_is_corruption() {
        let conn = Connection::open_in_memory().unwrap();
        let err = conn
            .query_row("SELECT 'paused'", [], |row| get_parsed::<TaskStatus>(row, 0))
            .unwrap_err();
        assert!(HiveError::from(err).is_fatal());
    }

    #[test]
    fn test_bad_uuid_is_corruption() {
        let conn = Connection::open_in_memory().unwrap();
        let err = conn
            .query_row("SELECT 'not-a-uuid'", [], |row| get_uuid(row, 0))
            .unwrap_err();
        assert!(HiveError::from(err).is_fatal());
    }

    #[test]
    fn test_negative_counter_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        let err = conn
            .query_row("SELECT -1", [], |row| get_u32(row, 0))
            .unwrap_err();
        assert!(HiveError::from(err).is_fatal());
    }
}
