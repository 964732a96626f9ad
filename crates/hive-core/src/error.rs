use rusqlite::ErrorCode;
use thiserror::Error;
use uuid::Uuid;

/// A convenience `Result` alias using [`HiveError`].
pub type HiveResult<T> = Result<T, HiveError>;

/// Top-level error type for the orchestration engine.
///
/// Variants map onto the failure classes the dispatch and retry loops react
/// to differently: transient resource errors are retried on the next poll
/// cycle, [`HiveError::StoreCorruption`] stops the owning loop.
#[derive(Error, Debug)]
pub enum HiveError {
    /// No connection became available before the acquisition deadline.
    #[error("Connection pool exhausted: no connection available within {timeout_ms}ms")]
    PoolExhausted {
        /// The acquisition timeout that elapsed.
        timeout_ms: u64,
    },

    /// The pool was closed while (or before) waiting for a connection.
    #[error("Connection pool is closed")]
    PoolClosed,

    /// A new store connection could not be opened or failed validation.
    #[error("Failed to create store connection: {0}")]
    ConnectionCreate(String),

    /// A row was claimed by a concurrent dispatcher between read and write.
    #[error("Assignment conflict: {0} was claimed concurrently")]
    AssignmentConflict(String),

    /// A worker reported a failed run.
    #[error("Run failure for task {task_id}: {reason}")]
    RunFailure {
        /// The task whose run failed.
        task_id: Uuid,
        /// Worker-supplied failure reason.
        reason: String,
    },

    /// The store is busy or locked by another writer.
    #[error("Store busy: {0}")]
    StoreBusy(String),

    /// Schema or constraint violation. Fatal for the loop that observes it.
    #[error("Store corruption: {0}")]
    StoreCorruption(String),

    /// Any other store-level failure.
    #[error("Store error: {0}")]
    Store(String),

    /// A referenced row does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A plan draft failed validation.
    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    /// The requested status change is not allowed from the current state.
    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),

    /// Configuration parsing or validation failed.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl HiveError {
    /// Errors worth retrying on the next poll cycle.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            HiveError::PoolExhausted { .. }
                | HiveError::ConnectionCreate(_)
                | HiveError::StoreBusy(_)
                | HiveError::AssignmentConflict(_)
        )
    }

    /// Errors that must stop the owning process rather than risk inconsistent dispatch.
    pub fn is_fatal(&self) -> bool {
        matches!(self, HiveError::StoreCorruption(_))
    }
}

impl From<rusqlite::Error> for HiveError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
                ErrorCode::ConstraintViolation
                | ErrorCode::DatabaseCorrupt
                | ErrorCode::NotADatabase
                | ErrorCode::TypeMismatch => HiveError::StoreCorruption(err.to_string()),
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                    HiveError::StoreBusy(err.to_string())
                }
                _ => HiveError::Store(err.to_string()),
            },
            rusqlite::Error::FromSqlConversionFailure(..)
            | rusqlite::Error::InvalidColumnType(..)
            | rusqlite::Error::IntegralValueOutOfRange(..) => {
                HiveError::StoreCorruption(err.to_string())
            }
            rusqlite::Error::QueryReturnedNoRows => HiveError::NotFound(err.to_string()),
            _ => HiveError::Store(err.to_string()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(HiveError::PoolExhausted { timeout_ms: 10 }.is_transient());
        assert!(HiveError::StoreBusy("locked".into()).is_transient());
        assert!(HiveError::AssignmentConflict("task".into()).is_transient());
        assert!(!HiveError::StoreCorruption("bad".into()).is_transient());
        assert!(!HiveError::NotFound("x".into()).is_transient());
    }

    #[test]
    fn test_only_corruption_is_fatal() {
        assert!(HiveError::StoreCorruption("dangling dependency".into()).is_fatal());
        assert!(!HiveError::PoolExhausted { timeout_ms: 1 }.is_fatal());
        assert!(!HiveError::RunFailure {
            task_id: Uuid::new_v4(),
            reason: "boom".into()
        }
        .is_fatal());
    }

    #[test]
    fn test_constraint_violation_maps_to_corruption() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT NOT NULL);")
            .unwrap();
        let err = conn
            .execute("INSERT INTO t (id, v) VALUES (1, NULL)", [])
            .unwrap_err();
        assert!(matches!(HiveError::from(err), HiveError::StoreCorruption(_)));
    }

    #[test]
    fn test_no_rows_maps_to_not_found() {
        let err = HiveError::from(rusqlite::Error::QueryReturnedNoRows);
        assert!(matches!(err, HiveError::NotFound(_)));
    }

    #[test]
    fn test_display_messages() {
        let err = HiveError::PoolExhausted { timeout_ms: 250 };
        assert_eq!(
            err.to_string(),
            "Connection pool exhausted: no connection available within 250ms"
        );
        let err = HiveError::Config("bad".into());
        assert_eq!(err.to_string(), "Config error: bad");
    }
}
