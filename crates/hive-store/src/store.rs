use crate::pool::{ConnectionPool, PoolConfig};
use crate::schema;
use hive_core::{HiveConfig, HiveError, HiveResult};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::info;

/// Durable store for planning requests, plans, tasks, runs, workers and
/// escalations.
///
/// Every operation takes a connection from the injected pool for its own
/// duration and runs its SQLite work on the blocking thread pool. Multi-row
/// changes run in a single immediate transaction that is opened and
/// committed without any `.await` in between.
#[derive(Debug, Clone)]
pub struct TaskStore {
    pool: ConnectionPool,
}

/// Row counts by status, for operators.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    /// Planning requests per status.
    pub planning_requests: BTreeMap<String, u64>,
    /// Execution plans per status.
    pub plans: BTreeMap<String, u64>,
    /// Tasks per status.
    pub tasks: BTreeMap<String, u64>,
    /// Escalations not yet acknowledged.
    pub open_escalations: u64,
    /// Registered workers.
    pub workers: u64,
}

impl TaskStore {
    /// Wrap `pool` and apply pending migrations.
    pub async fn open(pool: ConnectionPool) -> HiveResult<Self> {
        let store = Self { pool };
        let version = store.with_conn(schema::migrate).await?;
        info!(path = %store.pool.path().display(), version, "Task store ready");
        Ok(store)
    }

    /// Build the pool from configuration, then open the store.
    pub async fn connect(config: &HiveConfig) -> HiveResult<Self> {
        let pool =
            ConnectionPool::open(PoolConfig::from_settings(&config.database, &config.pool)).await?;
        Self::open(pool).await
    }

    /// The pool backing this store.
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Run `op` on a pooled connection on the blocking thread pool.
    ///
    /// The connection goes back to the pool when `op` returns, on the same
    /// blocking thread, so busy waits and rollbacks never stall the runtime.
    pub(crate) async fn with_conn<T, F>(&self, op: F) -> HiveResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> HiveResult<T> + Send + 'static,
    {
        let mut conn = self.pool.acquire().await?;
        tokio::task::spawn_blocking(move || op(&mut conn))
            .await
            .map_err(|e| HiveError::Store(format!("store task did not finish: {e}")))?
    }

    /// The `PRAGMA user_version` of the database.
    pub async fn schema_version(&self) -> HiveResult<u32> {
        self.with_conn(|conn| schema::schema_version(conn)).await
    }

    /// Row counts by status across every table.
    pub async fn status_counts(&self) -> HiveResult<StatusCounts> {
        self.with_conn(|conn| {
            let open_escalations: i64 = conn.query_row(
                "SELECT COUNT(*) FROM escalations WHERE acknowledged_at IS NULL",
                [],
                |row| row.get(0),
            )?;
            let workers: i64 =
                conn.query_row("SELECT COUNT(*) FROM workers", [], |row| row.get(0))?;
            Ok(StatusCounts {
                planning_requests: count_by_status(conn, "planning_queue")?,
                plans: count_by_status(conn, "execution_plans")?,
                tasks: count_by_status(conn, "tasks")?,
                open_escalations: open_escalations as u64,
                workers: workers as u64,
            })
        })
        .await
    }
}

fn count_by_status(conn: &Connection, table: &str) -> HiveResult<BTreeMap<String, u64>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT status, COUNT(*) FROM {table} GROUP BY status"
    ))?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;
    let mut counts = BTreeMap::new();
    for row in rows {
        let (status, count) = row?;
        counts.insert(status, count as u64);
    }
    Ok(counts)
}
