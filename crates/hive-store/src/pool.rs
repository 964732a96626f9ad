//! Bounded pool of SQLite connections.
//!
//! Admission is a counting semaphore sized to `max_connections`; connections
//! themselves live in an idle queue. A caller owns a connection exclusively
//! for as long as it holds the [`PooledConnection`] guard, and the guard's
//! drop rolls back any open transaction and validates the connection before
//! it goes back to the idle queue.

use hive_core::{HiveError, HiveResult, PoolSettings};
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::Serialize;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

/// How many times a new connection is attempted before giving up.
const CREATE_ATTEMPTS: u32 = 2;
const CREATE_RETRY_PAUSE: Duration = Duration::from_millis(50);

/// Pool sizing, deadlines and the database location.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// SQLite database file.
    pub path: PathBuf,
    /// Connections opened eagerly by [`ConnectionPool::open`].
    pub min_connections: usize,
    /// Upper bound on simultaneously open connections.
    pub max_connections: usize,
    /// How long [`ConnectionPool::acquire`] waits before failing with `PoolExhausted`.
    pub acquire_timeout: Duration,
    /// SQLite busy handler timeout applied to every connection.
    pub busy_timeout: Duration,
}

impl PoolConfig {
    /// Defaults from [`PoolSettings::default`] for the given database file.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::from_settings(path, &PoolSettings::default())
    }

    /// Sizing and deadlines taken from the `[pool]` configuration section.
    pub fn from_settings(path: impl Into<PathBuf>, settings: &PoolSettings) -> Self {
        Self {
            path: path.into(),
            min_connections: settings.min_connections,
            max_connections: settings.max_connections,
            acquire_timeout: settings.acquire_timeout(),
            busy_timeout: settings.busy_timeout(),
        }
    }

    /// Override the number of pre-warmed connections.
    pub fn with_min_connections(mut self, min: usize) -> Self {
        self.min_connections = min;
        self
    }

    /// Override the connection limit.
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Override how long an acquire may wait.
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Override the SQLite busy timeout.
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Connections currently handed out.
    pub active: usize,
    /// Validated connections waiting in the idle queue.
    pub idle: usize,
    /// Connections currently open (active + idle).
    pub open: usize,
    /// Configured connection limit.
    pub max: usize,
    /// Connections created over the pool's lifetime.
    pub total_created: u64,
    /// Acquisitions that timed out.
    pub exhaustion_events: u64,
    /// Connections dropped after failing validation.
    pub discarded: u64,
}

struct PoolInner {
    config: PoolConfig,
    permits: Arc<Semaphore>,
    idle: Mutex<VecDeque<Connection>>,
    closed: AtomicBool,
    open: AtomicUsize,
    total_created: AtomicU64,
    exhaustion_events: AtomicU64,
    discarded: AtomicU64,
}

/// Shared handle to the connection pool. Cloning is cheap.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("path", &self.inner.config.path)
            .field("stats", &self.stats())
            .finish()
    }
}

impl ConnectionPool {
    /// Create the pool and pre-warm `min_connections` connections.
    pub async fn open(config: PoolConfig) -> HiveResult<Self> {
        if config.max_connections == 0 {
            return Err(HiveError::Config(
                "max_connections must be at least 1".to_string(),
            ));
        }
        if config.min_connections > config.max_connections {
            return Err(HiveError::Config(format!(
                "min_connections ({}) exceeds max_connections ({})",
                config.min_connections, config.max_connections
            )));
        }
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let inner = Arc::new(PoolInner {
            permits: Arc::new(Semaphore::new(config.max_connections)),
            idle: Mutex::new(VecDeque::with_capacity(config.max_connections)),
            closed: AtomicBool::new(false),
            open: AtomicUsize::new(0),
            total_created: AtomicU64::new(0),
            exhaustion_events: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
            config,
        });

        for _ in 0..inner.config.min_connections {
            let conn = inner.create_connection().await?;
            inner.idle.lock().push_back(conn);
        }

        info!(
            path = %inner.config.path.display(),
            min = inner.config.min_connections,
            max = inner.config.max_connections,
            "Connection pool opened"
        );
        Ok(Self { inner })
    }

    /// Take a connection, waiting up to the acquisition timeout.
    pub async fn acquire(&self) -> HiveResult<PooledConnection> {
        let timeout = self.inner.config.acquire_timeout;
        let permit =
            match tokio::time::timeout(timeout, self.inner.permits.clone().acquire_owned()).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(HiveError::PoolClosed),
                Err(_) => {
                    self.inner.exhaustion_events.fetch_add(1, Ordering::Relaxed);
                    let timeout_ms = timeout.as_millis() as u64;
                    warn!(timeout_ms, "Connection pool exhausted");
                    return Err(HiveError::PoolExhausted { timeout_ms });
                }
            };

        let idle = self.inner.idle.lock().pop_front();
        let conn = match idle {
            Some(conn) => conn,
            None => self.inner.create_connection().await?,
        };

        Ok(PooledConnection {
            conn: Some(conn),
            pool: self.inner.clone(),
            _permit: permit,
        })
    }

    /// Current counters.
    pub fn stats(&self) -> PoolStats {
        let max = self.inner.config.max_connections;
        let available = self.inner.permits.available_permits().min(max);
        PoolStats {
            active: max - available,
            idle: self.inner.idle.lock().len(),
            open: self.inner.open.load(Ordering::Relaxed),
            max,
            total_created: self.inner.total_created.load(Ordering::Relaxed),
            exhaustion_events: self.inner.exhaustion_events.load(Ordering::Relaxed),
            discarded: self.inner.discarded.load(Ordering::Relaxed),
        }
    }

    /// Stop handing out connections and drop the idle ones. Connections still
    /// checked out are closed when their guards drop.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.permits.close();
        let drained: Vec<Connection> = self.inner.idle.lock().drain(..).collect();
        self.inner
            .open
            .fetch_sub(drained.len(), Ordering::Relaxed);
        info!(closed_idle = drained.len(), "Connection pool closed");
    }

    /// The configuration the pool was opened with.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// The database file.
    pub fn path(&self) -> &Path {
        &self.inner.config.path
    }
}

impl PoolInner {
    async fn create_connection(&self) -> HiveResult<Connection> {
        let mut last_error = String::new();
        for attempt in 1..=CREATE_ATTEMPTS {
            let config = self.config.clone();
            let opened = tokio::task::spawn_blocking(move || open_connection(&config))
                .await
                .map_err(|e| HiveError::ConnectionCreate(format!("open task did not finish: {e}")))?;
            match opened {
                Ok(conn) => {
                    self.open.fetch_add(1, Ordering::Relaxed);
                    self.total_created.fetch_add(1, Ordering::Relaxed);
                    debug!(attempt, "Opened store connection");
                    return Ok(conn);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Failed to open store connection");
                    last_error = e.to_string();
                    if attempt < CREATE_ATTEMPTS {
                        tokio::time::sleep(CREATE_RETRY_PAUSE).await;
                    }
                }
            }
        }
        Err(HiveError::ConnectionCreate(format!(
            "{} after {CREATE_ATTEMPTS} attempts: {last_error}",
            self.config.path.display()
        )))
    }

    fn recycle(&self, conn: Connection) {
        if !conn.is_autocommit() {
            match conn.execute_batch("ROLLBACK") {
                Ok(()) => debug!("Rolled back transaction left open on released connection"),
                Err(e) => warn!(error = %e, "Rollback on release failed"),
            }
        }

        if self.closed.load(Ordering::SeqCst) {
            self.open.fetch_sub(1, Ordering::Relaxed);
            return;
        }

        match validate(&conn) {
            Ok(()) if conn.is_autocommit() => self.idle.lock().push_back(conn),
            Ok(()) => self.discard(conn, "transaction could not be closed"),
            Err(e) => self.discard(conn, &e.to_string()),
        }
    }

    fn discard(&self, conn: Connection, reason: &str) {
        drop(conn);
        self.open.fetch_sub(1, Ordering::Relaxed);
        self.discarded.fetch_add(1, Ordering::Relaxed);
        warn!(reason, "Discarded store connection that failed validation");
    }
}

fn open_connection(config: &PoolConfig) -> rusqlite::Result<Connection> {
    let conn = Connection::open(&config.path)?;
    conn.busy_timeout(config.busy_timeout)?;
    let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA synchronous = NORMAL;")?;
    validate(&conn)?;
    Ok(conn)
}

/// Trivial round-trip query.
fn validate(conn: &Connection) -> rusqlite::Result<()> {
    conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
        .map(|_| ())
}

/// Exclusive handle to a pooled connection; returns it to the pool on drop.
pub struct PooledConnection {
    conn: Option<Connection>,
    pool: Arc<PoolInner>,
    // Dropped after `Drop::drop` has pushed the connection back.
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection").finish_non_exhaustive()
    }
}

impl PooledConnection {
    /// Return the connection to the pool now.
    pub fn release(self) {
        drop(self);
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        match self.conn.as_ref() {
            Some(conn) => conn,
            None => unreachable!("connection is only taken during drop"),
        }
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        match self.conn.as_mut() {
            Some(conn) => conn,
            None => unreachable!("connection is only taken during drop"),
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.recycle(conn);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn pool(dir: &TempDir, min: usize, max: usize, timeout_ms: u64) -> ConnectionPool {
        let config = PoolConfig::new(dir.path().join("pool.db"))
            .with_min_connections(min)
            .with_max_connections(max)
            .with_acquire_timeout(Duration::from_millis(timeout_ms));
        ConnectionPool::open(config).await.unwrap()
    }

    #[tokio::test]
    async fn test_prewarms_min_connections() {
        let dir = TempDir::new().unwrap();
        let pool = pool(&dir, 3, 5, 100).await;
        let stats = pool.stats();
        assert_eq!(stats.idle, 3);
        assert_eq!(stats.open, 3);
        assert_eq!(stats.active, 0);
        assert_eq!(stats.total_created, 3);
    }

    #[tokio::test]
    async fn test_grows_lazily_and_reuses() {
        let dir = TempDir::new().unwrap();
        let pool = pool(&dir, 0, 4, 100).await;
        assert_eq!(pool.stats().open, 0);

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert_eq!(pool.stats().active, 2);
        assert_eq!(pool.stats().total_created, 2);
        drop(a);
        drop(b);

        let _c = pool.acquire().await.unwrap();
        let stats = pool.stats();
        assert_eq!(stats.total_created, 2, "idle connection should be reused");
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.active, 1);
    }

    #[tokio::test]
    async fn test_timeout_reports_exhaustion() {
        let dir = TempDir::new().unwrap();
        let pool = pool(&dir, 1, 1, 50).await;
        let _held = pool.acquire().await.unwrap();

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, HiveError::PoolExhausted { timeout_ms: 50 }));
        assert_eq!(pool.stats().exhaustion_events, 1);
        assert_eq!(pool.stats().open, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_sixth_acquire_waits_for_release() {
        let dir = TempDir::new().unwrap();
        let pool = pool(&dir, 0, 5, 5_000).await;

        let mut held = Vec::new();
        for _ in 0..5 {
            held.push(pool.acquire().await.unwrap());
        }
        assert_eq!(pool.stats().active, 5);

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|c| c.release()) })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiter.is_finished(), "sixth acquire must block at capacity");
        assert!(pool.stats().open <= 5);

        held.pop().unwrap().release();
        waiter.await.unwrap().unwrap();
        assert_eq!(pool.stats().total_created, 5);
        assert_eq!(pool.stats().exhaustion_events, 0);
    }

    #[tokio::test]
    async fn test_release_rolls_back_open_transaction() {
        let dir = TempDir::new().unwrap();
        let pool = pool(&dir, 1, 1, 100).await;
        {
            let conn = pool.acquire().await.unwrap();
            conn.execute_batch("CREATE TABLE t (v INTEGER)").unwrap();
            conn.execute_batch("BEGIN; INSERT INTO t (v) VALUES (1);")
                .unwrap();
            assert!(!conn.is_autocommit());
        }

        let conn = pool.acquire().await.unwrap();
        assert!(conn.is_autocommit());
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
        assert_eq!(pool.stats().discarded, 0);
    }

    #[tokio::test]
    async fn test_close_rejects_new_acquires() {
        let dir = TempDir::new().unwrap();
        let pool = pool(&dir, 2, 2, 100).await;
        let held = pool.acquire().await.unwrap();
        pool.close();
        assert!(matches!(pool.acquire().await, Err(HiveError::PoolClosed)));
        drop(held);
        assert_eq!(pool.stats().open, 0);
        assert_eq!(pool.stats().idle, 0);
    }

    #[tokio::test]
    async fn test_invalid_sizing_rejected() {
        let dir = TempDir::new().unwrap();
        let config = PoolConfig::new(dir.path().join("x.db"))
            .with_min_connections(3)
            .with_max_connections(2);
        assert!(matches!(
            ConnectionPool::open(config).await,
            Err(HiveError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_unopenable_path_reports_create_error() {
        let dir = TempDir::new().unwrap();
        // A directory cannot be opened as a database file.
        let config = PoolConfig::new(dir.path().to_path_buf()).with_min_connections(1);
        let err = ConnectionPool::open(config).await.unwrap_err();
        assert!(matches!(err, HiveError::ConnectionCreate(_)));
    }

    #[tokio::test]
    async fn test_connections_use_wal() {
        let dir = TempDir::new().unwrap();
        let pool = pool(&dir, 1, 1, 100).await;
        let conn = pool.acquire().await.unwrap();
        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }
}
