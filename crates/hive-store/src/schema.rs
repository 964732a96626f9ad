//! Schema migrations, tracked through `PRAGMA user_version`.

use hive_core::{HiveError, HiveResult};
use rusqlite::{Connection, TransactionBehavior};
use tracing::info;

/// Ordered migrations; entry `n` upgrades the schema from version `n` to `n + 1`.
const MIGRATIONS: &[&str] = &[V1_INITIAL];

const V1_INITIAL: &str = r#"
CREATE TABLE planning_queue (
    id              TEXT PRIMARY KEY,
    description     TEXT NOT NULL,
    priority        INTEGER NOT NULL DEFAULT 0,
    requestor       TEXT NOT NULL,
    context         TEXT NOT NULL DEFAULT '{}',
    status          TEXT NOT NULL DEFAULT 'pending'
                    CHECK (status IN ('pending', 'assigned', 'planned', 'failed')),
    assigned_agent  TEXT,
    failure_reason  TEXT,
    created_at      TEXT NOT NULL,
    assigned_at     TEXT,
    completed_at    TEXT
);
CREATE INDEX idx_planning_queue_status_priority
    ON planning_queue (status, priority DESC, created_at);

CREATE TABLE execution_plans (
    id                   TEXT PRIMARY KEY,
    planning_request_id  TEXT NOT NULL UNIQUE REFERENCES planning_queue (id),
    plan_data            TEXT NOT NULL,
    status               TEXT NOT NULL DEFAULT 'generated'
                         CHECK (status IN ('generated', 'executing', 'completed', 'failed')),
    failure_reason       TEXT,
    generated_at         TEXT NOT NULL,
    completed_at         TEXT
);
CREATE INDEX idx_execution_plans_status ON execution_plans (status);

CREATE TABLE tasks (
    id               TEXT PRIMARY KEY,
    title            TEXT NOT NULL,
    description      TEXT NOT NULL DEFAULT '',
    task_type        TEXT NOT NULL,
    priority         INTEGER NOT NULL DEFAULT 0,
    status           TEXT NOT NULL DEFAULT 'queued'
                     CHECK (status IN ('queued', 'assigned', 'in_progress', 'completed', 'failed', 'cancelled')),
    assignee         TEXT,
    payload          TEXT NOT NULL,
    parent_plan_id   TEXT REFERENCES execution_plans (id),
    subtask_id       TEXT,
    required_phases  TEXT NOT NULL,
    retry_count      INTEGER NOT NULL DEFAULT 0 CHECK (retry_count >= 0),
    not_before       TEXT,
    failure_reason   TEXT,
    created_at       TEXT NOT NULL,
    updated_at       TEXT NOT NULL,
    assigned_at      TEXT,
    completed_at     TEXT
);
CREATE INDEX idx_tasks_status_priority ON tasks (status, priority DESC, created_at);
CREATE UNIQUE INDEX idx_tasks_plan_subtask
    ON tasks (parent_plan_id, subtask_id) WHERE parent_plan_id IS NOT NULL;

CREATE TABLE runs (
    id           TEXT PRIMARY KEY,
    task_id      TEXT NOT NULL REFERENCES tasks (id),
    worker_id    TEXT NOT NULL,
    phase        TEXT NOT NULL,
    status       TEXT NOT NULL CHECK (status IN ('running', 'completed', 'failed')),
    attempt      INTEGER NOT NULL,
    result       TEXT,
    started_at   TEXT NOT NULL,
    finished_at  TEXT
);
CREATE INDEX idx_runs_task_id ON runs (task_id);

CREATE TABLE workers (
    id              TEXT PRIMARY KEY,
    role            TEXT NOT NULL,
    capabilities    TEXT NOT NULL DEFAULT '[]',
    status          TEXT NOT NULL DEFAULT 'active' CHECK (status IN ('active', 'draining')),
    registered_at   TEXT NOT NULL,
    last_heartbeat  TEXT NOT NULL
);

CREATE TABLE escalations (
    id               TEXT PRIMARY KEY,
    task_id          TEXT NOT NULL REFERENCES tasks (id),
    reason           TEXT NOT NULL,
    run_ids          TEXT NOT NULL DEFAULT '[]',
    created_at       TEXT NOT NULL,
    acknowledged_at  TEXT
);
CREATE INDEX idx_escalations_task_id ON escalations (task_id);
"#;

/// Latest schema version this build understands.
pub fn current_version() -> u32 {
    MIGRATIONS.len() as u32
}

pub(crate) fn schema_version(conn: &Connection) -> HiveResult<u32> {
    Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
}

/// Bring the database up to [`current_version`].
///
/// Runs under an immediate transaction, so concurrent processes starting at
/// once apply each migration exactly once.
pub(crate) fn migrate(conn: &mut Connection) -> HiveResult<u32> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let found = schema_version(&tx)?;
    let target = current_version();

    if found > target {
        return Err(HiveError::StoreCorruption(format!(
            "database schema version {found} is newer than supported version {target}"
        )));
    }

    for (index, sql) in MIGRATIONS.iter().enumerate().skip(found as usize) {
        let version = index as u32 + 1;
        tx.execute_batch(sql)?;
        tx.pragma_update(None, "user_version", version)?;
        info!(version, "Applied schema migration");
    }

    tx.commit()?;
    Ok(target)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_fresh_database() {
        let mut conn = Connection::open_in_memory().unwrap();
        assert_eq!(schema_version(&conn).unwrap(), 0);
        assert_eq!(migrate(&mut conn).unwrap(), current_version());
        assert_eq!(schema_version(&conn).unwrap(), current_version());

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'
                 AND name IN ('planning_queue', 'execution_plans', 'tasks', 'runs', 'workers', 'escalations')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 6);
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        migrate(&mut conn).unwrap();
        assert_eq!(schema_version(&conn).unwrap(), current_version());
    }

    #[test]
    fn test_newer_schema_is_rejected() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", current_version() + 1)
            .unwrap();
        let err = migrate(&mut conn).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_status_check_constraint() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        let err = conn
            .execute(
                "INSERT INTO workers (id, role, status, registered_at, last_heartbeat)
                 VALUES ('w1', 'coder', 'sleeping', 'x', 'x')",
                [],
            )
            .unwrap_err();
        assert!(HiveError::from(err).is_fatal());
    }
}
