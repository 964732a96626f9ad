use crate::codec::{get_json, get_parsed, get_ts, now, ts};
use crate::store::TaskStore;
use chrono::{DateTime, Utc};
use hive_core::{HiveError, HiveResult, Worker, WorkerStatus};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{info, warn};

const WORKER_COLUMNS: &str = "id, role, capabilities, status, registered_at, last_heartbeat";

fn worker_from_row(row: &Row<'_>) -> rusqlite::Result<Worker> {
    Ok(Worker {
        id: row.get(0)?,
        role: row.get(1)?,
        capabilities: get_json(row, 2)?,
        status: get_parsed(row, 3)?,
        registered_at: get_ts(row, 4)?,
        last_heartbeat: get_ts(row, 5)?,
    })
}

fn load_worker(conn: &Connection, id: &str) -> HiveResult<Option<Worker>> {
    let mut stmt =
        conn.prepare_cached(&format!("SELECT {WORKER_COLUMNS} FROM workers WHERE id = ?1"))?;
    Ok(stmt.query_row(params![id], worker_from_row).optional()?)
}

impl TaskStore {
    /// Register (or re-register) a worker as `active`.
    pub async fn register_worker(
        &self,
        id: &str,
        role: &str,
        capabilities: &[String],
    ) -> HiveResult<Worker> {
        let (owned_id, owned_role) = (id.to_string(), role.to_string());
        let caps = serde_json::to_string(capabilities)?;
        let worker = self
            .with_conn(move |conn| {
                let now = ts(now());
                conn.execute(
                    "INSERT INTO workers (id, role, capabilities, status, registered_at, last_heartbeat) \
                     VALUES (?1, ?2, ?3, 'active', ?4, ?4) \
                     ON CONFLICT (id) DO UPDATE SET role = excluded.role, \
                     capabilities = excluded.capabilities, status = 'active', \
                     registered_at = excluded.registered_at, last_heartbeat = excluded.last_heartbeat",
                    params![owned_id, owned_role, caps, now],
                )?;
                load_worker(conn, &owned_id)?
                    .ok_or_else(|| HiveError::NotFound(format!("worker {owned_id}")))
            })
            .await?;
        info!(worker_id = id, role, capabilities = ?capabilities, "Worker registered");
        Ok(worker)
    }

    /// Refresh a worker's liveness timestamp.
    pub async fn heartbeat(&self, id: &str) -> HiveResult<()> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE workers SET last_heartbeat = ?1 WHERE id = ?2",
                params![ts(now()), id],
            )?;
            if changed == 0 {
                return Err(HiveError::NotFound(format!("worker {id}")));
            }
            Ok(())
        })
        .await
    }

    /// Set a worker's advertised status.
    pub async fn set_worker_status(&self, id: &str, status: WorkerStatus) -> HiveResult<()> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE workers SET status = ?1 WHERE id = ?2",
                params![status.as_str(), id],
            )?;
            if changed == 0 {
                return Err(HiveError::NotFound(format!("worker {id}")));
            }
            Ok(())
        })
        .await
    }

    /// Remove a worker row; returns whether it existed.
    pub async fn deregister_worker(&self, id: &str) -> HiveResult<bool> {
        let owned = id.to_string();
        let removed = self
            .with_conn(move |conn| {
                Ok(conn.execute("DELETE FROM workers WHERE id = ?1", params![owned])? > 0)
            })
            .await?;
        if removed {
            info!(worker_id = id, "Worker deregistered");
        }
        Ok(removed)
    }

    /// Look up a worker by id.
    pub async fn get_worker(&self, id: &str) -> HiveResult<Option<Worker>> {
        let id = id.to_string();
        self.with_conn(move |conn| load_worker(conn, &id)).await
    }

    /// Every registered worker, oldest registration first.
    pub async fn list_workers(&self) -> HiveResult<Vec<Worker>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {WORKER_COLUMNS} FROM workers ORDER BY registered_at ASC, id ASC"
            ))?;
            let rows = stmt.query_map([], worker_from_row)?;
            let mut workers = Vec::new();
            for row in rows {
                workers.push(row?);
            }
            Ok(workers)
        })
        .await
    }

    /// Delete workers whose last heartbeat is older than `cutoff`.
    pub async fn prune_stale_workers(&self, cutoff: DateTime<Utc>) -> HiveResult<usize> {
        let removed = self
            .with_conn(move |conn| {
                Ok(conn.execute(
                    "DELETE FROM workers WHERE last_heartbeat < ?1",
                    params![ts(cutoff)],
                )?)
            })
            .await?;
        if removed > 0 {
            warn!(removed, "Pruned workers with expired heartbeats");
        }
        Ok(removed)
    }
}
