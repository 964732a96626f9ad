use crate::codec::{get_json, get_opt_ts, get_ts, get_uuid, now, ts};
use crate::runs::task_runs;
use crate::store::TaskStore;
use crate::tasks::require_task;
use chrono::{DateTime, Utc};
use hive_core::{Escalation, EscalationReport, HiveResult};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{info, warn};
use uuid::Uuid;

const ESCALATION_COLUMNS: &str = "id, task_id, reason, run_ids, created_at, acknowledged_at";

fn escalation_from_row(row: &Row<'_>) -> rusqlite::Result<Escalation> {
    Ok(Escalation {
        id: get_uuid(row, 0)?,
        task_id: get_uuid(row, 1)?,
        reason: row.get(2)?,
        run_ids: get_json(row, 3)?,
        created_at: get_ts(row, 4)?,
        acknowledged_at: get_opt_ts(row, 5)?,
    })
}

pub(crate) fn insert_escalation(
    conn: &Connection,
    task_id: Uuid,
    reason: &str,
    run_ids: Vec<Uuid>,
    at: DateTime<Utc>,
) -> HiveResult<Escalation> {
    let escalation = Escalation {
        id: Uuid::new_v4(),
        task_id,
        reason: reason.to_string(),
        run_ids,
        created_at: at,
        acknowledged_at: None,
    };
    conn.execute(
        "INSERT INTO escalations (id, task_id, reason, run_ids, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            escalation.id.to_string(),
            task_id.to_string(),
            escalation.reason,
            serde_json::to_string(&escalation.run_ids)?,
            ts(at),
        ],
    )?;
    warn!(
        escalation_id = %escalation.id,
        task_id = %task_id,
        runs = escalation.run_ids.len(),
        reason,
        "Task escalated for operator attention"
    );
    Ok(escalation)
}

fn report_for(conn: &Connection, escalation: Escalation) -> HiveResult<EscalationReport> {
    let task = require_task(conn, escalation.task_id)?;
    let runs = task_runs(conn, escalation.task_id)?;
    Ok(EscalationReport {
        escalation,
        task,
        runs,
    })
}

impl TaskStore {
    /// Escalations with their task and run history, newest first.
    pub async fn list_escalations(
        &self,
        include_acknowledged: bool,
    ) -> HiveResult<Vec<EscalationReport>> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let escalations = {
                let mut stmt = tx.prepare_cached(&format!(
                    "SELECT {ESCALATION_COLUMNS} FROM escalations \
                     WHERE ?1 OR acknowledged_at IS NULL ORDER BY created_at DESC, rowid DESC"
                ))?;
                let rows = stmt.query_map(params![include_acknowledged], escalation_from_row)?;
                let mut escalations = Vec::new();
                for row in rows {
                    escalations.push(row?);
                }
                escalations
            };
            let mut reports = Vec::with_capacity(escalations.len());
            for escalation in escalations {
                reports.push(report_for(&tx, escalation)?);
            }
            tx.commit()?;
            Ok(reports)
        })
        .await
    }

    /// One escalation with its task and run history.
    pub async fn get_escalation(&self, id: Uuid) -> HiveResult<Option<EscalationReport>> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let escalation = {
                let mut stmt = tx.prepare_cached(&format!(
                    "SELECT {ESCALATION_COLUMNS} FROM escalations WHERE id = ?1"
                ))?;
                stmt.query_row(params![id.to_string()], escalation_from_row)
                    .optional()?
            };
            let report = match escalation {
                Some(escalation) => Some(report_for(&tx, escalation)?),
                None => None,
            };
            tx.commit()?;
            Ok(report)
        })
        .await
    }

    /// Mark an escalation as handled; returns `false` if it was unknown or
    /// already acknowledged.
    pub async fn acknowledge_escalation(&self, id: Uuid) -> HiveResult<bool> {
        let changed = self
            .with_conn(move |conn| {
                Ok(conn.execute(
                    "UPDATE escalations SET acknowledged_at = ?1 \
                     WHERE id = ?2 AND acknowledged_at IS NULL",
                    params![ts(now()), id.to_string()],
                )?)
            })
            .await?;
        if changed == 1 {
            info!(escalation_id = %id, "Escalation acknowledged");
        }
        Ok(changed == 1)
    }
}
