use crate::codec::{get_json, get_opt_ts, get_parsed, get_ts, get_u32, get_uuid, now, opt_ts, ts};
use crate::resolver::dependency_state;
use crate::store::TaskStore;
use chrono::{DateTime, Utc};
use hive_core::{
    capabilities_accept, HiveError, HiveResult, NewTask, Task, TaskPayload, TaskStatus,
};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, info};
use uuid::Uuid;

pub(crate) const TASK_COLUMNS: &str = "id, title, description, task_type, priority, status, \
     assignee, payload, required_phases, retry_count, not_before, failure_reason, \
     created_at, updated_at, assigned_at, completed_at";

pub(crate) fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: get_uuid(row, 0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        task_type: row.get(3)?,
        priority: row.get(4)?,
        status: get_parsed(row, 5)?,
        assignee: row.get(6)?,
        payload: get_json(row, 7)?,
        required_phases: get_json(row, 8)?,
        retry_count: get_u32(row, 9)?,
        not_before: get_opt_ts(row, 10)?,
        failure_reason: row.get(11)?,
        created_at: get_ts(row, 12)?,
        updated_at: get_ts(row, 13)?,
        assigned_at: get_opt_ts(row, 14)?,
        completed_at: get_opt_ts(row, 15)?,
    })
}

pub(crate) fn load_task(conn: &Connection, id: Uuid) -> HiveResult<Option<Task>> {
    let mut stmt = conn.prepare_cached(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"))?;
    Ok(stmt
        .query_row(params![id.to_string()], task_from_row)
        .optional()?)
}

pub(crate) fn require_task(conn: &Connection, id: Uuid) -> HiveResult<Task> {
    load_task(conn, id)?.ok_or_else(|| HiveError::NotFound(format!("task {id}")))
}

pub(crate) fn insert_task(conn: &Connection, task: &Task) -> HiveResult<()> {
    let parent_plan_id = task.parent_plan_id().map(|id| id.to_string());
    conn.execute(
        "INSERT INTO tasks (id, title, description, task_type, priority, status, assignee, \
         payload, parent_plan_id, subtask_id, required_phases, retry_count, not_before, \
         failure_reason, created_at, updated_at, assigned_at, completed_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
        params![
            task.id.to_string(),
            task.title,
            task.description,
            task.task_type,
            task.priority,
            task.status.as_str(),
            task.assignee,
            serde_json::to_string(&task.payload)?,
            parent_plan_id,
            task.subtask_id(),
            serde_json::to_string(&task.required_phases)?,
            task.retry_count,
            opt_ts(task.not_before),
            task.failure_reason,
            ts(task.created_at),
            ts(task.updated_at),
            opt_ts(task.assigned_at),
            opt_ts(task.completed_at),
        ],
    )?;
    Ok(())
}

/// How many queued tasks one claim reads per page.
const CLAIM_PAGE: i64 = 32;

/// One page of queued tasks past their backoff whose dependencies are all
/// completed, in dispatch order.
///
/// Readiness is pre-filtered in SQL so waiting dependents never reach the
/// claim loop; the resolver still confirms each candidate.
fn dispatchable_tasks(
    conn: &Connection,
    at: DateTime<Utc>,
    offset: i64,
) -> HiveResult<Vec<Task>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {TASK_COLUMNS} FROM tasks t \
         WHERE t.status = 'queued' AND (t.not_before IS NULL OR t.not_before <= ?1) \
         AND NOT EXISTS ( \
             SELECT 1 FROM json_each(t.payload, '$.dependencies') d \
             WHERE NOT EXISTS (SELECT 1 FROM tasks s \
                               WHERE s.parent_plan_id = t.parent_plan_id \
                               AND s.subtask_id = d.value AND s.status = 'completed')) \
         ORDER BY t.priority DESC, t.created_at ASC, t.rowid ASC LIMIT ?2 OFFSET ?3"
    ))?;
    let rows = stmt.query_map(params![ts(at), CLAIM_PAGE, offset], task_from_row)?;
    let mut tasks = Vec::new();
    for row in rows {
        tasks.push(row?);
    }
    Ok(tasks)
}

/// `queued` → `assigned`, only if the row is still queued. Returns whether
/// this caller won the row.
fn mark_assigned(
    conn: &Connection,
    task_id: Uuid,
    worker_id: &str,
    at: DateTime<Utc>,
) -> HiveResult<bool> {
    let changed = conn.execute(
        "UPDATE tasks SET status = 'assigned', assignee = ?1, assigned_at = ?2, updated_at = ?2 \
         WHERE id = ?3 AND status = 'queued'",
        params![worker_id, ts(at), task_id.to_string()],
    )?;
    Ok(changed == 1)
}

fn claim_next_task_tx(
    conn: &mut Connection,
    worker_id: &str,
    capabilities: &[String],
) -> HiveResult<Option<Task>> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let now = now();

    let mut offset = 0;
    loop {
        let page = dispatchable_tasks(&tx, now, offset)?;
        let exhausted = (page.len() as i64) < CLAIM_PAGE;
        offset += page.len() as i64;

        for candidate in page {
            if !capabilities_accept(capabilities, &candidate.task_type) {
                continue;
            }
            if !dependency_state(&tx, &candidate)?.is_ready() {
                continue;
            }
            if !mark_assigned(&tx, candidate.id, worker_id, now)? {
                debug!(task_id = %candidate.id, "Task claimed concurrently, trying next candidate");
                continue;
            }
            let claimed = require_task(&tx, candidate.id)?;
            tx.commit()?;
            info!(task_id = %claimed.id, worker_id, task_type = %claimed.task_type, "Task assigned");
            return Ok(Some(claimed));
        }

        if exhausted {
            break;
        }
    }

    tx.commit()?;
    Ok(None)
}

fn try_assign_task_tx(conn: &mut Connection, task_id: Uuid, worker_id: &str) -> HiveResult<Task> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let task = require_task(&tx, task_id)?;
    if task.status != TaskStatus::Queued {
        return Err(HiveError::AssignmentConflict(format!(
            "task {task_id} (status {})",
            task.status
        )));
    }
    if !dependency_state(&tx, &task)?.is_ready() {
        return Err(HiveError::InvalidTransition(format!(
            "task {task_id} has unfinished dependencies"
        )));
    }
    if !mark_assigned(&tx, task_id, worker_id, now())? {
        return Err(HiveError::AssignmentConflict(format!("task {task_id}")));
    }
    let claimed = require_task(&tx, task_id)?;
    tx.commit()?;
    Ok(claimed)
}

/// Cancel `task_id` if its status is still one of `from`.
pub(crate) fn cancel_where(
    conn: &Connection,
    task_id: Uuid,
    from: &[TaskStatus],
    reason: &str,
    at: DateTime<Utc>,
) -> HiveResult<bool> {
    let allowed: Vec<String> = from.iter().map(|s| format!("'{}'", s.as_str())).collect();
    let changed = conn.execute(
        &format!(
            "UPDATE tasks SET status = 'cancelled', failure_reason = ?1, completed_at = ?2, \
             updated_at = ?2 WHERE id = ?3 AND status IN ({})",
            allowed.join(", ")
        ),
        params![reason, ts(at), task_id.to_string()],
    )?;
    Ok(changed == 1)
}

fn cancel_task_tx(conn: &mut Connection, task_id: Uuid, reason: &str) -> HiveResult<Task> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let task = require_task(&tx, task_id)?;
    let live = [TaskStatus::Queued, TaskStatus::Assigned, TaskStatus::InProgress];
    if !cancel_where(&tx, task_id, &live, reason, now())? {
        return Err(HiveError::InvalidTransition(format!(
            "task {task_id} is already {}",
            task.status
        )));
    }
    let cancelled = require_task(&tx, task_id)?;
    tx.commit()?;
    Ok(cancelled)
}

impl TaskStore {
    /// Insert a standalone task in `queued`.
    pub async fn create_task(&self, new: NewTask) -> HiveResult<Task> {
        if new.phases.is_empty() {
            return Err(HiveError::InvalidPlan(format!(
                "task '{}' declares no phases",
                new.title
            )));
        }
        let now = now();
        let task = Task {
            id: Uuid::new_v4(),
            title: new.title,
            description: new.description,
            task_type: new.task_type,
            priority: new.priority,
            status: TaskStatus::Queued,
            assignee: None,
            payload: TaskPayload::Ordinary { params: new.params },
            required_phases: new.phases,
            retry_count: 0,
            not_before: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
            assigned_at: None,
            completed_at: None,
        };
        let task = self
            .with_conn(move |conn| {
                insert_task(conn, &task)?;
                Ok(task)
            })
            .await?;
        info!(task_id = %task.id, task_type = %task.task_type, "Task queued");
        Ok(task)
    }

    /// Look up a task by id.
    pub async fn get_task(&self, id: Uuid) -> HiveResult<Option<Task>> {
        self.with_conn(move |conn| load_task(conn, id)).await
    }

    /// Tasks in dispatch order, optionally restricted to one status.
    pub async fn list_tasks(&self, status: Option<TaskStatus>, limit: usize) -> HiveResult<Vec<Task>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE (?1 IS NULL OR status = ?1) \
                 ORDER BY priority DESC, created_at ASC, rowid ASC LIMIT ?2"
            ))?;
            let rows = stmt.query_map(params![status.map(|s| s.as_str()), limit], task_from_row)?;
            let mut tasks = Vec::new();
            for row in rows {
                tasks.push(row?);
            }
            Ok(tasks)
        })
        .await
    }

    /// Claim the best dispatchable task for a worker.
    ///
    /// Candidates are `queued` tasks past their backoff whose type the
    /// capabilities accept and whose dependencies are all completed, ordered
    /// by priority then age. The readiness check and the conditional update
    /// share one transaction; a candidate lost to another dispatcher is
    /// skipped in favour of the next one.
    pub async fn claim_next_task(
        &self,
        worker_id: &str,
        capabilities: &[String],
    ) -> HiveResult<Option<Task>> {
        let worker_id = worker_id.to_string();
        let capabilities = capabilities.to_vec();
        self.with_conn(move |conn| claim_next_task_tx(conn, &worker_id, &capabilities))
            .await
    }

    /// Claim one specific task. Fails with [`HiveError::AssignmentConflict`]
    /// when the task is no longer queued.
    pub async fn try_assign_task(&self, task_id: Uuid, worker_id: &str) -> HiveResult<Task> {
        let worker_id = worker_id.to_string();
        self.with_conn(move |conn| try_assign_task_tx(conn, task_id, &worker_id))
            .await
    }

    /// Operator cancellation of a task that has not reached a terminal state.
    pub async fn cancel_task(&self, task_id: Uuid, reason: &str) -> HiveResult<Task> {
        let owned = reason.to_string();
        let task = self
            .with_conn(move |conn| cancel_task_tx(conn, task_id, &owned))
            .await?;
        info!(task_id = %task_id, reason, "Task cancelled");
        Ok(task)
    }

    /// Claimed tasks whose assignee has not heartbeated since `cutoff` (or
    /// has no worker row at all) and that were claimed before `cutoff`.
    pub async fn find_orphaned_tasks(&self, cutoff: DateTime<Utc>) -> HiveResult<Vec<Task>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks \
                 WHERE status IN ('assigned', 'in_progress') AND assigned_at < ?1 \
                 AND NOT EXISTS (SELECT 1 FROM workers w \
                                 WHERE w.id = tasks.assignee AND w.last_heartbeat >= ?1) \
                 ORDER BY assigned_at ASC"
            ))?;
            let rows = stmt.query_map(params![ts(cutoff)], task_from_row)?;
            let mut tasks = Vec::new();
            for row in rows {
                tasks.push(row?);
            }
            Ok(tasks)
        })
        .await
    }
}
