use crate::codec::{get_opt_json, get_opt_ts, get_parsed, get_ts, get_u32, get_uuid, now, ts};
use crate::escalations::insert_escalation;
use crate::resolver::dependency_state;
use crate::store::TaskStore;
use crate::tasks::require_task;
use chrono::{DateTime, Utc};
use hive_core::{
    Escalation, HiveError, HiveResult, Phase, Run, RunResult, RunStatus, Task, TaskTransition,
};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

const RUN_COLUMNS: &str =
    "id, task_id, worker_id, phase, status, attempt, result, started_at, finished_at";

/// What a worker reports about one phase of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    /// Task the run belongs to.
    pub task_id: Uuid,
    /// Reporting worker; must be the task's assignee.
    pub worker_id: String,
    /// Pipeline phase the run executed.
    pub phase: Phase,
    /// Outcome of the run.
    pub status: RunStatus,
    /// Summary, output and failure details.
    #[serde(default)]
    pub result: Option<RunResult>,
}

impl RunReport {
    /// A successful run of `phase`.
    pub fn completed(
        task_id: Uuid,
        worker_id: impl Into<String>,
        phase: Phase,
        result: RunResult,
    ) -> Self {
        Self {
            task_id,
            worker_id: worker_id.into(),
            phase,
            status: RunStatus::Completed,
            result: Some(result),
        }
    }

    /// A failed run of `phase`.
    pub fn failed(
        task_id: Uuid,
        worker_id: impl Into<String>,
        phase: Phase,
        result: RunResult,
    ) -> Self {
        Self {
            task_id,
            worker_id: worker_id.into(),
            phase,
            status: RunStatus::Failed,
            result: Some(result),
        }
    }
}

/// Everything `record_run` changed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunOutcome {
    /// The recorded run.
    pub run: Run,
    /// The task after the transition was applied.
    pub task: Task,
    /// The transition the decision function picked.
    pub transition: TaskTransition,
    /// Written when the task failed for good.
    pub escalation: Option<Escalation>,
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<Run> {
    Ok(Run {
        id: get_uuid(row, 0)?,
        task_id: get_uuid(row, 1)?,
        worker_id: row.get(2)?,
        phase: get_parsed(row, 3)?,
        status: get_parsed(row, 4)?,
        attempt: get_u32(row, 5)?,
        result: get_opt_json(row, 6)?,
        started_at: get_ts(row, 7)?,
        finished_at: get_opt_ts(row, 8)?,
    })
}

/// All runs of a task, oldest first.
pub(crate) fn task_runs(conn: &Connection, task_id: Uuid) -> HiveResult<Vec<Run>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {RUN_COLUMNS} FROM runs WHERE task_id = ?1 ORDER BY started_at ASC, rowid ASC"
    ))?;
    let rows = stmt.query_map(params![task_id.to_string()], run_from_row)?;
    let mut runs = Vec::new();
    for row in rows {
        runs.push(row?);
    }
    Ok(runs)
}

fn open_run(
    conn: &Connection,
    task_id: Uuid,
    phase: Phase,
    attempt: u32,
) -> HiveResult<Option<Run>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {RUN_COLUMNS} FROM runs \
         WHERE task_id = ?1 AND phase = ?2 AND attempt = ?3 AND status = 'running' \
         ORDER BY started_at DESC, rowid DESC LIMIT 1"
    ))?;
    Ok(stmt
        .query_row(
            params![task_id.to_string(), phase.as_str(), attempt],
            run_from_row,
        )
        .optional()?)
}

fn insert_run(conn: &Connection, run: &Run) -> HiveResult<()> {
    let result = run.result.as_ref().map(serde_json::to_string).transpose()?;
    conn.execute(
        "INSERT INTO runs (id, task_id, worker_id, phase, status, attempt, result, started_at, finished_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            run.id.to_string(),
            run.task_id.to_string(),
            run.worker_id,
            run.phase.as_str(),
            run.status.as_str(),
            run.attempt,
            result,
            ts(run.started_at),
            run.finished_at.map(ts),
        ],
    )?;
    Ok(())
}

fn finish_run(
    conn: &Connection,
    run: &mut Run,
    status: RunStatus,
    result: Option<RunResult>,
    at: DateTime<Utc>,
) -> HiveResult<()> {
    let encoded = result.as_ref().map(serde_json::to_string).transpose()?;
    conn.execute(
        "UPDATE runs SET status = ?1, result = ?2, finished_at = ?3 WHERE id = ?4 AND status = 'running'",
        params![status.as_str(), encoded, ts(at), run.id.to_string()],
    )?;
    run.status = status;
    run.result = result;
    run.finished_at = Some(at);
    Ok(())
}

fn new_run(
    task: &Task,
    worker_id: &str,
    phase: Phase,
    status: RunStatus,
    result: Option<RunResult>,
    at: DateTime<Utc>,
) -> Run {
    Run {
        id: Uuid::new_v4(),
        task_id: task.id,
        worker_id: worker_id.to_string(),
        phase,
        status,
        attempt: task.retry_count,
        result,
        started_at: at,
        finished_at: status.is_terminal().then_some(at),
    }
}

fn ensure_holder(task: &Task, worker_id: &str) -> HiveResult<()> {
    if !task.status.is_claimed() || task.assignee.as_deref() != Some(worker_id) {
        return Err(HiveError::InvalidTransition(format!(
            "task {} is {} (assignee {:?}), not held by '{worker_id}'",
            task.id, task.status, task.assignee
        )));
    }
    Ok(())
}

fn mark_in_progress(conn: &Connection, task_id: Uuid, at: DateTime<Utc>) -> HiveResult<()> {
    conn.execute(
        "UPDATE tasks SET status = 'in_progress', updated_at = ?1 WHERE id = ?2 AND status = 'assigned'",
        params![ts(at), task_id.to_string()],
    )?;
    Ok(())
}

fn begin_run_tx(
    conn: &mut Connection,
    task_id: Uuid,
    worker_id: &str,
    phase: Phase,
) -> HiveResult<Run> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let task = require_task(&tx, task_id)?;
    ensure_holder(&task, worker_id)?;
    if !task.required_phases.contains(&phase) {
        return Err(HiveError::InvalidTransition(format!(
            "phase {phase} is not required by task {task_id}"
        )));
    }
    if !dependency_state(&tx, &task)?.is_ready() {
        return Err(HiveError::InvalidTransition(format!(
            "task {task_id} has unfinished dependencies"
        )));
    }
    if let Some(existing) = open_run(&tx, task_id, phase, task.retry_count)? {
        tx.commit()?;
        return Ok(existing);
    }

    let now = now();
    mark_in_progress(&tx, task_id, now)?;
    let run = new_run(&task, worker_id, phase, RunStatus::Running, None, now);
    insert_run(&tx, &run)?;
    tx.commit()?;
    Ok(run)
}

/// Runs of other phases left `running` when the attempt ends.
fn close_open_runs(conn: &Connection, task_id: Uuid, at: DateTime<Utc>) -> HiveResult<()> {
    let result = serde_json::to_string(&RunResult::failure("attempt ended"))?;
    let closed = conn.execute(
        "UPDATE runs SET status = 'failed', result = ?1, finished_at = ?2 \
         WHERE task_id = ?3 AND status = 'running'",
        params![result, ts(at), task_id.to_string()],
    )?;
    if closed > 0 {
        debug!(task_id = %task_id, closed, "Closed runs left open by the ended attempt");
    }
    Ok(())
}

/// Apply `transition` to a task that is still held by a worker.
fn apply_transition(
    conn: &Connection,
    task: &Task,
    transition: &TaskTransition,
    history: &[Run],
    at: DateTime<Utc>,
) -> HiveResult<Option<Escalation>> {
    let id = task.id.to_string();
    let changed = match transition {
        TaskTransition::Stay => return Ok(None),
        TaskTransition::Complete => conn.execute(
            "UPDATE tasks SET status = 'completed', completed_at = ?1, updated_at = ?1 \
             WHERE id = ?2 AND status IN ('assigned', 'in_progress')",
            params![ts(at), id],
        )?,
        TaskTransition::Requeue { not_before } => {
            let last_error = history.iter().rev().find_map(|r| r.failure_reason());
            conn.execute(
                "UPDATE tasks SET status = 'queued', assignee = NULL, assigned_at = NULL, \
                 retry_count = retry_count + 1, not_before = ?1, failure_reason = ?2, updated_at = ?3 \
                 WHERE id = ?4 AND status IN ('assigned', 'in_progress') AND retry_count = ?5",
                params![not_before.map(ts), last_error, ts(at), id, task.retry_count],
            )?
        }
        TaskTransition::Fail { reason, .. } => conn.execute(
            "UPDATE tasks SET status = 'failed', failure_reason = ?1, completed_at = ?2, updated_at = ?2 \
             WHERE id = ?3 AND status IN ('assigned', 'in_progress')",
            params![reason, ts(at), id],
        )?,
    };

    if changed != 1 {
        return Err(HiveError::InvalidTransition(format!(
            "task {} changed concurrently while applying {transition:?}",
            task.id
        )));
    }

    if matches!(
        transition,
        TaskTransition::Requeue { .. } | TaskTransition::Fail { .. }
    ) {
        close_open_runs(conn, task.id, at)?;
    }

    match transition {
        TaskTransition::Fail {
            reason,
            escalate: true,
        } => {
            let run_ids = history.iter().map(|r| r.id).collect();
            Ok(Some(insert_escalation(conn, task.id, reason, run_ids, at)?))
        }
        _ => Ok(None),
    }
}

fn record_run_tx<F>(conn: &mut Connection, report: RunReport, decide: F) -> HiveResult<RunOutcome>
where
    F: FnOnce(&Task, &Run, &[Run]) -> TaskTransition,
{
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let task = require_task(&tx, report.task_id)?;
    let now = now();

    // Late reports for finished tasks are kept for the audit trail only.
    if task.status.is_terminal() {
        let run = new_run(&task, &report.worker_id, report.phase, report.status, report.result, now);
        insert_run(&tx, &run)?;
        tx.commit()?;
        warn!(
            task_id = %task.id,
            status = %task.status,
            worker_id = %report.worker_id,
            "Run reported for a finished task; recorded without state change"
        );
        return Ok(RunOutcome {
            run,
            task,
            transition: TaskTransition::Stay,
            escalation: None,
        });
    }

    ensure_holder(&task, &report.worker_id)?;
    mark_in_progress(&tx, task.id, now)?;

    let run = match (open_run(&tx, task.id, report.phase, task.retry_count)?, report.status) {
        (Some(open), RunStatus::Running) => open,
        (Some(mut open), status) => {
            finish_run(&tx, &mut open, status, report.result, now)?;
            open
        }
        (None, status) => {
            let run = new_run(&task, &report.worker_id, report.phase, status, report.result, now);
            insert_run(&tx, &run)?;
            run
        }
    };

    let history = task_runs(&tx, task.id)?;
    let transition = decide(&task, &run, &history);
    let escalation = apply_transition(&tx, &task, &transition, &history, now)?;
    let task = require_task(&tx, task.id)?;
    tx.commit()?;

    Ok(RunOutcome {
        run,
        task,
        transition,
        escalation,
    })
}

impl TaskStore {
    /// Open a `running` run for the current attempt at `phase`.
    ///
    /// The worker must hold the task and every dependency must be completed.
    /// An existing open run for the same phase and attempt is returned as is.
    pub async fn begin_run(&self, task_id: Uuid, worker_id: &str, phase: Phase) -> HiveResult<Run> {
        let owned = worker_id.to_string();
        let run = self
            .with_conn(move |conn| begin_run_tx(conn, task_id, &owned, phase))
            .await?;
        info!(task_id = %task_id, worker_id, phase = %phase, attempt = run.attempt, "Run started");
        Ok(run)
    }

    /// Record a run and apply the transition `decide` picks, atomically.
    ///
    /// A terminal report closes the open run for the same phase and attempt,
    /// or inserts a finished run if none is open. `decide` sees the task as
    /// loaded before the change, the recorded run and the task's full run
    /// history. Reports for tasks that are already terminal are stored
    /// without any status change.
    pub async fn record_run<F>(&self, report: RunReport, decide: F) -> HiveResult<RunOutcome>
    where
        F: FnOnce(&Task, &Run, &[Run]) -> TaskTransition + Send + 'static,
    {
        let outcome = self
            .with_conn(move |conn| record_run_tx(conn, report, decide))
            .await?;
        match &outcome.transition {
            TaskTransition::Stay => {}
            TaskTransition::Complete => {
                info!(task_id = %outcome.task.id, "Task completed");
            }
            TaskTransition::Requeue { not_before } => {
                info!(
                    task_id = %outcome.task.id,
                    retry_count = outcome.task.retry_count,
                    not_before = ?not_before,
                    "Task re-queued for retry"
                );
            }
            TaskTransition::Fail { reason, escalate } => {
                warn!(task_id = %outcome.task.id, reason = %reason, escalate, "Task failed");
            }
        }
        Ok(outcome)
    }

    /// Every run of a task, oldest first.
    pub async fn list_runs(&self, task_id: Uuid) -> HiveResult<Vec<Run>> {
        self.with_conn(move |conn| task_runs(conn, task_id)).await
    }

    /// Look up a run by id.
    pub async fn get_run(&self, id: Uuid) -> HiveResult<Option<Run>> {
        self.with_conn(move |conn| {
            let mut stmt =
                conn.prepare_cached(&format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?1"))?;
            Ok(stmt
                .query_row(params![id.to_string()], run_from_row)
                .optional()?)
        })
        .await
    }
}

