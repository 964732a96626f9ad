use crate::codec::{get_json, get_opt_ts, get_parsed, get_ts, get_uuid, now, ts};
use crate::planning::{ensure_held_by, require_planning_request};
use crate::resolver::{evaluate_dependencies, sibling_statuses, DependencyState};
use crate::store::TaskStore;
use crate::tasks::{cancel_where, insert_task, task_from_row, TASK_COLUMNS};
use chrono::{DateTime, Utc};
use hive_core::{
    ExecutionPlan, HiveError, HiveResult, PlanData, PlanDraft, PlanReport, PlanStatus,
    PlanStepPayload, SavedPlan, SubTaskSpec, Task, TaskPayload, TaskStatus,
};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use std::collections::{BTreeSet, HashMap};
use tracing::{info, warn};
use uuid::Uuid;

const PLAN_COLUMNS: &str =
    "id, planning_request_id, plan_data, status, failure_reason, generated_at, completed_at";

/// Attempts per sub-task insert before the sub-task is omitted.
const SUBTASK_INSERT_ATTEMPTS: u32 = 3;

fn plan_from_row(row: &Row<'_>) -> rusqlite::Result<ExecutionPlan> {
    Ok(ExecutionPlan {
        id: get_uuid(row, 0)?,
        planning_request_id: get_uuid(row, 1)?,
        plan_data: get_json(row, 2)?,
        status: get_parsed(row, 3)?,
        failure_reason: row.get(4)?,
        generated_at: get_ts(row, 5)?,
        completed_at: get_opt_ts(row, 6)?,
    })
}

pub(crate) fn load_plan(conn: &Connection, id: Uuid) -> HiveResult<Option<ExecutionPlan>> {
    let mut stmt =
        conn.prepare_cached(&format!("SELECT {PLAN_COLUMNS} FROM execution_plans WHERE id = ?1"))?;
    Ok(stmt
        .query_row(params![id.to_string()], plan_from_row)
        .optional()?)
}

fn require_plan(conn: &Connection, id: Uuid) -> HiveResult<ExecutionPlan> {
    load_plan(conn, id)?.ok_or_else(|| HiveError::NotFound(format!("execution plan {id}")))
}

/// Tasks of a plan in creation order.
pub(crate) fn plan_tasks(conn: &Connection, plan_id: Uuid) -> HiveResult<Vec<Task>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {TASK_COLUMNS} FROM tasks WHERE parent_plan_id = ?1 ORDER BY created_at ASC, rowid ASC"
    ))?;
    let rows = stmt.query_map(params![plan_id.to_string()], task_from_row)?;
    let mut tasks = Vec::new();
    for row in rows {
        tasks.push(row?);
    }
    Ok(tasks)
}

/// Check a draft and return its steps in dependency order.
///
/// Rejects empty or duplicate subtask ids, dependencies that name no sibling
/// (or the step itself), steps without phases and dependency cycles.
pub fn validate_draft(draft: &PlanDraft) -> HiveResult<Vec<&SubTaskSpec>> {
    let mut by_id: HashMap<&str, &SubTaskSpec> = HashMap::new();
    for step in &draft.steps {
        if step.subtask_id.trim().is_empty() {
            return Err(HiveError::InvalidPlan("empty subtask id".to_string()));
        }
        if step.phases.is_empty() {
            return Err(HiveError::InvalidPlan(format!(
                "subtask '{}' declares no phases",
                step.subtask_id
            )));
        }
        if by_id.insert(step.subtask_id.as_str(), step).is_some() {
            return Err(HiveError::InvalidPlan(format!(
                "duplicate subtask id '{}'",
                step.subtask_id
            )));
        }
    }

    for step in &draft.steps {
        for dep in &step.dependencies {
            if dep == &step.subtask_id {
                return Err(HiveError::InvalidPlan(format!(
                    "subtask '{dep}' depends on itself"
                )));
            }
            if !by_id.contains_key(dep.as_str()) {
                return Err(HiveError::InvalidPlan(format!(
                    "subtask '{}' depends on unknown subtask '{dep}'",
                    step.subtask_id
                )));
            }
        }
    }

    // 1 = on the DFS stack, 2 = emitted.
    let mut marks: HashMap<&str, u8> = HashMap::new();
    let mut order = Vec::with_capacity(draft.steps.len());
    for step in &draft.steps {
        visit(step, &by_id, &mut marks, &mut order)?;
    }
    Ok(order)
}

fn visit<'a>(
    step: &'a SubTaskSpec,
    by_id: &HashMap<&str, &'a SubTaskSpec>,
    marks: &mut HashMap<&'a str, u8>,
    order: &mut Vec<&'a SubTaskSpec>,
) -> HiveResult<()> {
    match marks.get(step.subtask_id.as_str()) {
        Some(2) => return Ok(()),
        Some(_) => {
            return Err(HiveError::InvalidPlan(format!(
                "dependency cycle through subtask '{}'",
                step.subtask_id
            )))
        }
        None => {}
    }
    marks.insert(step.subtask_id.as_str(), 1);
    for dep in &step.dependencies {
        if let Some(dep_step) = by_id.get(dep.as_str()) {
            visit(dep_step, by_id, marks, order)?;
        }
    }
    marks.insert(step.subtask_id.as_str(), 2);
    order.push(step);
    Ok(())
}

fn step_task(plan_id: Uuid, step: &SubTaskSpec, at: DateTime<Utc>) -> Task {
    Task {
        id: Uuid::new_v4(),
        title: step.title.clone(),
        description: step.description.clone(),
        task_type: step.task_type.clone(),
        priority: step.priority,
        status: TaskStatus::Queued,
        assignee: None,
        payload: TaskPayload::PlanStep(PlanStepPayload {
            parent_plan_id: plan_id,
            subtask_id: step.subtask_id.clone(),
            dependencies: step.dependencies.clone(),
            params: step.params.clone(),
        }),
        required_phases: step.phases.clone(),
        retry_count: 0,
        not_before: None,
        failure_reason: None,
        created_at: at,
        updated_at: at,
        assigned_at: None,
        completed_at: None,
    }
}

/// Insert one sub-task under a savepoint, retrying a bounded number of times.
fn insert_step(tx: &mut Transaction<'_>, task: &Task) -> HiveResult<()> {
    let mut last_error = None;
    for attempt in 1..=SUBTASK_INSERT_ATTEMPTS {
        let sp = tx.savepoint()?;
        match insert_task(&sp, task) {
            Ok(()) => {
                sp.commit()?;
                return Ok(());
            }
            Err(e) => {
                warn!(
                    subtask_id = task.subtask_id().unwrap_or_default(),
                    attempt,
                    error = %e,
                    "Sub-task insert failed"
                );
                last_error = Some(e);
                // Dropping the savepoint rolls the attempt back.
            }
        }
    }
    Err(last_error.unwrap_or_else(|| HiveError::Store("sub-task insert failed".to_string())))
}

fn save_plan_tx(
    conn: &mut Connection,
    request_id: Uuid,
    agent: &str,
    draft: &PlanDraft,
) -> HiveResult<SavedPlan> {
    let ordered = validate_draft(draft)?;

    let mut tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let request = require_planning_request(&tx, request_id)?;
    ensure_held_by(&request, agent)?;

    let plan_id = Uuid::new_v4();
    let now = now();
    tx.execute(
        "INSERT INTO execution_plans (id, planning_request_id, plan_data, status, generated_at) \
         VALUES (?1, ?2, ?3, 'generated', ?4)",
        params![
            plan_id.to_string(),
            request_id.to_string(),
            serde_json::to_string(&PlanData::default())?,
            ts(now),
        ],
    )?;

    let mut omitted: BTreeSet<&str> = BTreeSet::new();
    let mut tasks = Vec::with_capacity(ordered.len());
    for step in ordered {
        if let Some(dep) = step
            .dependencies
            .iter()
            .find(|d| omitted.contains(d.as_str()))
        {
            warn!(
                subtask_id = %step.subtask_id,
                dependency = %dep,
                "Omitting sub-task whose dependency was omitted"
            );
            omitted.insert(step.subtask_id.as_str());
            continue;
        }
        let task = step_task(plan_id, step, now);
        match insert_step(&mut tx, &task) {
            Ok(()) => tasks.push(task),
            Err(e) => {
                warn!(subtask_id = %step.subtask_id, error = %e, "Omitting sub-task");
                omitted.insert(step.subtask_id.as_str());
            }
        }
    }

    let plan_data = PlanData {
        summary: draft.summary.clone(),
        steps: draft
            .steps
            .iter()
            .filter(|s| !omitted.contains(s.subtask_id.as_str()))
            .cloned()
            .collect(),
        omitted: omitted.iter().map(|s| s.to_string()).collect(),
    };
    tx.execute(
        "UPDATE execution_plans SET plan_data = ?1 WHERE id = ?2",
        params![serde_json::to_string(&plan_data)?, plan_id.to_string()],
    )?;
    tx.execute(
        "UPDATE planning_queue SET status = 'planned', completed_at = ?1 \
         WHERE id = ?2 AND status = 'assigned' AND assigned_agent = ?3",
        params![ts(now), request_id.to_string(), agent],
    )?;

    let plan = require_plan(&tx, plan_id)?;
    tx.commit()?;

    // Present tasks in declaration order rather than insertion order.
    let position: HashMap<&str, usize> = draft
        .steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.subtask_id.as_str(), i))
        .collect();
    tasks.sort_by_key(|t| t.subtask_id().and_then(|id| position.get(id)).copied());

    Ok(SavedPlan {
        plan,
        tasks,
        omitted: plan_data.omitted,
    })
}

fn transition_plan_tx(
    conn: &Connection,
    plan_id: Uuid,
    from: PlanStatus,
    to: PlanStatus,
    reason: Option<&str>,
) -> HiveResult<bool> {
    let completed_at = to.is_terminal().then(|| ts(now()));
    let changed = conn.execute(
        "UPDATE execution_plans SET status = ?1, failure_reason = COALESCE(?2, failure_reason), \
         completed_at = COALESCE(?3, completed_at) WHERE id = ?4 AND status = ?5",
        params![
            to.as_str(),
            reason,
            completed_at,
            plan_id.to_string(),
            from.as_str()
        ],
    )?;
    Ok(changed == 1)
}

/// Cancel queued tasks of the plan whose dependencies can no longer complete,
/// repeating until no further task becomes blocked.
fn cancel_blocked_tx(conn: &mut Connection, plan_id: Uuid) -> HiveResult<Vec<Uuid>> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let now = now();
    let mut cancelled = Vec::new();
    loop {
        let statuses = sibling_statuses(&tx, plan_id)?;
        let mut progressed = false;
        for task in plan_tasks(&tx, plan_id)? {
            if task.status != TaskStatus::Queued {
                continue;
            }
            if let DependencyState::Blocked { failed } =
                evaluate_dependencies(&task, &statuses)?
            {
                let reason = format!("dependency not satisfiable: {}", failed.join(", "));
                if cancel_where(&tx, task.id, &[TaskStatus::Queued], &reason, now)? {
                    info!(task_id = %task.id, plan_id = %plan_id, %reason, "Cancelled blocked task");
                    cancelled.push(task.id);
                    progressed = true;
                }
            }
        }
        if !progressed {
            break;
        }
    }
    tx.commit()?;
    Ok(cancelled)
}

fn cancel_queued_tx(conn: &mut Connection, plan_id: Uuid, reason: &str) -> HiveResult<Vec<Uuid>> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let now = now();
    let mut cancelled = Vec::new();
    for task in plan_tasks(&tx, plan_id)? {
        if task.status == TaskStatus::Queued
            && cancel_where(&tx, task.id, &[TaskStatus::Queued], reason, now)?
        {
            cancelled.push(task.id);
        }
    }
    tx.commit()?;
    Ok(cancelled)
}

impl TaskStore {
    /// Persist a plan for a request held by `agent`.
    ///
    /// The draft is validated first; nothing is written for an invalid draft.
    /// The plan row, every sub-task and the request's move to `planned` are
    /// one transaction. A sub-task whose insert keeps failing is omitted
    /// together with everything that depends on it, and recorded in
    /// `plan_data.omitted`.
    pub async fn save_execution_plan(
        &self,
        request_id: Uuid,
        agent: &str,
        draft: &PlanDraft,
    ) -> HiveResult<SavedPlan> {
        let (agent, draft) = (agent.to_string(), draft.clone());
        let saved = self
            .with_conn(move |conn| save_plan_tx(conn, request_id, &agent, &draft))
            .await?;
        info!(
            plan_id = %saved.plan.id,
            request_id = %request_id,
            tasks = saved.tasks.len(),
            omitted = saved.omitted.len(),
            "Execution plan saved"
        );
        Ok(saved)
    }

    /// Look up a plan by id.
    pub async fn get_execution_plan(&self, id: Uuid) -> HiveResult<Option<ExecutionPlan>> {
        self.with_conn(move |conn| load_plan(conn, id)).await
    }

    /// The plan generated for a planning request, if any.
    pub async fn get_plan_for_request(&self, request_id: Uuid) -> HiveResult<Option<ExecutionPlan>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {PLAN_COLUMNS} FROM execution_plans WHERE planning_request_id = ?1"
            ))?;
            Ok(stmt
                .query_row(params![request_id.to_string()], plan_from_row)
                .optional()?)
        })
        .await
    }

    /// Plans in any of `statuses` (every plan when empty), oldest first.
    pub async fn list_plans(&self, statuses: &[PlanStatus]) -> HiveResult<Vec<ExecutionPlan>> {
        let wanted: Vec<&'static str> = statuses.iter().map(|s| s.as_str()).collect();
        self.with_conn(move |conn| {
            let filter = if wanted.is_empty() {
                String::new()
            } else {
                let slots: Vec<String> = (1..=wanted.len()).map(|i| format!("?{i}")).collect();
                format!("WHERE status IN ({}) ", slots.join(", "))
            };
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {PLAN_COLUMNS} FROM execution_plans {filter}\
                 ORDER BY generated_at ASC, rowid ASC"
            ))?;
            let rows = stmt.query_map(rusqlite::params_from_iter(wanted.iter()), plan_from_row)?;
            let mut plans = Vec::new();
            for row in rows {
                plans.push(row?);
            }
            Ok(plans)
        })
        .await
    }

    /// Tasks of a plan in creation order.
    pub async fn tasks_for_plan(&self, plan_id: Uuid) -> HiveResult<Vec<Task>> {
        self.with_conn(move |conn| plan_tasks(conn, plan_id)).await
    }

    /// Move a plan from `from` to `to`; returns `false` if the plan was no
    /// longer in `from`.
    pub async fn transition_plan(
        &self,
        plan_id: Uuid,
        from: PlanStatus,
        to: PlanStatus,
        reason: Option<&str>,
    ) -> HiveResult<bool> {
        let reason = reason.map(str::to_string);
        let moved = self
            .with_conn(move |conn| transition_plan_tx(conn, plan_id, from, to, reason.as_deref()))
            .await?;
        if moved {
            info!(plan_id = %plan_id, from = %from, to = %to, "Plan status changed");
        }
        Ok(moved)
    }

    /// The plan, all its tasks, and the tasks that are not completed.
    pub async fn plan_report(&self, plan_id: Uuid) -> HiveResult<PlanReport> {
        let (plan, tasks) = self
            .with_conn(move |conn| {
                let tx = conn.transaction()?;
                let plan = require_plan(&tx, plan_id)?;
                let tasks = plan_tasks(&tx, plan_id)?;
                tx.commit()?;
                Ok((plan, tasks))
            })
            .await?;
        let blocking = tasks
            .iter()
            .filter(|t| t.status != TaskStatus::Completed)
            .cloned()
            .collect();
        Ok(PlanReport {
            plan,
            tasks,
            blocking,
        })
    }

    /// Cancel queued tasks whose dependency chain contains a failed or
    /// cancelled task.
    pub async fn cancel_blocked_tasks(&self, plan_id: Uuid) -> HiveResult<Vec<Uuid>> {
        self.with_conn(move |conn| cancel_blocked_tx(conn, plan_id))
            .await
    }

    /// Cancel every still-queued task of the plan.
    pub async fn cancel_queued_tasks(&self, plan_id: Uuid, reason: &str) -> HiveResult<Vec<Uuid>> {
        let owned = reason.to_string();
        let cancelled = self
            .with_conn(move |conn| cancel_queued_tx(conn, plan_id, &owned))
            .await?;
        if !cancelled.is_empty() {
            info!(plan_id = %plan_id, count = cancelled.len(), reason, "Cancelled queued plan tasks");
        }
        Ok(cancelled)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn draft(steps: Vec<SubTaskSpec>) -> PlanDraft {
        PlanDraft::new("test plan", steps)
    }

    #[test]
    fn test_order_puts_dependencies_first() {
        let d = draft(vec![
            SubTaskSpec::new("c", "C").with_dependencies(["a", "b"]),
            SubTaskSpec::new("a", "A"),
            SubTaskSpec::new("b", "B").with_dependencies(["a"]),
        ]);
        let order: Vec<&str> = validate_draft(&d)
            .unwrap()
            .iter()
            .map(|s| s.subtask_id.as_str())
            .collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_cycle_rejected() {
        let d = draft(vec![
            SubTaskSpec::new("a", "A").with_dependencies(["c"]),
            SubTaskSpec::new("b", "B").with_dependencies(["a"]),
            SubTaskSpec::new("c", "C").with_dependencies(["b"]),
        ]);
        let err = validate_draft(&d).unwrap_err();
        assert!(matches!(err, HiveError::InvalidPlan(msg) if msg.contains("cycle")));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let d = draft(vec![SubTaskSpec::new("a", "A").with_dependencies(["z"])]);
        assert!(matches!(validate_draft(&d), Err(HiveError::InvalidPlan(_))));
    }

    #[test]
    fn test_duplicate_and_self_dependency_rejected() {
        let dup = draft(vec![SubTaskSpec::new("a", "A"), SubTaskSpec::new("a", "A2")]);
        assert!(validate_draft(&dup).is_err());
        let selfish = draft(vec![SubTaskSpec::new("a", "A").with_dependencies(["a"])]);
        assert!(validate_draft(&selfish).is_err());
    }

    #[test]
    fn test_empty_phases_rejected() {
        let d = draft(vec![SubTaskSpec::new("a", "A").with_phases(vec![])]);
        assert!(validate_draft(&d).is_err());
    }

    #[test]
    fn test_empty_draft_is_valid() {
        assert!(validate_draft(&draft(vec![])).unwrap().is_empty());
    }
}
