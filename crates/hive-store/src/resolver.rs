//! Dependency resolution for plan-generated tasks.
//!
//! A task is ready once every sibling it names in its dependency list is
//! `completed`. Ordinary tasks have no dependencies and are always ready.

use crate::codec::get_parsed;
use crate::store::TaskStore;
use crate::tasks::load_task;
use hive_core::{HiveError, HiveResult, Task, TaskStatus};
use rusqlite::{params, Connection};
use serde::Serialize;
use std::collections::HashMap;
use uuid::Uuid;

/// Whether a task's dependencies allow it to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DependencyState {
    /// Every dependency is completed.
    Ready,
    /// Some dependencies have not finished yet.
    Waiting { pending: Vec<String> },
    /// A dependency failed or was cancelled; the task can never become ready.
    Blocked { failed: Vec<String> },
}

impl DependencyState {
    /// Every dependency is completed.
    pub fn is_ready(&self) -> bool {
        matches!(self, DependencyState::Ready)
    }

    /// A dependency can never complete.
    pub fn is_blocked(&self) -> bool {
        matches!(self, DependencyState::Blocked { .. })
    }
}

/// Evaluate `task` against the statuses of its plan siblings.
///
/// A dependency naming a sibling absent from `siblings` means the plan's rows
/// are inconsistent and is reported as [`HiveError::StoreCorruption`].
pub fn evaluate_dependencies(
    task: &Task,
    siblings: &HashMap<String, TaskStatus>,
) -> HiveResult<DependencyState> {
    let mut pending = Vec::new();
    let mut failed = Vec::new();

    for dep in task.dependencies() {
        match siblings.get(dep) {
            Some(TaskStatus::Completed) => {}
            Some(TaskStatus::Failed) | Some(TaskStatus::Cancelled) => failed.push(dep.clone()),
            Some(_) => pending.push(dep.clone()),
            None => {
                return Err(HiveError::StoreCorruption(format!(
                    "task {} depends on unknown sibling '{dep}'",
                    task.id
                )))
            }
        }
    }

    if !failed.is_empty() {
        Ok(DependencyState::Blocked { failed })
    } else if !pending.is_empty() {
        Ok(DependencyState::Waiting { pending })
    } else {
        Ok(DependencyState::Ready)
    }
}

/// Subtask id → status for every task of `plan_id`.
pub(crate) fn sibling_statuses(
    conn: &Connection,
    plan_id: Uuid,
) -> HiveResult<HashMap<String, TaskStatus>> {
    let mut stmt =
        conn.prepare_cached("SELECT subtask_id, status FROM tasks WHERE parent_plan_id = ?1")?;
    let rows = stmt.query_map(params![plan_id.to_string()], |row| {
        Ok((row.get::<_, String>(0)?, get_parsed::<TaskStatus>(row, 1)?))
    })?;
    let mut statuses = HashMap::new();
    for row in rows {
        let (subtask_id, status) = row?;
        statuses.insert(subtask_id, status);
    }
    Ok(statuses)
}

/// Resolve `task` with one query over its siblings. Call inside the same
/// transaction as any state change that depends on the answer.
pub(crate) fn dependency_state(conn: &Connection, task: &Task) -> HiveResult<DependencyState> {
    match task.parent_plan_id() {
        Some(plan_id) if !task.dependencies().is_empty() => {
            let siblings = sibling_statuses(conn, plan_id)?;
            evaluate_dependencies(task, &siblings)
        }
        _ => Ok(DependencyState::Ready),
    }
}

impl TaskStore {
    /// Dependency state of a task, read from a consistent snapshot.
    pub async fn dependency_state(&self, task_id: Uuid) -> HiveResult<DependencyState> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let task = load_task(&tx, task_id)?
                .ok_or_else(|| HiveError::NotFound(format!("task {task_id}")))?;
            let state = dependency_state(&tx, &task)?;
            tx.commit()?;
            Ok(state)
        })
        .await
    }

    /// Whether every dependency of the task is `completed`.
    pub async fn is_ready(&self, task_id: Uuid) -> HiveResult<bool> {
        Ok(self.dependency_state(task_id).await?.is_ready())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use hive_core::{Phase, PlanStepPayload, TaskPayload};

    fn step(subtask_id: &str, deps: &[&str]) -> Task {
        let now = Utc::now();
        Task {
            id: Uuid::new_v4(),
            title: subtask_id.to_string(),
            description: String::new(),
            task_type: "general".into(),
            priority: 0,
            status: TaskStatus::Queued,
            assignee: None,
            payload: TaskPayload::PlanStep(PlanStepPayload {
                parent_plan_id: Uuid::nil(),
                subtask_id: subtask_id.to_string(),
                dependencies: deps.iter().map(|d| d.to_string()).collect(),
                params: serde_json::Value::Null,
            }),
            required_phases: vec![Phase::Execute],
            retry_count: 0,
            not_before: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
            assigned_at: None,
            completed_at: None,
        }
    }

    fn statuses(pairs: &[(&str, TaskStatus)]) -> HashMap<String, TaskStatus> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_no_dependencies_is_ready() {
        let task = step("a", &[]);
        let state = evaluate_dependencies(&task, &HashMap::new()).unwrap();
        assert_eq!(state, DependencyState::Ready);
    }

    #[test]
    fn test_waiting_lists_unfinished() {
        let task = step("c", &["a", "b"]);
        let siblings = statuses(&[
            ("a", TaskStatus::Completed),
            ("b", TaskStatus::InProgress),
            ("c", TaskStatus::Queued),
        ]);
        let state = evaluate_dependencies(&task, &siblings).unwrap();
        assert_eq!(
            state,
            DependencyState::Waiting {
                pending: vec!["b".into()]
            }
        );
    }

    #[test]
    fn test_failed_dependency_blocks() {
        let task = step("c", &["a", "b"]);
        let siblings = statuses(&[("a", TaskStatus::Cancelled), ("b", TaskStatus::Queued)]);
        let state = evaluate_dependencies(&task, &siblings).unwrap();
        assert!(state.is_blocked());
    }

    #[test]
    fn test_all_completed_is_ready() {
        let task = step("c", &["a", "b"]);
        let siblings = statuses(&[("a", TaskStatus::Completed), ("b", TaskStatus::Completed)]);
        assert!(evaluate_dependencies(&task, &siblings).unwrap().is_ready());
    }

    #[test]
    fn test_unknown_dependency_is_corruption() {
        let task = step("c", &["ghost"]);
        let err = evaluate_dependencies(&task, &HashMap::new()).unwrap_err();
        assert!(err.is_fatal());
    }
}
