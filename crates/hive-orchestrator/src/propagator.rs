//! Plan status propagation.
//!
//! [`evaluate`] derives a plan's status from its tasks; [`Propagator`] sweeps
//! live plans, cancels tasks stuck behind failed dependencies and applies the
//! verdicts with conditional updates.

use hive_core::{HiveResult, PlanFailurePolicy, PlanStatus, Task, TaskStatus};
use hive_store::TaskStore;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What a plan's tasks say about the plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum PlanVerdict {
    /// No task has started yet.
    Pending,
    /// Work is under way and the plan is not decided.
    Executing,
    /// Every task completed.
    Completed,
    /// The plan cannot complete.
    Failed {
        /// Tasks that were not completed.
        blocking: Vec<Uuid>,
    },
}

impl PlanVerdict {
    /// Completed or failed; no further sweep changes it.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PlanVerdict::Completed | PlanVerdict::Failed { .. })
    }
}

fn is_unsuccessful(status: TaskStatus) -> bool {
    matches!(status, TaskStatus::Failed | TaskStatus::Cancelled)
}

/// Derive the plan verdict from its tasks under `policy`.
pub fn evaluate(policy: PlanFailurePolicy, tasks: &[Task]) -> PlanVerdict {
    if tasks.iter().all(|t| t.status == TaskStatus::Completed) {
        return PlanVerdict::Completed;
    }

    let any_unsuccessful = tasks.iter().any(|t| is_unsuccessful(t.status));
    let all_terminal = tasks.iter().all(|t| t.status.is_terminal());
    let decided = match policy {
        PlanFailurePolicy::WaitForAll => all_terminal,
        PlanFailurePolicy::FailFast => any_unsuccessful,
    };
    if decided && any_unsuccessful {
        return PlanVerdict::Failed {
            blocking: tasks
                .iter()
                .filter(|t| t.status != TaskStatus::Completed)
                .map(|t| t.id)
                .collect(),
        };
    }

    let started = tasks
        .iter()
        .any(|t| t.status != TaskStatus::Queued || t.retry_count > 0);
    if started {
        PlanVerdict::Executing
    } else {
        PlanVerdict::Pending
    }
}

/// Outcome of one propagation sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PropagationReport {
    /// Active plans looked at.
    pub plans_checked: usize,
    /// Plans moved from `generated` to `executing`.
    pub started: usize,
    /// Plans marked completed.
    pub completed: usize,
    /// Plans marked failed.
    pub failed: usize,
    /// Sub-tasks cancelled because their plan failed.
    pub tasks_cancelled: usize,
}

/// Applies plan verdicts to the store.
#[derive(Debug, Clone)]
pub struct Propagator {
    store: TaskStore,
    policy: PlanFailurePolicy,
}

impl Propagator {
    /// Sweep `store` deciding failures under `policy`.
    pub fn new(store: TaskStore, policy: PlanFailurePolicy) -> Self {
        Self { store, policy }
    }

    /// The plan failure policy in force.
    pub fn policy(&self) -> PlanFailurePolicy {
        self.policy
    }

    /// Sweep every `generated` or `executing` plan once.
    ///
    /// A plan that errors is logged and skipped unless the error is fatal.
    pub async fn propagate_once(&self) -> HiveResult<PropagationReport> {
        let plans = self
            .store
            .list_plans(&[PlanStatus::Generated, PlanStatus::Executing])
            .await?;
        let mut report = PropagationReport::default();
        for plan in plans {
            report.plans_checked += 1;
            match self.propagate_plan(plan.id, plan.status).await {
                Ok(step) => {
                    report.tasks_cancelled += step.tasks_cancelled;
                    report.started += step.started;
                    report.completed += step.completed;
                    report.failed += step.failed;
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!(plan_id = %plan.id, error = %e, "Plan propagation failed"),
            }
        }
        if report.started + report.completed + report.failed + report.tasks_cancelled > 0 {
            info!(
                plans = report.plans_checked,
                started = report.started,
                completed = report.completed,
                failed = report.failed,
                cancelled = report.tasks_cancelled,
                "Propagation sweep"
            );
        }
        Ok(report)
    }

    /// Bring one plan up to date; `current` is the status it was listed with.
    pub async fn propagate_plan(
        &self,
        plan_id: Uuid,
        current: PlanStatus,
    ) -> HiveResult<PropagationReport> {
        let mut report = PropagationReport {
            plans_checked: 1,
            ..Default::default()
        };
        report.tasks_cancelled += self.store.cancel_blocked_tasks(plan_id).await?.len();

        let tasks = self.store.tasks_for_plan(plan_id).await?;
        let verdict = evaluate(self.policy, &tasks);
        debug!(plan_id = %plan_id, verdict = ?verdict, "Plan evaluated");

        match verdict {
            PlanVerdict::Pending => {}
            PlanVerdict::Executing => {
                if current == PlanStatus::Generated
                    && self
                        .store
                        .transition_plan(plan_id, current, PlanStatus::Executing, None)
                        .await?
                {
                    report.started += 1;
                }
            }
            PlanVerdict::Completed => {
                if self
                    .store
                    .transition_plan(plan_id, current, PlanStatus::Completed, None)
                    .await?
                {
                    report.completed += 1;
                }
            }
            PlanVerdict::Failed { blocking } => {
                let reason = format!("{} task(s) did not complete", blocking.len());
                if self
                    .store
                    .transition_plan(plan_id, current, PlanStatus::Failed, Some(&reason))
                    .await?
                {
                    report.failed += 1;
                    if self.policy == PlanFailurePolicy::FailFast {
                        report.tasks_cancelled += self
                            .store
                            .cancel_queued_tasks(plan_id, "plan failed")
                            .await?
                            .len();
                    }
                }
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use hive_core::{Phase, PlanStepPayload, TaskPayload};
    use proptest::prelude::*;
    use TaskStatus::*;

    fn task(status: TaskStatus) -> Task {
        let now = Utc::now();
        Task {
            id: Uuid::new_v4(),
            title: "step".into(),
            description: String::new(),
            task_type: "code".into(),
            priority: 0,
            status,
            assignee: None,
            payload: TaskPayload::PlanStep(PlanStepPayload {
                parent_plan_id: Uuid::nil(),
                subtask_id: "s".into(),
                dependencies: vec![],
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

    fn tasks(statuses: &[TaskStatus]) -> Vec<Task> {
        statuses.iter().copied().map(task).collect()
    }

    #[test]
    fn test_empty_plan_completes() {
        assert_eq!(
            evaluate(PlanFailurePolicy::WaitForAll, &[]),
            PlanVerdict::Completed
        );
    }

    #[test]
    fn test_all_queued_is_pending() {
        let plan = tasks(&[Queued, Queued]);
        assert_eq!(
            evaluate(PlanFailurePolicy::WaitForAll, &plan),
            PlanVerdict::Pending
        );
    }

    #[test]
    fn test_requeued_task_counts_as_started() {
        let mut plan = tasks(&[Queued]);
        plan[0].retry_count = 1;
        assert_eq!(
            evaluate(PlanFailurePolicy::WaitForAll, &plan),
            PlanVerdict::Executing
        );
    }

    #[test]
    fn test_wait_for_all_holds_until_terminal() {
        let plan = tasks(&[Failed, InProgress]);
        assert_eq!(
            evaluate(PlanFailurePolicy::WaitForAll, &plan),
            PlanVerdict::Executing
        );

        let plan = tasks(&[Failed, Completed, Cancelled]);
        match evaluate(PlanFailurePolicy::WaitForAll, &plan) {
            PlanVerdict::Failed { blocking } => {
                assert_eq!(blocking, vec![plan[0].id, plan[2].id]);
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn test_fail_fast_fails_on_first_failure() {
        let plan = tasks(&[Failed, InProgress, Queued]);
        assert!(matches!(
            evaluate(PlanFailurePolicy::FailFast, &plan),
            PlanVerdict::Failed { blocking } if blocking.len() == 3
        ));
    }

    #[test]
    fn test_all_completed() {
        let plan = tasks(&[Completed, Completed]);
        for policy in [PlanFailurePolicy::WaitForAll, PlanFailurePolicy::FailFast] {
            assert_eq!(evaluate(policy, &plan), PlanVerdict::Completed);
        }
    }

    fn any_status() -> impl Strategy<Value = TaskStatus> {
        prop_oneof![
            Just(Queued),
            Just(Assigned),
            Just(InProgress),
            Just(Completed),
            Just(Failed),
            Just(Cancelled),
        ]
    }

    proptest! {
        #[test]
        fn prop_completed_iff_all_completed(
            statuses in proptest::collection::vec(any_status(), 0..12),
            fail_fast in any::<bool>(),
        ) {
            let policy = if fail_fast { PlanFailurePolicy::FailFast } else { PlanFailurePolicy::WaitForAll };
            let plan = tasks(&statuses);
            let all_completed = statuses.iter().all(|s| *s == Completed);
            prop_assert_eq!(evaluate(policy, &plan) == PlanVerdict::Completed, all_completed);
        }

        #[test]
        fn prop_wait_for_all_never_decides_early(
            statuses in proptest::collection::vec(any_status(), 1..12),
        ) {
            let plan = tasks(&statuses);
            let verdict = evaluate(PlanFailurePolicy::WaitForAll, &plan);
            if statuses.iter().any(|s| !s.is_terminal()) {
                prop_assert!(!verdict.is_terminal());
            } else {
                prop_assert!(verdict.is_terminal());
            }
        }
    }
}
