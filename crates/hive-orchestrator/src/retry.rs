//! Retry and escalation decisions.
//!
//! The decision is a pure function of the task, the run just recorded and the
//! task's run history. The store applies the returned [`TaskTransition`] in
//! the same transaction that records the run.

use chrono::{DateTime, Utc};
use hive_core::{Phase, RetrySettings, Run, RunResult, RunStatus, Task, TaskTransition};
use hive_store::RunReport;
use tracing::debug;

/// Reason recorded when a worker disappears mid-task.
pub const LOST_WORKER_REASON: &str = "worker lost heartbeat";

/// Decides what happens to a task after each run.
#[derive(Debug, Clone, Default)]
pub struct RetryManager {
    policy: RetrySettings,
}

impl RetryManager {
    /// Apply `policy` to every decision.
    pub fn new(policy: RetrySettings) -> Self {
        Self { policy }
    }

    /// The retry limits and backoff in force.
    pub fn policy(&self) -> &RetrySettings {
        &self.policy
    }

    /// [`RetryManager::decide_at`] with the current time.
    pub fn decide(&self, task: &Task, run: &Run, history: &[Run]) -> TaskTransition {
        self.decide_at(task, run, history, Utc::now())
    }

    /// The transition for `task` after `run` was recorded at `now`.
    ///
    /// `task` is the state before the run; `history` includes `run`.
    pub fn decide_at(
        &self,
        task: &Task,
        run: &Run,
        history: &[Run],
        now: DateTime<Utc>,
    ) -> TaskTransition {
        match run.status {
            RunStatus::Running => TaskTransition::Stay,
            RunStatus::Completed => {
                if run.phase == task.final_phase() && phases_satisfied(task, history) {
                    TaskTransition::Complete
                } else {
                    debug!(task_id = %task.id, phase = %run.phase, "Intermediate phase completed");
                    TaskTransition::Stay
                }
            }
            RunStatus::Failed => {
                let reason = run.failure_reason().unwrap_or("run failed");
                let retryable = run.result.as_ref().map_or(true, |r| r.retryable);
                if !retryable {
                    TaskTransition::Fail {
                        reason: format!("permanent failure: {reason}"),
                        escalate: true,
                    }
                } else if task.retry_count < self.policy.max_retries {
                    TaskTransition::Requeue {
                        not_before: self.next_attempt_at(task.retry_count + 1, now),
                    }
                } else {
                    TaskTransition::Fail {
                        reason: format!(
                            "exhausted {} retries: {reason}",
                            self.policy.max_retries
                        ),
                        escalate: true,
                    }
                }
            }
        }
    }

    /// When retry number `attempt` becomes eligible; `None` for no delay.
    pub fn next_attempt_at(&self, attempt: u32, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let delay = self.policy.backoff.delay_for(attempt);
        if delay.is_zero() {
            return None;
        }
        chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
    }
}

/// Every required phase has a completed run in the task's current attempt.
pub fn phases_satisfied(task: &Task, history: &[Run]) -> bool {
    task.required_phases.iter().all(|phase| {
        history.iter().any(|r| {
            r.phase == *phase && r.status == RunStatus::Completed && r.attempt == task.retry_count
        })
    })
}

/// The synthetic failure reported on behalf of a worker that stopped
/// heart-beating.
pub fn orphan_report(task: &Task, history: &[Run]) -> RunReport {
    abandoned_attempt_report(task, history, LOST_WORKER_REASON)
}

/// A failed run closing the current attempt of `task` with `reason`.
///
/// Targets the phase of the run left open in the current attempt, or the
/// first required phase not yet completed.
pub fn abandoned_attempt_report(task: &Task, history: &[Run], reason: &str) -> RunReport {
    let open_phase = history
        .iter()
        .rev()
        .find(|r| r.status == RunStatus::Running && r.attempt == task.retry_count)
        .map(|r| r.phase);
    let phase = open_phase.unwrap_or_else(|| first_unfinished_phase(task, history));
    RunReport {
        task_id: task.id,
        worker_id: task.assignee.clone().unwrap_or_default(),
        phase,
        status: RunStatus::Failed,
        result: Some(RunResult::failure(reason)),
    }
}

fn first_unfinished_phase(task: &Task, history: &[Run]) -> Phase {
    task.required_phases
        .iter()
        .copied()
        .find(|phase| {
            !history.iter().any(|r| {
                r.phase == *phase
                    && r.status == RunStatus::Completed
                    && r.attempt == task.retry_count
            })
        })
        .unwrap_or_else(|| task.final_phase())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use hive_core::{BackoffPolicy, TaskPayload, TaskStatus};
    use proptest::prelude::*;
    use uuid::Uuid;

    fn task(retry_count: u32, phases: Vec<Phase>) -> Task {
        let now = Utc::now();
        Task {
            id: Uuid::new_v4(),
            title: "t".into(),
            description: String::new(),
            task_type: "code".into(),
            priority: 0,
            status: TaskStatus::InProgress,
            assignee: Some("w1".into()),
            payload: TaskPayload::Ordinary {
                params: serde_json::Value::Null,
            },
            required_phases: phases,
            retry_count,
            not_before: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
            assigned_at: Some(now),
            completed_at: None,
        }
    }

    fn run(task: &Task, phase: Phase, status: RunStatus, result: Option<RunResult>) -> Run {
        Run {
            id: Uuid::new_v4(),
            task_id: task.id,
            worker_id: "w1".into(),
            phase,
            status,
            attempt: task.retry_count,
            result,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    fn manager(max_retries: u32, backoff: BackoffPolicy) -> RetryManager {
        RetryManager::new(RetrySettings {
            max_retries,
            backoff,
        })
    }

    #[test]
    fn test_running_stays() {
        let t = task(0, vec![Phase::Execute]);
        let r = run(&t, Phase::Execute, RunStatus::Running, None);
        assert_eq!(
            RetryManager::default().decide(&t, &r, &[r.clone()]),
            TaskTransition::Stay
        );
    }

    #[test]
    fn test_single_phase_completion() {
        let t = task(0, vec![Phase::Execute]);
        let r = run(&t, Phase::Execute, RunStatus::Completed, None);
        assert_eq!(
            RetryManager::default().decide(&t, &r, &[r.clone()]),
            TaskTransition::Complete
        );
    }

    #[test]
    fn test_pipeline_completes_only_after_every_phase() {
        let t = task(0, vec![Phase::Apply, Phase::Test, Phase::Deploy]);
        let apply = run(&t, Phase::Apply, RunStatus::Completed, None);
        let manager = RetryManager::default();
        assert_eq!(
            manager.decide(&t, &apply, &[apply.clone()]),
            TaskTransition::Stay
        );

        // Final phase without the middle one is not enough.
        let deploy = run(&t, Phase::Deploy, RunStatus::Completed, None);
        assert_eq!(
            manager.decide(&t, &deploy, &[apply.clone(), deploy.clone()]),
            TaskTransition::Stay
        );

        let test = run(&t, Phase::Test, RunStatus::Completed, None);
        assert_eq!(
            manager.decide(&t, &deploy, &[apply, test, deploy.clone()]),
            TaskTransition::Complete
        );
    }

    #[test]
    fn test_phases_from_earlier_attempt_do_not_count() {
        let earlier = task(0, vec![Phase::Apply, Phase::Deploy]);
        let old_apply = run(&earlier, Phase::Apply, RunStatus::Completed, None);
        let t = task(1, vec![Phase::Apply, Phase::Deploy]);
        let deploy = run(&t, Phase::Deploy, RunStatus::Completed, None);
        assert!(!phases_satisfied(&t, &[old_apply, deploy]));
    }

    #[test]
    fn test_failure_requeues_with_backoff() {
        let now = Utc::now();
        let m = manager(
            3,
            BackoffPolicy::Exponential {
                base_ms: 1_000,
                max_ms: 60_000,
            },
        );
        let t = task(1, vec![Phase::Execute]);
        let r = run(
            &t,
            Phase::Execute,
            RunStatus::Failed,
            Some(RunResult::failure("flaky")),
        );
        match m.decide_at(&t, &r, &[r.clone()], now) {
            TaskTransition::Requeue {
                not_before: Some(at),
            } => assert_eq!(at - now, chrono::Duration::seconds(2)),
            other => panic!("expected requeue, got {other:?}"),
        }
    }

    #[test]
    fn test_no_backoff_requeues_immediately() {
        let m = manager(1, BackoffPolicy::None);
        let t = task(0, vec![Phase::Execute]);
        let r = run(&t, Phase::Execute, RunStatus::Failed, None);
        assert_eq!(
            m.decide(&t, &r, &[r.clone()]),
            TaskTransition::Requeue { not_before: None }
        );
    }

    #[test]
    fn test_exhausted_retries_fail_and_escalate() {
        let m = manager(2, BackoffPolicy::None);
        let t = task(2, vec![Phase::Execute]);
        let r = run(
            &t,
            Phase::Execute,
            RunStatus::Failed,
            Some(RunResult::failure("segfault")),
        );
        assert_eq!(
            m.decide(&t, &r, &[r.clone()]),
            TaskTransition::Fail {
                reason: "exhausted 2 retries: segfault".into(),
                escalate: true,
            }
        );
    }

    #[test]
    fn test_permanent_failure_skips_retries() {
        let m = manager(5, BackoffPolicy::None);
        let t = task(0, vec![Phase::Execute]);
        let r = run(
            &t,
            Phase::Execute,
            RunStatus::Failed,
            Some(RunResult::failure("invalid input").permanent()),
        );
        assert!(matches!(
            m.decide(&t, &r, &[r.clone()]),
            TaskTransition::Fail { escalate: true, .. }
        ));
    }

    #[test]
    fn test_orphan_report_targets_open_phase() {
        let t = task(0, vec![Phase::Apply, Phase::Deploy]);
        let apply = run(&t, Phase::Apply, RunStatus::Completed, None);
        let report = orphan_report(&t, &[apply.clone()]);
        assert_eq!(report.phase, Phase::Deploy);
        assert_eq!(report.worker_id, "w1");
        assert_eq!(report.status, RunStatus::Failed);

        let deploy = run(&t, Phase::Deploy, RunStatus::Running, None);
        let open = Run {
            phase: Phase::Apply,
            ..deploy.clone()
        };
        assert_eq!(orphan_report(&t, &[apply, open]).phase, Phase::Apply);
        assert_eq!(
            orphan_report(&t, &[]).result.unwrap().error.as_deref(),
            Some(LOST_WORKER_REASON)
        );
    }

    proptest! {
        #[test]
        fn prop_never_requeues_past_max(max in 0u32..10, count in 0u32..20) {
            let m = manager(max, BackoffPolicy::None);
            let t = task(count, vec![Phase::Execute]);
            let r = run(&t, Phase::Execute, RunStatus::Failed, None);
            let transition = m.decide(&t, &r, &[r.clone()]);
            if count < max {
                let is_requeue = matches!(transition, TaskTransition::Requeue { .. });
                prop_assert!(is_requeue);
            } else {
                let is_fail = matches!(transition, TaskTransition::Fail { escalate: true, .. });
                prop_assert!(is_fail);
            }
        }

        #[test]
        fn prop_backoff_is_bounded(base in 1u64..10_000, max in 1u64..120_000, attempt in 1u32..64) {
            let m = manager(3, BackoffPolicy::Exponential { base_ms: base, max_ms: max });
            let now = Utc::now();
            if let Some(at) = m.next_attempt_at(attempt, now) {
                prop_assert!(at > now);
                prop_assert!(at - now <= chrono::Duration::milliseconds(max as i64));
            }
        }
    }
}
