//! Worker and planner contracts.
//!
//! Thin handles over the store that bind a process identity and route every
//! recorded run through the [`RetryManager`].

use crate::dispatcher::{PlanningSource, TaskSource};
use crate::monitor::DispatchMonitor;
use crate::retry::{abandoned_attempt_report, RetryManager};
use hive_core::{
    HiveError, HiveResult, NewPlanningRequest, Phase, PlanDraft, PlanningRequest, Run, RunResult,
    RunStatus, SavedPlan, Task, Worker,
};
use hive_store::{RunOutcome, RunReport, TaskStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

/// Record `report` with the transition the retry manager picks, and count it.
pub(crate) async fn record_decided(
    store: &TaskStore,
    retry: &Arc<RetryManager>,
    monitor: &DispatchMonitor,
    report: RunReport,
) -> HiveResult<RunOutcome> {
    let retry = Arc::clone(retry);
    let outcome = store
        .record_run(report, move |task, run, history| retry.decide(task, run, history))
        .await?;
    monitor
        .record_transition(&outcome.transition, outcome.escalation.is_some())
        .await;
    Ok(outcome)
}

/// Who a worker process is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerIdentity {
    /// Unique worker id, also the task assignee.
    pub id: String,
    /// Free-form role label, e.g. `coder`.
    pub role: String,
    /// Task types this worker takes; empty takes any.
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl WorkerIdentity {
    /// An identity that takes any task type.
    pub fn new(id: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: role.into(),
            capabilities: Vec::new(),
        }
    }

    /// Restrict claims to these task types.
    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }
}

/// Everything a worker process does against the store.
#[derive(Clone)]
pub struct WorkerApi {
    store: TaskStore,
    retry: Arc<RetryManager>,
    monitor: Arc<DispatchMonitor>,
    identity: WorkerIdentity,
}

impl WorkerApi {
    /// Bind `identity` to a store, retry policy and monitor.
    pub fn new(
        store: TaskStore,
        retry: Arc<RetryManager>,
        monitor: Arc<DispatchMonitor>,
        identity: WorkerIdentity,
    ) -> Self {
        Self {
            store,
            retry,
            monitor,
            identity,
        }
    }

    /// Who this handle acts as.
    pub fn identity(&self) -> &WorkerIdentity {
        &self.identity
    }

    /// Upsert the worker row and mark it active.
    pub async fn register(&self) -> HiveResult<Worker> {
        self.store
            .register_worker(
                &self.identity.id,
                &self.identity.role,
                &self.identity.capabilities,
            )
            .await
    }

    /// Refresh the liveness timestamp.
    pub async fn heartbeat(&self) -> HiveResult<()> {
        self.store.heartbeat(&self.identity.id).await
    }

    /// Mark the worker offline; returns whether a row changed.
    pub async fn deregister(&self) -> HiveResult<bool> {
        self.store.deregister_worker(&self.identity.id).await
    }

    /// Claim the next ready task this worker can take.
    pub async fn claim_next(&self) -> HiveResult<Option<Task>> {
        self.store
            .claim_next_task(&self.identity.id, &self.identity.capabilities)
            .await
    }

    /// Open a run for `phase`, moving the task to `in_progress`.
    pub async fn begin_run(&self, task_id: Uuid, phase: Phase) -> HiveResult<Run> {
        self.store.begin_run(task_id, &self.identity.id, phase).await
    }

    /// Report the outcome of a phase and apply the resulting transition.
    pub async fn report_run(
        &self,
        task_id: Uuid,
        phase: Phase,
        status: RunStatus,
        result: Option<RunResult>,
    ) -> HiveResult<RunOutcome> {
        let report = RunReport {
            task_id,
            worker_id: self.identity.id.clone(),
            phase,
            status,
            result,
        };
        record_decided(&self.store, &self.retry, &self.monitor, report).await
    }

    /// Report `phase` as completed.
    pub async fn complete_phase(
        &self,
        task_id: Uuid,
        phase: Phase,
        result: RunResult,
    ) -> HiveResult<RunOutcome> {
        self.report_run(task_id, phase, RunStatus::Completed, Some(result))
            .await
    }

    /// Report `phase` as failed.
    pub async fn fail_phase(
        &self,
        task_id: Uuid,
        phase: Phase,
        result: RunResult,
    ) -> HiveResult<RunOutcome> {
        self.report_run(task_id, phase, RunStatus::Failed, Some(result))
            .await
    }

    /// Report the result of executing `phase`.
    ///
    /// A [`HiveError::RunFailure`] becomes a failed run; any other error is
    /// returned without touching the task.
    pub async fn settle(
        &self,
        task_id: Uuid,
        phase: Phase,
        result: HiveResult<RunResult>,
    ) -> HiveResult<RunOutcome> {
        match result {
            Ok(result) => self.complete_phase(task_id, phase, result).await,
            Err(HiveError::RunFailure { reason, .. }) => {
                self.fail_phase(task_id, phase, RunResult::failure(reason))
                    .await
            }
            Err(e) => Err(e),
        }
    }

    /// Give back a task this worker holds but cannot finish.
    ///
    /// Records a failed run for the current attempt, so the task is
    /// requeued or escalated like any other failure. Returns `None` when the
    /// task is no longer held by this worker.
    pub async fn release(&self, task_id: Uuid, reason: &str) -> HiveResult<Option<RunOutcome>> {
        let Some(task) = self.store.get_task(task_id).await? else {
            return Ok(None);
        };
        let held = task.status.is_claimed()
            && task.assignee.as_deref() == Some(self.identity.id.as_str());
        if !held {
            return Ok(None);
        }
        let history = self.store.list_runs(task_id).await?;
        let report = abandoned_attempt_report(&task, &history, reason);
        warn!(
            task_id = %task_id,
            worker_id = %self.identity.id,
            phase = %report.phase,
            reason,
            "Releasing held task"
        );
        record_decided(&self.store, &self.retry, &self.monitor, report)
            .await
            .map(Some)
    }

    /// A dispatch source over the tasks this worker can take.
    pub fn task_source(&self) -> TaskSource {
        TaskSource::new(self.clone())
    }
}

/// Everything a planning agent (or a submitter) does against the store.
#[derive(Clone)]
pub struct PlannerApi {
    store: TaskStore,
    agent_id: String,
}

impl PlannerApi {
    /// A handle acting as planning agent `agent_id`.
    pub fn new(store: TaskStore, agent_id: impl Into<String>) -> Self {
        Self {
            store,
            agent_id: agent_id.into(),
        }
    }

    /// The agent this handle claims for.
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Queue a new planning request.
    pub async fn submit(&self, request: NewPlanningRequest) -> HiveResult<PlanningRequest> {
        self.store.submit_planning_request(request).await
    }

    /// Claim the highest priority pending request.
    pub async fn claim_next(&self) -> HiveResult<Option<PlanningRequest>> {
        self.store.claim_next_planning_request(&self.agent_id).await
    }

    /// Validate and persist a plan for a request this agent holds.
    pub async fn save_plan(&self, request_id: Uuid, draft: &PlanDraft) -> HiveResult<SavedPlan> {
        self.store
            .save_execution_plan(request_id, &self.agent_id, draft)
            .await
    }

    /// Give up on a held request with `reason`.
    pub async fn fail(&self, request_id: Uuid, reason: &str) -> HiveResult<PlanningRequest> {
        self.store
            .fail_planning_request(request_id, &self.agent_id, reason)
            .await
    }

    /// A dispatch source over pending planning requests.
    pub fn planning_source(&self) -> PlanningSource {
        PlanningSource::new(self.store.clone(), self.agent_id.clone())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use hive_core::{NewTask, RetrySettings, TaskStatus, TaskTransition};
    use hive_store::{ConnectionPool, PoolConfig};
    use tempfile::TempDir;

    async fn store(dir: &TempDir) -> TaskStore {
        let pool = ConnectionPool::open(PoolConfig::new(dir.path().join("api.db")))
            .await
            .unwrap();
        TaskStore::open(pool).await.unwrap()
    }

    fn worker(store: &TaskStore, max_retries: u32) -> WorkerApi {
        WorkerApi::new(
            store.clone(),
            Arc::new(RetryManager::new(RetrySettings {
                max_retries,
                backoff: hive_core::BackoffPolicy::None,
            })),
            Arc::new(DispatchMonitor::new()),
            WorkerIdentity::new("w1", "coder").with_capabilities(["code"]),
        )
    }

    #[tokio::test]
    async fn test_worker_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let api = worker(&store, 1);
        let registered = api.register().await.unwrap();
        assert_eq!(registered.capabilities, vec!["code".to_string()]);

        let task = store.create_task(NewTask::new("build", "code")).await.unwrap();
        let claimed = api.claim_next().await.unwrap().unwrap();
        assert_eq!(claimed.id, task.id);

        api.begin_run(task.id, Phase::Execute).await.unwrap();
        let outcome = api
            .complete_phase(task.id, Phase::Execute, RunResult::success("ok"))
            .await
            .unwrap();
        assert_eq!(outcome.transition, TaskTransition::Complete);
        assert_eq!(outcome.task.status, TaskStatus::Completed);

        let outcomes = api.monitor.snapshot().await.outcomes;
        assert_eq!(outcomes.completions, 1);
        assert!(api.deregister().await.unwrap());
    }

    #[tokio::test]
    async fn test_run_failure_flows_through_retry() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let api = worker(&store, 1);
        api.register().await.unwrap();
        let task = store.create_task(NewTask::new("flaky", "code")).await.unwrap();
        api.claim_next().await.unwrap().unwrap();

        let failure = HiveError::RunFailure {
            task_id: task.id,
            reason: "exit status 1".into(),
        };
        let outcome = api
            .settle(task.id, Phase::Execute, Err(failure))
            .await
            .unwrap();
        assert_eq!(
            outcome.transition,
            TaskTransition::Requeue { not_before: None }
        );
        assert_eq!(outcome.task.status, TaskStatus::Queued);
        assert_eq!(outcome.task.retry_count, 1);
        assert_eq!(outcome.run.failure_reason(), Some("exit status 1"));

        // Other errors never touch the task.
        let err = api
            .settle(task.id, Phase::Execute, Err(HiveError::Store("io".into())))
            .await
            .unwrap_err();
        assert!(matches!(err, HiveError::Store(_)));
        assert_eq!(store.list_runs(task.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_capabilities_limit_claims() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let api = worker(&store, 0);
        store.create_task(NewTask::new("docs", "write")).await.unwrap();
        assert!(api.claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_planner_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let planner = PlannerApi::new(store.clone(), "planner-1");
        let request = planner
            .submit(NewPlanningRequest::new("ship it", "ops").with_priority(5))
            .await
            .unwrap();
        let claimed = planner.claim_next().await.unwrap().unwrap();
        assert_eq!(claimed.id, request.id);
        assert_eq!(claimed.assigned_agent.as_deref(), Some("planner-1"));

        let draft = PlanDraft::new(
            "two steps",
            vec![
                hive_core::SubTaskSpec::new("a", "first"),
                hive_core::SubTaskSpec::new("b", "second").with_dependencies(["a"]),
            ],
        );
        let saved = planner.save_plan(request.id, &draft).await.unwrap();
        assert_eq!(saved.tasks.len(), 2);
        assert!(saved.omitted.is_empty());

        // Nothing left to plan.
        assert!(planner.claim_next().await.unwrap().is_none());
    }
}
