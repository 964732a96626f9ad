//! Durable data model: planning requests, execution plans, tasks, runs,
//! workers and escalations.
//!
//! Status enums round-trip through their lowercase string form, which is what
//! the store persists.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Returned when a persisted status/phase string is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value '{value}'")]
pub struct ParseEnumError {
    /// Which enum was being parsed.
    pub kind: &'static str,
    /// The offending value.
    pub value: String,
}

macro_rules! string_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// The persisted string form.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(ParseEnumError {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

// --- Planning requests ---

/// Lifecycle of a [`PlanningRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanningStatus {
    /// Waiting to be claimed by a planning agent.
    Pending,
    /// Claimed; the planning agent is producing a plan.
    Assigned,
    /// An execution plan was saved. Terminal.
    Planned,
    /// Planning gave up. Terminal.
    Failed,
}

string_enum!(PlanningStatus, "planning status", {
    Pending => "pending",
    Assigned => "assigned",
    Planned => "planned",
    Failed => "failed",
});

impl PlanningStatus {
    /// Whether the request can no longer change.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PlanningStatus::Planned | PlanningStatus::Failed)
    }
}

/// Structured context attached to a planning request by its submitter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestContext {
    /// Repository the work applies to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    /// Branch or ref the work applies to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// Free labels used for routing and reporting.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    /// Additional string-valued hints for the planner.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

/// A unit of work submitted for decomposition into an execution plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanningRequest {
    /// Request id.
    pub id: Uuid,
    /// What should be built.
    pub description: String,
    /// Higher is more urgent.
    pub priority: i64,
    /// Who submitted it.
    pub requestor: String,
    /// Submitter-supplied routing hints.
    pub context: RequestContext,
    /// Lifecycle state.
    pub status: PlanningStatus,
    /// Planning agent holding the request.
    pub assigned_agent: Option<String>,
    /// Why planning gave up.
    pub failure_reason: Option<String>,
    /// Submission time.
    pub created_at: DateTime<Utc>,
    /// When the current holder claimed it; starts the planning lease.
    pub assigned_at: Option<DateTime<Utc>>,
    /// When it reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
}

/// Input for submitting a planning request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPlanningRequest {
    /// What should be built.
    pub description: String,
    /// Higher is more urgent.
    #[serde(default)]
    pub priority: i64,
    /// Who is submitting.
    pub requestor: String,
    /// Routing hints for the planner.
    #[serde(default)]
    pub context: RequestContext,
}

impl NewPlanningRequest {
    /// Create a request with default priority and empty context.
    pub fn new(description: impl Into<String>, requestor: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            priority: 0,
            requestor: requestor.into(),
            context: RequestContext::default(),
        }
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Attach submitter context.
    pub fn with_context(mut self, context: RequestContext) -> Self {
        self.context = context;
        self
    }
}

// --- Execution plans ---

/// Lifecycle of an [`ExecutionPlan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    /// Saved; no sub-task has started.
    Generated,
    /// At least one sub-task has started.
    Executing,
    /// Every sub-task completed. Terminal.
    Completed,
    /// A sub-task failed or was cancelled. Terminal.
    Failed,
}

string_enum!(PlanStatus, "plan status", {
    Generated => "generated",
    Executing => "executing",
    Completed => "completed",
    Failed => "failed",
});

impl PlanStatus {
    /// Completed or failed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PlanStatus::Completed | PlanStatus::Failed)
    }
}

/// Blueprint of one plan-generated sub-task, as produced by a planner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubTaskSpec {
    /// Identifier unique within the plan; dependencies refer to it.
    pub subtask_id: String,
    /// Short title, copied to the task.
    pub title: String,
    /// Longer description, copied to the task.
    #[serde(default)]
    pub description: String,
    /// Capability key a worker must declare to claim the task.
    #[serde(default = "default_task_type")]
    pub task_type: String,
    /// Dispatch priority; higher first.
    #[serde(default)]
    pub priority: i64,
    /// Sibling `subtask_id`s that must complete first, in declaration order.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Pipeline phases that must all succeed, in order.
    #[serde(default = "default_phases")]
    pub phases: Vec<Phase>,
    /// Free-form parameters for the worker.
    #[serde(default)]
    pub params: serde_json::Value,
}

fn default_task_type() -> String {
    "general".to_string()
}

fn default_phases() -> Vec<Phase> {
    vec![Phase::Execute]
}

impl SubTaskSpec {
    /// A step of type `general` with a single `execute` phase.
    pub fn new(subtask_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            subtask_id: subtask_id.into(),
            title: title.into(),
            description: String::new(),
            task_type: default_task_type(),
            priority: 0,
            dependencies: Vec::new(),
            phases: default_phases(),
            params: serde_json::Value::Null,
        }
    }

    /// Set the sibling ids that must complete first.
    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Set the capability key.
    pub fn with_task_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = task_type.into();
        self
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Set the required phases.
    pub fn with_phases(mut self, phases: Vec<Phase>) -> Self {
        self.phases = phases;
        self
    }
}

/// What a planner hands to `save_execution_plan`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanDraft {
    /// One-line description of the plan.
    pub summary: String,
    /// Sub-tasks to create.
    pub steps: Vec<SubTaskSpec>,
}

impl PlanDraft {
    /// A draft with `steps`.
    pub fn new(summary: impl Into<String>, steps: Vec<SubTaskSpec>) -> Self {
        Self {
            summary: summary.into(),
            steps,
        }
    }
}

/// Serialized plan body stored on the [`ExecutionPlan`] row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanData {
    /// One-line description of the plan.
    pub summary: String,
    /// Sub-tasks that were persisted.
    pub steps: Vec<SubTaskSpec>,
    /// Sub-task ids dropped because they (or a dependency) could not be inserted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub omitted: Vec<String>,
}

/// The decomposition of a planning request into dependency-ordered sub-tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// Plan id.
    pub id: Uuid,
    /// The request this plan answers.
    pub planning_request_id: Uuid,
    /// Stored plan body.
    pub plan_data: PlanData,
    /// Lifecycle state.
    pub status: PlanStatus,
    /// Why the plan failed.
    pub failure_reason: Option<String>,
    /// When the plan was saved.
    pub generated_at: DateTime<Utc>,
    /// When it reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
}

// --- Tasks ---

/// Status of a task in the dispatch pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for a worker.
    Queued,
    /// Claimed, no run started yet.
    Assigned,
    /// A run has started.
    InProgress,
    /// Every required phase succeeded. Terminal.
    Completed,
    /// Retries exhausted or failure was permanent. Terminal.
    Failed,
    /// Cancelled by an operator or plan propagation. Terminal.
    Cancelled,
}

string_enum!(TaskStatus, "task status", {
    Queued => "queued",
    Assigned => "assigned",
    InProgress => "in_progress",
    Completed => "completed",
    Failed => "failed",
    Cancelled => "cancelled",
});

impl TaskStatus {
    /// Completed, failed or cancelled.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Held by a worker.
    pub fn is_claimed(&self) -> bool {
        matches!(self, TaskStatus::Assigned | TaskStatus::InProgress)
    }
}

/// Pipeline stage a run belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Work out the approach.
    Plan,
    /// Make the change.
    Apply,
    /// Check the change.
    Inspect,
    /// Review the change.
    Review,
    /// Run tests.
    Test,
    /// Ship the change.
    Deploy,
    /// Single-step work; the default.
    Execute,
}

string_enum!(Phase, "phase", {
    Plan => "plan",
    Apply => "apply",
    Inspect => "inspect",
    Review => "review",
    Test => "test",
    Deploy => "deploy",
    Execute => "execute",
});

/// Payload of a plan-generated sub-task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStepPayload {
    /// Owning plan.
    pub parent_plan_id: Uuid,
    /// Id unique within the plan.
    pub subtask_id: String,
    /// Sibling `subtask_id`s that must complete first.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Free-form parameters for the worker.
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Task payload, discriminating ordinary tasks from plan-generated ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskPayload {
    /// A standalone task with no dependency concept.
    Ordinary {
        /// Free-form parameters for the worker.
        #[serde(default)]
        params: serde_json::Value,
    },
    /// A sub-task of an execution plan.
    PlanStep(PlanStepPayload),
}

impl TaskPayload {
    /// Worker parameters of either kind.
    pub fn params(&self) -> &serde_json::Value {
        match self {
            TaskPayload::Ordinary { params } => params,
            TaskPayload::PlanStep(step) => &step.params,
        }
    }
}

/// An executable unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Task id.
    pub id: Uuid,
    /// Short title.
    pub title: String,
    /// Longer description.
    pub description: String,
    /// Capability key matched against worker capabilities.
    pub task_type: String,
    /// Dispatch priority; higher first.
    pub priority: i64,
    /// Pipeline state.
    pub status: TaskStatus,
    /// Worker holding the task.
    pub assignee: Option<String>,
    /// Ordinary or plan-step payload.
    pub payload: TaskPayload,
    /// Ordered, never empty.
    pub required_phases: Vec<Phase>,
    /// Attempts that ended in a requeue.
    pub retry_count: u32,
    /// The task is not eligible for dispatch before this instant (retry backoff).
    pub not_before: Option<DateTime<Utc>>,
    /// Latest failure reason.
    pub failure_reason: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last status change.
    pub updated_at: DateTime<Utc>,
    /// When the current holder claimed it.
    pub assigned_at: Option<DateTime<Utc>>,
    /// When it reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Parent plan for plan-generated tasks.
    pub fn parent_plan_id(&self) -> Option<Uuid> {
        match &self.payload {
            TaskPayload::PlanStep(step) => Some(step.parent_plan_id),
            TaskPayload::Ordinary { .. } => None,
        }
    }

    /// Plan-local id for plan-generated tasks.
    pub fn subtask_id(&self) -> Option<&str> {
        match &self.payload {
            TaskPayload::PlanStep(step) => Some(step.subtask_id.as_str()),
            TaskPayload::Ordinary { .. } => None,
        }
    }

    /// Declared sibling dependencies; empty for ordinary tasks.
    pub fn dependencies(&self) -> &[String] {
        match &self.payload {
            TaskPayload::PlanStep(step) => &step.dependencies,
            TaskPayload::Ordinary { .. } => &[],
        }
    }

    /// Whether the task was generated by a plan.
    pub fn is_plan_step(&self) -> bool {
        matches!(self.payload, TaskPayload::PlanStep(_))
    }

    /// The phase whose success completes the task.
    pub fn final_phase(&self) -> Phase {
        self.required_phases
            .last()
            .copied()
            .unwrap_or(Phase::Execute)
    }
}

/// Input for creating an ordinary task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    /// Short title.
    pub title: String,
    /// Longer description.
    #[serde(default)]
    pub description: String,
    /// Capability key.
    #[serde(default = "default_task_type")]
    pub task_type: String,
    /// Dispatch priority; higher first.
    #[serde(default)]
    pub priority: i64,
    /// Required phases, in order.
    #[serde(default = "default_phases")]
    pub phases: Vec<Phase>,
    /// Free-form parameters for the worker.
    #[serde(default)]
    pub params: serde_json::Value,
}

impl NewTask {
    /// A task with a single `execute` phase.
    pub fn new(title: impl Into<String>, task_type: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: String::new(),
            task_type: task_type.into(),
            priority: 0,
            phases: default_phases(),
            params: serde_json::Value::Null,
        }
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Set the required phases.
    pub fn with_phases(mut self, phases: Vec<Phase>) -> Self {
        self.phases = phases;
        self
    }

    /// Set the worker parameters.
    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }
}

// --- Runs ---

/// Status of a single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Open; the worker is still on it.
    Running,
    /// The phase succeeded.
    Completed,
    /// The phase failed.
    Failed,
}

string_enum!(RunStatus, "run status", {
    Running => "running",
    Completed => "completed",
    Failed => "failed",
});

impl RunStatus {
    /// Completed or failed.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

fn default_retryable() -> bool {
    true
}

/// Structured outcome a worker reports for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    /// Short human-readable outcome.
    #[serde(default)]
    pub summary: String,
    /// Failure reason, if the run failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// `false` marks a failure that retrying cannot fix.
    #[serde(default = "default_retryable")]
    pub retryable: bool,
    /// Captured output, free-form.
    #[serde(default)]
    pub output: serde_json::Value,
}

impl RunResult {
    /// A successful result.
    pub fn success(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            error: None,
            retryable: true,
            output: serde_json::Value::Null,
        }
    }

    /// A retryable failure.
    pub fn failure(error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            summary: String::new(),
            error: Some(error),
            retryable: true,
            output: serde_json::Value::Null,
        }
    }

    /// Mark the failure as not worth retrying.
    pub fn permanent(mut self) -> Self {
        self.retryable = false;
        self
    }

    /// Attach captured output.
    pub fn with_output(mut self, output: serde_json::Value) -> Self {
        self.output = output;
        self
    }
}

/// A single execution attempt of a task at a given phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// Run id.
    pub id: Uuid,
    /// Task the run belongs to.
    pub task_id: Uuid,
    /// Worker that reported it.
    pub worker_id: String,
    /// Phase executed.
    pub phase: Phase,
    /// Outcome so far.
    pub status: RunStatus,
    /// The task's `retry_count` when this run was recorded.
    pub attempt: u32,
    /// Reported outcome, once finished.
    pub result: Option<RunResult>,
    /// When the run opened.
    pub started_at: DateTime<Utc>,
    /// When it finished.
    pub finished_at: Option<DateTime<Utc>>,
}

impl Run {
    /// Failure reason reported by the worker, if any.
    pub fn failure_reason(&self) -> Option<&str> {
        self.result.as_ref().and_then(|r| r.error.as_deref())
    }
}

/// The state change the retry manager asks the store to apply after a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TaskTransition {
    /// No status change (run still going, or an intermediate phase finished).
    Stay,
    /// Mark the task completed.
    Complete,
    /// Put the task back in the queue with `retry_count + 1`.
    Requeue {
        /// Backoff: not dispatchable before this instant.
        not_before: Option<DateTime<Utc>>,
    },
    /// Permanently fail the task, optionally escalating it.
    Fail {
        /// Recorded as the task's failure reason.
        reason: String,
        /// Whether to raise an escalation.
        escalate: bool,
    },
}

// --- Workers ---

/// Liveness status of a registered worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Taking work.
    Active,
    /// Finishing held work, taking nothing new.
    Draining,
}

string_enum!(WorkerStatus, "worker status", {
    Active => "active",
    Draining => "draining",
});

/// A live worker process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    /// Worker id.
    pub id: String,
    /// Free-form role label.
    pub role: String,
    /// Task types the worker accepts; empty accepts any.
    pub capabilities: Vec<String>,
    /// Liveness status.
    pub status: WorkerStatus,
    /// First registration.
    pub registered_at: DateTime<Utc>,
    /// Last heartbeat.
    pub last_heartbeat: DateTime<Utc>,
}

impl Worker {
    /// Whether this worker takes tasks of `task_type`.
    pub fn accepts(&self, task_type: &str) -> bool {
        capabilities_accept(&self.capabilities, task_type)
    }
}

/// Capability matching shared by workers and dispatch: an empty set accepts any type.
pub fn capabilities_accept(capabilities: &[String], task_type: &str) -> bool {
    capabilities.is_empty() || capabilities.iter().any(|c| c == task_type || c == "*")
}

// --- Escalations & reports ---

/// A permanently failed task surfaced for human intervention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Escalation {
    /// Escalation id.
    pub id: Uuid,
    /// The failed task.
    pub task_id: Uuid,
    /// Final failure reason.
    pub reason: String,
    /// Every run of the task, oldest first.
    pub run_ids: Vec<Uuid>,
    /// When the task failed.
    pub created_at: DateTime<Utc>,
    /// When an operator acknowledged it.
    pub acknowledged_at: Option<DateTime<Utc>>,
}

/// An escalation with everything an operator needs to diagnose it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationReport {
    /// The escalation row.
    pub escalation: Escalation,
    /// The failed task.
    pub task: Task,
    /// Its run history.
    pub runs: Vec<Run>,
}

/// A plan together with its tasks and the tasks that blocked completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanReport {
    /// The plan row.
    pub plan: ExecutionPlan,
    /// Every sub-task.
    pub tasks: Vec<Task>,
    /// Tasks not `completed` (empty for completed plans).
    pub blocking: Vec<Task>,
}

/// Result of saving a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedPlan {
    /// The saved plan.
    pub plan: ExecutionPlan,
    /// Sub-tasks that were created.
    pub tasks: Vec<Task>,
    /// Sub-task ids left out because they could not be inserted.
    pub omitted: Vec<String>,
}
