//! Shell-command workers and planners for the `hive worker` and
//! `hive planner` subcommands.

use async_trait::async_trait;
use hive_core::{
    HiveError, HiveResult, Phase, PlanDraft, PlanningRequest, RunResult, Task, TaskStatus,
};
use hive_orchestrator::{PlannerApi, WorkHandler, WorkerApi};
use serde_json::json;
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const MAX_STDOUT: usize = 50_000;
const MAX_STDERR: usize = 10_000;

fn truncate(text: &str, max_len: usize) -> String {
    if text.len() <= max_len {
        return text.to_string();
    }
    let mut end = max_len;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... [truncated, {} total bytes]", &text[..end], text.len())
}

fn last_line(text: &str) -> &str {
    text.trim().lines().last().unwrap_or("")
}

async fn sh(command: &str, env: &[(&str, &str)]) -> std::io::Result<Output> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command).stdin(Stdio::null());
    for (key, value) in env {
        cmd.env(key, value);
    }
    cmd.output().await
}

/// Heartbeat every third of the TTL until aborted. Re-registers the worker
/// if maintenance pruned it.
pub fn spawn_heartbeat(api: WorkerApi, ttl: Duration) -> JoinHandle<()> {
    let every = (ttl / 3).max(Duration::from_millis(100));
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(every);
        loop {
            timer.tick().await;
            match api.heartbeat().await {
                Ok(()) => {}
                Err(HiveError::NotFound(_)) => {
                    warn!(worker_id = %api.identity().id, "Worker row missing, re-registering");
                    if let Err(e) = api.register().await {
                        warn!(error = %e, "Re-registration failed");
                    }
                }
                Err(e) => warn!(worker_id = %api.identity().id, error = %e, "Heartbeat failed"),
            }
        }
    })
}

/// Runs one shell command per required phase of each claimed task.
///
/// The command sees `HIVE_TASK` (task JSON), `HIVE_PHASE` and
/// `HIVE_WORKER_ID`. Exit status 0 completes the phase.
pub struct ShellWorker {
    api: WorkerApi,
    command: String,
}

impl ShellWorker {
    /// Run `command` through `sh -c` for every phase.
    pub fn new(api: WorkerApi, command: impl Into<String>) -> Self {
        Self {
            api,
            command: command.into(),
        }
    }

    async fn run_phase(&self, task: &Task, phase: Phase) -> HiveResult<RunResult> {
        let task_json = serde_json::to_string(task)?;
        let env = [
            ("HIVE_TASK", task_json.as_str()),
            ("HIVE_PHASE", phase.as_str()),
            ("HIVE_WORKER_ID", self.api.identity().id.as_str()),
        ];
        let output = sh(&self.command, &env)
            .await
            .map_err(|e| HiveError::RunFailure {
                task_id: task.id,
                reason: format!("failed to spawn command: {e}"),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if output.status.success() {
            let captured = json!({
                "exit_code": output.status.code().unwrap_or(-1),
                "stdout": truncate(stdout.trim(), MAX_STDOUT),
                "stderr": truncate(stderr.trim(), MAX_STDERR),
            });
            Ok(RunResult::success(last_line(&stdout)).with_output(captured))
        } else {
            Err(HiveError::RunFailure {
                task_id: task.id,
                reason: format!("{}: {}", output.status, last_line(&stderr)),
            })
        }
    }
}

#[async_trait]
impl WorkHandler<Task> for ShellWorker {
    async fn handle(&self, task: Task) -> HiveResult<()> {
        for phase in &task.required_phases {
            self.api.begin_run(task.id, *phase).await?;
            let result = self.run_phase(&task, *phase).await;
            let outcome = self.api.settle(task.id, *phase, result).await?;
            if outcome.task.status != TaskStatus::InProgress {
                break;
            }
        }
        Ok(())
    }
}

/// Turns planning requests into plans with a shell command.
///
/// The command sees `HIVE_REQUEST` (request JSON) and must print a plan draft
/// as JSON on stdout. A failing command or an invalid draft fails the
/// request.
pub struct ShellPlanner {
    api: PlannerApi,
    command: String,
}

impl ShellPlanner {
    /// Ask `command` for a plan draft per request.
    pub fn new(api: PlannerApi, command: impl Into<String>) -> Self {
        Self {
            api,
            command: command.into(),
        }
    }

    async fn draft_for(&self, request: &PlanningRequest) -> HiveResult<Result<PlanDraft, String>> {
        let request_json = serde_json::to_string(request)?;
        let output = match sh(&self.command, &[("HIVE_REQUEST", request_json.as_str())]).await {
            Ok(output) => output,
            Err(e) => return Ok(Err(format!("failed to spawn planner: {e}"))),
        };
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Ok(Err(format!("{}: {}", output.status, last_line(&stderr))));
        }
        Ok(serde_json::from_slice::<PlanDraft>(&output.stdout)
            .map_err(|e| format!("planner printed an invalid draft: {e}")))
    }
}

/// Why a request is failed after its plan could not be saved.
///
/// Transient and fatal errors are returned instead, so the dispatcher hands
/// the request back or stops.
fn unsaved_plan_reason(error: HiveError) -> HiveResult<String> {
    match error {
        HiveError::InvalidPlan(reason) => Ok(reason),
        e if e.is_transient() || e.is_fatal() => Err(e),
        e => Ok(format!("plan could not be saved: {e}")),
    }
}

#[async_trait]
impl WorkHandler<PlanningRequest> for ShellPlanner {
    async fn handle(&self, request: PlanningRequest) -> HiveResult<()> {
        let reason = match self.draft_for(&request).await? {
            Ok(draft) => match self.api.save_plan(request.id, &draft).await {
                Ok(saved) => {
                    info!(request_id = %request.id, plan_id = %saved.plan.id, "Request planned");
                    return Ok(());
                }
                Err(e) => unsaved_plan_reason(e)?,
            },
            Err(reason) => reason,
        };
        self.api.fail(request.id, &reason).await?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use hive_core::{HiveConfig, NewPlanningRequest, NewTask, PlanningStatus};
    use hive_orchestrator::{Queen, WorkerIdentity};
    use tempfile::TempDir;

    async fn queen(dir: &TempDir) -> Queen {
        let config = HiveConfig {
            database: dir.path().join("cli.db"),
            ..Default::default()
        };
        Queen::open(config).await.unwrap()
    }

    async fn claimed_task(queen: &Queen, phases: Vec<Phase>) -> (WorkerApi, Task) {
        let api = queen.worker_api(WorkerIdentity::new("sh-1", "shell"));
        api.register().await.unwrap();
        queen
            .store()
            .create_task(NewTask::new("echo", "general").with_phases(phases))
            .await
            .unwrap();
        let task = api.claim_next().await.unwrap().unwrap();
        (api, task)
    }

    #[test]
    fn test_last_line() {
        assert_eq!(last_line("a\nb\n\n"), "b");
        assert_eq!(last_line(""), "");
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 10), "short");
        let out = truncate("ééé", 3);
        assert!(out.starts_with("é... [truncated, 6 total bytes]"));
    }

    #[tokio::test]
    async fn test_successful_command_completes_every_phase() {
        let dir = TempDir::new().unwrap();
        let queen = queen(&dir).await;
        let (api, task) = claimed_task(&queen, vec![Phase::Apply, Phase::Test]).await;
        let worker = ShellWorker::new(api, r#"echo "ran $HIVE_PHASE""#);
        worker.handle(task.clone()).await.unwrap();

        let task = queen.store().get_task(task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        let runs = queen.store().list_runs(task.id).await.unwrap();
        let summaries: Vec<String> = runs
            .iter()
            .map(|r| r.result.as_ref().unwrap().summary.clone())
            .collect();
        assert_eq!(summaries, vec!["ran apply", "ran test"]);
    }

    #[tokio::test]
    async fn test_failing_command_requeues_with_reason() {
        let dir = TempDir::new().unwrap();
        let queen = queen(&dir).await;
        let (api, task) = claimed_task(&queen, vec![Phase::Apply, Phase::Test]).await;
        let worker = ShellWorker::new(api, "echo 'disk full' >&2; exit 3");
        worker.handle(task.clone()).await.unwrap();

        let task = queen.store().get_task(task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.retry_count, 1);
        assert!(task.failure_reason.unwrap().contains("disk full"));
        // The second phase never ran.
        assert_eq!(queen.store().list_runs(task.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_planner_saves_printed_draft() {
        let dir = TempDir::new().unwrap();
        let queen = queen(&dir).await;
        let api = queen.planner_api("sh-planner");
        let request = api
            .submit(NewPlanningRequest::new("two steps", "cli"))
            .await
            .unwrap();
        let claimed = api.claim_next().await.unwrap().unwrap();
        let planner = ShellPlanner::new(
            api,
            r#"echo '{"summary":"s","steps":[{"subtask_id":"a","title":"A"},{"subtask_id":"b","title":"B","dependencies":["a"]}]}'"#,
        );
        planner.handle(claimed).await.unwrap();

        let plan = queen
            .store()
            .get_plan_for_request(request.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(plan.plan_data.steps.len(), 2);
    }

    #[test]
    fn test_unsaved_plan_reasons() {
        assert_eq!(
            unsaved_plan_reason(HiveError::InvalidPlan("cycle".into())).unwrap(),
            "cycle"
        );
        let reason = unsaved_plan_reason(HiveError::Store("disk I/O error".into())).unwrap();
        assert_eq!(reason, "plan could not be saved: Store error: disk I/O error");
        assert!(unsaved_plan_reason(HiveError::NotFound("request".into())).is_ok());

        let busy = unsaved_plan_reason(HiveError::StoreBusy("locked".into())).unwrap_err();
        assert!(busy.is_transient());
        let corrupt = unsaved_plan_reason(HiveError::StoreCorruption("bad".into())).unwrap_err();
        assert!(corrupt.is_fatal());
    }

    #[tokio::test]
    async fn test_planner_fails_request_on_invalid_draft() {
        let dir = TempDir::new().unwrap();
        let queen = queen(&dir).await;
        let api = queen.planner_api("sh-planner");
        let request = api
            .submit(NewPlanningRequest::new("cyclic", "cli"))
            .await
            .unwrap();
        let claimed = api.claim_next().await.unwrap().unwrap();
        let planner = ShellPlanner::new(
            api,
            r#"echo '{"summary":"s","steps":[{"subtask_id":"a","title":"A","dependencies":["a"]}]}'"#,
        );
        planner.handle(claimed).await.unwrap();

        let request = queen
            .store()
            .get_planning_request(request.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(request.status, PlanningStatus::Failed);
        assert!(request.failure_reason.is_some());
    }
}
