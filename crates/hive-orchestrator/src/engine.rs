use crate::api::{record_decided, PlannerApi, WorkerApi, WorkerIdentity};
use crate::monitor::{DispatchMonitor, MonitorSnapshot};
use crate::propagator::{PropagationReport, Propagator};
use crate::retry::{orphan_report, RetryManager};
use chrono::{DateTime, Utc};
use hive_core::{EscalationReport, HiveConfig, HiveError, HiveResult, PlanReport, Task};
use hive_store::{PoolStats, StatusCounts, TaskStore};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Outcome of one maintenance cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    /// Tasks whose lost worker's attempt was failed.
    pub orphans_recovered: usize,
    /// Planning requests whose lease expired, now pending again.
    pub planning_reclaimed: usize,
    /// What the plan propagation sweep did.
    pub propagation: PropagationReport,
    /// Worker rows removed after outliving the heartbeat TTL.
    pub workers_pruned: usize,
}

/// Operator view of the whole system.
#[derive(Debug, Clone, Serialize)]
pub struct HiveStatus {
    /// Row counts by status.
    pub counts: StatusCounts,
    /// Connection pool statistics.
    pub pool: PoolStats,
    /// In-process dispatch metrics.
    pub metrics: MonitorSnapshot,
}

/// The maintenance process: propagates plan status, recovers orphaned
/// tasks and serves the operator surface.
///
/// Holds the shared store, retry policy and metrics that every worker and
/// planner handle it creates reuses.
pub struct Queen {
    config: HiveConfig,
    store: TaskStore,
    retry: Arc<RetryManager>,
    propagator: Propagator,
    monitor: Arc<DispatchMonitor>,
}

impl Queen {
    /// Validate `config`, open the pool and migrate the store.
    pub async fn open(config: HiveConfig) -> HiveResult<Self> {
        config.validate()?;
        let store = TaskStore::connect(&config).await?;
        Ok(Self::with_store(config, store))
    }

    /// Build on an already opened store.
    pub fn with_store(config: HiveConfig, store: TaskStore) -> Self {
        let retry = Arc::new(RetryManager::new(config.retry.clone()));
        let propagator = Propagator::new(store.clone(), config.propagation.plan_failure_policy);
        Self {
            config,
            store,
            retry,
            propagator,
            monitor: Arc::new(DispatchMonitor::new()),
        }
    }

    /// The validated configuration.
    pub fn config(&self) -> &HiveConfig {
        &self.config
    }

    /// The shared store.
    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    /// Metrics shared by every handle this queen creates.
    pub fn monitor(&self) -> &Arc<DispatchMonitor> {
        &self.monitor
    }

    /// The configured retry policy.
    pub fn retry(&self) -> &Arc<RetryManager> {
        &self.retry
    }

    /// A worker handle sharing this queen's store, retry policy and metrics.
    pub fn worker_api(&self, identity: WorkerIdentity) -> WorkerApi {
        WorkerApi::new(
            self.store.clone(),
            Arc::clone(&self.retry),
            Arc::clone(&self.monitor),
            identity,
        )
    }

    /// A planner handle acting as `agent_id`.
    pub fn planner_api(&self, agent_id: impl Into<String>) -> PlannerApi {
        PlannerApi::new(self.store.clone(), agent_id)
    }

    /// Workers silent since before this instant are considered gone.
    pub fn heartbeat_cutoff(&self, now: DateTime<Utc>) -> HiveResult<DateTime<Utc>> {
        let ttl = chrono::Duration::from_std(self.config.workers.heartbeat_ttl())
            .map_err(|e| HiveError::Config(format!("heartbeat_ttl_secs: {e}")))?;
        now.checked_sub_signed(ttl)
            .ok_or_else(|| HiveError::Config("heartbeat_ttl_secs out of range".into()))
    }

    /// Planning requests claimed before this instant have outlived their
    /// lease.
    pub fn planning_cutoff(&self, now: DateTime<Utc>) -> HiveResult<DateTime<Utc>> {
        let lease = chrono::Duration::from_std(self.config.dispatch.planning_lease())
            .map_err(|e| HiveError::Config(format!("planning_lease_secs: {e}")))?;
        now.checked_sub_signed(lease)
            .ok_or_else(|| HiveError::Config("planning_lease_secs out of range".into()))
    }

    /// Fail the current attempt of every orphaned task through the retry
    /// manager, as if its worker had reported the failure.
    pub async fn recover_orphans(&self) -> HiveResult<usize> {
        let cutoff = self.heartbeat_cutoff(Utc::now())?;
        let orphans = self.store.find_orphaned_tasks(cutoff).await?;
        let mut recovered = 0;
        for task in orphans {
            match self.recover_orphan(&task).await {
                Ok(()) => recovered += 1,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "Orphan recovery skipped");
                }
            }
        }
        Ok(recovered)
    }

    async fn recover_orphan(&self, task: &Task) -> HiveResult<()> {
        let history = self.store.list_runs(task.id).await?;
        let report = orphan_report(task, &history);
        warn!(
            task_id = %task.id,
            worker_id = %report.worker_id,
            phase = %report.phase,
            "Recovering task from lost worker"
        );
        record_decided(&self.store, &self.retry, &self.monitor, report).await?;
        self.monitor.record_orphan().await;
        Ok(())
    }

    /// One maintenance cycle: orphan recovery, planning lease reclaim, plan
    /// propagation, then pruning of workers silent past the heartbeat TTL.
    pub async fn maintenance_once(&self) -> HiveResult<MaintenanceReport> {
        let orphans_recovered = self.recover_orphans().await?;
        let planning_reclaimed = self
            .store
            .reclaim_expired_planning_requests(self.planning_cutoff(Utc::now())?)
            .await?
            .len();
        let propagation = self.propagator.propagate_once().await?;
        self.monitor.record_propagation(&propagation).await;
        let cutoff = self.heartbeat_cutoff(Utc::now())?;
        let workers_pruned = self.store.prune_stale_workers(cutoff).await?;
        Ok(MaintenanceReport {
            orphans_recovered,
            planning_reclaimed,
            propagation,
            workers_pruned,
        })
    }

    /// Run maintenance every poll interval until `shutdown` turns `true`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> HiveResult<()> {
        let interval = self.config.dispatch.poll_interval();
        info!(
            agent_id = %self.config.dispatch.agent_id,
            interval_ms = interval.as_millis() as u64,
            policy = ?self.propagator.policy(),
            "Queen started"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.maintenance_once().await {
                Ok(_) => {}
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "Queen stopping on fatal error");
                    self.monitor.record_error("queen", &e).await;
                    return Err(e);
                }
                Err(e) => {
                    warn!(error = %e, "Maintenance cycle failed");
                    self.monitor.record_error("queen", &e).await;
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("Queen stopped");
        Ok(())
    }

    // --- Operator surface ---

    /// Cancel a task that has not reached a terminal state.
    pub async fn cancel_task(&self, task_id: Uuid, reason: &str) -> HiveResult<Task> {
        self.store.cancel_task(task_id, reason).await
    }

    /// Escalations, newest first; acknowledged ones only when asked.
    pub async fn list_escalations(
        &self,
        include_acknowledged: bool,
    ) -> HiveResult<Vec<EscalationReport>> {
        self.store.list_escalations(include_acknowledged).await
    }

    /// Mark an escalation handled; returns whether it was open.
    pub async fn acknowledge_escalation(&self, id: Uuid) -> HiveResult<bool> {
        self.store.acknowledge_escalation(id).await
    }

    /// A plan with its sub-tasks and their current states.
    pub async fn plan_report(&self, plan_id: Uuid) -> HiveResult<PlanReport> {
        self.store.plan_report(plan_id).await
    }

    /// Counts, pool statistics and metrics in one snapshot.
    pub async fn status(&self) -> HiveResult<HiveStatus> {
        Ok(HiveStatus {
            counts: self.store.status_counts().await?,
            pool: self.store.pool().stats(),
            metrics: self.monitor.snapshot().await,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> HiveConfig {
        HiveConfig {
            database: dir.path().join("queen.db"),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_open_rejects_invalid_config() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.pool.max_connections = 0;
        assert!(matches!(
            Queen::open(config).await,
            Err(HiveError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_heartbeat_cutoff() {
        let dir = TempDir::new().unwrap();
        let queen = Queen::open(config(&dir)).await.unwrap();
        let now = Utc::now();
        assert_eq!(
            now - queen.heartbeat_cutoff(now).unwrap(),
            chrono::Duration::seconds(60)
        );
    }

    #[tokio::test]
    async fn test_planning_cutoff_uses_lease() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.dispatch.planning_lease_secs = 120;
        let queen = Queen::open(config).await.unwrap();
        let now = Utc::now();
        assert_eq!(
            now - queen.planning_cutoff(now).unwrap(),
            chrono::Duration::seconds(120)
        );
    }

    #[tokio::test]
    async fn test_maintenance_reclaims_expired_planning_leases() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.dispatch.planning_lease_secs = 1;
        let queen = Queen::open(config).await.unwrap();
        let planner = queen.planner_api("stalled-planner");
        let request = planner
            .submit(hive_core::NewPlanningRequest::new("stalled", "ops"))
            .await
            .unwrap();
        planner.claim_next().await.unwrap().unwrap();

        // Still within the lease.
        assert_eq!(queen.maintenance_once().await.unwrap().planning_reclaimed, 0);

        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        let report = queen.maintenance_once().await.unwrap();
        assert_eq!(report.planning_reclaimed, 1);

        let reclaimed = queen
            .planner_api("planner-2")
            .claim_next()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reclaimed.id, request.id);
        assert_eq!(reclaimed.assigned_agent.as_deref(), Some("planner-2"));
    }

    #[tokio::test]
    async fn test_idle_maintenance_and_status() {
        let dir = TempDir::new().unwrap();
        let queen = Queen::open(config(&dir)).await.unwrap();
        let report = queen.maintenance_once().await.unwrap();
        assert_eq!(report, MaintenanceReport::default());

        let status = queen.status().await.unwrap();
        assert_eq!(status.counts.workers, 0);
        assert!(status.pool.open >= 1);
        assert_eq!(status.pool.max, queen.config().pool.max_connections);
    }

    #[tokio::test]
    async fn test_run_until_shutdown() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.dispatch.poll_interval_ms = 10;
        let queen = Arc::new(Queen::open(config).await.unwrap());
        let (tx, rx) = watch::channel(false);
        let handle = {
            let queen = Arc::clone(&queen);
            tokio::spawn(async move { queen.run(rx).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(40)).await;
        tx.send(true).unwrap();
        let result = tokio::time::timeout(std::time::Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
