use crate::propagator::PropagationReport;
use hive_core::{HiveError, TaskTransition};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Counters for one polling loop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoopMetrics {
    /// Polls that claimed an item.
    pub claims: u64,
    /// Polls that found nothing to claim.
    pub idle_polls: u64,
    /// Failed cycles and releases.
    pub errors: u64,
    /// Display text of the most recent error.
    pub last_error: Option<String>,
}

/// Counters for what happened to tasks and plans.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeMetrics {
    /// Tasks completed.
    pub completions: u64,
    /// Tasks requeued.
    pub retries: u64,
    /// Tasks failed.
    pub failures: u64,
    /// Escalations raised.
    pub escalations: u64,
    /// Tasks recovered from lost workers.
    pub orphans_recovered: u64,
    /// Sub-tasks cancelled by propagation.
    pub tasks_cancelled: u64,
    /// Plans completed.
    pub plans_completed: u64,
    /// Plans failed.
    pub plans_failed: u64,
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MonitorSnapshot {
    /// Per-loop counters keyed by source name.
    pub loops: BTreeMap<String, LoopMetrics>,
    /// Task and plan outcome counters.
    pub outcomes: OutcomeMetrics,
}

/// In-process dispatch metrics. Informational only; the store stays the
/// source of truth.
pub struct DispatchMonitor {
    loops: Arc<RwLock<HashMap<String, LoopMetrics>>>,
    outcomes: Arc<RwLock<OutcomeMetrics>>,
}

impl DispatchMonitor {
    /// A monitor with every counter at zero.
    pub fn new() -> Self {
        Self {
            loops: Arc::new(RwLock::new(HashMap::new())),
            outcomes: Arc::new(RwLock::new(OutcomeMetrics::default())),
        }
    }

    /// A loop claimed an item.
    pub async fn record_claim(&self, source: &str) {
        let mut loops = self.loops.write().await;
        loops.entry(source.to_string()).or_default().claims += 1;
    }

    /// A loop found nothing to claim.
    pub async fn record_idle(&self, source: &str) {
        let mut loops = self.loops.write().await;
        loops.entry(source.to_string()).or_default().idle_polls += 1;
    }

    /// A loop hit an error; the message is kept as `last_error`.
    pub async fn record_error(&self, source: &str, error: &HiveError) {
        let mut loops = self.loops.write().await;
        let metrics = loops.entry(source.to_string()).or_default();
        metrics.errors += 1;
        metrics.last_error = Some(error.to_string());
    }

    /// Count the effect of a recorded run.
    pub async fn record_transition(&self, transition: &TaskTransition, escalated: bool) {
        let mut outcomes = self.outcomes.write().await;
        match transition {
            TaskTransition::Stay => {}
            TaskTransition::Complete => outcomes.completions += 1,
            TaskTransition::Requeue { .. } => outcomes.retries += 1,
            TaskTransition::Fail { .. } => outcomes.failures += 1,
        }
        if escalated {
            outcomes.escalations += 1;
        }
    }

    /// A task was recovered from a lost worker.
    pub async fn record_orphan(&self) {
        self.outcomes.write().await.orphans_recovered += 1;
    }

    /// Add the plan outcomes of one propagation sweep.
    pub async fn record_propagation(&self, report: &PropagationReport) {
        let mut outcomes = self.outcomes.write().await;
        outcomes.tasks_cancelled += report.tasks_cancelled as u64;
        outcomes.plans_completed += report.completed as u64;
        outcomes.plans_failed += report.failed as u64;
    }

    /// Counters for one loop, if it has polled yet.
    pub async fn loop_metrics(&self, source: &str) -> Option<LoopMetrics> {
        self.loops.read().await.get(source).cloned()
    }

    /// Copy every counter.
    pub async fn snapshot(&self) -> MonitorSnapshot {
        let loops = self.loops.read().await;
        let outcomes = self.outcomes.read().await;
        MonitorSnapshot {
            loops: loops
                .iter()
                .map(|(name, metrics)| (name.clone(), metrics.clone()))
                .collect(),
            outcomes: outcomes.clone(),
        }
    }

    /// Serialize the current counters as JSON (for `hive status`).
    pub async fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self.snapshot().await).unwrap_or(serde_json::Value::Null)
    }
}

impl Default for DispatchMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_initial_snapshot_is_empty() {
        let monitor = DispatchMonitor::new();
        let snapshot = monitor.snapshot().await;
        assert!(snapshot.loops.is_empty());
        assert_eq!(snapshot.outcomes, OutcomeMetrics::default());
    }

    #[tokio::test]
    async fn test_loop_counters() {
        let monitor = DispatchMonitor::new();
        monitor.record_claim("tasks:w1").await;
        monitor.record_claim("tasks:w1").await;
        monitor.record_idle("tasks:w1").await;
        monitor
            .record_error("tasks:w1", &HiveError::PoolExhausted { timeout_ms: 5 })
            .await;

        let metrics = monitor.loop_metrics("tasks:w1").await.unwrap();
        assert_eq!(metrics.claims, 2);
        assert_eq!(metrics.idle_polls, 1);
        assert_eq!(metrics.errors, 1);
        assert!(metrics.last_error.unwrap().contains("exhausted"));
        assert!(monitor.loop_metrics("planning:queen").await.is_none());
    }

    #[tokio::test]
    async fn test_transition_counters() {
        let monitor = DispatchMonitor::new();
        monitor.record_transition(&TaskTransition::Complete, false).await;
        monitor
            .record_transition(&TaskTransition::Requeue { not_before: None }, false)
            .await;
        monitor
            .record_transition(
                &TaskTransition::Fail {
                    reason: "x".into(),
                    escalate: true,
                },
                true,
            )
            .await;
        monitor.record_transition(&TaskTransition::Stay, false).await;
        monitor.record_orphan().await;

        let outcomes = monitor.snapshot().await.outcomes;
        assert_eq!(outcomes.completions, 1);
        assert_eq!(outcomes.retries, 1);
        assert_eq!(outcomes.failures, 1);
        assert_eq!(outcomes.escalations, 1);
        assert_eq!(outcomes.orphans_recovered, 1);
    }

    #[tokio::test]
    async fn test_to_json() {
        let monitor = DispatchMonitor::new();
        monitor.record_claim("planning:queen").await;
        let json = monitor.to_json().await;
        assert_eq!(json["loops"]["planning:queen"]["claims"], 1);
        assert_eq!(json["outcomes"]["completions"], 0);
    }
}
