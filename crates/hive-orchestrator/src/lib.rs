//! Dispatch loops, retry/escalation decisions and plan status propagation
//! for the Hive task orchestration engine.
//!
//! Everything here coordinates only through the [`hive_store::TaskStore`];
//! any number of processes can run these loops against the same database.
//!
//! # Main types
//!
//! - [`Queen`]: Maintenance process: plan propagation, orphan recovery and
//!   the operator surface.
//! - [`Dispatcher`]: Generic poll loop over a [`WorkSource`], feeding a
//!   [`WorkHandler`].
//! - [`WorkerApi`] / [`PlannerApi`]: Contracts used by worker and planning
//!   processes.
//! - [`RetryManager`]: Pure decision of the next task state after each run.
//! - [`Propagator`]: Derives plan status from task status.
//! - [`DispatchMonitor`]: In-process claim and outcome counters.

/// Worker and planner contracts.
pub mod api;
/// Generic polling dispatch loop.
pub mod dispatcher;
/// The queen maintenance process.
pub mod engine;
/// In-process dispatch metrics.
pub mod monitor;
/// Plan status propagation.
pub mod propagator;
/// Retry and escalation decisions.
pub mod retry;

pub use api::{PlannerApi, WorkerApi, WorkerIdentity};
pub use dispatcher::{Dispatcher, PlanningSource, TaskSource, WorkHandler, WorkSource};
pub use engine::{HiveStatus, MaintenanceReport, Queen};
pub use monitor::{DispatchMonitor, LoopMetrics, MonitorSnapshot, OutcomeMetrics};
pub use propagator::{evaluate, PlanVerdict, PropagationReport, Propagator};
pub use retry::{abandoned_attempt_report, orphan_report, phases_satisfied, RetryManager, LOST_WORKER_REASON};
