//! Core types, configuration and error definitions for the Hive task
//! orchestration engine.
//!
//! This crate is shared by the store, the orchestrator and the CLI. It holds
//! no I/O beyond reading the configuration file.
//!
//! # Main types
//!
//! - [`HiveError`]: Unified error enum; see [`HiveError::is_transient`] and
//!   [`HiveError::is_fatal`] for how loops react to each class.
//! - [`HiveResult`]: Convenience alias for `Result<T, HiveError>`.
//! - [`PlanningRequest`], [`ExecutionPlan`], [`Task`], [`Run`], [`Worker`]: the
//!   durable data model.
//! - [`TaskTransition`]: the status change applied after a run is recorded.
//! - [`HiveConfig`]: process configuration loaded from `hive.toml`.

/// Process configuration.
pub mod config;
/// Error taxonomy.
pub mod error;
/// Durable data model.
pub mod model;

pub use config::{
    BackoffPolicy, DispatchSettings, HiveConfig, PlanFailurePolicy, PoolSettings,
    PropagationSettings, RetrySettings, WorkerSettings, MAX_LEASE_SECS,
};
pub use error::{HiveError, HiveResult};
pub use model::{
    capabilities_accept, Escalation, EscalationReport, ExecutionPlan, NewPlanningRequest,
    NewTask, ParseEnumError, Phase, PlanData, PlanDraft, PlanReport, PlanStatus,
    PlanStepPayload, PlanningRequest, PlanningStatus, RequestContext, Run, RunResult, RunStatus,
    SavedPlan, SubTaskSpec, Task, TaskPayload, TaskStatus, TaskTransition, Worker, WorkerStatus,
};
