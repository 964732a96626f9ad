//! SQLite persistence for the Hive task orchestration engine.
//!
//! Every process (the queen, planning agents, workers, operator tooling)
//! shares one database file and coordinates only through it. All state
//! changes that other processes race on are conditional updates inside
//! immediate transactions.
//!
//! # Main types
//!
//! - [`ConnectionPool`]: Bounded pool of WAL-mode connections with an
//!   acquisition timeout and validation on release.
//! - [`TaskStore`]: Typed operations over planning requests, plans, tasks,
//!   runs, workers and escalations.
//! - [`DependencyState`]: Whether a plan-generated task may run.
//! - [`RunReport`] / [`RunOutcome`]: Input and result of recording a run.

/// Column encoding helpers.
mod codec;
/// Operator escalations.
mod escalations;
/// Planning queue.
mod planning;
/// Execution plans and their sub-tasks.
mod plans;
/// Connection pooling.
pub mod pool;
/// Dependency resolution.
pub mod resolver;
/// Run recording and task transitions.
mod runs;
/// Schema migrations.
pub mod schema;
mod store;
/// Task queue.
mod tasks;
/// Worker registry.
mod workers;

pub use plans::validate_draft;
pub use pool::{ConnectionPool, PoolConfig, PoolStats, PooledConnection};
pub use resolver::{evaluate_dependencies, DependencyState};
pub use runs::{RunOutcome, RunReport};
pub use store::{StatusCounts, TaskStore};
