//! Process configuration loaded from `hive.toml`.
//!
//! Every section and field has a default, so an empty (or missing) file
//! yields a working configuration.

use crate::error::{HiveError, HiveResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upper bound for lease-style durations, in seconds (30 days).
pub const MAX_LEASE_SECS: u64 = 30 * 24 * 60 * 60;

/// Top-level configuration for every Hive process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HiveConfig {
    /// SQLite database file shared by all processes.
    #[serde(default = "default_database")]
    pub database: PathBuf,
    /// `[pool]` section.
    #[serde(default)]
    pub pool: PoolSettings,
    /// `[dispatch]` section.
    #[serde(default)]
    pub dispatch: DispatchSettings,
    /// `[retry]` section.
    #[serde(default)]
    pub retry: RetrySettings,
    /// `[propagation]` section.
    #[serde(default)]
    pub propagation: PropagationSettings,
    /// `[workers]` section.
    #[serde(default)]
    pub workers: WorkerSettings,
}

impl Default for HiveConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            pool: PoolSettings::default(),
            dispatch: DispatchSettings::default(),
            retry: RetrySettings::default(),
            propagation: PropagationSettings::default(),
            workers: WorkerSettings::default(),
        }
    }
}

/// Connection pool sizing and deadlines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Connections opened at startup.
    #[serde(default = "default_min_connections")]
    pub min_connections: usize,
    /// Upper bound on open connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// How long an acquire waits for a free connection.
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    /// How long SQLite waits on a locked database before reporting busy.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_connections: default_min_connections(),
            max_connections: default_max_connections(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl PoolSettings {
    /// [`PoolSettings::acquire_timeout_ms`] as a `Duration`.
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    /// [`PoolSettings::busy_timeout_ms`] as a `Duration`.
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// Dispatch loop cadence and identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchSettings {
    /// Idle sleep between claim attempts.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Identity stamped on planning requests claimed by this process.
    #[serde(default = "default_agent_id")]
    pub agent_id: String,
    /// A planning request assigned for longer than this goes back to
    /// `pending`.
    #[serde(default = "default_planning_lease_secs")]
    pub planning_lease_secs: u64,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            agent_id: default_agent_id(),
            planning_lease_secs: default_planning_lease_secs(),
        }
    }
}

impl DispatchSettings {
    /// [`DispatchSettings::poll_interval_ms`] as a `Duration`.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// [`DispatchSettings::planning_lease_secs`] as a `Duration`.
    pub fn planning_lease(&self) -> Duration {
        Duration::from_secs(self.planning_lease_secs)
    }
}

/// Delay applied before a failed task becomes eligible again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// Re-queue immediately.
    None,
    /// Constant delay.
    Fixed { delay_ms: u64 },
    /// `base_ms * 2^(attempt - 1)`, capped at `max_ms`.
    Exponential { base_ms: u64, max_ms: u64 },
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Exponential {
            base_ms: 1_000,
            max_ms: 60_000,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match *self {
            BackoffPolicy::None => Duration::ZERO,
            BackoffPolicy::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            BackoffPolicy::Exponential { base_ms, max_ms } => {
                let exponent = attempt.saturating_sub(1).min(32);
                let factor = 1u64 << exponent;
                Duration::from_millis(base_ms.saturating_mul(factor).min(max_ms))
            }
        }
    }
}

/// Retry bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Re-queues allowed before a task fails for good.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before each re-queued attempt.
    #[serde(default)]
    pub backoff: BackoffPolicy,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// How a plan reacts to a permanently failed task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanFailurePolicy {
    /// Stay `executing` until every task is terminal.
    #[default]
    WaitForAll,
    /// Fail the plan on the first irrecoverable task and cancel queued siblings.
    FailFast,
}

/// Plan status propagation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PropagationSettings {
    /// Reaction to failed or cancelled tasks.
    #[serde(default)]
    pub plan_failure_policy: PlanFailurePolicy,
}

/// Worker liveness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSettings {
    /// A worker without a heartbeat for this long is considered gone.
    #[serde(default = "default_heartbeat_ttl_secs")]
    pub heartbeat_ttl_secs: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            heartbeat_ttl_secs: default_heartbeat_ttl_secs(),
        }
    }
}

impl WorkerSettings {
    /// [`WorkerSettings::heartbeat_ttl_secs`] as a `Duration`.
    pub fn heartbeat_ttl(&self) -> Duration {
        Duration::from_secs(self.heartbeat_ttl_secs)
    }
}

fn default_database() -> PathBuf {
    PathBuf::from("./data/hive.db")
}
fn default_min_connections() -> usize {
    1
}
fn default_max_connections() -> usize {
    8
}
fn default_acquire_timeout_ms() -> u64 {
    5_000
}
fn default_busy_timeout_ms() -> u64 {
    5_000
}
fn default_poll_interval_ms() -> u64 {
    2_000
}
fn default_agent_id() -> String {
    "queen".to_string()
}
fn default_planning_lease_secs() -> u64 {
    900
}
fn default_max_retries() -> u32 {
    3
}
fn default_heartbeat_ttl_secs() -> u64 {
    60
}

impl HiveConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(raw: &str) -> HiveResult<Self> {
        let config: HiveConfig =
            toml::from_str(raw).map_err(|e| HiveError::Config(format!("Invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> HiveResult<Self> {
        match std::fs::read_to_string(path) {
            Ok(raw) => Self::from_toml_str(&raw),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = Self::default();
                config.validate()?;
                Ok(config)
            }
            Err(e) => Err(HiveError::Config(format!(
                "Failed to read config file '{}': {e}",
                path.display()
            ))),
        }
    }

    /// Reject settings no pool or loop can run with.
    pub fn validate(&self) -> HiveResult<()> {
        if self.pool.max_connections == 0 {
            return Err(HiveError::Config(
                "pool.max_connections must be at least 1".to_string(),
            ));
        }
        if self.pool.min_connections > self.pool.max_connections {
            return Err(HiveError::Config(format!(
                "pool.min_connections ({}) exceeds pool.max_connections ({})",
                self.pool.min_connections, self.pool.max_connections
            )));
        }
        if self.pool.acquire_timeout_ms == 0 || self.pool.busy_timeout_ms == 0 {
            return Err(HiveError::Config(
                "pool timeouts must be greater than zero".to_string(),
            ));
        }
        if self.dispatch.poll_interval_ms == 0 {
            return Err(HiveError::Config(
                "dispatch.poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if !(1..=MAX_LEASE_SECS).contains(&self.workers.heartbeat_ttl_secs) {
            return Err(HiveError::Config(format!(
                "workers.heartbeat_ttl_secs must be between 1 and {MAX_LEASE_SECS}"
            )));
        }
        if !(1..=MAX_LEASE_SECS).contains(&self.dispatch.planning_lease_secs) {
            return Err(HiveError::Config(format!(
                "dispatch.planning_lease_secs must be between 1 and {MAX_LEASE_SECS}"
            )));
        }
        Ok(())
    }
}
