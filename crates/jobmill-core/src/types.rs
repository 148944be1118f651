//! Job records, run outcomes, and error definitions
//!
//! Contains the core types shared by the store, synchronizer, and engine.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::triggers::TriggerSpec;

/// Result type for scheduler operations
pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Stable job identifier. Caller-supplied or generated (UUID v4).
pub type JobId = String;

/// Scheduler error types
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// Trigger spec is malformed or can never fire
    #[error("invalid trigger: {0}")]
    InvalidTrigger(String),
    /// Operation referenced an unknown job id
    #[error("job not found: {0}")]
    NotFound(JobId),
    /// Optimistic-concurrency version mismatch
    #[error("version conflict on job {0}")]
    Conflict(JobId),
    /// Underlying persistence failure
    #[error("store error: {0}")]
    Store(String),
    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Invalid engine or store configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// The engine is no longer running
    #[error("scheduler engine is not running")]
    ChannelClosed,
}

/// Lifecycle state of a job record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Eligible for scheduling
    Active,
    /// Kept in the store but never fired
    Paused,
    /// Soft-deleted, pending physical removal by the adapter
    Deleted,
}

impl JobState {
    /// Stable string form used by store adapters.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Active => "active",
            JobState::Paused => "paused",
            JobState::Deleted => "deleted",
        }
    }
}

impl std::str::FromStr for JobState {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(JobState::Active),
            "paused" => Ok(JobState::Paused),
            "deleted" => Ok(JobState::Deleted),
            other => Err(SchedulerError::Store(format!("unknown job state: {other}"))),
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque reference to the work a job performs: a registered action name
/// plus serializable arguments. The core never inspects the arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobAction {
    /// Name resolved through the [`ActionRegistry`](crate::registry::ActionRegistry)
    pub name: String,
    /// Arguments handed to the handler verbatim
    #[serde(default)]
    pub args: Value,
}

impl JobAction {
    /// Create an action with no arguments.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Value::Null,
        }
    }

    /// Set the action arguments.
    pub fn with_args(mut self, args: Value) -> Self {
        self.args = args;
        self
    }
}

/// Durable job definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    /// Unique, stable job id
    pub id: JobId,
    /// Human-readable job name
    pub name: String,
    /// When the job fires
    pub trigger: TriggerSpec,
    /// What the job does
    pub action: JobAction,
    /// Lifecycle state
    pub state: JobState,
    /// Grace period for late fires; `None` uses the engine default
    pub misfire_grace_secs: Option<u64>,
    /// Concurrency cap for overlapping occurrences of this job
    pub max_instances: u32,
    /// Authoritative cache of the trigger's next fire time.
    /// `None` iff the trigger is exhausted or the job is Paused/Deleted.
    pub next_run_at: Option<DateTime<Utc>>,
    /// Last actual execution
    pub last_run_at: Option<DateTime<Utc>>,
    /// Monotonic counter for optimistic concurrency
    pub version: u64,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp
    pub updated_at: DateTime<Utc>,
    /// Total executions (successes and failures)
    pub run_count: u64,
    /// Failed executions
    pub failure_count: u64,
}

impl JobRecord {
    /// Misfire grace for this job, falling back to the engine default.
    pub fn misfire_grace(&self, default_secs: u64) -> Duration {
        Duration::seconds(self.misfire_grace_secs.unwrap_or(default_secs) as i64)
    }

    /// Whether the job is eligible for scheduling.
    pub fn is_active(&self) -> bool {
        self.state == JobState::Active
    }
}

/// Request to create a new job
#[derive(Debug, Clone)]
pub struct NewJob {
    /// Explicit id; generated when absent
    pub id: Option<JobId>,
    /// Human-readable name
    pub name: String,
    /// Trigger specification
    pub trigger: TriggerSpec,
    /// Action reference
    pub action: JobAction,
    /// Per-job misfire grace override
    pub misfire_grace_secs: Option<u64>,
    /// Concurrency cap, default 1
    pub max_instances: u32,
}

impl NewJob {
    /// Create a request with defaults (generated id, `max_instances = 1`).
    pub fn new(name: impl Into<String>, trigger: TriggerSpec, action: JobAction) -> Self {
        Self {
            id: None,
            name: name.into(),
            trigger,
            action,
            misfire_grace_secs: None,
            max_instances: 1,
        }
    }

    /// Use a caller-chosen stable id.
    pub fn with_id(mut self, id: impl Into<JobId>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Override the engine's default misfire grace.
    pub fn with_misfire_grace(mut self, secs: u64) -> Self {
        self.misfire_grace_secs = Some(secs);
        self
    }

    /// Allow up to `max` overlapping executions.
    pub fn with_max_instances(mut self, max: u32) -> Self {
        self.max_instances = max.max(1);
        self
    }

    /// Materialize the full record with lifecycle defaults. The next fire
    /// time is left unset; the synchronizer computes and persists it.
    pub fn into_record(self, now: DateTime<Utc>) -> JobRecord {
        JobRecord {
            id: self.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            name: self.name,
            trigger: self.trigger,
            action: self.action,
            state: JobState::Active,
            misfire_grace_secs: self.misfire_grace_secs,
            max_instances: self.max_instances,
            next_run_at: None,
            last_run_at: None,
            version: 1,
            created_at: now,
            updated_at: now,
            run_count: 0,
            failure_count: 0,
        }
    }
}

/// Partial update to an existing job. Unset fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    /// New name
    pub name: Option<String>,
    /// New trigger; recomputes the next fire from the current time
    pub trigger: Option<TriggerSpec>,
    /// New action reference
    pub action: Option<JobAction>,
    /// New grace override (`Some(None)` clears it back to the default)
    pub misfire_grace_secs: Option<Option<u64>>,
    /// New concurrency cap
    pub max_instances: Option<u32>,
    /// Reject the update unless the stored version matches
    pub expected_version: Option<u64>,
}

impl JobUpdate {
    /// Empty update.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rename the job.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Replace the trigger.
    pub fn trigger(mut self, trigger: TriggerSpec) -> Self {
        self.trigger = Some(trigger);
        self
    }

    /// Replace the action.
    pub fn action(mut self, action: JobAction) -> Self {
        self.action = Some(action);
        self
    }

    /// Set or clear the misfire grace override.
    pub fn misfire_grace(mut self, secs: Option<u64>) -> Self {
        self.misfire_grace_secs = Some(secs);
        self
    }

    /// Change the concurrency cap.
    pub fn max_instances(mut self, max: u32) -> Self {
        self.max_instances = Some(max.max(1));
        self
    }

    /// Fail with `Conflict` unless the stored version matches.
    pub fn expect_version(mut self, version: u64) -> Self {
        self.expected_version = Some(version);
        self
    }
}

/// Why a due occurrence was skipped instead of executed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Detected later than the misfire grace allows
    MisfireGrace,
    /// The job already had `max_instances` runs in flight
    MaxInstances,
}

/// Outcome of one execution attempt
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// The action completed
    Success,
    /// The action returned or raised an error
    Failure(String),
    /// The occurrence was intentionally not run
    Skipped(SkipReason),
}

impl RunOutcome {
    /// Whether the action actually ran (successfully or not).
    pub fn executed(&self) -> bool {
        !matches!(self, RunOutcome::Skipped(_))
    }

    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            RunOutcome::Success => "success",
            RunOutcome::Failure(_) => "failure",
            RunOutcome::Skipped(SkipReason::MisfireGrace) => "skipped_misfire",
            RunOutcome::Skipped(SkipReason::MaxInstances) => "skipped_overlap",
        }
    }
}

/// Context handed to an action handler for one execution attempt
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Job being executed
    pub job_id: JobId,
    /// Job name, for logging inside handlers
    pub job_name: String,
    /// Action arguments from the record
    pub args: Value,
    /// The time the occurrence was due (not the invocation wall clock)
    pub scheduled_at: DateTime<Utc>,
    /// When the attempt started
    pub started_at: DateTime<Utc>,
}
