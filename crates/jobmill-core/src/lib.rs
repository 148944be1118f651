//! Jobmill - dynamic scheduled-job engine
//!
//! Job definitions live in durable storage; an in-memory engine fires them.
//! Jobs can be added, modified, paused, resumed, and removed at runtime
//! without restarting the process, driven by three trigger kinds:
//!
//! - **Interval triggers**: fixed-period repetition
//! - **Cron triggers**: five-field calendar expressions, timezone-aware
//! - **Date triggers**: one-shot execution at an instant
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │ SchedulerHandle  │  Administrative commands (mpsc)
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │ SchedulerEngine  │  Dispatch loop, misfire + overlap policy
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐     ┌──────────────────┐
//! │   Synchronizer   │────▶│ SchedulingQueue  │  Pending fire times
//! └────────┬─────────┘     └──────────────────┘
//!          ▼
//! ┌──────────────────┐     ┌──────────────────┐
//! │     JobStore     │     │   WorkerPool     │  Bounded action slots
//! └──────────────────┘     └──────────────────┘
//! ```
//!
//! The engine is a single actor: it alone touches the queue, and every
//! mutation arrives over its command channel, so administrative callers and
//! in-flight runs never race it. The store is ground truth — on startup the
//! synchronizer rebuilds the queue from persisted records.
//!
//! # Example
//!
//! ```ignore
//! use jobmill_core::{
//!     ActionRegistry, JobAction, NewJob, SchedulerConfig, SchedulerEngine,
//!     TriggerSpec,
//! };
//!
//! let mut registry = ActionRegistry::new();
//! registry.register("backup", |ctx| async move {
//!     run_backup(&ctx.args).await
//! });
//!
//! let engine = SchedulerEngine::new(store, Arc::new(registry), SchedulerConfig::new());
//! let handle = engine.handle();
//! tokio::spawn(engine.run(shutdown_token));
//!
//! handle
//!     .add_job(NewJob::new(
//!         "nightly_backup",
//!         TriggerSpec::cron("0 3 * * *"),
//!         JobAction::new("backup"),
//!     ))
//!     .await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod engine;
pub mod queue;
pub mod registry;
pub mod store;
pub mod sync;
pub mod triggers;
pub mod types;
pub mod worker;

pub use engine::{SchedulerConfig, SchedulerEngine, SchedulerEngineBuilder, SchedulerHandle};
pub use queue::SchedulingQueue;
pub use registry::{ActionFuture, ActionHandler, ActionRegistry};
pub use store::{JobStore, MemoryJobStore};
pub use sync::Synchronizer;
pub use triggers::{
    compute_next, validate, CronSchedule, DateSchedule, IntervalSchedule, TriggerSpec,
};
pub use types::{
    JobAction, JobId, JobRecord, JobState, JobUpdate, NewJob, Result, RunContext, RunOutcome,
    SchedulerError, SkipReason,
};
