//! Scheduler engine - the dispatch loop and its administrative surface
//!
//! One engine actor owns the synchronizer (and through it the queue). It
//! sleeps until the earliest pending fire time, and every administrative
//! mutation or worker completion arrives as a command on the same channel,
//! waking the loop so the wait target is recomputed. Callers talk to a
//! running engine through a clonable [`SchedulerHandle`]; a completed handle
//! call is guaranteed to be visible to the dispatcher, because the actor
//! applied it before replying.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::ActionRegistry;
use crate::store::JobStore;
use crate::sync::Synchronizer;
use crate::types::{
    JobId, JobRecord, JobState, JobUpdate, NewJob, Result, RunContext, RunOutcome, SchedulerError,
    SkipReason,
};
use crate::worker::WorkerPool;

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Concurrent execution slots across all jobs
    pub worker_slots: usize,
    /// Grace period for jobs without their own override, in seconds
    pub default_misfire_grace_secs: u64,
    /// How long to sleep when the queue is empty
    pub idle_wait: Duration,
    /// Attempts for post-run persistence
    pub persist_attempts: u32,
    /// Initial backoff between persistence attempts
    pub persist_backoff: Duration,
    /// How long shutdown waits for in-flight runs
    pub drain_timeout: Duration,
    /// Command channel capacity
    pub command_buffer: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_slots: 10,
            default_misfire_grace_secs: 30,
            idle_wait: Duration::from_secs(60),
            persist_attempts: 3,
            persist_backoff: Duration::from_millis(100),
            drain_timeout: Duration::from_secs(30),
            command_buffer: 64,
        }
    }
}

impl SchedulerConfig {
    /// Create a new configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of concurrent execution slots
    pub fn with_worker_slots(mut self, slots: usize) -> Self {
        self.worker_slots = slots;
        self
    }

    /// Set the default misfire grace period
    pub fn with_default_misfire_grace(mut self, secs: u64) -> Self {
        self.default_misfire_grace_secs = secs;
        self
    }

    /// Set the idle wait used when no job is scheduled
    pub fn with_idle_wait(mut self, wait: Duration) -> Self {
        self.idle_wait = wait;
        self
    }

    /// Set post-run persistence retry behavior
    pub fn with_persist_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.persist_attempts = attempts;
        self.persist_backoff = backoff;
        self
    }

    /// Set the shutdown drain timeout
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }
}

enum Command {
    Add {
        job: NewJob,
        reply: oneshot::Sender<Result<JobRecord>>,
    },
    Update {
        id: JobId,
        update: JobUpdate,
        reply: oneshot::Sender<Result<JobRecord>>,
    },
    Pause {
        id: JobId,
        reply: oneshot::Sender<Result<()>>,
    },
    Resume {
        id: JobId,
        reply: oneshot::Sender<Result<()>>,
    },
    Delete {
        id: JobId,
        reply: oneshot::Sender<Result<()>>,
    },
    Get {
        id: JobId,
        reply: oneshot::Sender<Result<Option<JobRecord>>>,
    },
    List {
        state: Option<JobState>,
        reply: oneshot::Sender<Result<Vec<JobRecord>>>,
    },
    RunFinished {
        id: JobId,
        scheduled: DateTime<Utc>,
        outcome: RunOutcome,
    },
}

/// Clonable handle for administering a running engine.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<Command>,
}

impl SchedulerHandle {
    /// Validate, persist, and schedule a new job.
    pub async fn add_job(&self, job: NewJob) -> Result<JobRecord> {
        self.request(|reply| Command::Add { job, reply }).await
    }

    /// Apply a partial update to an existing job.
    pub async fn update_job(&self, id: impl Into<JobId>, update: JobUpdate) -> Result<JobRecord> {
        self.request(|reply| Command::Update {
            id: id.into(),
            update,
            reply,
        })
        .await
    }

    /// Stop a job from firing without removing it.
    pub async fn pause_job(&self, id: impl Into<JobId>) -> Result<()> {
        self.request(|reply| Command::Pause {
            id: id.into(),
            reply,
        })
        .await
    }

    /// Reactivate a paused job.
    pub async fn resume_job(&self, id: impl Into<JobId>) -> Result<()> {
        self.request(|reply| Command::Resume {
            id: id.into(),
            reply,
        })
        .await
    }

    /// Remove a job permanently.
    pub async fn delete_job(&self, id: impl Into<JobId>) -> Result<()> {
        self.request(|reply| Command::Delete {
            id: id.into(),
            reply,
        })
        .await
    }

    /// Fetch one job record.
    pub async fn get_job(&self, id: impl Into<JobId>) -> Result<Option<JobRecord>> {
        self.request(|reply| Command::Get {
            id: id.into(),
            reply,
        })
        .await
    }

    /// List job records, optionally filtered by state.
    pub async fn list_jobs(&self, state: Option<JobState>) -> Result<Vec<JobRecord>> {
        self.request(|reply| Command::List { state, reply }).await
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<Result<T>>) -> Command,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(command(reply))
            .await
            .map_err(|_| SchedulerError::ChannelClosed)?;
        rx.await.map_err(|_| SchedulerError::ChannelClosed)?
    }
}

/// The dispatch actor. Create one, hand out [`SchedulerHandle`]s, then call
/// [`run`](Self::run) to start scheduling.
pub struct SchedulerEngine {
    sync: Synchronizer,
    registry: Arc<ActionRegistry>,
    pool: WorkerPool,
    config: SchedulerConfig,
    cmd_tx: mpsc::Sender<Command>,
    cmd_rx: Option<mpsc::Receiver<Command>>,
    active_runs: HashMap<JobId, u32>,
    total_active: usize,
}

impl SchedulerEngine {
    /// Create an engine over a store and action registry.
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<ActionRegistry>,
        config: SchedulerConfig,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(config.command_buffer.max(1));
        let sync = Synchronizer::new(store)
            .with_default_misfire_grace(config.default_misfire_grace_secs)
            .with_persist_retry(config.persist_attempts, config.persist_backoff);
        Self {
            sync,
            registry,
            pool: WorkerPool::new(config.worker_slots),
            config,
            cmd_tx,
            cmd_rx: Some(cmd_rx),
            active_runs: HashMap::new(),
            total_active: 0,
        }
    }

    /// A handle for administrative calls. Valid before and while the engine
    /// runs; calls fail with `ChannelClosed` once it has stopped.
    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            tx: self.cmd_tx.clone(),
        }
    }

    /// Run the dispatch loop until `shutdown` is cancelled.
    ///
    /// Reconciles the store into the queue first, so a restart resumes
    /// exactly where the persisted records say it should.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        let Some(mut cmd_rx) = self.cmd_rx.take() else {
            return Err(SchedulerError::InvalidConfig(
                "engine already consumed its command channel".into(),
            ));
        };

        info!("Scheduler engine starting");
        self.sync.reconcile(Utc::now()).await?;

        loop {
            let wait = self.next_wait();
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Scheduler engine shutting down");
                    break;
                }
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    // Unreachable while the engine holds its own sender.
                    None => break,
                },
                _ = tokio::time::sleep(wait) => {
                    self.fire_due(Utc::now()).await;
                }
            }
        }

        self.drain(&mut cmd_rx).await;
        info!("Scheduler engine stopped");
        Ok(())
    }

    /// Time to sleep before the earliest entry is due.
    fn next_wait(&self) -> Duration {
        match self.sync.next_fire_time() {
            Some(at) => (at - Utc::now()).to_std().unwrap_or(Duration::ZERO),
            None => self.config.idle_wait,
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Add { job, reply } => {
                let _ = reply.send(self.sync.add_job(job, Utc::now()).await);
            }
            Command::Update { id, update, reply } => {
                let _ = reply.send(self.sync.update_job(&id, update, Utc::now()).await);
            }
            Command::Pause { id, reply } => {
                let _ = reply.send(self.sync.pause_job(&id, Utc::now()).await);
            }
            Command::Resume { id, reply } => {
                let _ = reply.send(self.sync.resume_job(&id, Utc::now()).await);
            }
            Command::Delete { id, reply } => {
                let _ = reply.send(self.sync.delete_job(&id).await);
            }
            Command::Get { id, reply } => {
                let _ = reply.send(self.sync.get_job(&id).await);
            }
            Command::List { state, reply } => {
                let _ = reply.send(self.sync.list_jobs(state).await);
            }
            Command::RunFinished {
                id,
                scheduled,
                outcome,
            } => {
                if let Some(count) = self.active_runs.get_mut(&id) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        self.active_runs.remove(&id);
                    }
                }
                self.total_active = self.total_active.saturating_sub(1);
                debug!("Job {} finished: {}", id, outcome.label());
                self.sync
                    .complete_run(&id, scheduled, &outcome, Utc::now())
                    .await;
            }
        }
    }

    /// Fire every entry that is due at `now`.
    async fn fire_due(&mut self, now: DateTime<Utc>) {
        while let Some((id, scheduled)) = self.sync.pop_due(now) {
            self.fire(id, scheduled, now).await;
        }
    }

    async fn fire(&mut self, id: JobId, scheduled: DateTime<Utc>, now: DateTime<Utc>) {
        let record = match self.sync.get_job(&id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                debug!("Dropping queue entry for vanished job {}", id);
                return;
            }
            Err(e) => {
                warn!("Failed to load job {} at fire time, deferring: {}", id, e);
                self.sync.requeue(&id, now + chrono::Duration::seconds(5));
                return;
            }
        };
        if !record.is_active() {
            debug!("Dropping queue entry for inactive job {}", id);
            return;
        }

        let grace = record.misfire_grace(self.config.default_misfire_grace_secs);
        if now - scheduled > grace {
            warn!(
                "Job {} ({}) misfired: due {}, now {}, skipping",
                record.name, record.id, scheduled, now
            );
            self.sync
                .complete_run(
                    &id,
                    scheduled,
                    &RunOutcome::Skipped(SkipReason::MisfireGrace),
                    now,
                )
                .await;
            return;
        }

        let in_flight = self.active_runs.get(&id).copied().unwrap_or(0);
        if in_flight >= record.max_instances {
            warn!(
                "Job {} ({}) already has {} instances running, skipping occurrence",
                record.name, record.id, in_flight
            );
            self.sync
                .complete_run(
                    &id,
                    scheduled,
                    &RunOutcome::Skipped(SkipReason::MaxInstances),
                    now,
                )
                .await;
            return;
        }

        self.dispatch(record, scheduled).await;
    }

    /// Hand the job to a worker slot. Waits only for a free slot; the action
    /// itself runs on its own task and reports back as a command.
    async fn dispatch(&mut self, record: JobRecord, scheduled: DateTime<Utc>) {
        let permit = self.pool.acquire().await;
        *self.active_runs.entry(record.id.clone()).or_insert(0) += 1;
        self.total_active += 1;

        let started = Utc::now();
        let context = RunContext {
            job_id: record.id.clone(),
            job_name: record.name.clone(),
            args: record.action.args.clone(),
            scheduled_at: scheduled,
            started_at: started,
        };
        let handler = self.registry.get(&record.action.name);
        let action_name = record.action.name.clone();
        let cmd_tx = self.cmd_tx.clone();
        let id = record.id.clone();

        info!("Executing job {} ({})", record.name, record.id);
        tokio::spawn(async move {
            let outcome = match handler {
                Some(handler) => match handler(context).await {
                    Ok(()) => RunOutcome::Success,
                    Err(e) => RunOutcome::Failure(e.to_string()),
                },
                None => RunOutcome::Failure(format!(
                    "no handler registered for action '{action_name}'"
                )),
            };
            // Free the slot before reporting, so a dispatcher waiting in
            // acquire() can always make progress even when the command
            // channel is backed up.
            drop(permit);
            if cmd_tx
                .send(Command::RunFinished {
                    id,
                    scheduled,
                    outcome,
                })
                .await
                .is_err()
            {
                warn!("Scheduler stopped before a run outcome could be reported");
            }
        });
    }

    /// Keep consuming completions until in-flight runs finish or the drain
    /// timeout expires.
    async fn drain(&mut self, cmd_rx: &mut mpsc::Receiver<Command>) {
        if self.total_active == 0 {
            return;
        }
        info!("Waiting for {} running jobs to complete", self.total_active);
        let deadline = tokio::time::Instant::now() + self.config.drain_timeout;

        while self.total_active > 0 {
            match tokio::time::timeout_at(deadline, cmd_rx.recv()).await {
                Ok(Some(cmd)) => self.handle_command(cmd).await,
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        "Timed out waiting for {} running jobs during shutdown",
                        self.total_active
                    );
                    break;
                }
            }
        }
    }
}

/// Builder for [`SchedulerEngine`]
pub struct SchedulerEngineBuilder {
    store: Option<Arc<dyn JobStore>>,
    registry: Option<Arc<ActionRegistry>>,
    config: SchedulerConfig,
}

impl SchedulerEngineBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self {
            store: None,
            registry: None,
            config: SchedulerConfig::default(),
        }
    }

    /// Set the job store
    pub fn store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the action registry
    pub fn registry(mut self, registry: Arc<ActionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Set the configuration
    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the engine
    pub fn build(self) -> Result<SchedulerEngine> {
        let store = self
            .store
            .ok_or_else(|| SchedulerError::InvalidConfig("store is required".to_string()))?;
        let registry = self
            .registry
            .ok_or_else(|| SchedulerError::InvalidConfig("registry is required".to_string()))?;
        Ok(SchedulerEngine::new(store, registry, self.config))
    }
}

impl Default for SchedulerEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryJobStore;
    use crate::triggers::TriggerSpec;
    use crate::types::JobAction;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct TestContext {
        engine: SchedulerEngine,
        store: Arc<MemoryJobStore>,
        calls: Arc<AtomicU32>,
    }

    fn create_test_context() -> TestContext {
        let store = Arc::new(MemoryJobStore::new());
        let calls = Arc::new(AtomicU32::new(0));

        let mut registry = ActionRegistry::new();
        let counter = calls.clone();
        registry.register("count", move |_ctx| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        let counter = calls.clone();
        registry.register("slow_count", move |_ctx| {
            let counter = counter.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(400)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        registry.register("explode", |_ctx| async { anyhow::bail!("kaboom") });

        let config = SchedulerConfig::new()
            .with_default_misfire_grace(30)
            .with_persist_retry(3, Duration::from_millis(1));
        let engine = SchedulerEngine::new(store.clone(), Arc::new(registry), config);
        TestContext {
            engine,
            store,
            calls,
        }
    }

    fn date_job(id: &str, at: DateTime<Utc>, action: &str) -> NewJob {
        NewJob::new(id, TriggerSpec::date(at), JobAction::new(action)).with_id(id)
    }

    #[tokio::test]
    async fn test_handle_admin_round_trip() {
        let ctx = create_test_context();
        let handle = ctx.engine.handle();
        let shutdown = CancellationToken::new();
        let engine_task = tokio::spawn(ctx.engine.run(shutdown.clone()));

        let job = NewJob::new("hourly", TriggerSpec::interval(3600), JobAction::new("count"))
            .with_id("hourly");
        let record = handle.add_job(job).await.unwrap();
        assert!(record.next_run_at.is_some());

        assert!(handle.get_job("hourly").await.unwrap().is_some());
        assert_eq!(handle.list_jobs(None).await.unwrap().len(), 1);

        handle.pause_job("hourly").await.unwrap();
        let paused = handle.get_job("hourly").await.unwrap().unwrap();
        assert_eq!(paused.state, JobState::Paused);
        assert!(paused.next_run_at.is_none());

        handle.resume_job("hourly").await.unwrap();
        handle.delete_job("hourly").await.unwrap();
        assert!(handle.get_job("hourly").await.unwrap().is_none());
        assert!(matches!(
            handle.pause_job("hourly").await,
            Err(SchedulerError::NotFound(_))
        ));

        shutdown.cancel();
        engine_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_date_job_fires_once_and_retires() {
        let ctx = create_test_context();
        let handle = ctx.engine.handle();
        let shutdown = CancellationToken::new();
        let engine_task = tokio::spawn(ctx.engine.run(shutdown.clone()));

        let at = Utc::now() + chrono::Duration::milliseconds(200);
        handle.add_job(date_job("once", at, "count")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(900)).await;
        assert_eq!(ctx.calls.load(Ordering::SeqCst), 1);

        let record = handle.get_job("once").await.unwrap().unwrap();
        assert!(record.next_run_at.is_none());
        assert_eq!(record.run_count, 1);
        assert_eq!(record.state, JobState::Active);

        shutdown.cancel();
        engine_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_admin_add_wakes_idle_dispatcher() {
        let ctx = create_test_context();
        let handle = ctx.engine.handle();
        let shutdown = CancellationToken::new();
        // With an hour-long idle wait, only the command wakeup can make
        // this job fire on time.
        let mut engine = ctx.engine;
        engine.config.idle_wait = Duration::from_secs(3600);
        let engine_task = tokio::spawn(engine.run(shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let at = Utc::now() + chrono::Duration::milliseconds(200);
        handle.add_job(date_job("soon", at, "count")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(900)).await;
        assert_eq!(ctx.calls.load(Ordering::SeqCst), 1);

        shutdown.cancel();
        engine_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_failing_action_is_recorded_not_fatal() {
        let ctx = create_test_context();
        let handle = ctx.engine.handle();
        let shutdown = CancellationToken::new();
        let engine_task = tokio::spawn(ctx.engine.run(shutdown.clone()));

        let at = Utc::now() + chrono::Duration::milliseconds(100);
        handle
            .add_job(date_job("bad", at, "explode"))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(800)).await;
        let record = handle.get_job("bad").await.unwrap().unwrap();
        assert_eq!(record.run_count, 1);
        assert_eq!(record.failure_count, 1);

        // The engine is still responsive after the failure.
        assert!(handle.list_jobs(None).await.unwrap().len() == 1);

        shutdown.cancel();
        engine_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unknown_action_is_a_failure_outcome() {
        let ctx = create_test_context();
        let handle = ctx.engine.handle();
        let shutdown = CancellationToken::new();
        let engine_task = tokio::spawn(ctx.engine.run(shutdown.clone()));

        let at = Utc::now() + chrono::Duration::milliseconds(100);
        handle
            .add_job(date_job("ghost", at, "unregistered"))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(800)).await;
        let record = handle.get_job("ghost").await.unwrap().unwrap();
        assert_eq!(record.failure_count, 1);

        shutdown.cancel();
        engine_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_misfire_beyond_grace_skips_without_invoking() {
        let mut ctx = create_test_context();
        let now = Utc::now();

        let job = NewJob::new("late", TriggerSpec::interval(60), JobAction::new("count"))
            .with_id("late")
            .with_misfire_grace(5);
        ctx.engine.sync.add_job(job, now).await.unwrap();
        // Simulate an occurrence detected 30 seconds too late.
        let scheduled = now - chrono::Duration::seconds(30);
        ctx.engine.sync.requeue(&"late".to_string(), scheduled);

        ctx.engine.fire_due(now).await;

        assert_eq!(ctx.calls.load(Ordering::SeqCst), 0);
        let record = ctx.store.load("late").await.unwrap().unwrap();
        assert_eq!(record.run_count, 0);
        // Rescheduled to a future occurrence instead of running late.
        assert!(record.next_run_at.unwrap() > now);
    }

    #[tokio::test]
    async fn test_max_instances_overlap_skips() {
        let mut ctx = create_test_context();
        let now = Utc::now();

        let job = NewJob::new("busy", TriggerSpec::interval(60), JobAction::new("slow_count"))
            .with_id("busy")
            .with_misfire_grace(120);
        ctx.engine.sync.add_job(job, now).await.unwrap();

        // First due occurrence dispatches and occupies the single instance.
        ctx.engine.sync.requeue(&"busy".to_string(), now);
        ctx.engine.fire_due(now).await;
        assert_eq!(ctx.engine.active_runs.get("busy"), Some(&1));

        // Second due occurrence while the first still runs: skipped.
        ctx.engine.sync.requeue(&"busy".to_string(), now);
        ctx.engine.fire_due(now).await;

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(ctx.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_drains_running_jobs() {
        let ctx = create_test_context();
        let handle = ctx.engine.handle();
        let shutdown = CancellationToken::new();
        let engine_task = tokio::spawn(ctx.engine.run(shutdown.clone()));

        let at = Utc::now() + chrono::Duration::milliseconds(100);
        handle
            .add_job(date_job("slow", at, "slow_count"))
            .await
            .unwrap();

        // Cancel while the action is still sleeping.
        tokio::time::sleep(Duration::from_millis(300)).await;
        shutdown.cancel();
        engine_task.await.unwrap().unwrap();

        // The outcome was still persisted before run() returned.
        assert_eq!(ctx.calls.load(Ordering::SeqCst), 1);
        let record = ctx.store.load("slow").await.unwrap().unwrap();
        assert_eq!(record.run_count, 1);
    }

    #[tokio::test]
    async fn test_builder_requires_store_and_registry() {
        assert!(matches!(
            SchedulerEngineBuilder::new().build(),
            Err(SchedulerError::InvalidConfig(_))
        ));

        let built = SchedulerEngineBuilder::new()
            .store(Arc::new(MemoryJobStore::new()))
            .registry(Arc::new(ActionRegistry::new()))
            .config(SchedulerConfig::new().with_worker_slots(2))
            .build();
        assert!(built.is_ok());
    }
}
