//! Synchronizer - keeps the scheduling queue and the job store in step
//!
//! The synchronizer is the only writer of the [`SchedulingQueue`]. Every
//! path that mutates a record (startup reconciliation, administrative
//! operations, post-run updates) flows through here, so the queue always
//! holds exactly one entry per Active record with a pending fire time.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::queue::SchedulingQueue;
use crate::store::JobStore;
use crate::triggers::{self, advance_past, compute_next};
use crate::types::{
    JobId, JobRecord, JobState, JobUpdate, NewJob, Result, RunOutcome, SchedulerError,
};

/// Reconciles durable job records with the in-memory schedule.
pub struct Synchronizer {
    store: Arc<dyn JobStore>,
    queue: SchedulingQueue,
    default_misfire_grace_secs: u64,
    persist_attempts: u32,
    persist_backoff: Duration,
}

impl Synchronizer {
    /// Create a synchronizer over the given store.
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            queue: SchedulingQueue::new(),
            default_misfire_grace_secs: 30,
            persist_attempts: 3,
            persist_backoff: Duration::from_millis(100),
        }
    }

    /// Grace period applied to jobs that carry no override.
    pub fn with_default_misfire_grace(mut self, secs: u64) -> Self {
        self.default_misfire_grace_secs = secs;
        self
    }

    /// Bounded retry settings for post-run persistence.
    pub fn with_persist_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.persist_attempts = attempts.max(1);
        self.persist_backoff = backoff;
        self
    }

    /// Rebuild the queue from the store. Run on startup before dispatching.
    ///
    /// Active records keep their persisted `next_run_at` when it is still
    /// fireable (in the future, or past-due within the misfire grace so the
    /// dispatcher can fire it late). Absent or stale times are recomputed —
    /// intervals in whole periods from the persisted value, cron and date
    /// triggers from the current time — and corrections are persisted back.
    ///
    /// Returns the number of jobs scheduled.
    pub async fn reconcile(&mut self, now: DateTime<Utc>) -> Result<usize> {
        let records = self.store.load_all().await?;
        let total = records.len();
        let mut scheduled = 0;

        for mut record in records {
            if !record.is_active() {
                continue;
            }

            let grace = record.misfire_grace(self.default_misfire_grace_secs);
            let next = match record.next_run_at {
                Some(at) if at + grace >= now => Some(at),
                stale => {
                    let next = match stale {
                        Some(old) => advance_past(&record.trigger, old, now),
                        None => compute_next(&record.trigger, now),
                    };
                    if next != record.next_run_at {
                        debug!(
                            "Correcting next run for job {}: {:?} -> {:?}",
                            record.id, record.next_run_at, next
                        );
                        record.next_run_at = next;
                        record.version += 1;
                        record.updated_at = now;
                        self.store.upsert(&record).await?;
                    }
                    next
                }
            };

            if let Some(at) = next {
                self.queue.insert_or_update(record.id.clone(), at);
                scheduled += 1;
            }
        }

        info!("Reconciled {} job records, {} scheduled", total, scheduled);
        Ok(scheduled)
    }

    /// Validate and persist a new job, scheduling it if it can fire.
    pub async fn add_job(&mut self, new: NewJob, now: DateTime<Utc>) -> Result<JobRecord> {
        triggers::validate(&new.trigger)?;

        if let Some(id) = &new.id {
            if self.store.load(id).await?.is_some() {
                return Err(SchedulerError::Conflict(id.clone()));
            }
        }

        let mut record = new.into_record(now);
        record.next_run_at = compute_next(&record.trigger, now);
        self.store.upsert(&record).await?;

        if let Some(at) = record.next_run_at {
            self.queue.insert_or_update(record.id.clone(), at);
        }
        info!(
            "Added job {} ({}), next run: {:?}",
            record.name, record.id, record.next_run_at
        );
        Ok(record)
    }

    /// Apply a partial update. A changed trigger is revalidated and the next
    /// fire time recomputed from `now`, never from the stale previous value.
    pub async fn update_job(
        &mut self,
        id: &str,
        update: JobUpdate,
        now: DateTime<Utc>,
    ) -> Result<JobRecord> {
        let mut record = self
            .store
            .load(id)
            .await?
            .ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;

        if let Some(expected) = update.expected_version {
            if expected != record.version {
                return Err(SchedulerError::Conflict(record.id));
            }
        }
        if let Some(trigger) = &update.trigger {
            triggers::validate(trigger)?;
        }

        if let Some(name) = update.name {
            record.name = name;
        }
        if let Some(action) = update.action {
            record.action = action;
        }
        if let Some(grace) = update.misfire_grace_secs {
            record.misfire_grace_secs = grace;
        }
        if let Some(max) = update.max_instances {
            record.max_instances = max;
        }
        if let Some(trigger) = update.trigger {
            record.trigger = trigger;
            if record.is_active() {
                record.next_run_at = compute_next(&record.trigger, now);
            }
        }

        record.version += 1;
        record.updated_at = now;
        self.store.upsert(&record).await?;
        self.apply_queue_membership(&record);

        info!(
            "Updated job {} ({}), next run: {:?}",
            record.name, record.id, record.next_run_at
        );
        Ok(record)
    }

    /// Stop a job from firing without removing it.
    pub async fn pause_job(&mut self, id: &str, now: DateTime<Utc>) -> Result<()> {
        let mut record = self
            .store
            .load(id)
            .await?
            .ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;

        if record.state == JobState::Paused {
            return Ok(());
        }
        record.state = JobState::Paused;
        record.next_run_at = None;
        record.version += 1;
        record.updated_at = now;
        self.store.upsert(&record).await?;
        self.queue.remove(id);
        info!("Paused job {} ({})", record.name, record.id);
        Ok(())
    }

    /// Reactivate a paused job, recomputing its next fire from `now`.
    pub async fn resume_job(&mut self, id: &str, now: DateTime<Utc>) -> Result<()> {
        let mut record = self
            .store
            .load(id)
            .await?
            .ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;

        if record.state == JobState::Active {
            return Ok(());
        }
        record.state = JobState::Active;
        record.next_run_at = compute_next(&record.trigger, now);
        record.version += 1;
        record.updated_at = now;
        self.store.upsert(&record).await?;
        self.apply_queue_membership(&record);
        info!(
            "Resumed job {} ({}), next run: {:?}",
            record.name, record.id, record.next_run_at
        );
        Ok(())
    }

    /// Remove a job permanently. In-flight executions finish but no future
    /// occurrence is scheduled.
    pub async fn delete_job(&mut self, id: &str) -> Result<()> {
        self.queue.remove(id);
        self.store.delete(id).await?;
        info!("Deleted job {}", id);
        Ok(())
    }

    /// Load one record.
    pub async fn get_job(&self, id: &str) -> Result<Option<JobRecord>> {
        self.store.load(id).await
    }

    /// List records, optionally filtered by state.
    pub async fn list_jobs(&self, state: Option<JobState>) -> Result<Vec<JobRecord>> {
        let records = self.store.load_all().await?;
        Ok(match state {
            Some(state) => records.into_iter().filter(|r| r.state == state).collect(),
            None => records,
        })
    }

    /// Fold a finished (or skipped) run back into the record and requeue the
    /// next occurrence. Persistence failures are retried with backoff; after
    /// that the divergence is logged and left for the next reconciliation,
    /// the dispatch loop itself is never interrupted.
    pub async fn complete_run(
        &mut self,
        id: &JobId,
        scheduled: DateTime<Utc>,
        outcome: &RunOutcome,
        now: DateTime<Utc>,
    ) {
        if let Err(e) = self.try_complete_run(id, scheduled, outcome, now).await {
            error!(
                "Failed to persist outcome for job {}: {} (queue and store diverge until next reconcile)",
                id, e
            );
        }
    }

    async fn try_complete_run(
        &mut self,
        id: &JobId,
        scheduled: DateTime<Utc>,
        outcome: &RunOutcome,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let store = self.store.clone();
        let loaded = self
            .with_retry(|| {
                let store = store.clone();
                let id = id.clone();
                async move { store.load(&id).await }
            })
            .await?;

        let Some(mut record) = loaded else {
            // Deleted while the action was executing.
            self.queue.remove(id);
            debug!("Job {} vanished mid-run, dropping outcome", id);
            return Ok(());
        };
        if record.state == JobState::Deleted {
            self.queue.remove(id);
            return Ok(());
        }

        match outcome {
            RunOutcome::Success => {
                record.run_count += 1;
                record.last_run_at = Some(now);
            }
            RunOutcome::Failure(err) => {
                record.run_count += 1;
                record.failure_count += 1;
                record.last_run_at = Some(now);
                warn!("Job {} ({}) run failed: {}", record.name, record.id, err);
            }
            // Skips are not runs: counters and last_run_at stay put.
            RunOutcome::Skipped(_) => {}
        }

        record.next_run_at = if !record.is_active() {
            None
        } else if outcome.executed() {
            // Drive the series from the occurrence that just ran so slow
            // executions do not shift the grid.
            compute_next(&record.trigger, scheduled)
        } else {
            advance_past(&record.trigger, scheduled, now)
        };
        record.version += 1;
        record.updated_at = now;

        // Queue membership follows the computed schedule even when the
        // upsert below fails; reconciliation repairs the store afterwards.
        self.apply_queue_membership(&record);
        if record.is_active() && record.next_run_at.is_none() {
            info!("Job {} ({}) exhausted its trigger, retiring", record.name, record.id);
        }

        let store = self.store.clone();
        self.with_retry(move || {
            let store = store.clone();
            let record = record.clone();
            async move { store.upsert(&record).await }
        })
        .await
    }

    /// One entry for Active records with a pending time, none otherwise.
    fn apply_queue_membership(&mut self, record: &JobRecord) {
        match (record.is_active(), record.next_run_at) {
            (true, Some(at)) => self.queue.insert_or_update(record.id.clone(), at),
            _ => {
                self.queue.remove(&record.id);
            }
        }
    }

    async fn with_retry<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.persist_attempts && is_transient(&e) => {
                    let delay = self.persist_backoff * 2u32.pow(attempt - 1);
                    warn!(
                        "Store operation failed (attempt {}/{}), retrying in {:?}: {}",
                        attempt, self.persist_attempts, delay, e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    // --- queue access for the dispatcher -----------------------------------

    /// Earliest pending fire time, if any.
    pub(crate) fn next_fire_time(&self) -> Option<DateTime<Utc>> {
        self.queue.peek_earliest().map(|(_, at)| at)
    }

    /// Pop the earliest entry if it is due at `now`.
    pub(crate) fn pop_due(&mut self, now: DateTime<Utc>) -> Option<(JobId, DateTime<Utc>)> {
        match self.queue.peek_earliest() {
            Some((_, at)) if at <= now => self.queue.pop_earliest(),
            _ => None,
        }
    }

    /// Put an entry back, e.g. after a transient load failure during firing.
    pub(crate) fn requeue(&mut self, id: &JobId, at: DateTime<Utc>) {
        self.queue.insert_or_update(id.clone(), at);
    }

    /// Number of pending queue entries.
    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }

    /// Whether a job currently has a queue entry.
    pub fn is_scheduled(&self, id: &str) -> bool {
        self.queue.contains(id)
    }
}

fn is_transient(e: &SchedulerError) -> bool {
    matches!(e, SchedulerError::Store(_))
}
