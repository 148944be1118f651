//! Job record store contract and the in-memory implementation
//!
//! The core consumes durable storage only through [`JobStore`]; adapters map
//! the records onto whatever backing schema they like. No multi-record
//! atomicity is assumed — every synchronizer operation is safe under
//! single-record-at-a-time persistence.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::types::{JobRecord, Result, SchedulerError};

/// CRUD contract over persisted job definitions.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Load every record, ordered by job id.
    async fn load_all(&self) -> Result<Vec<JobRecord>>;

    /// Load one record.
    async fn load(&self, id: &str) -> Result<Option<JobRecord>>;

    /// Insert or replace a record.
    ///
    /// Enforces optimistic concurrency: a replace succeeds only when the
    /// stored version is exactly `record.version - 1`, otherwise
    /// [`SchedulerError::Conflict`]. Inserts of absent ids always succeed.
    async fn upsert(&self, record: &JobRecord) -> Result<()>;

    /// Physically remove a record. [`SchedulerError::NotFound`] when absent.
    async fn delete(&self, id: &str) -> Result<()>;
}

/// In-process [`JobStore`] backed by a map.
///
/// Used by the core's own tests and useful to embedders for theirs. Supports
/// injecting transient upsert failures to exercise the persistence retry
/// path.
#[derive(Default)]
pub struct MemoryJobStore {
    records: Mutex<HashMap<String, JobRecord>>,
    fail_upserts: AtomicU32,
}

impl MemoryJobStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` upserts fail with a transient store error.
    pub fn fail_next_upserts(&self, count: u32) {
        self.fail_upserts.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn load_all(&self) -> Result<Vec<JobRecord>> {
        let records = self.records.lock().await;
        let mut all: Vec<JobRecord> = records.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }

    async fn load(&self, id: &str) -> Result<Option<JobRecord>> {
        Ok(self.records.lock().await.get(id).cloned())
    }

    async fn upsert(&self, record: &JobRecord) -> Result<()> {
        if self.fail_upserts.load(Ordering::SeqCst) > 0 {
            self.fail_upserts.fetch_sub(1, Ordering::SeqCst);
            return Err(SchedulerError::Store("injected upsert failure".into()));
        }

        let mut records = self.records.lock().await;
        match records.get(&record.id) {
            Some(current) if current.version + 1 != record.version => {
                Err(SchedulerError::Conflict(record.id.clone()))
            }
            _ => {
                records.insert(record.id.clone(), record.clone());
                Ok(())
            }
        }
    }

    async fn delete(&self, id: &str) -> Result<()> {
        match self.records.lock().await.remove(id) {
            Some(_) => Ok(()),
            None => Err(SchedulerError::NotFound(id.to_string())),
        }
    }
}
