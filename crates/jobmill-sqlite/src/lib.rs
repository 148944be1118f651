//! SQLite-backed job record store
//!
//! Persists job definitions for durability across restarts. Triggers and
//! actions are stored as JSON text columns; the optimistic-concurrency
//! version check rides on a guarded upsert, so no row is ever replaced by a
//! writer that read a stale version.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{FromRow, Pool, Sqlite};

use jobmill_core::{JobRecord, JobStore, Result, SchedulerError};

/// SQLite implementation of [`JobStore`].
pub struct SqliteJobStore {
    pool: Pool<Sqlite>,
}

impl SqliteJobStore {
    /// Open (or create) a store at the given database path.
    pub async fn from_path(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                SchedulerError::InvalidConfig(format!("failed to create store directory: {e}"))
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(store_err)?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Open an in-memory store. One connection, so every query sees the
    /// same database. Intended for tests and experiments.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(store_err)?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                trigger_json TEXT NOT NULL,
                action_json TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'active',
                misfire_grace_secs INTEGER,
                max_instances INTEGER NOT NULL DEFAULT 1,
                next_run_at TIMESTAMP,
                last_run_at TIMESTAMP,
                version INTEGER NOT NULL,
                created_at TIMESTAMP NOT NULL,
                updated_at TIMESTAMP NOT NULL,
                run_count INTEGER NOT NULL DEFAULT 0,
                failure_count INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs(state)")
            .execute(&self.pool)
            .await
            .map_err(store_err)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_next_run ON jobs(next_run_at)")
            .execute(&self.pool)
            .await
            .map_err(store_err)?;

        Ok(())
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn load_all(&self) -> Result<Vec<JobRecord>> {
        let rows: Vec<JobRow> = sqlx::query_as("SELECT * FROM jobs ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;

        rows.into_iter().map(|r| r.try_into()).collect()
    }

    async fn load(&self, id: &str) -> Result<Option<JobRecord>> {
        let row: Option<JobRow> = sqlx::query_as("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;

        row.map(|r| r.try_into()).transpose()
    }

    async fn upsert(&self, record: &JobRecord) -> Result<()> {
        let trigger_json = serde_json::to_string(&record.trigger)?;
        let action_json = serde_json::to_string(&record.action)?;

        // The WHERE clause on the conflict arm is the optimistic check: a
        // replace lands only when the stored row is exactly one version
        // behind. Inserts of absent ids are unconditional.
        let result = sqlx::query(
            r#"
            INSERT INTO jobs (
                id, name, trigger_json, action_json, state,
                misfire_grace_secs, max_instances, next_run_at, last_run_at,
                version, created_at, updated_at, run_count, failure_count
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                trigger_json = excluded.trigger_json,
                action_json = excluded.action_json,
                state = excluded.state,
                misfire_grace_secs = excluded.misfire_grace_secs,
                max_instances = excluded.max_instances,
                next_run_at = excluded.next_run_at,
                last_run_at = excluded.last_run_at,
                version = excluded.version,
                updated_at = excluded.updated_at,
                run_count = excluded.run_count,
                failure_count = excluded.failure_count
            WHERE jobs.version = excluded.version - 1
            "#,
        )
        .bind(&record.id)
        .bind(&record.name)
        .bind(trigger_json)
        .bind(action_json)
        .bind(record.state.as_str())
        .bind(record.misfire_grace_secs.map(|g| g as i64))
        .bind(record.max_instances as i64)
        .bind(record.next_run_at)
        .bind(record.last_run_at)
        .bind(record.version as i64)
        .bind(record.created_at)
        .bind(record.updated_at)
        .bind(record.run_count as i64)
        .bind(record.failure_count as i64)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        if result.rows_affected() == 0 {
            return Err(SchedulerError::Conflict(record.id.clone()));
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;

        if result.rows_affected() == 0 {
            return Err(SchedulerError::NotFound(id.to_string()));
        }
        Ok(())
    }
}

fn store_err(e: sqlx::Error) -> SchedulerError {
    SchedulerError::Store(e.to_string())
}

/// Internal row type for job queries
#[derive(FromRow)]
struct JobRow {
    id: String,
    name: String,
    trigger_json: String,
    action_json: String,
    state: String,
    misfire_grace_secs: Option<i64>,
    max_instances: i64,
    next_run_at: Option<DateTime<Utc>>,
    last_run_at: Option<DateTime<Utc>>,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    run_count: i64,
    failure_count: i64,
}

impl TryFrom<JobRow> for JobRecord {
    type Error = SchedulerError;

    fn try_from(row: JobRow) -> Result<JobRecord> {
        Ok(JobRecord {
            id: row.id,
            name: row.name,
            trigger: serde_json::from_str(&row.trigger_json)?,
            action: serde_json::from_str(&row.action_json)?,
            state: row.state.parse()?,
            misfire_grace_secs: row.misfire_grace_secs.map(|g| g as u64),
            max_instances: row.max_instances as u32,
            next_run_at: row.next_run_at,
            last_run_at: row.last_run_at,
            version: row.version as u64,
            created_at: row.created_at,
            updated_at: row.updated_at,
            run_count: row.run_count as u64,
            failure_count: row.failure_count as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobmill_core::{JobAction, JobState, NewJob, TriggerSpec};
    use tempfile::TempDir;

    fn record(id: &str) -> JobRecord {
        let mut record = NewJob::new(
            id,
            TriggerSpec::cron("0 3 * * *"),
            JobAction::new("backup").with_args(serde_json::json!({"target": "db"})),
        )
        .with_id(id)
        .with_misfire_grace(120)
        .into_record(Utc::now());
        record.next_run_at = Some(Utc::now() + chrono::Duration::hours(1));
        record
    }

    #[tokio::test]
    async fn test_round_trip_preserves_fields() {
        let store = SqliteJobStore::in_memory().await.unwrap();
        let original = record("nightly");
        store.upsert(&original).await.unwrap();

        let loaded = store.load("nightly").await.unwrap().unwrap();
        assert_eq!(loaded.id, original.id);
        assert_eq!(loaded.trigger, original.trigger);
        assert_eq!(loaded.action, original.action);
        assert_eq!(loaded.state, JobState::Active);
        assert_eq!(loaded.misfire_grace_secs, Some(120));
        assert_eq!(loaded.next_run_at, original.next_run_at);
        assert_eq!(loaded.version, 1);
    }

    #[tokio::test]
    async fn test_load_missing_is_none() {
        let store = SqliteJobStore::in_memory().await.unwrap();
        assert!(store.load("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upsert_replaces_when_version_advances() {
        let store = SqliteJobStore::in_memory().await.unwrap();
        let mut rec = record("job");
        store.upsert(&rec).await.unwrap();

        rec.name = "renamed".into();
        rec.state = JobState::Paused;
        rec.next_run_at = None;
        rec.version = 2;
        store.upsert(&rec).await.unwrap();

        let loaded = store.load("job").await.unwrap().unwrap();
        assert_eq!(loaded.name, "renamed");
        assert_eq!(loaded.state, JobState::Paused);
        assert!(loaded.next_run_at.is_none());
        assert_eq!(loaded.version, 2);
    }

    #[tokio::test]
    async fn test_upsert_rejects_stale_version() {
        let store = SqliteJobStore::in_memory().await.unwrap();
        let mut rec = record("job");
        store.upsert(&rec).await.unwrap();

        // Writing version 1 again (or any non-successor) must conflict.
        assert!(matches!(
            store.upsert(&rec).await,
            Err(SchedulerError::Conflict(_))
        ));
        rec.version = 5;
        assert!(matches!(
            store.upsert(&rec).await,
            Err(SchedulerError::Conflict(_))
        ));

        let loaded = store.load("job").await.unwrap().unwrap();
        assert_eq!(loaded.version, 1);
    }

    #[tokio::test]
    async fn test_delete() {
        let store = SqliteJobStore::in_memory().await.unwrap();
        store.upsert(&record("job")).await.unwrap();

        store.delete("job").await.unwrap();
        assert!(store.load("job").await.unwrap().is_none());
        assert!(matches!(
            store.delete("job").await,
            Err(SchedulerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_load_all_ordered_by_id() {
        let store = SqliteJobStore::in_memory().await.unwrap();
        for id in ["charlie", "alpha", "bravo"] {
            store.upsert(&record(id)).await.unwrap();
        }

        let ids: Vec<String> = store
            .load_all()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["alpha", "bravo", "charlie"]);
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("jobs.db");

        {
            let store = SqliteJobStore::from_path(&path).await.unwrap();
            store.upsert(&record("durable")).await.unwrap();
        }

        let store = SqliteJobStore::from_path(&path).await.unwrap();
        let loaded = store.load("durable").await.unwrap().unwrap();
        assert_eq!(loaded.id, "durable");
        assert_eq!(loaded.action.args["target"], "db");
    }
}
