//! SqlitePlanStore - SQLite persistence for learned plan records.
//!
//! Table: `plan_records`, one row per record, bucketed by `digest`.

use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::store::PlanRecordStore;
use crate::types::{LearnedPlanRecord, OutcomeQuality, StepTemplate};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

/// SQLite-backed plan record store.
#[derive(Clone)]
pub struct SqlitePlanStore {
    pool: SqlitePool,
}

impl SqlitePlanStore {
    /// Open (or create) a record store at the given path.
    pub async fn from_path(db_path: &std::path::Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Internal(format!("mkdir: {e}")))?;
        }
        let url = format!("sqlite:{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;

        // Enable WAL for read/write concurrency
        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&pool)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        info!("Plan memory initialized at {}", db_path.display());
        Ok(store)
    }

    /// In-memory store (for tests).
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.run_migrations().await?;
        debug!("In-memory plan store initialized");
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS plan_records (
                seq         INTEGER PRIMARY KEY AUTOINCREMENT,
                id          TEXT NOT NULL UNIQUE,
                digest      TEXT NOT NULL,
                terms       TEXT NOT NULL,
                goal        TEXT NOT NULL,
                steps       TEXT NOT NULL,
                outcome     TEXT NOT NULL,
                created_at  TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_plan_records_digest
             ON plan_records(digest, seq)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<LearnedPlanRecord> {
        let id: String = row.try_get("id")?;
        let digest: String = row.try_get("digest")?;
        let terms: String = row.try_get("terms")?;
        let steps: String = row.try_get("steps")?;
        let outcome: String = row.try_get("outcome")?;
        let created_at: String = row.try_get("created_at")?;

        Ok(LearnedPlanRecord {
            id: Uuid::parse_str(&id).map_err(|e| Error::Internal(format!("bad record id: {e}")))?,
            fingerprint: Fingerprint {
                digest,
                terms: serde_json::from_str(&terms)?,
            },
            goal: row.try_get("goal")?,
            steps: serde_json::from_str::<Vec<StepTemplate>>(&steps)?,
            outcome: OutcomeQuality::from_str_lossy(&outcome),
            created_at: DateTime::parse_from_rfc3339(&created_at)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| Error::Internal(format!("bad timestamp: {e}")))?,
            sequence: row.try_get("seq")?,
        })
    }
}

#[async_trait]
impl PlanRecordStore for SqlitePlanStore {
    async fn append(&self, mut record: LearnedPlanRecord, cap: usize) -> Result<LearnedPlanRecord> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "INSERT INTO plan_records (id, digest, terms, goal, steps, outcome, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(record.id.to_string())
        .bind(&record.fingerprint.digest)
        .bind(serde_json::to_string(&record.fingerprint.terms)?)
        .bind(&record.goal)
        .bind(serde_json::to_string(&record.steps)?)
        .bind(record.outcome.as_str())
        .bind(record.created_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;
        record.sequence = result.last_insert_rowid();

        let evicted = sqlx::query(
            "DELETE FROM plan_records
             WHERE digest = ?1 AND seq NOT IN (
                 SELECT seq FROM plan_records WHERE digest = ?1 ORDER BY seq DESC LIMIT ?2
             )",
        )
        .bind(&record.fingerprint.digest)
        .bind(cap.max(1) as i64)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        if evicted > 0 {
            debug!(digest = %record.fingerprint, evicted, "Evicted oldest plan records");
        }
        Ok(record)
    }

    async fn bucket(&self, digest: &str) -> Result<Vec<LearnedPlanRecord>> {
        let rows = sqlx::query("SELECT * FROM plan_records WHERE digest = ?1 ORDER BY seq")
            .bind(digest)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_record).collect()
    }

    async fn all(&self) -> Result<Vec<LearnedPlanRecord>> {
        let rows = sqlx::query("SELECT * FROM plan_records ORDER BY seq")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_record).collect()
    }

    async fn count(&self) -> Result<usize> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM plan_records")
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn record(goal: &str, steps: Vec<StepTemplate>) -> LearnedPlanRecord {
        LearnedPlanRecord::new(
            Fingerprint::compute(goal, &BTreeMap::new()),
            goal,
            steps,
            OutcomeQuality::Recovered,
        )
    }

    #[tokio::test]
    async fn test_sqlite_append_and_bucket() {
        let store = SqlitePlanStore::in_memory().await.unwrap();
        let steps = vec![
            StepTemplate::new("browse", "open the pricing page"),
            StepTemplate::new("execute-code", "compute the average"),
        ];
        let stored = store.append(record("compare prices", steps.clone()), 5).await.unwrap();
        assert!(stored.sequence > 0);

        let bucket = store.bucket(&stored.fingerprint.digest).await.unwrap();
        assert_eq!(bucket.len(), 1);
        assert_eq!(bucket[0].steps, steps);
        assert_eq!(bucket[0].outcome, OutcomeQuality::Recovered);
        assert_eq!(bucket[0].fingerprint, stored.fingerprint);
    }

    #[tokio::test]
    async fn test_sqlite_eviction() {
        let store = SqlitePlanStore::in_memory().await.unwrap();
        for i in 0..3 {
            store
                .append(record("same", vec![StepTemplate::new("browse", format!("v{i}"))]), 2)
                .await
                .unwrap();
        }
        store
            .append(record("other", vec![StepTemplate::new("browse", "w")]), 2)
            .await
            .unwrap();

        assert_eq!(store.count().await.unwrap(), 3);
        let all = store.all().await.unwrap();
        let instructions: Vec<&str> = all.iter().map(|r| r.steps[0].instruction.as_str()).collect();
        assert_eq!(instructions, vec!["v1", "v2", "w"]);
    }

    #[tokio::test]
    async fn test_sqlite_persists_across_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("plans.db");
        {
            let store = SqlitePlanStore::from_path(&path).await.unwrap();
            store
                .append(record("persist me", vec![StepTemplate::new("read-files", "ls /data")]), 5)
                .await
                .unwrap();
        }
        let reopened = SqlitePlanStore::from_path(&path).await.unwrap();
        assert_eq!(reopened.count().await.unwrap(), 1);
    }
}
