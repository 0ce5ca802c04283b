//! Database queries for the coordination store.
//!
//! Every operation here is a single statement or a single write
//! transaction, so it stays atomic when several processes share the file.

use std::time::Duration;

use nerfhub_core::db::{unix_timestamp, unix_timestamp_millis};

use super::db::{Database, DatabaseError};
use super::models::{JobProgress, LockRecord, ProgressRecord, PublishOutcome};

fn to_db(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

impl Database {
    // =========================================================================
    // Lock queries
    // =========================================================================

    /// Take `name` for `token` unless a live owner exists.
    ///
    /// An expired row is overwritten in the same statement, so a crashed
    /// owner never blocks the lock past its hold timeout.
    pub async fn try_acquire_lock(
        &self,
        name: &str,
        token: &str,
        hold: Duration,
    ) -> Result<bool, DatabaseError> {
        let now = unix_timestamp_millis();
        let expires_at = now.saturating_add(millis(hold));

        let result = sqlx::query(
            r"
            INSERT INTO locks (name, token, expires_at_ms)
            VALUES (?, ?, ?)
            ON CONFLICT(name) DO UPDATE
                SET token = excluded.token, expires_at_ms = excluded.expires_at_ms
                WHERE locks.expires_at_ms <= ?
            ",
        )
        .bind(name)
        .bind(token)
        .bind(expires_at)
        .bind(now)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Delete `name` only if `token` still owns it and it has not expired.
    pub async fn release_lock(&self, name: &str, token: &str) -> Result<bool, DatabaseError> {
        let now = unix_timestamp_millis();

        let result =
            sqlx::query("DELETE FROM locks WHERE name = ? AND token = ? AND expires_at_ms > ?")
                .bind(name)
                .bind(token)
                .bind(now)
                .execute(self.pool())
                .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Current live owner of `name`, if any.
    pub async fn lock_owner(&self, name: &str) -> Result<Option<LockRecord>, DatabaseError> {
        let now = unix_timestamp_millis();

        let record = sqlx::query_as::<_, LockRecord>(
            "SELECT * FROM locks WHERE name = ? AND expires_at_ms > ?",
        )
        .bind(name)
        .bind(now)
        .fetch_optional(self.pool())
        .await?;

        Ok(record)
    }

    // =========================================================================
    // Progress queries
    // =========================================================================

    /// Consume a pending stop marker for `key`, or write `progress`.
    ///
    /// Both branches run inside one write transaction. The marker delete is
    /// the first statement, which takes the database write lock before any
    /// read happens, so no other process can slip a stop request or a
    /// progress write in between.
    pub async fn publish_progress_unless_stopped(
        &self,
        key: &str,
        progress: &JobProgress,
    ) -> Result<PublishOutcome, DatabaseError> {
        self.publish_progress_unless_stopped_by(key, key, progress)
            .await
    }

    /// Like [`Self::publish_progress_unless_stopped`], with the stop marker
    /// looked up under `stop_key` instead of the progress key.
    pub async fn publish_progress_unless_stopped_by(
        &self,
        stop_key: &str,
        key: &str,
        progress: &JobProgress,
    ) -> Result<PublishOutcome, DatabaseError> {
        let now = unix_timestamp();
        let mut tx = self.pool().begin().await?;

        let consumed = sqlx::query("DELETE FROM stop_requests WHERE key = ?")
            .bind(stop_key)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        if consumed > 0 {
            tx.commit().await?;
            return Ok(PublishOutcome::Aborted);
        }

        sqlx::query(
            r"
            INSERT INTO job_progress (key, status, stage, total, completed, eta_secs, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                status = excluded.status,
                stage = excluded.stage,
                total = excluded.total,
                completed = excluded.completed,
                eta_secs = excluded.eta_secs,
                updated_at = excluded.updated_at
            ",
        )
        .bind(key)
        .bind(progress.status.as_str())
        .bind(&progress.stage)
        .bind(to_db(progress.total))
        .bind(to_db(progress.completed))
        .bind(to_db(progress.eta_secs))
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(PublishOutcome::Published)
    }

    /// Latest progress stored for `key`.
    pub async fn get_progress(&self, key: &str) -> Result<Option<JobProgress>, DatabaseError> {
        let record =
            sqlx::query_as::<_, ProgressRecord>("SELECT * FROM job_progress WHERE key = ?")
                .bind(key)
                .fetch_optional(self.pool())
                .await?;

        match record {
            None => Ok(None),
            Some(record) => {
                let status = record.status.clone();
                record.into_progress().map(Some).ok_or_else(|| {
                    DatabaseError::Query(format!("Unknown job status {status:?} for {key}"))
                })
            }
        }
    }

    /// Remove stored progress for `key`.
    pub async fn delete_progress(&self, key: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM job_progress WHERE key = ?")
            .bind(key)
            .execute(self.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Stop marker queries
    // =========================================================================

    /// Set the stop marker for `key`. Setting it twice is the same as once.
    pub async fn insert_stop_request(&self, key: &str) -> Result<(), DatabaseError> {
        let now = unix_timestamp();

        sqlx::query(
            "INSERT INTO stop_requests (key, requested_at) VALUES (?, ?) ON CONFLICT(key) DO NOTHING",
        )
        .bind(key)
        .bind(now)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Whether a stop marker is pending for `key`.
    pub async fn stop_requested(&self, key: &str) -> Result<bool, DatabaseError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM stop_requests WHERE key = ?")
            .bind(key)
            .fetch_optional(self.pool())
            .await?;

        Ok(row.is_some())
    }

    /// Drop a pending stop marker without publishing anything.
    pub async fn delete_stop_request(&self, key: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM stop_requests WHERE key = ?")
            .bind(key)
            .execute(self.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
