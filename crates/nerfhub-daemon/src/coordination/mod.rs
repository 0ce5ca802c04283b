//! Cross-process coordination: locks, progress and cooperative stop.
//!
//! A [`Coordinator`] wraps the shared [`Database`]. Workers publish progress
//! through [`ProgressReporter`]; a separate process asks a worker to stop
//! with [`Coordinator::request_stop`], and the worker notices on its next
//! publish. Nothing here ever terminates a worker.

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::storage::{Database, DatabaseError, JobProgress, PublishOutcome};

/// Default interval between lock attempts.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Proof of lock ownership, required to release it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Coordination errors.
#[derive(Debug, thiserror::Error)]
pub enum CoordinationError {
    #[error("Coordination store error: {0}")]
    Store(#[from] DatabaseError),

    #[error("Job {key} was asked to stop")]
    Aborted { key: String },
}

/// Handle on the shared coordination store.
#[derive(Clone)]
pub struct Coordinator {
    db: Database,
    poll_interval: Duration,
}

impl Coordinator {
    pub const fn new(db: Database) -> Self {
        Self {
            db,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    #[must_use]
    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub const fn database(&self) -> &Database {
        &self.db
    }

    /// Poll for `name` until it is free or `acquire_timeout` elapses.
    ///
    /// Returns `Ok(None)` on timeout. At least one attempt is always made.
    pub async fn acquire(
        &self,
        name: &str,
        acquire_timeout: Duration,
        hold_timeout: Duration,
    ) -> Result<Option<LockToken>, CoordinationError> {
        let deadline = Instant::now() + acquire_timeout;
        loop {
            if let Some(token) = self.try_acquire(name, hold_timeout).await? {
                return Ok(Some(token));
            }
            let now = Instant::now();
            if now >= deadline {
                debug!(lock = name, ?acquire_timeout, "Lock acquire timed out");
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// Single acquire attempt.
    pub async fn try_acquire(
        &self,
        name: &str,
        hold_timeout: Duration,
    ) -> Result<Option<LockToken>, CoordinationError> {
        let token = LockToken::generate();
        if self
            .db
            .try_acquire_lock(name, token.as_str(), hold_timeout)
            .await?
        {
            debug!(lock = name, token = %token, "Lock acquired");
            Ok(Some(token))
        } else {
            Ok(None)
        }
    }

    /// Release `name` if `token` still owns it. Returns whether it did.
    pub async fn release(&self, name: &str, token: &LockToken) -> Result<bool, CoordinationError> {
        let released = self.db.release_lock(name, token.as_str()).await?;
        if released {
            debug!(lock = name, "Lock released");
        } else {
            warn!(lock = name, token = %token, "Release skipped, lock no longer owned");
        }
        Ok(released)
    }

    /// Publish `progress` for `key` unless a stop was requested.
    ///
    /// A pending stop marker is consumed and `Aborted` returned; stored
    /// progress is left untouched in that case.
    pub async fn publish_progress_or_abort(
        &self,
        key: &str,
        progress: &JobProgress,
    ) -> Result<PublishOutcome, CoordinationError> {
        self.publish_progress_or_abort_by(key, key, progress).await
    }

    /// Same as [`Self::publish_progress_or_abort`], watching the stop
    /// marker under `stop_key`.
    pub async fn publish_progress_or_abort_by(
        &self,
        stop_key: &str,
        key: &str,
        progress: &JobProgress,
    ) -> Result<PublishOutcome, CoordinationError> {
        let outcome = self
            .db
            .publish_progress_unless_stopped_by(stop_key, key, progress)
            .await?;
        if outcome == PublishOutcome::Aborted {
            info!(key, stop_key, "Stop request observed");
        }
        Ok(outcome)
    }

    /// Ask whichever worker owns `key` to stop at its next checkpoint.
    pub async fn request_stop(&self, key: &str) -> Result<(), CoordinationError> {
        self.db.insert_stop_request(key).await?;
        info!(key, "Stop requested");
        Ok(())
    }

    pub async fn is_stop_requested(&self, key: &str) -> Result<bool, CoordinationError> {
        Ok(self.db.stop_requested(key).await?)
    }

    /// Withdraw a stop request nobody consumed (e.g. the worker already exited).
    pub async fn withdraw_stop(&self, key: &str) -> Result<bool, CoordinationError> {
        Ok(self.db.delete_stop_request(key).await?)
    }

    pub async fn progress(&self, key: &str) -> Result<Option<JobProgress>, CoordinationError> {
        Ok(self.db.get_progress(key).await?)
    }

    pub async fn clear_progress(&self, key: &str) -> Result<bool, CoordinationError> {
        Ok(self.db.delete_progress(key).await?)
    }

    /// Reporter bound to one progress key.
    pub fn reporter(&self, key: impl Into<String>) -> ProgressReporter {
        let key = key.into();
        ProgressReporter {
            coordinator: self.clone(),
            stop_key: key.clone(),
            key,
        }
    }
}

/// Worker-side progress handle for one job.
#[derive(Clone)]
pub struct ProgressReporter {
    coordinator: Coordinator,
    key: String,
    stop_key: String,
}

impl ProgressReporter {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Watch stop requests under `stop_key` instead of the progress key.
    #[must_use]
    pub fn with_stop_key(mut self, stop_key: impl Into<String>) -> Self {
        self.stop_key = stop_key.into();
        self
    }

    /// Publish progress; `Err(Aborted)` once a stop has been requested.
    pub async fn report(&self, progress: &JobProgress) -> Result<(), CoordinationError> {
        match self
            .coordinator
            .publish_progress_or_abort_by(&self.stop_key, &self.key, progress)
            .await?
        {
            PublishOutcome::Published => Ok(()),
            PublishOutcome::Aborted => Err(CoordinationError::Aborted {
                key: self.key.clone(),
            }),
        }
    }

    /// Record a terminal status.
    ///
    /// A stop marker that arrives after the work is done is consumed here
    /// and ignored: the job already reached its end state.
    pub async fn finish(&self, progress: JobProgress) -> Result<(), CoordinationError> {
        debug_assert!(progress.status.is_terminal());
        match self.report(&progress).await {
            Err(CoordinationError::Aborted { .. }) => {
                debug!(key = %self.key, status = %progress.status, "Late stop request ignored");
                self.report(&progress).await
            }
            other => other,
        }
    }

    /// Blocking wrapper for workers running on plain OS threads.
    pub fn blocking(&self, runtime: tokio::runtime::Handle) -> BlockingReporter {
        BlockingReporter {
            inner: self.clone(),
            runtime,
        }
    }
}

/// [`ProgressReporter`] usable outside the async runtime.
///
/// Must not be called from a runtime worker thread.
#[derive(Clone)]
pub struct BlockingReporter {
    inner: ProgressReporter,
    runtime: tokio::runtime::Handle,
}

impl BlockingReporter {
    pub fn key(&self) -> &str {
        self.inner.key()
    }

    pub fn report(&self, progress: &JobProgress) -> Result<(), CoordinationError> {
        self.runtime.block_on(self.inner.report(progress))
    }

    /// Shorthand for a running-stage update.
    pub fn running(&self, stage: &str, completed: u64, total: u64) -> Result<(), CoordinationError> {
        self.report(&JobProgress::running(stage, completed, total))
    }
}
