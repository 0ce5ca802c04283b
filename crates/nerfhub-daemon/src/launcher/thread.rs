//! Thread-backed one-shot jobs.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::JobError;
use super::sink::ResultSink;

/// Runs jobs on dedicated OS threads.
#[derive(Debug, Clone, Default)]
pub struct JobLauncher {
    active: Arc<AtomicUsize>,
}

impl JobLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Jobs whose thread has not finished yet.
    pub fn active_jobs(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Run `job` on a new thread and wait for the value it sends.
    ///
    /// A panic, or a return without sending, becomes
    /// [`JobError::WorkerFailure`].
    pub async fn run<T, F>(&self, name: &str, job: F) -> Result<T, JobError>
    where
        T: Send + 'static,
        F: FnOnce(ResultSink<T>) + Send + 'static,
    {
        let rx = self.spawn(name, job)?;
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(JobError::failed(name, "result channel closed")),
        }
    }

    /// Like [`run`](Self::run), giving up after `deadline`.
    ///
    /// The job thread keeps running after a timeout; stop it through the
    /// coordinator. Its late result is discarded.
    pub async fn run_with_deadline<T, F>(
        &self,
        name: &str,
        deadline: Duration,
        job: F,
    ) -> Result<T, JobError>
    where
        T: Send + 'static,
        F: FnOnce(ResultSink<T>) + Send + 'static,
    {
        let rx = self.spawn(name, job)?;
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(JobError::failed(name, "result channel closed")),
            Err(_) => {
                warn!(job = name, ?deadline, "Job missed its deadline");
                Err(JobError::DeadlineExceeded {
                    job: name.to_string(),
                    timeout: deadline,
                })
            }
        }
    }

    fn spawn<T, F>(
        &self,
        name: &str,
        job: F,
    ) -> Result<oneshot::Receiver<Result<T, JobError>>, JobError>
    where
        T: Send + 'static,
        F: FnOnce(ResultSink<T>) + Send + 'static,
    {
        let (sink, guard, rx) = ResultSink::channel();
        let job_name = name.to_string();
        let active = Arc::clone(&self.active);

        active.fetch_add(1, Ordering::SeqCst);
        let spawned = std::thread::Builder::new()
            .name(format!("job-{name}"))
            .spawn(move || {
                debug!(job = %job_name, "Job thread started");
                let reason = match panic::catch_unwind(AssertUnwindSafe(move || job(sink))) {
                    Ok(()) => "job returned without a result".to_string(),
                    Err(payload) => format!("job panicked: {}", panic_message(payload.as_ref())),
                };
                if guard.close_with(JobError::WorkerFailure {
                    job: job_name.clone(),
                    reason: reason.clone(),
                }) {
                    warn!(job = %job_name, %reason, "Job ended without delivering a result");
                }
                active.fetch_sub(1, Ordering::SeqCst);
                info!(job = %job_name, "Job thread finished");
            });

        if let Err(e) = spawned {
            self.active.fetch_sub(1, Ordering::SeqCst);
            return Err(JobError::failed(name, format!("cannot start thread: {e}")));
        }
        Ok(rx)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_the_sent_value() {
        let launcher = JobLauncher::new();
        let value = launcher
            .run("sum", |sink| {
                sink.succeed((1..=10).sum::<u32>());
            })
            .await
            .unwrap();
        assert_eq!(value, 55);
    }

    #[tokio::test]
    async fn job_error_is_forwarded_unchanged() {
        let launcher = JobLauncher::new();
        let err = launcher
            .run::<(), _>("stop", |sink| {
                sink.fail(JobError::Aborted {
                    key: "k1".to_string(),
                });
            })
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Aborted { key } if key == "k1"));
    }

    #[tokio::test]
    async fn panic_becomes_worker_failure() {
        let launcher = JobLauncher::new();
        let err = launcher
            .run::<(), _>("crash", |_sink| panic!("out of GPU memory"))
            .await
            .unwrap_err();
        match err {
            JobError::WorkerFailure { job, reason } => {
                assert_eq!(job, "crash");
                assert!(reason.contains("out of GPU memory"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn dropped_sink_becomes_worker_failure() {
        let launcher = JobLauncher::new();
        let err = launcher
            .run::<u32, _>("silent", drop)
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::WorkerFailure { .. }));
    }

    #[tokio::test]
    async fn deadline_expires_before_a_slow_job() {
        let launcher = JobLauncher::new();
        let err = launcher
            .run_with_deadline("slow", Duration::from_millis(20), |sink| {
                std::thread::sleep(Duration::from_millis(300));
                sink.succeed(());
            })
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::DeadlineExceeded { .. }));
    }

    #[tokio::test]
    async fn active_count_returns_to_zero() {
        let launcher = JobLauncher::new();
        launcher.run("quick", |sink| {
            sink.succeed(());
        })
        .await
        .unwrap();

        for _ in 0..100 {
            if launcher.active_jobs() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(launcher.active_jobs(), 0);
    }
}
