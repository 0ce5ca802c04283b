//! One-shot result sink.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::oneshot;

use super::JobError;

type Slot<T> = Arc<Mutex<Option<oneshot::Sender<Result<T, JobError>>>>>;

/// Sending half of a job's result channel.
///
/// Consumed by the first send, so a job cannot deliver two results.
pub struct ResultSink<T> {
    slot: Slot<T>,
}

impl<T> ResultSink<T> {
    /// Sink, the launcher's fallback guard, and the receiving end.
    pub(crate) fn channel() -> (Self, SinkGuard<T>, oneshot::Receiver<Result<T, JobError>>) {
        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(Mutex::new(Some(tx)));
        (
            Self {
                slot: Arc::clone(&slot),
            },
            SinkGuard { slot },
            rx,
        )
    }

    /// Deliver the job's outcome. Returns `false` if nobody is waiting.
    pub fn send(self, result: Result<T, JobError>) -> bool {
        take(&self.slot).is_some_and(|tx| tx.send(result).is_ok())
    }

    pub fn succeed(self, value: T) -> bool {
        self.send(Ok(value))
    }

    pub fn fail(self, error: JobError) -> bool {
        self.send(Err(error))
    }
}

impl<T> std::fmt::Debug for ResultSink<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultSink").finish_non_exhaustive()
    }
}

/// Launcher-held handle that fills the sink if the job never did.
pub(crate) struct SinkGuard<T> {
    slot: Slot<T>,
}

impl<T> SinkGuard<T> {
    /// Send `error` unless a result was already delivered.
    /// Returns whether the fallback was used.
    pub(crate) fn close_with(self, error: JobError) -> bool {
        match take(&self.slot) {
            Some(tx) => {
                let _ = tx.send(Err(error));
                true
            }
            None => false,
        }
    }
}

fn take<T>(slot: &Slot<T>) -> Option<oneshot::Sender<Result<T, JobError>>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner).take()
}
