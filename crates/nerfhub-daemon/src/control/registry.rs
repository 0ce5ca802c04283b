//! Running viewers keyed by identity.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};

use crate::launcher::WorkerProcess;

use super::types::ViewerInfo;

/// One running viewer and the worker serving it.
#[derive(Debug)]
pub struct ViewerEntry {
    info: ViewerInfo,
    stop_key: String,
    worker: WorkerProcess,
}

impl ViewerEntry {
    pub const fn new(info: ViewerInfo, stop_key: String, worker: WorkerProcess) -> Self {
        Self {
            info,
            stop_key,
            worker,
        }
    }

    pub const fn info(&self) -> &ViewerInfo {
        &self.info
    }

    /// Stop marker key watched by this worker only.
    pub fn stop_key(&self) -> &str {
        &self.stop_key
    }

    pub fn worker_mut(&mut self) -> &mut WorkerProcess {
        &mut self.worker
    }

    /// Whether the worker is still running and answering control requests.
    pub async fn is_alive(&mut self, timeout: Duration) -> bool {
        self.worker.is_responsive(timeout).await
    }

    pub fn into_worker(self) -> WorkerProcess {
        self.worker
    }
}

/// Viewer table owned by one control plane.
///
/// The async mutex is held across a viewer's startup, so two concurrent
/// start requests for the same identity produce a single worker.
#[derive(Debug, Default)]
pub struct ViewerRegistry {
    entries: Mutex<HashMap<String, ViewerEntry>>,
}

impl ViewerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, HashMap<String, ViewerEntry>> {
        self.entries.lock().await
    }

    pub async fn get(&self, session_key: &str) -> Option<ViewerInfo> {
        self.entries
            .lock()
            .await
            .get(session_key)
            .map(|entry| entry.info.clone())
    }

    pub async fn list(&self) -> Vec<ViewerInfo> {
        let mut infos: Vec<ViewerInfo> = self
            .entries
            .lock()
            .await
            .values()
            .map(|entry| entry.info.clone())
            .collect();
        infos.sort_by(|a, b| a.session_key.cmp(&b.session_key));
        infos
    }

    /// Stop keys of every viewer reporting progress under `progress_key`.
    pub async fn stop_keys_for(&self, progress_key: &str) -> Vec<String> {
        self.entries
            .lock()
            .await
            .values()
            .filter(|entry| entry.info.progress_key == progress_key)
            .map(|entry| entry.stop_key.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
