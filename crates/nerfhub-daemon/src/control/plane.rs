//! Control request handling.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use nerfhub_core::Config;
use tracing::{debug, info, warn};

use crate::coordination::{BlockingReporter, Coordinator};
use crate::launcher::{JobError, JobLauncher, WorkerCommand, WorkerProcess, identity_key};
use crate::storage::{JobProgress, JobStatus};

use super::registry::{ViewerEntry, ViewerRegistry};
use super::types::{
    ControlError, ControlResponse, ExportRequest, ExportResult, RenderRequest, RenderResult,
    StartViewerRequest, ViewerInfo,
};
use super::workloads::Workloads;

const RENDER_PROGRESS_KEY: &str = "nerf_studio:render_trajectory";
const LIVENESS_TIMEOUT: Duration = Duration::from_secs(2);

/// Settings the control plane needs from the configuration.
#[derive(Debug, Clone)]
pub struct ControlSettings {
    pub lock_name: String,
    pub acquire_timeout: Duration,
    pub hold_timeout: Duration,
    pub export_progress_key: String,
    pub default_num_points: u64,
    pub viewer_host: String,
    pub viewer_port: u16,
    pub jpeg_quality: u8,
    pub viewer_progress_key: String,
    /// Viewer worker program; the running binary when unset.
    pub worker_command: Option<PathBuf>,
    /// Passed to viewer workers so they share this process's store.
    pub database_path: Option<PathBuf>,
    pub startup_timeout: Duration,
    pub terminate_timeout: Duration,
}

impl ControlSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            lock_name: config.coordination.lock_name.clone(),
            acquire_timeout: config.coordination.acquire_timeout(),
            hold_timeout: config.coordination.hold_timeout(),
            export_progress_key: config.export.progress_key.clone(),
            default_num_points: config.export.default_num_points,
            viewer_host: config.viewer.host.clone(),
            viewer_port: config.viewer.default_port,
            jpeg_quality: config.viewer.jpeg_quality,
            viewer_progress_key: config.viewer.progress_key.clone(),
            worker_command: config.viewer.worker_command.clone(),
            database_path: config
                .coordination
                .database_path
                .clone()
                .or_else(nerfhub_core::config::database_path),
            startup_timeout: config.viewer.startup_timeout(),
            terminate_timeout: config.viewer.terminate_timeout(),
        }
    }
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Entry point for every control request.
///
/// Each method resolves to a [`ControlResponse`]; failures are carried in
/// its code and message, never as a pending or panicking request.
pub struct ControlPlane {
    coordinator: Coordinator,
    launcher: JobLauncher,
    workloads: Arc<dyn Workloads>,
    viewers: ViewerRegistry,
    settings: ControlSettings,
}

impl ControlPlane {
    pub fn new(
        coordinator: Coordinator,
        workloads: Arc<dyn Workloads>,
        settings: ControlSettings,
    ) -> Self {
        Self {
            coordinator,
            launcher: JobLauncher::new(),
            workloads,
            viewers: ViewerRegistry::new(),
            settings,
        }
    }

    pub const fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub const fn viewers(&self) -> &ViewerRegistry {
        &self.viewers
    }

    pub const fn settings(&self) -> &ControlSettings {
        &self.settings
    }

    pub async fn export_point_cloud(&self, request: ExportRequest) -> ControlResponse<ExportResult> {
        let progress_key = request
            .progress_key
            .clone()
            .unwrap_or_else(|| self.settings.export_progress_key.clone());
        let num_points = request.num_points.unwrap_or(self.settings.default_num_points);
        let workloads = Arc::clone(&self.workloads);

        info!(
            load_config = %request.load_config.display(),
            output_dir = %request.output_dir.display(),
            num_points,
            %progress_key,
            "Export requested"
        );
        let result = self
            .run_locked_job("export_point_cloud", &progress_key, move |reporter| {
                workloads
                    .export_point_cloud(&request, num_points, reporter)
                    .map(|pcd_path| ExportResult { pcd_path })
            })
            .await;
        respond("export_point_cloud", result)
    }

    pub async fn render_trajectory(&self, request: RenderRequest) -> ControlResponse<RenderResult> {
        let progress_key = request
            .progress_key
            .clone()
            .unwrap_or_else(|| RENDER_PROGRESS_KEY.to_string());
        let workloads = Arc::clone(&self.workloads);

        info!(
            load_config = %request.load_config.display(),
            traj = ?request.traj,
            format = ?request.output_format,
            "Render requested"
        );
        let result = self
            .run_locked_job("render_trajectory", &progress_key, move |reporter| {
                workloads.render_trajectory(&request, reporter)
            })
            .await;
        respond("render_trajectory", result)
    }

    /// Start a viewer, or return the one already serving this identity.
    pub async fn start_viewer(&self, request: StartViewerRequest) -> ControlResponse<ViewerInfo> {
        respond("start_viewer", self.try_start_viewer(request).await)
    }

    /// Ask a viewer to stop, tear its worker down, then forget it.
    pub async fn stop_viewer(&self, session_key: &str) -> ControlResponse<()> {
        respond("stop_viewer", self.try_stop_viewer(session_key).await)
    }

    /// Latest progress stored under `key`.
    pub async fn progress(&self, key: &str) -> ControlResponse<JobProgress> {
        let result = match self.coordinator.progress(key).await {
            Ok(Some(progress)) => Ok(progress),
            Ok(None) => Err(ControlError::NotFound {
                what: "progress",
                key: key.to_string(),
            }),
            Err(e) => Err(e.into()),
        };
        respond("progress", result)
    }

    /// Ask whichever job reports under `key` to stop at its next checkpoint.
    ///
    /// Viewers watch their own stop keys, so every viewer reporting under
    /// `key` is signalled through its key as well.
    pub async fn stop_job(&self, key: &str) -> ControlResponse<()> {
        let mut result = self.coordinator.request_stop(key).await;
        for stop_key in self.viewers.stop_keys_for(key).await {
            if result.is_err() {
                break;
            }
            result = self.coordinator.request_stop(&stop_key).await;
        }
        if result.is_ok() {
            info!(key, "Stop requested");
        }
        respond("stop_job", result.map_err(Into::into))
    }

    /// Stop every running viewer.
    pub async fn shutdown(&self) {
        let keys: Vec<String> = self
            .viewers
            .list()
            .await
            .into_iter()
            .map(|info| info.session_key)
            .collect();
        for key in keys {
            let response = self.stop_viewer(&key).await;
            debug!(session_key = %key, code = %response.code, "Viewer stopped on shutdown");
        }
    }

    /// Run `job` under the shared lock on its own task.
    ///
    /// The caller only awaits the task, so dropping its future (a deadline,
    /// a lost client) still lets the job finish, record its status and
    /// release the lock.
    async fn run_locked_job<T, F>(
        &self,
        name: &str,
        progress_key: &str,
        job: F,
    ) -> Result<T, ControlError>
    where
        T: Send + 'static,
        F: FnOnce(&BlockingReporter) -> Result<T, JobError> + Send + 'static,
    {
        let task = tokio::spawn(locked_job(
            self.coordinator.clone(),
            self.launcher.clone(),
            LockSettings {
                name: self.settings.lock_name.clone(),
                acquire_timeout: self.settings.acquire_timeout,
                hold_timeout: self.settings.hold_timeout,
            },
            name.to_string(),
            progress_key.to_string(),
            job,
        ));
        task.await
            .map_err(|e| ControlError::Internal(format!("{name} task failed: {e}")))?
    }

    async fn try_start_viewer(&self, request: StartViewerRequest) -> Result<ViewerInfo, ControlError> {
        let port = request.websocket_port.unwrap_or(self.settings.viewer_port);
        let session_key = identity_key(&request.load_config, port);
        let progress_key = request
            .progress_key
            .clone()
            .unwrap_or_else(|| self.settings.viewer_progress_key.clone());

        let mut viewers = self.viewers.lock().await;
        if let Some(entry) = viewers.get_mut(&session_key) {
            if entry.is_alive(LIVENESS_TIMEOUT).await {
                info!(%session_key, endpoint = %entry.info().endpoint, "Viewer already running");
                return Ok(ViewerInfo {
                    existing: true,
                    ..entry.info().clone()
                });
            }
            warn!(%session_key, "Viewer worker no longer answering, starting a new one");
            if let Some(stale) = viewers.remove(&session_key) {
                let stop_key = stale.stop_key().to_string();
                if let Err(e) = stale.into_worker().shutdown().await {
                    warn!(%session_key, error = %e, "Could not reap old viewer worker");
                }
                if let Err(e) = self.coordinator.withdraw_stop(&stop_key).await {
                    warn!(%session_key, error = %e, "Could not clear stop request");
                }
            }
        }

        let stop_key = format!("{progress_key}:{}", uuid::Uuid::new_v4());
        let command =
            self.viewer_command(&request, port, &progress_key, &stop_key, &session_key)?;
        let worker = WorkerProcess::spawn(
            command,
            self.settings.startup_timeout,
            self.settings.terminate_timeout,
        )
        .await?;

        let info = ViewerInfo {
            session_key: session_key.clone(),
            endpoint: worker.endpoint().to_string(),
            progress_key,
            existing: false,
        };
        info!(%session_key, endpoint = %info.endpoint, "Viewer started");
        viewers.insert(session_key, ViewerEntry::new(info.clone(), stop_key, worker));
        Ok(info)
    }

    async fn try_stop_viewer(&self, session_key: &str) -> Result<(), ControlError> {
        let mut viewers = self.viewers.lock().await;
        let Some(stop_key) = viewers
            .get(session_key)
            .map(|entry| entry.stop_key().to_string())
        else {
            return Err(ControlError::NotFound {
                what: "viewer",
                key: session_key.to_string(),
            });
        };

        if let Err(e) = self.coordinator.request_stop(&stop_key).await {
            warn!(%session_key, error = %e, "Could not record stop request, tearing down anyway");
        }
        let shutdown = match viewers.remove(session_key) {
            Some(entry) => entry.into_worker().shutdown().await,
            None => return Ok(()),
        };
        drop(viewers);

        // A worker that exited on the control request never consumed the marker.
        if let Err(e) = self.coordinator.withdraw_stop(&stop_key).await {
            warn!(%session_key, error = %e, "Could not clear stop request");
        }

        let status = shutdown?;
        info!(%session_key, ?status, "Viewer stopped");
        Ok(())
    }

    fn viewer_command(
        &self,
        request: &StartViewerRequest,
        port: u16,
        progress_key: &str,
        stop_key: &str,
        session_key: &str,
    ) -> Result<WorkerCommand, ControlError> {
        let program = match &self.settings.worker_command {
            Some(program) => program.clone(),
            None => std::env::current_exe()
                .map_err(|e| ControlError::Internal(format!("cannot locate own binary: {e}")))?,
        };
        let jpeg_quality = request.jpeg_quality.unwrap_or(self.settings.jpeg_quality);

        let mut command = WorkerCommand::new(program)
            .arg("viewer")
            .arg("--load-config")
            .arg(&request.load_config)
            .arg("--host")
            .arg(&self.settings.viewer_host)
            .arg("--port")
            .arg(port.to_string())
            .arg("--jpeg-quality")
            .arg(jpeg_quality.to_string())
            .arg("--progress-key")
            .arg(progress_key)
            .arg("--stop-key")
            .arg(stop_key)
            .arg("--session-key")
            .arg(session_key);
        if let Some(path) = &self.settings.database_path {
            command = command.arg("--db-path").arg(path);
        }
        Ok(command)
    }
}

struct LockSettings {
    name: String,
    acquire_timeout: Duration,
    hold_timeout: Duration,
}

async fn locked_job<T, F>(
    coordinator: Coordinator,
    launcher: JobLauncher,
    lock: LockSettings,
    name: String,
    progress_key: String,
    job: F,
) -> Result<T, ControlError>
where
    T: Send + 'static,
    F: FnOnce(&BlockingReporter) -> Result<T, JobError> + Send + 'static,
{
    let token = coordinator
        .acquire(&lock.name, lock.acquire_timeout, lock.hold_timeout)
        .await?
        .ok_or_else(|| ControlError::LockTimeout {
            name: lock.name.clone(),
            timeout: lock.acquire_timeout,
        })?;
    let reporter = coordinator.reporter(progress_key.as_str());
    let blocking = reporter.blocking(tokio::runtime::Handle::current());
    let outcome = launcher
        .run(&name, move |sink| {
            sink.send(job(&blocking));
        })
        .await;

    let status = match &outcome {
        Ok(_) => JobStatus::Succeeded,
        Err(JobError::Aborted { .. }) => JobStatus::Cancelled,
        Err(_) => JobStatus::Failed,
    };
    let last = match coordinator.progress(&progress_key).await {
        Ok(progress) => progress.unwrap_or_default(),
        Err(e) => {
            warn!(key = %progress_key, error = %e, "Could not read progress");
            JobProgress::default()
        }
    };
    if let Err(e) = reporter.finish(last.with_status(status)).await {
        warn!(key = %progress_key, error = %e, "Could not record final job status");
    }

    if let Err(e) = coordinator.release(&lock.name, &token).await {
        warn!(lock = %lock.name, job = %name, error = %e, "Could not release lock");
    }

    outcome.map_err(Into::into)
}

fn respond<T>(operation: &str, result: Result<T, ControlError>) -> ControlResponse<T> {
    if let Err(e) = &result {
        warn!(operation, code = %e.code(), error = %e, "Control request failed");
    }
    ControlResponse::from_result(result)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::control::types::ResponseCode;
    use crate::storage::Database;

    /// Reports `steps` progress updates, then returns a path.
    struct FakeWorkloads {
        steps: u64,
        delay: Duration,
        exports: AtomicUsize,
    }

    impl FakeWorkloads {
        fn new(steps: u64) -> Arc<Self> {
            Self::slow(steps, Duration::ZERO)
        }

        fn slow(steps: u64, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                steps,
                delay,
                exports: AtomicUsize::new(0),
            })
        }
    }

    impl Workloads for FakeWorkloads {
        fn export_point_cloud(
            &self,
            request: &ExportRequest,
            num_points: u64,
            reporter: &BlockingReporter,
        ) -> Result<PathBuf, JobError> {
            self.exports.fetch_add(1, Ordering::SeqCst);
            if num_points == 0 {
                return Err(JobError::failed("export_point_cloud", "no points requested"));
            }
            std::thread::sleep(self.delay);
            for step in 1..=self.steps {
                reporter.running("export", step, self.steps)?;
            }
            Ok(request.output_dir.join("point_cloud.ply"))
        }

        fn render_trajectory(
            &self,
            request: &RenderRequest,
            _reporter: &BlockingReporter,
        ) -> Result<RenderResult, JobError> {
            panic!("renderer crashed on {}", request.load_config.display())
        }
    }

    async fn plane(workloads: Arc<FakeWorkloads>) -> ControlPlane {
        let db = Database::open_in_memory().await.unwrap();
        let settings = ControlSettings {
            acquire_timeout: Duration::from_millis(100),
            database_path: None,
            ..ControlSettings::default()
        };
        ControlPlane::new(Coordinator::new(db), workloads, settings)
    }

    fn export(key: &str, num_points: Option<u64>) -> ExportRequest {
        ExportRequest {
            load_config: PathBuf::from("outputs/poster/config.yml"),
            output_dir: PathBuf::from("exports/poster"),
            num_points,
            progress_key: Some(key.to_string()),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn export_succeeds_and_records_final_status() {
        let plane = plane(FakeWorkloads::new(4)).await;

        let response = plane.export_point_cloud(export("k1", None)).await;
        assert_eq!(response.code, ResponseCode::Ok);
        assert_eq!(
            response.data.unwrap().pcd_path,
            PathBuf::from("exports/poster/point_cloud.ply")
        );

        let progress = plane.progress("k1").await.data.unwrap();
        assert_eq!(progress.status, JobStatus::Succeeded);
        assert_eq!(progress.completed, 4);
        assert!(
            plane
                .coordinator()
                .database()
                .lock_owner("nerf_studio_lock")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pending_stop_aborts_the_export() {
        let plane = plane(FakeWorkloads::new(4)).await;
        assert!(plane.stop_job("k1").await.is_ok());

        let response = plane.export_point_cloud(export("k1", None)).await;
        assert_eq!(response.code, ResponseCode::Aborted);

        let progress = plane.progress("k1").await.data.unwrap();
        assert_eq!(progress.status, JobStatus::Cancelled);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn busy_lock_times_out() {
        let workloads = FakeWorkloads::new(1);
        let plane = plane(Arc::clone(&workloads)).await;
        let held = plane
            .coordinator()
            .try_acquire("nerf_studio_lock", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(held.is_some());

        let response = plane.export_point_cloud(export("k1", None)).await;
        assert_eq!(response.code, ResponseCode::LockTimeout);
        assert_eq!(workloads.exports.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn workload_error_is_worker_failed() {
        let plane = plane(FakeWorkloads::new(1)).await;

        let response = plane.export_point_cloud(export("k1", Some(0))).await;
        assert_eq!(response.code, ResponseCode::WorkerFailed);
        assert!(response.message.contains("no points requested"));
        assert_eq!(
            plane.progress("k1").await.data.unwrap().status,
            JobStatus::Failed
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn abandoned_request_still_releases_the_lock() {
        let workloads = FakeWorkloads::slow(2, Duration::from_millis(300));
        let plane = plane(Arc::clone(&workloads)).await;

        let abandoned =
            tokio::time::timeout(Duration::from_millis(50), plane.export_point_cloud(export("k1", None)))
                .await;
        assert!(abandoned.is_err());

        tokio::time::timeout(Duration::from_secs(5), async {
            while plane.progress("k1").await.data.map(|p| p.status) != Some(JobStatus::Succeeded) {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let token = plane
            .coordinator()
            .acquire("nerf_studio_lock", Duration::from_secs(2), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(token.is_some());
        assert_eq!(workloads.exports.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn workload_panic_is_worker_failed_and_frees_the_lock() {
        let plane = plane(FakeWorkloads::new(1)).await;
        let request = RenderRequest {
            load_config: PathBuf::from("c.yml"),
            traj: crate::control::Trajectory::Spiral,
            camera_path: None,
            output_path: PathBuf::from("renders/out.mp4"),
            output_format: crate::control::OutputFormat::Video,
            progress_key: Some("render".to_string()),
        };

        let response = plane.render_trajectory(request).await;
        assert_eq!(response.code, ResponseCode::WorkerFailed);
        assert!(response.message.contains("renderer crashed"));

        let next = plane.export_point_cloud(export("k2", None)).await;
        assert!(next.is_ok());
    }

    #[tokio::test]
    async fn unknown_keys_are_not_found() {
        let plane = plane(FakeWorkloads::new(1)).await;
        assert_eq!(plane.progress("missing").await.code, ResponseCode::NotFound);
        assert_eq!(
            plane.stop_viewer("123").await.code,
            ResponseCode::NotFound
        );
    }

    #[tokio::test]
    async fn unstartable_viewer_is_startup_failed() {
        let workloads = FakeWorkloads::new(1);
        let db = Database::open_in_memory().await.unwrap();
        let settings = ControlSettings {
            worker_command: Some(PathBuf::from("/nonexistent/nerfhub")),
            database_path: None,
            ..ControlSettings::default()
        };
        let plane = ControlPlane::new(Coordinator::new(db), workloads, settings);

        let response = plane
            .start_viewer(StartViewerRequest {
                load_config: "outputs/poster/config.yml".to_string(),
                websocket_port: None,
                jpeg_quality: None,
                progress_key: None,
            })
            .await;
        assert_eq!(response.code, ResponseCode::StartupFailed);
        assert!(plane.viewers().is_empty().await);
    }
}
