#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity
#![cfg(unix)]

//! Viewer start/stop through the control plane, with a shell script
//! standing in for the worker binary.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use nerfhub_daemon::control::{
    ControlPlane, ControlSettings, ExportRequest, RenderRequest, RenderResult, ResponseCode,
    StartViewerRequest, Workloads,
};
use nerfhub_daemon::coordination::{BlockingReporter, Coordinator};
use nerfhub_daemon::launcher::JobError;
use nerfhub_daemon::storage::Database;

struct Idle;

impl Workloads for Idle {
    fn export_point_cloud(
        &self,
        _request: &ExportRequest,
        _num_points: u64,
        _reporter: &BlockingReporter,
    ) -> Result<PathBuf, JobError> {
        Err(JobError::failed("export_point_cloud", "unused"))
    }

    fn render_trajectory(
        &self,
        _request: &RenderRequest,
        _reporter: &BlockingReporter,
    ) -> Result<RenderResult, JobError> {
        Err(JobError::failed("render_trajectory", "unused"))
    }
}

/// Worker scripts. All are written before the first spawn so no child
/// inherits a script file still open for writing.
struct Scripts {
    dir: tempfile::TempDir,
    serve: PathBuf,
    short_lived: PathBuf,
    failing: PathBuf,
}

impl Scripts {
    fn count(&self, script: &Path) -> PathBuf {
        self.dir.path().join(format!(
            "{}.launches",
            script.file_stem().unwrap().to_string_lossy()
        ))
    }
}

const SERVE: &str = r"while read line; do
  case $line in
    stop) echo ok; exit 0 ;;
    *) echo pong ;;
  esac
done";

fn scripts() -> &'static Scripts {
    static SCRIPTS: OnceLock<Scripts> = OnceLock::new();
    SCRIPTS.get_or_init(|| {
        let dir = tempfile::tempdir().unwrap();
        let write = |name: &str, body: &str| {
            let path = dir.path().join(name);
            let count = dir.path().join(format!("{}.launches", name.trim_end_matches(".sh")));
            let script = format!(
                "#!/bin/sh\necho started >> '{}'\n{body}\n",
                count.display()
            );
            std::fs::write(&path, script).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        };
        let serve = write("serve.sh", &format!("echo ws://127.0.0.1:7007/ws\n{SERVE}"));
        let short_lived = write("short-lived.sh", "echo ws://127.0.0.1:7007/ws\nexit 0");
        let failing = write(
            "failing.sh",
            "echo 'error:bind_failed: 127.0.0.1:7007 in use'\nexit 1",
        );
        Scripts {
            dir,
            serve,
            short_lived,
            failing,
        }
    })
}

fn launches(count: &Path) -> usize {
    std::fs::read_to_string(count)
        .map(|text| text.lines().count())
        .unwrap_or_default()
}

async fn plane(dir: &Path, worker: PathBuf) -> ControlPlane {
    let db_path = dir.join("coordination.db");
    let coordinator = Coordinator::new(Database::open(&db_path).await.unwrap());
    let settings = ControlSettings {
        worker_command: Some(worker),
        database_path: Some(db_path),
        startup_timeout: Duration::from_secs(10),
        terminate_timeout: Duration::from_secs(2),
        ..ControlSettings::default()
    };
    ControlPlane::new(coordinator, Arc::new(Idle), settings)
}

fn request() -> StartViewerRequest {
    StartViewerRequest {
        load_config: "outputs/poster/nerfacto/config.yml".to_string(),
        websocket_port: Some(7007),
        jpeg_quality: None,
        progress_key: Some("viewer:poster".to_string()),
    }
}

#[tokio::test]
async fn repeated_starts_share_one_worker() {
    let scripts = scripts();
    let dir = tempfile::tempdir().unwrap();
    let count = scripts.count(&scripts.serve);
    let plane = plane(dir.path(), scripts.serve.clone()).await;

    let (first, second) = tokio::join!(plane.start_viewer(request()), plane.start_viewer(request()));
    assert_eq!(first.code, ResponseCode::Ok);
    assert_eq!(second.code, ResponseCode::Ok);
    let first = first.data.unwrap();
    let second = second.data.unwrap();
    assert_eq!(first.session_key, second.session_key);
    assert_eq!(first.endpoint, "ws://127.0.0.1:7007/ws");
    assert_eq!(first.endpoint, second.endpoint);
    assert!(first.existing != second.existing);

    let third = plane.start_viewer(request()).await.data.unwrap();
    assert!(third.existing);
    assert_eq!(third.session_key, first.session_key);
    assert_eq!(launches(&count), 1);
    assert_eq!(plane.viewers().len().await, 1);

    let stopped = plane.stop_viewer(&first.session_key).await;
    assert_eq!(stopped.code, ResponseCode::Ok);
    assert!(plane.viewers().is_empty().await);
    assert!(
        !plane
            .coordinator()
            .is_stop_requested("viewer:poster")
            .await
            .unwrap()
    );

    let again = plane.stop_viewer(&first.session_key).await;
    assert_eq!(again.code, ResponseCode::NotFound);
}

#[tokio::test]
async fn exited_worker_is_replaced() {
    let scripts = scripts();
    let dir = tempfile::tempdir().unwrap();
    let count = scripts.count(&scripts.short_lived);
    let plane = plane(dir.path(), scripts.short_lived.clone()).await;

    let first = plane.start_viewer(request()).await.data.unwrap();
    assert!(!first.existing);
    tokio::time::sleep(Duration::from_millis(300)).await;

    let second = plane.start_viewer(request()).await.data.unwrap();
    assert!(!second.existing);
    assert_eq!(second.session_key, first.session_key);
    assert_eq!(launches(&count), 2);

    assert_eq!(
        plane.stop_viewer(&second.session_key).await.code,
        ResponseCode::Ok
    );
}

#[tokio::test]
async fn startup_error_line_is_reported() {
    let scripts = scripts();
    let dir = tempfile::tempdir().unwrap();
    let plane = plane(dir.path(), scripts.failing.clone()).await;

    let response = plane.start_viewer(request()).await;
    assert_eq!(response.code, ResponseCode::BindFailed);
    assert!(response.data.is_none());
    assert!(plane.viewers().is_empty().await);
}
