//! Control request and response types.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::coordination::CoordinationError;
use crate::launcher::{BIND_FAILED, JobError, LauncherError};
use crate::storage::DatabaseError;

/// Stable machine-readable outcome of a control request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseCode {
    Ok,
    LockTimeout,
    Aborted,
    WorkerFailed,
    StartupFailed,
    NotFound,
    StoreError,
    BindFailed,
    Internal,
}

impl ResponseCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::LockTimeout => "lock_timeout",
            Self::Aborted => "aborted",
            Self::WorkerFailed => "worker_failed",
            Self::StartupFailed => "startup_failed",
            Self::NotFound => "not_found",
            Self::StoreError => "store_error",
            Self::BindFailed => "bind_failed",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope every control request resolves to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlResponse<T> {
    pub code: ResponseCode,
    pub message: String,
    pub data: Option<T>,
}

impl<T> ControlResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            code: ResponseCode::Ok,
            message: "success".to_string(),
            data: Some(data),
        }
    }

    pub fn error(err: &ControlError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
            data: None,
        }
    }

    pub fn from_result(result: Result<T, ControlError>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(e) => Self::error(&e),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == ResponseCode::Ok
    }
}

/// Control plane errors.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("Lock {name} still busy after {timeout:?}")]
    LockTimeout { name: String, timeout: Duration },

    #[error("Stopped on request ({key})")]
    Aborted { key: String },

    #[error("Worker failed: {0}")]
    WorkerFailed(String),

    #[error("Viewer failed to start: {0}")]
    StartupFailed(String),

    #[error("Viewer could not bind a port: {0}")]
    BindFailed(String),

    #[error("{what} not found: {key}")]
    NotFound { what: &'static str, key: String },

    #[error("Coordination store error: {0}")]
    Store(#[from] DatabaseError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ControlError {
    pub const fn code(&self) -> ResponseCode {
        match self {
            Self::LockTimeout { .. } => ResponseCode::LockTimeout,
            Self::Aborted { .. } => ResponseCode::Aborted,
            Self::WorkerFailed(_) => ResponseCode::WorkerFailed,
            Self::StartupFailed(_) => ResponseCode::StartupFailed,
            Self::BindFailed(_) => ResponseCode::BindFailed,
            Self::NotFound { .. } => ResponseCode::NotFound,
            Self::Store(_) => ResponseCode::StoreError,
            Self::Internal(_) => ResponseCode::Internal,
        }
    }
}

impl From<CoordinationError> for ControlError {
    fn from(err: CoordinationError) -> Self {
        match err {
            CoordinationError::Aborted { key } => Self::Aborted { key },
            CoordinationError::Store(e) => Self::Store(e),
        }
    }
}

impl From<JobError> for ControlError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::Aborted { key } => Self::Aborted { key },
            JobError::Store(e) => Self::Store(e),
            e @ (JobError::WorkerFailure { .. } | JobError::DeadlineExceeded { .. }) => {
                Self::WorkerFailed(e.to_string())
            }
        }
    }
}

impl From<LauncherError> for ControlError {
    fn from(err: LauncherError) -> Self {
        match err {
            LauncherError::StartupFailed { reason } => match reason.strip_prefix(BIND_FAILED) {
                Some(rest) => Self::BindFailed(rest.trim_start_matches(':').trim().to_string()),
                None => Self::StartupFailed(reason),
            },
            e @ LauncherError::Spawn { .. } => Self::StartupFailed(e.to_string()),
            e => Self::Internal(e.to_string()),
        }
    }
}

/// Point-cloud export request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportRequest {
    pub load_config: PathBuf,
    pub output_dir: PathBuf,
    #[serde(default)]
    pub num_points: Option<u64>,
    #[serde(default)]
    pub progress_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportResult {
    pub pcd_path: PathBuf,
}

/// Viewer start request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartViewerRequest {
    pub load_config: String,
    #[serde(default)]
    pub websocket_port: Option<u16>,
    #[serde(default)]
    pub jpeg_quality: Option<u8>,
    #[serde(default)]
    pub progress_key: Option<String>,
}

/// A running viewer as reported to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewerInfo {
    /// Identity key; also the key used to stop the viewer.
    pub session_key: String,
    pub endpoint: String,
    pub progress_key: String,
    /// Set when this request matched a viewer that was already running.
    #[serde(default)]
    pub existing: bool,
}

/// Camera path source for a render.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trajectory {
    Spiral,
    Filename,
    Interpolate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    Images,
    #[default]
    Video,
}

/// Trajectory render request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderRequest {
    pub load_config: PathBuf,
    pub traj: Trajectory,
    /// Camera path file, required when `traj` is `filename`.
    #[serde(default)]
    pub camera_path: Option<PathBuf>,
    pub output_path: PathBuf,
    #[serde(default)]
    pub output_format: OutputFormat,
    #[serde(default)]
    pub progress_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderResult {
    pub artifacts: Vec<PathBuf>,
}
