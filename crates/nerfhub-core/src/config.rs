//! Configuration resolution for nerfhub.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/nerfhub/settings.json)
//! 3. Project config (.nerfhub/settings.json)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Complete nerfhub configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub coordination: CoordinationConfig,
    #[serde(default)]
    pub viewer: ViewerConfig,
    #[serde(default)]
    pub export: ExportConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

/// Process-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub log_level: String,
    pub log_json: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

/// Shared coordination store (lock + progress + stop markers).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    /// Database file shared by every participating process.
    pub database_path: Option<PathBuf>,
    /// Name of the lock serialising reconstruction jobs.
    pub lock_name: String,
    pub acquire_timeout_secs: u64,
    pub hold_timeout_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            lock_name: "nerf_studio_lock".to_string(),
            acquire_timeout_secs: 5,
            hold_timeout_secs: 3600,
            poll_interval_ms: 10,
        }
    }
}

impl CoordinationConfig {
    pub const fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub const fn hold_timeout(&self) -> Duration {
        Duration::from_secs(self.hold_timeout_secs)
    }

    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Viewer worker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    pub host: String,
    pub default_port: u16,
    /// How many successive ports to try when the requested one is taken.
    pub port_attempts: u16,
    pub jpeg_quality: u8,
    pub progress_key: String,
    /// Program started for each viewer. Defaults to the running binary.
    pub worker_command: Option<PathBuf>,
    pub terminate_timeout_secs: u64,
    /// Seconds to wait for a worker's first stdout line.
    pub startup_timeout_secs: u64,
    /// Seconds between the worker's progress/stop checks.
    pub heartbeat_secs: u64,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            default_port: 7007,
            port_attempts: 500,
            jpeg_quality: 30,
            progress_key: "nerf_studio:run_viewer".to_string(),
            worker_command: None,
            terminate_timeout_secs: 5,
            startup_timeout_secs: 120,
            heartbeat_secs: 2,
        }
    }
}

impl ViewerConfig {
    pub const fn terminate_timeout(&self) -> Duration {
        Duration::from_secs(self.terminate_timeout_secs)
    }

    pub const fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub const fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }
}

/// Point-cloud export defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    pub default_num_points: u64,
    pub progress_key: String,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            default_num_points: 1_000_000,
            progress_key: "nerf_studio:export_point_cloud".to_string(),
        }
    }
}

/// Session server limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Incoming frames larger than this are dropped.
    pub max_frame_bytes: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: 8 * 1024 * 1024,
        }
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    // Load global config
    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        let global = load_config_file(&global_path)?;
        merge_config(&mut config, global);
    }

    // Load project config
    if let Some(dir) = project_dir {
        let project_path = dir.join(".nerfhub").join("settings.json");
        if project_path.exists() {
            let project = load_config_file(&project_path)?;
            merge_config(&mut config, project);
        }
    }

    apply_env_overrides(&mut config);

    Ok(config)
}

/// Get the global config directory path.
pub fn global_config_path() -> Option<PathBuf> {
    config_dir().map(|p| p.join("settings.json"))
}

/// Default coordination database path.
pub fn database_path() -> Option<PathBuf> {
    config_dir().map(|p| p.join("coordination.db"))
}

fn config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(|h| PathBuf::from(h).join(".nerfhub"))
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/nerfhub"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("nerfhub"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    parse_config(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Parse a settings document; missing sections and fields take defaults.
pub fn parse_config(content: &str) -> Result<Config> {
    Ok(serde_json::from_str(content)?)
}

fn merge_config(base: &mut Config, overlay: Config) {
    base.daemon = overlay.daemon;

    if overlay.coordination.database_path.is_some() {
        base.coordination.database_path = overlay.coordination.database_path;
    }
    base.coordination.lock_name = overlay.coordination.lock_name;
    base.coordination.acquire_timeout_secs = overlay.coordination.acquire_timeout_secs;
    base.coordination.hold_timeout_secs = overlay.coordination.hold_timeout_secs;
    base.coordination.poll_interval_ms = overlay.coordination.poll_interval_ms;

    let worker_command = overlay
        .viewer
        .worker_command
        .clone()
        .or_else(|| base.viewer.worker_command.take());
    base.viewer = overlay.viewer;
    base.viewer.worker_command = worker_command;

    base.export = overlay.export;
    base.session = overlay.session;
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(val) = std::env::var("NERFHUB_DB_PATH") {
        config.coordination.database_path = Some(PathBuf::from(val));
    }
    if let Ok(val) = std::env::var("NERFHUB_LOCK_NAME") {
        config.coordination.lock_name = val;
    }
    if let Ok(val) = std::env::var("NERFHUB_VIEWER_HOST") {
        config.viewer.host = val;
    }
    if let Ok(val) = std::env::var("NERFHUB_VIEWER_PORT")
        && let Ok(n) = val.parse()
    {
        config.viewer.default_port = n;
    }
    if let Ok(val) = std::env::var("NERFHUB_LOG_LEVEL") {
        config.daemon.log_level = val;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reconstruction_setup() {
        let config = Config::default();
        assert_eq!(config.coordination.lock_name, "nerf_studio_lock");
        assert_eq!(config.coordination.acquire_timeout(), Duration::from_secs(5));
        assert_eq!(config.coordination.hold_timeout(), Duration::from_secs(3600));
        assert_eq!(config.viewer.default_port, 7007);
        assert_eq!(config.viewer.jpeg_quality, 30);
        assert_eq!(config.export.default_num_points, 1_000_000);
    }

    #[test]
    fn partial_sections_keep_field_defaults() {
        let config = parse_config(r#"{"viewer": {"default_port": 9000}}"#).unwrap();
        assert_eq!(config.viewer.default_port, 9000);
        assert_eq!(config.viewer.jpeg_quality, 30);
        assert_eq!(config.coordination.poll_interval_ms, 10);
    }

    #[test]
    fn merge_keeps_database_path_when_overlay_has_none() {
        let mut base = Config::default();
        base.coordination.database_path = Some(PathBuf::from("/tmp/store.db"));
        let overlay = parse_config(r#"{"coordination": {"lock_name": "gpu"}}"#).unwrap();
        merge_config(&mut base, overlay);
        assert_eq!(base.coordination.lock_name, "gpu");
        assert_eq!(
            base.coordination.database_path,
            Some(PathBuf::from("/tmp/store.db"))
        );
    }

    #[test]
    fn invalid_document_is_an_error() {
        assert!(matches!(parse_config("{not json"), Err(Error::Json(_))));

        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".nerfhub")).unwrap();
        std::fs::write(dir.path().join(".nerfhub/settings.json"), "[1").unwrap();
        assert!(matches!(load_config(Some(dir.path())), Err(Error::Config(_))));
    }
}
