//! `nerfhub` binary
//!
//! Hosts the viewer worker the control plane launches, and offers a few
//! commands for driving the coordination store from a shell.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tokio::io::BufReader;
use tracing::info;

use nerfhub_core::Config;
use nerfhub_daemon::control::{
    ControlPlane, ControlSettings, ExportRequest, RenderRequest, RenderResult, StartViewerRequest,
    Workloads,
};
use nerfhub_daemon::coordination::{BlockingReporter, Coordinator};
use nerfhub_daemon::launcher::JobError;
use nerfhub_daemon::session::{ServerConfig, SessionServer};
use nerfhub_daemon::storage::Database;
use nerfhub_daemon::viewer::{WorkerOptions, run_worker};

#[derive(Parser, Debug)]
#[command(name = "nerfhub")]
#[command(version, about = "nerfhub - viewer hub and job coordination for NeRF workloads")]
struct Cli {
    /// Coordination database file
    #[arg(long, global = true, env = "NERFHUB_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Project directory holding `.nerfhub/settings.json`
    #[arg(long, global = true)]
    project_dir: Option<PathBuf>,

    /// Log level filter (e.g. "info", "debug", "warn")
    #[arg(long, global = true, env = "NERFHUB_LOG_LEVEL")]
    log_level: Option<String>,

    /// Output logs as JSON
    #[arg(long, global = true, env = "NERFHUB_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve one viewer. Prints the endpoint, then reads control requests on stdin.
    Viewer(ViewerArgs),
    /// Start a viewer through the control plane and keep it until interrupted
    RunViewer {
        #[arg(long)]
        load_config: String,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        jpeg_quality: Option<u8>,
        #[arg(long)]
        progress_key: Option<String>,
    },
    /// Ask the job reporting under KEY to stop at its next checkpoint
    RequestStop { key: String },
    /// Print the latest progress stored under KEY
    Progress { key: String },
}

#[derive(Args, Debug)]
struct ViewerArgs {
    #[arg(long)]
    load_config: String,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    jpeg_quality: Option<u8>,
    #[arg(long)]
    progress_key: Option<String>,
    /// Stop marker key; defaults to the progress key
    #[arg(long)]
    stop_key: Option<String>,
    /// Identity key assigned by the control plane
    #[arg(long, default_value = "")]
    session_key: String,
}

/// Stand-in for builds without a reconstruction backend linked in.
struct NoBackend;

impl Workloads for NoBackend {
    fn export_point_cloud(
        &self,
        _request: &ExportRequest,
        _num_points: u64,
        _reporter: &BlockingReporter,
    ) -> Result<PathBuf, JobError> {
        Err(JobError::failed(
            "export_point_cloud",
            "no reconstruction backend in this build",
        ))
    }

    fn render_trajectory(
        &self,
        _request: &RenderRequest,
        _reporter: &BlockingReporter,
    ) -> Result<RenderResult, JobError> {
        Err(JobError::failed(
            "render_trajectory",
            "no reconstruction backend in this build",
        ))
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(run(cli));
    // A viewer stopped through the store leaves a stdin read pending on the
    // blocking pool; waiting for it would keep the process alive.
    runtime.shutdown_background();
    result
}

async fn run(cli: Cli) -> anyhow::Result<()> {

    let mut config = nerfhub_core::config::load_config(cli.project_dir.as_deref())?;
    if let Some(path) = cli.db_path {
        config.coordination.database_path = Some(path);
    }
    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.daemon.log_level.clone());
    nerfhub_core::tracing_init::init_tracing(
        &format!("nerfhub_daemon={level},nerfhub={level}"),
        cli.log_json || config.daemon.log_json,
    );

    let db_path = config
        .coordination
        .database_path
        .clone()
        .or_else(nerfhub_core::config::database_path)
        .ok_or_else(|| anyhow::anyhow!("Cannot determine coordination database path"))?;
    config.coordination.database_path = Some(db_path.clone());
    let coordinator = open_coordinator(&db_path, &config).await?;

    match cli.command {
        Command::Viewer(args) => serve_viewer(args, &config, coordinator).await,
        Command::RunViewer {
            load_config,
            port,
            jpeg_quality,
            progress_key,
        } => {
            let request = StartViewerRequest {
                load_config,
                websocket_port: port,
                jpeg_quality,
                progress_key,
            };
            run_viewer(request, &config, coordinator).await
        }
        Command::RequestStop { key } => {
            coordinator.request_stop(&key).await?;
            info!(%key, "Stop requested");
            Ok(())
        }
        Command::Progress { key } => {
            let progress = coordinator.progress(&key).await?;
            let mut out = std::io::stdout().lock();
            match progress {
                Some(progress) => writeln!(out, "{}", serde_json::to_string(&progress)?)?,
                None => anyhow::bail!("No progress recorded under {key}"),
            }
            Ok(())
        }
    }
}

async fn open_coordinator(path: &Path, config: &Config) -> anyhow::Result<Coordinator> {
    info!(path = %path.display(), "Opening coordination store");
    let db = Database::open(path).await?;
    Ok(Coordinator::new(db).with_poll_interval(config.coordination.poll_interval()))
}

async fn serve_viewer(
    args: ViewerArgs,
    config: &Config,
    coordinator: Coordinator,
) -> anyhow::Result<()> {
    let progress_key = args
        .progress_key
        .unwrap_or_else(|| config.viewer.progress_key.clone());
    let options = WorkerOptions {
        load_config: args.load_config,
        host: args.host.unwrap_or_else(|| config.viewer.host.clone()),
        port: args.port.unwrap_or(config.viewer.default_port),
        jpeg_quality: args.jpeg_quality.unwrap_or(config.viewer.jpeg_quality),
        stop_key: args.stop_key.unwrap_or_else(|| progress_key.clone()),
        progress_key,
        session_key: args.session_key,
        heartbeat: config.viewer.heartbeat(),
    };
    let server = SessionServer::new(ServerConfig::from_config(config));

    let reason = run_worker(
        options,
        coordinator,
        server,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
        shutdown_signal(),
    )
    .await?;
    info!(%reason, "Viewer worker exiting");
    Ok(())
}

async fn run_viewer(
    request: StartViewerRequest,
    config: &Config,
    coordinator: Coordinator,
) -> anyhow::Result<()> {
    let plane = ControlPlane::new(
        coordinator,
        Arc::new(NoBackend),
        ControlSettings::from_config(config),
    );

    let started = plane.start_viewer(request).await;
    writeln!(std::io::stdout().lock(), "{}", serde_json::to_string(&started)?)?;
    let Some(viewer) = started.data else {
        anyhow::bail!("Viewer did not start: {}", started.message);
    };

    shutdown_signal().await;
    let stopped = plane.stop_viewer(&viewer.session_key).await;
    writeln!(std::io::stdout().lock(), "{}", serde_json::to_string(&stopped)?)?;
    Ok(())
}

/// Resolve on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C shutdown signal"),
        () = sigterm => info!("Received SIGTERM shutdown signal"),
    }
}
