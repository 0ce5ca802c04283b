//! Viewer worker.
//!
//! Runs a [`SessionServer`] for one checkpoint. The first line written to
//! `output` is the endpoint, or an error sentinel if the server could not
//! start. After that each line on `input` is a control request answered
//! with exactly one line: `stop` (`ok`, then exit), `stats` (server
//! statistics as JSON) and `ping` (`pong`). A heartbeat publishes progress
//! through the coordinator and ends the worker when a stop was requested.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use nerfhub_proto::{MessageKind, TrainingState, ViewerMessage};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::coordination::{CoordinationError, Coordinator};
use crate::launcher::{BIND_FAILED, ERROR_SENTINEL};
use crate::session::{ServerError, SessionServer};
use crate::storage::{JobProgress, JobStatus};

/// Viewer worker parameters.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub load_config: String,
    pub host: String,
    pub port: u16,
    pub jpeg_quality: u8,
    pub progress_key: String,
    /// Stop marker this worker watches; usually unique to it.
    pub stop_key: String,
    pub session_key: String,
    pub heartbeat: Duration,
}

/// Why the worker stopped serving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// `stop` arrived on the control channel.
    ControlRequest,
    /// A heartbeat found a pending stop request in the store.
    StopRequested,
    /// The control channel closed.
    ControllerGone,
    /// The process was interrupted.
    Interrupted,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ControlRequest => "control request",
            Self::StopRequested => "stop requested",
            Self::ControllerGone => "controller gone",
            Self::Interrupted => "interrupted",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ViewerError {
    #[error(transparent)]
    Server(#[from] ServerError),

    #[error(transparent)]
    Coordination(#[from] CoordinationError),

    #[error("Control channel error: {0}")]
    Io(#[from] std::io::Error),
}

fn serving() -> JobProgress {
    JobProgress::running("serving", 100, 100)
}

/// Serve until stopped. See the module docs for the line protocol.
pub async fn run_worker<R, W, S>(
    options: WorkerOptions,
    coordinator: Coordinator,
    server: SessionServer,
    input: R,
    mut output: W,
    interrupt: S,
) -> Result<StopReason, ViewerError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
    S: Future<Output = ()>,
{
    let addr = match server.start(&options.host, options.port).await {
        Ok(addr) => addr,
        Err(e) => {
            let detail = match &e {
                ServerError::Bind { .. } => format!("{BIND_FAILED}: {e}"),
                _ => e.to_string(),
            };
            write_line(&mut output, &format!("{ERROR_SENTINEL}{detail}")).await?;
            return Err(e.into());
        }
    };

    seed_scene(&server, &options);
    let endpoint = server
        .endpoint()
        .unwrap_or_else(|| format!("ws://{addr}/ws"));
    write_line(&mut output, &endpoint).await?;
    info!(
        session_key = %options.session_key,
        load_config = %options.load_config,
        %endpoint,
        "Viewer serving"
    );

    let reporter = coordinator
        .reporter(options.progress_key.clone())
        .with_stop_key(options.stop_key.clone());
    let mut heartbeat = tokio::time::interval(options.heartbeat.max(Duration::from_millis(10)));
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut lines = input.lines();
    tokio::pin!(interrupt);

    let outcome: Result<StopReason, ViewerError> = async {
        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else {
                        break Ok(StopReason::ControllerGone);
                    };
                    let request = line.trim();
                    if request.is_empty() {
                        continue;
                    }
                    debug!(request, "Control request");
                    if request == "stop" {
                        write_line(&mut output, "ok").await?;
                        break Ok(StopReason::ControlRequest);
                    }
                    write_line(&mut output, &answer(&server, request)).await?;
                }
                _ = heartbeat.tick() => {
                    match reporter.report(&serving()).await {
                        Ok(()) => {}
                        Err(CoordinationError::Aborted { .. }) => break Ok(StopReason::StopRequested),
                        Err(e) => return Err(e.into()),
                    }
                }
                () = &mut interrupt => break Ok(StopReason::Interrupted),
            }
        }
    }
    .await;

    server.shutdown();
    let status = match outcome {
        Ok(StopReason::StopRequested | StopReason::ControlRequest) => JobStatus::Cancelled,
        Ok(_) => JobStatus::Succeeded,
        Err(_) => JobStatus::Failed,
    };
    if let Err(e) = reporter.finish(serving().with_status(status)).await {
        warn!(error = %e, "Could not record final viewer status");
    }
    if let Ok(reason) = &outcome {
        info!(session_key = %options.session_key, %reason, "Viewer stopped");
    }
    outcome
}

fn answer(server: &SessionServer, request: &str) -> String {
    match request {
        "ping" => "pong".to_string(),
        "stats" => serde_json::to_string(&server.stats())
            .unwrap_or_else(|e| format!("{ERROR_SENTINEL}{e}")),
        other => format!("{ERROR_SENTINEL}unknown request {other:?}"),
    }
}

/// Initial persistent state every client receives on connect.
fn seed_scene(server: &SessionServer, options: &WorkerOptions) {
    server.broadcast_persistent(
        "scene",
        ViewerMessage::SceneUpdate {
            step: 0,
            camera_count: 0,
            scene_box: None,
        },
    );
    server.broadcast_persistent(
        "training_state",
        ViewerMessage::TrainingStateUpdate {
            state: TrainingState::Completed,
        },
    );
    server.broadcast_persistent(
        "status",
        ViewerMessage::StatusUpdate {
            eval_res: format!("jpeg quality {}", options.jpeg_quality),
            step: 0,
        },
    );
    server.register_handler(MessageKind::PositionUpdate, |session_id, message| {
        if let ViewerMessage::PositionUpdate { position, fov, .. } = message {
            debug!(%session_id, ?position, fov, "Camera moved");
        }
        Ok(())
    });
}

async fn write_line<W: AsyncWrite + Unpin>(output: &mut W, line: &str) -> std::io::Result<()> {
    output.write_all(line.as_bytes()).await?;
    output.write_all(b"\n").await?;
    output.flush().await
}
