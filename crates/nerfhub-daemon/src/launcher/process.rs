//! Child-process viewer workers.
//!
//! The first stdout line of a worker is its startup result: an endpoint,
//! or [`ERROR_SENTINEL`] followed by a reason. Every later stdout line is
//! the answer to one control request written on stdin. The two are kept
//! on separate channels so a control exchange can never be mistaken for
//! the startup line.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::LauncherError;

/// Prefix of a startup line that reports failure instead of an endpoint.
pub const ERROR_SENTINEL: &str = "error:";

/// Startup failure detail for a worker that found no free port.
pub const BIND_FAILED: &str = "bind_failed";

const STOP_REQUEST: &str = "stop";
const PING_REQUEST: &str = "ping";
const PING_ANSWER: &str = "pong";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Program and arguments for a worker.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn program(&self) -> &std::path::Path {
        &self.program
    }
}

/// A running worker process.
#[derive(Debug)]
pub struct WorkerProcess {
    id: String,
    endpoint: String,
    child: Child,
    stdin: ChildStdin,
    responses: mpsc::Receiver<String>,
    /// Requests that timed out; their answers are still ahead in `responses`.
    stale: usize,
    terminate_timeout: Duration,
}

impl WorkerProcess {
    /// Start `command` and wait up to `startup_timeout` for its endpoint.
    pub async fn spawn(
        command: WorkerCommand,
        startup_timeout: Duration,
        terminate_timeout: Duration,
    ) -> Result<Self, LauncherError> {
        let id = uuid::Uuid::new_v4().to_string();
        let program = command.program.display().to_string();

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .envs(command.envs.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!(worker_id = %id, %program, "Spawning worker");
        let mut child = cmd.spawn().map_err(|e| LauncherError::Spawn {
            program: program.clone(),
            reason: e.to_string(),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| LauncherError::Spawn {
            program: program.clone(),
            reason: "Failed to capture stdin".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| LauncherError::Spawn {
            program: program.clone(),
            reason: "Failed to capture stdout".to_string(),
        })?;

        let (startup_tx, startup_rx) = oneshot::channel();
        let (response_tx, responses) = mpsc::channel(16);
        let worker_id = id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut startup_tx = Some(startup_tx);
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(tx) = startup_tx.take() {
                    let _ = tx.send(line);
                    continue;
                }
                debug!(worker_id = %worker_id, response = %line, "Worker response");
                if response_tx.send(line).await.is_err() {
                    break;
                }
            }
            debug!(worker_id = %worker_id, "Worker stdout closed");
        });

        if let Some(stderr) = child.stderr.take() {
            let worker_id = id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(worker_id = %worker_id, "stderr: {}", line);
                }
            });
        }

        let first_line = match tokio::time::timeout(startup_timeout, startup_rx).await {
            Ok(Ok(line)) => line,
            Ok(Err(_)) => {
                let status = child.wait().await.ok();
                return Err(LauncherError::StartupFailed {
                    reason: format!("worker exited before reporting an endpoint ({status:?})"),
                });
            }
            Err(_) => {
                let _ = child.kill().await;
                return Err(LauncherError::StartupFailed {
                    reason: format!("no endpoint within {startup_timeout:?}"),
                });
            }
        };

        if let Some(detail) = first_line.strip_prefix(ERROR_SENTINEL) {
            let reason = detail.trim().to_string();
            warn!(worker_id = %id, %reason, "Worker reported a startup failure");
            if tokio::time::timeout(terminate_timeout, child.wait()).await.is_err() {
                let _ = child.kill().await;
            }
            return Err(LauncherError::StartupFailed { reason });
        }

        let endpoint = first_line.trim().to_string();
        info!(worker_id = %id, %endpoint, pid = ?child.id(), "Worker started");
        Ok(Self {
            id,
            endpoint,
            child,
            stdin,
            responses,
            stale: 0,
            terminate_timeout,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Exit status if the worker has already exited.
    pub fn try_status(&mut self) -> Result<Option<ExitStatus>, LauncherError> {
        Ok(self.child.try_wait()?)
    }

    /// Send one control line and wait for its one-line answer.
    pub async fn request(&mut self, request: &str) -> Result<String, LauncherError> {
        self.request_with_timeout(request, REQUEST_TIMEOUT).await
    }

    async fn request_with_timeout(
        &mut self,
        request: &str,
        timeout: Duration,
    ) -> Result<String, LauncherError> {
        let id = self.id.clone();
        let exited = || LauncherError::Exited { id: id.clone() };

        let mut line = request.to_string();
        line.push('\n');
        if self.stdin.write_all(line.as_bytes()).await.is_err() || self.stdin.flush().await.is_err() {
            return Err(exited());
        }

        let responses = &mut self.responses;
        let stale = &mut self.stale;
        let answer = tokio::time::timeout(timeout, async {
            while let Some(response) = responses.recv().await {
                if *stale == 0 {
                    return Some(response);
                }
                *stale -= 1;
                debug!(worker_id = %id, %response, "Discarding late answer");
            }
            None
        })
        .await;

        match answer {
            Ok(Some(response)) => Ok(response),
            Ok(None) => Err(exited()),
            Err(_) => {
                self.stale += 1;
                Err(LauncherError::RequestTimeout {
                    id,
                    request: request.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Whether the worker is running and answers `ping` within `timeout`.
    pub async fn is_responsive(&mut self, timeout: Duration) -> bool {
        if !matches!(self.try_status(), Ok(None)) {
            return false;
        }
        matches!(
            self.request_with_timeout(PING_REQUEST, timeout).await.as_deref(),
            Ok(PING_ANSWER)
        )
    }

    /// Stop the worker: a `stop` request, then SIGINT, then kill.
    pub async fn shutdown(mut self) -> Result<ExitStatus, LauncherError> {
        let grace = self.terminate_timeout;
        match self.request_with_timeout(STOP_REQUEST, grace).await {
            Ok(answer) => debug!(worker_id = %self.id, %answer, "Worker acknowledged stop"),
            Err(e) => debug!(worker_id = %self.id, error = %e, "Stop request not acknowledged"),
        }
        if let Ok(status) = tokio::time::timeout(grace, self.child.wait()).await {
            info!(worker_id = %self.id, ?status, "Worker exited");
            return Ok(status?);
        }

        #[cfg(unix)]
        {
            if let Some(pid) = self.child.id() {
                // SAFETY: pid comes from our own Child handle, which has not been reaped.
                #[allow(unsafe_code)]
                #[allow(clippy::cast_possible_wrap)]
                let ret = unsafe { libc::kill(pid as i32, libc::SIGINT) };
                if ret != 0 {
                    let err = std::io::Error::last_os_error();
                    warn!(worker_id = %self.id, pid, error = %err, "Failed to send SIGINT");
                }
            }
        }
        if let Ok(status) = tokio::time::timeout(grace, self.child.wait()).await {
            info!(worker_id = %self.id, ?status, "Worker exited after SIGINT");
            return Ok(status?);
        }

        warn!(worker_id = %self.id, "Worker ignored SIGINT, killing");
        self.child.kill().await?;
        Ok(self.child.wait().await?)
    }
}

#[cfg(all(test, unix))]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const SECOND: Duration = Duration::from_secs(1);

    fn sh(script: &str) -> WorkerCommand {
        WorkerCommand::new("sh").arg("-c").arg(script)
    }

    #[tokio::test]
    async fn endpoint_line_then_control_exchange() {
        let script = r#"echo ws://127.0.0.1:7007/ws
while read line; do
  if [ "$line" = stop ]; then echo ok; exit 0; fi
  echo "echo $line"
done"#;
        let mut worker = WorkerProcess::spawn(sh(script), 5 * SECOND, SECOND)
            .await
            .unwrap();
        assert_eq!(worker.endpoint(), "ws://127.0.0.1:7007/ws");
        assert_eq!(worker.request("stats").await.unwrap(), "echo stats");

        let status = worker.shutdown().await.unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn late_answer_is_not_taken_for_the_next_reply() {
        let script = r#"echo ws://127.0.0.1:7007/ws
while read line; do
  case $line in
    slow) sleep 0.5; echo slow-answer ;;
    ping) echo pong ;;
    stop) echo ok; exit 0 ;;
    *) echo "answer-$line" ;;
  esac
done"#;
        let mut worker = WorkerProcess::spawn(sh(script), 5 * SECOND, SECOND)
            .await
            .unwrap();

        let err = worker
            .request_with_timeout("slow", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, LauncherError::RequestTimeout { .. }));
        assert_eq!(worker.request("stats").await.unwrap(), "answer-stats");
        assert!(worker.is_responsive(SECOND).await);

        let status = worker.shutdown().await.unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn exited_worker_is_not_responsive() {
        let mut worker = WorkerProcess::spawn(sh("echo ws://127.0.0.1:1/ws"), 5 * SECOND, SECOND)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!worker.is_responsive(SECOND).await);
    }

    #[tokio::test]
    async fn error_sentinel_is_a_startup_failure() {
        let err = WorkerProcess::spawn(sh("echo 'error: port 7007 unavailable'"), 5 * SECOND, SECOND)
            .await
            .unwrap_err();
        match err {
            LauncherError::StartupFailed { reason } => assert_eq!(reason, "port 7007 unavailable"),
            other => unreachable!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn silent_exit_is_a_startup_failure() {
        let err = WorkerProcess::spawn(sh("exit 3"), 5 * SECOND, SECOND)
            .await
            .unwrap_err();
        assert!(matches!(err, LauncherError::StartupFailed { .. }));
    }

    #[tokio::test]
    async fn worker_ignoring_stop_is_interrupted() {
        let script = "echo ws://127.0.0.1:1/ws; trap 'exit 0' INT; while true; do sleep 0.05; done";
        let worker = WorkerProcess::spawn(sh(script), 5 * SECOND, Duration::from_millis(300))
            .await
            .unwrap();
        let status = worker.shutdown().await.unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let err = WorkerProcess::spawn(
            WorkerCommand::new("/nonexistent/nerfhub-worker"),
            SECOND,
            SECOND,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, LauncherError::Spawn { .. }));
    }
}
