//! Isolated launcher: one worker process per generation task.
//!
//! Flow:
//! 1. Spawn worker subprocess (stdin/stdout piped, stderr inherited)
//! 2. Send one Generate frame, close stdin
//! 3. Read exactly one response frame from stdout
//! 4. Reap the child
//!
//! A worker that crashes, hangs, or answers with garbage settles as a
//! [`LaunchError`]; nothing it does can reach the pool controller directly.

use std::ffi::OsString;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{JobId, WorkerRequest, WorkerResponse};
use crate::worker::{WORKER_ENV_VAR, is_worker_process};

use super::{LaunchError, Launcher};

/// How long a worker may linger after answering before it is killed.
const REAP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Extension point for different worker spawn strategies.
///
/// The returned child must have piped stdin and stdout.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, job: JobId) -> Result<Child, SpawnError>;
}

fn worker_command(program: impl AsRef<std::ffi::OsStr>) -> Command {
    let mut command = Command::new(program);
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .env(WORKER_ENV_VAR, "1")
        .kill_on_drop(true);
    command
}

/// Re-executes the running binary as a worker.
///
/// The host's `main` must check [`crate::worker::is_worker_process`] first
/// thing and hand over to [`crate::worker::run_worker`]. A worker never
/// spawns workers of its own, so a host that skips the check fails its
/// launches instead of re-executing itself without end.
pub struct CurrentExeSpawner;

impl WorkerSpawner for CurrentExeSpawner {
    fn spawn(&self, _job: JobId) -> Result<Child, SpawnError> {
        spawn_current_exe(is_worker_process())
    }
}

fn spawn_current_exe(in_worker: bool) -> Result<Child, SpawnError> {
    if in_worker {
        return Err(SpawnError::Other(
            "already running as a worker; check is_worker_process() before building a pool"
                .to_string(),
        ));
    }
    let exe = std::env::current_exe()?;
    Ok(worker_command(exe).spawn()?)
}

/// Runs an arbitrary program as the worker.
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    program: OsString,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
}

impl CommandSpawner {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

impl WorkerSpawner for CommandSpawner {
    fn spawn(&self, _job: JobId) -> Result<Child, SpawnError> {
        let child = worker_command(&self.program)
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .spawn()?;
        Ok(child)
    }
}

pub struct ProcessLauncher {
    spawner: Arc<dyn WorkerSpawner>,
    timeout: Option<Duration>,
}

impl ProcessLauncher {
    pub fn new(spawner: Arc<dyn WorkerSpawner>) -> Self {
        Self {
            spawner,
            timeout: None,
        }
    }

    pub fn current_exe() -> Self {
        Self::new(Arc::new(CurrentExeSpawner))
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait::async_trait]
impl<A> Launcher<A> for ProcessLauncher
where
    A: DeserializeOwned + Send + 'static,
{
    async fn launch(&self, job: JobId) -> Result<A, LaunchError> {
        let mut child = self.spawner.spawn(job)?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SpawnError::Other("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SpawnError::Other("stdout not captured".to_string()))?;

        tracing::debug!(%job, pid = ?child.id(), "Spawned generator worker");

        let exchanged = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, exchange(job, stdin, stdout)).await {
                Ok(exchanged) => exchanged,
                Err(_) => {
                    tracing::warn!(%job, ?limit, "Generator worker timed out, killing");
                    if let Err(e) = child.kill().await {
                        tracing::warn!(%job, error = %e, "Failed to kill timed out worker");
                    }
                    return Err(LaunchError::Timeout(limit));
                }
            },
            None => exchange(job, stdin, stdout).await,
        };

        let status = reap(job, &mut child).await;

        let Some(response) = exchanged? else {
            return Err(LaunchError::WorkerCrashed {
                status: describe_status(status),
            });
        };

        if let Some(status) = status
            && !status.success()
        {
            tracing::debug!(%job, %status, "Worker exited unsuccessfully after responding");
        }

        decode_response(job, response)
    }
}

/// One request/response exchange with a worker.
///
/// Returns `Ok(None)` when the worker closed its stdout without answering.
pub(crate) async fn exchange<W, R>(
    job: JobId,
    writer: W,
    reader: R,
) -> Result<Option<WorkerResponse>, LaunchError>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    let mut writer = FramedWrite::new(writer, JsonCodec::<WorkerRequest>::new());
    if let Err(e) = writer.send(WorkerRequest::Generate { job }).await {
        // The response read below still decides the outcome.
        tracing::debug!(%job, error = %e, "Failed to send generate request");
    }
    drop(writer);

    let mut reader = FramedRead::new(reader, JsonCodec::<WorkerResponse>::new());
    match reader.next().await {
        Some(Ok(response)) => Ok(Some(response)),
        Some(Err(e)) => Err(LaunchError::Protocol(format!(
            "failed to read worker response: {}",
            e
        ))),
        None => Ok(None),
    }
}

pub(crate) fn decode_response<A: DeserializeOwned>(
    job: JobId,
    response: WorkerResponse,
) -> Result<A, LaunchError> {
    if response.job() != job {
        return Err(LaunchError::Protocol(format!(
            "response for job {} while waiting on {}",
            response.job(),
            job
        )));
    }

    match response {
        WorkerResponse::Done { artifact, .. } => serde_json::from_value(artifact).map_err(|e| {
            LaunchError::Protocol(format!("artifact does not match expected type: {}", e))
        }),
        WorkerResponse::Failed { error, .. } => Err(LaunchError::Worker(error)),
    }
}

async fn reap(job: JobId, child: &mut Child) -> Option<ExitStatus> {
    match tokio::time::timeout(REAP_GRACE, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        Ok(Err(e)) => {
            tracing::warn!(%job, error = %e, "Failed to wait for worker");
            None
        }
        Err(_) => {
            tracing::warn!(%job, "Worker still running after responding, killing");
            if let Err(e) = child.kill().await {
                tracing::warn!(%job, error = %e, "Failed to kill lingering worker");
            }
            None
        }
    }
}

fn describe_status(status: Option<ExitStatus>) -> String {
    match status {
        Some(status) => status.to_string(),
        None => "exit status unknown".to_string(),
    }
}
