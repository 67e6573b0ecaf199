//! Worker Launcher - runs one generation task to completion and reports back.
//!
//! Two interchangeable backends implement [`Launcher`]:
//! - [`InProcessLauncher`]: calls the generator on a tokio task in this process
//! - [`ProcessLauncher`]: spawns an isolated worker process per task
//!
//! Whatever the backend does, every launched task produces exactly one
//! [`Settlement`] so the pool's pending count stays accurate.

pub mod in_process;
pub mod process;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::bridge::protocol::JobId;
use crate::generator::GenerateError;

pub use in_process::InProcessLauncher;
pub use process::{CommandSpawner, CurrentExeSpawner, ProcessLauncher, SpawnError, WorkerSpawner};

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error(transparent)]
    Generator(#[from] GenerateError),
    #[error("worker reported failure: {0}")]
    Worker(String),
    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] SpawnError),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("worker exited without a response ({status})")]
    WorkerCrashed { status: String },
    #[error("worker timed out after {0:?}")]
    Timeout(Duration),
    #[error("generation task panicked: {0}")]
    Panicked(String),
}

/// Backend that produces one artifact per launch.
#[async_trait::async_trait]
pub trait Launcher<A>: Send + Sync + 'static {
    async fn launch(&self, job: JobId) -> Result<A, LaunchError>;
}

/// Outcome of one generation task, delivered to the pool controller.
#[derive(Debug)]
pub(crate) struct Settlement<A> {
    pub job: JobId,
    pub result: Result<A, LaunchError>,
}

/// Run one launch on its own task and report its settlement.
///
/// The launch itself runs on a nested task so a panicking backend still
/// settles (as [`LaunchError::Panicked`]).
pub(crate) fn spawn_task<A: Send + 'static>(
    launcher: Arc<dyn Launcher<A>>,
    job: JobId,
    done_tx: mpsc::UnboundedSender<Settlement<A>>,
) {
    tokio::spawn(async move {
        let run = tokio::spawn(async move { launcher.launch(job).await });
        let result = match run.await {
            Ok(result) => result,
            Err(e) => Err(LaunchError::Panicked(e.to_string())),
        };
        if done_tx.send(Settlement { job, result }).is_err() {
            tracing::debug!(%job, "Pool controller gone, dropping settlement");
        }
    });
}
