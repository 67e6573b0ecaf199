//! Worker subprocess - the child side of the isolated launcher.
//!
//! The parent side (spawning, reading the answer) is in `launcher::process`.
//! A worker serves exactly one request: it reads a Generate frame from stdin,
//! runs the generator once, writes one response frame to stdout, and returns.
//! stdout carries protocol frames only, so worker logs go to stderr.
//!
//! Hosts wire it up at the top of `main`:
//!
//! ```ignore
//! if captcha_pool::worker::is_worker_process() {
//!     return captcha_pool::worker::run_worker(ShapeGenerator::default()).await;
//! }
//! ```

use anyhow::Context;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{WorkerRequest, WorkerResponse};
use crate::generator::Generator;

/// Set to `1` in the environment of every spawned worker.
pub const WORKER_ENV_VAR: &str = "CAPTCHA_POOL_WORKER";

pub fn is_worker_process() -> bool {
    is_worker_marker(std::env::var_os(WORKER_ENV_VAR).as_deref())
}

fn is_worker_marker(value: Option<&std::ffi::OsStr>) -> bool {
    value.is_some_and(|v| v == "1")
}

/// Serve one generation request on stdin/stdout.
pub async fn run_worker<G>(generator: G) -> anyhow::Result<()>
where
    G: Generator,
    G::Artifact: Serialize,
{
    crate::logging::init_tracing();
    serve_one(&generator, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Serve one generation request over any reader/writer pair.
pub async fn serve_one<G, R, W>(generator: &G, reader: R, writer: W) -> anyhow::Result<()>
where
    G: Generator,
    G::Artifact: Serialize,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut requests = FramedRead::new(reader, JsonCodec::<WorkerRequest>::new());
    let mut responses = FramedWrite::new(writer, JsonCodec::<WorkerResponse>::new());

    let job = match requests.next().await {
        Some(Ok(WorkerRequest::Generate { job })) => job,
        Some(Err(e)) => return Err(e).context("failed to read generate request"),
        None => anyhow::bail!("parent closed stdin before sending a generate request"),
    };

    tracing::debug!(%job, "Worker generating");

    let response = match generator.create().await {
        Ok(artifact) => match serde_json::to_value(&artifact) {
            Ok(artifact) => WorkerResponse::Done { job, artifact },
            Err(e) => WorkerResponse::Failed {
                job,
                error: format!("failed to serialize artifact: {}", e),
            },
        },
        Err(e) => {
            tracing::warn!(%job, error = %e, "Generator failed in worker");
            WorkerResponse::Failed {
                job,
                error: e.to_string(),
            }
        }
    };

    responses
        .send(response)
        .await
        .context("failed to send worker response")?;

    tracing::debug!(%job, "Worker done");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::JobId;
    use crate::generator::GenerateError;
    use crate::launcher::LaunchError;
    use crate::launcher::process::{decode_response, exchange};

    #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Challenge {
        answer: String,
        data: String,
    }

    struct Drawn;

    #[async_trait::async_trait]
    impl Generator for Drawn {
        type Artifact = Challenge;

        async fn create(&self) -> Result<Challenge, GenerateError> {
            Ok(Challenge {
                answer: "qz".to_string(),
                data: "data:image/png;base64,AAAA".to_string(),
            })
        }
    }

    struct Broken;

    #[async_trait::async_trait]
    impl Generator for Broken {
        type Artifact = Challenge;

        async fn create(&self) -> Result<Challenge, GenerateError> {
            Err(GenerateError::new("shape table empty"))
        }
    }

    async fn run_exchange<G>(generator: G) -> (Result<Challenge, LaunchError>, anyhow::Result<()>)
    where
        G: Generator,
        G::Artifact: Serialize,
    {
        let job = JobId::new();
        let (parent, worker) = tokio::io::duplex(4096);
        let (parent_read, parent_write) = tokio::io::split(parent);
        let (worker_read, worker_write) = tokio::io::split(worker);

        let worker_task =
            tokio::spawn(async move { serve_one(&generator, worker_read, worker_write).await });

        let response = exchange(job, parent_write, parent_read)
            .await
            .unwrap()
            .expect("worker sent no response");
        let served = worker_task.await.unwrap();
        (decode_response(job, response), served)
    }

    #[tokio::test]
    async fn worker_answers_with_artifact() {
        let (result, served) = run_exchange(Drawn).await;
        served.unwrap();
        assert_eq!(result.unwrap().answer, "qz");
    }

    #[tokio::test]
    async fn worker_reports_generator_failure() {
        let (result, served) = run_exchange(Broken).await;
        served.unwrap();
        match result {
            Err(LaunchError::Worker(error)) => {
                assert_eq!(error, "generation failed: shape table empty")
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn worker_errors_when_parent_sends_nothing() {
        let (parent, worker) = tokio::io::duplex(64);
        drop(parent);
        let (worker_read, worker_write) = tokio::io::split(worker);

        let err = serve_one(&Drawn, worker_read, worker_write)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("before sending a generate request"));
    }

    #[test]
    fn worker_marker_requires_exact_value() {
        use std::ffi::OsStr;

        assert!(is_worker_marker(Some(OsStr::new("1"))));
        assert!(!is_worker_marker(None));
        assert!(!is_worker_marker(Some(OsStr::new("0"))));
        assert!(!is_worker_marker(Some(OsStr::new("true"))));
        assert!(!is_worker_marker(Some(OsStr::new(""))));
    }

    #[test]
    fn test_process_is_not_a_worker() {
        assert!(!is_worker_process());
    }
}
