//! Generator capability - the external algorithm that draws a challenge.

/// Failure reported by a [`Generator`].
///
/// The pool only logs these; they never reach a consumer.
#[derive(Debug, Clone, thiserror::Error)]
#[error("generation failed: {message}")]
pub struct GenerateError {
    message: String,
}

impl GenerateError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Produces one challenge artifact per call.
///
/// Implementations may be slow (image composition) and may fail. The pool runs
/// each call on its own task, either in this process or inside an isolated
/// worker process (see [`crate::worker::run_worker`]).
#[async_trait::async_trait]
pub trait Generator: Send + Sync + 'static {
    type Artifact: Send + 'static;

    async fn create(&self) -> Result<Self::Artifact, GenerateError>;
}
