//! In-process launcher: no isolation, lowest overhead.

use std::sync::Arc;

use crate::bridge::protocol::JobId;
use crate::generator::Generator;

use super::{LaunchError, Launcher};

pub struct InProcessLauncher<G> {
    generator: Arc<G>,
}

impl<G: Generator> InProcessLauncher<G> {
    pub fn new(generator: G) -> Self {
        Self::from_arc(Arc::new(generator))
    }

    pub fn from_arc(generator: Arc<G>) -> Self {
        Self { generator }
    }
}

#[async_trait::async_trait]
impl<G: Generator> Launcher<G::Artifact> for InProcessLauncher<G> {
    async fn launch(&self, job: JobId) -> Result<G::Artifact, LaunchError> {
        tracing::trace!(%job, "Generating in process");
        Ok(self.generator.create().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::GenerateError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Numbered {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Generator for Numbered {
        type Artifact = usize;

        async fn create(&self) -> Result<usize, GenerateError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n == 1 {
                return Err(GenerateError::new("second draw failed"));
            }
            Ok(n)
        }
    }

    #[tokio::test]
    async fn launches_share_one_generator() {
        let generator = Arc::new(Numbered {
            calls: AtomicUsize::new(0),
        });
        let launcher = InProcessLauncher::from_arc(Arc::clone(&generator));

        assert_eq!(launcher.launch(JobId::new()).await.unwrap(), 0);
        assert!(matches!(
            launcher.launch(JobId::new()).await,
            Err(LaunchError::Generator(_))
        ));
        assert_eq!(launcher.launch(JobId::new()).await.unwrap(), 2);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 3);
    }
}
