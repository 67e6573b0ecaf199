//! Wire protocol types for parent-worker communication.
//!
//! One exchange per worker process, over the worker's stdin/stdout:
//! - parent sends a single [`WorkerRequest::Generate`]
//! - worker answers with a single [`WorkerResponse`] and exits

use serde::{Deserialize, Serialize};

/// Unique identifier for one generation task.
///
/// UUID v4 so a stray frame from another worker can never be mistaken for ours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(uuid::Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        let uuid = uuid::Uuid::parse_str(s)?;
        Ok(Self(uuid))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Messages from parent to worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerRequest {
    Generate { job: JobId },
}

impl WorkerRequest {
    pub fn job(&self) -> JobId {
        match self {
            Self::Generate { job } => *job,
        }
    }
}

/// Messages from worker to parent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerResponse {
    /// Generation succeeded. The artifact is opaque JSON to the parent until
    /// the launcher decodes it into the pool's artifact type.
    Done {
        job: JobId,
        artifact: serde_json::Value,
    },

    Failed { job: JobId, error: String },
}

impl WorkerResponse {
    pub fn job(&self) -> JobId {
        match self {
            Self::Done { job, .. } => *job,
            Self::Failed { job, .. } => *job,
        }
    }
}
