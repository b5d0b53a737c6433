use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::artifact::{ArtifactError, LoadArtifact};

/// Identifier the sink assigns to a submitted load job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    Running,
    Done,
}

/// Status of a load job. A `Done` job with errors loaded nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    pub state: JobState,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl JobStatus {
    pub fn done() -> Self {
        Self {
            state: JobState::Done,
            errors: Vec::new(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == JobState::Done
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("load job submission failed: {0}")]
    Submit(String),

    #[error("load job {job_id} status check failed: {message}")]
    Status { job_id: JobId, message: String },

    #[error(transparent)]
    Artifact(#[from] ArtifactError),
}

/// Append-only analytics warehouse accepting bulk load jobs.
///
/// Rows land in a flattened table partitioned on `created_at`.
#[async_trait]
pub trait AnalyticsSink: Send + Sync {
    async fn submit_load_job(&self, artifact: &LoadArtifact) -> Result<JobId, SinkError>;

    async fn job_status(&self, job_id: &JobId) -> Result<JobStatus, SinkError>;
}

#[async_trait]
impl<K> AnalyticsSink for Arc<K>
where
    K: AnalyticsSink + ?Sized,
{
    async fn submit_load_job(&self, artifact: &LoadArtifact) -> Result<JobId, SinkError> {
        (**self).submit_load_job(artifact).await
    }

    async fn job_status(&self, job_id: &JobId) -> Result<JobStatus, SinkError> {
        (**self).job_status(job_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_without_errors_field_parses() {
        let status: JobStatus = serde_json::from_value(json!({"state": "RUNNING"})).unwrap();
        assert_eq!(status.state, JobState::Running);
        assert!(status.errors.is_empty());
        assert!(!status.is_done());
    }

    #[test]
    fn done_with_errors_is_still_done() {
        let status: JobStatus =
            serde_json::from_value(json!({"state": "DONE", "errors": ["bad row 3"]})).unwrap();
        assert!(status.is_done());
        assert_eq!(status.errors, vec!["bad row 3".to_string()]);
    }
}
