//! Load-job sink speaking a small HTTP protocol:
//!
//! - `POST {base}/load-jobs?table=..&partition_field=created_at` with an NDJSON
//!   body, answered by `{"job_id": ".."}`
//! - `GET {base}/load-jobs/{job_id}`, answered by `{"state": "..", "errors": [..]}`

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use tracing::{debug, instrument};

use super::artifact::LoadArtifact;
use super::sink::{AnalyticsSink, JobId, JobStatus, SinkError};

const PARTITION_FIELD: &str = "created_at";
const NDJSON: &str = "application/x-ndjson";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    job_id: JobId,
}

#[derive(Debug, Clone)]
pub struct HttpLoadJobSink {
    client: reqwest::Client,
    base_url: String,
    table: String,
}

impl HttpLoadJobSink {
    pub fn new(base_url: impl Into<String>, table: impl Into<String>) -> Result<Self, SinkError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| SinkError::Submit(format!("http client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            table: table.into(),
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn jobs_url(&self) -> String {
        format!("{}/load-jobs", self.base_url)
    }

    fn job_url(&self, job_id: &JobId) -> String {
        format!("{}/load-jobs/{}", self.base_url, job_id)
    }
}

#[async_trait]
impl AnalyticsSink for HttpLoadJobSink {
    #[instrument(skip(self, artifact), fields(table = %self.table, rows = artifact.rows()), err)]
    async fn submit_load_job(&self, artifact: &LoadArtifact) -> Result<JobId, SinkError> {
        let body = tokio::fs::read(artifact.path())
            .await
            .map_err(|e| SinkError::Artifact(e.into()))?;

        let resp = self
            .client
            .post(self.jobs_url())
            .query(&[("table", self.table.as_str()), ("partition_field", PARTITION_FIELD)])
            .header(CONTENT_TYPE, NDJSON)
            .body(body)
            .send()
            .await
            .map_err(|e| SinkError::Submit(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(SinkError::Submit(format!("{status}: {text}")));
        }

        let submitted: SubmitResponse = resp
            .json()
            .await
            .map_err(|e| SinkError::Submit(format!("invalid response: {e}")))?;
        debug!(job_id = %submitted.job_id, "load job submitted");
        Ok(submitted.job_id)
    }

    async fn job_status(&self, job_id: &JobId) -> Result<JobStatus, SinkError> {
        let status_error = |message: String| SinkError::Status {
            job_id: job_id.clone(),
            message,
        };

        let resp = self
            .client
            .get(self.job_url(job_id))
            .send()
            .await
            .map_err(|e| status_error(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(status_error(format!("{status}: {text}")));
        }

        resp.json()
            .await
            .map_err(|e| status_error(format!("invalid response: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_ignore_trailing_slash() {
        let sink = HttpLoadJobSink::new("http://warehouse.local/", "events").unwrap();
        assert_eq!(sink.jobs_url(), "http://warehouse.local/load-jobs");
        assert_eq!(
            sink.job_url(&JobId::new("j-42")),
            "http://warehouse.local/load-jobs/j-42"
        );
        assert_eq!(sink.table(), "events");
    }

    #[test]
    fn submit_response_carries_job_id() {
        let resp: SubmitResponse = serde_json::from_str(r#"{"job_id":"j-7"}"#).unwrap();
        assert_eq!(resp.job_id, JobId::new("j-7"));
    }
}
