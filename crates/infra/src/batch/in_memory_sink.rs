use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::debug;

use courier_core::BufferedRecord;

use super::artifact::LoadArtifact;
use super::sink::{AnalyticsSink, JobId, JobState, JobStatus, SinkError};

#[derive(Debug)]
enum Fate {
    Load,
    Fail(String),
    Hang,
}

#[derive(Debug)]
struct Job {
    rows: Vec<BufferedRecord>,
    fate: Fate,
    committed: bool,
}

#[derive(Debug, Default)]
struct State {
    next_job: u64,
    jobs: HashMap<JobId, Job>,
    loaded: Vec<BufferedRecord>,
    submitted: Vec<PathBuf>,
    failing_submits: u32,
    failing_jobs: u32,
    hanging_jobs: u32,
}

/// In-memory analytics sink.
///
/// Reads each artifact at submission and commits its rows when the job is
/// first seen done. Failures can be scripted for the next N submissions.
#[derive(Debug, Default)]
pub struct InMemorySink {
    state: Mutex<State>,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reject the next `n` submissions outright.
    pub fn fail_next_submits(&self, n: u32) {
        self.state().failing_submits = n;
    }

    /// Accept the next `n` jobs but finish them with errors.
    pub fn fail_next_jobs(&self, n: u32) {
        self.state().failing_jobs = n;
    }

    /// Accept the next `n` jobs and never finish them.
    pub fn hang_next_jobs(&self, n: u32) {
        self.state().hanging_jobs = n;
    }

    /// Rows committed so far, in load order.
    pub fn loaded(&self) -> Vec<BufferedRecord> {
        self.state().loaded.clone()
    }

    pub fn loaded_len(&self) -> usize {
        self.state().loaded.len()
    }

    /// Artifact paths seen by accepted or rejected submissions.
    pub fn submitted_artifacts(&self) -> Vec<PathBuf> {
        self.state().submitted.clone()
    }
}

#[async_trait]
impl AnalyticsSink for InMemorySink {
    async fn submit_load_job(&self, artifact: &LoadArtifact) -> Result<JobId, SinkError> {
        let rows = artifact.read_records()?;
        let mut state = self.state();
        state.submitted.push(artifact.path().to_path_buf());

        if state.failing_submits > 0 {
            state.failing_submits -= 1;
            return Err(SinkError::Submit("sink unavailable".to_string()));
        }

        let fate = if state.failing_jobs > 0 {
            state.failing_jobs -= 1;
            Fate::Fail("schema mismatch".to_string())
        } else if state.hanging_jobs > 0 {
            state.hanging_jobs -= 1;
            Fate::Hang
        } else {
            Fate::Load
        };

        state.next_job += 1;
        let job_id = JobId::new(format!("job-{}", state.next_job));
        debug!(job_id = %job_id, rows = rows.len(), ?fate, "load job accepted");
        state.jobs.insert(
            job_id.clone(),
            Job {
                rows,
                fate,
                committed: false,
            },
        );
        Ok(job_id)
    }

    async fn job_status(&self, job_id: &JobId) -> Result<JobStatus, SinkError> {
        let mut state = self.state();
        let State { jobs, loaded, .. } = &mut *state;

        let job = jobs.get_mut(job_id).ok_or_else(|| SinkError::Status {
            job_id: job_id.clone(),
            message: "unknown job".to_string(),
        })?;

        match &job.fate {
            Fate::Load => {
                if !job.committed {
                    loaded.extend(job.rows.iter().cloned());
                    job.committed = true;
                }
                Ok(JobStatus::done())
            }
            Fate::Fail(reason) => Ok(JobStatus {
                state: JobState::Done,
                errors: vec![reason.clone()],
            }),
            Fate::Hang => Ok(JobStatus {
                state: JobState::Running,
                errors: Vec::new(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::{Event, NewEvent};
    use serde_json::json;

    fn artifact(n: usize) -> LoadArtifact {
        let records: Vec<_> = (0..n)
            .map(|i| {
                let event = Event::create(NewEvent {
                    event_type: "cart.updated".to_string(),
                    payload: json!({"line": i}),
                    metadata: None,
                })
                .unwrap();
                BufferedRecord::snapshot(&event)
            })
            .collect();
        LoadArtifact::write(&records).unwrap()
    }

    #[tokio::test]
    async fn rows_commit_once_when_job_completes() {
        let sink = InMemorySink::new();
        let job = sink.submit_load_job(&artifact(3)).await.unwrap();
        assert_eq!(sink.loaded_len(), 0);

        assert!(sink.job_status(&job).await.unwrap().is_done());
        assert!(sink.job_status(&job).await.unwrap().is_done());
        assert_eq!(sink.loaded_len(), 3);
    }

    #[tokio::test]
    async fn scripted_failures_apply_in_order() {
        let sink = InMemorySink::new();
        sink.fail_next_submits(1);
        sink.fail_next_jobs(1);

        assert!(matches!(
            sink.submit_load_job(&artifact(1)).await,
            Err(SinkError::Submit(_))
        ));

        let failed = sink.submit_load_job(&artifact(1)).await.unwrap();
        let status = sink.job_status(&failed).await.unwrap();
        assert!(status.is_done());
        assert_eq!(status.errors.len(), 1);

        let ok = sink.submit_load_job(&artifact(2)).await.unwrap();
        assert!(sink.job_status(&ok).await.unwrap().errors.is_empty());
        assert_eq!(sink.loaded_len(), 2);
    }

    #[tokio::test]
    async fn unknown_job_is_a_status_error() {
        let sink = InMemorySink::new();
        assert!(matches!(
            sink.job_status(&JobId::new("nope")).await,
            Err(SinkError::Status { .. })
        ));
    }
}
