//! Batch buffer engine: accumulates event snapshots and ships them to the
//! analytics sink as load jobs.
//!
//! The live sequence sits behind a short synchronous mutex; all flush I/O
//! happens outside it. A separate async lock keeps at most one flush in flight.
//! A failed batch goes back to the head of the live sequence, ahead of rows
//! appended meanwhile, and is retried on the next trigger.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use courier_core::BufferedRecord;

use super::artifact::{ArtifactError, LoadArtifact};
use super::poll::{PollError, RetryPolicy, poll_until};
use super::sink::{AnalyticsSink, JobId, SinkError};

/// Rows buffered before an append triggers a flush.
pub const DEFAULT_THRESHOLD: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct BufferConfig {
    pub threshold: usize,
    /// How load-job status is polled.
    pub poll: RetryPolicy,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            poll: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FlushError {
    #[error("failed to write load artifact: {0}")]
    Artifact(#[from] ArtifactError),

    #[error("failed to submit load job: {0}")]
    Submit(#[source] SinkError),

    #[error("failed to check load job {job_id}: {source}")]
    Status {
        job_id: JobId,
        #[source]
        source: SinkError,
    },

    #[error("load job {job_id} did not finish after {attempts} checks")]
    Timeout { job_id: JobId, attempts: u32 },

    #[error("load job {job_id} failed: {}", errors.join("; "))]
    JobFailed { job_id: JobId, errors: Vec<String> },
}

/// Result of a completed flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushReport {
    pub rows: usize,
    /// `None` when there was nothing to flush.
    pub job_id: Option<JobId>,
}

#[derive(Debug)]
pub enum AppendOutcome {
    /// Below threshold; nothing else happened.
    Buffered { buffered: usize },
    /// Threshold reached and a flush succeeded.
    Flushed(FlushReport),
    /// Threshold reached while another flush was in flight.
    FlushDeferred { buffered: usize },
    /// Threshold reached and the flush failed; rows stay buffered.
    FlushFailed { error: FlushError, buffered: usize },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BufferStats {
    pub buffered_rows: usize,
    pub flushes_ok: u64,
    pub flushes_failed: u64,
    pub rows_loaded: u64,
}

#[derive(Debug)]
pub struct BatchBuffer<K> {
    sink: K,
    config: BufferConfig,
    live: Mutex<VecDeque<BufferedRecord>>,
    flush_lock: tokio::sync::Mutex<()>,
    flushes_ok: AtomicU64,
    flushes_failed: AtomicU64,
    rows_loaded: AtomicU64,
}

impl<K: AnalyticsSink> BatchBuffer<K> {
    pub fn new(sink: K, config: BufferConfig) -> Self {
        Self {
            sink,
            config: BufferConfig {
                threshold: config.threshold.max(1),
                ..config
            },
            live: Mutex::new(VecDeque::new()),
            flush_lock: tokio::sync::Mutex::new(()),
            flushes_ok: AtomicU64::new(0),
            flushes_failed: AtomicU64::new(0),
            rows_loaded: AtomicU64::new(0),
        }
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    pub fn threshold(&self) -> usize {
        self.config.threshold
    }

    fn live(&self) -> MutexGuard<'_, VecDeque<BufferedRecord>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.live().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            buffered_rows: self.len(),
            flushes_ok: self.flushes_ok.load(Ordering::Relaxed),
            flushes_failed: self.flushes_failed.load(Ordering::Relaxed),
            rows_loaded: self.rows_loaded.load(Ordering::Relaxed),
        }
    }

    /// Add a record; flush inline once the threshold is reached.
    ///
    /// If a flush is already running the trigger is skipped and the rows are
    /// picked up by a later one.
    pub async fn append(&self, record: BufferedRecord) -> AppendOutcome {
        let buffered = {
            let mut live = self.live();
            live.push_back(record);
            live.len()
        };

        if buffered < self.config.threshold {
            return AppendOutcome::Buffered { buffered };
        }

        let Ok(_guard) = self.flush_lock.try_lock() else {
            debug!(buffered, "flush already in flight, deferring");
            return AppendOutcome::FlushDeferred { buffered };
        };

        match self.flush_locked().await {
            Ok(report) => AppendOutcome::Flushed(report),
            Err(error) => AppendOutcome::FlushFailed {
                error,
                buffered: self.len(),
            },
        }
    }

    /// Flush everything buffered regardless of threshold, waiting for any
    /// in-flight flush first.
    pub async fn flush(&self) -> Result<FlushReport, FlushError> {
        let _guard = self.flush_lock.lock().await;
        self.flush_locked().await
    }

    /// Caller must hold `flush_lock`.
    async fn flush_locked(&self) -> Result<FlushReport, FlushError> {
        let batch: Vec<BufferedRecord> = std::mem::take(&mut *self.live()).into();
        if batch.is_empty() {
            return Ok(FlushReport {
                rows: 0,
                job_id: None,
            });
        }

        let rows = batch.len();
        match self.load(&batch).await {
            Ok(job_id) => {
                self.flushes_ok.fetch_add(1, Ordering::Relaxed);
                self.rows_loaded.fetch_add(rows as u64, Ordering::Relaxed);
                info!(rows, job_id = %job_id, "batch loaded");
                Ok(FlushReport {
                    rows,
                    job_id: Some(job_id),
                })
            }
            Err(err) => {
                self.flushes_failed.fetch_add(1, Ordering::Relaxed);
                let mut live = self.live();
                for record in batch.into_iter().rev() {
                    live.push_front(record);
                }
                warn!(rows, buffered = live.len(), error = %err, "batch load failed, re-queued");
                Err(err)
            }
        }
    }

    /// Write the artifact, submit it and wait for the job. The artifact is
    /// removed when this returns.
    async fn load(&self, batch: &[BufferedRecord]) -> Result<JobId, FlushError> {
        let artifact = LoadArtifact::write(batch)?;
        let job_id = self
            .sink
            .submit_load_job(&artifact)
            .await
            .map_err(FlushError::Submit)?;
        debug!(job_id = %job_id, rows = artifact.rows(), "load job submitted");

        let sink = &self.sink;
        let job = &job_id;
        let status = poll_until(&self.config.poll, move |_| async move {
            let status = sink.job_status(job).await?;
            Ok::<_, SinkError>(status.is_done().then_some(status))
        })
        .await
        .map_err(|err| match err {
            PollError::Timeout { attempts } => FlushError::Timeout {
                job_id: job_id.clone(),
                attempts,
            },
            PollError::Check(source) => FlushError::Status {
                job_id: job_id.clone(),
                source,
            },
        })?;

        if !status.errors.is_empty() {
            return Err(FlushError::JobFailed {
                job_id,
                errors: status.errors,
            });
        }
        Ok(job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use courier_core::{Event, NewEvent};
    use serde_json::json;

    use crate::batch::InMemorySink;

    fn record(n: usize) -> BufferedRecord {
        let event = Event::create(NewEvent {
            event_type: "order.placed".to_string(),
            payload: json!({"n": n}),
            metadata: None,
        })
        .unwrap();
        BufferedRecord::snapshot(&event)
    }

    fn buffer(threshold: usize) -> BatchBuffer<Arc<InMemorySink>> {
        BatchBuffer::new(
            Arc::new(InMemorySink::new()),
            BufferConfig {
                threshold,
                poll: RetryPolicy::fixed(3, Duration::from_millis(1)),
            },
        )
    }

    #[tokio::test]
    async fn reaching_threshold_flushes_everything() {
        let buffer = buffer(10);

        for n in 0..9 {
            assert!(matches!(
                buffer.append(record(n)).await,
                AppendOutcome::Buffered { .. }
            ));
        }
        match buffer.append(record(9)).await {
            AppendOutcome::Flushed(report) => assert_eq!(report.rows, 10),
            other => panic!("expected a flush, got {other:?}"),
        }

        assert!(buffer.is_empty());
        assert_eq!(buffer.sink().loaded_len(), 10);
        let stats = buffer.stats();
        assert_eq!(stats.flushes_ok, 1);
        assert_eq!(stats.rows_loaded, 10);
    }

    #[tokio::test]
    async fn flush_attempts_track_appends() {
        let buffer = buffer(10);
        for n in 0..25 {
            buffer.append(record(n)).await;
        }

        let stats = buffer.stats();
        assert_eq!(stats.flushes_ok + stats.flushes_failed, 2);
        assert_eq!(stats.buffered_rows, 5);
        assert_eq!(buffer.sink().loaded_len(), 20);
    }

    #[tokio::test]
    async fn failed_flush_keeps_every_row() {
        let buffer = buffer(100);
        for n in 0..12 {
            buffer.append(record(n)).await;
        }

        buffer.sink().fail_next_submits(1);
        assert!(matches!(buffer.flush().await, Err(FlushError::Submit(_))));
        assert_eq!(buffer.len() + buffer.sink().loaded_len(), 12);

        let report = buffer.flush().await.unwrap();
        assert_eq!(report.rows, 12);
        assert!(buffer.is_empty());
        assert_eq!(buffer.sink().loaded_len(), 12);
        assert_eq!(buffer.stats().flushes_failed, 1);
    }

    #[tokio::test]
    async fn requeued_rows_stay_ahead_of_newer_ones() {
        let buffer = buffer(2);
        let rows: Vec<_> = (0..3).map(record).collect();

        buffer.sink().fail_next_jobs(1);
        buffer.append(rows[0].clone()).await;
        assert!(matches!(
            buffer.append(rows[1].clone()).await,
            AppendOutcome::FlushFailed {
                error: FlushError::JobFailed { .. },
                buffered: 2
            }
        ));

        assert!(matches!(
            buffer.append(rows[2].clone()).await,
            AppendOutcome::Flushed(FlushReport { rows: 3, .. })
        ));
        assert_eq!(buffer.sink().loaded(), rows);
    }

    #[tokio::test]
    async fn unfinished_job_times_out_and_requeues() {
        let buffer = buffer(100);
        buffer.append(record(0)).await;
        buffer.sink().hang_next_jobs(1);

        match buffer.flush().await {
            Err(FlushError::Timeout { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected timeout, got {other:?}"),
        }
        assert_eq!(buffer.len(), 1);
    }

    #[tokio::test]
    async fn artifacts_are_removed_on_success_and_failure() {
        let buffer = buffer(100);
        buffer.append(record(0)).await;
        buffer.sink().fail_next_jobs(1);
        buffer.flush().await.unwrap_err();
        buffer.flush().await.unwrap();

        let artifacts = buffer.sink().submitted_artifacts();
        assert_eq!(artifacts.len(), 2);
        assert!(artifacts.iter().all(|path| !path.exists()));
    }

    #[tokio::test]
    async fn empty_flush_submits_nothing() {
        let buffer = buffer(10);
        let report = buffer.flush().await.unwrap();
        assert_eq!(report, FlushReport { rows: 0, job_id: None });
        assert!(buffer.sink().submitted_artifacts().is_empty());
    }

    #[tokio::test]
    async fn append_defers_while_flush_in_flight() {
        let buffer = Arc::new(BatchBuffer::new(
            Arc::new(InMemorySink::new()),
            BufferConfig {
                threshold: 1,
                poll: RetryPolicy::fixed(20, Duration::from_millis(10)),
            },
        ));
        buffer.sink().hang_next_jobs(1);
        buffer.live().push_back(record(0));

        let slow = tokio::spawn({
            let buffer = buffer.clone();
            async move { buffer.flush().await }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(matches!(
            buffer.append(record(1)).await,
            AppendOutcome::FlushDeferred { buffered: 1 }
        ));

        assert!(matches!(
            slow.await.unwrap(),
            Err(FlushError::Timeout { .. })
        ));
        assert_eq!(buffer.len(), 2);
        buffer.flush().await.unwrap();
        assert_eq!(buffer.sink().loaded_len(), 2);
    }
}
