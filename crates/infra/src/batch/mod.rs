//! Analytics batching: event snapshots are buffered and shipped to an
//! append-only warehouse as load jobs.

pub mod artifact;
pub mod buffer;
pub mod http_sink;
pub mod in_memory_sink;
pub mod poll;
pub mod sink;

pub use artifact::{ArtifactError, LoadArtifact};
pub use buffer::{
    AppendOutcome, BatchBuffer, BufferConfig, BufferStats, DEFAULT_THRESHOLD, FlushError,
    FlushReport,
};
pub use http_sink::HttpLoadJobSink;
pub use in_memory_sink::InMemorySink;
pub use poll::{BackoffStrategy, PollError, RetryPolicy, poll_until};
pub use sink::{AnalyticsSink, JobId, JobState, JobStatus, SinkError};
