//! Reliable delivery: the coordinator that owns the event state machine, the
//! pluggable processing step, and the worker tasks that feed it.

pub mod coordinator;
pub mod processor;
pub mod worker;

pub use coordinator::{
    DeliveryCoordinator, DeliveryError, DeliveryOutcome, Disposition, ReplayError,
};
pub use processor::{AcceptAllProcessor, EventProcessor, ProcessingError};
pub use worker::{DeliveryWorker, WorkerConfig, WorkerError, WorkerHandle, WorkerStats};
