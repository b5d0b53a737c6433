//! `courier-core`: domain building blocks for reliable event delivery.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! the `Event` entity with its status state machine, and the immutable
//! `BufferedRecord` snapshot handed to the analytics pipeline.

pub mod entity;
pub mod error;
pub mod event;
pub mod id;
pub mod record;
pub mod value_object;

pub use entity::Entity;
pub use error::{DomainError, DomainResult};
pub use event::{
    DEFAULT_MAX_RETRIES, Event, EventMetadata, EventStatus, EventType, FailureOutcome, NewEvent,
    Revision,
};
pub use id::EventId;
pub use record::BufferedRecord;
pub use value_object::ValueObject;
