use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use courier_core::{Event, EventId, EventStatus, Revision};

use super::query::{EventFilter, EventPage, Pagination, StatusCounts};

/// Event store operation error.
///
/// These are **infrastructure errors** (storage, concurrency) as opposed to
/// domain errors (validation, illegal transitions).
#[derive(Debug, Error)]
pub enum EventStoreError {
    /// An event with this id already exists.
    #[error("event already exists: {0}")]
    Duplicate(EventId),

    /// No event with this id.
    #[error("event not found: {0}")]
    NotFound(EventId),

    /// Compare-and-set lost: the stored status or claim is not the expected one.
    #[error("status conflict for event {id}: expected {expected}, found {actual}")]
    Conflict {
        id: EventId,
        expected: EventStatus,
        actual: EventStatus,
    },

    /// Backend failure (connection, serialization, poisoned lock, ...).
    #[error("storage error: {0}")]
    Storage(String),
}

impl EventStoreError {
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }
}

/// Durable record of events and their delivery status.
///
/// ## Status updates
///
/// Every status change goes through `compare_and_set`: the write only lands
/// if the stored status and claim still equal `expected`. This is the guard
/// that keeps two workers from both driving the same event when a queue lease
/// lapses or a message is duplicated.
///
/// ## Implementation requirements
///
/// - `insert` rejects an existing id with `Duplicate`
/// - `compare_and_set` replaces the whole row atomically, or returns
///   `NotFound` / `Conflict` without writing
/// - `list` returns newest first (`created_at` descending)
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn insert(&self, event: &Event) -> Result<(), EventStoreError>;

    async fn get(&self, id: EventId) -> Result<Option<Event>, EventStoreError>;

    /// Persist `event` if the stored revision equals `expected`.
    async fn compare_and_set(
        &self,
        event: &Event,
        expected: Revision,
    ) -> Result<(), EventStoreError>;

    async fn list(
        &self,
        filter: &EventFilter,
        pagination: Pagination,
    ) -> Result<EventPage, EventStoreError>;

    async fn status_counts(&self) -> Result<StatusCounts, EventStoreError>;
}

#[async_trait]
impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    async fn insert(&self, event: &Event) -> Result<(), EventStoreError> {
        (**self).insert(event).await
    }

    async fn get(&self, id: EventId) -> Result<Option<Event>, EventStoreError> {
        (**self).get(id).await
    }

    async fn compare_and_set(
        &self,
        event: &Event,
        expected: Revision,
    ) -> Result<(), EventStoreError> {
        (**self).compare_and_set(event, expected).await
    }

    async fn list(
        &self,
        filter: &EventFilter,
        pagination: Pagination,
    ) -> Result<EventPage, EventStoreError> {
        (**self).list(filter, pagination).await
    }

    async fn status_counts(&self) -> Result<StatusCounts, EventStoreError> {
        (**self).status_counts().await
    }
}
