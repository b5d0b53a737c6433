//! Ingestion pipeline.
//!
//! ```text
//! NewEvent
//!   ↓
//! 1. Validate and create (PENDING, retry_count 0)
//!   ↓
//! 2. Persist to the event store
//!   ↓
//! 3. Append a snapshot to the analytics buffer
//!   ↓
//! 4. Publish the event id to the delivery channel
//! ```
//!
//! Nothing is buffered or published unless the insert succeeded. If the
//! publish fails after the insert, the event stays `PENDING` and the error is
//! returned to the caller; `DeliveryCoordinator::requeue` puts it back on the
//! channel.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use courier_core::{BufferedRecord, DomainError, Event, EventId, NewEvent};
use courier_events::{ChannelError, DeliveryChannel};

use crate::batch::{AnalyticsSink, AppendOutcome, BatchBuffer};
use crate::event_store::{EventStore, EventStoreError};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Validation(#[from] DomainError),

    #[error("failed to persist event: {0}")]
    Store(#[from] EventStoreError),

    /// Persisted but not enqueued for delivery.
    #[error("event {id} persisted but not published: {source}")]
    Publish {
        id: EventId,
        #[source]
        source: ChannelError,
    },
}

#[derive(Debug)]
pub struct Ingestor<S, C, K> {
    store: S,
    channel: C,
    buffer: Arc<BatchBuffer<K>>,
}

impl<S, C, K> Ingestor<S, C, K>
where
    S: EventStore,
    C: DeliveryChannel,
    K: AnalyticsSink,
{
    pub fn new(store: S, channel: C, buffer: Arc<BatchBuffer<K>>) -> Self {
        Self {
            store,
            channel,
            buffer,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn buffer(&self) -> &Arc<BatchBuffer<K>> {
        &self.buffer
    }

    #[instrument(skip(self, new_event), fields(event_type = %new_event.event_type), err)]
    pub async fn ingest(&self, new_event: NewEvent) -> Result<Event, IngestError> {
        let event = Event::create(new_event)?;
        self.store.insert(&event).await?;

        match self.buffer.append(BufferedRecord::snapshot(&event)).await {
            AppendOutcome::Buffered { .. } | AppendOutcome::Flushed(_) => {}
            AppendOutcome::FlushDeferred { buffered } => {
                debug!(event_id = %event.id, buffered, "analytics flush deferred");
            }
            AppendOutcome::FlushFailed { error, buffered } => {
                warn!(event_id = %event.id, buffered, error = %error, "analytics flush failed");
            }
        }

        if let Err(source) = self.channel.publish(event.id).await {
            error!(event_id = %event.id, error = %source, "event stored but not published");
            return Err(IngestError::Publish {
                id: event.id,
                source,
            });
        }

        info!(event_id = %event.id, "event ingested");
        Ok(event)
    }
}
