//! Delivery coordinator: drives an event through its status state machine for
//! each channel delivery and decides whether the message is acked or nacked.
//!
//! ## Protocol
//!
//! | Situation on receipt | Action |
//! |----------------------|--------|
//! | Body is not an event id | ack (poison message), no processing |
//! | Event id unknown to the store | ack |
//! | Event `PROCESSED` / `DEAD_LETTER` | ack (duplicate delivery) |
//! | Event `PROCESSING`, first delivery of this message | ack (owned by another delivery) |
//! | Event `PROCESSING`, redelivered, claim younger than the lease | leave leased, no processing |
//! | Event `PROCESSING`, redelivered, claim older than the lease | take over (owner presumed gone) |
//! | Processing succeeded | `PROCESSED`, ack |
//! | Processing failed, retries left | `FAILED`, nack |
//! | Processing failed, retries exhausted | `DEAD_LETTER`, ack |
//! | Compare-and-set lost | ack if terminal or `PROCESSING`, else nack |
//!
//! A redelivery count above one is not proof that the owner is gone: a nacked
//! message keeps its count, and a replay can put a second message for the same
//! event on the channel. Only the age of the stored claim decides a takeover,
//! and every write compares the claim it read.
//!
//! Store failures are never swallowed: they surface as `DeliveryError::Store`
//! and the message is left leased so the channel redelivers it after expiry.

use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use courier_core::{DEFAULT_MAX_RETRIES, DomainError, Event, EventId, EventStatus, Revision};
use courier_events::{ChannelError, DEFAULT_LEASE_TIMEOUT, Delivery, DeliveryChannel};

use crate::event_store::{EventStore, EventStoreError};

use super::processor::EventProcessor;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("event store failure: {0}")]
    Store(#[from] EventStoreError),

    #[error("channel failure: {0}")]
    Channel(#[from] ChannelError),

    #[error("state machine violation: {0}")]
    Domain(#[from] DomainError),
}

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("event not found: {0}")]
    NotFound(EventId),

    #[error("event {0} already processed")]
    AlreadyProcessed(EventId),

    #[error("event {id} in status {status} cannot be replayed")]
    NotReplayable { id: EventId, status: EventStatus },

    /// Only `PENDING` events can be requeued.
    #[error("event {id} is {status}, not PENDING")]
    NotPending { id: EventId, status: EventStatus },

    #[error("event {id} changed concurrently (now {actual})")]
    Conflict { id: EventId, actual: EventStatus },

    #[error("event store failure: {0}")]
    Store(#[from] EventStoreError),

    /// The reset was persisted but the new reference could not be enqueued.
    #[error("event {id} reset but not re-enqueued: {source}")]
    Publish {
        id: EventId,
        #[source]
        source: ChannelError,
    },
}

/// What to tell the channel about a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Nack,
    /// Settle nothing; the lease runs out and the message comes back.
    Leave,
}

/// Result of handling one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Body did not parse as an event id.
    Malformed,
    /// No such event in the store.
    UnknownEvent(EventId),
    /// The event is terminal or owned by another delivery; nothing ran.
    Duplicate { id: EventId, status: EventStatus },
    /// Redelivered while a live claim still owns the event; nothing ran.
    InFlight(EventId),
    Processed(EventId),
    Retrying { id: EventId, retry_count: u32 },
    DeadLettered { id: EventId, retry_count: u32 },
    /// A compare-and-set lost against another writer.
    Superseded { id: EventId, status: EventStatus },
}

impl DeliveryOutcome {
    pub fn disposition(&self) -> Disposition {
        match self {
            DeliveryOutcome::Retrying { .. } => Disposition::Nack,
            DeliveryOutcome::InFlight(_) => Disposition::Leave,
            DeliveryOutcome::Superseded { status, .. }
                if !status.is_terminal() && *status != EventStatus::Processing =>
            {
                Disposition::Nack
            }
            _ => Disposition::Ack,
        }
    }
}

/// Owns the state machine side of delivery.
#[derive(Debug)]
pub struct DeliveryCoordinator<S, C, P> {
    store: S,
    channel: C,
    processor: P,
    max_retries: u32,
    lease_timeout: Duration,
}

impl<S, C, P> DeliveryCoordinator<S, C, P>
where
    S: EventStore,
    C: DeliveryChannel,
    P: EventProcessor,
{
    pub fn new(store: S, channel: C, processor: P) -> Self {
        Self {
            store,
            channel,
            processor,
            max_retries: DEFAULT_MAX_RETRIES,
            lease_timeout: DEFAULT_LEASE_TIMEOUT,
        }
    }

    /// Age after which a `PROCESSING` claim may be taken over. Should match
    /// the channel's lease timeout.
    pub fn with_lease_timeout(mut self, lease_timeout: Duration) -> Self {
        self.lease_timeout = lease_timeout;
        self
    }

    /// Failed attempts after which an event is dead-lettered (at least 1).
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    /// Handle a delivery and settle it on the channel.
    #[instrument(
        skip(self, delivery),
        fields(message_id = %delivery.message_id, delivery_count = delivery.delivery_count),
        err
    )]
    pub async fn deliver(&self, delivery: &Delivery) -> Result<DeliveryOutcome, DeliveryError> {
        let outcome = self.handle(delivery).await?;
        match outcome.disposition() {
            Disposition::Ack => self.channel.ack(&delivery.message_id).await?,
            Disposition::Nack => self.channel.nack(&delivery.message_id).await?,
            Disposition::Leave => {}
        }
        Ok(outcome)
    }

    /// Run the state machine for a delivery without touching the channel.
    pub async fn handle(&self, delivery: &Delivery) -> Result<DeliveryOutcome, DeliveryError> {
        let id = match delivery.event_id() {
            Ok(id) => id,
            Err(err) => {
                warn!(
                    message_id = %delivery.message_id,
                    body = %delivery.body,
                    error = %err,
                    "dropping malformed delivery"
                );
                return Ok(DeliveryOutcome::Malformed);
            }
        };

        let Some(mut event) = self.store.get(id).await? else {
            warn!(event_id = %id, "dropping delivery for unknown event");
            return Ok(DeliveryOutcome::UnknownEvent(id));
        };

        match event.status {
            status if status.is_terminal() => {
                debug!(event_id = %id, %status, "duplicate delivery of finished event");
                return Ok(DeliveryOutcome::Duplicate { id, status });
            }
            EventStatus::Processing if delivery.delivery_count <= 1 => {
                debug!(event_id = %id, "event already in flight under another delivery");
                return Ok(DeliveryOutcome::Duplicate {
                    id,
                    status: EventStatus::Processing,
                });
            }
            EventStatus::Processing if !event.claim_lapsed(self.lease_timeout, Utc::now()) => {
                debug!(
                    event_id = %id,
                    delivery_count = delivery.delivery_count,
                    "event claimed by a live delivery; leaving message leased"
                );
                return Ok(DeliveryOutcome::InFlight(id));
            }
            EventStatus::Processing => {
                warn!(
                    event_id = %id,
                    delivery_count = delivery.delivery_count,
                    claimed_at = ?event.claimed_at,
                    "taking over event whose claim lapsed"
                );
            }
            _ => {}
        }

        let prior = event.revision();
        event.begin_processing()?;
        if let Some(outcome) = self.write(&event, prior).await? {
            return Ok(outcome);
        }
        let claim = event.revision();

        match self.processor.process(&event).await {
            Ok(()) => {
                event.mark_processed()?;
                if let Some(outcome) = self.write(&event, claim).await? {
                    return Ok(outcome);
                }
                info!(event_id = %id, "event processed");
                Ok(DeliveryOutcome::Processed(id))
            }
            Err(err) => {
                event.record_failure(err.message(), self.max_retries)?;
                if let Some(outcome) = self.write(&event, claim).await? {
                    return Ok(outcome);
                }
                self.settle_failure(&event).await
            }
        }
    }

    /// Decide ack/nack from the retry count as stored now, which a
    /// concurrent replay may already have reset.
    async fn settle_failure(&self, attempted: &Event) -> Result<DeliveryOutcome, DeliveryError> {
        let id = attempted.id;
        let Some(current) = self.store.get(id).await? else {
            return Ok(DeliveryOutcome::UnknownEvent(id));
        };

        let retry_count = current.retry_count;
        if current.status == EventStatus::DeadLetter || retry_count >= self.max_retries {
            warn!(
                event_id = %id,
                retry_count,
                reason = attempted.failure_reason.as_deref().unwrap_or_default(),
                "event dead-lettered"
            );
            Ok(DeliveryOutcome::DeadLettered { id, retry_count })
        } else {
            info!(
                event_id = %id,
                retry_count,
                reason = attempted.failure_reason.as_deref().unwrap_or_default(),
                "processing failed; retry scheduled"
            );
            Ok(DeliveryOutcome::Retrying { id, retry_count })
        }
    }

    /// Compare-and-set; a lost race becomes an outcome instead of an error.
    async fn write(
        &self,
        event: &Event,
        expected: Revision,
    ) -> Result<Option<DeliveryOutcome>, DeliveryError> {
        match self.store.compare_and_set(event, expected).await {
            Ok(()) => Ok(None),
            Err(EventStoreError::Conflict { id, actual, .. }) => {
                warn!(
                    event_id = %id,
                    expected = %expected.status,
                    %actual,
                    attempted = %event.status,
                    "status changed concurrently"
                );
                Ok(Some(DeliveryOutcome::Superseded { id, status: actual }))
            }
            Err(EventStoreError::NotFound(id)) => Ok(Some(DeliveryOutcome::UnknownEvent(id))),
            Err(err) => Err(err.into()),
        }
    }

    /// Reset a `FAILED` or `DEAD_LETTER` event to `PENDING` and enqueue it again.
    #[instrument(skip(self), fields(event_id = %id), err)]
    pub async fn replay(&self, id: EventId) -> Result<Event, ReplayError> {
        let mut event = self.store.get(id).await?.ok_or(ReplayError::NotFound(id))?;

        let prior = event.revision();
        event.replay().map_err(|err| match err {
            DomainError::AlreadyProcessed => ReplayError::AlreadyProcessed(id),
            _ => ReplayError::NotReplayable {
                id,
                status: event.status,
            },
        })?;

        match self.store.compare_and_set(&event, prior).await {
            Ok(()) => {}
            Err(EventStoreError::Conflict { actual, .. }) => {
                return Err(ReplayError::Conflict { id, actual });
            }
            Err(EventStoreError::NotFound(_)) => return Err(ReplayError::NotFound(id)),
            Err(err) => return Err(err.into()),
        }

        self.channel
            .publish(id)
            .await
            .map_err(|source| ReplayError::Publish { id, source })?;

        info!(event_id = %id, prior = %prior.status, "event replayed");
        Ok(event)
    }

    /// Publish a fresh reference to a `PENDING` event whose original publish
    /// was lost. The stored event is untouched; if a message for it still
    /// exists, the extra one is dropped as a duplicate on receipt.
    #[instrument(skip(self), fields(event_id = %id), err)]
    pub async fn requeue(&self, id: EventId) -> Result<Event, ReplayError> {
        let event = self.store.get(id).await?.ok_or(ReplayError::NotFound(id))?;
        if event.status != EventStatus::Pending {
            return Err(ReplayError::NotPending {
                id,
                status: event.status,
            });
        }

        self.channel
            .publish(id)
            .await
            .map_err(|source| ReplayError::Publish { id, source })?;

        info!(event_id = %id, "pending event requeued");
        Ok(event)
    }
}
