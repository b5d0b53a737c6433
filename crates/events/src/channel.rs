//! Delivery channel abstraction (mechanics only).
//!
//! A channel carries event ids from ingestion to delivery workers with
//! **at-least-once** semantics:
//!
//! - a received message is leased to one consumer until it is acked, nacked,
//!   or the lease expires;
//! - a nacked or expired message is handed out again, possibly to another consumer;
//! - no ordering guarantee between messages.
//!
//! The event store is the source of truth. The channel only says "look at
//! this event now"; consumers re-read the event and must tolerate duplicates.
//!
//! ```text
//! ingest → EventStore (insert) → DeliveryChannel (publish) → workers
//!                                        ▲                      │
//!                                        └──── nack / expiry ───┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use courier_core::EventId;
use thiserror::Error;

use crate::message::{Delivery, MessageId};

#[derive(Debug, Error)]
pub enum ChannelError {
    /// Transport failure (connection lost, command rejected, ...).
    #[error("channel transport error: {0}")]
    Transport(String),

    /// Internal lock poisoning.
    #[error("channel state poisoned")]
    Poisoned,
}

impl ChannelError {
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }
}

/// Durable, leased work queue of event ids.
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    /// Enqueue an event id for delivery.
    async fn publish(&self, event_id: EventId) -> Result<MessageId, ChannelError>;

    /// Wait up to `wait` for the next available message and lease it to `consumer`.
    ///
    /// Returns `Ok(None)` when nothing became available in time.
    async fn receive(&self, consumer: &str, wait: Duration)
    -> Result<Option<Delivery>, ChannelError>;

    /// Remove a message permanently. Unknown ids are ignored.
    async fn ack(&self, message_id: &MessageId) -> Result<(), ChannelError>;

    /// Return a message for redelivery. Unknown ids are ignored.
    async fn nack(&self, message_id: &MessageId) -> Result<(), ChannelError>;
}

#[async_trait]
impl<C> DeliveryChannel for Arc<C>
where
    C: DeliveryChannel + ?Sized,
{
    async fn publish(&self, event_id: EventId) -> Result<MessageId, ChannelError> {
        (**self).publish(event_id).await
    }

    async fn receive(
        &self,
        consumer: &str,
        wait: Duration,
    ) -> Result<Option<Delivery>, ChannelError> {
        (**self).receive(consumer, wait).await
    }

    async fn ack(&self, message_id: &MessageId) -> Result<(), ChannelError> {
        (**self).ack(message_id).await
    }

    async fn nack(&self, message_id: &MessageId) -> Result<(), ChannelError> {
        (**self).nack(message_id).await
    }
}

/// A named consumer bound to a channel.
///
/// ```ignore
/// let subscription = Subscription::new(channel.clone(), "worker-1");
/// loop {
///     match subscription.recv_timeout(Duration::from_millis(500)).await? {
///         Some(delivery) => handle(delivery).await,
///         None => continue, // check for shutdown
///     }
/// }
/// ```
#[derive(Debug, Clone)]
pub struct Subscription<C> {
    channel: C,
    consumer: String,
}

impl<C> Subscription<C>
where
    C: DeliveryChannel,
{
    pub fn new(channel: C, consumer: impl Into<String>) -> Self {
        Self {
            channel,
            consumer: consumer.into(),
        }
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    /// Wait for up to `timeout` for the next message.
    pub async fn recv_timeout(&self, timeout: Duration) -> Result<Option<Delivery>, ChannelError> {
        self.channel.receive(&self.consumer, timeout).await
    }

    pub async fn ack(&self, delivery: &Delivery) -> Result<(), ChannelError> {
        self.channel.ack(&delivery.message_id).await
    }

    pub async fn nack(&self, delivery: &Delivery) -> Result<(), ChannelError> {
        self.channel.nack(&delivery.message_id).await
    }
}
