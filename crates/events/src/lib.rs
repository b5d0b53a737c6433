//! Delivery channel abstraction: at-least-once queueing of event ids
//! between ingestion and the delivery workers.

pub mod channel;
pub mod in_memory_channel;
pub mod message;

pub use channel::{ChannelError, DeliveryChannel, Subscription};
pub use in_memory_channel::{DEFAULT_LEASE_TIMEOUT, InMemoryDeliveryChannel};
pub use message::{Delivery, MessageId};
