//! Infrastructure delivery channel implementations.
//!
//! The channel abstraction lives in `courier-events` as pure mechanics.
//! This module provides infrastructure-backed implementations (e.g. Redis).

/// Default stream key for event references.
pub const DEFAULT_STREAM_KEY: &str = "courier:events";

/// Default consumer group for delivery workers.
pub const DEFAULT_CONSUMER_GROUP: &str = "courier.delivery";

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamsChannel;
