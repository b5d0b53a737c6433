//! Redis Streams-backed delivery channel (durable, at-least-once delivery).
//!
//! - **Stream Key**: `courier:events` by default; each entry carries an `event_id` field
//! - **Consumer Group**: one group shared by all delivery workers (`courier.delivery`)
//! - **Consumers**: named per worker (`worker-1`, `worker-2`, ...)
//!
//! Leases map onto the consumer group's pending entries list: a message read
//! with `XREADGROUP` stays pending for its consumer until `XACK`. Entries
//! idle for longer than the lease timeout are taken over with `XCLAIM`.
//!
//! `nack` re-adds the event id as a fresh entry and acks the old one in a
//! single `MULTI`, so the retry is visible to every consumer immediately.

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamRangeReply, StreamReadOptions,
    StreamReadReply,
};
use tracing::{debug, instrument, warn};

use courier_core::EventId;
use courier_events::{ChannelError, Delivery, DeliveryChannel, MessageId};

const EVENT_ID_FIELD: &str = "event_id";
const DELIVERY_COUNT_FIELD: &str = "delivery_count";

/// Interval between non-blocking reads while waiting for a message.
///
/// The connection is multiplexed across workers, so `BLOCK` is never used on it.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Pending entries inspected per reclaim pass.
const RECLAIM_SCAN: usize = 10;

#[derive(Clone)]
pub struct RedisStreamsChannel {
    conn: MultiplexedConnection,
    stream_key: String,
    group: String,
    lease_timeout: Duration,
}

impl core::fmt::Debug for RedisStreamsChannel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisStreamsChannel")
            .field("stream_key", &self.stream_key)
            .field("group", &self.group)
            .field("lease_timeout", &self.lease_timeout)
            .finish_non_exhaustive()
    }
}

fn transport(context: &str, err: redis::RedisError) -> ChannelError {
    ChannelError::transport(format!("{context} failed: {err}"))
}

impl RedisStreamsChannel {
    /// Connect and make sure the consumer group exists.
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `stream_key` - stream holding event references
    /// * `group` - consumer group shared by the delivery workers
    pub async fn connect(
        redis_url: &str,
        stream_key: impl Into<String>,
        group: impl Into<String>,
        lease_timeout: Duration,
    ) -> Result<Self, ChannelError> {
        let client = redis::Client::open(redis_url).map_err(|e| transport("open", e))?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| transport("connect", e))?;

        let channel = Self {
            conn,
            stream_key: stream_key.into(),
            group: group.into(),
            lease_timeout,
        };
        channel.ensure_consumer_group().await?;
        Ok(channel)
    }

    /// Create the consumer group (and the stream) if missing. Idempotent.
    pub async fn ensure_consumer_group(&self) -> Result<(), ChannelError> {
        let mut conn = self.conn.clone();
        let created: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match created {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(transport("XGROUP CREATE", e)),
        }
    }

    fn lease_ms(&self) -> usize {
        self.lease_timeout.as_millis() as usize
    }

    /// Take over one entry whose lease has lapsed, if any.
    async fn reclaim_expired(&self, consumer: &str) -> Result<Option<Delivery>, ChannelError> {
        let mut conn = self.conn.clone();
        let pending: StreamPendingCountReply = conn
            .xpending_count(&self.stream_key, &self.group, "-", "+", RECLAIM_SCAN)
            .await
            .map_err(|e| transport("XPENDING", e))?;

        let lease_ms = self.lease_ms();
        for entry in pending.ids.iter().filter(|p| p.last_delivered_ms >= lease_ms) {
            let claimed: StreamClaimReply = conn
                .xclaim(
                    &self.stream_key,
                    &self.group,
                    consumer,
                    lease_ms,
                    &[entry.id.as_str()],
                )
                .await
                .map_err(|e| transport("XCLAIM", e))?;

            // Another consumer may have claimed it first.
            if let Some(stream_id) = claimed.ids.first() {
                debug!(
                    message_id = %stream_id.id,
                    previous_consumer = %entry.consumer,
                    consumer,
                    "reclaimed expired lease"
                );
                let times_delivered = u32::try_from(entry.times_delivered).unwrap_or(u32::MAX);
                return Ok(Some(to_delivery(stream_id, times_delivered.saturating_add(1))));
            }
        }

        Ok(None)
    }

    async fn read_new(&self, consumer: &str) -> Result<Option<Delivery>, ChannelError> {
        let mut conn = self.conn.clone();
        let options = StreamReadOptions::default()
            .group(&self.group, consumer)
            .count(1);
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[&self.stream_key], &[">"], &options)
            .await
            .map_err(|e| transport("XREADGROUP", e))?;

        let entry = reply
            .and_then(|r| r.keys.into_iter().next())
            .and_then(|key| key.ids.into_iter().next());
        Ok(entry.map(|stream_id| to_delivery(&stream_id, 1)))
    }
}

/// Build a delivery from a stream entry.
///
/// `delivery_count` carries deliveries of earlier entries for the same event
/// (written by `nack`), so the count survives the re-add.
fn to_delivery(entry: &StreamId, deliveries_of_entry: u32) -> Delivery {
    let body: String = entry.get(EVENT_ID_FIELD).unwrap_or_default();
    let carried: u32 = entry.get(DELIVERY_COUNT_FIELD).unwrap_or(0);
    Delivery {
        message_id: MessageId::new(entry.id.clone()),
        body,
        delivery_count: carried.saturating_add(deliveries_of_entry),
    }
}

#[async_trait]
impl DeliveryChannel for RedisStreamsChannel {
    #[instrument(skip(self), fields(stream_key = %self.stream_key), err)]
    async fn publish(&self, event_id: EventId) -> Result<MessageId, ChannelError> {
        let mut conn = self.conn.clone();
        let id: String = conn
            .xadd(
                &self.stream_key,
                "*",
                &[(EVENT_ID_FIELD, event_id.to_string())],
            )
            .await
            .map_err(|e| transport("XADD", e))?;
        Ok(MessageId::new(id))
    }

    async fn receive(
        &self,
        consumer: &str,
        wait: Duration,
    ) -> Result<Option<Delivery>, ChannelError> {
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            if let Some(delivery) = self.reclaim_expired(consumer).await? {
                return Ok(Some(delivery));
            }
            if let Some(delivery) = self.read_new(consumer).await? {
                return Ok(Some(delivery));
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    #[instrument(skip(self), fields(message_id = %message_id), err)]
    async fn ack(&self, message_id: &MessageId) -> Result<(), ChannelError> {
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .xack(&self.stream_key, &self.group, &[message_id.as_str()])
            .ignore()
            .xdel(&self.stream_key, &[message_id.as_str()])
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| transport("XACK", e))
    }

    #[instrument(skip(self), fields(message_id = %message_id), err)]
    async fn nack(&self, message_id: &MessageId) -> Result<(), ChannelError> {
        let mut conn = self.conn.clone();
        let existing: StreamRangeReply = conn
            .xrange_count(&self.stream_key, message_id.as_str(), message_id.as_str(), 1)
            .await
            .map_err(|e| transport("XRANGE", e))?;

        let Some(entry) = existing.ids.first() else {
            warn!(message_id = %message_id, "nack for unknown message ignored");
            return Ok(());
        };

        let body: String = entry.get(EVENT_ID_FIELD).unwrap_or_default();
        let carried: u32 = entry.get(DELIVERY_COUNT_FIELD).unwrap_or(0);

        redis::pipe()
            .atomic()
            .xadd(
                &self.stream_key,
                "*",
                &[
                    (EVENT_ID_FIELD, body),
                    (DELIVERY_COUNT_FIELD, carried.saturating_add(1).to_string()),
                ],
            )
            .ignore()
            .xack(&self.stream_key, &self.group, &[message_id.as_str()])
            .ignore()
            .xdel(&self.stream_key, &[message_id.as_str()])
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| transport("nack pipeline", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn entry(fields: &[(&str, &str)]) -> StreamId {
        StreamId {
            id: "1700000000000-0".to_string(),
            map: fields
                .iter()
                .map(|(k, v)| (k.to_string(), redis::Value::Data(v.as_bytes().to_vec())))
                .collect::<HashMap<_, _>>(),
        }
    }

    #[test]
    fn delivery_reads_event_id_field() {
        let event_id = EventId::new();
        let delivery = to_delivery(&entry(&[(EVENT_ID_FIELD, &event_id.to_string())]), 1);
        assert_eq!(delivery.message_id.as_str(), "1700000000000-0");
        assert_eq!(delivery.event_id().unwrap(), event_id);
        assert_eq!(delivery.delivery_count, 1);
    }

    #[test]
    fn delivery_count_survives_nack_readd() {
        let delivery = to_delivery(&entry(&[(EVENT_ID_FIELD, "x"), (DELIVERY_COUNT_FIELD, "2")]), 1);
        assert_eq!(delivery.delivery_count, 3);
    }

    #[test]
    fn entry_without_event_id_is_malformed() {
        let delivery = to_delivery(&entry(&[("something", "else")]), 1);
        assert!(delivery.body.is_empty());
        assert!(delivery.event_id().is_err());
    }
}
