//! In-memory delivery channel for tests/dev.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use courier_core::EventId;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::channel::{ChannelError, DeliveryChannel};
use crate::message::{Delivery, MessageId};

/// Default lease duration before an unacknowledged message is redelivered.
pub const DEFAULT_LEASE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct Queued {
    id: MessageId,
    body: String,
    delivery_count: u32,
}

#[derive(Debug)]
struct Lease {
    message: Queued,
    consumer: String,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct State {
    next_seq: u64,
    ready: VecDeque<Queued>,
    leased: HashMap<MessageId, Lease>,
}

impl State {
    fn reclaim_expired(&mut self, now: Instant) {
        let expired: Vec<MessageId> = self
            .leased
            .iter()
            .filter(|(_, lease)| lease.expires_at <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for id in expired {
            if let Some(lease) = self.leased.remove(&id) {
                tracing::debug!(
                    message_id = %id,
                    consumer = %lease.consumer,
                    "lease expired; message returned to queue"
                );
                self.ready.push_front(lease.message);
            }
        }
    }

    fn next_expiry(&self) -> Option<Instant> {
        self.leased.values().map(|lease| lease.expires_at).min()
    }
}

/// In-process leased queue.
///
/// - FIFO among ready messages
/// - Leases expire after `lease_timeout`, checked lazily on `receive`;
///   expired messages go ahead of newer ones
/// - Nothing survives a restart
#[derive(Debug)]
pub struct InMemoryDeliveryChannel {
    state: Mutex<State>,
    notify: Notify,
    lease_timeout: Duration,
}

impl InMemoryDeliveryChannel {
    pub fn new() -> Self {
        Self::with_lease_timeout(DEFAULT_LEASE_TIMEOUT)
    }

    pub fn with_lease_timeout(lease_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            lease_timeout,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, ChannelError> {
        self.state.lock().map_err(|_| ChannelError::Poisoned)
    }

    /// Enqueue an arbitrary body. Well-behaved producers use `publish`.
    pub fn publish_raw(&self, body: impl Into<String>) -> Result<MessageId, ChannelError> {
        let id = {
            let mut state = self.lock()?;
            state.next_seq += 1;
            let id = MessageId::new(format!("{}-0", state.next_seq));
            state.ready.push_back(Queued {
                id: id.clone(),
                body: body.into(),
                delivery_count: 0,
            });
            id
        };
        self.notify.notify_waiters();
        Ok(id)
    }

    /// Messages waiting to be received.
    pub fn ready_len(&self) -> usize {
        self.lock().map(|s| s.ready.len()).unwrap_or(0)
    }

    /// Messages currently leased to a consumer (expired leases included until reclaimed).
    pub fn leased_len(&self) -> usize {
        self.lock().map(|s| s.leased.len()).unwrap_or(0)
    }
}

impl Default for InMemoryDeliveryChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeliveryChannel for InMemoryDeliveryChannel {
    async fn publish(&self, event_id: EventId) -> Result<MessageId, ChannelError> {
        self.publish_raw(event_id.to_string())
    }

    async fn receive(
        &self,
        consumer: &str,
        wait: Duration,
    ) -> Result<Option<Delivery>, ChannelError> {
        let deadline = Instant::now() + wait;

        loop {
            // Register interest before checking state so a publish between the
            // check and the await still wakes us.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_expiry = {
                let mut state = self.lock()?;
                let now = Instant::now();
                state.reclaim_expired(now);

                if let Some(mut message) = state.ready.pop_front() {
                    message.delivery_count += 1;
                    let delivery = Delivery {
                        message_id: message.id.clone(),
                        body: message.body.clone(),
                        delivery_count: message.delivery_count,
                    };
                    state.leased.insert(
                        message.id.clone(),
                        Lease {
                            message,
                            consumer: consumer.to_string(),
                            expires_at: now + self.lease_timeout,
                        },
                    );
                    return Ok(Some(delivery));
                }

                state.next_expiry()
            };

            if Instant::now() >= deadline {
                return Ok(None);
            }

            let wake_at = next_expiry.map_or(deadline, |expiry| expiry.min(deadline));
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn ack(&self, message_id: &MessageId) -> Result<(), ChannelError> {
        let mut state = self.lock()?;
        if state.leased.remove(message_id).is_none() {
            // Lease may have expired and the message been re-queued.
            state.ready.retain(|m| &m.id != message_id);
        }
        Ok(())
    }

    async fn nack(&self, message_id: &MessageId) -> Result<(), ChannelError> {
        let requeued = {
            let mut state = self.lock()?;
            match state.leased.remove(message_id) {
                Some(lease) => {
                    state.ready.push_back(lease.message);
                    true
                }
                None => false,
            }
        };
        if requeued {
            self.notify.notify_waiters();
        }
        Ok(())
    }
}
