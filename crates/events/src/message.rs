//! Messages as seen by consumers of a delivery channel.

use courier_core::{DomainResult, EventId};

/// Transport-assigned identifier of a queued message.
///
/// Opaque to consumers; pass it back unchanged to `ack`/`nack`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for MessageId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message handed to one consumer under a lease.
///
/// Until the consumer acks or nacks it, or the lease expires, no other
/// consumer receives the same message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub message_id: MessageId,
    /// Raw body; a well-formed message carries an event id.
    pub body: String,
    /// How many times this message has been handed out, including this one.
    pub delivery_count: u32,
}

impl Delivery {
    pub fn event_id(&self) -> DomainResult<EventId> {
        self.body.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_event_id_from_body() {
        let id = EventId::new();
        let delivery = Delivery {
            message_id: MessageId::new("1-0"),
            body: id.to_string(),
            delivery_count: 1,
        };
        assert_eq!(delivery.event_id().unwrap(), id);

        let garbage = Delivery {
            body: "{not an id}".to_string(),
            ..delivery
        };
        assert!(garbage.event_id().is_err());
    }
}
