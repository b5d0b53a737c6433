//! The `Event` entity and its delivery status state machine.
//!
//! ```text
//!             begin_processing            mark_processed
//!   PENDING ──────────────────▶ PROCESSING ──────────────▶ PROCESSED
//!      ▲                         │   ▲   │
//!      │                 failure │   │   │ failure (retry_count reached max)
//!      │          (below max)    ▼   │   ▼
//!      │                      FAILED─┘  DEAD_LETTER
//!      │  replay                 │          │
//!      └─────────────────────────┴──────────┘
//! ```
//!
//! All transitions are methods on `Event`; they validate the current status
//! and mutate the timestamp/retry fields. Callers take `revision()` before a
//! transition and persist the change with a compare-and-set on it.

use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::entity::Entity;
use crate::error::{DomainError, DomainResult};
use crate::id::EventId;
use crate::value_object::ValueObject;

/// Default number of failed attempts after which an event is dead-lettered.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Maximum length of an event type, in characters.
pub const MAX_EVENT_TYPE_LEN: usize = 100;

/// Delivery status of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    /// Ingested, waiting for a worker.
    Pending,
    /// Owned by a worker; processing step running.
    Processing,
    /// Terminal success.
    Processed,
    /// Last attempt failed; the message will be redelivered.
    Failed,
    /// Retries exhausted; only an explicit replay resumes it.
    DeadLetter,
}

impl EventStatus {
    pub const ALL: [EventStatus; 5] = [
        EventStatus::Pending,
        EventStatus::Processing,
        EventStatus::Processed,
        EventStatus::Failed,
        EventStatus::DeadLetter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "PENDING",
            EventStatus::Processing => "PROCESSING",
            EventStatus::Processed => "PROCESSED",
            EventStatus::Failed => "FAILED",
            EventStatus::DeadLetter => "DEAD_LETTER",
        }
    }

    /// No worker will touch an event in a terminal status again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventStatus::Processed | EventStatus::DeadLetter)
    }

    pub fn is_replayable(&self) -> bool {
        matches!(self, EventStatus::Failed | EventStatus::DeadLetter)
    }

    /// Whether `self -> to` is an edge of the state machine.
    ///
    /// `PROCESSING -> PROCESSING` is a takeover. It is only taken once the
    /// current claim has lapsed (see `Event::claim_lapsed`).
    pub fn can_transition_to(&self, to: EventStatus) -> bool {
        use EventStatus::*;
        matches!(
            (self, to),
            (Pending | Failed | Processing, Processing)
                | (Processing, Processed | Failed | DeadLetter)
                | (Failed | DeadLetter, Pending)
        )
    }
}

impl core::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for EventStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase();
        EventStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == normalized)
            .ok_or_else(|| DomainError::validation(format!("unknown event status: {s}")))
    }
}

/// Client-supplied classification of an event (1–100 characters).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EventType(String);

impl EventType {
    pub fn parse(value: impl Into<String>) -> DomainResult<Self> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(DomainError::validation("event_type must not be empty"));
        }
        let len = value.chars().count();
        if len > MAX_EVENT_TYPE_LEN {
            return Err(DomainError::validation(format!(
                "event_type must be at most {MAX_EVENT_TYPE_LEN} characters (got {len})"
            )));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl ValueObject for EventType {}

impl TryFrom<String> for EventType {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<EventType> for String {
    fn from(value: EventType) -> Self {
        value.0
    }
}

impl core::fmt::Display for EventType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Optional descriptive metadata attached by the producer. Opaque to delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Any additional producer-defined keys.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, JsonValue>,
}

/// Unvalidated input for creating an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    pub event_type: String,
    pub payload: JsonValue,
    #[serde(default)]
    pub metadata: Option<EventMetadata>,
}

/// What a compare-and-set expects to find in the store.
///
/// The claim timestamp tells two `PROCESSING` owners apart, so a takeover and
/// a stale writer never both land.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Revision {
    pub status: EventStatus,
    pub claimed_at: Option<DateTime<Utc>>,
}

/// Result of recording a failed processing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// The event is `FAILED` and should be redelivered.
    Retry { retry_count: u32 },
    /// The event is `DEAD_LETTER`; delivery must stop.
    DeadLettered { retry_count: u32 },
}

/// The unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub event_type: EventType,
    pub payload: JsonValue,
    pub metadata: Option<EventMetadata>,
    pub status: EventStatus,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    /// When the current (or last) processing attempt claimed the event.
    #[serde(default)]
    pub claimed_at: Option<DateTime<Utc>>,
}

impl Event {
    /// Validate input and create a `PENDING` event with a fresh id.
    pub fn create(input: NewEvent) -> DomainResult<Self> {
        let event_type = EventType::parse(input.event_type)?;
        if !input.payload.is_object() {
            return Err(DomainError::validation("payload must be a JSON object"));
        }

        Ok(Self {
            id: EventId::new(),
            event_type,
            payload: input.payload,
            metadata: input.metadata,
            status: EventStatus::Pending,
            retry_count: 0,
            created_at: Utc::now(),
            processed_at: None,
            failed_at: None,
            failure_reason: None,
            claimed_at: None,
        })
    }

    pub fn revision(&self) -> Revision {
        Revision {
            status: self.status,
            claimed_at: self.claimed_at,
        }
    }

    /// True when the event is `PROCESSING` under a claim at least
    /// `lease_timeout` old, i.e. its owner may be gone.
    pub fn claim_lapsed(&self, lease_timeout: Duration, now: DateTime<Utc>) -> bool {
        if self.status != EventStatus::Processing {
            return false;
        }
        let Ok(lease) = chrono::Duration::from_std(lease_timeout) else {
            return false;
        };
        self.claimed_at.is_none_or(|claimed_at| now - claimed_at >= lease)
    }

    fn transition(&mut self, to: EventStatus) -> DomainResult<EventStatus> {
        if !self.status.can_transition_to(to) {
            return Err(DomainError::invalid_transition(self.status, to));
        }
        let prior = self.status;
        self.status = to;
        Ok(prior)
    }

    /// Claim the event for a processing attempt. Returns the prior status.
    ///
    /// The claim is stamped at microsecond precision so it compares equal
    /// after a round trip through Postgres.
    pub fn begin_processing(&mut self) -> DomainResult<EventStatus> {
        let prior = self.transition(EventStatus::Processing)?;
        self.claimed_at = Some(Utc::now().trunc_subsecs(6));
        Ok(prior)
    }

    /// Record a successful attempt.
    pub fn mark_processed(&mut self) -> DomainResult<()> {
        self.transition(EventStatus::Processed)?;
        self.processed_at = Some(Utc::now());
        Ok(())
    }

    /// Record a failed attempt.
    ///
    /// Increments `retry_count` exactly once; the event becomes `DEAD_LETTER`
    /// once the count reaches `max_retries` (a `max_retries` of 0 is treated as 1).
    pub fn record_failure(
        &mut self,
        reason: impl Into<String>,
        max_retries: u32,
    ) -> DomainResult<FailureOutcome> {
        let retry_count = self.retry_count.saturating_add(1);
        let exhausted = retry_count >= max_retries.max(1);
        let target = if exhausted {
            EventStatus::DeadLetter
        } else {
            EventStatus::Failed
        };

        self.transition(target)?;
        self.retry_count = retry_count;
        self.failed_at = Some(Utc::now());
        self.failure_reason = Some(reason.into());

        Ok(if exhausted {
            FailureOutcome::DeadLettered { retry_count }
        } else {
            FailureOutcome::Retry { retry_count }
        })
    }

    /// Reset a failed or dead-lettered event for another round of delivery.
    /// Returns the prior status.
    pub fn replay(&mut self) -> DomainResult<EventStatus> {
        match self.status {
            EventStatus::Processed => return Err(DomainError::AlreadyProcessed),
            status if !status.is_replayable() => return Err(DomainError::NotReplayable(status)),
            _ => {}
        }

        let prior = self.transition(EventStatus::Pending)?;
        self.retry_count = 0;
        self.processed_at = None;
        self.failed_at = None;
        self.failure_reason = None;
        self.claimed_at = None;
        Ok(prior)
    }
}

impl Entity for Event {
    type Id = EventId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}
