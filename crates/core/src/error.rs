//! Domain error model.

use thiserror::Error;

use crate::event::EventStatus;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic failures (validation, illegal status
/// transitions). Storage and transport concerns belong to `courier-infra`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// The requested status transition is not an edge of the state machine.
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: EventStatus, to: EventStatus },

    /// Replay was requested for an event that already succeeded.
    #[error("event already processed")]
    AlreadyProcessed,

    /// Replay was requested for an event that is neither failed nor dead-lettered.
    #[error("event in status {0} cannot be replayed")]
    NotReplayable(EventStatus),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn invalid_transition(from: EventStatus, to: EventStatus) -> Self {
        Self::InvalidTransition { from, to }
    }
}
