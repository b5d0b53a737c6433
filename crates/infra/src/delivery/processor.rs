//! The pluggable processing step run for each delivered event.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use courier_core::Event;

/// A failed processing attempt. The message becomes the event's `failure_reason`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ProcessingError {
    message: String,
}

impl ProcessingError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Business logic triggered by an event.
///
/// Delivery is at-least-once: implementations must tolerate seeing the same
/// event more than once.
#[async_trait]
pub trait EventProcessor: Send + Sync {
    async fn process(&self, event: &Event) -> Result<(), ProcessingError>;
}

#[async_trait]
impl<P> EventProcessor for Arc<P>
where
    P: EventProcessor + ?Sized,
{
    async fn process(&self, event: &Event) -> Result<(), ProcessingError> {
        (**self).process(event).await
    }
}

/// Processor that succeeds for every event. Default wiring when no business
/// logic is plugged in.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAllProcessor;

#[async_trait]
impl EventProcessor for AcceptAllProcessor {
    async fn process(&self, event: &Event) -> Result<(), ProcessingError> {
        debug!(event_id = %event.id, event_type = %event.event_type, "event accepted");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    /// Fails the first `fail_first` calls, then succeeds.
    #[derive(Debug, Default)]
    pub(crate) struct ScriptedProcessor {
        fail_first: u32,
        calls: AtomicU32,
    }

    impl ScriptedProcessor {
        pub(crate) fn succeeding() -> Self {
            Self::failing_first(0)
        }

        pub(crate) fn failing_first(fail_first: u32) -> Self {
            Self {
                fail_first,
                calls: AtomicU32::new(0),
            }
        }

        pub(crate) fn always_failing() -> Self {
            Self::failing_first(u32::MAX)
        }

        pub(crate) fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EventProcessor for ScriptedProcessor {
        async fn process(&self, _event: &Event) -> Result<(), ProcessingError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.fail_first {
                Err(ProcessingError::new(format!("attempt {call} failed")))
            } else {
                Ok(())
            }
        }
    }
}
