use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use courier_core::{Event, EventId, Revision};

use super::query::{EventFilter, EventPage, Pagination, StatusCounts};
use super::r#trait::{EventStore, EventStoreError};

/// In-memory event store.
///
/// Intended for tests/dev. Not optimized for performance.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    events: RwLock<HashMap<EventId, Event>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> EventStoreError {
    EventStoreError::storage("lock poisoned")
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn insert(&self, event: &Event) -> Result<(), EventStoreError> {
        let mut events = self.events.write().map_err(|_| poisoned())?;
        if events.contains_key(&event.id) {
            return Err(EventStoreError::Duplicate(event.id));
        }
        events.insert(event.id, event.clone());
        Ok(())
    }

    async fn get(&self, id: EventId) -> Result<Option<Event>, EventStoreError> {
        let events = self.events.read().map_err(|_| poisoned())?;
        Ok(events.get(&id).cloned())
    }

    async fn compare_and_set(
        &self,
        event: &Event,
        expected: Revision,
    ) -> Result<(), EventStoreError> {
        let mut events = self.events.write().map_err(|_| poisoned())?;
        let stored = events
            .get_mut(&event.id)
            .ok_or(EventStoreError::NotFound(event.id))?;

        if stored.revision() != expected {
            return Err(EventStoreError::Conflict {
                id: event.id,
                expected: expected.status,
                actual: stored.status,
            });
        }

        *stored = event.clone();
        Ok(())
    }

    async fn list(
        &self,
        filter: &EventFilter,
        pagination: Pagination,
    ) -> Result<EventPage, EventStoreError> {
        let events = self.events.read().map_err(|_| poisoned())?;

        let mut matching: Vec<&Event> = events.values().filter(|e| filter.matches(e)).collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let total = matching.len() as u64;
        let page = matching
            .into_iter()
            .skip(pagination.offset as usize)
            .take(pagination.limit as usize)
            .cloned()
            .collect();

        Ok(EventPage::new(page, total, pagination))
    }

    async fn status_counts(&self) -> Result<StatusCounts, EventStoreError> {
        let events = self.events.read().map_err(|_| poisoned())?;
        let mut counts = StatusCounts::default();
        for event in events.values() {
            counts.add(event.status, 1);
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::{EventStatus, NewEvent};
    use serde_json::json;

    fn event(event_type: &str) -> Event {
        Event::create(NewEvent {
            event_type: event_type.to_string(),
            payload: json!({}),
            metadata: None,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn insert_rejects_duplicates() {
        let store = InMemoryEventStore::new();
        let e = event("a");
        store.insert(&e).await.unwrap();
        assert!(matches!(
            store.insert(&e).await,
            Err(EventStoreError::Duplicate(id)) if id == e.id
        ));
        assert_eq!(store.get(e.id).await.unwrap(), Some(e));
    }

    #[tokio::test]
    async fn compare_and_set_checks_expected_status() {
        let store = InMemoryEventStore::new();
        let mut e = event("a");
        store.insert(&e).await.unwrap();

        let pending = e.revision();
        e.begin_processing().unwrap();
        store.compare_and_set(&e, pending).await.unwrap();

        // A second writer still believing the event is PENDING loses.
        let err = store.compare_and_set(&e, pending).await.unwrap_err();
        assert!(matches!(
            err,
            EventStoreError::Conflict {
                actual: EventStatus::Processing,
                ..
            }
        ));

        let missing = event("b");
        assert!(matches!(
            store.compare_and_set(&missing, missing.revision()).await,
            Err(EventStoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn compare_and_set_tells_processing_claims_apart() {
        let store = InMemoryEventStore::new();
        let mut e = event("a");
        store.insert(&e).await.unwrap();

        let pending = e.revision();
        e.begin_processing().unwrap();
        store.compare_and_set(&e, pending).await.unwrap();
        let first_claim = e.revision();

        let mut taken_over = e.clone();
        std::thread::sleep(std::time::Duration::from_millis(2));
        taken_over.begin_processing().unwrap();
        store.compare_and_set(&taken_over, first_claim).await.unwrap();

        // The original owner's completion carries the old claim and loses.
        e.mark_processed().unwrap();
        let err = store.compare_and_set(&e, first_claim).await.unwrap_err();
        assert!(matches!(
            err,
            EventStoreError::Conflict {
                expected: EventStatus::Processing,
                actual: EventStatus::Processing,
                ..
            }
        ));
        assert_eq!(
            store.get(e.id).await.unwrap().unwrap().status,
            EventStatus::Processing
        );
    }

    #[tokio::test]
    async fn list_filters_and_paginates_newest_first() {
        let store = InMemoryEventStore::new();
        let mut ids = Vec::new();
        for i in 0..5 {
            let e = event(if i % 2 == 0 { "even" } else { "odd" });
            ids.push(e.id);
            store.insert(&e).await.unwrap();
        }

        let filter = EventFilter {
            event_type: Some("even".to_string()),
            ..Default::default()
        };
        let page = store
            .list(&filter, Pagination::new(Some(2), None))
            .await
            .unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.events.len(), 2);
        assert!(page.has_more);
        assert_eq!(page.events[0].id, ids[4]);

        let counts = store.status_counts().await.unwrap();
        assert_eq!(counts.pending, 5);
        assert_eq!(counts.total(), 5);
    }
}
