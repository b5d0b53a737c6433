//! Integration tests for the full pipeline.
//!
//! Tests: Ingest → EventStore → DeliveryChannel → Worker → Coordinator → EventStore,
//! with snapshots flowing Ingest → BatchBuffer → AnalyticsSink.
//!
//! Verifies:
//! - Successful events end PROCESSED, failing ones end DEAD_LETTER after max retries
//! - Replay of a dead-lettered event drives it through delivery again
//! - Buffered rows reach the sink on the final forced flush

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use courier_core::{Event, EventId, EventStatus, NewEvent};
    use courier_events::InMemoryDeliveryChannel;

    use crate::batch::{BatchBuffer, BufferConfig, InMemorySink, RetryPolicy};
    use crate::delivery::{
        DeliveryCoordinator, DeliveryWorker, EventProcessor, ProcessingError, WorkerConfig,
    };
    use crate::event_store::{EventFilter, EventStore, InMemoryEventStore, Pagination};
    use crate::ingest::Ingestor;

    /// Declines payments until switched on.
    #[derive(Debug, Default)]
    struct PaymentGateway {
        accepting: AtomicBool,
    }

    #[async_trait]
    impl EventProcessor for PaymentGateway {
        async fn process(&self, event: &Event) -> Result<(), ProcessingError> {
            if event.event_type.as_str() == "payment.requested"
                && !self.accepting.load(Ordering::SeqCst)
            {
                return Err(ProcessingError::new("card declined"));
            }
            Ok(())
        }
    }

    fn new_event(event_type: &str, n: u32) -> NewEvent {
        NewEvent {
            event_type: event_type.to_string(),
            payload: json!({"n": n}),
            metadata: None,
        }
    }

    async fn wait_for_status(store: &InMemoryEventStore, id: EventId, status: EventStatus) -> Event {
        for _ in 0..300 {
            if let Some(event) = store.get(id).await.unwrap() {
                if event.status == status {
                    return event;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("event {id} never reached {status}");
    }

    #[tokio::test]
    async fn events_flow_from_ingest_to_terminal_states_and_the_sink() {
        let store = Arc::new(InMemoryEventStore::new());
        let channel = Arc::new(InMemoryDeliveryChannel::new());
        let gateway = Arc::new(PaymentGateway::default());
        let buffer = Arc::new(BatchBuffer::new(
            Arc::new(InMemorySink::new()),
            BufferConfig {
                threshold: 4,
                poll: RetryPolicy::fixed(5, Duration::from_millis(1)),
            },
        ));

        let ingestor = Ingestor::new(store.clone(), channel.clone(), buffer.clone());
        let coordinator = Arc::new(
            DeliveryCoordinator::new(store.clone(), channel.clone(), gateway.clone())
                .with_max_retries(3),
        );
        let config = WorkerConfig {
            poll_timeout: Duration::from_millis(20),
            error_backoff: Duration::from_millis(20),
        };
        let workers: Vec<_> = (1..=3)
            .map(|i| DeliveryWorker::spawn(format!("worker-{i}"), coordinator.clone(), config.clone()))
            .collect();

        let mut shipped = Vec::new();
        for n in 0..5 {
            shipped.push(ingestor.ingest(new_event("order.shipped", n)).await.unwrap().id);
        }
        let payment = ingestor.ingest(new_event("payment.requested", 99)).await.unwrap().id;

        for id in &shipped {
            wait_for_status(&store, *id, EventStatus::Processed).await;
        }
        let dead = wait_for_status(&store, payment, EventStatus::DeadLetter).await;
        assert_eq!(dead.retry_count, 3);
        assert_eq!(dead.failure_reason.as_deref(), Some("card declined"));

        let page = store
            .list(
                &EventFilter {
                    status: Some(EventStatus::DeadLetter),
                    event_type: None,
                },
                Pagination::default(),
            )
            .await
            .unwrap();
        assert_eq!(page.total, 1);

        gateway.accepting.store(true, Ordering::SeqCst);
        let replayed = coordinator.replay(payment).await.unwrap();
        assert_eq!(replayed.status, EventStatus::Pending);
        let processed = wait_for_status(&store, payment, EventStatus::Processed).await;
        assert_eq!(processed.retry_count, 0);

        for worker in workers {
            worker.shutdown().await.unwrap();
        }

        // One threshold flush of 4 rows, the remaining 2 on the final flush.
        assert_eq!(buffer.sink().loaded_len(), 4);
        assert_eq!(buffer.flush().await.unwrap().rows, 2);
        assert_eq!(buffer.sink().loaded_len(), 6);
        assert!(buffer.is_empty());

        let counts = store.status_counts().await.unwrap();
        assert_eq!(counts.processed, 6);
        assert_eq!(counts.total(), 6);
    }
}
