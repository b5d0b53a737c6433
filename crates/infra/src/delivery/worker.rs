use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use courier_events::{DeliveryChannel, Subscription};

use crate::event_store::EventStore;

use super::coordinator::{DeliveryCoordinator, DeliveryError, DeliveryOutcome};
use super::processor::EventProcessor;

/// Delivery worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How long one receive waits before re-checking for shutdown.
    pub poll_timeout: Duration,
    /// Pause after a failed receive.
    pub error_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(500),
            error_backoff: Duration::from_secs(1),
        }
    }
}

/// Per-worker counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub received: u64,
    pub processed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    /// Malformed messages and unknown event ids.
    pub dropped: u64,
    /// Duplicate deliveries, deliveries left for a live owner, and lost
    /// compare-and-sets.
    pub duplicates: u64,
}

impl WorkerStats {
    fn record(&mut self, outcome: &DeliveryOutcome) {
        match outcome {
            DeliveryOutcome::Processed(_) => self.processed += 1,
            DeliveryOutcome::Retrying { .. } => self.retried += 1,
            DeliveryOutcome::DeadLettered { .. } => self.dead_lettered += 1,
            DeliveryOutcome::Malformed | DeliveryOutcome::UnknownEvent(_) => self.dropped += 1,
            DeliveryOutcome::Duplicate { .. }
            | DeliveryOutcome::InFlight(_)
            | DeliveryOutcome::Superseded { .. } => self.duplicates += 1,
        }
    }
}

#[derive(Debug, Error)]
pub enum WorkerError {
    /// The worker stopped on a fatal delivery error.
    #[error("worker {worker} stopped: {source}")]
    Delivery {
        worker: String,
        #[source]
        source: DeliveryError,
    },

    #[error("worker {worker} panicked: {message}")]
    Panicked { worker: String, message: String },
}

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    shutdown: watch::Sender<bool>,
    join: JoinHandle<Result<WorkerStats, WorkerError>>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True once the worker loop has exited (shutdown or fatal error).
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Request graceful shutdown and wait for the worker to stop.
    ///
    /// A delivery in progress completes before the worker exits.
    pub async fn shutdown(self) -> Result<WorkerStats, WorkerError> {
        let _ = self.shutdown.send(true);
        match self.join.await {
            Ok(result) => result,
            Err(join_err) => Err(WorkerError::Panicked {
                worker: self.name,
                message: join_err.to_string(),
            }),
        }
    }
}

/// Delivery worker loop.
///
/// - Receives from the coordinator's channel under its own consumer name
/// - Hands every delivery to the coordinator (which acks/nacks)
/// - Stops on shutdown, or on a store failure (fail fast)
#[derive(Debug)]
pub struct DeliveryWorker;

impl DeliveryWorker {
    pub fn spawn<S, C, P>(
        name: impl Into<String>,
        coordinator: Arc<DeliveryCoordinator<S, C, P>>,
        config: WorkerConfig,
    ) -> WorkerHandle
    where
        S: EventStore + 'static,
        C: DeliveryChannel + Clone + 'static,
        P: EventProcessor + 'static,
    {
        let name = name.into();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let subscription = Subscription::new(coordinator.channel().clone(), name.clone());

        let join = tokio::spawn(worker_loop(
            name.clone(),
            coordinator,
            subscription,
            shutdown_rx,
            config,
        ));

        WorkerHandle {
            name,
            shutdown: shutdown_tx,
            join,
        }
    }
}

async fn worker_loop<S, C, P>(
    name: String,
    coordinator: Arc<DeliveryCoordinator<S, C, P>>,
    subscription: Subscription<C>,
    mut shutdown_rx: watch::Receiver<bool>,
    config: WorkerConfig,
) -> Result<WorkerStats, WorkerError>
where
    S: EventStore,
    C: DeliveryChannel,
    P: EventProcessor,
{
    let mut stats = WorkerStats::default();
    info!(worker = %name, "delivery worker started");

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let received = tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break,
            received = subscription.recv_timeout(config.poll_timeout) => received,
        };

        let delivery = match received {
            Ok(Some(delivery)) => delivery,
            Ok(None) => continue,
            Err(err) => {
                warn!(worker = %name, error = %err, "receive failed");
                tokio::time::sleep(config.error_backoff).await;
                continue;
            }
        };

        stats.received += 1;
        match coordinator.deliver(&delivery).await {
            Ok(outcome) => stats.record(&outcome),
            // The outcome is persisted; the message is redelivered after its lease.
            Err(DeliveryError::Channel(err)) => {
                warn!(worker = %name, message_id = %delivery.message_id, error = %err, "settle failed");
            }
            Err(source) => {
                error!(worker = %name, error = %source, "delivery worker stopping on fatal error");
                return Err(WorkerError::Delivery {
                    worker: name,
                    source,
                });
            }
        }
    }

    info!(worker = %name, ?stats, "delivery worker stopped");
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::{Event, EventId, EventStatus, NewEvent};
    use courier_events::InMemoryDeliveryChannel;
    use serde_json::json;

    use crate::delivery::processor::test_support::ScriptedProcessor;
    use crate::event_store::InMemoryEventStore;
    use crate::event_store::test_support::BrokenWrites;

    fn config() -> WorkerConfig {
        WorkerConfig {
            poll_timeout: Duration::from_millis(20),
            error_backoff: Duration::from_millis(20),
        }
    }

    async fn ingest<S: EventStore>(store: &S, channel: &InMemoryDeliveryChannel) -> EventId {
        let event = Event::create(NewEvent {
            event_type: "invoice.sent".to_string(),
            payload: json!({"invoice": 7}),
            metadata: None,
        })
        .unwrap();
        store.insert(&event).await.unwrap();
        channel.publish(event.id).await.unwrap();
        event.id
    }

    async fn wait_for_status<S: EventStore>(store: &S, id: EventId, status: EventStatus) {
        for _ in 0..200 {
            if store.get(id).await.unwrap().map(|e| e.status) == Some(status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("event {id} never reached {status}");
    }

    #[tokio::test]
    async fn workers_drive_events_to_terminal_states() {
        let store = Arc::new(InMemoryEventStore::new());
        let channel = Arc::new(InMemoryDeliveryChannel::new());
        let coordinator = Arc::new(
            DeliveryCoordinator::new(
                store.clone(),
                channel.clone(),
                Arc::new(ScriptedProcessor::failing_first(1)),
            )
            .with_max_retries(3),
        );

        let workers: Vec<_> = (1..=2)
            .map(|i| DeliveryWorker::spawn(format!("worker-{i}"), coordinator.clone(), config()))
            .collect();

        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(ingest(&store, &channel).await);
        }
        for id in &ids {
            wait_for_status(&store, *id, EventStatus::Processed).await;
        }

        let mut total = WorkerStats::default();
        for worker in workers {
            let stats = worker.shutdown().await.unwrap();
            total.received += stats.received;
            total.processed += stats.processed;
            total.retried += stats.retried;
        }
        assert_eq!(total.processed, 5);
        assert_eq!(total.retried, 1);
        assert_eq!(total.received, 6);
    }

    #[tokio::test]
    async fn worker_stops_on_store_failure() {
        let store = Arc::new(BrokenWrites::default());
        let channel = Arc::new(InMemoryDeliveryChannel::new());
        let coordinator = Arc::new(DeliveryCoordinator::new(
            store.clone(),
            channel.clone(),
            Arc::new(ScriptedProcessor::succeeding()),
        ));

        let worker = DeliveryWorker::spawn("worker-1", coordinator, config());
        ingest(&store, &channel).await;

        for _ in 0..200 {
            if worker.is_finished() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(worker.is_finished());
        assert!(matches!(
            worker.shutdown().await,
            Err(WorkerError::Delivery {
                source: DeliveryError::Store(_),
                ..
            })
        ));
    }

    #[tokio::test]
    async fn idle_worker_shuts_down_promptly() {
        let coordinator = Arc::new(DeliveryCoordinator::new(
            Arc::new(InMemoryEventStore::new()),
            Arc::new(InMemoryDeliveryChannel::new()),
            Arc::new(ScriptedProcessor::succeeding()),
        ));
        let worker = DeliveryWorker::spawn(
            "idle",
            coordinator,
            WorkerConfig {
                poll_timeout: Duration::from_secs(30),
                ..config()
            },
        );

        let stats = tokio::time::timeout(Duration::from_secs(2), worker.shutdown())
            .await
            .expect("shutdown should not wait for the poll timeout")
            .unwrap();
        assert_eq!(stats, WorkerStats::default());
    }
}
