use std::sync::Arc;

use anyhow::Context;

use courier_core::{Event, EventId, NewEvent};
use courier_events::InMemoryDeliveryChannel;
use courier_infra::{
    batch::{
        AnalyticsSink, BatchBuffer, BufferStats, FlushError, FlushReport, HttpLoadJobSink,
        InMemorySink,
    },
    config::Config,
    delivery::{
        AcceptAllProcessor, DeliveryCoordinator, DeliveryWorker, EventProcessor, ReplayError,
        WorkerConfig, WorkerHandle,
    },
    event_store::{
        EventFilter, EventPage, EventStore, EventStoreError, InMemoryEventStore, Pagination,
        StatusCounts,
    },
    ingest::{IngestError, Ingestor},
};

#[cfg(feature = "redis")]
use courier_infra::{event_bus::RedisStreamsChannel, event_store::PostgresEventStore};

pub type SharedSink = Arc<dyn AnalyticsSink>;
pub type SharedProcessor = Arc<dyn EventProcessor>;
pub type SharedBuffer = Arc<BatchBuffer<SharedSink>>;

type InMemoryIngestor = Ingestor<Arc<InMemoryEventStore>, Arc<InMemoryDeliveryChannel>, SharedSink>;
type InMemoryCoordinator =
    DeliveryCoordinator<Arc<InMemoryEventStore>, Arc<InMemoryDeliveryChannel>, SharedProcessor>;

#[cfg(feature = "redis")]
type PersistentIngestor = Ingestor<Arc<PostgresEventStore>, RedisStreamsChannel, SharedSink>;
#[cfg(feature = "redis")]
type PersistentCoordinator =
    DeliveryCoordinator<Arc<PostgresEventStore>, RedisStreamsChannel, SharedProcessor>;

#[derive(Clone)]
pub enum AppServices {
    InMemory {
        ingestor: Arc<InMemoryIngestor>,
        coordinator: Arc<InMemoryCoordinator>,
        buffer: SharedBuffer,
    },
    #[cfg(feature = "redis")]
    Persistent {
        ingestor: Arc<PersistentIngestor>,
        coordinator: Arc<PersistentCoordinator>,
        buffer: SharedBuffer,
    },
}

/// Summary served by `GET /metrics`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Metrics {
    pub events: StatusCounts,
    pub buffer: BufferStats,
}

/// Wire services from configuration, falling back to in-memory stores when
/// persistence is not requested (or not compiled in).
pub async fn build_services(config: &Config) -> anyhow::Result<AppServices> {
    let buffer = Arc::new(BatchBuffer::new(build_sink(config)?, config.buffer_config()));
    let processor: SharedProcessor = Arc::new(AcceptAllProcessor);

    if config.use_persistent_stores {
        #[cfg(feature = "redis")]
        {
            return build_persistent_services(config, processor, buffer).await;
        }
        #[cfg(not(feature = "redis"))]
        {
            tracing::warn!(
                "USE_PERSISTENT_STORES=true but redis feature not enabled, falling back to in-memory"
            );
        }
    }

    Ok(build_in_memory_services(config, processor, buffer))
}

fn build_sink(config: &Config) -> anyhow::Result<SharedSink> {
    match &config.sink_url {
        Some(url) => {
            tracing::info!(sink_url = %url, table = %config.sink_table, "using HTTP load-job sink");
            let sink = HttpLoadJobSink::new(url.clone(), config.sink_table.clone())
                .context("failed to build HTTP sink")?;
            Ok(Arc::new(sink))
        }
        None => {
            tracing::info!("COURIER_SINK_URL not set; analytics rows stay in memory");
            Ok(Arc::new(InMemorySink::new()))
        }
    }
}

/// In-memory wiring (dev/test): store + leased channel.
pub fn build_in_memory_services(
    config: &Config,
    processor: SharedProcessor,
    buffer: SharedBuffer,
) -> AppServices {
    let store = Arc::new(InMemoryEventStore::new());
    let channel = Arc::new(InMemoryDeliveryChannel::with_lease_timeout(config.lease_timeout));

    let ingestor = Arc::new(Ingestor::new(store.clone(), channel.clone(), buffer.clone()));
    let coordinator = Arc::new(
        DeliveryCoordinator::new(store, channel, processor)
            .with_max_retries(config.max_retries)
            .with_lease_timeout(config.lease_timeout),
    );

    AppServices::InMemory {
        ingestor,
        coordinator,
        buffer,
    }
}

#[cfg(feature = "redis")]
async fn build_persistent_services(
    config: &Config,
    processor: SharedProcessor,
    buffer: SharedBuffer,
) -> anyhow::Result<AppServices> {
    let database_url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL must be set when USE_PERSISTENT_STORES=true")?;

    let store = Arc::new(
        PostgresEventStore::connect(database_url)
            .await
            .context("failed to connect to Postgres")?,
    );
    let channel = RedisStreamsChannel::connect(
        &config.redis_url,
        config.stream_key.clone(),
        config.consumer_group.clone(),
        config.lease_timeout,
    )
    .await
    .context("failed to connect to Redis")?;

    tracing::info!(
        stream_key = %config.stream_key,
        group = %config.consumer_group,
        "using Postgres event store and Redis Streams channel"
    );

    let ingestor = Arc::new(Ingestor::new(store.clone(), channel.clone(), buffer.clone()));
    let coordinator = Arc::new(
        DeliveryCoordinator::new(store, channel, processor)
            .with_max_retries(config.max_retries)
            .with_lease_timeout(config.lease_timeout),
    );

    Ok(AppServices::Persistent {
        ingestor,
        coordinator,
        buffer,
    })
}

impl AppServices {
    pub fn buffer(&self) -> &SharedBuffer {
        match self {
            AppServices::InMemory { buffer, .. } => buffer,
            #[cfg(feature = "redis")]
            AppServices::Persistent { buffer, .. } => buffer,
        }
    }

    pub async fn ingest(&self, new_event: NewEvent) -> Result<Event, IngestError> {
        match self {
            AppServices::InMemory { ingestor, .. } => ingestor.ingest(new_event).await,
            #[cfg(feature = "redis")]
            AppServices::Persistent { ingestor, .. } => ingestor.ingest(new_event).await,
        }
    }

    pub async fn get_event(&self, id: EventId) -> Result<Option<Event>, EventStoreError> {
        match self {
            AppServices::InMemory { ingestor, .. } => ingestor.store().get(id).await,
            #[cfg(feature = "redis")]
            AppServices::Persistent { ingestor, .. } => ingestor.store().get(id).await,
        }
    }

    pub async fn list_events(
        &self,
        filter: EventFilter,
        pagination: Pagination,
    ) -> Result<EventPage, EventStoreError> {
        match self {
            AppServices::InMemory { ingestor, .. } => {
                ingestor.store().list(&filter, pagination).await
            }
            #[cfg(feature = "redis")]
            AppServices::Persistent { ingestor, .. } => {
                ingestor.store().list(&filter, pagination).await
            }
        }
    }

    pub async fn replay(&self, id: EventId) -> Result<Event, ReplayError> {
        match self {
            AppServices::InMemory { coordinator, .. } => coordinator.replay(id).await,
            #[cfg(feature = "redis")]
            AppServices::Persistent { coordinator, .. } => coordinator.replay(id).await,
        }
    }

    pub async fn requeue(&self, id: EventId) -> Result<Event, ReplayError> {
        match self {
            AppServices::InMemory { coordinator, .. } => coordinator.requeue(id).await,
            #[cfg(feature = "redis")]
            AppServices::Persistent { coordinator, .. } => coordinator.requeue(id).await,
        }
    }

    pub async fn metrics(&self) -> Result<Metrics, EventStoreError> {
        let events = match self {
            AppServices::InMemory { ingestor, .. } => ingestor.store().status_counts().await?,
            #[cfg(feature = "redis")]
            AppServices::Persistent { ingestor, .. } => ingestor.store().status_counts().await?,
        };
        Ok(Metrics {
            events,
            buffer: self.buffer().stats(),
        })
    }

    /// Start `count` delivery workers named `worker-1..=count`.
    pub fn spawn_workers(&self, count: usize, config: WorkerConfig) -> Vec<WorkerHandle> {
        (1..=count)
            .map(|i| {
                let name = format!("worker-{i}");
                match self {
                    AppServices::InMemory { coordinator, .. } => {
                        DeliveryWorker::spawn(name, coordinator.clone(), config.clone())
                    }
                    #[cfg(feature = "redis")]
                    AppServices::Persistent { coordinator, .. } => {
                        DeliveryWorker::spawn(name, coordinator.clone(), config.clone())
                    }
                }
            })
            .collect()
    }

    /// Forced flush of everything buffered. Used on shutdown.
    pub async fn flush_buffer(&self) -> Result<FlushReport, FlushError> {
        self.buffer().flush().await
    }
}
