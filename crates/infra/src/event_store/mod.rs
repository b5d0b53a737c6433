//! Event store boundary: the durable record of every event and its status.

pub mod in_memory;
pub mod postgres;
pub mod query;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;
pub use query::{EventFilter, EventPage, Pagination, StatusCounts};
pub use r#trait::{EventStore, EventStoreError};
