//! Infrastructure layer: event store, delivery channels, delivery workers,
//! analytics batching, ingestion, config.

pub mod batch;
pub mod config;
pub mod delivery;
pub mod event_bus;
pub mod event_store;
pub mod ingest;

#[cfg(test)]
mod integration_tests;
