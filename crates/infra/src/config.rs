//! Runtime configuration parsed from environment variables.

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use courier_core::DEFAULT_MAX_RETRIES;

use crate::batch::{BackoffStrategy, BufferConfig, DEFAULT_THRESHOLD, RetryPolicy};
use crate::event_bus::{DEFAULT_CONSUMER_GROUP, DEFAULT_STREAM_KEY};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{key} is invalid: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub bind_addr: SocketAddr,
    /// Postgres + Redis instead of the in-memory store and channel.
    pub use_persistent_stores: bool,
    pub database_url: Option<String>,
    pub redis_url: String,
    pub stream_key: String,
    pub consumer_group: String,
    pub max_retries: u32,
    pub lease_timeout: Duration,
    pub workers: usize,
    pub batch_threshold: usize,
    pub load_poll: RetryPolicy,
    /// Base URL of the load-job sink; the in-memory sink is used when unset.
    pub sink_url: Option<String>,
    pub sink_table: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Parse from any key lookup; empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let use_persistent_stores = parse(&get, "USE_PERSISTENT_STORES", false)?;
        let database_url = get("DATABASE_URL");
        if use_persistent_stores && database_url.is_none() {
            return Err(ConfigError::Missing("DATABASE_URL"));
        }

        let poll_interval = Duration::from_millis(parse(&get, "COURIER_LOAD_POLL_INTERVAL_MS", 1000)?);
        let poll_attempts = at_least_one(&get, "COURIER_LOAD_POLL_ATTEMPTS", 120)?;
        let load_poll = match parse(&get, "COURIER_LOAD_POLL_BACKOFF", BackoffStrategy::Fixed)? {
            BackoffStrategy::Fixed => RetryPolicy::fixed(poll_attempts, poll_interval),
            BackoffStrategy::Exponential => RetryPolicy::exponential(
                poll_attempts,
                poll_interval,
                Duration::from_millis(parse(&get, "COURIER_LOAD_POLL_MAX_INTERVAL_MS", 30_000)?),
            ),
        };

        Ok(Self {
            bind_addr: parse(&get, "COURIER_BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080)))?,
            use_persistent_stores,
            database_url,
            redis_url: get("REDIS_URL").unwrap_or_else(|| "redis://localhost:6379".to_string()),
            stream_key: get("COURIER_STREAM_KEY").unwrap_or_else(|| DEFAULT_STREAM_KEY.to_string()),
            consumer_group: get("COURIER_CONSUMER_GROUP")
                .unwrap_or_else(|| DEFAULT_CONSUMER_GROUP.to_string()),
            max_retries: at_least_one(&get, "COURIER_MAX_RETRIES", DEFAULT_MAX_RETRIES)?,
            lease_timeout: Duration::from_millis(at_least_one(
                &get,
                "COURIER_LEASE_TIMEOUT_MS",
                30_000,
            )?),
            workers: at_least_one(&get, "COURIER_WORKERS", 2)?,
            batch_threshold: at_least_one(&get, "COURIER_BATCH_THRESHOLD", DEFAULT_THRESHOLD)?,
            load_poll,
            sink_url: get("COURIER_SINK_URL"),
            sink_table: get("COURIER_SINK_TABLE").unwrap_or_else(|| "events".to_string()),
        })
    }

    pub fn buffer_config(&self) -> BufferConfig {
        BufferConfig {
            threshold: self.batch_threshold,
            poll: self.load_poll.clone(),
        }
    }
}

fn parse<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: format!("{raw:?}: {e}"),
        }),
    }
}

fn at_least_one<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + From<u8>,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    let value = parse(get, key, default)?;
    if value < T::from(1) {
        return Err(ConfigError::Invalid {
            key,
            reason: "must be at least 1".to_string(),
        });
    }
    Ok(value)
}
