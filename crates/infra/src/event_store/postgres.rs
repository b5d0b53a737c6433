//! Postgres-backed event store implementation.
//!
//! ## Error Mapping
//!
//! SQLx errors are mapped to `EventStoreError` as follows:
//!
//! | SQLx Error | PostgreSQL Error Code | EventStoreError | Scenario |
//! |------------|----------------------|-----------------|----------|
//! | Database (unique violation) | `23505` | `Duplicate` | Insert of an existing event id |
//! | Database (check constraint violation) | `23514` | `Storage` | Invalid data (e.g., negative retry_count) |
//! | Database (other) | Any other | `Storage` | Other database errors |
//! | PoolClosed | N/A | `Storage` | Connection pool was closed |
//! | Other | N/A | `Storage` | Network errors, connection failures, etc. |
//!
//! Compare-and-set is a single `UPDATE ... WHERE id = $1 AND status = $expected
//! AND claimed_at IS NOT DISTINCT FROM $claim`; when it touches no row, a
//! follow-up read tells `NotFound` from `Conflict`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;

use courier_core::{Event, EventId, EventMetadata, EventStatus, EventType, Revision};

use super::query::{EventFilter, EventPage, Pagination, StatusCounts};
use super::r#trait::{EventStore, EventStoreError};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS events (
        id UUID PRIMARY KEY,
        event_type TEXT NOT NULL,
        payload JSONB NOT NULL,
        metadata JSONB,
        status TEXT NOT NULL,
        retry_count INTEGER NOT NULL DEFAULT 0 CHECK (retry_count >= 0),
        created_at TIMESTAMPTZ NOT NULL,
        processed_at TIMESTAMPTZ,
        failed_at TIMESTAMPTZ,
        failure_reason TEXT,
        claimed_at TIMESTAMPTZ
    )
    "#,
    "ALTER TABLE events ADD COLUMN IF NOT EXISTS claimed_at TIMESTAMPTZ",
    "CREATE INDEX IF NOT EXISTS events_status_idx ON events (status)",
    "CREATE INDEX IF NOT EXISTS events_created_at_idx ON events (created_at DESC, id DESC)",
];

const SELECT_COLUMNS: &str = "id, event_type, payload, metadata, status, retry_count, \
     created_at, processed_at, failed_at, failure_reason, claimed_at";

/// Postgres-backed event store.
///
/// Uses SQLx connection pool which is thread-safe (Arc + Send + Sync).
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool: Arc<PgPool>,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Connect and make sure the `events` table exists.
    pub async fn connect(database_url: &str) -> Result<Self, EventStoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        let store = Self::new(pool);
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Create the table and indexes if missing. Idempotent.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), EventStoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }

    async fn current_status(&self, id: EventId) -> Result<Option<EventStatus>, EventStoreError> {
        let row = sqlx::query("SELECT status FROM events WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("current_status", e))?;

        row.map(|row| {
            let status: String = row
                .try_get("status")
                .map_err(|e| EventStoreError::storage(format!("failed to read status: {e}")))?;
            parse_status(&status)
        })
        .transpose()
    }
}

#[async_trait]
impl EventStore for PostgresEventStore {
    #[instrument(skip(self, event), fields(event_id = %event.id), err)]
    async fn insert(&self, event: &Event) -> Result<(), EventStoreError> {
        let metadata = metadata_to_json(event)?;

        sqlx::query(
            r#"
            INSERT INTO events (
                id,
                event_type,
                payload,
                metadata,
                status,
                retry_count,
                created_at,
                processed_at,
                failed_at,
                failure_reason,
                claimed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(event.id.as_uuid())
        .bind(event.event_type.as_str())
        .bind(&event.payload)
        .bind(metadata)
        .bind(event.status.as_str())
        .bind(event.retry_count as i32)
        .bind(event.created_at)
        .bind(event.processed_at)
        .bind(event.failed_at)
        .bind(event.failure_reason.as_deref())
        .bind(event.claimed_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                EventStoreError::Duplicate(event.id)
            } else {
                map_sqlx_error("insert_event", e)
            }
        })?;

        Ok(())
    }

    #[instrument(skip(self), fields(event_id = %id), err)]
    async fn get(&self, id: EventId) -> Result<Option<Event>, EventStoreError> {
        let row = sqlx::query(&format!("SELECT {SELECT_COLUMNS} FROM events WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_event", e))?;

        row.map(|row| decode_event(&row)).transpose()
    }

    #[instrument(
        skip(self, event),
        fields(event_id = %event.id, expected = %expected.status, next = %event.status),
        err
    )]
    async fn compare_and_set(
        &self,
        event: &Event,
        expected: Revision,
    ) -> Result<(), EventStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE events
            SET status = $2,
                retry_count = $3,
                processed_at = $4,
                failed_at = $5,
                failure_reason = $6,
                claimed_at = $7
            WHERE id = $1 AND status = $8 AND claimed_at IS NOT DISTINCT FROM $9
            "#,
        )
        .bind(event.id.as_uuid())
        .bind(event.status.as_str())
        .bind(event.retry_count as i32)
        .bind(event.processed_at)
        .bind(event.failed_at)
        .bind(event.failure_reason.as_deref())
        .bind(event.claimed_at)
        .bind(expected.status.as_str())
        .bind(expected.claimed_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("compare_and_set", e))?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        match self.current_status(event.id).await? {
            None => Err(EventStoreError::NotFound(event.id)),
            Some(actual) => Err(EventStoreError::Conflict {
                id: event.id,
                expected: expected.status,
                actual,
            }),
        }
    }

    #[instrument(skip(self), err)]
    async fn list(
        &self,
        filter: &EventFilter,
        pagination: Pagination,
    ) -> Result<EventPage, EventStoreError> {
        let status_param: Option<&str> = filter.status.as_ref().map(EventStatus::as_str);
        let type_param: Option<&str> = filter.event_type.as_deref();

        let count_row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total
            FROM events
            WHERE ($1::text IS NULL OR status = $1)
                AND ($2::text IS NULL OR event_type = $2)
            "#,
        )
        .bind(status_param)
        .bind(type_param)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("count_events", e))?;

        let total: i64 = count_row
            .try_get("total")
            .map_err(|e| EventStoreError::storage(format!("failed to read count: {e}")))?;

        let rows = sqlx::query(&format!(
            r#"
            SELECT {SELECT_COLUMNS}
            FROM events
            WHERE ($1::text IS NULL OR status = $1)
                AND ($2::text IS NULL OR event_type = $2)
            ORDER BY created_at DESC, id DESC
            LIMIT $3 OFFSET $4
            "#
        ))
        .bind(status_param)
        .bind(type_param)
        .bind(i64::from(pagination.limit))
        .bind(i64::from(pagination.offset))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_events", e))?;

        let events = rows
            .iter()
            .map(decode_event)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(EventPage::new(events, total.max(0) as u64, pagination))
    }

    #[instrument(skip(self), err)]
    async fn status_counts(&self) -> Result<StatusCounts, EventStoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM events GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("status_counts", e))?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| EventStoreError::storage(format!("failed to read status: {e}")))?;
            let n: i64 = row
                .try_get("n")
                .map_err(|e| EventStoreError::storage(format!("failed to read count: {e}")))?;
            counts.add(parse_status(&status)?, n.max(0) as u64);
        }
        Ok(counts)
    }
}

fn metadata_to_json(event: &Event) -> Result<Option<serde_json::Value>, EventStoreError> {
    event
        .metadata
        .as_ref()
        .map(serde_json::to_value)
        .transpose()
        .map_err(|e| EventStoreError::storage(format!("metadata serialization failed: {e}")))
}

fn parse_status(value: &str) -> Result<EventStatus, EventStoreError> {
    value
        .parse()
        .map_err(|e| EventStoreError::storage(format!("bad status column: {e}")))
}

fn decode_event(row: &sqlx::postgres::PgRow) -> Result<Event, EventStoreError> {
    EventRow::from_row(row)
        .map_err(|e| EventStoreError::storage(format!("failed to deserialize event row: {e}")))?
        .try_into()
}

/// Map SQLx errors to EventStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EventStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // Unique violation on a path that is not an insert.
                Some("23505") => EventStoreError::Storage(format!("unique violation: {msg}")),
                _ => EventStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            EventStoreError::storage(format!("connection pool closed in {operation}"))
        }
        _ => EventStoreError::storage(format!("sqlx error in {operation}: {err}")),
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

// SQLx row types

#[derive(Debug)]
struct EventRow {
    id: uuid::Uuid,
    event_type: String,
    payload: serde_json::Value,
    metadata: Option<serde_json::Value>,
    status: String,
    retry_count: i32,
    created_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
    failure_reason: Option<String>,
    claimed_at: Option<DateTime<Utc>>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for EventRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(EventRow {
            id: row.try_get("id")?,
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
            metadata: row.try_get("metadata")?,
            status: row.try_get("status")?,
            retry_count: row.try_get("retry_count")?,
            created_at: row.try_get("created_at")?,
            processed_at: row.try_get("processed_at")?,
            failed_at: row.try_get("failed_at")?,
            failure_reason: row.try_get("failure_reason")?,
            claimed_at: row.try_get("claimed_at")?,
        })
    }
}

impl TryFrom<EventRow> for Event {
    type Error = EventStoreError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        let event_type = EventType::parse(row.event_type)
            .map_err(|e| EventStoreError::storage(format!("bad event_type column: {e}")))?;
        let metadata = row
            .metadata
            .map(serde_json::from_value::<EventMetadata>)
            .transpose()
            .map_err(|e| EventStoreError::storage(format!("bad metadata column: {e}")))?;

        Ok(Event {
            id: EventId::from_uuid(row.id),
            event_type,
            payload: row.payload,
            metadata,
            status: parse_status(&row.status)?,
            retry_count: u32::try_from(row.retry_count).unwrap_or(0),
            created_at: row.created_at,
            processed_at: row.processed_at,
            failed_at: row.failed_at,
            failure_reason: row.failure_reason,
            claimed_at: row.claimed_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(status: &str) -> EventRow {
        EventRow {
            id: uuid::Uuid::now_v7(),
            event_type: "order.created".to_string(),
            payload: json!({"n": 1}),
            metadata: Some(json!({"source": "api", "tenant": "acme"})),
            status: status.to_string(),
            retry_count: 2,
            created_at: Utc::now(),
            processed_at: None,
            failed_at: Some(Utc::now()),
            failure_reason: Some("timeout".to_string()),
            claimed_at: None,
        }
    }

    #[test]
    fn decodes_row_into_event() {
        let event: Event = row("FAILED").try_into().unwrap();
        assert_eq!(event.status, EventStatus::Failed);
        assert_eq!(event.retry_count, 2);
        let metadata = event.metadata.unwrap();
        assert_eq!(metadata.source.as_deref(), Some("api"));
        assert_eq!(metadata.extra.get("tenant"), Some(&json!("acme")));
    }

    #[test]
    fn rejects_unknown_status_column() {
        let err = Event::try_from(row("EXPLODED")).unwrap_err();
        assert!(matches!(err, EventStoreError::Storage(_)));
    }
}
