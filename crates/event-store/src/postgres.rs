//! PostgreSQL event store over the `events` table.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, Postgres};
use sqlx::{FromRow, PgPool, QueryBuilder};
use uuid::Uuid;

use crate::{
    AggregateId, EventEnvelope, EventId, EventStoreError, Result, Version,
    store::{AppendOptions, EventStore, validate_events_for_append},
};

const SELECT_EVENTS: &str = "SELECT id, event_type, aggregate_id, aggregate_type, version, timestamp, payload, metadata FROM events";

const VERSION_CONSTRAINT: &str = "unique_aggregate_version";

#[derive(FromRow)]
struct EventRow {
    id: Uuid,
    event_type: String,
    aggregate_id: Uuid,
    aggregate_type: String,
    version: i64,
    timestamp: DateTime<Utc>,
    payload: serde_json::Value,
    metadata: serde_json::Value,
}

impl TryFrom<EventRow> for EventEnvelope {
    type Error = EventStoreError;

    fn try_from(row: EventRow) -> Result<Self> {
        Ok(EventEnvelope {
            event_id: EventId::from_uuid(row.id),
            event_type: row.event_type,
            aggregate_id: AggregateId::from_uuid(row.aggregate_id),
            aggregate_type: row.aggregate_type,
            version: Version::new(row.version),
            timestamp: row.timestamp,
            payload: row.payload,
            metadata: serde_json::from_value(row.metadata)?,
        })
    }
}

/// Which slice of the log a read wants.
enum Filter<'a> {
    Aggregate(AggregateId),
    AggregateType(&'a str),
}

/// PostgreSQL-backed event store.
#[derive(Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Opens a connection pool against `url`.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Applies the schema under `migrations/`.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn fetch(&self, filter: Filter<'_>) -> Result<Vec<EventEnvelope>> {
        let mut query = QueryBuilder::<Postgres>::new(SELECT_EVENTS);
        match filter {
            Filter::Aggregate(id) => {
                query
                    .push(" WHERE aggregate_id = ")
                    .push_bind(id.as_uuid())
                    .push(" ORDER BY version ASC");
            }
            Filter::AggregateType(aggregate_type) => {
                query
                    .push(" WHERE aggregate_type = ")
                    .push_bind(aggregate_type)
                    .push(" ORDER BY sequence ASC");
            }
        }

        let rows: Vec<EventRow> = query.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(EventEnvelope::try_from).collect()
    }
}

/// Turns a lost race on the (aggregate_id, version) constraint into a conflict.
fn conflict_or_database(
    err: sqlx::Error,
    aggregate_id: AggregateId,
    options: &AppendOptions,
    attempted: Version,
) -> EventStoreError {
    if let sqlx::Error::Database(ref db_err) = err
        && db_err.constraint() == Some(VERSION_CONSTRAINT)
    {
        return EventStoreError::ConcurrencyConflict {
            aggregate_id,
            expected: options.expected_version.unwrap_or(Version::initial()),
            actual: attempted,
        };
    }
    EventStoreError::Database(err)
}

#[async_trait]
impl EventStore for PostgresEventStore {
    async fn append(&self, events: Vec<EventEnvelope>, options: AppendOptions) -> Result<Version> {
        validate_events_for_append(&events)?;

        let aggregate_id = events[0].aggregate_id;
        let first_version = events[0].version;
        let last_version = events[events.len() - 1].version;
        let metadata = events
            .iter()
            .map(|event| serde_json::to_value(&event.metadata))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut tx = self.pool.begin().await?;

        if let Some(expected) = options.expected_version {
            let current: i64 = sqlx::query_scalar(
                "SELECT COALESCE(MAX(version), 0) FROM events WHERE aggregate_id = $1",
            )
            .bind(aggregate_id.as_uuid())
            .fetch_one(&mut *tx)
            .await?;

            let actual = Version::new(current);
            if actual != expected {
                return Err(EventStoreError::ConcurrencyConflict {
                    aggregate_id,
                    expected,
                    actual,
                });
            }
        }

        let mut insert = QueryBuilder::<Postgres>::new(
            "INSERT INTO events (id, event_type, aggregate_id, aggregate_type, version, timestamp, payload, metadata) ",
        );
        insert.push_values(events.iter().zip(&metadata), |mut row, (event, metadata)| {
            row.push_bind(event.event_id.as_uuid())
                .push_bind(&event.event_type)
                .push_bind(event.aggregate_id.as_uuid())
                .push_bind(&event.aggregate_type)
                .push_bind(event.version.as_i64())
                .push_bind(event.timestamp)
                .push_bind(&event.payload)
                .push_bind(metadata);
        });
        insert
            .build()
            .execute(&mut *tx)
            .await
            .map_err(|e| conflict_or_database(e, aggregate_id, &options, first_version))?;

        tx.commit().await?;
        tracing::debug!(%aggregate_id, version = %last_version, count = events.len(), "events appended");
        Ok(last_version)
    }

    async fn get_events_for_aggregate(
        &self,
        aggregate_id: AggregateId,
    ) -> Result<Vec<EventEnvelope>> {
        self.fetch(Filter::Aggregate(aggregate_id)).await
    }

    async fn get_events_by_aggregate_type(
        &self,
        aggregate_type: &str,
    ) -> Result<Vec<EventEnvelope>> {
        self.fetch(Filter::AggregateType(aggregate_type)).await
    }

    async fn get_aggregate_version(&self, aggregate_id: AggregateId) -> Result<Option<Version>> {
        let version: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM events WHERE aggregate_id = $1")
                .bind(aggregate_id.as_uuid())
                .fetch_one(&self.pool)
                .await?;

        Ok(version.map(Version::new))
    }
}
