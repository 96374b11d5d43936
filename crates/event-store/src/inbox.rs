//! Durable record of provider webhook event ids that were already handled.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::sync::RwLock;

use crate::Result;

/// Set of processed external event ids with their processing time.
#[async_trait]
pub trait ProcessedEventLog: Send + Sync {
    /// Returns true if `event_id` was recorded and not yet pruned.
    async fn contains(&self, event_id: &str) -> Result<bool>;

    /// Records `event_id`. Returns false if it was already present.
    async fn record(&self, event_id: &str, processed_at: DateTime<Utc>) -> Result<bool>;

    /// Drops entries processed before `cutoff`. Returns how many were removed.
    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

/// In-memory processed-event log.
#[derive(Clone, Default)]
pub struct InMemoryProcessedEvents {
    entries: Arc<RwLock<HashMap<String, DateTime<Utc>>>>,
}

impl InMemoryProcessedEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl ProcessedEventLog for InMemoryProcessedEvents {
    async fn contains(&self, event_id: &str) -> Result<bool> {
        Ok(self.entries.read().await.contains_key(event_id))
    }

    async fn record(&self, event_id: &str, processed_at: DateTime<Utc>) -> Result<bool> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(event_id) {
            return Ok(false);
        }
        entries.insert(event_id.to_string(), processed_at);
        Ok(true)
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, at| *at >= cutoff);
        Ok(before - entries.len())
    }
}

/// PostgreSQL-backed processed-event log (`processed_webhook_events`).
#[derive(Clone)]
pub struct PostgresProcessedEvents {
    pool: PgPool,
}

impl PostgresProcessedEvents {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProcessedEventLog for PostgresProcessedEvents {
    async fn contains(&self, event_id: &str) -> Result<bool> {
        let found: Option<i32> =
            sqlx::query_scalar("SELECT 1 FROM processed_webhook_events WHERE event_id = $1")
                .bind(event_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(found.is_some())
    }

    async fn record(&self, event_id: &str, processed_at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO processed_webhook_events (event_id, processed_at)
            VALUES ($1, $2)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(event_id)
        .bind(processed_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let result = sqlx::query("DELETE FROM processed_webhook_events WHERE processed_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() as usize)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[tokio::test]
    async fn record_is_first_writer_wins() {
        let log = InMemoryProcessedEvents::new();
        let now = Utc::now();

        assert!(!log.contains("evt_1").await.unwrap());
        assert!(log.record("evt_1", now).await.unwrap());
        assert!(!log.record("evt_1", now).await.unwrap());
        assert!(log.contains("evt_1").await.unwrap());
        assert_eq!(log.len().await, 1);
    }

    #[tokio::test]
    async fn prune_drops_only_old_entries() {
        let log = InMemoryProcessedEvents::new();
        let now = Utc::now();

        log.record("old", now - Duration::hours(80)).await.unwrap();
        log.record("recent", now - Duration::hours(1)).await.unwrap();

        let removed = log.prune_before(now - Duration::hours(72)).await.unwrap();
        assert_eq!(removed, 1);
        assert!(!log.contains("old").await.unwrap());
        assert!(log.contains("recent").await.unwrap());
    }
}
