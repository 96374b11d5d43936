//! In-memory event store.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{
    AggregateId, EventEnvelope, EventStoreError, Result, Version,
    store::{AppendOptions, EventStore, validate_events_for_append},
};

/// Streams keyed by aggregate plus the global insertion order.
#[derive(Default)]
struct Log {
    streams: HashMap<AggregateId, Vec<EventEnvelope>>,
    /// (stream, index into that stream) in append order.
    order: Vec<(AggregateId, usize)>,
}

impl Log {
    fn version_of(&self, aggregate_id: AggregateId) -> Version {
        self.streams
            .get(&aggregate_id)
            .and_then(|stream| stream.last())
            .map_or(Version::initial(), |e| e.version)
    }

    fn in_order<'a>(
        &'a self,
        keep: impl Fn(&EventEnvelope) -> bool + 'a,
    ) -> impl Iterator<Item = &'a EventEnvelope> + 'a {
        self.order
            .iter()
            .filter_map(|(id, index)| self.streams.get(id).and_then(|s| s.get(*index)))
            .filter(move |e| keep(e))
    }
}

/// In-memory event store.
///
/// Backs the service when no database is configured, and every unit test.
/// Offers the same append semantics as the PostgreSQL store.
#[derive(Clone, Default)]
pub struct InMemoryEventStore {
    log: Arc<RwLock<Log>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of events across all streams.
    pub async fn event_count(&self) -> usize {
        self.log.read().await.order.len()
    }

    pub async fn clear(&self) {
        *self.log.write().await = Log::default();
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(&self, events: Vec<EventEnvelope>, options: AppendOptions) -> Result<Version> {
        validate_events_for_append(&events)?;

        let aggregate_id = events[0].aggregate_id;
        let first_version = events[0].version;
        let last_version = events[events.len() - 1].version;

        let mut log = self.log.write().await;
        let current = log.version_of(aggregate_id);

        if let Some(expected) = options.expected_version
            && current != expected
        {
            return Err(EventStoreError::ConcurrencyConflict {
                aggregate_id,
                expected,
                actual: current,
            });
        }

        // Same rule as the (aggregate_id, version) unique constraint.
        if first_version <= current {
            return Err(EventStoreError::ConcurrencyConflict {
                aggregate_id,
                expected: options.expected_version.unwrap_or(current),
                actual: current,
            });
        }

        let Log { streams, order } = &mut *log;
        let stream = streams.entry(aggregate_id).or_default();
        for event in events {
            order.push((aggregate_id, stream.len()));
            stream.push(event);
        }

        Ok(last_version)
    }

    async fn get_events_for_aggregate(
        &self,
        aggregate_id: AggregateId,
    ) -> Result<Vec<EventEnvelope>> {
        let log = self.log.read().await;
        Ok(log.streams.get(&aggregate_id).cloned().unwrap_or_default())
    }

    async fn get_events_by_aggregate_type(
        &self,
        aggregate_type: &str,
    ) -> Result<Vec<EventEnvelope>> {
        let log = self.log.read().await;
        Ok(log
            .in_order(|e| e.aggregate_type == aggregate_type)
            .cloned()
            .collect())
    }

    async fn get_aggregate_version(&self, aggregate_id: AggregateId) -> Result<Option<Version>> {
        let log = self.log.read().await;
        Ok(log.streams.contains_key(&aggregate_id).then(|| log.version_of(aggregate_id)))
    }
}
