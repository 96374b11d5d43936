//! Loading aggregates and executing commands against them.

use std::collections::HashMap;
use std::marker::PhantomData;

use common::AggregateId;
use event_store::{AppendOptions, EventEnvelope, EventStore, Version};
use serde::Serialize;

use crate::aggregate::{Aggregate, DomainEvent};
use crate::error::DomainError;

/// Result of command execution.
#[derive(Debug)]
pub struct CommandResult<A: Aggregate> {
    /// The aggregate after applying the new events.
    pub aggregate: A,

    /// The events that were generated and persisted. Empty for a no-op.
    pub events: Vec<A::Event>,

    /// The version of the aggregate after the command.
    pub new_version: Version,
}

impl<A: Aggregate> CommandResult<A> {
    /// Returns true if the command recorded nothing.
    pub fn is_noop(&self) -> bool {
        self.events.is_empty()
    }
}

/// Replays an aggregate from its stream, runs a command closure against it
/// and appends the resulting events with optimistic concurrency.
pub struct CommandHandler<S, A>
where
    S: EventStore,
    A: Aggregate,
{
    store: S,
    _phantom: PhantomData<A>,
}

impl<S, A> CommandHandler<S, A>
where
    S: EventStore,
    A: Aggregate,
{
    /// Creates a new command handler with the given event store.
    pub fn new(store: S) -> Self {
        Self {
            store,
            _phantom: PhantomData,
        }
    }

    /// Returns a reference to the underlying event store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Loads an aggregate, returning a default instance if it has no events.
    pub async fn load(&self, aggregate_id: AggregateId) -> Result<A, DomainError> {
        let events = self.store.get_events_for_aggregate(aggregate_id).await?;

        let mut aggregate = A::default();
        for envelope in events {
            let event: A::Event = envelope.decode()?;
            aggregate.apply(event);
            aggregate.set_version(envelope.version);
        }

        Ok(aggregate)
    }

    /// Loads an aggregate, returning None if it doesn't exist.
    pub async fn load_existing(&self, aggregate_id: AggregateId) -> Result<Option<A>, DomainError> {
        let aggregate = self.load(aggregate_id).await?;
        Ok(aggregate.id().is_some().then_some(aggregate))
    }

    /// Replays every stream of this aggregate type, oldest stream first.
    pub async fn load_all(&self) -> Result<Vec<A>, DomainError> {
        let events = self
            .store
            .get_events_by_aggregate_type(A::aggregate_type())
            .await?;

        let mut order = Vec::new();
        let mut aggregates: HashMap<AggregateId, A> = HashMap::new();
        for envelope in events {
            let event: A::Event = envelope.decode()?;
            let aggregate = aggregates.entry(envelope.aggregate_id).or_insert_with(|| {
                order.push(envelope.aggregate_id);
                A::default()
            });
            aggregate.apply(event);
            aggregate.set_version(envelope.version);
        }

        Ok(order
            .into_iter()
            .filter_map(|id| aggregates.remove(&id))
            .collect())
    }

    /// Executes a command and persists the resulting events.
    ///
    /// The closure sees the current state and returns the events to record,
    /// an empty list for a no-op, or an error.
    pub async fn execute<F>(
        &self,
        aggregate_id: AggregateId,
        command_fn: F,
    ) -> Result<CommandResult<A>, DomainError>
    where
        F: FnOnce(&A) -> Result<Vec<A::Event>, A::Error>,
        DomainError: From<A::Error>,
    {
        let mut aggregate = self.load(aggregate_id).await?;
        let current_version = aggregate.version();

        let events = command_fn(&aggregate)?;

        if events.is_empty() {
            return Ok(CommandResult {
                aggregate,
                events: vec![],
                new_version: current_version,
            });
        }

        let envelopes = build_envelopes::<A>(aggregate_id, current_version, &events)?;

        let options = if current_version == Version::initial() {
            AppendOptions::expect_new()
        } else {
            AppendOptions::expect_version(current_version)
        };

        let new_version = self.store.append(envelopes, options).await?;
        tracing::trace!(
            aggregate_type = A::aggregate_type(),
            %aggregate_id,
            version = %new_version,
            "command applied"
        );

        for event in &events {
            aggregate.apply(event.clone());
        }
        aggregate.set_version(new_version);

        Ok(CommandResult {
            aggregate,
            events,
            new_version,
        })
    }
}

impl<S, A> Clone for CommandHandler<S, A>
where
    S: EventStore + Clone,
    A: Aggregate,
{
    fn clone(&self) -> Self {
        Self::new(self.store.clone())
    }
}

fn build_envelopes<A>(
    aggregate_id: AggregateId,
    current_version: Version,
    events: &[A::Event],
) -> Result<Vec<EventEnvelope>, DomainError>
where
    A: Aggregate,
    A::Event: Serialize,
{
    let mut envelopes = Vec::with_capacity(events.len());
    let mut version = current_version;

    for event in events {
        version = version.next();
        let envelope = EventEnvelope::builder()
            .aggregate_id(aggregate_id)
            .aggregate_type(A::aggregate_type())
            .event_type(event.event_type())
            .version(version)
            .payload(event)?
            .build()?;
        envelopes.push(envelope);
    }

    Ok(envelopes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::{StockError, StockEvent, StockItem};
    use crate::values::VariantId;
    use chrono::Utc;
    use event_store::{EventStoreError, InMemoryEventStore};

    fn stock_id(variant: &str) -> AggregateId {
        StockItem::stream_id(&VariantId::new(variant))
    }

    #[tokio::test]
    async fn execute_creates_aggregate() {
        let store = InMemoryEventStore::new();
        let handler: CommandHandler<_, StockItem> = CommandHandler::new(store);
        let variant = VariantId::new("SKU-001");

        let result = handler
            .execute(stock_id("SKU-001"), |item| {
                item.receive(&variant, 5, Utc::now())
            })
            .await
            .unwrap();

        assert_eq!(result.events.len(), 1);
        assert_eq!(result.new_version, Version::first());
        assert_eq!(result.aggregate.received(), 5);
        assert!(!result.is_noop());
    }

    #[tokio::test]
    async fn execute_appends_to_existing_stream() {
        let store = InMemoryEventStore::new();
        let handler: CommandHandler<_, StockItem> = CommandHandler::new(store);
        let variant = VariantId::new("SKU-001");

        for quantity in [5, 3] {
            handler
                .execute(stock_id("SKU-001"), |item| {
                    item.receive(&variant, quantity, Utc::now())
                })
                .await
                .unwrap();
        }

        let loaded = handler.load(stock_id("SKU-001")).await.unwrap();
        assert_eq!(loaded.received(), 8);
        assert_eq!(loaded.version(), Version::new(2));
    }

    #[tokio::test]
    async fn execute_returns_command_error() {
        let store = InMemoryEventStore::new();
        let handler: CommandHandler<_, StockItem> = CommandHandler::new(store.clone());
        let variant = VariantId::new("SKU-001");

        let result = handler
            .execute(stock_id("SKU-001"), |item| item.receive(&variant, 0, Utc::now()))
            .await;

        assert!(matches!(
            result,
            Err(DomainError::Stock(StockError::InvalidQuantity { .. }))
        ));
        assert_eq!(store.event_count().await, 0);
    }

    #[tokio::test]
    async fn empty_events_return_without_persisting() {
        let store = InMemoryEventStore::new();
        let handler: CommandHandler<_, StockItem> = CommandHandler::new(store.clone());

        let result = handler
            .execute(stock_id("SKU-001"), |_| Ok(Vec::<StockEvent>::new()))
            .await
            .unwrap();

        assert!(result.is_noop());
        assert_eq!(result.new_version, Version::initial());
        assert_eq!(store.event_count().await, 0);
    }

    #[tokio::test]
    async fn load_existing_distinguishes_missing_streams() {
        let store = InMemoryEventStore::new();
        let handler: CommandHandler<_, StockItem> = CommandHandler::new(store);
        let variant = VariantId::new("SKU-001");

        assert!(handler.load_existing(stock_id("SKU-001")).await.unwrap().is_none());

        handler
            .execute(stock_id("SKU-001"), |item| item.receive(&variant, 2, Utc::now()))
            .await
            .unwrap();

        let loaded = handler.load_existing(stock_id("SKU-001")).await.unwrap();
        assert_eq!(loaded.unwrap().variant_id(), Some(&variant));
    }

    #[tokio::test]
    async fn load_all_replays_each_stream() {
        let store = InMemoryEventStore::new();
        let handler: CommandHandler<_, StockItem> = CommandHandler::new(store);

        for (sku, quantity) in [("SKU-A", 2), ("SKU-B", 4), ("SKU-A", 3)] {
            let variant = VariantId::new(sku);
            handler
                .execute(stock_id(sku), |item| item.receive(&variant, quantity, Utc::now()))
                .await
                .unwrap();
        }

        let all = handler.load_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].variant_id(), Some(&VariantId::new("SKU-A")));
        assert_eq!(all[0].received(), 5);
        assert_eq!(all[0].version(), Version::new(2));
        assert_eq!(all[1].received(), 4);
    }

    #[tokio::test]
    async fn stale_writer_gets_conflict() {
        let store = InMemoryEventStore::new();
        let handler: CommandHandler<_, StockItem> = CommandHandler::new(store.clone());
        let variant = VariantId::new("SKU-001");
        let id = stock_id("SKU-001");

        handler
            .execute(id, |item| item.receive(&variant, 1, Utc::now()))
            .await
            .unwrap();

        // Another writer appends version 2 behind this handler's back.
        let stale = handler.load(id).await.unwrap();
        let events = stale.receive(&variant, 1, Utc::now()).unwrap();
        handler
            .execute(id, |_| Ok(events.clone()))
            .await
            .unwrap();
        let envelopes = build_envelopes::<StockItem>(id, stale.version(), &events).unwrap();
        let err = store
            .append(envelopes, AppendOptions::expect_version(stale.version()))
            .await
            .unwrap_err();

        assert!(matches!(err, EventStoreError::ConcurrencyConflict { .. }));
        assert!(DomainError::from(err).is_conflict());
    }
}
