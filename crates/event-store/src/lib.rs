//! Event persistence for the fulfillment core.
//!
//! Every durable record (stock intake, reservations, order attempts) is an
//! event appended to a per-aggregate stream. The processed-webhook log lives
//! beside it so both survive restarts together.

pub mod error;
pub mod event;
pub mod inbox;
pub mod memory;
pub mod postgres;
pub mod store;

pub use common::AggregateId;
pub use error::{EventStoreError, Result};
pub use event::{EventEnvelope, EventEnvelopeBuilder, EventId, Version};
pub use inbox::{InMemoryProcessedEvents, PostgresProcessedEvents, ProcessedEventLog};
pub use memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;
pub use store::{AppendOptions, EventStore};
