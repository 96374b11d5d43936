//! Core aggregate and domain event traits.

use common::AggregateId;
use event_store::Version;
use serde::{Serialize, de::DeserializeOwned};

/// A fact recorded against an aggregate, named in the past tense.
pub trait DomainEvent: Serialize + DeserializeOwned + Send + Sync + Clone {
    /// Returns the event type name stored alongside the payload.
    fn event_type(&self) -> &'static str;
}

/// An event-sourced aggregate.
///
/// State is rebuilt by replaying events through `apply`, which must be pure
/// and infallible. Commands are plain methods that inspect the current state
/// and return the events to record.
pub trait Aggregate: Default + Send + Sync + Sized {
    /// The type of events this aggregate produces and consumes.
    type Event: DomainEvent;

    /// The type of errors its commands can produce.
    type Error: std::error::Error + Send + Sync;

    /// Returns the aggregate type name used to tag stored events.
    fn aggregate_type() -> &'static str;

    /// Returns the aggregate's identifier, or None before its first event.
    fn id(&self) -> Option<AggregateId>;

    /// Returns the version of the last applied event (0 when new).
    fn version(&self) -> Version;

    /// Sets the aggregate version after loading or appending.
    fn set_version(&mut self, version: Version);

    /// Applies an event to the aggregate, updating its state.
    fn apply(&mut self, event: Self::Event);

    /// Applies multiple events in sequence.
    fn apply_events(&mut self, events: impl IntoIterator<Item = Self::Event>) {
        for event in events {
            self.apply(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    enum CounterEvent {
        Opened { id: AggregateId },
        Incremented { by: u32 },
    }

    impl DomainEvent for CounterEvent {
        fn event_type(&self) -> &'static str {
            match self {
                CounterEvent::Opened { .. } => "CounterOpened",
                CounterEvent::Incremented { .. } => "CounterIncremented",
            }
        }
    }

    #[derive(Debug, Default)]
    struct Counter {
        id: Option<AggregateId>,
        value: u32,
        version: Version,
    }

    #[derive(Debug, thiserror::Error)]
    #[error("counter error")]
    struct CounterError;

    impl Aggregate for Counter {
        type Event = CounterEvent;
        type Error = CounterError;

        fn aggregate_type() -> &'static str {
            "Counter"
        }

        fn id(&self) -> Option<AggregateId> {
            self.id
        }

        fn version(&self) -> Version {
            self.version
        }

        fn set_version(&mut self, version: Version) {
            self.version = version;
        }

        fn apply(&mut self, event: Self::Event) {
            match event {
                CounterEvent::Opened { id } => self.id = Some(id),
                CounterEvent::Incremented { by } => self.value += by,
            }
        }
    }

    #[test]
    fn apply_events_replays_in_order() {
        let id = AggregateId::new();
        let mut counter = Counter::default();
        counter.apply_events(vec![
            CounterEvent::Opened { id },
            CounterEvent::Incremented { by: 2 },
            CounterEvent::Incremented { by: 3 },
        ]);

        assert_eq!(counter.id(), Some(id));
        assert_eq!(counter.value, 5);
        assert_eq!(Counter::aggregate_type(), "Counter");
    }

    #[test]
    fn event_type_names() {
        assert_eq!(
            CounterEvent::Incremented { by: 1 }.event_type(),
            "CounterIncremented"
        );
    }
}
