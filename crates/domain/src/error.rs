//! Domain error types.

use event_store::EventStoreError;
use thiserror::Error;

use crate::attempt::AttemptError;
use crate::inventory::StockError;
use crate::reservation::ReservationError;

/// Errors raised while loading or executing commands against aggregates.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("Event store error: {0}")]
    EventStore(#[from] EventStoreError),

    #[error("Reservation error: {0}")]
    Reservation(#[from] ReservationError),

    #[error("Order attempt error: {0}")]
    Attempt(#[from] AttemptError),

    #[error("Stock error: {0}")]
    Stock(#[from] StockError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DomainError {
    /// Returns true if the append lost an optimistic concurrency race.
    pub fn is_conflict(&self) -> bool {
        matches!(self, DomainError::EventStore(e) if e.is_conflict())
    }
}
