//! Time-bounded holds against stock.

mod aggregate;
mod events;
mod state;

pub use aggregate::{Reservation, ReservationLine};
pub use events::{
    ReleaseReason, ReservationCommittedData, ReservationEvent, ReservationHeldData,
    ReservationReleasedData,
};
pub use state::ReservationState;

use common::AggregateId;
use thiserror::Error;

/// Errors from reservation commands.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReservationError {
    #[error("Reservation not found")]
    NotFound,

    #[error("Reservation {0} already exists")]
    AlreadyExists(AggregateId),

    #[error("A reservation needs at least one line")]
    Empty,

    /// Only a Held reservation can be committed.
    #[error("Reservation {reservation_id} is {state}, expected Held")]
    InvalidState {
        reservation_id: AggregateId,
        state: ReservationState,
    },
}
