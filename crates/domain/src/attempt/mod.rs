//! Order attempts: the lifecycle from stock hold to confirmed order.

mod aggregate;
mod events;
mod failure;
mod order;
mod payment;
mod state;
mod transition;

pub use aggregate::OrderAttempt;
pub use events::{
    AttemptEvent, AttemptStartedData, FailureData, HoldRecordedData, OrderConfirmedData,
    PaymentAuthorizedData, PaymentIntentCreatedData, TransitionData,
};
pub use failure::{FailureKind, FailureReason};
pub use order::{Order, OrderStatus};
pub use payment::{PaymentIntent, PaymentIntentState};
pub use state::AttemptState;
pub use transition::{StateTransition, TransitionKind};

use common::AggregateId;
use thiserror::Error;

/// Errors from order attempt commands.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttemptError {
    #[error("Order attempt not found")]
    NotFound,

    #[error("Order attempt {0} already started")]
    AlreadyStarted(AggregateId),

    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition {
        from: AttemptState,
        to: AttemptState,
    },

    #[error("Cannot create a payment intent in state {state}")]
    PaymentIntentNotAllowed { state: AttemptState },
}
