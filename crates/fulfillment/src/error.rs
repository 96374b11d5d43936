//! Fulfillment error types.

use common::AggregateId;
use domain::{
    AttemptError, AttemptState, DomainError, FailureKind, FailureReason, ReservationError,
    ReservationState, VariantId,
};
use event_store::EventStoreError;
use thiserror::Error;

/// Errors raised by the fulfillment services.
///
/// A duplicate event is not an error: dispatch reports it as
/// [`Outcome::Duplicate`](crate::Outcome::Duplicate).
#[derive(Debug, Error)]
pub enum FulfillmentError {
    #[error("Insufficient stock for {variant_id}: requested {requested}, available {available}")]
    InsufficientStock {
        variant_id: VariantId,
        requested: u32,
        available: u32,
    },

    #[error("Cart invalid: {0}")]
    CartInvalid(String),

    #[error("Payment declined: {0}")]
    PaymentDeclined(String),

    #[error("Payment provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Capture failed: {0}")]
    CaptureFailed(String),

    /// The provider never answered and a status lookup could not settle the
    /// outcome. The attempt stays where it was; resubmitting resumes it.
    #[error("Payment outcome pending after {0} timed out")]
    PaymentPending(String),

    #[error("Reservation {reservation_id} is {state}, expected Held")]
    InvalidReservationState {
        reservation_id: AggregateId,
        state: ReservationState,
    },

    #[error("Invalid transition for order attempt {attempt_id}: {from} -> {to}")]
    InvalidTransition {
        attempt_id: AggregateId,
        from: AttemptState,
        to: AttemptState,
    },

    /// Checkout ended with the attempt in a failure state.
    #[error("Checkout {attempt_id} ended in {state}: {reason}")]
    CheckoutFailed {
        attempt_id: AggregateId,
        state: AttemptState,
        reason: FailureReason,
    },

    #[error("Order attempt not found: {0}")]
    AttemptNotFound(AggregateId),

    #[error("Order attempt {0} has no payment intent")]
    NoPaymentIntent(AggregateId),

    #[error("No order attempt for payment reference {0}")]
    UnknownPaymentReference(String),

    #[error("Invalid webhook signature: {0}")]
    InvalidSignature(String),

    #[error("Malformed webhook: {0}")]
    MalformedWebhook(String),

    #[error("Domain error: {0}")]
    Domain(DomainError),

    #[error("Event store error: {0}")]
    EventStore(#[from] EventStoreError),
}

impl From<DomainError> for FulfillmentError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Reservation(ReservationError::InvalidState {
                reservation_id,
                state,
            }) => FulfillmentError::InvalidReservationState {
                reservation_id,
                state,
            },
            DomainError::EventStore(e) => FulfillmentError::EventStore(e),
            other => FulfillmentError::Domain(other),
        }
    }
}

impl FulfillmentError {
    /// Snake-case name of the error, as reported to API clients.
    pub fn kind(&self) -> &'static str {
        match self {
            FulfillmentError::InsufficientStock { .. } => "insufficient_stock",
            FulfillmentError::CartInvalid(_) => "cart_invalid",
            FulfillmentError::PaymentDeclined(_) => "payment_declined",
            FulfillmentError::ProviderUnavailable(_) => "provider_unavailable",
            FulfillmentError::CaptureFailed(_) => "capture_failed",
            FulfillmentError::PaymentPending(_) => "payment_pending",
            FulfillmentError::InvalidReservationState { .. } => "invalid_reservation_state",
            FulfillmentError::InvalidTransition { .. } => "invalid_transition",
            FulfillmentError::CheckoutFailed { reason, .. } => failure_kind_name(reason.kind),
            FulfillmentError::AttemptNotFound(_) => "not_found",
            FulfillmentError::NoPaymentIntent(_) => "no_payment_intent",
            FulfillmentError::UnknownPaymentReference(_) => "unknown_payment_reference",
            FulfillmentError::InvalidSignature(_) => "invalid_signature",
            FulfillmentError::MalformedWebhook(_) => "malformed_webhook",
            FulfillmentError::Domain(_) => "domain",
            FulfillmentError::EventStore(e) if e.is_conflict() => "conflict",
            FulfillmentError::EventStore(_) => "storage",
        }
    }

    /// The failure to record on an attempt that this error ends.
    pub fn failure_reason(&self) -> Option<FailureReason> {
        let kind = match self {
            FulfillmentError::InsufficientStock { .. } => FailureKind::InsufficientStock,
            FulfillmentError::CartInvalid(_) => FailureKind::CartInvalid,
            FulfillmentError::PaymentDeclined(_) => FailureKind::PaymentDeclined,
            FulfillmentError::ProviderUnavailable(_) => FailureKind::ProviderUnavailable,
            FulfillmentError::CaptureFailed(_) => FailureKind::CaptureFailed,
            _ => return None,
        };
        Some(FailureReason::new(kind, self.to_string()))
    }

    /// Lifts an attempt command error, attaching the attempt id.
    pub(crate) fn from_attempt(attempt_id: AggregateId, err: DomainError) -> Self {
        match err {
            DomainError::Attempt(AttemptError::NotFound) => {
                FulfillmentError::AttemptNotFound(attempt_id)
            }
            DomainError::Attempt(AttemptError::InvalidTransition { from, to }) => {
                FulfillmentError::InvalidTransition {
                    attempt_id,
                    from,
                    to,
                }
            }
            other => other.into(),
        }
    }
}

pub(crate) fn failure_kind_name(kind: FailureKind) -> &'static str {
    match kind {
        FailureKind::InsufficientStock => "insufficient_stock",
        FailureKind::CartInvalid => "cart_invalid",
        FailureKind::PaymentDeclined => "payment_declined",
        FailureKind::ProviderUnavailable => "provider_unavailable",
        FailureKind::CaptureFailed => "capture_failed",
        FailureKind::ShopperCanceled => "shopper_canceled",
        FailureKind::ReservationExpired => "reservation_expired",
        FailureKind::ProviderReported => "provider_reported",
    }
}

/// Convenience type alias for fulfillment results.
pub type Result<T> = std::result::Result<T, FulfillmentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservation_state_errors_are_lifted() {
        let reservation_id = AggregateId::new();
        let err: FulfillmentError = DomainError::Reservation(ReservationError::InvalidState {
            reservation_id,
            state: ReservationState::Released,
        })
        .into();

        assert!(matches!(
            err,
            FulfillmentError::InvalidReservationState {
                state: ReservationState::Released,
                ..
            }
        ));
        assert_eq!(err.kind(), "invalid_reservation_state");
    }

    #[test]
    fn attempt_errors_carry_attempt_id() {
        let attempt_id = AggregateId::new();
        let err = FulfillmentError::from_attempt(
            attempt_id,
            DomainError::Attempt(AttemptError::InvalidTransition {
                from: AttemptState::Canceled,
                to: AttemptState::PaymentCaptured,
            }),
        );
        assert!(matches!(
            err,
            FulfillmentError::InvalidTransition { attempt_id: id, .. } if id == attempt_id
        ));
    }

    #[test]
    fn checkout_failure_kind_follows_reason() {
        let err = FulfillmentError::CheckoutFailed {
            attempt_id: AggregateId::new(),
            state: AttemptState::PaymentFailed,
            reason: FailureReason::new(FailureKind::PaymentDeclined, "card declined"),
        };
        assert_eq!(err.kind(), "payment_declined");
        assert!(
            FulfillmentError::PaymentPending("capture".into())
                .failure_reason()
                .is_none()
        );
        assert_eq!(
            FulfillmentError::CartInvalid("x".into())
                .failure_reason()
                .map(|r| r.kind),
            Some(FailureKind::CartInvalid)
        );
    }
}
