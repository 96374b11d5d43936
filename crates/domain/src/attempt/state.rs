//! Order attempt lifecycle.

use serde::{Deserialize, Serialize};

/// The state of an order attempt.
///
/// ```text
/// Created ──► ReservationHeld ──► PaymentAuthorized ──► PaymentCaptured ──► OrderConfirmed ──► Refunded
///    │              │                    │                    │
///    │              ├──► PaymentFailed ◄─┴────────────────────┘
///    │              ├──► ReservationExpired ◄── PaymentAuthorized
///    └──────────────┴──► Canceled ◄──────────── PaymentAuthorized
/// ```
///
/// Every state is entered at most once, so the set of states an attempt has
/// visited also identifies every transition it has applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum AttemptState {
    #[default]
    Created,
    ReservationHeld,
    PaymentAuthorized,
    PaymentCaptured,
    OrderConfirmed,
    ReservationExpired,
    PaymentFailed,
    Canceled,
    Refunded,
}

impl AttemptState {
    /// Returns true if the transition table allows moving to `target`.
    pub fn can_transition_to(&self, target: AttemptState) -> bool {
        use AttemptState::*;
        matches!(
            (*self, target),
            (Created, ReservationHeld | Canceled)
                | (
                    ReservationHeld,
                    PaymentAuthorized | PaymentFailed | Canceled | ReservationExpired
                )
                | (
                    PaymentAuthorized,
                    PaymentCaptured | PaymentFailed | Canceled | ReservationExpired
                )
                | (PaymentCaptured, OrderConfirmed | PaymentFailed)
                | (OrderConfirmed, Refunded)
        )
    }

    /// States before money has been captured.
    pub fn is_pre_capture(&self) -> bool {
        matches!(
            self,
            AttemptState::Created | AttemptState::ReservationHeld | AttemptState::PaymentAuthorized
        )
    }

    /// No further checkout progress is possible. A confirmed order can still
    /// be refunded.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AttemptState::OrderConfirmed
                | AttemptState::ReservationExpired
                | AttemptState::PaymentFailed
                | AttemptState::Canceled
                | AttemptState::Refunded
        )
    }

    /// Failure states; entering one releases the attempt's reservation.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            AttemptState::ReservationExpired | AttemptState::PaymentFailed | AttemptState::Canceled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptState::Created => "Created",
            AttemptState::ReservationHeld => "ReservationHeld",
            AttemptState::PaymentAuthorized => "PaymentAuthorized",
            AttemptState::PaymentCaptured => "PaymentCaptured",
            AttemptState::OrderConfirmed => "OrderConfirmed",
            AttemptState::ReservationExpired => "ReservationExpired",
            AttemptState::PaymentFailed => "PaymentFailed",
            AttemptState::Canceled => "Canceled",
            AttemptState::Refunded => "Refunded",
        }
    }
}

impl std::fmt::Display for AttemptState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
