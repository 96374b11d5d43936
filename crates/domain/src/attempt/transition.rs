use chrono::{DateTime, Utc};
use common::AggregateId;
use serde::{Deserialize, Serialize};

use super::{AttemptState, FailureReason};
use crate::values::Money;

/// What happened, as reported to the order state machine.
///
/// The synchronous checkout path, provider webhooks, the expiry sweeper and
/// shoppers all describe their observations with this one vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransitionKind {
    ReservationHeld {
        reservation_id: AggregateId,
        expires_at: DateTime<Utc>,
    },
    PaymentAuthorized {
        provider_reference: String,
        amount: Money,
    },
    PaymentCaptured,
    OrderConfirmed,
    ReservationExpired,
    PaymentFailed {
        reason: FailureReason,
    },
    Canceled {
        reason: FailureReason,
    },
    Refunded,
}

impl TransitionKind {
    /// The state this transition moves the attempt into.
    pub fn target(&self) -> AttemptState {
        match self {
            TransitionKind::ReservationHeld { .. } => AttemptState::ReservationHeld,
            TransitionKind::PaymentAuthorized { .. } => AttemptState::PaymentAuthorized,
            TransitionKind::PaymentCaptured => AttemptState::PaymentCaptured,
            TransitionKind::OrderConfirmed => AttemptState::OrderConfirmed,
            TransitionKind::ReservationExpired => AttemptState::ReservationExpired,
            TransitionKind::PaymentFailed { .. } => AttemptState::PaymentFailed,
            TransitionKind::Canceled { .. } => AttemptState::Canceled,
            TransitionKind::Refunded => AttemptState::Refunded,
        }
    }
}

/// One entry in an attempt's state history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: Option<AttemptState>,
    pub to: AttemptState,
    pub event_id: Option<String>,
    pub at: DateTime<Utc>,
}
