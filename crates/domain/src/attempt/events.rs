//! Order attempt domain events.

use chrono::{DateTime, Utc};
use common::AggregateId;
use serde::{Deserialize, Serialize};

use super::{AttemptState, FailureReason, Order};
use crate::aggregate::DomainEvent;
use crate::cart::{CartSnapshot, IdempotencyKey};
use crate::values::{Money, ShopperId};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum AttemptEvent {
    AttemptStarted(AttemptStartedData),
    PaymentIntentCreated(PaymentIntentCreatedData),
    ReservationHeld(HoldRecordedData),
    PaymentAuthorized(PaymentAuthorizedData),
    PaymentCaptured(TransitionData),
    OrderConfirmed(OrderConfirmedData),
    ReservationExpired(TransitionData),
    PaymentFailed(FailureData),
    Canceled(FailureData),
    Refunded(TransitionData),
}

impl DomainEvent for AttemptEvent {
    fn event_type(&self) -> &'static str {
        match self {
            AttemptEvent::AttemptStarted(_) => "AttemptStarted",
            AttemptEvent::PaymentIntentCreated(_) => "PaymentIntentCreated",
            AttemptEvent::ReservationHeld(_) => "ReservationHeld",
            AttemptEvent::PaymentAuthorized(_) => "PaymentAuthorized",
            AttemptEvent::PaymentCaptured(_) => "PaymentCaptured",
            AttemptEvent::OrderConfirmed(_) => "OrderConfirmed",
            AttemptEvent::ReservationExpired(_) => "ReservationExpired",
            AttemptEvent::PaymentFailed(_) => "PaymentFailed",
            AttemptEvent::Canceled(_) => "Canceled",
            AttemptEvent::Refunded(_) => "Refunded",
        }
    }
}

impl AttemptEvent {
    /// For lifecycle transitions: the target state, triggering event id and time.
    pub fn transition(&self) -> Option<(AttemptState, &str, DateTime<Utc>)> {
        match self {
            AttemptEvent::AttemptStarted(_) | AttemptEvent::PaymentIntentCreated(_) => None,
            AttemptEvent::ReservationHeld(d) => {
                Some((AttemptState::ReservationHeld, d.event_id.as_str(), d.at))
            }
            AttemptEvent::PaymentAuthorized(d) => {
                Some((AttemptState::PaymentAuthorized, d.event_id.as_str(), d.at))
            }
            AttemptEvent::PaymentCaptured(d) => {
                Some((AttemptState::PaymentCaptured, d.event_id.as_str(), d.at))
            }
            AttemptEvent::OrderConfirmed(d) => {
                Some((AttemptState::OrderConfirmed, d.event_id.as_str(), d.at))
            }
            AttemptEvent::ReservationExpired(d) => {
                Some((AttemptState::ReservationExpired, d.event_id.as_str(), d.at))
            }
            AttemptEvent::PaymentFailed(d) => {
                Some((AttemptState::PaymentFailed, d.event_id.as_str(), d.at))
            }
            AttemptEvent::Canceled(d) => Some((AttemptState::Canceled, d.event_id.as_str(), d.at)),
            AttemptEvent::Refunded(d) => Some((AttemptState::Refunded, d.event_id.as_str(), d.at)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptStartedData {
    pub attempt_id: AggregateId,
    pub shopper_id: ShopperId,
    pub cart: CartSnapshot,
    pub idempotency_key: IdempotencyKey,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentIntentCreatedData {
    pub payment_intent_id: AggregateId,
    pub provider: String,
    pub amount: Money,
    pub currency: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HoldRecordedData {
    pub event_id: String,
    pub reservation_id: AggregateId,
    pub expires_at: DateTime<Utc>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentAuthorizedData {
    pub event_id: String,
    pub provider_reference: String,
    pub amount: Money,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionData {
    pub event_id: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderConfirmedData {
    pub event_id: String,
    pub order: Order,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureData {
    pub event_id: String,
    pub reason: FailureReason,
    pub at: DateTime<Utc>,
}
