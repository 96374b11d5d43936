//! Order attempt aggregate.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use common::AggregateId;
use event_store::Version;

use super::{
    AttemptError, AttemptEvent, AttemptState, FailureReason, Order, OrderStatus, PaymentIntent,
    PaymentIntentState, StateTransition, TransitionKind,
    events::{
        AttemptStartedData, FailureData, HoldRecordedData, OrderConfirmedData,
        PaymentAuthorizedData, PaymentIntentCreatedData, TransitionData,
    },
};
use crate::aggregate::Aggregate;
use crate::cart::{CartSnapshot, IdempotencyKey};
use crate::values::ShopperId;

/// One checkout cycle for a cart, from stock hold to confirmed order.
///
/// The attempt is the single writer of its lifecycle: every transition goes
/// through [`OrderAttempt::transition`], which drops events it has already
/// applied (by event id, or because the target state was already visited)
/// and rejects transitions the state table does not allow.
#[derive(Debug, Clone, Default)]
pub struct OrderAttempt {
    id: Option<AggregateId>,
    version: Version,
    shopper_id: Option<ShopperId>,
    cart: Option<CartSnapshot>,
    idempotency_key: Option<IdempotencyKey>,
    state: AttemptState,
    reservation_id: Option<AggregateId>,
    reservation_expires_at: Option<DateTime<Utc>>,
    payment_intent: Option<PaymentIntent>,
    order: Option<Order>,
    failure: Option<FailureReason>,
    history: Vec<StateTransition>,
    processed_event_ids: HashSet<String>,
    last_event_id: Option<String>,
    started_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
}

impl Aggregate for OrderAttempt {
    type Event = AttemptEvent;
    type Error = AttemptError;

    fn aggregate_type() -> &'static str {
        "OrderAttempt"
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
        if let Some((to, event_id, at)) = event.transition() {
            self.history.push(StateTransition {
                from: Some(self.state),
                to,
                event_id: Some(event_id.to_string()),
                at,
            });
            self.processed_event_ids.insert(event_id.to_string());
            self.last_event_id = Some(event_id.to_string());
            self.state = to;
            self.updated_at = Some(at);
        }

        match event {
            AttemptEvent::AttemptStarted(data) => self.apply_started(data),
            AttemptEvent::PaymentIntentCreated(data) => {
                self.payment_intent = Some(PaymentIntent {
                    payment_intent_id: data.payment_intent_id,
                    provider: data.provider,
                    amount: data.amount,
                    currency: data.currency,
                    state: PaymentIntentState::Created,
                    provider_reference: None,
                });
            }
            AttemptEvent::ReservationHeld(data) => {
                self.reservation_id = Some(data.reservation_id);
                self.reservation_expires_at = Some(data.expires_at);
            }
            AttemptEvent::PaymentAuthorized(data) => self.apply_authorized(data),
            AttemptEvent::PaymentCaptured(_) => {
                self.set_intent_state(PaymentIntentState::Captured);
            }
            AttemptEvent::OrderConfirmed(data) => {
                self.order = Some(data.order);
            }
            AttemptEvent::ReservationExpired(_) => {
                self.void_intent();
                self.failure = Some(FailureReason::reservation_expired());
            }
            AttemptEvent::PaymentFailed(data) => {
                self.set_intent_state(PaymentIntentState::Failed);
                self.failure = Some(data.reason);
            }
            AttemptEvent::Canceled(data) => {
                self.void_intent();
                self.failure = Some(data.reason);
            }
            AttemptEvent::Refunded(data) => {
                if let Some(order) = self.order.as_mut() {
                    order.status = OrderStatus::Refunded;
                    order.refunded_at = Some(data.at);
                }
            }
        }
    }
}

impl OrderAttempt {
    fn apply_started(&mut self, data: AttemptStartedData) {
        self.id = Some(data.attempt_id);
        self.shopper_id = Some(data.shopper_id);
        self.cart = Some(data.cart);
        self.idempotency_key = Some(data.idempotency_key);
        self.state = AttemptState::Created;
        self.started_at = Some(data.started_at);
        self.updated_at = Some(data.started_at);
        self.history.push(StateTransition {
            from: None,
            to: AttemptState::Created,
            event_id: None,
            at: data.started_at,
        });
    }

    fn apply_authorized(&mut self, data: PaymentAuthorizedData) {
        match self.payment_intent.as_mut() {
            Some(intent) => {
                intent.state = PaymentIntentState::Authorized;
                intent.provider_reference = Some(data.provider_reference);
            }
            None => {
                let attempt_id = self.id.unwrap_or_default();
                self.payment_intent = Some(PaymentIntent {
                    payment_intent_id: PaymentIntent::id_for_attempt(attempt_id),
                    provider: "unknown".to_string(),
                    amount: data.amount,
                    currency: self
                        .cart
                        .as_ref()
                        .map(|c| c.currency.clone())
                        .unwrap_or_default(),
                    state: PaymentIntentState::Authorized,
                    provider_reference: Some(data.provider_reference),
                });
            }
        }
    }

    fn set_intent_state(&mut self, state: PaymentIntentState) {
        if let Some(intent) = self.payment_intent.as_mut() {
            intent.state = state;
        }
    }

    fn void_intent(&mut self) {
        if let Some(intent) = self.payment_intent.as_mut()
            && matches!(
                intent.state,
                PaymentIntentState::Created | PaymentIntentState::Authorized
            )
        {
            intent.state = PaymentIntentState::Canceled;
        }
    }
}

// Queries
impl OrderAttempt {
    pub fn state(&self) -> AttemptState {
        self.state
    }

    pub fn shopper_id(&self) -> Option<ShopperId> {
        self.shopper_id
    }

    pub fn cart(&self) -> Option<&CartSnapshot> {
        self.cart.as_ref()
    }

    pub fn idempotency_key(&self) -> Option<&IdempotencyKey> {
        self.idempotency_key.as_ref()
    }

    pub fn reservation_id(&self) -> Option<AggregateId> {
        self.reservation_id
    }

    pub fn reservation_expires_at(&self) -> Option<DateTime<Utc>> {
        self.reservation_expires_at
    }

    pub fn payment_intent(&self) -> Option<&PaymentIntent> {
        self.payment_intent.as_ref()
    }

    /// Provider reference of the authorization, once there is one.
    pub fn provider_reference(&self) -> Option<&str> {
        self.payment_intent
            .as_ref()
            .and_then(|intent| intent.provider_reference.as_deref())
    }

    pub fn order(&self) -> Option<&Order> {
        self.order.as_ref()
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        self.failure.as_ref()
    }

    pub fn history(&self) -> &[StateTransition] {
        &self.history
    }

    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    pub fn has_processed(&self, event_id: &str) -> bool {
        self.processed_event_ids.contains(event_id)
    }

    pub fn has_visited(&self, state: AttemptState) -> bool {
        self.history.iter().any(|t| t.to == state)
    }
}

// Commands
impl OrderAttempt {
    pub fn start(
        &self,
        attempt_id: AggregateId,
        cart: CartSnapshot,
        idempotency_key: IdempotencyKey,
        at: DateTime<Utc>,
    ) -> Result<Vec<AttemptEvent>, AttemptError> {
        if let Some(id) = self.id {
            return Err(AttemptError::AlreadyStarted(id));
        }

        Ok(vec![AttemptEvent::AttemptStarted(AttemptStartedData {
            attempt_id,
            shopper_id: cart.shopper_id,
            cart,
            idempotency_key,
            started_at: at,
        })])
    }

    /// Records the payment intent for this attempt's cart total.
    ///
    /// No-op if an intent already exists; only valid while the stock hold is
    /// in place and nothing has been authorized yet.
    pub fn record_payment_intent(
        &self,
        provider: &str,
        at: DateTime<Utc>,
    ) -> Result<Vec<AttemptEvent>, AttemptError> {
        let attempt_id = self.id.ok_or(AttemptError::NotFound)?;
        if self.payment_intent.is_some() {
            return Ok(vec![]);
        }
        if self.state != AttemptState::ReservationHeld {
            return Err(AttemptError::PaymentIntentNotAllowed { state: self.state });
        }
        let cart = self.cart.as_ref().ok_or(AttemptError::NotFound)?;

        Ok(vec![AttemptEvent::PaymentIntentCreated(
            PaymentIntentCreatedData {
                payment_intent_id: PaymentIntent::id_for_attempt(attempt_id),
                provider: provider.to_string(),
                amount: cart.subtotal(),
                currency: cart.currency.clone(),
                created_at: at,
            },
        )])
    }

    /// Applies a lifecycle transition.
    ///
    /// Returns no events when `event_id` was already applied or the attempt
    /// has already been in the target state.
    pub fn transition(
        &self,
        event_id: &str,
        kind: TransitionKind,
        at: DateTime<Utc>,
    ) -> Result<Vec<AttemptEvent>, AttemptError> {
        let attempt_id = self.id.ok_or(AttemptError::NotFound)?;
        let target = kind.target();

        if self.has_processed(event_id) || self.has_visited(target) {
            return Ok(vec![]);
        }
        if !self.state.can_transition_to(target) {
            return Err(AttemptError::InvalidTransition {
                from: self.state,
                to: target,
            });
        }

        let event_id = event_id.to_string();
        let event = match kind {
            TransitionKind::ReservationHeld {
                reservation_id,
                expires_at,
            } => AttemptEvent::ReservationHeld(HoldRecordedData {
                event_id,
                reservation_id,
                expires_at,
                at,
            }),
            TransitionKind::PaymentAuthorized {
                provider_reference,
                amount,
            } => AttemptEvent::PaymentAuthorized(PaymentAuthorizedData {
                event_id,
                provider_reference,
                amount,
                at,
            }),
            TransitionKind::PaymentCaptured => {
                AttemptEvent::PaymentCaptured(TransitionData { event_id, at })
            }
            TransitionKind::OrderConfirmed => {
                let cart = self.cart.as_ref().ok_or(AttemptError::NotFound)?;
                AttemptEvent::OrderConfirmed(OrderConfirmedData {
                    event_id,
                    order: Order {
                        order_id: Order::id_for_attempt(attempt_id),
                        order_attempt_id: attempt_id,
                        shopper_id: cart.shopper_id,
                        line_items: cart.items.clone(),
                        total: cart.subtotal(),
                        currency: cart.currency.clone(),
                        status: OrderStatus::Confirmed,
                        confirmed_at: at,
                        refunded_at: None,
                    },
                    at,
                })
            }
            TransitionKind::ReservationExpired => {
                AttemptEvent::ReservationExpired(TransitionData { event_id, at })
            }
            TransitionKind::PaymentFailed { reason } => {
                AttemptEvent::PaymentFailed(FailureData {
                    event_id,
                    reason,
                    at,
                })
            }
            TransitionKind::Canceled { reason } => AttemptEvent::Canceled(FailureData {
                event_id,
                reason,
                at,
            }),
            TransitionKind::Refunded => AttemptEvent::Refunded(TransitionData { event_id, at }),
        };

        Ok(vec![event])
    }
}
