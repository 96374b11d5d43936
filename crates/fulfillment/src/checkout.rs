//! Drives one checkout attempt from cart snapshot to confirmed order.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use common::AggregateId;
use domain::{
    Aggregate, AttemptState, CartSnapshot, FailureKind, FailureReason, IdempotencyKey, Money,
    OrderAttempt, StateTransition, TransitionKind,
};
use event_store::EventStore;
use serde::{Deserialize, Serialize};

use crate::error::{FulfillmentError, Result};
use crate::machine::{EventSource, OrderEvent, OrderStateMachine};
use crate::payment::{PaymentOrchestrator, PaymentProvider};
use crate::reservation::ReservationManager;
use crate::services::catalog::Catalog;

fn first_attempt() -> u32 {
    1
}

/// A checkout submitted by a shopper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutRequest {
    pub cart: CartSnapshot,
    /// Bumped by the client to start a fresh attempt for the same cart.
    #[serde(default = "first_attempt")]
    pub attempt_seq: u32,
}

impl CheckoutRequest {
    pub fn new(cart: CartSnapshot) -> Self {
        Self {
            cart,
            attempt_seq: first_attempt(),
        }
    }

    pub fn idempotency_key(&self) -> IdempotencyKey {
        IdempotencyKey::derive(
            &self.cart.shopper_id,
            &self.cart.content_hash(),
            self.attempt_seq,
        )
    }
}

/// Where an attempt stands, as reported to the shopper.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckoutReceipt {
    pub attempt_id: AggregateId,
    pub idempotency_key: Option<String>,
    pub state: AttemptState,
    pub order_id: Option<AggregateId>,
    pub total: Option<Money>,
    pub failure: Option<FailureReason>,
    pub history: Vec<StateTransition>,
}

impl CheckoutReceipt {
    pub fn from_attempt(attempt_id: AggregateId, attempt: &OrderAttempt) -> Self {
        Self {
            attempt_id,
            idempotency_key: attempt.idempotency_key().map(|k| k.to_string()),
            state: attempt.state(),
            order_id: attempt.order().map(|o| o.order_id),
            total: attempt.order().map(|o| o.total),
            failure: attempt.failure().cloned(),
            history: attempt.history().to_vec(),
        }
    }
}

/// Runs the synchronous checkout path.
///
/// Each step reports its result to the order state machine and then re-reads
/// the attempt, so a webhook or the sweeper moving the attempt in between is
/// picked up rather than overwritten. Calling `checkout` again with the same
/// idempotency key resumes from the persisted state.
pub struct CheckoutCoordinator<S, C, P>
where
    S: EventStore,
    C: Catalog,
    P: PaymentProvider,
{
    reservations: Arc<ReservationManager<S, C>>,
    payments: Arc<PaymentOrchestrator<P>>,
    machine: Arc<OrderStateMachine<S, P>>,
}

impl<S, C, P> CheckoutCoordinator<S, C, P>
where
    S: EventStore + Clone,
    C: Catalog,
    P: PaymentProvider,
{
    pub fn new(
        reservations: Arc<ReservationManager<S, C>>,
        payments: Arc<PaymentOrchestrator<P>>,
        machine: Arc<OrderStateMachine<S, P>>,
    ) -> Self {
        Self {
            reservations,
            payments,
            machine,
        }
    }

    /// Reserves stock, authorizes and captures payment, and confirms the
    /// order.
    ///
    /// Fails with `CheckoutFailed` when the attempt ends in a failure state;
    /// the reason tells the shopper what went wrong.
    #[tracing::instrument(skip(self, request), fields(attempt_id = tracing::field::Empty))]
    pub async fn checkout(
        &self,
        request: CheckoutRequest,
        now: DateTime<Utc>,
    ) -> Result<CheckoutReceipt> {
        let started = Instant::now();
        let key = request.idempotency_key();
        tracing::Span::current().record("attempt_id", tracing::field::display(key.attempt_id()));
        metrics::counter!("checkout_attempts_total").increment(1);

        let result = self.drive(request.cart, key, now).await;

        metrics::histogram!("checkout_duration_seconds").record(started.elapsed().as_secs_f64());
        match &result {
            Ok(receipt) => tracing::info!(state = %receipt.state, "checkout finished"),
            Err(e) => tracing::warn!(error = %e, "checkout failed"),
        }
        result
    }

    /// Cancels an attempt on the shopper's behalf.
    ///
    /// Only possible before capture; afterwards this is `InvalidTransition`.
    #[tracing::instrument(skip(self))]
    pub async fn cancel(&self, attempt_id: AggregateId, now: DateTime<Utc>) -> Result<CheckoutReceipt> {
        self.machine
            .dispatch(
                OrderEvent::new(
                    attempt_id,
                    format!("shopper:{attempt_id}:cancel"),
                    EventSource::Shopper,
                    TransitionKind::Canceled {
                        reason: FailureReason::shopper_canceled(),
                    },
                )
                .at(now),
            )
            .await?;
        self.status(attempt_id).await
    }

    pub async fn status(&self, attempt_id: AggregateId) -> Result<CheckoutReceipt> {
        let attempt = self.load(attempt_id).await?;
        Ok(CheckoutReceipt::from_attempt(attempt_id, &attempt))
    }

    async fn drive(
        &self,
        cart: CartSnapshot,
        key: IdempotencyKey,
        now: DateTime<Utc>,
    ) -> Result<CheckoutReceipt> {
        let attempt_id = key.attempt_id();
        let mut attempt = self.machine.start(cart, key, now).await?;

        loop {
            match attempt.state() {
                AttemptState::Created => self.reserve(attempt_id, &attempt, now).await?,
                AttemptState::ReservationHeld => self.authorize(attempt_id, now).await?,
                AttemptState::PaymentAuthorized => self.capture(attempt_id, &attempt, now).await?,
                AttemptState::PaymentCaptured => {
                    self.machine.confirm(attempt_id, now).await?;
                }
                AttemptState::OrderConfirmed | AttemptState::Refunded => {
                    return Ok(CheckoutReceipt::from_attempt(attempt_id, &attempt));
                }
                state @ (AttemptState::ReservationExpired
                | AttemptState::PaymentFailed
                | AttemptState::Canceled) => {
                    let reason = attempt.failure().cloned().unwrap_or_else(|| {
                        FailureReason::new(FailureKind::ProviderReported, state.as_str())
                    });
                    return Err(FulfillmentError::CheckoutFailed {
                        attempt_id,
                        state,
                        reason,
                    });
                }
            }
            attempt = self.load(attempt_id).await?;
        }
    }

    async fn reserve(
        &self,
        attempt_id: AggregateId,
        attempt: &OrderAttempt,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let cart = attempt
            .cart()
            .ok_or(FulfillmentError::AttemptNotFound(attempt_id))?;

        match self.reservations.begin_checkout(attempt_id, cart, now).await {
            Ok(reservation) => {
                let reservation_id = reservation
                    .id()
                    .ok_or(FulfillmentError::AttemptNotFound(attempt_id))?;
                let expires_at = reservation.expires_at().unwrap_or(now);
                self.advance(
                    OrderEvent::new(
                        attempt_id,
                        format!("checkout:{attempt_id}:reserve"),
                        EventSource::Checkout,
                        TransitionKind::ReservationHeld {
                            reservation_id,
                            expires_at,
                        },
                    )
                    .at(now),
                )
                .await
            }
            // A concurrent run of the same attempt got further.
            Err(e @ FulfillmentError::InvalidReservationState { .. }) => {
                if self.load(attempt_id).await?.state() == AttemptState::Created {
                    return Err(e);
                }
                Ok(())
            }
            Err(e) => self.fail(attempt_id, "reserve", e, now).await,
        }
    }

    async fn authorize(&self, attempt_id: AggregateId, now: DateTime<Utc>) -> Result<()> {
        let attempt = self.machine.record_payment_intent(attempt_id, now).await?;

        match self.payments.authorize(&attempt).await {
            Ok(intent) => {
                let provider_reference = intent
                    .provider_reference
                    .ok_or(FulfillmentError::NoPaymentIntent(attempt_id))?;
                self.advance(
                    OrderEvent::new(
                        attempt_id,
                        format!("checkout:{attempt_id}:authorize"),
                        EventSource::Checkout,
                        TransitionKind::PaymentAuthorized {
                            provider_reference,
                            amount: intent.amount,
                        },
                    )
                    .at(now),
                )
                .await
            }
            Err(e) => self.fail(attempt_id, "authorize", e, now).await,
        }
    }

    async fn capture(
        &self,
        attempt_id: AggregateId,
        attempt: &OrderAttempt,
        now: DateTime<Utc>,
    ) -> Result<()> {
        match self.payments.capture(attempt).await {
            Ok(_) => {
                self.advance(
                    OrderEvent::new(
                        attempt_id,
                        format!("checkout:{attempt_id}:capture"),
                        EventSource::Checkout,
                        TransitionKind::PaymentCaptured,
                    )
                    .at(now),
                )
                .await
            }
            Err(e) => self.fail(attempt_id, "capture", e, now).await,
        }
    }

    /// Records a step failure on the attempt. Errors that do not end the
    /// attempt (storage, conflicts, a payment outcome still pending) are
    /// returned as they are.
    async fn fail(
        &self,
        attempt_id: AggregateId,
        step: &'static str,
        err: FulfillmentError,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let Some(reason) = err.failure_reason() else {
            return Err(err);
        };
        tracing::info!(%attempt_id, step, error = %err, "checkout step failed");

        // Nothing was charged if stock could not be held.
        let kind = match step {
            "reserve" => TransitionKind::Canceled { reason },
            _ => TransitionKind::PaymentFailed { reason },
        };
        self.advance(
            OrderEvent::new(
                attempt_id,
                format!("checkout:{attempt_id}:{step}:failed"),
                EventSource::Checkout,
                kind,
            )
            .at(now),
        )
        .await
    }

    /// Dispatches a step result. Another source having moved the attempt
    /// first is fine; the caller re-reads the attempt.
    async fn advance(&self, event: OrderEvent) -> Result<()> {
        match self.machine.dispatch(event).await {
            Ok(_) | Err(FulfillmentError::InvalidTransition { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn load(&self, attempt_id: AggregateId) -> Result<OrderAttempt> {
        self.machine
            .attempt(attempt_id)
            .await?
            .ok_or(FulfillmentError::AttemptNotFound(attempt_id))
    }
}
