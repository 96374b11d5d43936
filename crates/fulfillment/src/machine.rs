//! Order state machine: the single writer of every attempt's lifecycle.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::{AggregateId, KeyedLocks};
use domain::{
    Aggregate, AttemptState, CartSnapshot, CommandHandler, IdempotencyKey, OrderAttempt,
    PaymentIntent, ReleaseReason, Reservation, ReservationState, TransitionKind,
};
use event_store::EventStore;
use tokio::sync::RwLock;

use crate::error::{FulfillmentError, Result};
use crate::ledger::InventoryLedger;
use crate::payment::{PaymentOrchestrator, PaymentProvider, ProviderStatus};
use crate::services::notification::{Notification, NotificationKind, NotificationSink};

/// Where an order event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSource {
    /// The synchronous checkout path.
    Checkout,
    /// A verified provider webhook.
    Webhook,
    Sweeper,
    Shopper,
    /// Follow-up transitions the machine issues itself.
    Machine,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSource::Checkout => "checkout",
            EventSource::Webhook => "webhook",
            EventSource::Sweeper => "sweeper",
            EventSource::Shopper => "shopper",
            EventSource::Machine => "machine",
        }
    }
}

/// A request to move one attempt through one transition.
///
/// `event_id` is unique per observation; redelivery of the same observation
/// carries the same id.
#[derive(Debug, Clone)]
pub struct OrderEvent {
    pub attempt_id: AggregateId,
    pub event_id: String,
    pub source: EventSource,
    pub kind: TransitionKind,
    pub at: DateTime<Utc>,
}

impl OrderEvent {
    pub fn new(
        attempt_id: AggregateId,
        event_id: impl Into<String>,
        source: EventSource,
        kind: TransitionKind,
    ) -> Self {
        Self {
            attempt_id,
            event_id: event_id.into(),
            source,
            kind,
            at: Utc::now(),
        }
    }

    pub fn at(mut self, at: DateTime<Utc>) -> Self {
        self.at = at;
        self
    }
}

/// Result of dispatching an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The transition was recorded; carries the attempt's state afterwards.
    Applied(AttemptState),
    /// Already applied, by event id or by target state. Nothing changed.
    Duplicate(AttemptState),
}

impl Outcome {
    pub fn state(&self) -> AttemptState {
        match self {
            Outcome::Applied(state) | Outcome::Duplicate(state) => *state,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, Outcome::Applied(_))
    }
}

/// A non-terminal attempt, as tracked for the expiry sweeper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveAttempt {
    pub attempt_id: AggregateId,
    pub state: AttemptState,
    /// When the attempt entered `state`.
    pub since: DateTime<Utc>,
}

impl LiveAttempt {
    fn of(attempt: &OrderAttempt) -> Option<Self> {
        if attempt.state().is_terminal() {
            return None;
        }
        Some(Self {
            attempt_id: attempt.id()?,
            state: attempt.state(),
            since: attempt.updated_at()?,
        })
    }
}

/// How the provider side stood before an authorized attempt was unwound.
enum Void {
    Voided,
    NotNeeded,
    /// The payment was captured first; the attempt must not fail.
    Captured,
}

/// Serializes all writes per attempt and runs the side effects of each
/// transition: commit on capture, release and void on failure, notify on
/// terminal states.
///
/// Checkout responses, webhooks, the sweeper and shoppers all feed the same
/// transition table through [`OrderStateMachine::dispatch`], so whichever
/// source reports an outcome first wins and later reports are duplicates.
pub struct OrderStateMachine<S, P>
where
    S: EventStore,
    P: PaymentProvider,
{
    attempts: CommandHandler<S, OrderAttempt>,
    ledger: Arc<InventoryLedger<S>>,
    payments: Arc<PaymentOrchestrator<P>>,
    notifier: Arc<dyn NotificationSink>,
    locks: KeyedLocks<AggregateId>,
    /// Provider reference to attempt, for webhook routing.
    references: RwLock<HashMap<String, AggregateId>>,
    live: RwLock<HashMap<AggregateId, LiveAttempt>>,
}

impl<S, P> OrderStateMachine<S, P>
where
    S: EventStore + Clone,
    P: PaymentProvider,
{
    pub fn new(
        store: S,
        ledger: Arc<InventoryLedger<S>>,
        payments: Arc<PaymentOrchestrator<P>>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            attempts: CommandHandler::new(store),
            ledger,
            payments,
            notifier,
            locks: KeyedLocks::new(),
            references: RwLock::new(HashMap::new()),
            live: RwLock::new(HashMap::new()),
        }
    }

    /// Opens the attempt addressed by `key`, or returns it if it exists.
    #[tracing::instrument(skip(self, cart, key), fields(attempt_id = %key.attempt_id()))]
    pub async fn start(
        &self,
        cart: CartSnapshot,
        key: IdempotencyKey,
        now: DateTime<Utc>,
    ) -> Result<OrderAttempt> {
        let attempt_id = key.attempt_id();
        let _guard = self.locks.lock(&attempt_id).await;

        if let Some(existing) = self.attempts.load_existing(attempt_id).await? {
            tracing::debug!(state = %existing.state(), "attempt already started");
            return Ok(existing);
        }

        let result = self
            .attempts
            .execute(attempt_id, |attempt| attempt.start(attempt_id, cart, key, now))
            .await
            .map_err(|e| FulfillmentError::from_attempt(attempt_id, e))?;

        self.track(&result.aggregate).await;
        tracing::info!("order attempt started");
        Ok(result.aggregate)
    }

    /// Records the attempt's payment intent (amount = cart subtotal).
    #[tracing::instrument(skip(self))]
    pub async fn record_payment_intent(
        &self,
        attempt_id: AggregateId,
        now: DateTime<Utc>,
    ) -> Result<OrderAttempt> {
        let _guard = self.locks.lock(&attempt_id).await;
        let provider = self.payments.provider_name();

        let result = self
            .attempts
            .execute(attempt_id, |attempt| attempt.record_payment_intent(provider, now))
            .await
            .map_err(|e| FulfillmentError::from_attempt(attempt_id, e))?;
        Ok(result.aggregate)
    }

    /// Applies one event exactly once and runs its side effects.
    ///
    /// Fails with `InvalidTransition` when the attempt's state does not allow
    /// the event; the event is dropped and nothing changes.
    #[tracing::instrument(
        skip(self, event),
        fields(attempt_id = %event.attempt_id, event_id = %event.event_id, source = event.source.as_str())
    )]
    pub async fn dispatch(&self, event: OrderEvent) -> Result<Outcome> {
        let _guard = self.locks.lock(&event.attempt_id).await;

        let voided = match self.void_authorization(&event).await? {
            Void::Voided => true,
            Void::NotNeeded => false,
            Void::Captured => return Err(self.capture_instead(&event).await?),
        };

        let (outcome, attempt, prior_intent) = self.record(&event).await?;
        let Outcome::Applied(state) = outcome else {
            return Ok(outcome);
        };

        match state {
            AttemptState::PaymentAuthorized => self.index_reference(&attempt).await,
            AttemptState::PaymentCaptured => return self.finish_capture(&attempt, event.at).await,
            AttemptState::OrderConfirmed => {
                self.notify(&attempt, NotificationKind::Confirmed).await;
            }
            AttemptState::ReservationExpired
            | AttemptState::PaymentFailed
            | AttemptState::Canceled => {
                let prior_intent = prior_intent.filter(|_| !voided);
                self.unwind(&attempt, prior_intent.as_ref(), event.at).await;
            }
            AttemptState::Created | AttemptState::ReservationHeld | AttemptState::Refunded => {}
        }
        Ok(outcome)
    }

    /// Commits the reservation and confirms the order of a captured attempt.
    ///
    /// Used to re-drive attempts left in `PaymentCaptured`.
    #[tracing::instrument(skip(self))]
    pub async fn confirm(&self, attempt_id: AggregateId, now: DateTime<Utc>) -> Result<Outcome> {
        let _guard = self.locks.lock(&attempt_id).await;

        let attempt = self
            .attempts
            .load_existing(attempt_id)
            .await?
            .ok_or(FulfillmentError::AttemptNotFound(attempt_id))?;

        match attempt.state() {
            AttemptState::PaymentCaptured => self.finish_capture(&attempt, now).await,
            state if attempt.has_visited(AttemptState::OrderConfirmed) => {
                Ok(Outcome::Duplicate(state))
            }
            state => Err(FulfillmentError::InvalidTransition {
                attempt_id,
                from: state,
                to: AttemptState::OrderConfirmed,
            }),
        }
    }

    pub async fn attempt(&self, attempt_id: AggregateId) -> Result<Option<OrderAttempt>> {
        Ok(self.attempts.load_existing(attempt_id).await?)
    }

    /// Attempts that have not reached a terminal state.
    pub async fn live_attempts(&self) -> Vec<LiveAttempt> {
        self.live.read().await.values().copied().collect()
    }

    /// The attempt a provider reference belongs to.
    pub async fn attempt_for_reference(&self, reference: &str) -> Option<AggregateId> {
        self.references.read().await.get(reference).copied()
    }

    /// Rebuilds the provider reference and live attempt indexes from the
    /// event store.
    #[tracing::instrument(skip(self))]
    pub async fn restore(&self) -> Result<()> {
        let attempts = self.attempts.load_all().await?;
        let mut references = HashMap::new();
        let mut live = HashMap::new();
        for attempt in &attempts {
            if let (Some(id), Some(reference)) = (attempt.id(), attempt.provider_reference()) {
                references.insert(reference.to_string(), id);
            }
            if let Some(entry) = LiveAttempt::of(attempt) {
                live.insert(entry.attempt_id, entry);
            }
        }

        let indexed = references.len();
        let open = live.len();
        *self.references.write().await = references;
        *self.live.write().await = live;
        tracing::info!(attempts = attempts.len(), indexed, open, "order attempts restored");
        Ok(())
    }

    /// Appends the transition. Caller holds the attempt lock.
    async fn record(
        &self,
        event: &OrderEvent,
    ) -> Result<(Outcome, OrderAttempt, Option<PaymentIntent>)> {
        let mut prior_intent = None;
        let result = self
            .attempts
            .execute(event.attempt_id, |attempt| {
                prior_intent = attempt.payment_intent().cloned();
                attempt.transition(&event.event_id, event.kind.clone(), event.at)
            })
            .await;

        let result = match result {
            Ok(result) => result,
            Err(e) => {
                let err = FulfillmentError::from_attempt(event.attempt_id, e);
                if let FulfillmentError::InvalidTransition { from, to, .. } = &err {
                    metrics::counter!("order_transitions_rejected_total").increment(1);
                    tracing::warn!(
                        attempt_id = %event.attempt_id,
                        event_id = %event.event_id,
                        source = event.source.as_str(),
                        %from,
                        %to,
                        "transition rejected"
                    );
                }
                return Err(err);
            }
        };

        let state = result.aggregate.state();
        if result.is_noop() {
            metrics::counter!("order_events_duplicate_total").increment(1);
            tracing::debug!(
                attempt_id = %event.attempt_id,
                event_id = %event.event_id,
                source = event.source.as_str(),
                %state,
                "duplicate event dropped"
            );
            return Ok((Outcome::Duplicate(state), result.aggregate, prior_intent));
        }

        self.track(&result.aggregate).await;
        metrics::counter!("order_transitions_total", "to" => state.as_str()).increment(1);
        tracing::info!(
            attempt_id = %event.attempt_id,
            event_id = %event.event_id,
            source = event.source.as_str(),
            to = %state,
            "transition applied"
        );
        Ok((Outcome::Applied(state), result.aggregate, prior_intent))
    }

    /// PaymentCaptured -> commit stock -> OrderConfirmed.
    async fn finish_capture(&self, attempt: &OrderAttempt, at: DateTime<Utc>) -> Result<Outcome> {
        let attempt_id = attempt
            .id()
            .ok_or_else(|| FulfillmentError::Domain(domain::AttemptError::NotFound.into()))?;
        let reservation_id = reservation_of(attempt_id, attempt);

        match self.ledger.reservation(reservation_id).await? {
            Some(reservation) if reservation.is_held() => {
                self.ledger.commit(reservation_id, at).await?;
            }
            Some(reservation) if reservation.state() == ReservationState::Committed => {
                tracing::debug!(%reservation_id, "reservation already committed");
            }
            Some(reservation) => {
                tracing::error!(
                    %attempt_id,
                    %reservation_id,
                    state = %reservation.state(),
                    "captured payment has no stock to commit"
                );
                return Err(FulfillmentError::InvalidReservationState {
                    reservation_id,
                    state: reservation.state(),
                });
            }
            None => {
                return Err(FulfillmentError::Domain(
                    domain::ReservationError::NotFound.into(),
                ));
            }
        }

        let confirm = OrderEvent::new(
            attempt_id,
            format!("machine:{attempt_id}:confirm"),
            EventSource::Machine,
            TransitionKind::OrderConfirmed,
        )
        .at(at);
        let (outcome, confirmed, _) = self.record(&confirm).await?;
        if outcome.is_applied() {
            self.notify(&confirmed, NotificationKind::Confirmed).await;
        }
        Ok(outcome)
    }

    /// Voids the authorization of a `PaymentAuthorized` attempt before it is
    /// canceled or expired. Caller holds the attempt lock.
    ///
    /// A capture may be in flight outside the lock. Once the void succeeds
    /// that capture can no longer take effect; if the void is refused the
    /// provider is asked whether the money was already taken.
    async fn void_authorization(&self, event: &OrderEvent) -> Result<Void> {
        if !matches!(
            event.kind,
            TransitionKind::Canceled { .. } | TransitionKind::ReservationExpired
        ) {
            return Ok(Void::NotNeeded);
        }
        let Some(attempt) = self.attempts.load_existing(event.attempt_id).await? else {
            return Ok(Void::NotNeeded);
        };
        if attempt.state() != AttemptState::PaymentAuthorized {
            return Ok(Void::NotNeeded);
        }

        let refused = match self.payments.cancel(&attempt).await {
            Ok(()) => return Ok(Void::Voided),
            Err(e) => e,
        };
        tracing::warn!(attempt_id = %event.attempt_id, error = %refused, "void refused, checking payment status");

        match self.payments.status(&attempt).await?.map(|payment| payment.status) {
            Some(ProviderStatus::Captured) => Ok(Void::Captured),
            Some(ProviderStatus::Authorized) => Err(refused),
            Some(ProviderStatus::Canceled | ProviderStatus::Failed(_)) | None => Ok(Void::Voided),
        }
    }

    /// Records the capture the provider reported in place of `event`, then
    /// confirms the order. Returns the rejection for `event`.
    async fn capture_instead(&self, event: &OrderEvent) -> Result<FulfillmentError> {
        let attempt_id = event.attempt_id;
        tracing::info!(%attempt_id, event_id = %event.event_id, "payment already captured, confirming instead");

        let captured = OrderEvent::new(
            attempt_id,
            format!("machine:{attempt_id}:capture"),
            EventSource::Machine,
            TransitionKind::PaymentCaptured,
        )
        .at(event.at);
        let (outcome, attempt, _) = self.record(&captured).await?;
        let state = if outcome.is_applied() {
            self.finish_capture(&attempt, event.at).await?.state()
        } else {
            outcome.state()
        };

        Ok(FulfillmentError::InvalidTransition {
            attempt_id,
            from: state,
            to: event.kind.target(),
        })
    }

    /// Releases stock and voids any live authorization of a failed attempt.
    ///
    /// Errors are logged; the sweeper releases holds of failed attempts that
    /// this misses.
    async fn unwind(
        &self,
        attempt: &OrderAttempt,
        prior_intent: Option<&PaymentIntent>,
        at: DateTime<Utc>,
    ) {
        let Some(attempt_id) = attempt.id() else {
            return;
        };
        let (reason, kind) = match attempt.state() {
            AttemptState::ReservationExpired => (ReleaseReason::Expired, NotificationKind::Canceled),
            AttemptState::PaymentFailed => (ReleaseReason::PaymentFailed, NotificationKind::Failed),
            _ => (ReleaseReason::Canceled, NotificationKind::Canceled),
        };

        let reservation_id = reservation_of(attempt_id, attempt);
        if let Err(e) = self.ledger.release(reservation_id, reason, at).await {
            tracing::error!(%attempt_id, %reservation_id, error = %e, "failed to release reservation");
        }

        if prior_intent.is_some_and(|intent| intent.state.is_voidable())
            && let Err(e) = self.payments.cancel(attempt).await
        {
            tracing::warn!(%attempt_id, error = %e, "failed to void authorization");
        }

        self.notify(attempt, kind).await;
    }

    /// Keeps the live index in step with an attempt just written.
    async fn track(&self, attempt: &OrderAttempt) {
        let Some(attempt_id) = attempt.id() else {
            return;
        };
        let mut live = self.live.write().await;
        match LiveAttempt::of(attempt) {
            Some(entry) => live.insert(attempt_id, entry),
            None => live.remove(&attempt_id),
        };
    }

    async fn index_reference(&self, attempt: &OrderAttempt) {
        if let (Some(id), Some(reference)) = (attempt.id(), attempt.provider_reference()) {
            self.references
                .write()
                .await
                .insert(reference.to_string(), id);
        }
    }

    async fn notify(&self, attempt: &OrderAttempt, kind: NotificationKind) {
        let Some(attempt_id) = attempt.id() else {
            return;
        };
        self.notifier
            .notify(Notification {
                attempt_id,
                shopper_id: attempt.shopper_id(),
                kind,
                order_id: attempt.order().map(|order| order.order_id),
            })
            .await;
    }
}

fn reservation_of(attempt_id: AggregateId, attempt: &OrderAttempt) -> AggregateId {
    attempt
        .reservation_id()
        .unwrap_or_else(|| Reservation::id_for_attempt(attempt_id))
}
