//! Background expiry of stock holds and abandoned attempts.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::AggregateId;
use domain::{Aggregate, AttemptState, FailureReason, ReleaseReason, TransitionKind};
use event_store::EventStore;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{FulfillmentError, Result};
use crate::ledger::InventoryLedger;
use crate::machine::{EventSource, OrderEvent, OrderStateMachine};
use crate::payment::PaymentProvider;

/// What one sweep pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Attempts moved to a failure state because their hold expired.
    pub expired: usize,
    /// Holds released directly (failed or missing attempt).
    pub released: usize,
    /// Captured attempts whose confirmation was re-driven.
    pub confirmed: usize,
    /// Attempts that never got a hold and were canceled after the TTL.
    pub abandoned: usize,
}

/// Periodic backstop for holds and attempts nobody resolved.
///
/// Expiry goes through the order state machine like any other event. An
/// authorized attempt is voided before it expires; if the provider reports
/// the capture already landed, the machine confirms the order instead. A
/// pass only visits the ledger's held reservations and the machine's open
/// attempts.
pub struct ExpirySweeper<S, P>
where
    S: EventStore,
    P: PaymentProvider,
{
    ledger: Arc<InventoryLedger<S>>,
    machine: Arc<OrderStateMachine<S, P>>,
    /// Age after which a `Created` attempt without a hold is abandoned.
    ttl: chrono::Duration,
}

impl<S, P> ExpirySweeper<S, P>
where
    S: EventStore + Clone,
    P: PaymentProvider,
{
    pub fn new(
        ledger: Arc<InventoryLedger<S>>,
        machine: Arc<OrderStateMachine<S, P>>,
        ttl: chrono::Duration,
    ) -> Self {
        Self {
            ledger,
            machine,
            ttl,
        }
    }

    /// Runs one sweep pass as of `now`.
    #[tracing::instrument(skip(self))]
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let mut holding = HashSet::new();

        for hold in self.ledger.holds().await {
            let reservation_id = hold.reservation_id;
            let attempt = match hold.attempt_id {
                Some(attempt_id) => {
                    holding.insert(attempt_id);
                    self.machine.attempt(attempt_id).await?
                }
                None => None,
            };

            match attempt {
                None if hold.is_expired(now) => {
                    if self.release(reservation_id, ReleaseReason::Orphaned, now).await {
                        report.released += 1;
                    }
                }
                None => {}
                Some(attempt) if attempt.state().is_failure() => {
                    let reason = match attempt.state() {
                        AttemptState::ReservationExpired => ReleaseReason::Expired,
                        AttemptState::PaymentFailed => ReleaseReason::PaymentFailed,
                        _ => ReleaseReason::Canceled,
                    };
                    if self.release(reservation_id, reason, now).await {
                        report.released += 1;
                    }
                }
                Some(attempt) if attempt.state().is_pre_capture() && hold.is_expired(now) => {
                    let Some(attempt_id) = attempt.id() else {
                        continue;
                    };
                    // Created has no transition to ReservationExpired.
                    let kind = if attempt.state() == AttemptState::Created {
                        TransitionKind::Canceled {
                            reason: FailureReason::reservation_expired(),
                        }
                    } else {
                        TransitionKind::ReservationExpired
                    };
                    let event = OrderEvent::new(
                        attempt_id,
                        format!("sweeper:{reservation_id}:expired"),
                        EventSource::Sweeper,
                        kind,
                    )
                    .at(now);
                    if self.expire(event).await {
                        metrics::counter!("reservations_expired_total").increment(1);
                        report.expired += 1;
                    }
                }
                Some(_) => {}
            }
        }

        for live in self.machine.live_attempts().await {
            let attempt_id = live.attempt_id;
            match live.state {
                AttemptState::PaymentCaptured => {
                    match self.machine.confirm(attempt_id, now).await {
                        Ok(outcome) if outcome.is_applied() => report.confirmed += 1,
                        Ok(_) => {}
                        Err(e) => {
                            tracing::error!(%attempt_id, error = %e, "failed to confirm captured attempt");
                        }
                    }
                }
                AttemptState::Created
                    if !holding.contains(&attempt_id) && live.since + self.ttl <= now =>
                {
                    let event = OrderEvent::new(
                        attempt_id,
                        format!("sweeper:{attempt_id}:abandoned"),
                        EventSource::Sweeper,
                        TransitionKind::Canceled {
                            reason: FailureReason::reservation_expired(),
                        },
                    )
                    .at(now);
                    if self.expire(event).await {
                        report.abandoned += 1;
                    }
                }
                _ => {}
            }
        }

        if report != SweepReport::default() {
            tracing::info!(
                expired = report.expired,
                released = report.released,
                confirmed = report.confirmed,
                abandoned = report.abandoned,
                "sweep finished"
            );
        }
        Ok(report)
    }

    /// Dispatches a sweeper failure event. True if it was applied.
    async fn expire(&self, event: OrderEvent) -> bool {
        let attempt_id = event.attempt_id;
        match self.machine.dispatch(event).await {
            Ok(outcome) => outcome.is_applied(),
            Err(FulfillmentError::InvalidTransition { .. }) => false,
            Err(e) => {
                tracing::error!(%attempt_id, error = %e, "failed to expire attempt");
                false
            }
        }
    }

    async fn release(
        &self,
        reservation_id: AggregateId,
        reason: ReleaseReason,
        now: DateTime<Utc>,
    ) -> bool {
        match self.ledger.release(reservation_id, reason, now).await {
            Ok(released) => released,
            Err(e) => {
                tracing::error!(%reservation_id, error = %e, "failed to release reservation");
                false
            }
        }
    }
}

impl<S, P> ExpirySweeper<S, P>
where
    S: EventStore + Clone + 'static,
    P: PaymentProvider + 'static,
{
    /// Runs a pass every `interval` until `shutdown` flips.
    pub fn spawn(
        self: Arc<Self>,
        interval: std::time::Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_once(Utc::now()).await {
                            tracing::error!(error = %e, "sweep failed");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            tracing::info!("expiry sweeper stopped");
        })
    }
}
