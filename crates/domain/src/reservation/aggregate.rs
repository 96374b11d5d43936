use chrono::{DateTime, Utc};
use common::AggregateId;
use event_store::Version;
use serde::{Deserialize, Serialize};

use super::{
    ReleaseReason, ReservationError, ReservationEvent, ReservationState,
    events::{ReservationCommittedData, ReservationHeldData, ReservationReleasedData},
};
use crate::aggregate::Aggregate;
use crate::values::VariantId;

/// Quantity of one variant held by a reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationLine {
    pub variant_id: VariantId,
    pub quantity: u32,
}

impl ReservationLine {
    pub fn new(variant_id: impl Into<VariantId>, quantity: u32) -> Self {
        Self {
            variant_id: variant_id.into(),
            quantity,
        }
    }
}

/// A hold on stock for one order attempt, all lines at once.
#[derive(Debug, Clone, Default)]
pub struct Reservation {
    id: Option<AggregateId>,
    version: Version,
    order_attempt_id: Option<AggregateId>,
    lines: Vec<ReservationLine>,
    expires_at: Option<DateTime<Utc>>,
    state: ReservationState,
    release_reason: Option<ReleaseReason>,
}

impl Aggregate for Reservation {
    type Event = ReservationEvent;
    type Error = ReservationError;

    fn aggregate_type() -> &'static str {
        "Reservation"
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
        match event {
            ReservationEvent::ReservationHeld(data) => {
                self.id = Some(data.reservation_id);
                self.order_attempt_id = Some(data.order_attempt_id);
                self.lines = data.lines;
                self.expires_at = Some(data.expires_at);
                self.state = ReservationState::Held;
            }
            ReservationEvent::ReservationCommitted(_) => {
                self.state = ReservationState::Committed;
            }
            ReservationEvent::ReservationReleased(data) => {
                self.state = ReservationState::Released;
                self.release_reason = Some(data.reason);
            }
        }
    }
}

// Queries
impl Reservation {
    /// The reservation stream for an order attempt. One per attempt.
    pub fn id_for_attempt(order_attempt_id: AggregateId) -> AggregateId {
        AggregateId::derive("reservation", &order_attempt_id.to_string())
    }

    pub fn order_attempt_id(&self) -> Option<AggregateId> {
        self.order_attempt_id
    }

    pub fn lines(&self) -> &[ReservationLine] {
        &self.lines
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn state(&self) -> ReservationState {
        self.state
    }

    pub fn release_reason(&self) -> Option<ReleaseReason> {
        self.release_reason
    }

    pub fn is_held(&self) -> bool {
        self.id.is_some() && self.state.is_held()
    }

    /// True for a Held reservation whose window has passed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.is_held() && self.expires_at.is_some_and(|at| at <= now)
    }
}

// Commands
impl Reservation {
    pub fn hold(
        &self,
        reservation_id: AggregateId,
        order_attempt_id: AggregateId,
        lines: Vec<ReservationLine>,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<ReservationEvent>, ReservationError> {
        if let Some(id) = self.id {
            return Err(ReservationError::AlreadyExists(id));
        }
        if lines.is_empty() {
            return Err(ReservationError::Empty);
        }

        Ok(vec![ReservationEvent::ReservationHeld(ReservationHeldData {
            reservation_id,
            order_attempt_id,
            lines,
            expires_at,
            held_at: now,
        })])
    }

    pub fn commit(&self, now: DateTime<Utc>) -> Result<Vec<ReservationEvent>, ReservationError> {
        let id = self.require_id()?;
        if !self.state.is_held() {
            return Err(ReservationError::InvalidState {
                reservation_id: id,
                state: self.state,
            });
        }

        Ok(vec![ReservationEvent::ReservationCommitted(
            ReservationCommittedData { committed_at: now },
        )])
    }

    /// Releases a Held reservation. Anything else is a no-op.
    pub fn release(
        &self,
        reason: ReleaseReason,
        now: DateTime<Utc>,
    ) -> Result<Vec<ReservationEvent>, ReservationError> {
        self.require_id()?;
        if !self.state.is_held() {
            return Ok(vec![]);
        }

        Ok(vec![ReservationEvent::ReservationReleased(
            ReservationReleasedData {
                reason,
                released_at: now,
            },
        )])
    }

    fn require_id(&self) -> Result<AggregateId, ReservationError> {
        self.id.ok_or(ReservationError::NotFound)
    }
}
