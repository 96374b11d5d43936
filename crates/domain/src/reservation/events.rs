use chrono::{DateTime, Utc};
use common::AggregateId;
use serde::{Deserialize, Serialize};

use super::ReservationLine;
use crate::aggregate::DomainEvent;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ReservationEvent {
    ReservationHeld(ReservationHeldData),
    ReservationCommitted(ReservationCommittedData),
    ReservationReleased(ReservationReleasedData),
}

impl DomainEvent for ReservationEvent {
    fn event_type(&self) -> &'static str {
        match self {
            ReservationEvent::ReservationHeld(_) => "ReservationHeld",
            ReservationEvent::ReservationCommitted(_) => "ReservationCommitted",
            ReservationEvent::ReservationReleased(_) => "ReservationReleased",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationHeldData {
    pub reservation_id: AggregateId,
    pub order_attempt_id: AggregateId,
    pub lines: Vec<ReservationLine>,
    pub expires_at: DateTime<Utc>,
    pub held_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationCommittedData {
    pub committed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationReleasedData {
    pub reason: ReleaseReason,
    pub released_at: DateTime<Utc>,
}

/// Why held stock went back to the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseReason {
    Expired,
    PaymentFailed,
    Canceled,
    /// The hold outlived its attempt record.
    Orphaned,
}

impl std::fmt::Display for ReleaseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReleaseReason::Expired => "expired",
            ReleaseReason::PaymentFailed => "payment_failed",
            ReleaseReason::Canceled => "canceled",
            ReleaseReason::Orphaned => "orphaned",
        };
        f.write_str(s)
    }
}
