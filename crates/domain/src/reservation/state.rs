use serde::{Deserialize, Serialize};

/// Lifecycle of a stock hold.
///
/// ```text
/// Held ──┬──► Committed
///        └──► Released
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ReservationState {
    #[default]
    Held,
    Committed,
    Released,
}

impl ReservationState {
    pub fn is_held(&self) -> bool {
        matches!(self, ReservationState::Held)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationState::Held => "Held",
            ReservationState::Committed => "Committed",
            ReservationState::Released => "Released",
        }
    }
}

impl std::fmt::Display for ReservationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
