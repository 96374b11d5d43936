use serde::{Deserialize, Serialize};

/// Category of a failed or canceled attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    InsufficientStock,
    CartInvalid,
    PaymentDeclined,
    ProviderUnavailable,
    CaptureFailed,
    ShopperCanceled,
    ReservationExpired,
    /// Reported asynchronously by the payment provider.
    ProviderReported,
}

/// Why an attempt ended without an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    pub kind: FailureKind,
    pub message: String,
}

impl FailureReason {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn shopper_canceled() -> Self {
        Self::new(FailureKind::ShopperCanceled, "canceled by shopper")
    }

    pub fn reservation_expired() -> Self {
        Self::new(
            FailureKind::ReservationExpired,
            "reservation expired before payment completed",
        )
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}
