use serde::{Deserialize, Serialize};

use common::AggregateId;

use crate::values::Money;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum PaymentIntentState {
    #[default]
    Created,
    Authorized,
    Captured,
    Failed,
    Canceled,
}

impl PaymentIntentState {
    /// An authorization exists at the provider that has not been captured.
    pub fn is_voidable(&self) -> bool {
        matches!(self, PaymentIntentState::Authorized)
    }
}

/// Our record of a charge at the payment provider.
///
/// `provider_reference` is set once the provider has authorized and is the
/// join key for webhooks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub payment_intent_id: AggregateId,
    pub provider: String,
    pub amount: Money,
    pub currency: String,
    pub state: PaymentIntentState,
    pub provider_reference: Option<String>,
}

impl PaymentIntent {
    pub fn id_for_attempt(attempt_id: AggregateId) -> AggregateId {
        AggregateId::derive("payment_intent", &attempt_id.to_string())
    }
}
