//! Payment provider interface: authorize, capture, cancel and idempotent status lookup.

use async_trait::async_trait;
use common::AggregateId;
use domain::{IdempotencyKey, Money};
use thiserror::Error;

/// Provider-side status of a payment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderStatus {
    Authorized,
    Captured,
    Canceled,
    Failed(String),
}

/// A payment as the provider reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderPayment {
    pub reference: String,
    pub amount: Money,
    pub status: ProviderStatus,
}

#[derive(Debug, Clone)]
pub struct AuthorizeRequest {
    pub attempt_id: AggregateId,
    pub idempotency_key: IdempotencyKey,
    pub amount: Money,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// The provider processed the request and refused it.
    #[error("declined: {0}")]
    Declined(String),

    /// The provider refused the request without processing it.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// No answer in time; the provider may or may not have acted.
    #[error("request timed out")]
    Timeout,
}

/// Network API of a payment provider.
///
/// Every call carries the attempt's idempotency key; the provider applies a
/// key at most once and answers repeats with the original result.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Provider name recorded on payment intents.
    fn name(&self) -> &str;

    async fn authorize(&self, request: &AuthorizeRequest) -> Result<ProviderPayment, ProviderError>;

    async fn capture(
        &self,
        reference: &str,
        key: &IdempotencyKey,
    ) -> Result<ProviderPayment, ProviderError>;

    async fn cancel(&self, reference: &str, key: &IdempotencyKey) -> Result<(), ProviderError>;

    /// What the provider knows about the payment made under `key`, if any.
    async fn lookup(&self, key: &IdempotencyKey) -> Result<Option<ProviderPayment>, ProviderError>;
}
