//! Scriptable in-memory payment provider.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use domain::IdempotencyKey;
use tokio::sync::Mutex;

use super::provider::{
    AuthorizeRequest, PaymentProvider, ProviderError, ProviderPayment, ProviderStatus,
};

#[derive(Debug, Default)]
struct ProviderState {
    /// Payments by idempotency key.
    payments: HashMap<String, ProviderPayment>,
    /// Provider reference to idempotency key.
    references: HashMap<String, String>,
    next_reference: u32,
    decline_authorizations: bool,
    decline_captures: bool,
    unavailable_remaining: u32,
    timeouts_remaining: u32,
    lookup_failures_remaining: u32,
    capture_delay: Duration,
    authorize_calls: u32,
    capture_calls: u32,
    cancel_calls: u32,
}

impl ProviderState {
    fn take_unavailable(&mut self) -> Result<(), ProviderError> {
        if self.unavailable_remaining > 0 {
            self.unavailable_remaining -= 1;
            return Err(ProviderError::Unavailable("service unavailable".to_string()));
        }
        Ok(())
    }

    fn take_timeout(&mut self) -> Result<(), ProviderError> {
        if self.timeouts_remaining > 0 {
            self.timeouts_remaining -= 1;
            return Err(ProviderError::Timeout);
        }
        Ok(())
    }

    fn by_reference(&mut self, reference: &str) -> Option<&mut ProviderPayment> {
        let key = self.references.get(reference)?;
        self.payments.get_mut(key)
    }
}

/// In-memory provider for development and tests.
///
/// Applies each idempotency key at most once. Failures are scripted:
/// declines, transient unavailability (request not processed) and
/// ambiguous timeouts (request processed, answer lost).
#[derive(Debug, Clone, Default)]
pub struct InMemoryPaymentProvider {
    state: Arc<Mutex<ProviderState>>,
}

impl InMemoryPaymentProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn decline_authorizations(&self, decline: bool) {
        self.state.lock().await.decline_authorizations = decline;
    }

    pub async fn decline_captures(&self, decline: bool) {
        self.state.lock().await.decline_captures = decline;
    }

    /// The next `n` calls fail as unavailable without being processed.
    pub async fn fail_next(&self, n: u32) {
        self.state.lock().await.unavailable_remaining = n;
    }

    /// The next `n` authorize/capture calls are processed but time out.
    pub async fn time_out_next(&self, n: u32) {
        self.state.lock().await.timeouts_remaining = n;
    }

    /// The next `n` status lookups fail as unavailable.
    pub async fn fail_lookups(&self, n: u32) {
        self.state.lock().await.lookup_failures_remaining = n;
    }

    /// Delays capture responses after the capture has taken effect.
    pub async fn set_capture_delay(&self, delay: Duration) {
        self.state.lock().await.capture_delay = delay;
    }

    pub async fn authorize_calls(&self) -> u32 {
        self.state.lock().await.authorize_calls
    }

    pub async fn capture_calls(&self) -> u32 {
        self.state.lock().await.capture_calls
    }

    pub async fn cancel_calls(&self) -> u32 {
        self.state.lock().await.cancel_calls
    }

    /// Number of distinct payments created.
    pub async fn payment_count(&self) -> usize {
        self.state.lock().await.payments.len()
    }

    pub async fn payment(&self, reference: &str) -> Option<ProviderPayment> {
        self.state.lock().await.by_reference(reference).cloned()
    }
}

#[async_trait]
impl PaymentProvider for InMemoryPaymentProvider {
    fn name(&self) -> &str {
        "in-memory"
    }

    async fn authorize(&self, request: &AuthorizeRequest) -> Result<ProviderPayment, ProviderError> {
        let mut state = self.state.lock().await;
        state.authorize_calls += 1;
        state.take_unavailable()?;

        let key = request.idempotency_key.as_str();
        if let Some(existing) = state.payments.get(key) {
            return match &existing.status {
                ProviderStatus::Failed(reason) => Err(ProviderError::Declined(reason.clone())),
                _ => Ok(existing.clone()),
            };
        }

        state.next_reference += 1;
        let reference = format!("pay_{:06}", state.next_reference);
        let status = if state.decline_authorizations {
            ProviderStatus::Failed("card declined".to_string())
        } else {
            ProviderStatus::Authorized
        };
        let payment = ProviderPayment {
            reference: reference.clone(),
            amount: request.amount,
            status,
        };
        state.payments.insert(key.to_string(), payment.clone());
        state.references.insert(reference, key.to_string());

        if let ProviderStatus::Failed(reason) = &payment.status {
            return Err(ProviderError::Declined(reason.clone()));
        }
        state.take_timeout()?;
        Ok(payment)
    }

    async fn capture(
        &self,
        reference: &str,
        _key: &IdempotencyKey,
    ) -> Result<ProviderPayment, ProviderError> {
        let (payment, delay) = {
            let mut state = self.state.lock().await;
            state.capture_calls += 1;
            state.take_unavailable()?;

            let decline = state.decline_captures;
            let delay = state.capture_delay;
            let payment = state
                .by_reference(reference)
                .ok_or_else(|| ProviderError::Declined(format!("unknown payment {reference}")))?;

            match payment.status.clone() {
                ProviderStatus::Captured => {}
                ProviderStatus::Authorized if decline => {
                    payment.status = ProviderStatus::Failed("capture rejected".to_string());
                    return Err(ProviderError::Declined("capture rejected".to_string()));
                }
                ProviderStatus::Authorized => payment.status = ProviderStatus::Captured,
                ProviderStatus::Canceled => {
                    return Err(ProviderError::Declined("payment was canceled".to_string()));
                }
                ProviderStatus::Failed(reason) => return Err(ProviderError::Declined(reason)),
            }
            let payment = payment.clone();
            state.take_timeout()?;
            (payment, delay)
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(payment)
    }

    async fn cancel(&self, reference: &str, _key: &IdempotencyKey) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        state.cancel_calls += 1;
        state.take_unavailable()?;

        let payment = state
            .by_reference(reference)
            .ok_or_else(|| ProviderError::Declined(format!("unknown payment {reference}")))?;
        match payment.status.clone() {
            ProviderStatus::Authorized => {
                payment.status = ProviderStatus::Canceled;
                Ok(())
            }
            ProviderStatus::Captured => {
                Err(ProviderError::Declined("payment already captured".to_string()))
            }
            ProviderStatus::Canceled | ProviderStatus::Failed(_) => Ok(()),
        }
    }

    async fn lookup(&self, key: &IdempotencyKey) -> Result<Option<ProviderPayment>, ProviderError> {
        let mut state = self.state.lock().await;
        if state.lookup_failures_remaining > 0 {
            state.lookup_failures_remaining -= 1;
            return Err(ProviderError::Unavailable("status lookup unavailable".to_string()));
        }
        Ok(state.payments.get(key.as_str()).cloned())
    }
}

#[cfg(test)]
mod tests {
    use common::AggregateId;
    use domain::{Money, ShopperId};

    use super::*;

    fn request() -> AuthorizeRequest {
        let key = IdempotencyKey::derive(&ShopperId::new(), "cart", 1);
        AuthorizeRequest {
            attempt_id: key.attempt_id(),
            idempotency_key: key,
            amount: Money::from_cents(3000),
            currency: "USD".to_string(),
        }
    }

    #[tokio::test]
    async fn authorize_is_idempotent_per_key() {
        let provider = InMemoryPaymentProvider::new();
        let request = request();

        let first = provider.authorize(&request).await.unwrap();
        let second = provider.authorize(&request).await.unwrap();

        assert_eq!(first.reference, second.reference);
        assert_eq!(provider.payment_count().await, 1);
        assert_eq!(provider.authorize_calls().await, 2);
    }

    #[tokio::test]
    async fn ambiguous_timeout_still_creates_payment() {
        let provider = InMemoryPaymentProvider::new();
        provider.time_out_next(1).await;
        let request = request();

        assert_eq!(
            provider.authorize(&request).await.unwrap_err(),
            ProviderError::Timeout
        );
        let found = provider.lookup(&request.idempotency_key).await.unwrap();
        assert_eq!(found.unwrap().status, ProviderStatus::Authorized);
    }

    #[tokio::test]
    async fn unavailable_does_not_process() {
        let provider = InMemoryPaymentProvider::new();
        provider.fail_next(1).await;
        let request = request();

        assert!(matches!(
            provider.authorize(&request).await,
            Err(ProviderError::Unavailable(_))
        ));
        assert!(provider.lookup(&request.idempotency_key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn capture_then_cancel_is_refused() {
        let provider = InMemoryPaymentProvider::new();
        let request = request();
        let payment = provider.authorize(&request).await.unwrap();

        let captured = provider
            .capture(&payment.reference, &request.idempotency_key)
            .await
            .unwrap();
        assert_eq!(captured.status, ProviderStatus::Captured);
        assert!(
            provider
                .cancel(&payment.reference, &request.idempotency_key)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn declined_key_stays_declined() {
        let provider = InMemoryPaymentProvider::new();
        provider.decline_authorizations(true).await;
        let request = AuthorizeRequest {
            attempt_id: AggregateId::new(),
            ..request()
        };

        assert!(matches!(
            provider.authorize(&request).await,
            Err(ProviderError::Declined(_))
        ));
        provider.decline_authorizations(false).await;
        assert!(matches!(
            provider.authorize(&request).await,
            Err(ProviderError::Declined(_))
        ));
    }
}
