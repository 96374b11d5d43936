//! Drives the payment provider through authorize, capture and cancel.

use std::future::Future;
use std::time::Duration;

use common::AggregateId;
use domain::{
    Aggregate, AttemptError, IdempotencyKey, OrderAttempt, PaymentIntent, PaymentIntentState,
};

use super::provider::{
    AuthorizeRequest, PaymentProvider, ProviderError, ProviderPayment, ProviderStatus,
};
use super::retry::RetryPolicy;
use crate::error::{FulfillmentError, Result};

/// Decides whether a looked-up payment settles an ambiguous call.
/// `None` means the call did not take effect and may be resubmitted.
type Settle = fn(ProviderPayment) -> Option<std::result::Result<ProviderPayment, ProviderError>>;

enum Resolution {
    Settled(std::result::Result<ProviderPayment, ProviderError>),
    /// The provider never applied the call.
    NotApplied,
    Unknown(ProviderError),
}

/// Talks to the payment provider on behalf of order attempts.
///
/// Every request carries the attempt's idempotency key. Calls that fail
/// without being processed are retried with exponential backoff. A timeout
/// leaves the outcome unknown, so before any resubmission, and once more
/// after the last one, the provider is asked what it did with the key. An
/// outcome that stays unknown is reported as `PaymentPending`, never as a
/// failure.
pub struct PaymentOrchestrator<P>
where
    P: PaymentProvider,
{
    provider: P,
    retry: RetryPolicy,
    timeout: Duration,
}

impl<P> PaymentOrchestrator<P>
where
    P: PaymentProvider,
{
    pub fn new(provider: P, retry: RetryPolicy, timeout: Duration) -> Self {
        Self {
            provider,
            retry,
            timeout,
        }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Authorizes the attempt's payment intent.
    ///
    /// Returns the intent as it stands after authorization, carrying the
    /// provider reference.
    #[tracing::instrument(skip(self, attempt), fields(attempt_id = ?attempt.id()))]
    pub async fn authorize(&self, attempt: &OrderAttempt) -> Result<PaymentIntent> {
        let (attempt_id, key, intent) = parts(attempt)?;
        let request = AuthorizeRequest {
            attempt_id,
            idempotency_key: key.clone(),
            amount: intent.amount,
            currency: intent.currency.clone(),
        };

        let payment = self
            .call_with_retry("authorize", key, settled_authorization, || {
                self.provider.authorize(&request)
            })
            .await
            .map_err(|e| match e {
                ProviderError::Declined(reason) => FulfillmentError::PaymentDeclined(reason),
                ProviderError::Timeout => FulfillmentError::PaymentPending("authorize".to_string()),
                other => FulfillmentError::ProviderUnavailable(other.to_string()),
            })?;

        tracing::info!(reference = %payment.reference, "payment authorized");
        let mut intent = intent.clone();
        intent.state = PaymentIntentState::Authorized;
        intent.provider_reference = Some(payment.reference);
        Ok(intent)
    }

    /// Captures a previously authorized payment.
    #[tracing::instrument(skip(self, attempt), fields(attempt_id = ?attempt.id()))]
    pub async fn capture(&self, attempt: &OrderAttempt) -> Result<PaymentIntent> {
        let (attempt_id, key, intent) = parts(attempt)?;
        let reference = intent
            .provider_reference
            .as_deref()
            .ok_or(FulfillmentError::NoPaymentIntent(attempt_id))?;

        self.call_with_retry("capture", key, settled_capture, || {
            self.provider.capture(reference, key)
        })
        .await
        .map_err(|e| match e {
            ProviderError::Declined(reason) => FulfillmentError::CaptureFailed(reason),
            ProviderError::Timeout => FulfillmentError::PaymentPending("capture".to_string()),
            other => FulfillmentError::ProviderUnavailable(other.to_string()),
        })?;

        tracing::info!(%reference, "payment captured");
        let mut intent = intent.clone();
        intent.state = PaymentIntentState::Captured;
        Ok(intent)
    }

    /// Voids an uncaptured authorization. Not retried.
    #[tracing::instrument(skip(self, attempt), fields(attempt_id = ?attempt.id()))]
    pub async fn cancel(&self, attempt: &OrderAttempt) -> Result<()> {
        let (attempt_id, key, intent) = parts(attempt)?;
        let reference = intent
            .provider_reference
            .as_deref()
            .ok_or(FulfillmentError::NoPaymentIntent(attempt_id))?;

        let result = self.timed(self.provider.cancel(reference, key)).await;
        record_call("cancel", &result);
        result.map_err(|e| FulfillmentError::ProviderUnavailable(e.to_string()))?;

        tracing::info!(%reference, "authorization voided");
        Ok(())
    }

    /// The provider's view of the attempt's payment, if it has one.
    pub async fn status(&self, attempt: &OrderAttempt) -> Result<Option<ProviderPayment>> {
        let (_, key, _) = parts(attempt)?;
        self.timed(self.provider.lookup(key))
            .await
            .map_err(|e| FulfillmentError::ProviderUnavailable(e.to_string()))
    }

    async fn call_with_retry<F, Fut>(
        &self,
        op: &'static str,
        key: &IdempotencyKey,
        settle: Settle,
        mut call: F,
    ) -> std::result::Result<ProviderPayment, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<ProviderPayment, ProviderError>>,
    {
        let mut last_error = ProviderError::Timeout;
        let mut ambiguous = false;

        for attempt in 0..=self.retry.max_retries {
            if attempt > 0 {
                tokio::time::sleep(self.retry.delay_for_attempt(attempt - 1)).await;
            }

            if ambiguous {
                match self.resolve(op, key, settle).await {
                    Resolution::Settled(settled) => return settled,
                    Resolution::NotApplied => ambiguous = false,
                    Resolution::Unknown(e) => {
                        last_error = e;
                        continue;
                    }
                }
            }

            let result = self.timed(call()).await;
            record_call(op, &result);
            match result {
                Ok(payment) => return Ok(payment),
                Err(ProviderError::Declined(reason)) => {
                    return Err(ProviderError::Declined(reason));
                }
                Err(e) => {
                    tracing::warn!(op, attempt, error = %e, "provider call failed");
                    ambiguous = e == ProviderError::Timeout;
                    last_error = e;
                }
            }
        }

        // The last call may have taken effect; ask once more before giving up.
        if ambiguous {
            match self.resolve(op, key, settle).await {
                Resolution::Settled(settled) => return settled,
                Resolution::NotApplied => {
                    last_error = ProviderError::Unavailable(format!("{op} was not applied"));
                }
                Resolution::Unknown(_) => {
                    tracing::error!(op, "provider outcome unknown after retries");
                    return Err(ProviderError::Timeout);
                }
            }
        }

        tracing::error!(op, retries = self.retry.max_retries, error = %last_error, "provider retries exhausted");
        Err(last_error)
    }

    /// Asks the provider what became of the call made under `key`.
    async fn resolve(&self, op: &'static str, key: &IdempotencyKey, settle: Settle) -> Resolution {
        match self.timed(self.provider.lookup(key)).await {
            Ok(Some(payment)) => match settle(payment) {
                Some(settled) => {
                    tracing::info!(op, "ambiguous call resolved by lookup");
                    metrics::counter!(
                        "payment_provider_calls_total",
                        "op" => op,
                        "outcome" => "resolved"
                    )
                    .increment(1);
                    Resolution::Settled(settled)
                }
                None => Resolution::NotApplied,
            },
            Ok(None) => Resolution::NotApplied,
            Err(e) => {
                tracing::warn!(op, error = %e, "status lookup failed");
                Resolution::Unknown(e)
            }
        }
    }

    async fn timed<T>(
        &self,
        fut: impl Future<Output = std::result::Result<T, ProviderError>>,
    ) -> std::result::Result<T, ProviderError> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout),
        }
    }
}

fn parts(attempt: &OrderAttempt) -> Result<(AggregateId, &IdempotencyKey, &PaymentIntent)> {
    let Some(attempt_id) = attempt.id() else {
        return Err(FulfillmentError::Domain(AttemptError::NotFound.into()));
    };
    let key = attempt
        .idempotency_key()
        .ok_or(FulfillmentError::AttemptNotFound(attempt_id))?;
    let intent = attempt
        .payment_intent()
        .ok_or(FulfillmentError::NoPaymentIntent(attempt_id))?;
    Ok((attempt_id, key, intent))
}

fn settled_authorization(
    payment: ProviderPayment,
) -> Option<std::result::Result<ProviderPayment, ProviderError>> {
    match &payment.status {
        ProviderStatus::Authorized | ProviderStatus::Captured => Some(Ok(payment)),
        ProviderStatus::Failed(reason) => Some(Err(ProviderError::Declined(reason.clone()))),
        ProviderStatus::Canceled => Some(Err(ProviderError::Declined(
            "payment was canceled".to_string(),
        ))),
    }
}

fn settled_capture(
    payment: ProviderPayment,
) -> Option<std::result::Result<ProviderPayment, ProviderError>> {
    match &payment.status {
        ProviderStatus::Captured => Some(Ok(payment)),
        ProviderStatus::Authorized => None,
        ProviderStatus::Failed(reason) => Some(Err(ProviderError::Declined(reason.clone()))),
        ProviderStatus::Canceled => Some(Err(ProviderError::Declined(
            "payment was canceled".to_string(),
        ))),
    }
}

fn record_call<T>(op: &'static str, result: &std::result::Result<T, ProviderError>) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(ProviderError::Declined(_)) => "declined",
        Err(ProviderError::Unavailable(_)) => "unavailable",
        Err(ProviderError::Timeout) => "timeout",
    };
    metrics::counter!("payment_provider_calls_total", "op" => op, "outcome" => outcome)
        .increment(1);
}
