//! Provider webhook verification, deduplication and routing.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use domain::{
    Aggregate, FailureKind, FailureReason, IdempotencyKey, Money, OrderAttempt,
    TransitionKind,
};
use event_store::{EventStore, ProcessedEventLog};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{FulfillmentError, Result};
use crate::machine::{EventSource, OrderEvent, OrderStateMachine, Outcome};
use crate::payment::PaymentProvider;

type HmacSha256 = Hmac<Sha256>;

/// An event pushed by the payment provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderEvent {
    /// Provider-assigned id; redeliveries repeat it.
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub provider_reference: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl ProviderEvent {
    fn payload_str(&self, field: &str) -> Option<&str> {
        self.payload.get(field).and_then(|v| v.as_str())
    }
}

/// What became of a webhook delivery. Every outcome is acknowledged to the
/// provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookOutcome {
    Applied,
    Duplicate,
    /// Not valid in the attempt's current state; logged and dropped.
    Rejected,
    /// Event type we do not act on.
    Ignored,
}

impl WebhookOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookOutcome::Applied => "applied",
            WebhookOutcome::Duplicate => "duplicate",
            WebhookOutcome::Rejected => "rejected",
            WebhookOutcome::Ignored => "ignored",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("signature header missing")]
    Missing,
    #[error("signature header malformed")]
    Malformed,
    #[error("signature timestamp outside tolerance")]
    Expired,
    #[error("signature mismatch")]
    Mismatch,
}

/// Checks that a webhook body was sent by the provider.
pub trait SignatureVerifier: Send + Sync {
    fn verify(
        &self,
        body: &[u8],
        header: Option<&str>,
        now: DateTime<Utc>,
    ) -> std::result::Result<(), SignatureError>;
}

/// HMAC-SHA256 over `"<timestamp>.<body>"`, sent as `t=<unix>,v1=<hex>`.
#[derive(Clone)]
pub struct HmacSignatureVerifier {
    secret: Vec<u8>,
    tolerance: chrono::Duration,
}

impl HmacSignatureVerifier {
    pub fn new(secret: impl AsRef<[u8]>, tolerance: chrono::Duration) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
            tolerance,
        }
    }

    /// Builds the header value a provider would send for `body`.
    pub fn sign(&self, body: &[u8], timestamp: i64) -> std::result::Result<String, SignatureError> {
        let mac = self.mac(body, timestamp)?;
        Ok(format!(
            "t={timestamp},v1={}",
            hex::encode(mac.finalize().into_bytes())
        ))
    }

    fn mac(&self, body: &[u8], timestamp: i64) -> std::result::Result<HmacSha256, SignatureError> {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).map_err(|_| SignatureError::Malformed)?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(body);
        Ok(mac)
    }
}

impl SignatureVerifier for HmacSignatureVerifier {
    fn verify(
        &self,
        body: &[u8],
        header: Option<&str>,
        now: DateTime<Utc>,
    ) -> std::result::Result<(), SignatureError> {
        let header = header
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .ok_or(SignatureError::Missing)?;

        let mut timestamp = None;
        let mut signatures = Vec::new();
        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => {
                    timestamp = Some(value.parse::<i64>().map_err(|_| SignatureError::Malformed)?);
                }
                Some(("v1", value)) => {
                    signatures.push(hex::decode(value).map_err(|_| SignatureError::Malformed)?);
                }
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or(SignatureError::Malformed)?;
        if signatures.is_empty() {
            return Err(SignatureError::Malformed);
        }
        if (now.timestamp() - timestamp).abs() > self.tolerance.num_seconds() {
            return Err(SignatureError::Expired);
        }

        let matched = signatures.iter().any(|signature| {
            self.mac(body, timestamp)
                .is_ok_and(|mac| mac.verify_slice(signature).is_ok())
        });
        if matched {
            Ok(())
        } else {
            Err(SignatureError::Mismatch)
        }
    }
}

/// Provider event types we act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Observed {
    Authorized,
    Captured,
    Failed,
    Canceled,
    Refunded,
}

impl Observed {
    fn from_type(event_type: &str) -> Option<Self> {
        match event_type {
            "payment.authorized" => Some(Observed::Authorized),
            "payment.captured" => Some(Observed::Captured),
            "payment.failed" | "payment.capture_failed" => Some(Observed::Failed),
            "payment.canceled" => Some(Observed::Canceled),
            "charge.refunded" => Some(Observed::Refunded),
            _ => None,
        }
    }
}

/// Turns provider webhooks into order events.
///
/// A provider event id is recorded once its event reached a final outcome,
/// so redeliveries are acknowledged without touching the attempt. Events
/// that cannot be routed yet are left unrecorded for the provider to retry.
pub struct WebhookReconciler<S, P>
where
    S: EventStore,
    P: PaymentProvider,
{
    machine: Arc<OrderStateMachine<S, P>>,
    processed: Arc<dyn ProcessedEventLog>,
    verifier: Arc<dyn SignatureVerifier>,
    retention: chrono::Duration,
}

impl<S, P> WebhookReconciler<S, P>
where
    S: EventStore + Clone,
    P: PaymentProvider,
{
    pub fn new(
        machine: Arc<OrderStateMachine<S, P>>,
        processed: Arc<dyn ProcessedEventLog>,
        verifier: Arc<dyn SignatureVerifier>,
        retention: chrono::Duration,
    ) -> Self {
        Self {
            machine,
            processed,
            verifier,
            retention,
        }
    }

    /// Verifies and handles a raw delivery.
    pub async fn ingest(
        &self,
        body: &[u8],
        signature: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<WebhookOutcome> {
        if let Err(e) = self.verifier.verify(body, signature, now) {
            metrics::counter!("webhook_events_total", "outcome" => "invalid_signature").increment(1);
            tracing::warn!(error = %e, "webhook signature rejected");
            return Err(FulfillmentError::InvalidSignature(e.to_string()));
        }

        let event: ProviderEvent = serde_json::from_slice(body).map_err(|e| {
            metrics::counter!("webhook_events_total", "outcome" => "malformed").increment(1);
            FulfillmentError::MalformedWebhook(e.to_string())
        })?;

        self.handle(event, now).await
    }

    /// Handles an already verified event.
    #[tracing::instrument(
        skip(self, event),
        fields(event_id = %event.id, event_type = %event.event_type)
    )]
    pub async fn handle(&self, event: ProviderEvent, now: DateTime<Utc>) -> Result<WebhookOutcome> {
        if self.processed.contains(&event.id).await? {
            return Ok(self.finish(WebhookOutcome::Duplicate));
        }

        let Some(observed) = Observed::from_type(&event.event_type) else {
            self.processed.record(&event.id, now).await?;
            tracing::debug!("webhook type ignored");
            return Ok(self.finish(WebhookOutcome::Ignored));
        };

        let attempt = self.resolve(&event).await?;
        let attempt_id = attempt
            .id()
            .ok_or_else(|| FulfillmentError::UnknownPaymentReference(event.id.clone()))?;
        let kind = transition_for(observed, &event, &attempt)?;

        let dispatched = self
            .machine
            .dispatch(
                OrderEvent::new(
                    attempt_id,
                    format!("provider:{}", event.id),
                    EventSource::Webhook,
                    kind,
                )
                .at(now),
            )
            .await;

        let outcome = match dispatched {
            Ok(Outcome::Applied(_)) => WebhookOutcome::Applied,
            Ok(Outcome::Duplicate(_)) => WebhookOutcome::Duplicate,
            Err(FulfillmentError::InvalidTransition { .. }) => WebhookOutcome::Rejected,
            Err(e) => return Err(e),
        };

        self.processed.record(&event.id, now).await?;
        Ok(self.finish(outcome))
    }

    /// Forgets processed ids older than the retention window.
    pub async fn prune(&self, now: DateTime<Utc>) -> Result<usize> {
        let removed = self.processed.prune_before(now - self.retention).await?;
        if removed > 0 {
            tracing::info!(removed, "pruned processed webhook ids");
        }
        Ok(removed)
    }

    /// Finds the attempt by provider reference, falling back to the
    /// idempotency key the provider echoes back in the payload.
    async fn resolve(&self, event: &ProviderEvent) -> Result<OrderAttempt> {
        if let Some(reference) = event.provider_reference.as_deref()
            && let Some(attempt_id) = self.machine.attempt_for_reference(reference).await
            && let Some(attempt) = self.machine.attempt(attempt_id).await?
        {
            return Ok(attempt);
        }

        if let Some(key) = event.payload_str("idempotency_key") {
            let attempt_id = IdempotencyKey::from_raw(key).attempt_id();
            if let Some(attempt) = self.machine.attempt(attempt_id).await? {
                return Ok(attempt);
            }
        }

        tracing::warn!(reference = ?event.provider_reference, "webhook for unknown payment");
        Err(FulfillmentError::UnknownPaymentReference(
            event
                .provider_reference
                .clone()
                .unwrap_or_else(|| event.id.clone()),
        ))
    }

    fn finish(&self, outcome: WebhookOutcome) -> WebhookOutcome {
        metrics::counter!("webhook_events_total", "outcome" => outcome.as_str()).increment(1);
        tracing::info!(outcome = outcome.as_str(), "webhook handled");
        outcome
    }
}

impl<S, P> WebhookReconciler<S, P>
where
    S: EventStore + Clone + 'static,
    P: PaymentProvider + 'static,
{
    /// Prunes processed ids every `interval` until `shutdown` flips.
    pub fn spawn_pruner(
        self: Arc<Self>,
        interval: std::time::Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.prune(Utc::now()).await {
                            tracing::error!(error = %e, "webhook prune failed");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            tracing::info!("webhook pruner stopped");
        })
    }
}

fn transition_for(
    observed: Observed,
    event: &ProviderEvent,
    attempt: &OrderAttempt,
) -> Result<TransitionKind> {
    let reason = |default: &str| {
        FailureReason::new(
            FailureKind::ProviderReported,
            event.payload_str("message").unwrap_or(default),
        )
    };

    Ok(match observed {
        Observed::Authorized => {
            let provider_reference = event.provider_reference.clone().ok_or_else(|| {
                FulfillmentError::MalformedWebhook("payment.authorized without reference".into())
            })?;
            let amount = event
                .payload
                .get("amount")
                .and_then(|v| v.as_i64())
                .map(Money::from_cents)
                .or_else(|| attempt.payment_intent().map(|intent| intent.amount))
                .or_else(|| attempt.cart().map(|cart| cart.subtotal()))
                .unwrap_or_else(Money::zero);
            TransitionKind::PaymentAuthorized {
                provider_reference,
                amount,
            }
        }
        Observed::Captured => TransitionKind::PaymentCaptured,
        Observed::Failed => TransitionKind::PaymentFailed {
            reason: reason(&event.event_type),
        },
        Observed::Canceled => TransitionKind::Canceled {
            reason: reason("canceled by provider"),
        },
        Observed::Refunded => TransitionKind::Refunded,
    })
}
