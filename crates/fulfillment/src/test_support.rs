//! Shared fixtures for the unit tests in this crate.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::AggregateId;
use domain::{
    Aggregate, CartItem, CartSnapshot, IdempotencyKey, Money, OrderAttempt, ShopperId,
    TransitionKind, VariantId,
};
use event_store::{InMemoryEventStore, InMemoryProcessedEvents};

use crate::{
    EventSource, Fulfillment, FulfillmentConfig, HmacSignatureVerifier, InMemoryCatalog,
    InMemoryPaymentProvider, OrderEvent, RecordingNotifier, RetryPolicy, WebhookOutcome,
};

pub(crate) const SECRET: &str = "whsec_test";

pub(crate) struct TestEnv {
    pub fulfillment: Fulfillment<InMemoryEventStore, InMemoryCatalog, InMemoryPaymentProvider>,
    pub catalog: InMemoryCatalog,
    pub provider: InMemoryPaymentProvider,
    pub notifier: RecordingNotifier,
    pub processed: InMemoryProcessedEvents,
    pub store: InMemoryEventStore,
}

/// SKU-A at $15.00 with 5 units on hand.
pub(crate) async fn env() -> TestEnv {
    let store = InMemoryEventStore::new();
    let catalog = InMemoryCatalog::new();
    catalog
        .upsert("SKU-A", "Widget", Money::from_cents(1500))
        .await;
    let provider = InMemoryPaymentProvider::new();
    let notifier = RecordingNotifier::new();
    let processed = InMemoryProcessedEvents::new();

    let config = FulfillmentConfig {
        retry: RetryPolicy::new(2, Duration::from_millis(1)),
        provider_timeout: Duration::from_secs(1),
        ..FulfillmentConfig::default()
    };
    let fulfillment = Fulfillment::new(
        store.clone(),
        catalog.clone(),
        provider.clone(),
        Arc::new(notifier.clone()),
        Arc::new(processed.clone()),
        Arc::new(HmacSignatureVerifier::new(
            SECRET,
            chrono::Duration::minutes(5),
        )),
        config,
    );
    fulfillment
        .ledger
        .receive_stock(&VariantId::new("SKU-A"), 5, Utc::now())
        .await
        .unwrap();

    TestEnv {
        fulfillment,
        catalog,
        provider,
        notifier,
        processed,
        store,
    }
}

pub(crate) fn cart(quantity: u32) -> CartSnapshot {
    CartSnapshot::new(
        ShopperId::new(),
        vec![CartItem::new("SKU-A", quantity, Money::from_cents(1500))],
        "USD",
    )
}

pub(crate) fn webhook_body(id: &str, event_type: &str, reference: &str) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "id": id,
        "type": event_type,
        "provider_reference": reference,
    }))
    .unwrap()
}

impl TestEnv {
    pub async fn deliver(&self, body: &[u8]) -> crate::Result<WebhookOutcome> {
        let now = Utc::now();
        let header = HmacSignatureVerifier::new(SECRET, chrono::Duration::minutes(5))
            .sign(body, now.timestamp())
            .unwrap();
        self.fulfillment
            .webhooks
            .ingest(body, Some(&header), now)
            .await
    }

    pub async fn attempt(&self, attempt_id: AggregateId) -> OrderAttempt {
        self.fulfillment
            .machine
            .attempt(attempt_id)
            .await
            .unwrap()
            .unwrap()
    }

    /// (total, reserved) for SKU-A.
    pub async fn stock(&self) -> (u32, u32) {
        let stock = self.fulfillment.ledger.stock(&VariantId::new("SKU-A")).await;
        (stock.total_quantity, stock.reserved_quantity)
    }
}

/// An attempt for 2 x SKU-A, authorized at the provider but not captured.
pub(crate) async fn authorized_attempt(env: &TestEnv) -> (AggregateId, String) {
    let f = &env.fulfillment;
    let cart = cart(2);
    let key = IdempotencyKey::derive(&cart.shopper_id, &cart.content_hash(), 1);
    let now = Utc::now();

    let attempt = f.machine.start(cart.clone(), key, now).await.unwrap();
    let attempt_id = attempt.id().unwrap();

    let reservation = f
        .reservations
        .begin_checkout(attempt_id, &cart, now)
        .await
        .unwrap();
    f.machine
        .dispatch(OrderEvent::new(
            attempt_id,
            "test:reserve",
            EventSource::Checkout,
            TransitionKind::ReservationHeld {
                reservation_id: reservation.id().unwrap(),
                expires_at: reservation.expires_at().unwrap(),
            },
        ))
        .await
        .unwrap();

    let attempt = f.machine.record_payment_intent(attempt_id, now).await.unwrap();
    let intent = f.payments.authorize(&attempt).await.unwrap();
    let reference = intent.provider_reference.clone().unwrap();
    f.machine
        .dispatch(OrderEvent::new(
            attempt_id,
            "test:authorize",
            EventSource::Checkout,
            TransitionKind::PaymentAuthorized {
                provider_reference: reference.clone(),
                amount: intent.amount,
            },
        ))
        .await
        .unwrap();

    (attempt_id, reference)
}
