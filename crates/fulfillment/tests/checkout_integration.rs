//! End-to-end checkout scenarios over in-memory collaborators.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::AggregateId;
use domain::{
    Aggregate, AttemptState, CartItem, CartSnapshot, FailureKind, IdempotencyKey, Money,
    ReleaseReason, ReservationState, ShopperId, TransitionKind, VariantId,
};
use event_store::{EventStore, InMemoryEventStore, InMemoryProcessedEvents};
use fulfillment::{
    CheckoutRequest, EventSource, Fulfillment, FulfillmentConfig, FulfillmentError,
    HmacSignatureVerifier, InMemoryCatalog, InMemoryPaymentProvider, NotificationKind, OrderEvent,
    RecordingNotifier, RetryPolicy, WebhookOutcome,
};

const SECRET: &str = "whsec_integration";

type TestFulfillment = Fulfillment<InMemoryEventStore, InMemoryCatalog, InMemoryPaymentProvider>;

struct TestHarness {
    fulfillment: Arc<TestFulfillment>,
    provider: InMemoryPaymentProvider,
    notifier: RecordingNotifier,
    store: InMemoryEventStore,
}

impl TestHarness {
    /// variantA at $12.50 with 5 units on hand.
    async fn new() -> Self {
        let store = InMemoryEventStore::new();
        let catalog = InMemoryCatalog::new();
        catalog
            .upsert("variantA", "Variant A", Money::from_cents(1250))
            .await;
        let provider = InMemoryPaymentProvider::new();
        let notifier = RecordingNotifier::new();

        let config = FulfillmentConfig {
            retry: RetryPolicy::new(3, Duration::from_millis(1)),
            provider_timeout: Duration::from_secs(2),
            ..FulfillmentConfig::default()
        };
        let fulfillment = Fulfillment::new(
            store.clone(),
            catalog,
            provider.clone(),
            Arc::new(notifier.clone()),
            Arc::new(InMemoryProcessedEvents::new()),
            Arc::new(HmacSignatureVerifier::new(
                SECRET,
                chrono::Duration::minutes(5),
            )),
            config,
        );
        fulfillment
            .ledger
            .receive_stock(&VariantId::new("variantA"), 5, Utc::now())
            .await
            .unwrap();

        Self {
            fulfillment: Arc::new(fulfillment),
            provider,
            notifier,
            store,
        }
    }

    fn request(quantity: u32) -> CheckoutRequest {
        CheckoutRequest::new(CartSnapshot::new(
            ShopperId::new(),
            vec![CartItem::new("variantA", quantity, Money::from_cents(1250))],
            "USD",
        ))
    }

    async fn stock(&self) -> (u32, u32) {
        let stock = self
            .fulfillment
            .ledger
            .stock(&VariantId::new("variantA"))
            .await;
        (stock.total_quantity, stock.reserved_quantity)
    }

    async fn state(&self, attempt_id: AggregateId) -> AttemptState {
        self.fulfillment
            .machine
            .attempt(attempt_id)
            .await
            .unwrap()
            .map(|a| a.state())
            .unwrap_or(AttemptState::Created)
    }

    async fn deliver(&self, body: serde_json::Value) -> fulfillment::Result<WebhookOutcome> {
        let body = serde_json::to_vec(&body).unwrap();
        let now = Utc::now();
        let header = HmacSignatureVerifier::new(SECRET, chrono::Duration::minutes(5))
            .sign(&body, now.timestamp())
            .unwrap();
        self.fulfillment
            .webhooks
            .ingest(&body, Some(&header), now)
            .await
    }
}

#[tokio::test]
async fn happy_path_commits_stock() {
    let h = TestHarness::new().await;

    let receipt = h
        .fulfillment
        .checkout
        .checkout(TestHarness::request(2), Utc::now())
        .await
        .unwrap();

    assert_eq!(receipt.state, AttemptState::OrderConfirmed);
    assert_eq!(receipt.total, Some(Money::from_cents(2500)));
    assert_eq!(h.stock().await, (3, 0));

    let reservation = h
        .fulfillment
        .ledger
        .reservation_for_attempt(receipt.attempt_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reservation.state(), ReservationState::Committed);
    assert_eq!(
        h.notifier
            .count(receipt.attempt_id, NotificationKind::Confirmed)
            .await,
        1
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stock_race_has_one_winner() {
    let h = TestHarness::new().await;

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let f = h.fulfillment.clone();
            tokio::spawn(async move {
                f.checkout
                    .checkout(TestHarness::request(3), Utc::now())
                    .await
            })
        })
        .collect();

    let mut confirmed = 0;
    let mut out_of_stock = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(receipt) => {
                assert_eq!(receipt.state, AttemptState::OrderConfirmed);
                confirmed += 1;
            }
            Err(FulfillmentError::CheckoutFailed { reason, state, .. }) => {
                assert_eq!(reason.kind, FailureKind::InsufficientStock);
                assert_eq!(state, AttemptState::Canceled);
                out_of_stock += 1;
            }
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    assert_eq!((confirmed, out_of_stock), (1, 1));
    let (total, reserved) = h.stock().await;
    assert_eq!((total, reserved), (2, 0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reservations_never_oversell() {
    let h = TestHarness::new().await;

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let f = h.fulfillment.clone();
            tokio::spawn(async move {
                f.checkout
                    .checkout(TestHarness::request(1), Utc::now())
                    .await
                    .is_ok()
            })
        })
        .collect();

    let mut sold = 0;
    for handle in handles {
        if handle.await.unwrap() {
            sold += 1;
        }
    }

    assert_eq!(sold, 5);
    assert_eq!(h.stock().await, (0, 0));
}

#[tokio::test]
async fn payment_decline_releases_stock() {
    let h = TestHarness::new().await;
    h.provider.decline_authorizations(true).await;
    let request = TestHarness::request(2);
    let attempt_id = request.idempotency_key().attempt_id();

    let err = h
        .fulfillment
        .checkout
        .checkout(request, Utc::now())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "payment_declined");
    assert_eq!(h.state(attempt_id).await, AttemptState::PaymentFailed);
    assert_eq!(h.stock().await, (5, 0));

    let reservation = h
        .fulfillment
        .ledger
        .reservation_for_attempt(attempt_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reservation.state(), ReservationState::Released);
    assert_eq!(reservation.release_reason(), Some(ReleaseReason::PaymentFailed));
    assert_eq!(
        h.notifier.count(attempt_id, NotificationKind::Failed).await,
        1
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_checkout_reserves_and_charges_once() {
    let h = TestHarness::new().await;
    let request = TestHarness::request(2);

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let f = h.fulfillment.clone();
            let request = request.clone();
            tokio::spawn(async move { f.checkout.checkout(request, Utc::now()).await })
        })
        .collect();

    let mut receipts = Vec::new();
    for handle in handles {
        receipts.push(handle.await.unwrap().unwrap());
    }

    assert_eq!(receipts[0].attempt_id, receipts[1].attempt_id);
    assert_eq!(receipts[0].order_id, receipts[1].order_id);
    assert_eq!(h.provider.payment_count().await, 1);
    assert_eq!(h.stock().await, (3, 0));

    let holds = h
        .store
        .get_events_by_aggregate_type("Reservation")
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.event_type == "ReservationHeld")
        .count();
    assert_eq!(holds, 1);
}

#[tokio::test]
async fn duplicate_webhook_transitions_once() {
    let h = TestHarness::new().await;
    let cart = CartSnapshot::new(
        ShopperId::new(),
        vec![CartItem::new("variantA", 2, Money::from_cents(1250))],
        "USD",
    );
    let key = IdempotencyKey::derive(&cart.shopper_id, &cart.content_hash(), 1);
    let attempt_id = key.attempt_id();
    let f = &h.fulfillment;
    let now = Utc::now();
    f.machine.start(cart.clone(), key, now).await.unwrap();
    let reservation = f
        .reservations
        .begin_checkout(attempt_id, &cart, now)
        .await
        .unwrap();
    f.machine
        .dispatch(OrderEvent::new(
            attempt_id,
            "held",
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
    let reference = intent.provider_reference.unwrap();

    let authorized = serde_json::json!({
        "id": "evt_auth_1",
        "type": "payment.authorized",
        "provider_reference": reference,
        "payload": { "amount": 2500, "idempotency_key": attempt.idempotency_key().unwrap().as_str() },
    });

    assert_eq!(h.deliver(authorized.clone()).await.unwrap(), WebhookOutcome::Applied);
    assert_eq!(h.deliver(authorized).await.unwrap(), WebhookOutcome::Duplicate);

    let attempt = f.machine.attempt(attempt_id).await.unwrap().unwrap();
    let authorizations = attempt
        .history()
        .iter()
        .filter(|t| t.to == AttemptState::PaymentAuthorized)
        .count();
    assert_eq!(authorizations, 1);
    assert_eq!(attempt.provider_reference(), Some(reference.as_str()));
}

#[tokio::test]
async fn abandoned_hold_expires() {
    let h = TestHarness::new().await;
    let f = &h.fulfillment;
    let cart = CartSnapshot::new(
        ShopperId::new(),
        vec![CartItem::new("variantA", 4, Money::from_cents(1250))],
        "USD",
    );
    let key = IdempotencyKey::derive(&cart.shopper_id, &cart.content_hash(), 1);
    let attempt_id = key.attempt_id();
    let now = Utc::now();

    f.machine.start(cart.clone(), key, now).await.unwrap();
    let reservation = f
        .reservations
        .begin_checkout(attempt_id, &cart, now)
        .await
        .unwrap();
    f.machine
        .dispatch(OrderEvent::new(
            attempt_id,
            "held",
            EventSource::Checkout,
            TransitionKind::ReservationHeld {
                reservation_id: reservation.id().unwrap(),
                expires_at: reservation.expires_at().unwrap(),
            },
        ))
        .await
        .unwrap();
    assert_eq!(h.stock().await, (5, 4));

    // Another shopper cannot get 2 while the hold is live.
    let blocked = f
        .checkout
        .checkout(TestHarness::request(2), now)
        .await
        .unwrap_err();
    assert_eq!(blocked.kind(), "insufficient_stock");

    let report = f
        .sweeper
        .run_once(now + chrono::Duration::minutes(16))
        .await
        .unwrap();
    assert_eq!(report.expired, 1);
    assert_eq!(h.state(attempt_id).await, AttemptState::ReservationExpired);
    assert_eq!(h.stock().await, (5, 0));

    let receipt = f
        .checkout
        .checkout(TestHarness::request(2), Utc::now())
        .await
        .unwrap();
    assert_eq!(receipt.state, AttemptState::OrderConfirmed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn capture_webhook_before_sync_response() {
    let h = TestHarness::new().await;
    h.provider
        .set_capture_delay(Duration::from_millis(300))
        .await;
    let request = TestHarness::request(2);
    let attempt_id = request.idempotency_key().attempt_id();

    let checkout = {
        let f = h.fulfillment.clone();
        tokio::spawn(async move { f.checkout.checkout(request, Utc::now()).await })
    };

    // Wait until the capture call is in flight.
    let mut reference = None;
    for _ in 0..200 {
        if h.provider.capture_calls().await > 0 {
            let attempt = h.fulfillment.machine.attempt(attempt_id).await.unwrap();
            reference = attempt.and_then(|a| a.provider_reference().map(str::to_string));
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let reference = reference.expect("capture never started");
    assert_eq!(h.state(attempt_id).await, AttemptState::PaymentAuthorized);

    let outcome = h
        .deliver(serde_json::json!({
            "id": "evt_cap_1",
            "type": "payment.captured",
            "provider_reference": reference,
        }))
        .await
        .unwrap();
    assert_eq!(outcome, WebhookOutcome::Applied);
    assert_eq!(h.state(attempt_id).await, AttemptState::OrderConfirmed);

    let receipt = checkout.await.unwrap().unwrap();
    assert_eq!(receipt.state, AttemptState::OrderConfirmed);

    let captures: Vec<_> = receipt
        .history
        .iter()
        .filter(|t| t.to == AttemptState::PaymentCaptured)
        .collect();
    assert_eq!(captures.len(), 1);
    assert_eq!(captures[0].event_id.as_deref(), Some("provider:evt_cap_1"));
    assert_eq!(h.stock().await, (3, 0));
    assert_eq!(
        h.notifier.count(attempt_id, NotificationKind::Confirmed).await,
        1
    );
}

#[tokio::test]
async fn shopper_cancel_releases_stock() {
    let h = TestHarness::new().await;
    let f = &h.fulfillment;
    let cart = CartSnapshot::new(
        ShopperId::new(),
        vec![CartItem::new("variantA", 3, Money::from_cents(1250))],
        "USD",
    );
    let key = IdempotencyKey::derive(&cart.shopper_id, &cart.content_hash(), 1);
    let attempt_id = key.attempt_id();
    let now = Utc::now();
    f.machine.start(cart.clone(), key, now).await.unwrap();
    f.reservations
        .begin_checkout(attempt_id, &cart, now)
        .await
        .unwrap();
    assert_eq!(h.stock().await, (5, 3));

    let receipt = f.checkout.cancel(attempt_id, now).await.unwrap();
    assert_eq!(receipt.state, AttemptState::Canceled);
    assert_eq!(
        receipt.failure.map(|r| r.kind),
        Some(FailureKind::ShopperCanceled)
    );
    assert_eq!(h.stock().await, (5, 0));

    // Cancelling twice is harmless.
    let again = f.checkout.cancel(attempt_id, now).await.unwrap();
    assert_eq!(again.state, AttemptState::Canceled);
}

#[tokio::test]
async fn refund_webhook_keeps_stock_committed() {
    let h = TestHarness::new().await;
    let receipt = h
        .fulfillment
        .checkout
        .checkout(TestHarness::request(2), Utc::now())
        .await
        .unwrap();
    let attempt = h
        .fulfillment
        .machine
        .attempt(receipt.attempt_id)
        .await
        .unwrap()
        .unwrap();
    let reference = attempt.provider_reference().unwrap().to_string();

    let outcome = h
        .deliver(serde_json::json!({
            "id": "evt_refund_1",
            "type": "charge.refunded",
            "provider_reference": reference,
        }))
        .await
        .unwrap();

    assert_eq!(outcome, WebhookOutcome::Applied);
    let refunded = h.fulfillment.checkout.status(receipt.attempt_id).await.unwrap();
    assert_eq!(refunded.state, AttemptState::Refunded);
    assert_eq!(h.stock().await, (3, 0));
}

#[tokio::test]
async fn restore_rebuilds_state_from_events() {
    let h = TestHarness::new().await;
    let confirmed = h
        .fulfillment
        .checkout
        .checkout(TestHarness::request(2), Utc::now())
        .await
        .unwrap();

    let f = &h.fulfillment;
    let cart = CartSnapshot::new(
        ShopperId::new(),
        vec![CartItem::new("variantA", 1, Money::from_cents(1250))],
        "USD",
    );
    let key = IdempotencyKey::derive(&cart.shopper_id, &cart.content_hash(), 1);
    f.machine.start(cart.clone(), key.clone(), Utc::now()).await.unwrap();
    f.reservations
        .begin_checkout(key.attempt_id(), &cart, Utc::now())
        .await
        .unwrap();

    let catalog = InMemoryCatalog::new();
    let rebuilt = Fulfillment::new(
        h.store.clone(),
        catalog,
        h.provider.clone(),
        Arc::new(RecordingNotifier::new()),
        Arc::new(InMemoryProcessedEvents::new()),
        Arc::new(HmacSignatureVerifier::new(
            SECRET,
            chrono::Duration::minutes(5),
        )),
        FulfillmentConfig::default(),
    );
    rebuilt.restore().await.unwrap();

    let stock = rebuilt.ledger.stock(&VariantId::new("variantA")).await;
    assert_eq!((stock.total_quantity, stock.reserved_quantity), (3, 1));

    let attempt = rebuilt
        .machine
        .attempt(confirmed.attempt_id)
        .await
        .unwrap()
        .unwrap();
    let reference = attempt.provider_reference().unwrap();
    assert_eq!(
        rebuilt.machine.attempt_for_reference(reference).await,
        Some(confirmed.attempt_id)
    );
}
