//! Order-fulfillment services.
//!
//! Takes a cart snapshot through stock reservation, payment and order
//! confirmation:
//! - [`InventoryLedger`]: per-variant stock counts with all-or-nothing holds
//! - [`ReservationManager`]: validates a cart and turns it into a hold
//! - [`PaymentOrchestrator`]: authorize/capture/cancel with retries that
//!   never double-charge
//! - [`OrderStateMachine`]: single writer per attempt; every source of
//!   progress (checkout, webhooks, sweeper, shopper) dispatches into it
//! - [`WebhookReconciler`]: verifies, deduplicates and routes provider events
//! - [`ExpirySweeper`]: releases abandoned holds and re-drives stuck attempts
//! - [`CheckoutCoordinator`]: drives one attempt from cart to order

pub mod checkout;
pub mod config;
pub mod error;
pub mod ledger;
pub mod machine;
pub mod payment;
pub mod reservation;
pub mod services;
pub mod sweep;
pub mod webhook;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

pub use checkout::{CheckoutCoordinator, CheckoutReceipt, CheckoutRequest};
pub use config::FulfillmentConfig;
pub use error::{FulfillmentError, Result};
pub use ledger::{Hold, InventoryLedger};
pub use machine::{EventSource, LiveAttempt, OrderEvent, OrderStateMachine, Outcome};
pub use payment::{
    AuthorizeRequest, InMemoryPaymentProvider, PaymentOrchestrator, PaymentProvider,
    ProviderError, ProviderPayment, ProviderStatus, RetryPolicy,
};
pub use reservation::ReservationManager;
pub use services::catalog::{Catalog, InMemoryCatalog, ProductMeta};
pub use services::notification::{
    LoggingNotifier, Notification, NotificationKind, NotificationSink, RecordingNotifier,
};
pub use sweep::{ExpirySweeper, SweepReport};
pub use webhook::{
    HmacSignatureVerifier, ProviderEvent, SignatureError, SignatureVerifier, WebhookOutcome,
    WebhookReconciler,
};

use event_store::{EventStore, ProcessedEventLog};

/// Every fulfillment service wired over one event store.
pub struct Fulfillment<S, C, P>
where
    S: EventStore + Clone,
    C: Catalog,
    P: PaymentProvider,
{
    pub ledger: Arc<InventoryLedger<S>>,
    pub reservations: Arc<ReservationManager<S, C>>,
    pub payments: Arc<PaymentOrchestrator<P>>,
    pub machine: Arc<OrderStateMachine<S, P>>,
    pub webhooks: Arc<WebhookReconciler<S, P>>,
    pub sweeper: Arc<ExpirySweeper<S, P>>,
    pub checkout: Arc<CheckoutCoordinator<S, C, P>>,
}

impl<S, C, P> Fulfillment<S, C, P>
where
    S: EventStore + Clone + 'static,
    C: Catalog + 'static,
    P: PaymentProvider + 'static,
{
    pub fn new(
        store: S,
        catalog: C,
        provider: P,
        notifier: Arc<dyn NotificationSink>,
        processed: Arc<dyn ProcessedEventLog>,
        verifier: Arc<dyn SignatureVerifier>,
        config: FulfillmentConfig,
    ) -> Self {
        let ledger = Arc::new(InventoryLedger::new(store.clone()));
        let reservations = Arc::new(ReservationManager::new(
            ledger.clone(),
            catalog,
            config.clone(),
        ));
        let payments = Arc::new(PaymentOrchestrator::new(
            provider,
            config.retry.clone(),
            config.provider_timeout,
        ));
        let machine = Arc::new(OrderStateMachine::new(
            store,
            ledger.clone(),
            payments.clone(),
            notifier,
        ));
        let webhooks = Arc::new(WebhookReconciler::new(
            machine.clone(),
            processed,
            verifier,
            config.webhook_retention,
        ));
        let sweeper = Arc::new(ExpirySweeper::new(
            ledger.clone(),
            machine.clone(),
            config.reservation_ttl,
        ));
        let checkout = Arc::new(CheckoutCoordinator::new(
            reservations.clone(),
            payments.clone(),
            machine.clone(),
        ));

        Self {
            ledger,
            reservations,
            payments,
            machine,
            webhooks,
            sweeper,
            checkout,
        }
    }

    /// Rebuilds in-memory state (stock counts, held reservations, payment
    /// reference index, open attempts) from the event store.
    pub async fn restore(&self) -> Result<()> {
        self.ledger.restore().await?;
        self.machine.restore().await?;
        Ok(())
    }
}
