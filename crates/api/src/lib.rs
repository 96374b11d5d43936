//! HTTP API for the order-fulfillment core.
//!
//! Exposes checkout, order status and cancellation, the payment-provider
//! webhook receiver and stock intake, with structured logging (tracing)
//! and Prometheus metrics.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use event_store::{EventStore, InMemoryProcessedEvents, ProcessedEventLog};
use fulfillment::{
    Fulfillment, FulfillmentConfig, HmacSignatureVerifier, InMemoryCatalog,
    InMemoryPaymentProvider, LoggingNotifier,
};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use config::Config;

/// The fulfillment services as wired by this server.
pub type Services<S> = Fulfillment<S, InMemoryCatalog, InMemoryPaymentProvider>;

/// Shared application state accessible from all handlers.
pub struct AppState<S: EventStore + Clone> {
    pub fulfillment: Arc<Services<S>>,
    /// Shares its entries with the catalog inside `fulfillment`.
    pub catalog: InMemoryCatalog,
    pub provider: InMemoryPaymentProvider,
    pub event_store: S,
    pub config: FulfillmentConfig,
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<S: EventStore + Clone + 'static>(
    state: Arc<AppState<S>>,
    metrics_handle: PrometheusHandle,
) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get::<S>))
        .with_state(routes::metrics::MetricsState {
            app: state.clone(),
            handle: metrics_handle,
        });

    Router::new()
        .route("/health", get(routes::health::check::<S>))
        .route("/checkout", post(routes::checkout::create::<S>))
        .route("/orders/{id}", get(routes::orders::get::<S>))
        .route("/orders/{id}/cancel", post(routes::orders::cancel::<S>))
        .route("/orders/{id}/events", get(routes::orders::events::<S>))
        .route("/webhooks/payments", post(routes::webhooks::receive::<S>))
        .route("/inventory/{variant_id}", get(routes::inventory::get::<S>))
        .route(
            "/inventory/{variant_id}/stock",
            post(routes::inventory::receive::<S>),
        )
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Wires the fulfillment services over `event_store` and `processed`.
pub fn create_state<S: EventStore + Clone + 'static>(
    event_store: S,
    processed: Arc<dyn ProcessedEventLog>,
    config: &Config,
) -> Arc<AppState<S>> {
    let catalog = InMemoryCatalog::new();
    let provider = InMemoryPaymentProvider::new();
    let fulfillment_config = config.fulfillment();
    let verifier = Arc::new(HmacSignatureVerifier::new(
        &config.webhook_secret,
        config.webhook_tolerance(),
    ));

    let fulfillment = Fulfillment::new(
        event_store.clone(),
        catalog.clone(),
        provider.clone(),
        Arc::new(LoggingNotifier),
        processed,
        verifier,
        fulfillment_config.clone(),
    );

    Arc::new(AppState {
        fulfillment: Arc::new(fulfillment),
        catalog,
        provider,
        event_store,
        config: fulfillment_config,
    })
}

/// Creates state with in-memory collaborators and default configuration.
pub fn create_default_state<S: EventStore + Clone + 'static>(event_store: S) -> Arc<AppState<S>> {
    create_state(
        event_store,
        Arc::new(InMemoryProcessedEvents::new()),
        &Config::default(),
    )
}
