//! Prometheus scrape endpoint.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use event_store::EventStore;
use metrics_exporter_prometheus::PrometheusHandle;

use crate::AppState;

/// State of the scrape route: the recorder handle plus the services whose
/// levels are sampled at scrape time.
pub struct MetricsState<S: EventStore + Clone> {
    pub app: Arc<AppState<S>>,
    pub handle: PrometheusHandle,
}

impl<S: EventStore + Clone> Clone for MetricsState<S> {
    fn clone(&self) -> Self {
        Self {
            app: self.app.clone(),
            handle: self.handle.clone(),
        }
    }
}

/// GET /metrics: refreshes stock gauges, then renders every metric.
pub async fn get<S: EventStore + Clone + 'static>(
    State(state): State<MetricsState<S>>,
) -> impl IntoResponse {
    for stock in state.app.fulfillment.ledger.stocks().await {
        let variant = stock.variant_id.to_string();
        metrics::gauge!("inventory_on_hand_units", "variant_id" => variant.clone())
            .set(f64::from(stock.total_quantity));
        metrics::gauge!("inventory_reserved_units", "variant_id" => variant)
            .set(f64::from(stock.reserved_quantity));
    }

    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.handle.render(),
    )
}
