//! Payment-provider webhook receiver.

use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use chrono::Utc;
use event_store::EventStore;
use fulfillment::WebhookOutcome;
use serde::Serialize;

use crate::AppState;
use crate::error::ApiError;

pub const SIGNATURE_HEADER: &str = "provider-signature";

#[derive(Serialize)]
pub struct WebhookResponse {
    pub outcome: WebhookOutcome,
}

/// POST /webhooks/payments: verify, deduplicate and apply a provider event.
///
/// Duplicates, rejected transitions and unknown event types are still
/// acknowledged with 200 so the provider stops redelivering them.
#[tracing::instrument(skip(state, headers, body))]
pub async fn receive<S: EventStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, ApiError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());

    let outcome = state
        .fulfillment
        .webhooks
        .ingest(&body, signature, Utc::now())
        .await?;
    Ok(Json(WebhookResponse { outcome }))
}
