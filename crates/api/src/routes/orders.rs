//! Order status, cancellation and event history.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use chrono::Utc;
use event_store::EventStore;
use fulfillment::CheckoutReceipt;
use serde::Serialize;

use super::parse_aggregate_id;
use crate::AppState;
use crate::error::ApiError;

#[derive(Serialize)]
pub struct EventEnvelopeResponse {
    pub event_id: String,
    pub event_type: String,
    pub aggregate_id: String,
    pub version: i64,
    pub timestamp: String,
    pub payload: serde_json::Value,
}

/// GET /orders/:id: current state and history of an order attempt.
#[tracing::instrument(skip(state))]
pub async fn get<S: EventStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<CheckoutReceipt>, ApiError> {
    let attempt_id = parse_aggregate_id(&id)?;
    let receipt = state.fulfillment.checkout.status(attempt_id).await?;
    Ok(Json(receipt))
}

/// POST /orders/:id/cancel: shopper cancels an attempt before capture.
#[tracing::instrument(skip(state))]
pub async fn cancel<S: EventStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<CheckoutReceipt>, ApiError> {
    let attempt_id = parse_aggregate_id(&id)?;
    let receipt = state
        .fulfillment
        .checkout
        .cancel(attempt_id, Utc::now())
        .await?;
    Ok(Json(receipt))
}

/// GET /orders/:id/events: raw event stream of an order attempt.
#[tracing::instrument(skip(state))]
pub async fn events<S: EventStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<EventEnvelopeResponse>>, ApiError> {
    let aggregate_id = parse_aggregate_id(&id)?;

    let envelopes = state
        .event_store
        .get_events_for_aggregate(aggregate_id)
        .await?;
    if envelopes.is_empty() {
        return Err(ApiError::NotFound(format!("Order attempt {id} not found")));
    }

    let responses = envelopes
        .into_iter()
        .map(|e| EventEnvelopeResponse {
            event_id: e.event_id.to_string(),
            event_type: e.event_type,
            aggregate_id: e.aggregate_id.to_string(),
            version: e.version.as_i64(),
            timestamp: e.timestamp.to_rfc3339(),
            payload: e.payload,
        })
        .collect();

    Ok(Json(responses))
}
