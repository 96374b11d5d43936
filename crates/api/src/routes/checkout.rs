//! Checkout endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use chrono::Utc;
use domain::{Cart, CartError, Money, ShopperId};
use event_store::EventStore;
use fulfillment::{CheckoutReceipt, CheckoutRequest};
use serde::Deserialize;

use crate::AppState;
use crate::error::ApiError;

#[derive(Deserialize)]
pub struct CheckoutBody {
    pub shopper_id: String,
    pub items: Vec<CartLineBody>,
    /// Bump to retry a cart whose previous attempt failed.
    #[serde(default)]
    pub attempt_seq: Option<u32>,
}

#[derive(Deserialize)]
pub struct CartLineBody {
    pub variant_id: String,
    pub quantity: u32,
    pub unit_price_cents: i64,
}

/// POST /checkout: snapshot the cart and drive it to a confirmed order.
///
/// Resubmitting the same cart resumes the existing attempt.
#[tracing::instrument(skip(state, body))]
pub async fn create<S: EventStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Json(body): Json<CheckoutBody>,
) -> Result<Json<CheckoutReceipt>, ApiError> {
    let shopper = uuid::Uuid::parse_str(&body.shopper_id)
        .map_err(|e| ApiError::BadRequest(format!("Invalid shopper_id: {e}")))?;

    let mut cart = Cart::new(ShopperId::from_uuid(shopper), state.config.max_item_quantity);
    for line in &body.items {
        cart.add_item(
            line.variant_id.as_str(),
            line.quantity,
            Money::from_cents(line.unit_price_cents),
        )?;
    }
    if cart.is_empty() {
        return Err(CartError::Empty.into());
    }

    let mut request = CheckoutRequest::new(cart.snapshot(state.config.currency.as_str()));
    if let Some(seq) = body.attempt_seq {
        request.attempt_seq = seq;
    }

    let receipt = state
        .fulfillment
        .checkout
        .checkout(request, Utc::now())
        .await?;
    Ok(Json(receipt))
}
