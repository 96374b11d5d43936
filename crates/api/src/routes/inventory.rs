//! Stock levels and intake.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use chrono::Utc;
use domain::{Money, ProductStock, VariantId};
use event_store::EventStore;
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::ApiError;

#[derive(Deserialize)]
pub struct ReceiveStockRequest {
    pub quantity: u32,
    /// Lists the variant in the catalog when given.
    pub unit_price_cents: Option<i64>,
    pub name: Option<String>,
}

#[derive(Serialize)]
pub struct StockResponse {
    pub variant_id: String,
    pub total_quantity: u32,
    pub reserved_quantity: u32,
    pub available: u32,
}

impl From<ProductStock> for StockResponse {
    fn from(stock: ProductStock) -> Self {
        Self {
            available: stock.available(),
            variant_id: stock.variant_id.to_string(),
            total_quantity: stock.total_quantity,
            reserved_quantity: stock.reserved_quantity,
        }
    }
}

/// GET /inventory/:variant_id: current stock counts.
#[tracing::instrument(skip(state))]
pub async fn get<S: EventStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(variant_id): Path<String>,
) -> Json<StockResponse> {
    let stock = state
        .fulfillment
        .ledger
        .stock(&VariantId::new(variant_id))
        .await;
    Json(stock.into())
}

/// POST /inventory/:variant_id/stock: record received units.
#[tracing::instrument(skip(state, req))]
pub async fn receive<S: EventStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(variant_id): Path<String>,
    Json(req): Json<ReceiveStockRequest>,
) -> Result<(StatusCode, Json<StockResponse>), ApiError> {
    let variant_id = VariantId::new(variant_id);

    if let Some(cents) = req.unit_price_cents {
        if cents <= 0 {
            return Err(ApiError::BadRequest(
                "unit_price_cents must be positive".to_string(),
            ));
        }
        let name = req.name.unwrap_or_else(|| variant_id.to_string());
        state
            .catalog
            .upsert(variant_id.clone(), name, Money::from_cents(cents))
            .await;
    }

    let stock = state
        .fulfillment
        .ledger
        .receive_stock(&variant_id, req.quantity, Utc::now())
        .await?;
    Ok((StatusCode::CREATED, Json(stock.into())))
}
