//! Route handlers.

pub mod checkout;
pub mod health;
pub mod inventory;
pub mod metrics;
pub mod orders;
pub mod webhooks;

use common::AggregateId;

use crate::error::ApiError;

fn parse_aggregate_id(id: &str) -> Result<AggregateId, ApiError> {
    let uuid = uuid::Uuid::parse_str(id)
        .map_err(|e| ApiError::BadRequest(format!("Invalid ID format: {e}")))?;
    Ok(AggregateId::from(uuid))
}
