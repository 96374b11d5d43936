use chrono::{DateTime, Utc};
use common::AggregateId;
use serde::{Deserialize, Serialize};

use crate::cart::CartItem;
use crate::values::{Money, ShopperId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Confirmed,
    Refunded,
}

/// The committed order. Exists only once payment has been captured and the
/// reservation committed; line items never change afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: AggregateId,
    pub order_attempt_id: AggregateId,
    pub shopper_id: ShopperId,
    pub line_items: Vec<CartItem>,
    pub total: Money,
    pub currency: String,
    pub status: OrderStatus,
    pub confirmed_at: DateTime<Utc>,
    pub refunded_at: Option<DateTime<Utc>>,
}

impl Order {
    pub fn id_for_attempt(attempt_id: AggregateId) -> AggregateId {
        AggregateId::derive("order", &attempt_id.to_string())
    }
}
