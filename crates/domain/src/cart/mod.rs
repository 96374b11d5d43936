//! Per-shopper working cart and the snapshot taken at checkout.

mod idempotency;
mod snapshot;

pub use idempotency::IdempotencyKey;
pub use snapshot::CartSnapshot;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::values::{Money, ShopperId, VariantId};

/// Errors raised by cart edits and checkout-time cart validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CartError {
    #[error("Cart is empty")]
    Empty,

    #[error("Invalid quantity {quantity} for {variant_id}: must be between 1 and {max}")]
    InvalidQuantity {
        variant_id: VariantId,
        quantity: u32,
        max: u32,
    },

    #[error("Variant {0} is not in the cart")]
    ItemNotFound(VariantId),

    #[error("Variant {0} appears more than once")]
    DuplicateLine(VariantId),

    #[error("Unit price for {0} must be positive")]
    InvalidPrice(VariantId),
}

/// A line in the cart with the unit price seen when it was added.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartItem {
    pub variant_id: VariantId,
    pub quantity: u32,
    pub unit_price: Money,
}

impl CartItem {
    pub fn new(variant_id: impl Into<VariantId>, quantity: u32, unit_price: Money) -> Self {
        Self {
            variant_id: variant_id.into(),
            quantity,
            unit_price,
        }
    }

    pub fn line_total(&self) -> Money {
        self.unit_price.times(self.quantity)
    }
}

/// Mutable cart owned by one shopper session. Not authoritative for stock.
#[derive(Debug, Clone)]
pub struct Cart {
    shopper_id: ShopperId,
    items: Vec<CartItem>,
    max_item_quantity: u32,
}

impl Cart {
    pub fn new(shopper_id: ShopperId, max_item_quantity: u32) -> Self {
        Self {
            shopper_id,
            items: Vec::new(),
            max_item_quantity,
        }
    }

    pub fn shopper_id(&self) -> ShopperId {
        self.shopper_id
    }

    pub fn items(&self) -> &[CartItem] {
        &self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Adds `quantity` of a variant, merging with an existing line.
    ///
    /// The merged line takes the newer price snapshot.
    pub fn add_item(
        &mut self,
        variant_id: impl Into<VariantId>,
        quantity: u32,
        unit_price: Money,
    ) -> Result<(), CartError> {
        let variant_id = variant_id.into();
        if !unit_price.is_positive() {
            return Err(CartError::InvalidPrice(variant_id));
        }

        let existing = self
            .items
            .iter()
            .position(|item| item.variant_id == variant_id);
        let merged = existing
            .map_or(0, |i| self.items[i].quantity)
            .saturating_add(quantity);
        self.check_quantity(&variant_id, quantity)?;
        self.check_quantity(&variant_id, merged)?;

        match existing {
            Some(i) => {
                self.items[i].quantity = merged;
                self.items[i].unit_price = unit_price;
            }
            None => self.items.push(CartItem {
                variant_id,
                quantity,
                unit_price,
            }),
        }
        Ok(())
    }

    /// Replaces a line's quantity. Zero removes the line.
    pub fn set_quantity(&mut self, variant_id: &VariantId, quantity: u32) -> Result<(), CartError> {
        if quantity == 0 {
            return self.remove_item(variant_id);
        }
        self.check_quantity(variant_id, quantity)?;
        let item = self
            .items
            .iter_mut()
            .find(|item| &item.variant_id == variant_id)
            .ok_or_else(|| CartError::ItemNotFound(variant_id.clone()))?;
        item.quantity = quantity;
        Ok(())
    }

    pub fn remove_item(&mut self, variant_id: &VariantId) -> Result<(), CartError> {
        let before = self.items.len();
        self.items.retain(|item| &item.variant_id != variant_id);
        if self.items.len() == before {
            return Err(CartError::ItemNotFound(variant_id.clone()));
        }
        Ok(())
    }

    pub fn subtotal(&self) -> Money {
        self.items.iter().map(CartItem::line_total).sum()
    }

    /// Total number of units across all lines.
    pub fn item_count(&self) -> u32 {
        self.items.iter().map(|item| item.quantity).sum()
    }

    /// Freezes the cart for checkout.
    pub fn snapshot(&self, currency: impl Into<String>) -> CartSnapshot {
        CartSnapshot::new(self.shopper_id, self.items.clone(), currency)
    }

    fn check_quantity(&self, variant_id: &VariantId, quantity: u32) -> Result<(), CartError> {
        if quantity == 0 || quantity > self.max_item_quantity {
            return Err(CartError::InvalidQuantity {
                variant_id: variant_id.clone(),
                quantity,
                max: self.max_item_quantity,
            });
        }
        Ok(())
    }
}
