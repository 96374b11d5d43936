use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{CartError, CartItem};
use crate::values::{Money, ShopperId};

/// Immutable copy of a cart taken when checkout starts.
///
/// Lines are kept sorted by variant so equal carts hash equally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartSnapshot {
    pub shopper_id: ShopperId,
    pub items: Vec<CartItem>,
    pub currency: String,
}

impl CartSnapshot {
    pub fn new(shopper_id: ShopperId, mut items: Vec<CartItem>, currency: impl Into<String>) -> Self {
        items.sort_by(|a, b| a.variant_id.cmp(&b.variant_id));
        Self {
            shopper_id,
            items,
            currency: currency.into(),
        }
    }

    pub fn subtotal(&self) -> Money {
        self.items.iter().map(CartItem::line_total).sum()
    }

    /// Checks the structural rules a cart must satisfy to be checked out.
    pub fn validate(&self, max_item_quantity: u32) -> Result<(), CartError> {
        if self.items.is_empty() {
            return Err(CartError::Empty);
        }
        for (i, item) in self.items.iter().enumerate() {
            if item.quantity == 0 || item.quantity > max_item_quantity {
                return Err(CartError::InvalidQuantity {
                    variant_id: item.variant_id.clone(),
                    quantity: item.quantity,
                    max: max_item_quantity,
                });
            }
            if !item.unit_price.is_positive() {
                return Err(CartError::InvalidPrice(item.variant_id.clone()));
            }
            if self.items[..i]
                .iter()
                .any(|other| other.variant_id == item.variant_id)
            {
                return Err(CartError::DuplicateLine(item.variant_id.clone()));
            }
        }
        Ok(())
    }

    /// Hex SHA-256 over a canonical rendering of currency and lines.
    pub fn content_hash(&self) -> String {
        let mut lines: Vec<&CartItem> = self.items.iter().collect();
        lines.sort_by(|a, b| a.variant_id.cmp(&b.variant_id));

        let mut hasher = Sha256::new();
        hasher.update(self.currency.as_bytes());
        for item in lines {
            hasher.update(
                format!(
                    "\n{}:{}:{}",
                    item.variant_id,
                    item.quantity,
                    item.unit_price.cents()
                )
                .as_bytes(),
            );
        }
        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(items: Vec<CartItem>) -> CartSnapshot {
        CartSnapshot::new(ShopperId::new(), items, "USD")
    }

    #[test]
    fn hash_ignores_line_order() {
        let shopper = ShopperId::new();
        let a = CartSnapshot::new(
            shopper,
            vec![
                CartItem::new("SKU-A", 1, Money::from_cents(100)),
                CartItem::new("SKU-B", 2, Money::from_cents(200)),
            ],
            "USD",
        );
        let b = CartSnapshot::new(
            shopper,
            vec![
                CartItem::new("SKU-B", 2, Money::from_cents(200)),
                CartItem::new("SKU-A", 1, Money::from_cents(100)),
            ],
            "USD",
        );
        assert_eq!(a.content_hash(), b.content_hash());
        assert_eq!(a.content_hash().len(), 64);
    }

    #[test]
    fn hash_changes_with_contents() {
        let base = snapshot(vec![CartItem::new("SKU-A", 1, Money::from_cents(100))]);
        let more = snapshot(vec![CartItem::new("SKU-A", 2, Money::from_cents(100))]);
        let pricier = snapshot(vec![CartItem::new("SKU-A", 1, Money::from_cents(101))]);
        assert_ne!(base.content_hash(), more.content_hash());
        assert_ne!(base.content_hash(), pricier.content_hash());
    }

    #[test]
    fn validate_rules() {
        assert_eq!(snapshot(vec![]).validate(10), Err(CartError::Empty));

        let too_many = snapshot(vec![CartItem::new("SKU-A", 11, Money::from_cents(100))]);
        assert!(matches!(
            too_many.validate(10),
            Err(CartError::InvalidQuantity { quantity: 11, .. })
        ));

        let duplicated = snapshot(vec![
            CartItem::new("SKU-A", 1, Money::from_cents(100)),
            CartItem::new("SKU-A", 2, Money::from_cents(100)),
        ]);
        assert!(matches!(
            duplicated.validate(10),
            Err(CartError::DuplicateLine(_))
        ));

        let ok = snapshot(vec![CartItem::new("SKU-A", 10, Money::from_cents(100))]);
        assert!(ok.validate(10).is_ok());
        assert_eq!(ok.subtotal(), Money::from_cents(1000));
    }
}
