use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::values::VariantId;

/// Errors from stock arithmetic and stock intake.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StockError {
    #[error("Insufficient stock for {variant_id}: requested {requested}, available {available}")]
    Insufficient {
        variant_id: VariantId,
        requested: u32,
        available: u32,
    },

    #[error("Cannot {operation} {quantity} of {variant_id}: only {reserved} reserved")]
    ExceedsReserved {
        variant_id: VariantId,
        operation: &'static str,
        quantity: u32,
        reserved: u32,
    },

    #[error("Invalid stock quantity {quantity} for {variant_id}")]
    InvalidQuantity { variant_id: VariantId, quantity: u32 },
}

/// Sellable stock for one variant.
///
/// `reserved_quantity <= total_quantity` always holds; every mutator checks
/// before it writes, so a failed call leaves the counts untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductStock {
    pub variant_id: VariantId,
    pub total_quantity: u32,
    pub reserved_quantity: u32,
}

impl ProductStock {
    pub fn new(variant_id: VariantId) -> Self {
        Self {
            variant_id,
            total_quantity: 0,
            reserved_quantity: 0,
        }
    }

    /// Zero when the counts are inconsistent, e.g. a state deserialized
    /// with more reserved than on hand.
    pub fn available(&self) -> u32 {
        self.total_quantity.saturating_sub(self.reserved_quantity)
    }

    pub fn check_reserve(&self, quantity: u32) -> Result<(), StockError> {
        if quantity > self.available() {
            return Err(StockError::Insufficient {
                variant_id: self.variant_id.clone(),
                requested: quantity,
                available: self.available(),
            });
        }
        Ok(())
    }

    pub fn reserve(&mut self, quantity: u32) -> Result<(), StockError> {
        self.check_reserve(quantity)?;
        self.reserved_quantity += quantity;
        Ok(())
    }

    pub fn release(&mut self, quantity: u32) -> Result<(), StockError> {
        self.check_reserved("release", quantity)?;
        self.reserved_quantity -= quantity;
        Ok(())
    }

    /// Turns a held quantity into a permanent deduction.
    pub fn commit(&mut self, quantity: u32) -> Result<(), StockError> {
        self.check_reserved("commit", quantity)?;
        self.reserved_quantity -= quantity;
        self.total_quantity = self.total_quantity.saturating_sub(quantity);
        Ok(())
    }

    pub fn receive(&mut self, quantity: u32) {
        self.total_quantity = self.total_quantity.saturating_add(quantity);
    }

    fn check_reserved(&self, operation: &'static str, quantity: u32) -> Result<(), StockError> {
        if quantity > self.reserved_quantity {
            return Err(StockError::ExceedsReserved {
                variant_id: self.variant_id.clone(),
                operation,
                quantity,
                reserved: self.reserved_quantity,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stock(total: u32) -> ProductStock {
        let mut stock = ProductStock::new(VariantId::new("SKU-A"));
        stock.receive(total);
        stock
    }

    #[test]
    fn reserve_then_commit() {
        let mut stock = stock(5);
        stock.reserve(2).unwrap();
        assert_eq!(stock.available(), 3);
        assert_eq!(stock.reserved_quantity, 2);

        stock.commit(2).unwrap();
        assert_eq!(stock.total_quantity, 3);
        assert_eq!(stock.reserved_quantity, 0);
    }

    #[test]
    fn over_reserved_stock_has_nothing_available() {
        let mut stock: ProductStock = serde_json::from_value(serde_json::json!({
            "variant_id": "SKU-A",
            "total_quantity": 1,
            "reserved_quantity": 3,
        }))
        .unwrap();
        assert_eq!(stock.available(), 0);
        assert!(stock.check_reserve(1).is_err());

        stock.commit(3).unwrap();
        assert_eq!(stock.total_quantity, 0);
        assert_eq!(stock.reserved_quantity, 0);
    }

    #[test]
    fn reserve_then_release() {
        let mut stock = stock(5);
        stock.reserve(5).unwrap();
        assert_eq!(stock.available(), 0);

        stock.release(5).unwrap();
        assert_eq!(stock.available(), 5);
    }

    #[test]
    fn over_reserve_is_rejected_without_change() {
        let mut stock = stock(5);
        stock.reserve(3).unwrap();
        let err = stock.reserve(3).unwrap_err();
        assert_eq!(
            err,
            StockError::Insufficient {
                variant_id: VariantId::new("SKU-A"),
                requested: 3,
                available: 2,
            }
        );
        assert_eq!(stock.reserved_quantity, 3);
    }

    #[test]
    fn release_and_commit_cannot_exceed_reserved() {
        let mut stock = stock(5);
        stock.reserve(1).unwrap();
        assert!(matches!(
            stock.release(2),
            Err(StockError::ExceedsReserved { operation: "release", .. })
        ));
        assert!(matches!(
            stock.commit(2),
            Err(StockError::ExceedsReserved { operation: "commit", .. })
        ));
        assert_eq!(stock.total_quantity, 5);
        assert_eq!(stock.reserved_quantity, 1);
    }
}
