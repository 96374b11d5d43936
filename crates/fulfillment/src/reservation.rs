//! Reservation manager: cart snapshot in, stock hold out.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::AggregateId;
use domain::{CartSnapshot, Reservation, ReservationLine};
use event_store::EventStore;

use crate::config::FulfillmentConfig;
use crate::error::{FulfillmentError, Result};
use crate::ledger::InventoryLedger;
use crate::services::catalog::Catalog;

/// Validates a cart against the catalog and holds its stock.
pub struct ReservationManager<S, C>
where
    S: EventStore,
    C: Catalog,
{
    ledger: Arc<InventoryLedger<S>>,
    catalog: C,
    config: FulfillmentConfig,
}

impl<S, C> ReservationManager<S, C>
where
    S: EventStore + Clone,
    C: Catalog,
{
    pub fn new(ledger: Arc<InventoryLedger<S>>, catalog: C, config: FulfillmentConfig) -> Self {
        Self {
            ledger,
            catalog,
            config,
        }
    }

    pub fn ledger(&self) -> &Arc<InventoryLedger<S>> {
        &self.ledger
    }

    pub fn catalog(&self) -> &C {
        &self.catalog
    }

    /// Holds stock for a checkout attempt.
    ///
    /// Calling again for the same attempt while its reservation is Held
    /// returns that reservation. The hold expires after the configured TTL;
    /// the expiry sweeper releases it if nothing commits it first.
    #[tracing::instrument(skip(self, cart), fields(lines = cart.items.len()))]
    pub async fn begin_checkout(
        &self,
        attempt_id: AggregateId,
        cart: &CartSnapshot,
        now: DateTime<Utc>,
    ) -> Result<Reservation> {
        if let Some(existing) = self.ledger.reservation_for_attempt(attempt_id).await?
            && existing.is_held()
        {
            tracing::debug!("returning existing hold");
            return Ok(existing);
        }

        self.validate(cart).await?;

        let lines: Vec<ReservationLine> = cart
            .items
            .iter()
            .map(|item| ReservationLine::new(item.variant_id.clone(), item.quantity))
            .collect();
        let expires_at = now + self.config.reservation_ttl;

        let reservation = self
            .ledger
            .reserve(attempt_id, &lines, expires_at, now)
            .await?;
        tracing::debug!(%expires_at, "hold scheduled for expiry");
        Ok(reservation)
    }

    /// Structural checks plus current catalog price and availability.
    async fn validate(&self, cart: &CartSnapshot) -> Result<()> {
        cart.validate(self.config.max_item_quantity)
            .map_err(|e| FulfillmentError::CartInvalid(e.to_string()))?;

        for item in &cart.items {
            let meta = self
                .catalog
                .get_product_meta(&item.variant_id)
                .await
                .ok_or_else(|| {
                    FulfillmentError::CartInvalid(format!("unknown variant {}", item.variant_id))
                })?;
            if !meta.active {
                return Err(FulfillmentError::CartInvalid(format!(
                    "{} is no longer available",
                    item.variant_id
                )));
            }

            let price = self
                .catalog
                .get_current_price(&item.variant_id)
                .await
                .ok_or_else(|| {
                    FulfillmentError::CartInvalid(format!("no price for {}", item.variant_id))
                })?;
            if price != item.unit_price {
                return Err(FulfillmentError::CartInvalid(format!(
                    "price of {} changed from {} to {}",
                    item.variant_id, item.unit_price, price
                )));
            }
        }
        Ok(())
    }
}
