//! Inventory ledger: authoritative available-to-sell counts per variant.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use common::{AggregateId, KeyedLocks};
use domain::{
    Aggregate, CommandHandler, ProductStock, ReleaseReason, Reservation, ReservationError, ReservationLine,
    ReservationState, StockError, StockItem, VariantId,
};
use event_store::EventStore;
use tokio::sync::{OwnedMutexGuard, RwLock};

use crate::error::{FulfillmentError, Result};

/// A reservation currently holding stock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hold {
    pub reservation_id: AggregateId,
    pub attempt_id: Option<AggregateId>,
    pub expires_at: DateTime<Utc>,
}

impl Hold {
    fn of(reservation: &Reservation) -> Option<Self> {
        if !reservation.is_held() {
            return None;
        }
        Some(Self {
            reservation_id: reservation.id()?,
            attempt_id: reservation.order_attempt_id(),
            expires_at: reservation.expires_at()?,
        })
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Stock counts per variant plus the reservations held against them.
///
/// Counts live in an in-memory table keyed by variant and are a cache of the
/// event store: receipts on `StockItem` streams, holds and commits on
/// `Reservation` streams. Every mutation of a variant happens under that
/// variant's lock, with the event appended before the table is touched.
/// Multi-variant operations take their locks in sorted variant order.
/// Held reservations are indexed beside the table so expiry never has to
/// replay the reservation log.
pub struct InventoryLedger<S>
where
    S: EventStore,
{
    stock_items: CommandHandler<S, StockItem>,
    reservations: CommandHandler<S, Reservation>,
    table: RwLock<HashMap<VariantId, ProductStock>>,
    holds: RwLock<HashMap<AggregateId, Hold>>,
    variant_locks: KeyedLocks<VariantId>,
    reservation_locks: KeyedLocks<AggregateId>,
}

impl<S> InventoryLedger<S>
where
    S: EventStore + Clone,
{
    pub fn new(store: S) -> Self {
        Self {
            stock_items: CommandHandler::new(store.clone()),
            reservations: CommandHandler::new(store),
            table: RwLock::new(HashMap::new()),
            holds: RwLock::new(HashMap::new()),
            variant_locks: KeyedLocks::new(),
            reservation_locks: KeyedLocks::new(),
        }
    }

    /// Records received units for a variant.
    #[tracing::instrument(skip(self))]
    pub async fn receive_stock(
        &self,
        variant_id: &VariantId,
        quantity: u32,
        now: DateTime<Utc>,
    ) -> Result<ProductStock> {
        let _guard = self.variant_locks.lock(variant_id).await;

        self.stock_items
            .execute(StockItem::stream_id(variant_id), |item| {
                item.receive(variant_id, quantity, now)
            })
            .await?;

        let mut table = self.table.write().await;
        let stock = table
            .entry(variant_id.clone())
            .or_insert_with(|| ProductStock::new(variant_id.clone()));
        stock.receive(quantity);

        tracing::info!(quantity, total = stock.total_quantity, "stock received");
        Ok(stock.clone())
    }

    /// Current counts for a variant. Unknown variants have no stock.
    pub async fn stock(&self, variant_id: &VariantId) -> ProductStock {
        self.table
            .read()
            .await
            .get(variant_id)
            .cloned()
            .unwrap_or_else(|| ProductStock::new(variant_id.clone()))
    }

    /// Counts for every known variant, ordered by variant id.
    pub async fn stocks(&self) -> Vec<ProductStock> {
        let mut stocks: Vec<_> = self.table.read().await.values().cloned().collect();
        stocks.sort_by(|a, b| a.variant_id.cmp(&b.variant_id));
        stocks
    }

    /// Holds stock for every line, or for none of them.
    ///
    /// Lines for the same variant are merged. If a reservation already exists
    /// for the attempt and is still Held it is returned unchanged.
    #[tracing::instrument(skip(self, lines))]
    pub async fn reserve(
        &self,
        attempt_id: AggregateId,
        lines: &[ReservationLine],
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Reservation> {
        let reservation_id = Reservation::id_for_attempt(attempt_id);
        let _reservation_guard = self.reservation_locks.lock(&reservation_id).await;

        if let Some(existing) = self.reservations.load_existing(reservation_id).await? {
            if existing.is_held() {
                tracing::debug!(%reservation_id, "reservation already held");
                return Ok(existing);
            }
            return Err(FulfillmentError::InvalidReservationState {
                reservation_id,
                state: existing.state(),
            });
        }

        let merged = merge_lines(lines);
        if merged.is_empty() {
            return Err(FulfillmentError::CartInvalid(
                "a reservation needs at least one line".to_string(),
            ));
        }
        if let Some(line) = merged.iter().find(|line| line.quantity == 0) {
            return Err(FulfillmentError::CartInvalid(format!(
                "quantity for {} must be positive",
                line.variant_id
            )));
        }

        let _variant_guards = self.lock_variants(&merged).await;

        {
            let table = self.table.read().await;
            for line in &merged {
                let available = table.get(&line.variant_id).map_or(0, ProductStock::available);
                if line.quantity > available {
                    metrics::counter!("inventory_reservations_total", "outcome" => "insufficient")
                        .increment(1);
                    tracing::info!(
                        variant_id = %line.variant_id,
                        requested = line.quantity,
                        available,
                        "insufficient stock"
                    );
                    return Err(FulfillmentError::InsufficientStock {
                        variant_id: line.variant_id.clone(),
                        requested: line.quantity,
                        available,
                    });
                }
            }
        }

        let result = self
            .reservations
            .execute(reservation_id, |r| {
                r.hold(reservation_id, attempt_id, merged.clone(), expires_at, now)
            })
            .await?;

        {
            let mut table = self.table.write().await;
            for line in &merged {
                if let Some(stock) = table.get_mut(&line.variant_id) {
                    stock.reserve(line.quantity).map_err(stock_drift)?;
                }
            }
        }
        if let Some(hold) = Hold::of(&result.aggregate) {
            self.holds.write().await.insert(reservation_id, hold);
        }

        metrics::counter!("inventory_reservations_total", "outcome" => "held").increment(1);
        tracing::info!(%reservation_id, lines = merged.len(), %expires_at, "stock reserved");
        Ok(result.aggregate)
    }

    /// Returns a Held reservation's stock to the pool.
    ///
    /// Releasing a reservation that is already released, committed or
    /// unknown is a no-op. Returns true if stock was released by this call.
    #[tracing::instrument(skip(self))]
    pub async fn release(
        &self,
        reservation_id: AggregateId,
        reason: ReleaseReason,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let _reservation_guard = self.reservation_locks.lock(&reservation_id).await;

        let Some(reservation) = self.reservations.load_existing(reservation_id).await? else {
            return Ok(false);
        };
        if !reservation.is_held() {
            tracing::debug!(state = %reservation.state(), "release is a no-op");
            return Ok(false);
        }

        let _variant_guards = self.lock_variants(reservation.lines()).await;

        self.reservations
            .execute(reservation_id, |r| r.release(reason, now))
            .await?;
        self.holds.write().await.remove(&reservation_id);

        let mut table = self.table.write().await;
        for line in reservation.lines() {
            if let Some(stock) = table.get_mut(&line.variant_id) {
                stock.release(line.quantity).map_err(stock_drift)?;
            }
        }

        metrics::counter!("inventory_releases_total").increment(1);
        tracing::info!(%reason, "reservation released");
        Ok(true)
    }

    /// Turns a Held reservation into a permanent deduction.
    #[tracing::instrument(skip(self))]
    pub async fn commit(&self, reservation_id: AggregateId, now: DateTime<Utc>) -> Result<()> {
        let _reservation_guard = self.reservation_locks.lock(&reservation_id).await;

        let Some(reservation) = self.reservations.load_existing(reservation_id).await? else {
            return Err(FulfillmentError::Domain(ReservationError::NotFound.into()));
        };
        if !reservation.is_held() {
            return Err(FulfillmentError::InvalidReservationState {
                reservation_id,
                state: reservation.state(),
            });
        }

        let _variant_guards = self.lock_variants(reservation.lines()).await;

        self.reservations
            .execute(reservation_id, |r| r.commit(now))
            .await?;
        self.holds.write().await.remove(&reservation_id);

        let mut table = self.table.write().await;
        for line in reservation.lines() {
            if let Some(stock) = table.get_mut(&line.variant_id) {
                stock.commit(line.quantity).map_err(stock_drift)?;
            }
        }

        metrics::counter!("inventory_commits_total").increment(1);
        tracing::info!("reservation committed");
        Ok(())
    }

    pub async fn reservation(&self, reservation_id: AggregateId) -> Result<Option<Reservation>> {
        Ok(self.reservations.load_existing(reservation_id).await?)
    }

    /// The reservation for an attempt, if one was ever made.
    pub async fn reservation_for_attempt(
        &self,
        attempt_id: AggregateId,
    ) -> Result<Option<Reservation>> {
        self.reservation(Reservation::id_for_attempt(attempt_id))
            .await
    }

    /// Every reservation currently holding stock, soonest expiry first.
    pub async fn holds(&self) -> Vec<Hold> {
        let mut holds: Vec<_> = self.holds.read().await.values().copied().collect();
        holds.sort_by_key(|hold| hold.expires_at);
        holds
    }

    /// Rebuilds the count table from the event store.
    ///
    /// total = received - committed, reserved = sum of Held lines.
    #[tracing::instrument(skip(self))]
    pub async fn restore(&self) -> Result<()> {
        let mut rebuilt: HashMap<VariantId, ProductStock> = HashMap::new();

        for item in self.stock_items.load_all().await? {
            if let Some(variant_id) = item.variant_id() {
                let stock = rebuilt
                    .entry(variant_id.clone())
                    .or_insert_with(|| ProductStock::new(variant_id.clone()));
                stock.total_quantity = u32::try_from(item.received()).unwrap_or_else(|_| {
                    tracing::warn!(%variant_id, received = item.received(), "received units exceed u32, clamping");
                    u32::MAX
                });
            }
        }

        let reservations = self.reservations.load_all().await?;
        let mut holds = HashMap::new();
        for reservation in &reservations {
            if let Some(hold) = Hold::of(reservation) {
                holds.insert(hold.reservation_id, hold);
            }
            for line in reservation.lines() {
                let stock = rebuilt
                    .entry(line.variant_id.clone())
                    .or_insert_with(|| ProductStock::new(line.variant_id.clone()));
                match reservation.state() {
                    ReservationState::Committed => {
                        stock.total_quantity = stock.total_quantity.saturating_sub(line.quantity);
                    }
                    ReservationState::Held => {
                        stock.reserved_quantity += line.quantity;
                    }
                    ReservationState::Released => {}
                }
            }
        }

        for stock in rebuilt.values() {
            if stock.reserved_quantity > stock.total_quantity {
                tracing::warn!(
                    variant_id = %stock.variant_id,
                    total = stock.total_quantity,
                    reserved = stock.reserved_quantity,
                    "restored stock is over-reserved"
                );
            }
        }

        let variants = rebuilt.len();
        let held = holds.len();
        *self.table.write().await = rebuilt;
        *self.holds.write().await = holds;
        tracing::info!(variants, held, reservations = reservations.len(), "inventory restored");
        Ok(())
    }

    async fn lock_variants(&self, lines: &[ReservationLine]) -> Vec<OwnedMutexGuard<()>> {
        let mut variants: Vec<&VariantId> = lines.iter().map(|l| &l.variant_id).collect();
        variants.sort();
        variants.dedup();

        let mut guards = Vec::with_capacity(variants.len());
        for variant_id in variants {
            guards.push(self.variant_locks.lock(variant_id).await);
        }
        guards
    }
}

/// Sums quantities per variant, sorted by variant id.
fn merge_lines(lines: &[ReservationLine]) -> Vec<ReservationLine> {
    let mut merged: BTreeMap<&VariantId, u32> = BTreeMap::new();
    for line in lines {
        let quantity = merged.entry(&line.variant_id).or_default();
        *quantity = quantity.saturating_add(line.quantity);
    }
    merged
        .into_iter()
        .map(|(variant_id, quantity)| ReservationLine::new(variant_id.clone(), quantity))
        .collect()
}

/// The table disagreed with the event log after a successful append.
fn stock_drift(err: StockError) -> FulfillmentError {
    tracing::error!(error = %err, "stock table out of sync with event log");
    FulfillmentError::Domain(err.into())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;
    use domain::Aggregate;
    use event_store::InMemoryEventStore;

    use super::*;

    fn line(variant: &str, quantity: u32) -> ReservationLine {
        ReservationLine::new(variant, quantity)
    }

    async fn ledger_with(stock: &[(&str, u32)]) -> InventoryLedger<InMemoryEventStore> {
        let ledger = InventoryLedger::new(InMemoryEventStore::new());
        for (variant, quantity) in stock {
            ledger
                .receive_stock(&VariantId::new(*variant), *quantity, Utc::now())
                .await
                .unwrap();
        }
        ledger
    }

    fn soon() -> DateTime<Utc> {
        Utc::now() + Duration::minutes(15)
    }

    #[tokio::test]
    async fn reserve_commit_and_release() {
        let ledger = ledger_with(&[("A", 5)]).await;
        let variant = VariantId::new("A");

        let reservation = ledger
            .reserve(AggregateId::new(), &[line("A", 2)], soon(), Utc::now())
            .await
            .unwrap();
        let stock = ledger.stock(&variant).await;
        assert_eq!((stock.total_quantity, stock.reserved_quantity), (5, 2));

        let id = reservation.id().unwrap();
        ledger.commit(id, Utc::now()).await.unwrap();
        let stock = ledger.stock(&variant).await;
        assert_eq!((stock.total_quantity, stock.reserved_quantity), (3, 0));

        // Releasing a committed reservation changes nothing.
        assert!(!ledger.release(id, ReleaseReason::Canceled, Utc::now()).await.unwrap());
        assert_eq!(ledger.stock(&variant).await.total_quantity, 3);
    }

    #[tokio::test]
    async fn insufficient_stock_reserves_nothing() {
        let ledger = ledger_with(&[("A", 5), ("B", 1)]).await;

        let err = ledger
            .reserve(
                AggregateId::new(),
                &[line("A", 2), line("B", 2)],
                soon(),
                Utc::now(),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            FulfillmentError::InsufficientStock { requested: 2, available: 1, .. }
        ));
        assert_eq!(ledger.stock(&VariantId::new("A")).await.reserved_quantity, 0);
        assert_eq!(ledger.stock(&VariantId::new("B")).await.reserved_quantity, 0);
    }

    #[tokio::test]
    async fn unknown_variant_has_no_stock() {
        let ledger = ledger_with(&[]).await;
        let err = ledger
            .reserve(AggregateId::new(), &[line("X", 1)], soon(), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, FulfillmentError::InsufficientStock { available: 0, .. }));
    }

    #[tokio::test]
    async fn duplicate_lines_are_merged() {
        let ledger = ledger_with(&[("A", 5)]).await;
        let reservation = ledger
            .reserve(
                AggregateId::new(),
                &[line("A", 2), line("A", 1)],
                soon(),
                Utc::now(),
            )
            .await
            .unwrap();

        assert_eq!(reservation.lines(), &[line("A", 3)]);
        assert_eq!(ledger.stock(&VariantId::new("A")).await.reserved_quantity, 3);
    }

    #[tokio::test]
    async fn reserve_is_idempotent_per_attempt() {
        let ledger = ledger_with(&[("A", 5)]).await;
        let attempt = AggregateId::new();

        let first = ledger
            .reserve(attempt, &[line("A", 2)], soon(), Utc::now())
            .await
            .unwrap();
        let second = ledger
            .reserve(attempt, &[line("A", 2)], soon(), Utc::now())
            .await
            .unwrap();

        assert_eq!(first.id(), second.id());
        assert_eq!(ledger.stock(&VariantId::new("A")).await.reserved_quantity, 2);
    }

    #[tokio::test]
    async fn commit_released_reservation_fails_and_release_is_idempotent() {
        let ledger = ledger_with(&[("A", 5)]).await;
        let reservation = ledger
            .reserve(AggregateId::new(), &[line("A", 2)], soon(), Utc::now())
            .await
            .unwrap();
        let id = reservation.id().unwrap();

        assert!(ledger.release(id, ReleaseReason::Canceled, Utc::now()).await.unwrap());
        assert!(!ledger.release(id, ReleaseReason::Canceled, Utc::now()).await.unwrap());
        assert_eq!(ledger.stock(&VariantId::new("A")).await.available(), 5);

        let err = ledger.commit(id, Utc::now()).await.unwrap_err();
        assert!(matches!(
            err,
            FulfillmentError::InvalidReservationState {
                state: ReservationState::Released,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn releasing_unknown_reservation_is_a_noop() {
        let ledger = ledger_with(&[]).await;
        assert!(
            !ledger
                .release(AggregateId::new(), ReleaseReason::Expired, Utc::now())
                .await
                .unwrap()
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_reservations_never_oversell() {
        let ledger = Arc::new(ledger_with(&[("A", 10)]).await);

        let mut handles = Vec::new();
        for _ in 0..25 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger
                    .reserve(AggregateId::new(), &[line("A", 3)], soon(), Utc::now())
                    .await
                    .is_ok()
            }));
        }

        let mut succeeded = 0;
        for handle in handles {
            if handle.await.unwrap() {
                succeeded += 1;
            }
        }

        assert_eq!(succeeded, 3);
        let stock = ledger.stock(&VariantId::new("A")).await;
        assert_eq!(stock.reserved_quantity, 9);
        assert!(stock.reserved_quantity <= stock.total_quantity);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn overlapping_carts_in_opposite_order_do_not_deadlock() {
        let ledger = Arc::new(ledger_with(&[("A", 100), ("B", 100)]).await);

        let mut handles = Vec::new();
        for i in 0..20 {
            let ledger = ledger.clone();
            let lines = if i % 2 == 0 {
                vec![line("A", 1), line("B", 1)]
            } else {
                vec![line("B", 1), line("A", 1)]
            };
            handles.push(tokio::spawn(async move {
                ledger
                    .reserve(AggregateId::new(), &lines, soon(), Utc::now())
                    .await
            }));
        }

        let all = async {
            for handle in handles {
                handle.await.unwrap().unwrap();
            }
        };
        tokio::time::timeout(std::time::Duration::from_secs(10), all)
            .await
            .expect("reservations deadlocked");

        assert_eq!(ledger.stock(&VariantId::new("A")).await.reserved_quantity, 20);
        assert_eq!(ledger.stock(&VariantId::new("B")).await.reserved_quantity, 20);
    }

    #[tokio::test]
    async fn holds_track_reservations_and_restore() {
        let store = InMemoryEventStore::new();
        let ledger = InventoryLedger::new(store.clone());
        let now = Utc::now();
        ledger.receive_stock(&VariantId::new("A"), 10, now).await.unwrap();

        let expired = ledger
            .reserve(AggregateId::new(), &[line("A", 2)], now - Duration::seconds(1), now)
            .await
            .unwrap();
        let committed = ledger
            .reserve(AggregateId::new(), &[line("A", 3)], soon(), now)
            .await
            .unwrap();
        ledger.commit(committed.id().unwrap(), now).await.unwrap();
        ledger
            .reserve(AggregateId::new(), &[line("A", 1)], soon(), now)
            .await
            .unwrap();

        let holds = ledger.holds().await;
        assert_eq!(holds.len(), 2);
        assert_eq!(Some(holds[0].reservation_id), expired.id());
        assert!(holds[0].is_expired(now));
        assert!(!holds[1].is_expired(now));

        let rebuilt = InventoryLedger::new(store);
        assert!(rebuilt.holds().await.is_empty());
        rebuilt.restore().await.unwrap();
        assert_eq!(rebuilt.holds().await, holds);
        assert_eq!(rebuilt.stock(&VariantId::new("A")).await, ledger.stock(&VariantId::new("A")).await);
        let stock = rebuilt.stock(&VariantId::new("A")).await;
        assert_eq!((stock.total_quantity, stock.reserved_quantity), (7, 3));
    }

    #[tokio::test]
    async fn stocks_lists_every_variant_in_order() {
        let ledger = InventoryLedger::new(InMemoryEventStore::new());
        let now = Utc::now();
        for (sku, quantity) in [("B", 2), ("A", 5)] {
            ledger.receive_stock(&VariantId::new(sku), quantity, now).await.unwrap();
        }

        let stocks = ledger.stocks().await;
        let listed: Vec<_> = stocks
            .iter()
            .map(|s| (s.variant_id.as_str(), s.total_quantity))
            .collect();
        assert_eq!(listed, [("A", 5), ("B", 2)]);
    }
}
