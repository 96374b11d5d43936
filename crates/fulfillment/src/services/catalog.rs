//! Catalog lookups used to re-validate carts at checkout.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use domain::{Money, VariantId};
use tokio::sync::RwLock;

/// Descriptive data about a sellable variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductMeta {
    pub name: String,
    /// Inactive variants cannot be checked out.
    pub active: bool,
}

/// Read access to the product catalog.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Current unit price, or None for an unknown variant.
    async fn get_current_price(&self, variant_id: &VariantId) -> Option<Money>;

    async fn get_product_meta(&self, variant_id: &VariantId) -> Option<ProductMeta>;
}

#[derive(Debug, Clone)]
struct CatalogEntry {
    price: Money,
    meta: ProductMeta,
}

/// In-memory catalog for development and tests.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCatalog {
    entries: Arc<RwLock<HashMap<VariantId, CatalogEntry>>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a variant.
    pub async fn upsert(&self, variant_id: impl Into<VariantId>, name: impl Into<String>, price: Money) {
        self.entries.write().await.insert(
            variant_id.into(),
            CatalogEntry {
                price,
                meta: ProductMeta {
                    name: name.into(),
                    active: true,
                },
            },
        );
    }

    /// Changes the price of a known variant. Returns false if it is unknown.
    pub async fn set_price(&self, variant_id: &VariantId, price: Money) -> bool {
        match self.entries.write().await.get_mut(variant_id) {
            Some(entry) => {
                entry.price = price;
                true
            }
            None => false,
        }
    }

    pub async fn set_active(&self, variant_id: &VariantId, active: bool) -> bool {
        match self.entries.write().await.get_mut(variant_id) {
            Some(entry) => {
                entry.meta.active = active;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl Catalog for InMemoryCatalog {
    async fn get_current_price(&self, variant_id: &VariantId) -> Option<Money> {
        self.entries.read().await.get(variant_id).map(|e| e.price)
    }

    async fn get_product_meta(&self, variant_id: &VariantId) -> Option<ProductMeta> {
        self.entries
            .read()
            .await
            .get(variant_id)
            .map(|e| e.meta.clone())
    }
}
