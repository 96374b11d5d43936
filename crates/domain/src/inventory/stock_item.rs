use chrono::{DateTime, Utc};
use common::AggregateId;
use event_store::Version;
use serde::{Deserialize, Serialize};

use super::StockError;
use crate::aggregate::{Aggregate, DomainEvent};
use crate::values::VariantId;

/// Events on a variant's intake stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum StockEvent {
    StockReceived(StockReceivedData),
}

impl DomainEvent for StockEvent {
    fn event_type(&self) -> &'static str {
        match self {
            StockEvent::StockReceived(_) => "StockReceived",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StockReceivedData {
    pub variant_id: VariantId,
    pub quantity: u32,
    pub received_at: DateTime<Utc>,
}

/// Intake history of one variant.
///
/// Only receipts live here; commits are recorded on the reservation that
/// consumed the stock, and the ledger combines the two.
#[derive(Debug, Default)]
pub struct StockItem {
    id: Option<AggregateId>,
    variant_id: Option<VariantId>,
    received: u64,
    version: Version,
}

impl StockItem {
    /// Stream id for a variant's intake history.
    pub fn stream_id(variant_id: &VariantId) -> AggregateId {
        AggregateId::derive("stock", variant_id.as_str())
    }

    pub fn variant_id(&self) -> Option<&VariantId> {
        self.variant_id.as_ref()
    }

    /// Total units ever received.
    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn receive(
        &self,
        variant_id: &VariantId,
        quantity: u32,
        at: DateTime<Utc>,
    ) -> Result<Vec<StockEvent>, StockError> {
        if quantity == 0 {
            return Err(StockError::InvalidQuantity {
                variant_id: variant_id.clone(),
                quantity,
            });
        }
        Ok(vec![StockEvent::StockReceived(StockReceivedData {
            variant_id: variant_id.clone(),
            quantity,
            received_at: at,
        })])
    }
}

impl Aggregate for StockItem {
    type Event = StockEvent;
    type Error = StockError;

    fn aggregate_type() -> &'static str {
        "StockItem"
    }

    fn id(&self) -> Option<AggregateId> {
        self.id
    }

    fn version(&self) -> Version {
        self.version
    }

    fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    fn apply(&mut self, event: Self::Event) {
        match event {
            StockEvent::StockReceived(data) => {
                if self.id.is_none() {
                    self.id = Some(Self::stream_id(&data.variant_id));
                    self.variant_id = Some(data.variant_id);
                }
                self.received += u64::from(data.quantity);
            }
        }
    }
}
