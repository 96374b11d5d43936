use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Namespace for name-derived aggregate IDs.
///
/// Streams whose identity comes from a business key (a variant SKU, an
/// idempotency key) hash that key into this namespace so every process maps
/// the same key to the same stream.
const AGGREGATE_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2a4e_9b3d_4c51_8e07_d2a9_51f3_0b6c);

/// Unique identifier for an aggregate instance.
///
/// Wraps a UUID to provide type safety and prevent mixing up
/// aggregate IDs with other UUID-based identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AggregateId(Uuid);

impl AggregateId {
    /// Creates a new random aggregate ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates an aggregate ID from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Derives a stable aggregate ID from a stream kind and a business key.
    ///
    /// The same `(kind, key)` pair always yields the same ID.
    pub fn derive(kind: &str, key: &str) -> Self {
        let name = format!("{kind}/{key}");
        Self(Uuid::new_v5(&AGGREGATE_NAMESPACE, name.as_bytes()))
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for AggregateId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AggregateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for AggregateId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl From<Uuid> for AggregateId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<AggregateId> for Uuid {
    fn from(id: AggregateId) -> Self {
        id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_id_new_creates_unique_ids() {
        let id1 = AggregateId::new();
        let id2 = AggregateId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn derived_ids_are_stable_per_key() {
        let a = AggregateId::derive("stock", "SKU-001");
        let b = AggregateId::derive("stock", "SKU-001");
        assert_eq!(a, b);
        assert_eq!(a.as_uuid().get_version_num(), 5);
    }

    #[test]
    fn derived_ids_differ_by_kind_and_key() {
        let stock = AggregateId::derive("stock", "SKU-001");
        assert_ne!(stock, AggregateId::derive("stock", "SKU-002"));
        assert_ne!(stock, AggregateId::derive("attempt", "SKU-001"));
    }

    #[test]
    fn parses_from_string() {
        let id = AggregateId::new();
        let parsed: AggregateId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<AggregateId>().is_err());
    }

    #[test]
    fn aggregate_id_serialization_roundtrip() {
        let id = AggregateId::derive("attempt", "abc");
        let json = serde_json::to_string(&id).unwrap();
        let deserialized: AggregateId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, deserialized);
    }
}
