use common::AggregateId;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::values::ShopperId;

/// Deterministic key for one checkout attempt.
///
/// Derived from the shopper, the cart contents and an attempt sequence, so a
/// retried request maps to the same attempt while a deliberate retry after a
/// failure (next sequence) gets a fresh one. Sent with every provider call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn derive(shopper_id: &ShopperId, cart_hash: &str, sequence: u32) -> Self {
        let digest = Sha256::digest(format!("{shopper_id}|{cart_hash}|{sequence}").as_bytes());
        Self(hex::encode(digest))
    }

    /// Wraps a key received from elsewhere (e.g. provider metadata).
    pub fn from_raw(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The order attempt stream this key addresses.
    pub fn attempt_id(&self) -> AggregateId {
        AggregateId::derive("attempt", &self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
