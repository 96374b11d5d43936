//! Tunables shared by the fulfillment services.

use std::time::Duration;

use crate::payment::RetryPolicy;

#[derive(Debug, Clone)]
pub struct FulfillmentConfig {
    /// How long a reservation holds stock before the sweeper may release it.
    pub reservation_ttl: chrono::Duration,
    /// Period of the expiry sweep.
    pub sweep_interval: Duration,
    /// Per-line quantity ceiling for a checkout.
    pub max_item_quantity: u32,
    /// Currency of cart snapshots taken by the API.
    pub currency: String,
    /// Bound on a single provider request.
    pub provider_timeout: Duration,
    /// Backoff for retryable provider calls.
    pub retry: RetryPolicy,
    /// How long processed webhook ids are kept.
    pub webhook_retention: chrono::Duration,
    /// Period of the processed-id pruning task.
    pub prune_interval: Duration,
}

impl Default for FulfillmentConfig {
    fn default() -> Self {
        Self {
            reservation_ttl: chrono::Duration::minutes(15),
            sweep_interval: Duration::from_secs(30),
            max_item_quantity: 10,
            currency: "USD".to_string(),
            provider_timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
            webhook_retention: chrono::Duration::hours(72),
            prune_interval: Duration::from_secs(3600),
        }
    }
}
