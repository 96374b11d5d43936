//! Application configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use fulfillment::{FulfillmentConfig, RetryPolicy};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format {other}")),
        }
    }
}

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`, `PORT`: bind address (default `0.0.0.0:3000`)
/// - `RUST_LOG`: tracing filter directive (default `info`)
/// - `LOG_FORMAT`: `text` or `json`
/// - `DATABASE_URL`: PostgreSQL connection string; unset keeps everything in memory
/// - `DATABASE_MAX_CONNECTIONS`: pool size (default 10)
/// - `RESERVATION_TTL_SECS`, `SWEEP_INTERVAL_SECS`
/// - `MAX_ITEM_QUANTITY`, `CURRENCY`
/// - `PROVIDER_TIMEOUT_MS`, `PROVIDER_MAX_RETRIES`, `PROVIDER_BACKOFF_MS`
/// - `WEBHOOK_SECRET`, `WEBHOOK_TOLERANCE_SECS`, `WEBHOOK_RETENTION_HOURS`
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub reservation_ttl_secs: i64,
    pub sweep_interval_secs: u64,
    pub max_item_quantity: u32,
    pub currency: String,
    pub provider_timeout_ms: u64,
    pub provider_max_retries: usize,
    pub provider_backoff_ms: u64,
    pub webhook_secret: String,
    pub webhook_tolerance_secs: i64,
    pub webhook_retention_hours: i64,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration from any key/value source. Unparseable values
    /// fall back to their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        fn parse_with<T: FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            key: &str,
        ) -> Option<T> {
            lookup(key).and_then(|v| v.parse().ok())
        }

        Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: parse_with(&lookup, "PORT").unwrap_or(defaults.port),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: parse_with(&lookup, "LOG_FORMAT").unwrap_or(defaults.log_format),
            database_url: lookup("DATABASE_URL").filter(|url| !url.is_empty()),
            database_max_connections: parse_with(&lookup, "DATABASE_MAX_CONNECTIONS")
                .unwrap_or(defaults.database_max_connections),
            reservation_ttl_secs: parse_with(&lookup, "RESERVATION_TTL_SECS")
                .unwrap_or(defaults.reservation_ttl_secs),
            sweep_interval_secs: parse_with(&lookup, "SWEEP_INTERVAL_SECS")
                .unwrap_or(defaults.sweep_interval_secs),
            max_item_quantity: parse_with(&lookup, "MAX_ITEM_QUANTITY").unwrap_or(defaults.max_item_quantity),
            currency: lookup("CURRENCY").unwrap_or(defaults.currency),
            provider_timeout_ms: parse_with(&lookup, "PROVIDER_TIMEOUT_MS")
                .unwrap_or(defaults.provider_timeout_ms),
            provider_max_retries: parse_with(&lookup, "PROVIDER_MAX_RETRIES")
                .unwrap_or(defaults.provider_max_retries),
            provider_backoff_ms: parse_with(&lookup, "PROVIDER_BACKOFF_MS")
                .unwrap_or(defaults.provider_backoff_ms),
            webhook_secret: lookup("WEBHOOK_SECRET").unwrap_or(defaults.webhook_secret),
            webhook_tolerance_secs: parse_with(&lookup, "WEBHOOK_TOLERANCE_SECS")
                .unwrap_or(defaults.webhook_tolerance_secs),
            webhook_retention_hours: parse_with(&lookup, "WEBHOOK_RETENTION_HOURS")
                .unwrap_or(defaults.webhook_retention_hours),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Service tunables derived from this configuration.
    pub fn fulfillment(&self) -> FulfillmentConfig {
        let defaults = FulfillmentConfig::default();
        FulfillmentConfig {
            reservation_ttl: chrono::Duration::seconds(self.reservation_ttl_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            max_item_quantity: self.max_item_quantity,
            currency: self.currency.clone(),
            provider_timeout: Duration::from_millis(self.provider_timeout_ms),
            retry: RetryPolicy::new(
                self.provider_max_retries,
                Duration::from_millis(self.provider_backoff_ms),
            ),
            webhook_retention: chrono::Duration::hours(self.webhook_retention_hours),
            prune_interval: defaults.prune_interval,
        }
    }

    pub fn webhook_tolerance(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.webhook_tolerance_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            database_url: None,
            database_max_connections: 10,
            reservation_ttl_secs: 900,
            sweep_interval_secs: 30,
            max_item_quantity: 10,
            currency: "USD".to_string(),
            provider_timeout_ms: 5000,
            provider_max_retries: 3,
            provider_backoff_ms: 100,
            webhook_secret: "whsec_dev_only".to_string(),
            webhook_tolerance_secs: 300,
            webhook_retention_hours: 72,
        }
    }
}
