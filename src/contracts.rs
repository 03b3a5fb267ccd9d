//! Contracts consumed from the rest of the platform.
//!
//! Exchange rates, system settings and audit logging belong to other
//! subsystems; the core only depends on these narrow traits.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

use crate::storage::Storage;

/// `ISO currency -> units per USD`. The core never computes rates itself.
#[async_trait]
pub trait RateSource: Send + Sync {
    async fn exchange_rates(&self) -> Result<HashMap<String, f64>>;
}

/// System settings owned by the admin subsystem.
#[async_trait]
pub trait SettingsSource: Send + Sync {
    /// Conversion factor from USD to internal points.
    async fn points_rate(&self) -> f64;
}

/// Fire-and-forget audit trail. Failures are swallowed by contract.
pub trait AuditLog: Send + Sync {
    fn log(&self, action: &str, meta: Value);
}

/// Rates pinned at process start from the `EXCHANGE_RATES` env JSON
/// (`{"RUB": 90.0, ...}`). USD is always present at 1.0.
pub struct FixedRateSource {
    rates: HashMap<String, f64>,
}

impl FixedRateSource {
    pub fn from_env() -> Result<Self> {
        let mut rates: HashMap<String, f64> = match std::env::var("EXCHANGE_RATES") {
            Ok(raw) => serde_json::from_str(&raw).context("parsing EXCHANGE_RATES")?,
            Err(_) => HashMap::new(),
        };
        rates.entry("USD".to_string()).or_insert(1.0);
        Ok(Self { rates })
    }

    pub fn new(rates: HashMap<String, f64>) -> Self {
        let mut rates = rates;
        rates.entry("USD".to_string()).or_insert(1.0);
        Self { rates }
    }
}

#[async_trait]
impl RateSource for FixedRateSource {
    async fn exchange_rates(&self) -> Result<HashMap<String, f64>> {
        Ok(self.rates.clone())
    }
}

/// Points rate pinned from `POINTS_RATE` (default 1.0).
pub struct EnvSettings {
    points_rate: f64,
}

impl EnvSettings {
    pub fn from_env() -> Self {
        let points_rate = std::env::var("POINTS_RATE")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|v: &f64| *v > 0.0)
            .unwrap_or(1.0);
        Self { points_rate }
    }

    pub fn new(points_rate: f64) -> Self {
        Self { points_rate }
    }
}

#[async_trait]
impl SettingsSource for EnvSettings {
    async fn points_rate(&self) -> f64 {
        self.points_rate
    }
}

/// Audit sink writing to tracing and the durable audit table.
pub struct StorageAudit {
    storage: Arc<Storage>,
}

impl StorageAudit {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

impl AuditLog for StorageAudit {
    fn log(&self, action: &str, meta: Value) {
        info!(action, %meta, "audit");
        if let Err(e) = self.storage.append_audit(action, &meta.to_string()) {
            warn!(action, "audit append failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fixed_rates_always_include_usd() {
        let source = FixedRateSource::new(HashMap::from([("RUB".to_string(), 90.0)]));
        let rates = source.exchange_rates().await.unwrap();
        assert_eq!(rates.get("USD"), Some(&1.0));
        assert_eq!(rates.get("RUB"), Some(&90.0));
    }

    #[tokio::test]
    async fn storage_audit_is_fire_and_forget() {
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        let audit = StorageAudit::new(storage);
        // The contract under test: logging never errors or panics.
        audit.log("provider.sync", serde_json::json!({"vendor": "v1"}));
        audit.log("provider.sync", serde_json::json!({}));
    }
}
