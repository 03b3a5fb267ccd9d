//! Core domain types shared across the provider integration core.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::providers::mapping::VendorMapping;

/// How a vendor's native currency is converted to USD when pricing offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NormalizationMode {
    Auto,
    Manual,
    SmartAuto,
}

impl NormalizationMode {
    pub fn as_str(&self) -> &str {
        match self {
            NormalizationMode::Auto => "AUTO",
            NormalizationMode::Manual => "MANUAL",
            NormalizationMode::SmartAuto => "SMART_AUTO",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "MANUAL" => NormalizationMode::Manual,
            "SMART_AUTO" => NormalizationMode::SmartAuto,
            _ => NormalizationMode::Auto,
        }
    }
}

/// Catalog sync lifecycle state stored on the vendor row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Idle,
    Syncing,
    Success,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &str {
        match self {
            SyncStatus::Idle => "idle",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Success => "success",
            SyncStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "syncing" => SyncStatus::Syncing,
            "success" => SyncStatus::Success,
            "failed" => SyncStatus::Failed,
            _ => SyncStatus::Idle,
        }
    }
}

/// An upstream SMS-activation vendor and its admin-tunable economics.
///
/// `name` is the stable slug used as the routing key in activation IDs and as
/// the filter key in the offer index. Lower `priority` is preferred.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vendor {
    pub id: i64,
    pub name: String,
    pub display_name: String,
    pub is_active: bool,
    pub priority: i64,
    pub weight: f64,
    pub price_multiplier: f64,
    pub fixed_markup: f64,
    pub currency: String,
    pub deposit_currency: Option<String>,
    pub normalization_mode: NormalizationMode,
    pub normalization_rate: Option<f64>,
    pub deposit_spent: Option<f64>,
    pub deposit_received: Option<f64>,
    pub use_global_sync: bool,
    pub balance: Option<f64>,
    pub balance_alert_threshold: Option<f64>,
    pub sync_status: SyncStatus,
    pub sync_count: i64,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_metadata_sync_at: Option<DateTime<Utc>>,
    pub mapping: VendorMapping,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Vendor {
    /// Slugs are the sole routing key, so they must stay within the
    /// activation-id alphabet.
    pub fn valid_slug(slug: &str) -> bool {
        !slug.is_empty()
            && slug
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
    }
}

/// Canonical country registry row. `id` is the stable cross-system key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountryLookup {
    pub id: i64,
    pub code: String,
    pub name: String,
}

/// Canonical service registry row. `id` is the stable cross-system key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceLookup {
    pub id: i64,
    pub code: String,
    pub name: String,
}

/// Per-vendor country row, unique on `(vendor_id, external_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderCountry {
    pub vendor_id: i64,
    pub external_id: String,
    pub code: String,
    pub name: String,
    pub flag_url: Option<String>,
    pub is_active: bool,
    pub last_sync_at: Option<DateTime<Utc>>,
}

/// Per-vendor service row, unique on `(vendor_id, external_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderService {
    pub vendor_id: i64,
    pub external_id: String,
    pub code: String,
    pub name: String,
    pub icon_url: Option<String>,
    pub is_active: bool,
    pub last_sync_at: Option<DateTime<Utc>>,
}

/// A priced `(vendor, country, service, operator)` tuple published to the
/// search index. Prices are final sell prices in points, fixed at index time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Offer {
    pub id: String,
    pub vendor: String,
    pub provider_country_code: String,
    pub country_id: i64,
    pub country_name: String,
    pub country_icon: Option<String>,
    pub provider_service_code: String,
    pub service_id: i64,
    pub service_name: String,
    pub service_icon: Option<String>,
    pub operator: String,
    pub price: f64,
    pub raw_price: f64,
    pub stock: i64,
    pub last_synced_at: DateTime<Utc>,
    pub is_active: bool,
}

impl Offer {
    /// Offer document id: `lower(vendor_country_service_operator)` with every
    /// character outside `[a-z0-9_]` stripped.
    pub fn doc_id(vendor: &str, country: &str, service: &str, operator: &str) -> String {
        let joined = format!("{}_{}_{}_{}", vendor, country, service, operator);
        joined
            .to_lowercase()
            .chars()
            .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_')
            .collect()
    }
}

/// Normalized country emitted by a provider's `list_countries`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogCountry {
    pub external_id: String,
    pub code: String,
    pub name: String,
    pub iso2: Option<String>,
    pub flag_url: Option<String>,
}

/// Normalized service emitted by a provider's `list_services`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogService {
    pub external_id: String,
    pub code: String,
    pub name: String,
    pub icon_url: Option<String>,
}

/// One live price row from a vendor: canonical country/service codes plus the
/// untransformed vendor price and remaining stock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceEntry {
    pub country: String,
    pub service: String,
    pub operator: Option<String>,
    pub raw_price: f64,
    pub count: i64,
}

/// Caller options for a purchase.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuyOptions {
    /// Pin the purchase to one vendor slug; disables failover.
    pub vendor: Option<String>,
    pub operator: Option<String>,
    pub max_price: Option<f64>,
}

/// A successful purchase as returned to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Purchase {
    /// `"<vendor-slug>:<vendor-activation-id>"`.
    pub activation_id: String,
    pub phone_number: String,
    pub sell_price: f64,
    pub vendor: String,
}

/// Lifecycle state of an activation as reported by the vendor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationState {
    WaitingSms,
    SmsReceived,
    Canceled,
    Completed,
    Expired,
}

/// Result of a `status` poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationStatus {
    pub state: ActivationState,
    pub sms: Vec<String>,
}

/// Precomputed per-service aggregate refreshed after each full sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceAggregate {
    pub service_id: i64,
    pub code: String,
    pub name: String,
    pub provider_count: i64,
    pub min_price: f64,
    pub total_stock: i64,
}
