//! Vendor integration: the fixed operation set and the mapping-driven
//! adapter that implements it for every vendor.
//!
//! There is exactly one adapter type. Per-vendor behavior lives entirely in
//! the mapping document; adding a vendor is a data change, not a code change.

pub mod adapter;
pub mod decode;
pub mod error;
pub mod mapping;
pub mod pricing;

use async_trait::async_trait;

use crate::models::{ActivationStatus, BuyOptions, CatalogCountry, CatalogService, PriceEntry, Vendor};

pub use adapter::DynamicAdapter;
pub use error::{ErrorKind, ProviderError};

/// Raw purchase result from a vendor, before the router prefixes the
/// activation id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VendorPurchase {
    /// The vendor's own activation id, unprefixed.
    pub id: String,
    pub phone: String,
}

/// The capability set every vendor exposes.
#[async_trait]
pub trait Provider: Send + Sync {
    fn slug(&self) -> &str;
    fn vendor(&self) -> &Vendor;

    async fn list_countries(&self) -> Result<Vec<CatalogCountry>, ProviderError>;
    async fn list_services(&self, country: Option<&str>)
        -> Result<Vec<CatalogService>, ProviderError>;
    async fn list_prices(&self, country: Option<&str>) -> Result<Vec<PriceEntry>, ProviderError>;
    async fn buy(
        &self,
        country: &str,
        service: &str,
        opts: &BuyOptions,
    ) -> Result<VendorPurchase, ProviderError>;
    async fn status(&self, activation_id: &str) -> Result<ActivationStatus, ProviderError>;
    async fn cancel(&self, activation_id: &str) -> Result<(), ProviderError>;
    async fn resend(&self, activation_id: &str) -> Result<(), ProviderError>;
    async fn complete(&self, activation_id: &str) -> Result<(), ProviderError>;
    async fn balance(&self) -> Result<f64, ProviderError>;
}
