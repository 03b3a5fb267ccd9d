//! Shared fixtures for unit and integration tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use crate::models::{
    ActivationState, ActivationStatus, BuyOptions, CatalogCountry, CatalogService,
    NormalizationMode, Offer, PriceEntry, SyncStatus, Vendor,
};
use crate::providers::mapping::{OperationSpec, Operations, VendorMapping};
use crate::providers::{DynamicAdapter, ErrorKind, Provider, ProviderError, VendorPurchase};
use crate::registry::CanonicalRegistry;
use crate::storage::Storage;

pub fn mapping_fixture() -> VendorMapping {
    VendorMapping {
        version: 1,
        base_url: "https://api.vendor.test".to_string(),
        auth: Default::default(),
        currency: "USD".to_string(),
        deposit_currency: None,
        requests_per_minute: None,
        default_timeout_ms: None,
        operations: Operations::default(),
    }
}

pub fn op_fixture() -> OperationSpec {
    OperationSpec {
        method: "GET".to_string(),
        url: "/x".to_string(),
        headers: HashMap::new(),
        query: HashMap::new(),
        encoding: Default::default(),
        body: None,
        decoding: Default::default(),
        response: Default::default(),
        errors: vec![],
        status_map: HashMap::new(),
        timeout_ms: None,
        page: None,
        backoff_ms: None,
    }
}

pub fn vendor_fixture(slug: &str) -> Vendor {
    let now = Utc::now();
    Vendor {
        id: 0,
        name: slug.to_string(),
        display_name: slug.to_uppercase(),
        is_active: true,
        priority: 1,
        weight: 1.0,
        price_multiplier: 1.0,
        fixed_markup: 0.0,
        currency: "USD".to_string(),
        deposit_currency: None,
        normalization_mode: NormalizationMode::Auto,
        normalization_rate: None,
        deposit_spent: None,
        deposit_received: None,
        use_global_sync: false,
        balance: None,
        balance_alert_threshold: None,
        sync_status: SyncStatus::Idle,
        sync_count: 0,
        last_sync_at: None,
        last_metadata_sync_at: None,
        mapping: mapping_fixture(),
        created_at: now,
        updated_at: now,
    }
}

pub fn storage_fixture() -> Arc<Storage> {
    Arc::new(Storage::open_in_memory().expect("in-memory storage"))
}

pub fn registry_fixture() -> Arc<CanonicalRegistry> {
    Arc::new(CanonicalRegistry::new(
        storage_fixture(),
        std::path::PathBuf::from("/nonexistent"),
    ))
}

pub fn adapter_fixture(vendor: Vendor) -> DynamicAdapter {
    DynamicAdapter::new(vendor, registry_fixture()).expect("adapter fixture")
}

pub fn offer_fixture(vendor: &str, country: &str, service: &str, price: f64) -> Offer {
    Offer {
        id: Offer::doc_id(vendor, country, service, "any"),
        vendor: vendor.to_string(),
        provider_country_code: country.to_string(),
        country_id: 1,
        country_name: country.to_uppercase(),
        country_icon: None,
        provider_service_code: service.to_string(),
        service_id: 1,
        service_name: service.to_string(),
        service_icon: None,
        operator: "any".to_string(),
        price,
        raw_price: price,
        stock: 5,
        last_synced_at: Utc::now(),
        is_active: true,
    }
}

type BuyResult = Result<VendorPurchase, ErrorKind>;

/// Scripted vendor for router and synchronizer tests: fixed catalog data,
/// scripted buy/status outcomes, and a call log for contact assertions.
pub struct ScriptedProvider {
    vendor: Vendor,
    countries: Vec<CatalogCountry>,
    services: Vec<CatalogService>,
    prices: Vec<PriceEntry>,
    balance: Option<f64>,
    buy_result: Option<BuyResult>,
    status_result: Option<ActivationStatus>,
    all_failing: bool,
    calls: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    pub fn new(slug: &str) -> Self {
        Self {
            vendor: vendor_fixture(slug),
            countries: vec![],
            services: vec![],
            prices: vec![],
            balance: None,
            buy_result: None,
            status_result: None,
            all_failing: false,
            calls: Mutex::new(vec![]),
        }
    }

    pub fn with_vendor(mut self, vendor: Vendor) -> Self {
        self.vendor = vendor;
        self
    }

    pub fn with_countries(mut self, rows: Vec<(&str, &str)>) -> Self {
        self.countries = rows
            .into_iter()
            .map(|(external_id, name)| {
                let code = match name {
                    "United States" => "us",
                    "Russia" => "ru",
                    other => other,
                };
                CatalogCountry {
                    external_id: external_id.to_string(),
                    code: code.to_string(),
                    name: name.to_string(),
                    iso2: Some(code.to_string()),
                    flag_url: None,
                }
            })
            .collect();
        self
    }

    pub fn with_services(mut self, rows: Vec<(&str, &str)>) -> Self {
        self.services = rows
            .into_iter()
            .map(|(external_id, code)| CatalogService {
                external_id: external_id.to_string(),
                code: code.to_string(),
                name: {
                    let mut chars = code.chars();
                    match chars.next() {
                        Some(first) => first.to_uppercase().chain(chars).collect(),
                        None => String::new(),
                    }
                },
                icon_url: None,
            })
            .collect();
        self
    }

    pub fn with_prices(mut self, rows: Vec<(&str, &str, f64, i64)>) -> Self {
        self.prices = rows
            .into_iter()
            .map(|(country, service, raw_price, count)| PriceEntry {
                country: country.to_string(),
                service: service.to_string(),
                operator: None,
                raw_price,
                count,
            })
            .collect();
        self
    }

    pub fn with_balance(mut self, balance: f64) -> Self {
        self.balance = Some(balance);
        self
    }

    pub fn with_buy_ok(mut self, id: &str, phone: &str) -> Self {
        self.buy_result = Some(Ok(VendorPurchase {
            id: id.to_string(),
            phone: phone.to_string(),
        }));
        self
    }

    pub fn with_buy_err(mut self, kind: ErrorKind) -> Self {
        self.buy_result = Some(Err(kind));
        self
    }

    pub fn with_status(mut self, state: ActivationState, sms: Vec<&str>) -> Self {
        self.status_result = Some(ActivationStatus {
            state,
            sms: sms.into_iter().map(String::from).collect(),
        });
        self
    }

    /// Every operation fails with SERVER_ERROR.
    pub fn all_failing(mut self) -> Self {
        self.all_failing = true;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().push(call.into());
    }

    fn err(&self, kind: ErrorKind) -> ProviderError {
        ProviderError::new(kind, &self.vendor.name, "scripted")
    }

    fn fail_if_scripted(&self) -> Result<(), ProviderError> {
        if self.all_failing {
            Err(self.err(ErrorKind::ServerError))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn slug(&self) -> &str {
        &self.vendor.name
    }

    fn vendor(&self) -> &Vendor {
        &self.vendor
    }

    async fn list_countries(&self) -> Result<Vec<CatalogCountry>, ProviderError> {
        self.record("list_countries");
        self.fail_if_scripted()?;
        Ok(self.countries.clone())
    }

    async fn list_services(
        &self,
        country: Option<&str>,
    ) -> Result<Vec<CatalogService>, ProviderError> {
        self.record(format!("list_services:{}", country.unwrap_or("")));
        self.fail_if_scripted()?;
        Ok(self.services.clone())
    }

    async fn list_prices(&self, country: Option<&str>) -> Result<Vec<PriceEntry>, ProviderError> {
        self.record(format!("list_prices:{}", country.unwrap_or("")));
        self.fail_if_scripted()?;
        match country {
            Some(country) => Ok(self
                .prices
                .iter()
                .filter(|p| p.country == country)
                .cloned()
                .collect()),
            None => Ok(self.prices.clone()),
        }
    }

    async fn buy(
        &self,
        country: &str,
        service: &str,
        _opts: &BuyOptions,
    ) -> Result<VendorPurchase, ProviderError> {
        self.record(format!("buy:{}:{}", country, service));
        self.fail_if_scripted()?;
        match &self.buy_result {
            Some(Ok(purchase)) => Ok(purchase.clone()),
            Some(Err(kind)) => Err(self.err(*kind)),
            None => Err(self.err(ErrorKind::NoStock)),
        }
    }

    async fn status(&self, activation_id: &str) -> Result<ActivationStatus, ProviderError> {
        self.record(format!("status:{}", activation_id));
        self.fail_if_scripted()?;
        self.status_result
            .clone()
            .ok_or_else(|| self.err(ErrorKind::BadRequest))
    }

    async fn cancel(&self, activation_id: &str) -> Result<(), ProviderError> {
        self.record(format!("cancel:{}", activation_id));
        self.fail_if_scripted()
    }

    async fn resend(&self, activation_id: &str) -> Result<(), ProviderError> {
        self.record(format!("resend:{}", activation_id));
        self.fail_if_scripted()
    }

    async fn complete(&self, activation_id: &str) -> Result<(), ProviderError> {
        self.record(format!("complete:{}", activation_id));
        self.fail_if_scripted()
    }

    async fn balance(&self) -> Result<f64, ProviderError> {
        self.record("balance");
        self.fail_if_scripted()?;
        self.balance.ok_or_else(|| self.err(ErrorKind::ServerError))
    }
}
