//! Per-vendor catalog sync.
//!
//! The run order is strict: metadata upsert, offer construction, index
//! delete-then-add, status flip. The index swap is the last step, so a
//! failure anywhere earlier leaves the previous offers live.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use futures_util::{stream, StreamExt};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::contracts::{AuditLog, RateSource, SettingsSource};
use crate::index::SearchIndex;
use crate::models::{
    Offer, PriceEntry, ProviderCountry, ProviderService, SyncStatus, Vendor,
};
use crate::providers::pricing::compute_sell_price;
use crate::providers::Provider;
use crate::registry::{is_placeholder_name, CanonicalRegistry};
use crate::router::ProviderFactory;
use crate::storage::{KvStore, Storage};

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Stored metadata younger than this is reused instead of re-fetched.
    pub metadata_ttl: Duration,
    /// Max in-flight price requests during per-country fan-out.
    pub price_fanout_concurrency: usize,
    /// Per-minute cap across the fan-out.
    pub price_requests_per_minute: u32,
    /// Offers per index batch.
    pub index_chunk_size: usize,
    /// Per-vendor sync lock TTL; bounds how long a crashed run can block.
    pub lock_ttl: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            metadata_ttl: Duration::from_secs(24 * 3600),
            price_fanout_concurrency: 50,
            price_requests_per_minute: 180,
            index_chunk_size: 5000,
            lock_ttl: Duration::from_secs(15 * 60),
        }
    }
}

/// Result of one vendor run, also the on-demand endpoint's response body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    pub vendor: String,
    pub countries: usize,
    pub services: usize,
    pub prices: usize,
    pub duration_ms: u64,
    /// Metadata rows actually written; 0 means "no changes detected".
    pub metadata_writes: usize,
    pub price_errors: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct Synchronizer {
    storage: Arc<Storage>,
    registry: Arc<CanonicalRegistry>,
    index: Arc<dyn SearchIndex>,
    kv: Arc<dyn KvStore>,
    rates: Arc<dyn RateSource>,
    settings: Arc<dyn SettingsSource>,
    audit: Arc<dyn AuditLog>,
    factory: ProviderFactory,
    config: SyncConfig,
    shutdown: Arc<AtomicBool>,
}

impl Synchronizer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: Arc<Storage>,
        registry: Arc<CanonicalRegistry>,
        index: Arc<dyn SearchIndex>,
        kv: Arc<dyn KvStore>,
        rates: Arc<dyn RateSource>,
        settings: Arc<dyn SettingsSource>,
        audit: Arc<dyn AuditLog>,
        factory: ProviderFactory,
        config: SyncConfig,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            storage,
            registry,
            index,
            kv,
            rates,
            settings,
            audit,
            factory,
            config,
            shutdown,
        }
    }

    fn canceled(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Sync one vendor end to end. Serialized per vendor through a kv lock;
    /// a concurrent caller gets an error instead of interleaved writes.
    pub async fn sync_vendor(&self, slug: &str) -> Result<SyncSummary> {
        let lock_key = format!("sync:lock:{}", slug);
        if !self.kv.try_lock(&lock_key, self.config.lock_ttl)? {
            bail!("sync already running for {}", slug);
        }

        let started = Instant::now();
        let result = self.sync_vendor_inner(slug, started).await;
        let _ = self.kv.unlock(&lock_key);

        match result {
            Ok(summary) => {
                self.storage.finish_sync(slug, SyncStatus::Success)?;
                self.audit.log(
                    "provider.sync.success",
                    serde_json::json!({
                        "vendor": slug,
                        "offers": summary.prices,
                        "durationMs": summary.duration_ms,
                    }),
                );
                Ok(summary)
            }
            Err(e) => {
                // The previous catalog and offers stay live; only the status
                // flips.
                if let Err(db_err) = self.storage.finish_sync(slug, SyncStatus::Failed) {
                    warn!(vendor = slug, "failed recording sync failure: {}", db_err);
                }
                self.audit.log(
                    "provider.sync.failed",
                    serde_json::json!({ "vendor": slug, "error": e.to_string() }),
                );
                Err(e)
            }
        }
    }

    async fn sync_vendor_inner(&self, slug: &str, started: Instant) -> Result<SyncSummary> {
        let vendor = self
            .storage
            .vendor_by_slug(slug)?
            .ok_or_else(|| anyhow!("vendor {} not found", slug))?;
        self.storage.set_sync_status(slug, SyncStatus::Syncing)?;

        let provider = (self.factory)(&vendor).context("building provider")?;

        // Balance is best-effort; a failure is logged, never fatal.
        match provider.balance().await {
            Ok(balance) => {
                self.storage.set_balance(slug, balance)?;
                debug!(vendor = slug, balance, "balance refreshed");
            }
            Err(e) => warn!(vendor = slug, "balance fetch failed: {}", e),
        }

        let mut metadata_writes = 0usize;
        let (countries, services) =
            match self.metadata_step(&vendor, provider.as_ref(), &mut metadata_writes).await? {
                Some(rows) => rows,
                None => bail!("sync canceled for {}", slug),
            };

        if self.canceled() {
            bail!("sync canceled for {}", slug);
        }

        let rates = self.rates.exchange_rates().await.context("fetching rates")?;
        let points_rate = self.settings.points_rate().await;

        let (prices, price_errors) = self
            .price_step(&vendor, provider.as_ref(), &countries)
            .await?;

        let offers = self.build_offers(&vendor, &countries, &services, &prices, &rates, points_rate);

        // Cancellation must abort before the delete step so the index is
        // never left empty.
        if self.canceled() {
            bail!("sync canceled for {}", slug);
        }

        self.index
            .delete_by_vendor(slug)
            .await
            .context("sweeping vendor offers")?;
        for chunk in offers.chunks(self.config.index_chunk_size) {
            self.index
                .upsert_offers(chunk)
                .await
                .context("publishing offer batch")?;
        }

        info!(
            vendor = slug,
            countries = countries.len(),
            services = services.len(),
            offers = offers.len(),
            metadata_writes,
            "sync complete"
        );

        Ok(SyncSummary {
            vendor: slug.to_string(),
            countries: countries.len(),
            services: services.len(),
            prices: offers.len(),
            duration_ms: started.elapsed().as_millis() as u64,
            metadata_writes,
            price_errors,
            error: None,
        })
    }

    /// Metadata freshness rule: reuse the stored catalog when it is younger
    /// than 24 h, non-empty and free of placeholder names; otherwise re-fetch
    /// countries and services from the vendor.
    async fn metadata_step(
        &self,
        vendor: &Vendor,
        provider: &dyn Provider,
        metadata_writes: &mut usize,
    ) -> Result<Option<(Vec<ProviderCountry>, Vec<ProviderService>)>> {
        let stored_countries = self.storage.provider_countries(vendor.id)?;
        let stored_services = self.storage.provider_services(vendor.id)?;

        let fresh = !stored_countries.is_empty()
            && vendor
                .last_metadata_sync_at
                .map(|at| {
                    Utc::now().signed_duration_since(at).to_std().unwrap_or_default()
                        < self.config.metadata_ttl
                })
                .unwrap_or(false)
            && !stored_countries
                .iter()
                .any(|c| is_placeholder_name(&c.name, &c.external_id))
            && !stored_services
                .iter()
                .any(|s| is_placeholder_name(&s.name, &s.external_id));

        if fresh {
            debug!(vendor = %vendor.name, "metadata fresh, reusing stored catalog");
            return Ok(Some((stored_countries, stored_services)));
        }

        if self.canceled() {
            return Ok(None);
        }

        let incoming_countries = provider
            .list_countries()
            .await
            .context("fetching countries")?;
        let incoming_services = provider
            .list_services(None)
            .await
            .context("fetching services")?;

        // An empty list is a legal vendor response and leaves stored rows
        // untouched.
        if !incoming_countries.is_empty() {
            let mut keep = Vec::with_capacity(incoming_countries.len());
            for country in &incoming_countries {
                let row = ProviderCountry {
                    vendor_id: vendor.id,
                    external_id: country.external_id.clone(),
                    code: country.code.clone(),
                    name: country.name.clone(),
                    flag_url: country.flag_url.clone(),
                    is_active: true,
                    last_sync_at: None,
                };
                if self.storage.upsert_provider_country(&row)? {
                    *metadata_writes += 1;
                }
                keep.push(country.external_id.clone());
            }
            self.storage.deactivate_countries_except(vendor.id, &keep)?;
        }

        if !incoming_services.is_empty() {
            let mut keep = Vec::with_capacity(incoming_services.len());
            for service in &incoming_services {
                let row = ProviderService {
                    vendor_id: vendor.id,
                    external_id: service.external_id.clone(),
                    code: service.code.clone(),
                    name: service.name.clone(),
                    icon_url: service.icon_url.clone(),
                    is_active: true,
                    last_sync_at: None,
                };
                if self.storage.upsert_provider_service(&row)? {
                    *metadata_writes += 1;
                }
                keep.push(service.external_id.clone());
            }
            self.storage.deactivate_services_except(vendor.id, &keep)?;
        }

        self.storage.touch_metadata_sync(&vendor.name)?;
        Ok(Some((
            self.storage.provider_countries(vendor.id)?,
            self.storage.provider_services(vendor.id)?,
        )))
    }

    /// One global price call, or a rate-limited fan-out across countries.
    async fn price_step(
        &self,
        vendor: &Vendor,
        provider: &dyn Provider,
        countries: &[ProviderCountry],
    ) -> Result<(Vec<PriceEntry>, usize)> {
        if vendor.use_global_sync {
            let prices = provider
                .list_prices(None)
                .await
                .context("fetching global prices")?;
            return Ok((prices, 0));
        }

        let interval_ms = 60_000 / self.config.price_requests_per_minute.max(1) as u64;
        let targets: Vec<ProviderCountry> = countries
            .iter()
            .filter(|c| c.is_active)
            .cloned()
            .collect();

        let results: Vec<Result<Vec<PriceEntry>, String>> = stream::iter(
            targets.into_iter().enumerate().map(|(i, country)| async move {
                // Spread requests so the fan-out stays under the per-minute
                // cap regardless of concurrency.
                tokio::time::sleep(Duration::from_millis(interval_ms * i as u64)).await;
                provider
                    .list_prices(Some(&country.external_id))
                    .await
                    .map_err(|e| format!("{}: {}", country.external_id, e))
            }),
        )
        .buffer_unordered(self.config.price_fanout_concurrency)
        .collect()
        .await;

        let mut prices = Vec::new();
        let mut errors = 0usize;
        for result in results {
            match result {
                Ok(entries) => prices.extend(entries),
                Err(e) => {
                    errors += 1;
                    warn!(vendor = %vendor.name, "price fetch failed: {}", e);
                }
            }
        }
        Ok((prices, errors))
    }

    /// Join price rows against the stored catalog and emit offer documents.
    /// Rows that fail to resolve or to price are dropped and counted.
    fn build_offers(
        &self,
        vendor: &Vendor,
        countries: &[ProviderCountry],
        services: &[ProviderService],
        prices: &[PriceEntry],
        rates: &HashMap<String, f64>,
        points_rate: f64,
    ) -> Vec<Offer> {
        let by_country_ext: HashMap<&str, &ProviderCountry> = countries
            .iter()
            .map(|c| (c.external_id.as_str(), c))
            .collect();
        let by_country_code: HashMap<&str, &ProviderCountry> =
            countries.iter().map(|c| (c.code.as_str(), c)).collect();
        let by_service_ext: HashMap<&str, &ProviderService> = services
            .iter()
            .map(|s| (s.external_id.as_str(), s))
            .collect();
        let by_service_code: HashMap<&str, &ProviderService> =
            services.iter().map(|s| (s.code.as_str(), s)).collect();

        // Per-run monotonic internal operator ids.
        let mut operator_ids: HashMap<String, u32> = HashMap::new();
        let mut next_operator_id = 1u32;

        let now = Utc::now();
        let mut offers = Vec::with_capacity(prices.len());
        let mut dropped = 0usize;

        for entry in prices {
            if entry.count <= 0 {
                continue;
            }
            let Some(country) = by_country_ext
                .get(entry.country.as_str())
                .or_else(|| by_country_code.get(entry.country.as_str()))
            else {
                dropped += 1;
                continue;
            };
            let Some(service) = by_service_code
                .get(entry.service.as_str())
                .or_else(|| by_service_ext.get(entry.service.as_str()))
            else {
                dropped += 1;
                continue;
            };

            let (country_id, service_id) = match (
                self.registry.country_id(&country.code, &country.name),
                self.registry.service_id(&service.code, &service.name),
            ) {
                (Ok(c), Ok(s)) => (c, s),
                _ => {
                    dropped += 1;
                    continue;
                }
            };

            let price = match compute_sell_price(entry.raw_price, vendor, rates, points_rate) {
                Ok(price) => price,
                Err(e) => {
                    dropped += 1;
                    debug!(vendor = %vendor.name, "price computation failed: {}", e);
                    continue;
                }
            };

            let operator = entry
                .operator
                .clone()
                .filter(|o| !o.is_empty())
                .unwrap_or_else(|| "any".to_string());
            operator_ids.entry(operator.clone()).or_insert_with(|| {
                let id = next_operator_id;
                next_operator_id += 1;
                id
            });

            offers.push(Offer {
                id: Offer::doc_id(&vendor.name, &country.code, &service.code, &operator),
                vendor: vendor.name.clone(),
                provider_country_code: country.code.clone(),
                country_id,
                country_name: country.name.clone(),
                country_icon: country.flag_url.clone(),
                provider_service_code: service.code.clone(),
                service_id,
                service_name: service.name.clone(),
                service_icon: service.icon_url.clone(),
                operator,
                price: price.points,
                raw_price: price.raw,
                stock: entry.count,
                last_synced_at: now,
                is_active: country.is_active && service.is_active,
            });
        }

        if dropped > 0 {
            warn!(vendor = %vendor.name, dropped, "price rows dropped during offer construction");
        }
        debug!(
            vendor = %vendor.name,
            operators = operator_ids.len(),
            "assigned internal operator ids"
        );

        // Last writer wins on duplicate ids; the index upserts by primary
        // key anyway, this just keeps batch sizes honest.
        let mut seen = HashMap::new();
        for offer in offers {
            seen.insert(offer.id.clone(), offer);
        }
        let mut deduped: Vec<Offer> = seen.into_values().collect();
        deduped.sort_by(|a, b| a.id.cmp(&b.id));
        deduped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::{EnvSettings, FixedRateSource, StorageAudit};
    use crate::index::MemoryIndex;
    use crate::storage::MemoryKv;
    use crate::test_support::{vendor_fixture, ScriptedProvider};

    fn harness(
        provider: ScriptedProvider,
    ) -> (Arc<Synchronizer>, Arc<Storage>, Arc<MemoryIndex>, i64) {
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        let mut vendor = vendor_fixture("v1");
        vendor.use_global_sync = true;
        let vendor_id = storage.insert_vendor(&vendor).unwrap();

        let index = Arc::new(MemoryIndex::new());
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let registry = Arc::new(CanonicalRegistry::new(
            storage.clone(),
            std::path::PathBuf::from("/nonexistent"),
        ));
        let provider: Arc<dyn Provider> = Arc::new(provider);
        let factory: ProviderFactory = {
            let provider = provider.clone();
            Arc::new(move |_| Ok(provider.clone()))
        };
        let sync = Arc::new(Synchronizer::new(
            storage.clone(),
            registry,
            index.clone(),
            kv,
            Arc::new(FixedRateSource::new(HashMap::new())),
            Arc::new(EnvSettings::new(1.0)),
            Arc::new(StorageAudit::new(storage.clone())),
            factory,
            SyncConfig::default(),
            Arc::new(AtomicBool::new(false)),
        ));
        (sync, storage, index, vendor_id)
    }

    fn catalog_provider() -> ScriptedProvider {
        ScriptedProvider::new("v1")
            .with_countries(vec![("187", "United States"), ("0", "Russia")])
            .with_services(vec![("wa", "whatsapp"), ("tg", "telegram")])
            .with_prices(vec![
                ("us", "whatsapp", 1.2, 5),
                ("us", "telegram", 0.8, 3),
                ("ru", "whatsapp", 0.5, 0), // stock 0: dropped
            ])
            .with_balance(42.0)
    }

    #[tokio::test]
    async fn full_vendor_sync_publishes_offers() {
        let (sync, storage, index, vendor_id) = harness(catalog_provider());
        let summary = sync.sync_vendor("v1").await.unwrap();

        assert_eq!(summary.countries, 2);
        assert_eq!(summary.services, 2);
        assert_eq!(summary.prices, 2);
        assert!(summary.error.is_none());

        let offers = index.all_offers().await.unwrap();
        assert_eq!(offers.len(), 2);
        assert!(offers.iter().all(|o| o.stock > 0));
        assert!(offers.iter().all(|o| o.vendor == "v1"));
        assert!(offers.iter().all(|o| o.country_id > 0 && o.service_id > 0));

        let vendor = storage.vendor_by_slug("v1").unwrap().unwrap();
        assert_eq!(vendor.sync_status, SyncStatus::Success);
        assert_eq!(vendor.sync_count, 1);
        assert!(vendor.last_sync_at.is_some());
        assert_eq!(vendor.balance, Some(42.0));
        assert_eq!(storage.provider_countries(vendor_id).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn resync_with_identical_catalog_writes_nothing() {
        let (sync, _storage, index, _) = harness(catalog_provider());
        let first = sync.sync_vendor("v1").await.unwrap();
        assert!(first.metadata_writes > 0);
        let offers_before = index.all_offers().await.unwrap();

        // Metadata is fresh now, so the second run reuses the stored catalog
        // and reports zero writes; the offer set is replaced by id.
        let second = sync.sync_vendor("v1").await.unwrap();
        assert_eq!(second.metadata_writes, 0);
        let offers_after = index.all_offers().await.unwrap();

        let strip = |offers: &[Offer]| -> Vec<Offer> {
            offers
                .iter()
                .cloned()
                .map(|mut o| {
                    o.last_synced_at = chrono::DateTime::<Utc>::MIN_UTC;
                    o
                })
                .collect()
        };
        assert_eq!(strip(&offers_before), strip(&offers_after));
    }

    #[tokio::test]
    async fn failed_vendor_keeps_previous_offers() {
        let (sync, storage, index, _) = harness(catalog_provider());
        sync.sync_vendor("v1").await.unwrap();
        assert_eq!(index.len(), 2);

        // Second run against a vendor that now refuses everything.
        let broken: Arc<dyn Provider> = Arc::new(ScriptedProvider::new("v1").all_failing());
        let storage2 = storage.clone();
        let registry = Arc::new(CanonicalRegistry::new(
            storage2.clone(),
            std::path::PathBuf::from("/nonexistent"),
        ));
        let factory: ProviderFactory = Arc::new(move |_| Ok(broken.clone()));
        let sync2 = Synchronizer::new(
            storage2.clone(),
            registry,
            index.clone(),
            Arc::new(MemoryKv::new()),
            Arc::new(FixedRateSource::new(HashMap::new())),
            Arc::new(EnvSettings::new(1.0)),
            Arc::new(StorageAudit::new(storage2.clone())),
            factory,
            SyncConfig::default(),
            Arc::new(AtomicBool::new(false)),
        );

        let result = sync2.sync_vendor("v1").await;
        assert!(result.is_err());

        // Previous offers stay live; status reflects the failure.
        assert_eq!(index.len(), 2);
        let vendor = storage2.vendor_by_slug("v1").unwrap().unwrap();
        assert_eq!(vendor.sync_status, SyncStatus::Failed);
    }

    #[tokio::test]
    async fn empty_service_list_leaves_rows_and_sweeps_offers() {
        let (sync, storage, index, vendor_id) = harness(catalog_provider());
        sync.sync_vendor("v1").await.unwrap();
        assert_eq!(index.len(), 2);

        // Vendor now returns an empty catalog and no prices; a zero metadata
        // TTL forces the re-fetch that produces the empty lists.
        let empty: Arc<dyn Provider> =
            Arc::new(ScriptedProvider::new("v1").with_balance(1.0));
        let registry = Arc::new(CanonicalRegistry::new(
            storage.clone(),
            std::path::PathBuf::from("/nonexistent"),
        ));
        let factory: ProviderFactory = Arc::new(move |_| Ok(empty.clone()));
        let sync2 = Synchronizer::new(
            storage.clone(),
            registry,
            index.clone(),
            Arc::new(MemoryKv::new()),
            Arc::new(FixedRateSource::new(HashMap::new())),
            Arc::new(EnvSettings::new(1.0)),
            Arc::new(StorageAudit::new(storage.clone())),
            factory,
            SyncConfig {
                metadata_ttl: Duration::ZERO,
                ..SyncConfig::default()
            },
            Arc::new(AtomicBool::new(false)),
        );
        sync2.sync_vendor("v1").await.unwrap();

        assert_eq!(storage.provider_countries(vendor_id).unwrap().len(), 2);
        assert_eq!(index.len(), 0);
    }

    #[tokio::test]
    async fn concurrent_syncs_are_serialized_by_lock() {
        let (sync, _, _, _) = harness(catalog_provider());
        let key = "sync:lock:v1";
        // Simulate an in-flight run holding the lock.
        assert!(sync.kv.try_lock(key, Duration::from_secs(60)).unwrap());
        let err = sync.sync_vendor("v1").await.unwrap_err();
        assert!(err.to_string().contains("already running"));
        sync.kv.unlock(key).unwrap();
        assert!(sync.sync_vendor("v1").await.is_ok());
    }

    #[tokio::test]
    async fn shutdown_aborts_before_index_delete() {
        let (sync, _, index, _) = harness(catalog_provider());
        sync.sync_vendor("v1").await.unwrap();
        assert_eq!(index.len(), 2);

        sync.shutdown.store(true, Ordering::Relaxed);
        let result = sync.sync_vendor("v1").await;
        assert!(result.is_err());
        // Offers from the completed run survive the canceled one.
        assert_eq!(index.len(), 2);
    }
}
