//! Smart router: pick a vendor per purchase, fail over on retryable errors,
//! dispatch post-purchase calls by activation-id prefix.
//!
//! The router reads the offer index and the health monitor; it never writes
//! the index. Purchases against one vendor are sequential by design, which
//! keeps health writes per vendor single-writer.

pub mod activation;
pub mod score;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant as TokioInstant;
use tracing::{debug, info, warn};

use crate::health::{HealthMonitor, ProviderHealth};
use crate::index::SearchIndex;
use crate::models::{ActivationState, ActivationStatus, BuyOptions, Offer, Purchase, Vendor};
use crate::providers::{Provider, ProviderError};
use crate::storage::{KvStore, Storage};

pub use activation::{format_activation_id, parse_activation_id};
pub use score::{sort_ranked, vendor_score, ScoreInputs};

const ACTIVE_VENDORS_KEY: &str = "router:vendors:active";

/// Builds a provider for a vendor row. Injected so tests can script vendors.
pub type ProviderFactory =
    Arc<dyn Fn(&Vendor) -> anyhow::Result<Arc<dyn Provider>> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub active_cache_ttl: Duration,
    pub quote_cache_ttl: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            active_cache_ttl: Duration::from_secs(30),
            quote_cache_ttl: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("no eligible providers for {country}/{service}")]
    NoProviders { country: String, service: String },
    /// Every attempted vendor reported NO_STOCK; distinct from a failure.
    #[error("no stock at any provider for {country}/{service}")]
    NoStock { country: String, service: String },
    #[error("all providers failed (attempted: {})", attempted.join(", "))]
    AllFailed { attempted: Vec<String> },
    #[error("unknown vendor {0}")]
    UnknownVendor(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Infra(#[from] anyhow::Error),
}

/// Public quote projection. Deliberately free of admin economics: no weight,
/// no multiplier.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicQuote {
    pub provider: String,
    pub rank: u32,
    pub reliability: String,
    pub estimated_latency_ms: u64,
    pub stock: i64,
    pub price: f64,
}

struct Candidate {
    vendor: Vendor,
    health: ProviderHealth,
    offer: Option<Offer>,
    score: f64,
}

pub struct SmartRouter {
    storage: Arc<Storage>,
    kv: Arc<dyn KvStore>,
    health: Arc<HealthMonitor>,
    index: Arc<dyn SearchIndex>,
    factory: ProviderFactory,
    config: RouterConfig,
    /// In-process fallback used when both kv and DB reads fail.
    active_fallback: ArcSwapOption<Vec<Vendor>>,
    quote_cache: RwLock<HashMap<(String, String), (Instant, Vec<PublicQuote>)>>,
}

impl SmartRouter {
    pub fn new(
        storage: Arc<Storage>,
        kv: Arc<dyn KvStore>,
        health: Arc<HealthMonitor>,
        index: Arc<dyn SearchIndex>,
        factory: ProviderFactory,
        config: RouterConfig,
    ) -> Self {
        Self {
            storage,
            kv,
            health,
            index,
            factory,
            config,
            active_fallback: ArcSwapOption::empty(),
            quote_cache: RwLock::new(HashMap::new()),
        }
    }

    /// Active vendors ordered by priority. Read-through: kv (30 s TTL), then
    /// DB; a DB failure serves the stale in-process copy.
    pub fn active_vendors(&self) -> Result<Vec<Vendor>, RouterError> {
        if let Ok(Some(raw)) = self.kv.get(ACTIVE_VENDORS_KEY) {
            if let Ok(vendors) = serde_json::from_str::<Vec<Vendor>>(&raw) {
                return Ok(vendors);
            }
        }
        match self.storage.active_vendors() {
            Ok(vendors) => {
                if let Ok(raw) = serde_json::to_string(&vendors) {
                    let _ = self
                        .kv
                        .set(ACTIVE_VENDORS_KEY, &raw, Some(self.config.active_cache_ttl));
                }
                self.active_fallback.store(Some(Arc::new(vendors.clone())));
                Ok(vendors)
            }
            Err(e) => match self.active_fallback.load_full() {
                Some(stale) => {
                    warn!("active-vendor DB read failed, serving stale cache: {}", e);
                    Ok(stale.as_ref().clone())
                }
                None => Err(RouterError::Infra(e)),
            },
        }
    }

    /// Bust caches after admin mutations.
    pub fn invalidate_vendor_cache(&self) {
        let _ = self.kv.delete(ACTIVE_VENDORS_KEY);
        self.active_fallback.store(None);
        self.quote_cache.write().clear();
    }

    fn provider_for(&self, vendor: &Vendor) -> Result<Arc<dyn Provider>, RouterError> {
        (self.factory)(vendor).map_err(RouterError::Infra)
    }

    /// Lowest-priced offer per vendor for the requested pair.
    async fn offers_by_vendor(
        &self,
        country: &str,
        service: &str,
    ) -> HashMap<String, Offer> {
        let offers = match self.index.query(country, service).await {
            Ok(offers) => offers,
            Err(e) => {
                warn!("offer index query failed, ranking without offers: {}", e);
                return HashMap::new();
            }
        };
        let mut best: HashMap<String, Offer> = HashMap::new();
        for offer in offers {
            match best.get(&offer.vendor) {
                Some(current) if current.price <= offer.price => {}
                _ => {
                    best.insert(offer.vendor.clone(), offer);
                }
            }
        }
        best
    }

    /// Eligible vendors for one purchase, scored and deterministically
    /// ordered. Open circuits never make the list.
    async fn rank_candidates(
        &self,
        country: &str,
        service: &str,
    ) -> Result<Vec<Candidate>, RouterError> {
        let vendors = self.active_vendors()?;
        let offers = self.offers_by_vendor(country, service).await;

        let mut candidates = Vec::with_capacity(vendors.len());
        for vendor in vendors {
            if !self.health.is_available(&vendor.name) {
                debug!(vendor = %vendor.name, "skipping: circuit open");
                continue;
            }
            let health = self.health.provider_health(&vendor.name, Some(country));
            let offer = offers.get(&vendor.name).cloned();
            let inputs = ScoreInputs::from_parts(&vendor, &health, offer.as_ref());
            let score = vendor_score(&inputs);
            candidates.push(Candidate {
                vendor,
                health,
                offer,
                score,
            });
        }
        sort_ranked(&mut candidates, |c| {
            (c.score, c.vendor.priority, c.vendor.name.clone())
        });
        Ok(candidates)
    }

    async fn attempt_buy(
        &self,
        vendor: &Vendor,
        country: &str,
        service: &str,
        opts: &BuyOptions,
        offer: Option<&Offer>,
    ) -> Result<Purchase, ProviderError> {
        let provider = self.provider_for(vendor).map_err(|e| {
            ProviderError::new(
                crate::providers::ErrorKind::Unknown,
                &vendor.name,
                e.to_string(),
            )
        })?;
        let started = TokioInstant::now();
        let result = provider.buy(country, service, opts).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(_) => {
                self.health
                    .record_outcome(&vendor.name, Some(country), true, latency_ms, None);
            }
            Err(e) => {
                self.health.record_outcome(
                    &vendor.name,
                    Some(country),
                    false,
                    latency_ms,
                    Some(e.kind),
                );
            }
        }

        result.map(|purchase| Purchase {
            activation_id: format_activation_id(&vendor.name, &purchase.id),
            phone_number: purchase.phone,
            sell_price: offer.map(|o| o.price).unwrap_or(0.0),
            vendor: vendor.name.clone(),
        })
    }

    /// Purchase entry point. A pinned vendor gets exactly one attempt; an
    /// open purchase walks the scored order until success or exhaustion.
    pub async fn buy(
        &self,
        country: &str,
        service: &str,
        opts: &BuyOptions,
    ) -> Result<Purchase, RouterError> {
        if let Some(pinned) = &opts.vendor {
            let vendors = self.active_vendors()?;
            let vendor = vendors
                .into_iter()
                .find(|v| &v.name == pinned)
                .ok_or_else(|| RouterError::UnknownVendor(pinned.clone()))?;
            let offers = self.offers_by_vendor(country, service).await;
            return self
                .attempt_buy(&vendor, country, service, opts, offers.get(pinned))
                .await
                .map_err(RouterError::Provider);
        }

        let candidates = self.rank_candidates(country, service).await?;
        if candidates.is_empty() {
            return Err(RouterError::NoProviders {
                country: country.to_string(),
                service: service.to_string(),
            });
        }

        let mut attempted = Vec::new();
        let mut all_no_stock = true;
        for candidate in &candidates {
            attempted.push(candidate.vendor.name.clone());
            match self
                .attempt_buy(
                    &candidate.vendor,
                    country,
                    service,
                    opts,
                    candidate.offer.as_ref(),
                )
                .await
            {
                Ok(purchase) => {
                    info!(
                        vendor = %candidate.vendor.name,
                        activation = %purchase.activation_id,
                        "purchase routed after {} attempt(s)",
                        attempted.len()
                    );
                    return Ok(purchase);
                }
                Err(e) => {
                    debug!(vendor = %candidate.vendor.name, "attempt failed: {}", e);
                    if e.kind != crate::providers::ErrorKind::NoStock {
                        all_no_stock = false;
                    }
                    // Unpinned purchases advance past permanent errors too;
                    // the vendor itself is done either way.
                }
            }
        }

        if all_no_stock {
            Err(RouterError::NoStock {
                country: country.to_string(),
                service: service.to_string(),
            })
        } else {
            Err(RouterError::AllFailed { attempted })
        }
    }

    /// Ranked public quotes from the offer index. Never calls vendors.
    pub async fn get_ranked_providers(
        &self,
        country: &str,
        service: &str,
    ) -> Result<Vec<PublicQuote>, RouterError> {
        let cache_key = (country.to_string(), service.to_string());
        if let Some((at, quotes)) = self.quote_cache.read().get(&cache_key) {
            if at.elapsed() < self.config.quote_cache_ttl {
                return Ok(quotes.clone());
            }
        }

        let candidates = self.rank_candidates(country, service).await?;
        let quotes: Vec<PublicQuote> = candidates
            .iter()
            .filter_map(|c| {
                let offer = c.offer.as_ref()?;
                if offer.stock <= 0 {
                    return None;
                }
                Some((c, offer))
            })
            .enumerate()
            .map(|(i, (c, offer))| {
                let reliability = if c.health.success_rate_or_optimistic() > 0.8 {
                    "High"
                } else {
                    "Medium"
                };
                PublicQuote {
                    provider: c.vendor.display_name.clone(),
                    rank: (i + 1) as u32,
                    reliability: reliability.to_string(),
                    estimated_latency_ms: c
                        .health
                        .avg_delivery_ms
                        .unwrap_or(2000.0)
                        .round() as u64,
                    stock: offer.stock,
                    price: offer.price,
                }
            })
            .collect();

        self.quote_cache
            .write()
            .insert(cache_key, (Instant::now(), quotes.clone()));
        Ok(quotes)
    }

    async fn dispatch_vendor(&self, slug: &str) -> Result<Arc<dyn Provider>, RouterError> {
        let vendors = self.active_vendors()?;
        let vendor = vendors
            .into_iter()
            .find(|v| v.name == slug)
            .ok_or_else(|| RouterError::UnknownVendor(slug.to_string()))?;
        self.provider_for(&vendor)
    }

    /// Poll an activation. Dispatches by prefix; a missing prefix probes all
    /// active vendors in priority order (robust but slow).
    pub async fn status(&self, activation_id: &str) -> Result<ActivationStatus, RouterError> {
        match parse_activation_id(activation_id) {
            Some((slug, raw_id)) => {
                let provider = self.dispatch_vendor(slug).await?;
                let status = provider.status(raw_id).await.map_err(RouterError::Provider)?;
                if status.state == ActivationState::SmsReceived && !status.sms.is_empty() {
                    self.health.record_sms_count(slug, status.sms.len() as u32);
                }
                Ok(status)
            }
            None => {
                for vendor in self.active_vendors()? {
                    let provider = match self.provider_for(&vendor) {
                        Ok(p) => p,
                        Err(_) => continue,
                    };
                    if let Ok(status) = provider.status(activation_id).await {
                        return Ok(status);
                    }
                }
                Err(RouterError::AllFailed { attempted: vec![] })
            }
        }
    }

    pub async fn cancel(&self, activation_id: &str) -> Result<(), RouterError> {
        self.lifecycle_op(activation_id, |p, id| Box::pin(async move { p.cancel(&id).await }))
            .await
    }

    pub async fn resend(&self, activation_id: &str) -> Result<(), RouterError> {
        self.lifecycle_op(activation_id, |p, id| Box::pin(async move { p.resend(&id).await }))
            .await
    }

    pub async fn complete(&self, activation_id: &str) -> Result<(), RouterError> {
        self.lifecycle_op(activation_id, |p, id| Box::pin(async move { p.complete(&id).await }))
            .await
    }

    async fn lifecycle_op<F>(&self, activation_id: &str, op: F) -> Result<(), RouterError>
    where
        F: Fn(
            Arc<dyn Provider>,
            String,
        ) -> std::pin::Pin<
            Box<dyn std::future::Future<Output = Result<(), ProviderError>> + Send>,
        >,
    {
        match parse_activation_id(activation_id) {
            Some((slug, raw_id)) => {
                let provider = self.dispatch_vendor(slug).await?;
                op(provider, raw_id.to_string())
                    .await
                    .map_err(RouterError::Provider)
            }
            None => {
                for vendor in self.active_vendors()? {
                    let provider = match self.provider_for(&vendor) {
                        Ok(p) => p,
                        Err(_) => continue,
                    };
                    if op(provider, activation_id.to_string()).await.is_ok() {
                        return Ok(());
                    }
                }
                Err(RouterError::AllFailed { attempted: vec![] })
            }
        }
    }

    /// Sum of vendor balances; a failing vendor contributes 0.
    pub async fn total_balance(&self) -> Result<f64, RouterError> {
        let mut total = 0.0;
        for vendor in self.active_vendors()? {
            let provider = match self.provider_for(&vendor) {
                Ok(p) => p,
                Err(_) => continue,
            };
            match provider.balance().await {
                Ok(balance) => total += balance,
                Err(e) => warn!(vendor = %vendor.name, "balance check failed: {}", e),
            }
        }
        Ok(total)
    }
}
