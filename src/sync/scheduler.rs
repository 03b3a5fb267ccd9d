//! Periodic sync orchestration.
//!
//! One trigger every 12 hours (configurable), vendors fanned out to isolated
//! workers in parallel. Shutdown cancels the pending wait but lets in-flight
//! workers finish their run.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures_util::future::join_all;
use tracing::{info, warn};

use crate::contracts::RateSource;
use crate::index::SearchIndex;
use crate::models::{Offer, ServiceAggregate};
use crate::storage::Storage;

use super::icons::IconReconciler;
use super::synchronizer::Synchronizer;
use super::worker::{await_report, spawn_worker, WorkerReport, WorkerStatus};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub interval: Duration,
    pub run_on_start: bool,
    /// `SYNC_PROVIDER`: restrict scheduled syncs to one vendor slug.
    pub vendor_filter: Option<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(12 * 3600),
            run_on_start: false,
            vendor_filter: None,
        }
    }
}

pub struct Scheduler {
    sync: Arc<Synchronizer>,
    storage: Arc<Storage>,
    index: Arc<dyn SearchIndex>,
    rates: Arc<dyn RateSource>,
    icons: Arc<IconReconciler>,
    config: SchedulerConfig,
    shutdown: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(
        sync: Arc<Synchronizer>,
        storage: Arc<Storage>,
        index: Arc<dyn SearchIndex>,
        rates: Arc<dyn RateSource>,
        icons: Arc<IconReconciler>,
        config: SchedulerConfig,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            sync,
            storage,
            index,
            rates,
            icons,
            config,
            shutdown,
        }
    }

    pub async fn run(&self) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            run_on_start = self.config.run_on_start,
            "sync scheduler started"
        );
        if self.config.run_on_start {
            self.full_sync().await;
        }
        loop {
            let mut waited = Duration::ZERO;
            while waited < self.config.interval {
                if self.shutdown.load(Ordering::Relaxed) {
                    info!("sync scheduler stopping");
                    return;
                }
                let step = Duration::from_secs(1).min(self.config.interval - waited);
                tokio::time::sleep(step).await;
                waited += step;
            }
            if self.shutdown.load(Ordering::Relaxed) {
                info!("sync scheduler stopping");
                return;
            }
            self.full_sync().await;
        }
    }

    /// Sync every (filtered) active vendor in parallel isolated workers, then
    /// refresh aggregates and reconcile icons.
    pub async fn full_sync(&self) -> Vec<WorkerReport> {
        // Rates are refreshed up front so every worker prices against the
        // same snapshot epoch.
        match self.rates.exchange_rates().await {
            Ok(rates) => info!(currencies = rates.len(), "exchange rates refreshed"),
            Err(e) => warn!("exchange rate refresh failed: {}", e),
        }

        let vendors = match self.storage.active_vendors() {
            Ok(vendors) => vendors,
            Err(e) => {
                warn!("cannot list vendors for sync: {}", e);
                return vec![];
            }
        };
        let slugs: Vec<String> = vendors
            .into_iter()
            .map(|v| v.name)
            .filter(|slug| {
                self.config
                    .vendor_filter
                    .as_ref()
                    .map(|f| f == slug)
                    .unwrap_or(true)
            })
            .collect();
        if slugs.is_empty() {
            info!("no vendors to sync");
            return vec![];
        }
        info!(vendors = slugs.len(), "full sync starting");

        let receivers: Vec<(String, std::sync::mpsc::Receiver<WorkerReport>)> = slugs
            .iter()
            .map(|slug| (slug.clone(), spawn_worker(self.sync.clone(), slug.clone())))
            .collect();

        let reports: Vec<WorkerReport> = join_all(receivers.into_iter().map(|(slug, rx)| {
            tokio::task::spawn_blocking(move || await_report(&slug, &rx))
        }))
        .await
        .into_iter()
        .map(|joined| match joined {
            Ok(report) => report,
            Err(e) => WorkerReport {
                vendor: "?".to_string(),
                status: WorkerStatus::Panicked,
                summary: None,
                error: Some(e.to_string()),
            },
        })
        .collect();

        let failed = reports
            .iter()
            .filter(|r| r.status != WorkerStatus::Success)
            .count();
        info!(
            total = reports.len(),
            failed, "full sync finished, refreshing aggregates"
        );

        if let Err(e) = self.refresh_aggregates().await {
            warn!("aggregate refresh failed: {}", e);
        }
        self.reconcile_icons().await;

        reports
    }

    async fn refresh_aggregates(&self) -> Result<()> {
        let offers = self.index.all_offers().await?;
        let aggregates = compute_service_aggregates(&offers);
        self.storage.replace_service_aggregates(&aggregates)?;
        info!(services = aggregates.len(), "service aggregates refreshed");
        Ok(())
    }

    async fn reconcile_icons(&self) {
        let vendors = match self.storage.list_vendors() {
            Ok(vendors) => vendors,
            Err(e) => {
                warn!("cannot list vendors for icon pass: {}", e);
                return;
            }
        };
        let mut seen = HashSet::new();
        let mut items = Vec::new();
        for vendor in vendors {
            let services = match self.storage.provider_services(vendor.id) {
                Ok(services) => services,
                Err(e) => {
                    warn!(vendor = %vendor.name, "cannot list services for icons: {}", e);
                    continue;
                }
            };
            for service in services {
                if seen.insert(service.code.clone()) {
                    let remote = service
                        .icon_url
                        .filter(|u| u.starts_with("http"));
                    items.push((service.code, remote));
                }
            }
        }
        self.icons.reconcile(&items).await;
    }
}

/// Per-service rollup across all vendors' active offers.
pub fn compute_service_aggregates(offers: &[Offer]) -> Vec<ServiceAggregate> {
    struct Acc {
        code: String,
        name: String,
        vendors: HashSet<String>,
        min_price: f64,
        total_stock: i64,
    }

    let mut by_service: HashMap<i64, Acc> = HashMap::new();
    for offer in offers.iter().filter(|o| o.is_active && o.stock > 0) {
        let acc = by_service.entry(offer.service_id).or_insert_with(|| Acc {
            code: offer.provider_service_code.clone(),
            name: offer.service_name.clone(),
            vendors: HashSet::new(),
            min_price: f64::MAX,
            total_stock: 0,
        });
        acc.vendors.insert(offer.vendor.clone());
        acc.min_price = acc.min_price.min(offer.price);
        acc.total_stock += offer.stock;
    }

    let mut aggregates: Vec<ServiceAggregate> = by_service
        .into_iter()
        .map(|(service_id, acc)| ServiceAggregate {
            service_id,
            code: acc.code,
            name: acc.name,
            provider_count: acc.vendors.len() as i64,
            min_price: acc.min_price,
            total_stock: acc.total_stock,
        })
        .collect();
    aggregates.sort_by(|a, b| a.code.cmp(&b.code));
    aggregates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::offer_fixture;

    #[test]
    fn aggregates_roll_up_across_vendors() {
        let mut offers = vec![
            offer_fixture("a", "us", "whatsapp", 1.5),
            offer_fixture("b", "us", "whatsapp", 1.2),
            offer_fixture("a", "ru", "whatsapp", 0.9),
            offer_fixture("a", "us", "telegram", 2.0),
        ];
        offers[0].stock = 5;
        offers[1].stock = 3;
        offers[2].stock = 7;
        offers[3].stock = 1;
        // Same service id for whatsapp rows, distinct for telegram.
        offers[0].service_id = 1;
        offers[1].service_id = 1;
        offers[2].service_id = 1;
        offers[3].service_id = 2;

        let aggregates = compute_service_aggregates(&offers);
        assert_eq!(aggregates.len(), 2);
        let whatsapp = aggregates.iter().find(|a| a.service_id == 1).unwrap();
        assert_eq!(whatsapp.provider_count, 2);
        assert_eq!(whatsapp.min_price, 0.9);
        assert_eq!(whatsapp.total_stock, 15);
    }

    #[test]
    fn aggregates_ignore_inactive_and_empty_offers() {
        let mut hidden = offer_fixture("a", "us", "whatsapp", 1.0);
        hidden.is_active = false;
        let mut empty = offer_fixture("b", "us", "whatsapp", 1.0);
        empty.stock = 0;
        assert!(compute_service_aggregates(&[hidden, empty]).is_empty());
    }
}
