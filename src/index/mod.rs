//! Search-index contract.
//!
//! The offer index is the authoritative source of prices shown to users. It
//! is written only by the synchronizer; the router reads it and never writes.
//! The HTTP implementation speaks a Meilisearch-style REST contract
//! (primary-key upsert, filter delete, index swap).

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::models::Offer;

pub const OFFER_INDEX: &str = "offers";

#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Primary-key upsert; replacing a document with the same id is atomic
    /// per offer.
    async fn upsert_offers(&self, offers: &[Offer]) -> Result<()>;
    async fn delete_by_vendor(&self, vendor: &str) -> Result<()>;
    /// Atomically promote a shadow index built aside.
    async fn swap_shadow(&self, name: &str) -> Result<()>;
    /// Active offers for one `(country, service)` pair.
    async fn query(&self, country_code: &str, service_code: &str) -> Result<Vec<Offer>>;
    /// Full export, used for aggregate refresh.
    async fn all_offers(&self) -> Result<Vec<Offer>>;
}

pub struct HttpSearchIndex {
    base_url: String,
    api_key: Option<String>,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct SearchHits {
    hits: Vec<Offer>,
}

#[derive(Debug, Deserialize)]
struct DocumentsPage {
    results: Vec<Offer>,
    total: u64,
}

impl HttpSearchIndex {
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("numbroker/1.0")
            .build()
            .context("building search index client")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        builder
    }

    async fn expect_ok(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("search index {} failed: {} {}", what, status, body);
        }
        Ok(response)
    }
}

#[async_trait]
impl SearchIndex for HttpSearchIndex {
    async fn upsert_offers(&self, offers: &[Offer]) -> Result<()> {
        if offers.is_empty() {
            return Ok(());
        }
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/indexes/{}/documents?primaryKey=id", OFFER_INDEX),
            )
            .json(offers)
            .send()
            .await
            .context("sending offer batch")?;
        Self::expect_ok(response, "upsert").await?;
        debug!("indexed {} offers", offers.len());
        Ok(())
    }

    async fn delete_by_vendor(&self, vendor: &str) -> Result<()> {
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/indexes/{}/documents/delete", OFFER_INDEX),
            )
            .json(&json!({ "filter": format!("vendor = '{}'", vendor) }))
            .send()
            .await
            .context("sending vendor delete")?;
        Self::expect_ok(response, "delete").await?;
        Ok(())
    }

    async fn swap_shadow(&self, name: &str) -> Result<()> {
        let response = self
            .request(reqwest::Method::POST, "/swap-indexes")
            .json(&json!([{ "indexes": [OFFER_INDEX, name] }]))
            .send()
            .await
            .context("sending index swap")?;
        Self::expect_ok(response, "swap").await?;
        Ok(())
    }

    async fn query(&self, country_code: &str, service_code: &str) -> Result<Vec<Offer>> {
        let filter = format!(
            "providerCountryCode = '{}' AND providerServiceCode = '{}' AND isActive = true",
            country_code, service_code
        );
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/indexes/{}/search", OFFER_INDEX),
            )
            .json(&json!({ "filter": filter, "limit": 1000 }))
            .send()
            .await
            .context("querying offers")?;
        let hits: SearchHits = Self::expect_ok(response, "query")
            .await?
            .json()
            .await
            .context("decoding offer hits")?;
        Ok(hits.hits)
    }

    async fn all_offers(&self) -> Result<Vec<Offer>> {
        let mut out = Vec::new();
        let mut offset = 0u64;
        loop {
            let response = self
                .request(
                    reqwest::Method::GET,
                    &format!(
                        "/indexes/{}/documents?limit=1000&offset={}",
                        OFFER_INDEX, offset
                    ),
                )
                .send()
                .await
                .context("exporting offers")?;
            let page: DocumentsPage = Self::expect_ok(response, "export")
                .await?
                .json()
                .await
                .context("decoding offer page")?;
            offset += page.results.len() as u64;
            let done = page.results.is_empty() || offset >= page.total;
            out.extend(page.results);
            if done {
                break;
            }
        }
        Ok(out)
    }
}

/// In-memory index for tests and local development.
#[derive(Default)]
pub struct MemoryIndex {
    docs: RwLock<HashMap<String, Offer>>,
    swaps: RwLock<Vec<String>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.docs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.read().is_empty()
    }

    pub fn swap_log(&self) -> Vec<String> {
        self.swaps.read().clone()
    }
}

#[async_trait]
impl SearchIndex for MemoryIndex {
    async fn upsert_offers(&self, offers: &[Offer]) -> Result<()> {
        let mut docs = self.docs.write();
        for offer in offers {
            docs.insert(offer.id.clone(), offer.clone());
        }
        Ok(())
    }

    async fn delete_by_vendor(&self, vendor: &str) -> Result<()> {
        self.docs.write().retain(|_, offer| offer.vendor != vendor);
        Ok(())
    }

    async fn swap_shadow(&self, name: &str) -> Result<()> {
        self.swaps.write().push(name.to_string());
        Ok(())
    }

    async fn query(&self, country_code: &str, service_code: &str) -> Result<Vec<Offer>> {
        let mut hits: Vec<Offer> = self
            .docs
            .read()
            .values()
            .filter(|offer| {
                offer.is_active
                    && offer.provider_country_code == country_code
                    && offer.provider_service_code == service_code
            })
            .cloned()
            .collect();
        hits.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(hits)
    }

    async fn all_offers(&self) -> Result<Vec<Offer>> {
        let mut offers: Vec<Offer> = self.docs.read().values().cloned().collect();
        offers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(offers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::offer_fixture;

    #[tokio::test]
    async fn memory_index_upsert_and_vendor_sweep() {
        let index = MemoryIndex::new();
        index
            .upsert_offers(&[
                offer_fixture("a", "us", "whatsapp", 1.0),
                offer_fixture("a", "us", "telegram", 2.0),
                offer_fixture("b", "us", "whatsapp", 3.0),
            ])
            .await
            .unwrap();
        assert_eq!(index.len(), 3);

        // Same id replaces, not duplicates.
        index
            .upsert_offers(&[offer_fixture("a", "us", "whatsapp", 9.0)])
            .await
            .unwrap();
        assert_eq!(index.len(), 3);

        index.delete_by_vendor("a").await.unwrap();
        assert_eq!(index.len(), 1);
        let hits = index.query("us", "whatsapp").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].vendor, "b");
        assert_eq!(hits[0].price, 3.0);
    }

    #[tokio::test]
    async fn inactive_offers_hidden_from_queries() {
        let index = MemoryIndex::new();
        let mut offer = offer_fixture("a", "us", "whatsapp", 1.0);
        offer.is_active = false;
        index.upsert_offers(&[offer]).await.unwrap();
        assert!(index.query("us", "whatsapp").await.unwrap().is_empty());
        assert_eq!(index.all_offers().await.unwrap().len(), 1);
    }
}
