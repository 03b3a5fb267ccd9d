//! Icon reconciliation.
//!
//! Keeps exactly one local file per canonical slug. Downloads are rejected
//! when their content hash is on the known-bad list or when the body is HTML
//! masquerading as an image; duplicate extensions are resolved by the
//! `svg > webp > png > jpg` ranking.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::registry::ICON_EXT_RANKING;

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct IconReport {
    pub downloaded: usize,
    pub skipped: usize,
    pub rejected: usize,
    pub deduped: usize,
    pub errors: usize,
}

pub struct IconReconciler {
    client: Client,
    icon_dir: PathBuf,
    known_bad_hashes: HashSet<String>,
}

fn ext_rank(ext: &str) -> Option<usize> {
    ICON_EXT_RANKING.iter().position(|e| *e == ext)
}

fn looks_like_html(body: &[u8]) -> bool {
    let head: Vec<u8> = body
        .iter()
        .copied()
        .skip_while(|b| b.is_ascii_whitespace())
        .take(64)
        .collect();
    let head = String::from_utf8_lossy(&head).to_lowercase();
    head.starts_with("<!doctype") || head.starts_with("<html") || head.starts_with("<head")
}

fn ext_from_response(content_type: Option<&str>, url: &str) -> Option<&'static str> {
    if let Some(ct) = content_type {
        let ct = ct.split(';').next().unwrap_or("").trim();
        match ct {
            "image/svg+xml" => return Some("svg"),
            "image/webp" => return Some("webp"),
            "image/png" => return Some("png"),
            "image/jpeg" | "image/jpg" => return Some("jpg"),
            _ => {}
        }
    }
    let path = url.split('?').next().unwrap_or(url);
    ICON_EXT_RANKING
        .iter()
        .find(|ext| path.ends_with(&format!(".{}", ext)))
        .copied()
}

impl IconReconciler {
    pub fn new(icon_dir: PathBuf, known_bad_hashes: Vec<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .user_agent("numbroker/1.0")
            .build()
            .context("building icon client")?;
        Ok(Self {
            client,
            icon_dir,
            known_bad_hashes: known_bad_hashes.into_iter().collect(),
        })
    }

    fn existing_exts(&self, slug: &str) -> Vec<&'static str> {
        ICON_EXT_RANKING
            .iter()
            .filter(|ext| self.icon_dir.join(format!("{}.{}", slug, ext)).exists())
            .copied()
            .collect()
    }

    /// Remove everything but the best-ranked file for a slug.
    async fn dedupe_slug(&self, slug: &str) -> usize {
        let existing = self.existing_exts(slug);
        if existing.len() <= 1 {
            return 0;
        }
        let mut removed = 0;
        for ext in existing.iter().skip(1) {
            let path = self.icon_dir.join(format!("{}.{}", slug, ext));
            if fs::remove_file(&path).await.is_ok() {
                removed += 1;
                debug!(slug, ext, "removed lower-ranked duplicate icon");
            }
        }
        removed
    }

    async fn download_one(&self, slug: &str, url: &str) -> Result<bool> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("fetching icon for {}", slug))?;
        if !response.status().is_success() {
            anyhow::bail!("icon fetch for {} returned {}", slug, response.status());
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let body = response
            .bytes()
            .await
            .with_context(|| format!("reading icon body for {}", slug))?;

        if looks_like_html(&body) {
            warn!(slug, url, "rejecting HTML masquerading as image");
            return Ok(false);
        }
        let hash = hex::encode(Sha256::digest(&body));
        if self.known_bad_hashes.contains(&hash) {
            warn!(slug, hash, "rejecting known-bad icon content");
            return Ok(false);
        }
        let Some(ext) = ext_from_response(content_type.as_deref(), url) else {
            warn!(slug, url, "rejecting icon with unknown format");
            return Ok(false);
        };

        fs::create_dir_all(&self.icon_dir)
            .await
            .context("creating icon dir")?;
        let path = self.icon_dir.join(format!("{}.{}", slug, ext));

        // First writer wins within a run; a better-ranked file already on
        // disk beats a fresh lower-ranked download.
        if let Some(best) = self.existing_exts(slug).first() {
            if ext_rank(best) <= ext_rank(ext) {
                return Ok(false);
            }
        }
        fs::write(&path, &body)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(true)
    }

    /// Reconcile `(slug, vendor_url)` pairs against the icon directory.
    pub async fn reconcile(&self, items: &[(String, Option<String>)]) -> IconReport {
        let mut report = IconReport::default();
        for (slug, url) in items {
            report.deduped += self.dedupe_slug(slug).await;

            if !self.existing_exts(slug).is_empty() {
                report.skipped += 1;
                continue;
            }
            let Some(url) = url.as_ref().filter(|u| u.starts_with("http")) else {
                report.skipped += 1;
                continue;
            };
            match self.download_one(slug, url).await {
                Ok(true) => report.downloaded += 1,
                Ok(false) => report.rejected += 1,
                Err(e) => {
                    report.errors += 1;
                    warn!(slug, "icon download failed: {}", e);
                }
            }
        }
        info!(
            downloaded = report.downloaded,
            skipped = report.skipped,
            rejected = report.rejected,
            deduped = report.deduped,
            errors = report.errors,
            "icon reconciliation finished"
        );
        report
    }

}
