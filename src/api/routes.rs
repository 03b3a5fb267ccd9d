//! Operational endpoint handlers.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::sync::SyncSummary;

use super::AppState;

pub async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok", "timestamp": Utc::now().to_rfc3339() }))
}

pub async fn prometheus_metrics(State(state): State<AppState>) -> String {
    state.metrics.to_prometheus()
}

#[derive(Debug, Default, Deserialize)]
pub struct SyncRequest {
    pub vendor: Option<String>,
}

/// On-demand sync: one vendor when named (bare summary in the response),
/// every active vendor otherwise (array of summaries). Per-vendor failures
/// come back in the summary rather than failing the request.
pub async fn trigger_sync(
    State(state): State<AppState>,
    body: Option<Json<SyncRequest>>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let request = body.map(|Json(r)| r).unwrap_or_default();

    let slugs: Vec<String> = match &request.vendor {
        Some(slug) => vec![slug.clone()],
        None => state
            .storage
            .active_vendors()
            .map_err(|e| {
                warn!("cannot list vendors: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            })?
            .into_iter()
            .map(|v| v.name)
            .collect(),
    };

    let mut results = Vec::with_capacity(slugs.len());
    for slug in slugs {
        match state.sync.sync_vendor(&slug).await {
            Ok(summary) => results.push(summary),
            Err(e) => results.push(SyncSummary {
                vendor: slug,
                countries: 0,
                services: 0,
                prices: 0,
                duration_ms: 0,
                metadata_writes: 0,
                price_errors: 0,
                error: Some(e.to_string()),
            }),
        }
    }

    let payload = if request.vendor.is_some() && results.len() == 1 {
        serde_json::to_value(&results[0])
    } else {
        serde_json::to_value(&results)
    }
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(payload))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LowBalanceVendor {
    pub vendor: String,
    pub balance: f64,
    pub threshold: f64,
}

/// Vendors whose last known balance sits below their configured threshold.
pub async fn low_balances(
    State(state): State<AppState>,
) -> Result<Json<Vec<LowBalanceVendor>>, StatusCode> {
    let vendors = state.storage.list_vendors().map_err(|e| {
        warn!("cannot list vendors: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    let low: Vec<LowBalanceVendor> = vendors
        .into_iter()
        .filter(|v| v.is_active)
        .filter_map(|v| {
            let threshold = v.balance_alert_threshold?;
            let balance = v.balance?;
            (balance < threshold).then(|| LowBalanceVendor {
                vendor: v.name,
                balance,
                threshold,
            })
        })
        .collect();
    Ok(Json(low))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VendorHealthRow {
    pub vendor: String,
    pub circuit: String,
    pub available: bool,
    pub success_rate: Option<f64>,
    pub avg_latency_ms: Option<f64>,
    pub avg_delivery_ms: Option<f64>,
}

pub async fn provider_health(
    State(state): State<AppState>,
) -> Result<Json<Vec<VendorHealthRow>>, StatusCode> {
    let vendors = state.storage.active_vendors().map_err(|e| {
        warn!("cannot list vendors: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    let rows = vendors
        .into_iter()
        .map(|v| {
            let health = state.health.provider_health(&v.name, None);
            VendorHealthRow {
                vendor: v.name,
                circuit: health.circuit.as_str().to_string(),
                available: health.is_available(),
                success_rate: health.success_rate,
                avg_latency_ms: health.avg_latency_ms,
                avg_delivery_ms: health.avg_delivery_ms,
            }
        })
        .collect();
    Ok(Json(rows))
}

#[derive(Debug, Deserialize)]
pub struct RankedQuery {
    pub country: String,
    pub service: String,
}

/// Public ranked quotes. The projection hides admin economics by
/// construction.
pub async fn ranked_providers(
    Query(query): Query<RankedQuery>,
    State(state): State<AppState>,
) -> Result<Json<Vec<crate::router::PublicQuote>>, StatusCode> {
    state
        .router
        .get_ranked_providers(&query.country, &query.service)
        .await
        .map(Json)
        .map_err(|e| {
            warn!("quote ranking failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })
}
