//! Operational HTTP surface.

pub mod routes;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::health::{HealthMetrics, HealthMonitor};
use crate::router::SmartRouter;
use crate::storage::Storage;
use crate::sync::Synchronizer;

#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<Storage>,
    pub router: Arc<SmartRouter>,
    pub sync: Arc<Synchronizer>,
    pub health: Arc<HealthMonitor>,
    pub metrics: Arc<HealthMetrics>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::health_check))
        .route("/metrics", get(routes::prometheus_metrics))
        .route("/api/sync", post(routes::trigger_sync))
        .route("/api/balances/low", get(routes::low_balances))
        .route("/api/providers/health", get(routes::provider_health))
        .route("/api/providers/ranked", get(routes::ranked_providers))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
