//! Default route, maintenance, nginx, metrics, logs and transfer handlers

use std::path::Path as FsPath;

use axum::{
    extract::{Query, State},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};

use super::SuccessResponse;
use crate::api::AppContext;
use crate::error::AppError;
use crate::logs;
use crate::models::{ImportRequest, UpdateDefaultRouteRequest, UpdateMaintenanceRequest};

// ============================================================================
// Default route
// ============================================================================

/// GET /api/default-route - Current default route
pub async fn get_default_route(State(ctx): State<AppContext>) -> impl IntoResponse {
    Json(ctx.store.get_default_route().await)
}

/// PUT /api/default-route - Replace the default route
pub async fn update_default_route(
    State(ctx): State<AppContext>,
    Json(payload): Json<UpdateDefaultRouteRequest>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = ctx.orchestrator.set_default_route(payload).await?;
    Ok(Json(outcome))
}

// ============================================================================
// Maintenance
// ============================================================================

/// GET /api/maintenance - Maintenance flag and message
pub async fn get_maintenance(State(ctx): State<AppContext>) -> impl IntoResponse {
    Json(ctx.store.get_maintenance().await)
}

/// PUT /api/maintenance - Enable or disable maintenance
pub async fn update_maintenance(
    State(ctx): State<AppContext>,
    Json(payload): Json<UpdateMaintenanceRequest>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = ctx.orchestrator.set_maintenance(payload).await?;
    Ok(Json(outcome))
}

// ============================================================================
// Nginx
// ============================================================================

/// GET /api/nginx/status - Probe + validate + version
pub async fn nginx_status(State(ctx): State<AppContext>) -> impl IntoResponse {
    Json(ctx.nginx.status().await)
}

#[derive(Serialize)]
pub struct TestResult {
    pub valid: bool,
    pub output: String,
}

/// POST /api/nginx/test - Run `nginx -t` and return its diagnostic
pub async fn test_nginx_config(
    State(ctx): State<AppContext>,
) -> Result<impl IntoResponse, AppError> {
    match ctx.orchestrator.validate_config().await {
        Ok(output) => Ok(Json(TestResult {
            valid: true,
            output,
        })),
        Err(AppError::ConfigInvalid(output)) => Ok(Json(TestResult {
            valid: false,
            output,
        })),
        Err(e) => Err(e),
    }
}

/// POST /api/nginx/reload - Operator-requested reload
pub async fn reload_nginx(State(ctx): State<AppContext>) -> Result<impl IntoResponse, AppError> {
    ctx.orchestrator.reload().await?;
    Ok(Json(SuccessResponse::new("Nginx reloaded successfully")))
}

// ============================================================================
// Metrics and access logs
// ============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsResponse {
    #[serde(flatten)]
    pub snapshot: crate::models::MetricsSnapshot,
    pub accepts: u64,
    pub handled: u64,
    pub requests: u64,
    pub daemon_uptime: u64,
}

/// GET /api/metrics - One-shot metrics snapshot
pub async fn get_metrics(State(ctx): State<AppContext>) -> impl IntoResponse {
    let snapshot = ctx.fanout.collect_metrics().await;
    let stub = ctx.nginx.scrape_stub_status().await;
    Json(MetricsResponse {
        snapshot,
        accepts: stub.accepts,
        handled: stub.handled,
        requests: stub.requests,
        daemon_uptime: ctx.fanout.daemon_uptime_secs(),
    })
}

#[derive(Deserialize)]
pub struct AccessLogQuery {
    #[serde(default = "default_log_limit")]
    pub limit: usize,
}

fn default_log_limit() -> usize {
    100
}

/// GET /api/logs/access - Most recent access-log records
pub async fn get_access_log(
    State(ctx): State<AppContext>,
    Query(query): Query<AccessLogQuery>,
) -> impl IntoResponse {
    let limit = query.limit.min(1000);
    let records = logs::tail(FsPath::new(&ctx.config.server.access_log), limit).await;
    Json(records)
}

// ============================================================================
// Transfer
// ============================================================================

/// GET /api/transfer/export - Export the host collection
pub async fn export_hosts(State(ctx): State<AppContext>) -> impl IntoResponse {
    Json(ctx.store.export_hosts().await)
}

/// POST /api/transfer/import - Import host records
pub async fn import_hosts(
    State(ctx): State<AppContext>,
    Json(payload): Json<ImportRequest>,
) -> impl IntoResponse {
    Json(ctx.orchestrator.import_hosts(payload).await)
}
