//! ACME handlers

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use chrono::Utc;

use crate::acme::{self, dns, ObtainCertificateRequest};
use crate::api::AppContext;
use crate::error::AppError;

/// GET /api/acme/providers - Supported DNS-01 providers and the
/// configuration fields each requires
pub async fn list_dns_providers() -> impl IntoResponse {
    Json(dns::provider_infos())
}

/// POST /api/acme/obtain - Issue a certificate via DNS-01
pub async fn obtain_certificate(
    State(ctx): State<AppContext>,
    Json(payload): Json<ObtainCertificateRequest>,
) -> Result<impl IntoResponse, AppError> {
    let cert = ctx
        .orchestrator
        .issue_certificate(&ctx.acme, payload)
        .await?;
    Ok((StatusCode::CREATED, Json(cert)))
}

/// GET /api/acme/renewals - Read-only renewal scan
pub async fn renewal_scan(State(ctx): State<AppContext>) -> impl IntoResponse {
    let certs = ctx.store.list_certificates().await;
    Json(acme::renewal_scan(&certs, Utc::now()))
}
