//! Certificate handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use uuid::Uuid;

use crate::acme::RenewCertificateRequest;
use crate::api::AppContext;
use crate::error::AppError;
use crate::models::{
    ApplyCertificateRequest, SelfSignedRequest, UpdateCertificateRequest, UploadCertificateRequest,
};

/// GET /api/certificates - List all certificates
pub async fn list_certificates(State(ctx): State<AppContext>) -> impl IntoResponse {
    Json(ctx.store.list_certificates().await)
}

/// GET /api/certificates/:id - Get one certificate
pub async fn get_certificate(
    State(ctx): State<AppContext>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(ctx.store.get_certificate(id).await?))
}

/// POST /api/certificates - Upload PEM material
pub async fn upload_certificate(
    State(ctx): State<AppContext>,
    Json(payload): Json<UploadCertificateRequest>,
) -> Result<impl IntoResponse, AppError> {
    let cert = ctx.orchestrator.upload_certificate(payload).await?;
    Ok((StatusCode::CREATED, Json(cert)))
}

/// POST /api/certificates/self-signed - Generate a self-signed certificate
pub async fn create_self_signed(
    State(ctx): State<AppContext>,
    Json(payload): Json<SelfSignedRequest>,
) -> Result<impl IntoResponse, AppError> {
    let cert = ctx
        .orchestrator
        .create_self_signed(&ctx.acme, payload)
        .await?;
    Ok((StatusCode::CREATED, Json(cert)))
}

/// PUT /api/certificates/:id - Update certificate metadata
pub async fn update_certificate(
    State(ctx): State<AppContext>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateCertificateRequest>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(ctx.store.update_certificate_meta(id, payload).await?))
}

/// DELETE /api/certificates/:id - Delete an unreferenced certificate
pub async fn delete_certificate(
    State(ctx): State<AppContext>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(ctx.orchestrator.delete_certificate(id).await?))
}

/// POST /api/certificates/:id/renew - Renew an ACME certificate
pub async fn renew_certificate(
    State(ctx): State<AppContext>,
    Path(id): Path<Uuid>,
    Json(payload): Json<RenewCertificateRequest>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = ctx
        .orchestrator
        .renew_certificate(&ctx.acme, id, payload.challenge)
        .await?;
    Ok(Json(outcome))
}

/// POST /api/certificates/:id/apply - Bind the certificate to hosts
pub async fn apply_certificate(
    State(ctx): State<AppContext>,
    Path(id): Path<Uuid>,
    Json(payload): Json<ApplyCertificateRequest>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = ctx.orchestrator.apply_certificate(id, payload).await?;
    Ok(Json(outcome))
}
