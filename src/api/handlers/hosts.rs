//! Proxy host handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use uuid::Uuid;

use crate::api::AppContext;
use crate::error::AppError;
use crate::models::{CreateHostRequest, UpdateHostRequest};

/// GET /api/hosts - List all proxy hosts
pub async fn list_hosts(State(ctx): State<AppContext>) -> impl IntoResponse {
    Json(ctx.store.list_hosts().await)
}

/// GET /api/hosts/:id - Get one proxy host
pub async fn get_host(
    State(ctx): State<AppContext>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(ctx.store.get_host(id).await?))
}

/// POST /api/hosts - Create a proxy host
pub async fn create_host(
    State(ctx): State<AppContext>,
    Json(payload): Json<CreateHostRequest>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = ctx.orchestrator.create_host(payload).await?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

/// PUT /api/hosts/:id - Update a proxy host
pub async fn update_host(
    State(ctx): State<AppContext>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateHostRequest>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = ctx.orchestrator.update_host(id, payload).await?;
    Ok(Json(outcome))
}

/// DELETE /api/hosts/:id - Delete a proxy host
pub async fn delete_host(
    State(ctx): State<AppContext>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = ctx.orchestrator.delete_host(id).await?;
    Ok(Json(outcome))
}

/// POST /api/hosts/:id/toggle - Flip the enabled flag
pub async fn toggle_host(
    State(ctx): State<AppContext>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = ctx.orchestrator.toggle_host(id).await?;
    Ok(Json(outcome))
}
