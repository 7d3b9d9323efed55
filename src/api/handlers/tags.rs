//! Tag handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use uuid::Uuid;

use crate::api::AppContext;
use crate::error::AppError;
use crate::models::{BulkTagRequest, BulkTagResponse, CreateTagRequest, UpdateTagRequest};

/// GET /api/tags - List all tags
pub async fn list_tags(State(ctx): State<AppContext>) -> impl IntoResponse {
    Json(ctx.store.list_tags().await)
}

/// POST /api/tags - Create a tag
pub async fn create_tag(
    State(ctx): State<AppContext>,
    Json(payload): Json<CreateTagRequest>,
) -> Result<impl IntoResponse, AppError> {
    let tag = ctx.store.create_tag(payload).await?;
    Ok((StatusCode::CREATED, Json(tag)))
}

/// PUT /api/tags/:id - Update a tag
pub async fn update_tag(
    State(ctx): State<AppContext>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateTagRequest>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(ctx.store.update_tag(id, payload).await?))
}

/// DELETE /api/tags/:id - Delete a tag, scrubbing all references
pub async fn delete_tag(
    State(ctx): State<AppContext>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(ctx.store.delete_tag(id).await?))
}

/// POST /api/tags/bulk - Idempotent bulk add/remove across entities
pub async fn bulk_tag(
    State(ctx): State<AppContext>,
    Json(payload): Json<BulkTagRequest>,
) -> Result<impl IntoResponse, AppError> {
    let updated = ctx.store.bulk_tag(payload).await?;
    Ok(Json(BulkTagResponse { updated }))
}
