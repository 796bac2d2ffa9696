use axum::{Json, extract::State};
use serde::Serialize;
use utoipa::ToSchema;

use crate::{AppState, auth::AuthenticatedProject, errors::Result, queue::QueueDepth};

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    /// Model definitions in the current matching snapshot
    pub model_definitions: usize,
    pub queue: QueueDepth,
}

#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    summary = "Service health",
    description = "Reports ingestion queue depth. Fails with 503 when the queue cannot be reached.",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse),
        (status = 401, description = "Unauthorized"),
        (status = 503, description = "Ingestion queue unavailable"),
    ),
    security(("BasicAuth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn health(State(state): State<AppState>, _: AuthenticatedProject) -> Result<Json<HealthResponse>> {
    let queue = state.queue.depth().await?;
    Ok(Json(HealthResponse {
        status: "OK".to_string(),
        model_definitions: state.catalog.snapshot().len(),
        queue,
    }))
}
