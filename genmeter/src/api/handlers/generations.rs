use axum::{
    Json,
    extract::{Path, Query, State},
};

use crate::{
    AppState,
    api::models::{
        generations::{GenerationResponse, ListGenerationsQuery},
        pagination::PaginatedResponse,
    },
    auth::AuthenticatedProject,
    db::handlers::generations::GenerationFilter,
    errors::{Error, Result},
    types::GenerationKey,
};

#[utoipa::path(
    get,
    path = "/generations",
    tag = "generations",
    summary = "List generations",
    description = "Lists the project's generations, newest start time first. Generations still waiting in the
ingestion queue are not listed yet.",
    params(ListGenerationsQuery),
    responses(
        (status = 200, description = "Paginated generations", body = PaginatedResponse<GenerationResponse>),
        (status = 401, description = "Unauthorized"),
    ),
    security(("BasicAuth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn list_generations(
    State(state): State<AppState>,
    project: AuthenticatedProject,
    Query(query): Query<ListGenerationsQuery>,
) -> Result<Json<PaginatedResponse<GenerationResponse>>> {
    let (skip, limit) = query.pagination.params();
    let filter = GenerationFilter::new(project.project_id, skip, limit).with_model(query.model);

    let generations = state.storage.list_generations(&filter).await?;
    let total_count = state.storage.count_generations(&filter).await?;

    Ok(Json(PaginatedResponse::new(
        generations.into_iter().map(GenerationResponse::from).collect(),
        total_count,
        skip,
        limit,
    )))
}

#[utoipa::path(
    get,
    path = "/generations/{id}",
    tag = "generations",
    summary = "Get generation",
    params(("id" = String, Path, description = "Client-supplied generation ID")),
    responses(
        (status = 200, description = "Generation with effective usage and cost", body = GenerationResponse),
        (status = 401, description = "Unauthorized"),
        (status = 404, description = "Not found"),
    ),
    security(("BasicAuth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn get_generation(
    State(state): State<AppState>,
    project: AuthenticatedProject,
    Path(id): Path<String>,
) -> Result<Json<GenerationResponse>> {
    let key = GenerationKey::new(project.project_id, id);
    let generation = state.storage.get_generation(&key).await?.ok_or_else(|| Error::NotFound {
        resource: "Generation".to_string(),
        id: key.id.clone(),
    })?;
    Ok(Json(GenerationResponse::from(generation)))
}
