use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use tracing::{info, warn};

use crate::{
    AppState,
    api::models::{
        model_definitions::{ModelDefinitionCreate, ModelDefinitionResponse, ModelDefinitionUpdate, RepriceResponse},
        pagination::{PaginatedResponse, Pagination},
    },
    auth::AuthenticatedProject,
    db::{
        handlers::{
            generations::{GenerationCostUpdateDBRequest, GenerationFilter},
            model_definitions::ModelDefinitionFilter,
        },
        models::model_definitions::ModelDefinitionDBResponse,
    },
    errors::{Error, Result},
    storage::Storage,
    types::{ModelDefinitionId, ProjectId, abbrev_uuid},
    usage::resolver::price,
};

/// Generations read and rewritten per repricing transaction
const REPRICE_PAGE_SIZE: i64 = 500;

/// Load a definition the project can see. Other projects' definitions are reported as missing.
async fn visible_definition(
    state: &AppState,
    project: &AuthenticatedProject,
    id: ModelDefinitionId,
) -> Result<ModelDefinitionDBResponse> {
    state
        .storage
        .get_model_definition(id)
        .await?
        .filter(|definition| definition.is_visible_to(&project.project_id))
        .ok_or_else(|| Error::NotFound {
            resource: "Model definition".to_string(),
            id: id.to_string(),
        })
}

/// Matching uses the new definitions right away in this process; other processes pick them up
/// on their next periodic refresh.
async fn refresh_catalog(state: &AppState) {
    if let Err(e) = state.catalog.refresh().await {
        warn!("Failed to refresh model catalog after a change: {}", e);
    }
}

#[utoipa::path(
    get,
    path = "/models",
    tag = "models",
    summary = "List model definitions",
    description = "Lists the project's own definitions followed by system-maintained ones.",
    params(Pagination),
    responses(
        (status = 200, description = "Paginated model definitions", body = PaginatedResponse<ModelDefinitionResponse>),
        (status = 401, description = "Unauthorized"),
    ),
    security(("BasicAuth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn list_model_definitions(
    State(state): State<AppState>,
    project: AuthenticatedProject,
    Query(pagination): Query<Pagination>,
) -> Result<Json<PaginatedResponse<ModelDefinitionResponse>>> {
    let (skip, limit) = pagination.params();
    let filter = ModelDefinitionFilter::new(Some(project.project_id), skip, limit);

    let definitions = state.storage.list_model_definitions(&filter).await?;
    let total_count = state.storage.count_model_definitions(&filter).await?;

    Ok(Json(PaginatedResponse::new(
        definitions.into_iter().map(ModelDefinitionResponse::from).collect(),
        total_count,
        skip,
        limit,
    )))
}

#[utoipa::path(
    post,
    path = "/models",
    tag = "models",
    summary = "Create model definition",
    request_body = ModelDefinitionCreate,
    responses(
        (status = 201, description = "Model definition created", body = ModelDefinitionResponse),
        (status = 400, description = "Invalid pattern, tokenizer or price"),
        (status = 401, description = "Unauthorized"),
        (status = 409, description = "A definition with this name, unit and start time already exists"),
    ),
    security(("BasicAuth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn create_model_definition(
    State(state): State<AppState>,
    project: AuthenticatedProject,
    Json(create): Json<ModelDefinitionCreate>,
) -> Result<(StatusCode, Json<ModelDefinitionResponse>)> {
    let request = create.into_db_request(project.project_id);
    request.validate().map_err(|message| Error::BadRequest { message })?;

    let definition = state.storage.create_model_definition(&request).await?;
    info!(
        model_definition_id = %abbrev_uuid(&definition.id),
        model_name = %definition.model_name,
        "Created model definition"
    );
    refresh_catalog(&state).await;

    Ok((StatusCode::CREATED, Json(ModelDefinitionResponse::from(definition))))
}

#[utoipa::path(
    get,
    path = "/models/{id}",
    tag = "models",
    summary = "Get model definition",
    params(("id" = String, Path, description = "Model definition ID")),
    responses(
        (status = 200, description = "Model definition", body = ModelDefinitionResponse),
        (status = 401, description = "Unauthorized"),
        (status = 404, description = "Not found"),
    ),
    security(("BasicAuth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn get_model_definition(
    State(state): State<AppState>,
    project: AuthenticatedProject,
    Path(id): Path<ModelDefinitionId>,
) -> Result<Json<ModelDefinitionResponse>> {
    let definition = visible_definition(&state, &project, id).await?;
    Ok(Json(ModelDefinitionResponse::from(definition)))
}

#[utoipa::path(
    patch,
    path = "/models/{id}",
    tag = "models",
    summary = "Update model definition prices",
    description = "Changes the prices of a project definition. Generations already resolved against it keep
their costs until the definition is repriced.",
    params(("id" = String, Path, description = "Model definition ID")),
    request_body = ModelDefinitionUpdate,
    responses(
        (status = 200, description = "Updated model definition", body = ModelDefinitionResponse),
        (status = 400, description = "Invalid price"),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "System-maintained definitions cannot be changed"),
        (status = 404, description = "Not found"),
    ),
    security(("BasicAuth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn update_model_definition(
    State(state): State<AppState>,
    project: AuthenticatedProject,
    Path(id): Path<ModelDefinitionId>,
    Json(update): Json<ModelDefinitionUpdate>,
) -> Result<Json<ModelDefinitionResponse>> {
    update.validate().map_err(|message| Error::BadRequest { message })?;
    visible_definition(&state, &project, id).await?;

    let definition = state.storage.update_model_definition(id, &update.into()).await?;
    refresh_catalog(&state).await;

    Ok(Json(ModelDefinitionResponse::from(definition)))
}

#[utoipa::path(
    delete,
    path = "/models/{id}",
    tag = "models",
    summary = "Delete model definition",
    description = "Deletes a project definition. Generations resolved against it keep their values.",
    params(("id" = String, Path, description = "Model definition ID")),
    responses(
        (status = 204, description = "Deleted"),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "System-maintained definitions cannot be deleted"),
        (status = 404, description = "Not found"),
    ),
    security(("BasicAuth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn delete_model_definition(
    State(state): State<AppState>,
    project: AuthenticatedProject,
    Path(id): Path<ModelDefinitionId>,
) -> Result<StatusCode> {
    visible_definition(&state, &project, id).await?;

    if !state.storage.delete_model_definition(id).await? {
        return Err(Error::NotFound {
            resource: "Model definition".to_string(),
            id: id.to_string(),
        });
    }
    info!(model_definition_id = %abbrev_uuid(&id), "Deleted model definition");
    refresh_catalog(&state).await;

    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/models/{id}/reprice",
    tag = "models",
    summary = "Reprice generations",
    description = "Recomputes the calculated cost of the project's generations that were resolved against
this definition, using its current prices. Ingested values, usage and matching are left untouched.",
    params(("id" = String, Path, description = "Model definition ID")),
    responses(
        (status = 200, description = "Repricing summary", body = RepriceResponse),
        (status = 401, description = "Unauthorized"),
        (status = 404, description = "Not found"),
    ),
    security(("BasicAuth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn reprice_model_definition(
    State(state): State<AppState>,
    project: AuthenticatedProject,
    Path(id): Path<ModelDefinitionId>,
) -> Result<Json<RepriceResponse>> {
    let definition = visible_definition(&state, &project, id).await?;

    let (matched, updated) = reprice_generations(state.storage.as_ref(), project.project_id, &definition, REPRICE_PAGE_SIZE)
        .await
        .inspect_err(|e| warn!(model_definition_id = %abbrev_uuid(&id), "Repricing stopped: {}", e))?;

    info!(model_definition_id = %abbrev_uuid(&id), matched, updated, "Repriced generations");
    Ok(Json(RepriceResponse {
        model_definition_id: id,
        matched,
        updated,
    }))
}

/// Reprice a project's generations linked to `definition`, one page at a time. Each page's
/// changed costs are written in a single transaction. Returns `(matched, updated)`.
///
/// Repricing keeps the link to the definition, so the filtered set only grows by concurrently
/// ingested generations while paging. Those shift the offset forward, which can visit a row twice
/// but never skips one.
async fn reprice_generations(
    storage: &dyn Storage,
    project_id: ProjectId,
    definition: &ModelDefinitionDBResponse,
    page_size: i64,
) -> Result<(i64, i64)> {
    let mut filter = GenerationFilter::resolved_against(project_id, definition.id);
    filter.limit = Some(page_size);

    let (mut matched, mut updated) = (0, 0);
    loop {
        let page = storage.list_generations(&filter).await?;
        let changed: Vec<_> = page
            .iter()
            .filter_map(|generation| {
                let calculated_cost = price(&generation.usage(), &generation.provided_cost, Some(definition));
                (calculated_cost != generation.calculated_cost)
                    .then(|| (generation.key(), GenerationCostUpdateDBRequest { calculated_cost }))
            })
            .collect();
        if !changed.is_empty() {
            updated += storage.update_generation_costs(&changed).await? as i64;
        }

        matched += page.len() as i64;
        if (page.len() as i64) < page_size {
            return Ok((matched, updated));
        }
        filter.skip += page_size;
    }
}
