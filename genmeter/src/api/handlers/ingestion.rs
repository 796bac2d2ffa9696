use axum::{Json, extract::State, http::StatusCode};
use tracing::{debug, error};

use crate::{
    AppState,
    api::models::ingestion::{
        IngestionBatch, IngestionEvent, IngestionFailure, IngestionResponse, IngestionSuccess, raw_event_id,
    },
    auth::AuthenticatedProject,
    errors::{Error, Result},
    metrics,
};

#[utoipa::path(
    post,
    path = "/ingestion",
    tag = "ingestion",
    summary = "Ingest generation events",
    description = "Validates each event and enqueues it for asynchronous usage and cost resolution.
Invalid events are reported individually; valid events in the same batch are still accepted.",
    request_body = IngestionBatch,
    responses(
        (status = 207, description = "Per-event results", body = IngestionResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("BasicAuth" = []))
)]
#[tracing::instrument(skip_all, fields(project_id = %project.project_id))]
pub async fn ingest(
    State(state): State<AppState>,
    project: AuthenticatedProject,
    Json(batch): Json<IngestionBatch>,
) -> Result<(StatusCode, Json<IngestionResponse>)> {
    let mut response = IngestionResponse::default();

    for raw in batch.batch {
        let raw_id = raw_event_id(&raw);
        let event = match IngestionEvent::parse(raw) {
            Ok(event) => event,
            Err(message) => {
                metrics::record_ingestion_event("unknown", false);
                response.errors.push(IngestionFailure {
                    id: raw_id,
                    status: StatusCode::BAD_REQUEST.as_u16(),
                    message,
                });
                continue;
            }
        };

        let event_type = event.kind.as_str();
        let event_id = event.id.clone();
        let generation_event = match event.into_generation_event() {
            Ok(generation_event) => generation_event,
            Err(message) => {
                metrics::record_ingestion_event(event_type, false);
                response.errors.push(IngestionFailure {
                    id: event_id,
                    status: StatusCode::BAD_REQUEST.as_u16(),
                    message,
                });
                continue;
            }
        };

        match state.queue.enqueue(&project.project_id, generation_event).await {
            Ok(message_id) => {
                debug!(event_id = %event_id, message_id = %message_id, "Event enqueued");
                metrics::record_ingestion_event(event_type, true);
                response.successes.push(IngestionSuccess {
                    id: event_id,
                    status: StatusCode::CREATED.as_u16(),
                });
            }
            Err(e) => {
                error!(event_id = %event_id, "Failed to enqueue event: {}", e);
                let error = Error::from(e);
                response.errors.push(IngestionFailure {
                    id: event_id,
                    status: error.status_code().as_u16(),
                    message: error.user_message(),
                });
            }
        }
    }

    Ok((StatusCode::MULTI_STATUS, Json(response)))
}
