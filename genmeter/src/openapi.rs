//! OpenAPI documentation for the public API at `/api/public/*`.

use utoipa::{
    Modify, OpenApi,
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
};

use crate::api;

/// HTTP Basic auth with a project's key pair.
struct BasicAuthAddon;

impl Modify for BasicAuthAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.security_schemes.insert(
                "BasicAuth".to_string(),
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Basic)
                        .description(Some(
                            "Use the project's public key as username and its secret key as password:\n\n\
                            ```\nAuthorization: Basic base64(public_key:secret_key)\n```",
                        ))
                        .build(),
                ),
            );
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    servers((url = "/api/public")),
    modifiers(&BasicAuthAddon),
    paths(
        api::handlers::ingestion::ingest,
        api::handlers::model_definitions::list_model_definitions,
        api::handlers::model_definitions::create_model_definition,
        api::handlers::model_definitions::get_model_definition,
        api::handlers::model_definitions::update_model_definition,
        api::handlers::model_definitions::delete_model_definition,
        api::handlers::model_definitions::reprice_model_definition,
        api::handlers::generations::list_generations,
        api::handlers::generations::get_generation,
        api::handlers::health::health,
    ),
    components(
        schemas(
            api::models::ingestion::IngestionBatch,
            api::models::ingestion::IngestionEvent,
            api::models::ingestion::IngestionEventType,
            api::models::ingestion::GenerationBody,
            api::models::ingestion::UsageInput,
            api::models::ingestion::IngestionResponse,
            api::models::ingestion::IngestionSuccess,
            api::models::ingestion::IngestionFailure,
            api::models::model_definitions::ModelDefinitionCreate,
            api::models::model_definitions::ModelDefinitionUpdate,
            api::models::model_definitions::ModelDefinitionResponse,
            api::models::model_definitions::ModelDefinitionScope,
            api::models::model_definitions::RepriceResponse,
            api::models::generations::GenerationResponse,
            api::models::generations::UsageReport,
            api::models::generations::CostReport,
            api::models::generations::ReportedCount,
            api::models::generations::ReportedCost,
            api::handlers::health::HealthResponse,
            crate::db::models::model_definitions::TokenizerConfig,
            crate::queue::QueueDepth,
            crate::usage::UsageUnit,
            crate::usage::ValueSource,
        )
    ),
    tags(
        (name = "ingestion", description = "Send generation events. Usage and cost that were not sent are
inferred asynchronously: usage with the matched model's tokenizer, cost with its prices."),
        (name = "models", description = "Model definitions used to match generations by model name, unit and
start time. Project definitions take priority over system-maintained ones."),
        (name = "generations", description = "Read generations with their effective usage and cost. Each value
reports whether it was ingested, inferred or is absent."),
        (name = "health", description = "Service and ingestion queue health."),
    ),
    info(
        title = "genmeter API",
        version = "1.0.0",
        description = "Generation ingestion with asynchronous usage and cost resolution.

## Authentication

All endpoints require HTTP Basic auth with a project's public and secret key.

## Errors

Errors are returned as plain text with the matching HTTP status code. Ingestion returns `207` with
a result per event.",
    ),
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openapi_document() {
        let json = ApiDoc::openapi().to_pretty_json().unwrap();
        assert!(json.contains("/models/{id}/reprice"));
        assert!(json.contains("BasicAuth"));
        assert!(json.contains("IngestionBatch"));
    }
}
