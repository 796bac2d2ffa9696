//! Database repository for model definitions.

use crate::db::errors::{DbError, Result};
use crate::db::handlers::repository::Repository;
use crate::db::models::model_definitions::{
    ModelDefinitionCreateDBRequest, ModelDefinitionDBResponse, ModelDefinitionUpdateDBRequest, TokenizerConfig,
};
use crate::types::{ModelDefinitionId, Operation, ProjectId, abbrev_uuid};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::types::Json;
use sqlx::{FromRow, PgConnection};
use tracing::instrument;

/// Filter for listing model definitions
#[derive(Debug, Clone, Default)]
pub struct ModelDefinitionFilter {
    /// Only definitions visible to this project (its own plus system-maintained). `None` lists all.
    pub project_id: Option<ProjectId>,
    pub skip: i64,
    /// `None` returns every remaining row
    pub limit: Option<i64>,
}

impl ModelDefinitionFilter {
    pub fn new(project_id: Option<ProjectId>, skip: i64, limit: i64) -> Self {
        Self {
            project_id,
            skip,
            limit: Some(limit),
        }
    }

    /// Every definition of every project, for building the matching catalog
    pub fn all() -> Self {
        Self::default()
    }
}

// Database entity model
#[derive(Debug, Clone, FromRow)]
struct ModelDefinition {
    pub id: ModelDefinitionId,
    pub project_id: Option<String>,
    pub model_name: String,
    pub match_pattern: String,
    pub unit: String,
    pub start_time: Option<DateTime<Utc>>,
    pub input_price: Option<Decimal>,
    pub output_price: Option<Decimal>,
    pub total_price: Option<Decimal>,
    pub tokenizer_id: Option<String>,
    pub tokenizer_config: Option<Json<TokenizerConfig>>,
    pub hidden_reasoning: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<ModelDefinition> for ModelDefinitionDBResponse {
    type Error = anyhow::Error;

    fn try_from(src: ModelDefinition) -> std::result::Result<Self, Self::Error> {
        Ok(Self {
            id: src.id,
            project_id: src.project_id,
            model_name: src.model_name,
            match_pattern: src.match_pattern,
            unit: src.unit.parse().map_err(anyhow::Error::msg)?,
            start_time: src.start_time,
            input_price: src.input_price,
            output_price: src.output_price,
            total_price: src.total_price,
            tokenizer_id: src.tokenizer_id,
            tokenizer_config: src.tokenizer_config.map(|config| config.0),
            hidden_reasoning: src.hidden_reasoning,
            created_at: src.created_at,
            updated_at: src.updated_at,
        })
    }
}

const VISIBLE_TO_PROJECT: &str = "($1::text IS NULL OR project_id IS NULL OR project_id = $1)";

pub struct ModelDefinitions<'c> {
    db: &'c mut PgConnection,
}

#[async_trait::async_trait]
impl<'c> Repository for ModelDefinitions<'c> {
    type CreateRequest = ModelDefinitionCreateDBRequest;
    type UpdateRequest = ModelDefinitionUpdateDBRequest;
    type Response = ModelDefinitionDBResponse;
    type Id = ModelDefinitionId;
    type Filter = ModelDefinitionFilter;

    #[instrument(skip(self, request), fields(model_name = %request.model_name, unit = %request.unit), err)]
    async fn create(&mut self, request: &Self::CreateRequest) -> Result<Self::Response> {
        let definition = sqlx::query_as::<_, ModelDefinition>(
            r#"
            INSERT INTO model_definitions (
                project_id, model_name, match_pattern, unit, start_time,
                input_price, output_price, total_price, tokenizer_id, tokenizer_config, hidden_reasoning
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING *
            "#,
        )
        .bind(&request.project_id)
        .bind(&request.model_name)
        .bind(&request.match_pattern)
        .bind(request.unit.as_str())
        .bind(request.start_time)
        .bind(request.input_price)
        .bind(request.output_price)
        .bind(request.total_price)
        .bind(&request.tokenizer_id)
        .bind(request.tokenizer_config.as_ref().map(Json))
        .bind(request.hidden_reasoning)
        .fetch_one(&mut *self.db)
        .await?;

        Ok(definition.try_into()?)
    }

    #[instrument(skip(self), fields(model_definition_id = %abbrev_uuid(&id)), err)]
    async fn get_by_id(&mut self, id: Self::Id) -> Result<Option<Self::Response>> {
        let definition = sqlx::query_as::<_, ModelDefinition>("SELECT * FROM model_definitions WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *self.db)
            .await?;

        match definition {
            Some(d) => Ok(Some(d.try_into()?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self, filter), fields(limit = ?filter.limit, skip = filter.skip), err)]
    async fn list(&mut self, filter: &Self::Filter) -> Result<Vec<Self::Response>> {
        let query = format!(
            "SELECT * FROM model_definitions WHERE {VISIBLE_TO_PROJECT} \
             ORDER BY (project_id IS NULL), model_name, start_time NULLS FIRST, id \
             LIMIT $2 OFFSET $3"
        );
        let definitions = sqlx::query_as::<_, ModelDefinition>(&query)
            .bind(&filter.project_id)
            .bind(filter.limit)
            .bind(filter.skip)
            .fetch_all(&mut *self.db)
            .await?;

        definitions.into_iter().map(|d| Ok(d.try_into()?)).collect()
    }

    #[instrument(skip(self, filter), err)]
    async fn count(&mut self, filter: &Self::Filter) -> Result<i64> {
        let query = format!("SELECT COUNT(*) FROM model_definitions WHERE {VISIBLE_TO_PROJECT}");
        let count: i64 = sqlx::query_scalar(&query)
            .bind(&filter.project_id)
            .fetch_one(&mut *self.db)
            .await?;
        Ok(count)
    }

    #[instrument(skip(self), fields(model_definition_id = %abbrev_uuid(&id)), err)]
    async fn delete(&mut self, id: Self::Id) -> Result<bool> {
        self.ensure_user_defined(id, Operation::Delete).await?;

        let result = sqlx::query("DELETE FROM model_definitions WHERE id = $1 AND project_id IS NOT NULL")
            .bind(id)
            .execute(&mut *self.db)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, request), fields(model_definition_id = %abbrev_uuid(&id)), err)]
    async fn update(&mut self, id: Self::Id, request: &Self::UpdateRequest) -> Result<Self::Response> {
        self.ensure_user_defined(id, Operation::Update).await?;

        let definition = sqlx::query_as::<_, ModelDefinition>(
            r#"
            UPDATE model_definitions SET
                input_price = CASE WHEN $2 THEN $3 ELSE input_price END,
                output_price = CASE WHEN $4 THEN $5 ELSE output_price END,
                total_price = CASE WHEN $6 THEN $7 ELSE total_price END,
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(request.input_price.is_some())
        .bind(request.input_price.flatten())
        .bind(request.output_price.is_some())
        .bind(request.output_price.flatten())
        .bind(request.total_price.is_some())
        .bind(request.total_price.flatten())
        .fetch_optional(&mut *self.db)
        .await?
        .ok_or(DbError::NotFound)?;

        Ok(definition.try_into()?)
    }
}

impl<'c> ModelDefinitions<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    /// System definitions can only change through configuration.
    async fn ensure_user_defined(&mut self, id: ModelDefinitionId, operation: Operation) -> Result<()> {
        let project_id: Option<Option<String>> = sqlx::query_scalar("SELECT project_id FROM model_definitions WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *self.db)
            .await?;

        match project_id {
            None => Err(DbError::NotFound),
            Some(None) => Err(DbError::system_model(operation, id)),
            Some(Some(_)) => Ok(()),
        }
    }

    /// Insert or refresh a system-maintained definition, keyed by model name, unit and start time.
    ///
    /// Existing rows keep their id so generations resolved against them stay linked.
    #[instrument(skip(self, request), fields(model_name = %request.model_name), err)]
    pub async fn upsert_system(&mut self, request: &ModelDefinitionCreateDBRequest) -> Result<ModelDefinitionDBResponse> {
        let existing: Option<ModelDefinitionId> = sqlx::query_scalar(
            r#"
            SELECT id FROM model_definitions
            WHERE project_id IS NULL AND model_name = $1 AND unit = $2 AND start_time IS NOT DISTINCT FROM $3
            "#,
        )
        .bind(&request.model_name)
        .bind(request.unit.as_str())
        .bind(request.start_time)
        .fetch_optional(&mut *self.db)
        .await?;

        let Some(id) = existing else {
            let request = ModelDefinitionCreateDBRequest {
                project_id: None,
                ..request.clone()
            };
            return self.create(&request).await;
        };

        let definition = sqlx::query_as::<_, ModelDefinition>(
            r#"
            UPDATE model_definitions SET
                match_pattern = $2,
                input_price = $3,
                output_price = $4,
                total_price = $5,
                tokenizer_id = $6,
                tokenizer_config = $7,
                hidden_reasoning = $8,
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&request.match_pattern)
        .bind(request.input_price)
        .bind(request.output_price)
        .bind(request.total_price)
        .bind(&request.tokenizer_id)
        .bind(request.tokenizer_config.as_ref().map(Json))
        .bind(request.hidden_reasoning)
        .fetch_one(&mut *self.db)
        .await?;

        Ok(definition.try_into()?)
    }
}
