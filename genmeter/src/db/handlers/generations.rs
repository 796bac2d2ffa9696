//! Database repository for generations.

use crate::db::errors::{DbError, Result};
use crate::db::handlers::repository::Repository;
use crate::db::models::generations::{GenerationDBResponse, GenerationUpsertDBRequest};
use crate::types::{GenerationKey, ModelDefinitionId, ProjectId};
use crate::usage::{CostDetails, UsageDetails};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::types::Json;
use sqlx::{FromRow, PgConnection};
use tracing::instrument;

/// Filter for listing generations of a project
#[derive(Debug, Clone)]
pub struct GenerationFilter {
    pub project_id: ProjectId,
    /// Exact model name
    pub model: Option<String>,
    /// Only generations resolved against this model definition
    pub internal_model_id: Option<ModelDefinitionId>,
    pub skip: i64,
    /// `None` returns every remaining row
    pub limit: Option<i64>,
}

impl GenerationFilter {
    pub fn new(project_id: impl Into<ProjectId>, skip: i64, limit: i64) -> Self {
        Self {
            project_id: project_id.into(),
            model: None,
            internal_model_id: None,
            skip,
            limit: Some(limit),
        }
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    /// All generations of a project linked to one definition
    pub fn resolved_against(project_id: impl Into<ProjectId>, model_definition_id: ModelDefinitionId) -> Self {
        Self {
            project_id: project_id.into(),
            model: None,
            internal_model_id: Some(model_definition_id),
            skip: 0,
            limit: None,
        }
    }
}

/// Replaces the calculated cost of a generation (used when repricing).
#[derive(Debug, Clone)]
pub struct GenerationCostUpdateDBRequest {
    pub calculated_cost: CostDetails,
}

// Database entity model
#[derive(Debug, Clone, FromRow)]
struct Generation {
    pub project_id: String,
    pub id: String,
    pub trace_id: Option<String>,
    pub name: Option<String>,
    pub model: Option<String>,
    pub unit: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub input: Option<Json<serde_json::Value>>,
    pub output: Option<Json<serde_json::Value>>,
    pub provided_input_usage: Option<i64>,
    pub provided_output_usage: Option<i64>,
    pub provided_total_usage: Option<i64>,
    pub provided_input_cost: Option<Decimal>,
    pub provided_output_cost: Option<Decimal>,
    pub provided_total_cost: Option<Decimal>,
    pub calculated_input_usage: Option<i64>,
    pub calculated_output_usage: Option<i64>,
    pub calculated_total_usage: Option<i64>,
    pub calculated_input_cost: Option<Decimal>,
    pub calculated_output_cost: Option<Decimal>,
    pub calculated_total_cost: Option<Decimal>,
    pub internal_model_id: Option<ModelDefinitionId>,
    pub revision: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<Generation> for GenerationDBResponse {
    type Error = anyhow::Error;

    fn try_from(src: Generation) -> std::result::Result<Self, Self::Error> {
        Ok(Self {
            project_id: src.project_id,
            id: src.id,
            trace_id: src.trace_id,
            name: src.name,
            model: src.model,
            unit: src.unit.parse().map_err(anyhow::Error::msg)?,
            start_time: src.start_time,
            end_time: src.end_time,
            input: src.input.map(|v| v.0),
            output: src.output.map(|v| v.0),
            provided_usage: UsageDetails {
                input: src.provided_input_usage,
                output: src.provided_output_usage,
                total: src.provided_total_usage,
            },
            provided_cost: CostDetails {
                input: src.provided_input_cost,
                output: src.provided_output_cost,
                total: src.provided_total_cost,
            },
            calculated_usage: UsageDetails {
                input: src.calculated_input_usage,
                output: src.calculated_output_usage,
                total: src.calculated_total_usage,
            },
            calculated_cost: CostDetails {
                input: src.calculated_input_cost,
                output: src.calculated_output_cost,
                total: src.calculated_total_cost,
            },
            internal_model_id: src.internal_model_id,
            revision: src.revision,
            created_at: src.created_at,
            updated_at: src.updated_at,
        })
    }
}

const FILTER_CLAUSE: &str = "project_id = $1 \
    AND ($2::text IS NULL OR model = $2) \
    AND ($3::uuid IS NULL OR internal_model_id = $3)";

pub struct Generations<'c> {
    db: &'c mut PgConnection,
}

#[async_trait::async_trait]
impl<'c> Repository for Generations<'c> {
    type CreateRequest = GenerationUpsertDBRequest;
    type UpdateRequest = GenerationCostUpdateDBRequest;
    type Response = GenerationDBResponse;
    type Id = GenerationKey;
    type Filter = GenerationFilter;

    /// Insert the generation, or replace the stored row at the expected revision.
    ///
    /// # Errors
    /// - `StaleRevision` if the row exists although none was expected, or moved past the
    ///   expected revision
    #[instrument(skip(self, request), fields(project_id = %request.project_id, generation_id = %request.id, expected_revision = ?request.expected_revision), err)]
    async fn create(&mut self, request: &Self::CreateRequest) -> Result<Self::Response> {
        let query = match request.expected_revision {
            None => {
                r#"
                INSERT INTO generations (
                    project_id, id, trace_id, name, model, unit, start_time, end_time, input, output,
                    provided_input_usage, provided_output_usage, provided_total_usage,
                    provided_input_cost, provided_output_cost, provided_total_cost,
                    calculated_input_usage, calculated_output_usage, calculated_total_usage,
                    calculated_input_cost, calculated_output_cost, calculated_total_cost,
                    internal_model_id
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23)
                ON CONFLICT (project_id, id) DO NOTHING
                RETURNING *
                "#
            }
            Some(_) => {
                r#"
                UPDATE generations SET
                    trace_id = $3,
                    name = $4,
                    model = $5,
                    unit = $6,
                    start_time = $7,
                    end_time = $8,
                    input = $9,
                    output = $10,
                    provided_input_usage = $11,
                    provided_output_usage = $12,
                    provided_total_usage = $13,
                    provided_input_cost = $14,
                    provided_output_cost = $15,
                    provided_total_cost = $16,
                    calculated_input_usage = $17,
                    calculated_output_usage = $18,
                    calculated_total_usage = $19,
                    calculated_input_cost = $20,
                    calculated_output_cost = $21,
                    calculated_total_cost = $22,
                    internal_model_id = $23,
                    revision = revision + 1,
                    updated_at = NOW()
                WHERE project_id = $1 AND id = $2 AND revision = $24
                RETURNING *
                "#
            }
        };

        let mut statement = sqlx::query_as::<_, Generation>(query)
            .bind(&request.project_id)
            .bind(&request.id)
            .bind(&request.trace_id)
            .bind(&request.name)
            .bind(&request.model)
            .bind(request.unit.as_str())
            .bind(request.start_time)
            .bind(request.end_time)
            .bind(request.input.as_ref().map(Json))
            .bind(request.output.as_ref().map(Json))
            .bind(request.provided_usage.input)
            .bind(request.provided_usage.output)
            .bind(request.provided_usage.total)
            .bind(request.provided_cost.input)
            .bind(request.provided_cost.output)
            .bind(request.provided_cost.total)
            .bind(request.calculated_usage.input)
            .bind(request.calculated_usage.output)
            .bind(request.calculated_usage.total)
            .bind(request.calculated_cost.input)
            .bind(request.calculated_cost.output)
            .bind(request.calculated_cost.total)
            .bind(request.internal_model_id);
        if let Some(revision) = request.expected_revision {
            statement = statement.bind(revision);
        }

        let generation = statement
            .fetch_optional(&mut *self.db)
            .await?
            .ok_or_else(|| DbError::StaleRevision {
                entity_type: "generation".to_string(),
                entity_id: GenerationKey::new(request.project_id.clone(), request.id.clone()).to_string(),
            })?;

        Ok(generation.try_into()?)
    }

    #[instrument(skip(self), fields(generation = %id), err)]
    async fn get_by_id(&mut self, id: Self::Id) -> Result<Option<Self::Response>> {
        let generation = sqlx::query_as::<_, Generation>("SELECT * FROM generations WHERE project_id = $1 AND id = $2")
            .bind(&id.project_id)
            .bind(&id.id)
            .fetch_optional(&mut *self.db)
            .await?;

        match generation {
            Some(g) => Ok(Some(g.try_into()?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self, filter), fields(project_id = %filter.project_id, limit = ?filter.limit, skip = filter.skip), err)]
    async fn list(&mut self, filter: &Self::Filter) -> Result<Vec<Self::Response>> {
        let query = format!("SELECT * FROM generations WHERE {FILTER_CLAUSE} ORDER BY start_time DESC, id LIMIT $4 OFFSET $5");
        let generations = sqlx::query_as::<_, Generation>(&query)
            .bind(&filter.project_id)
            .bind(&filter.model)
            .bind(filter.internal_model_id)
            .bind(filter.limit)
            .bind(filter.skip)
            .fetch_all(&mut *self.db)
            .await?;

        generations.into_iter().map(|g| Ok(g.try_into()?)).collect()
    }

    #[instrument(skip(self, filter), fields(project_id = %filter.project_id), err)]
    async fn count(&mut self, filter: &Self::Filter) -> Result<i64> {
        let query = format!("SELECT COUNT(*) FROM generations WHERE {FILTER_CLAUSE}");
        let count: i64 = sqlx::query_scalar(&query)
            .bind(&filter.project_id)
            .bind(&filter.model)
            .bind(filter.internal_model_id)
            .fetch_one(&mut *self.db)
            .await?;
        Ok(count)
    }

    #[instrument(skip(self), fields(generation = %id), err)]
    async fn delete(&mut self, id: Self::Id) -> Result<bool> {
        let result = sqlx::query("DELETE FROM generations WHERE project_id = $1 AND id = $2")
            .bind(&id.project_id)
            .bind(&id.id)
            .execute(&mut *self.db)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, request), fields(generation = %id), err)]
    async fn update(&mut self, id: Self::Id, request: &Self::UpdateRequest) -> Result<Self::Response> {
        let generation = sqlx::query_as::<_, Generation>(
            r#"
            UPDATE generations SET
                calculated_input_cost = $3,
                calculated_output_cost = $4,
                calculated_total_cost = $5,
                revision = revision + 1,
                updated_at = NOW()
            WHERE project_id = $1 AND id = $2
            RETURNING *
            "#,
        )
        .bind(&id.project_id)
        .bind(&id.id)
        .bind(request.calculated_cost.input)
        .bind(request.calculated_cost.output)
        .bind(request.calculated_cost.total)
        .fetch_optional(&mut *self.db)
        .await?
        .ok_or(DbError::NotFound)?;

        Ok(generation.try_into()?)
    }
}

impl<'c> Generations<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }
}
