use crate::types::{GenerationId, GenerationKey, ModelDefinitionId, ProjectId};
use crate::usage::{CostDetails, UsageDetails, UsageUnit};
use chrono::{DateTime, Utc};

/// Database request for inserting or replacing a generation.
///
/// The ingestion worker merges incoming events into the stored record before writing it back,
/// so an upsert always carries the complete row. The write is conditional on
/// `expected_revision`: `None` only inserts a new row, `Some(r)` only replaces the row while its
/// revision is still `r`. Otherwise the write fails with `DbError::StaleRevision`.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationUpsertDBRequest {
    pub project_id: ProjectId,
    pub id: GenerationId,
    pub trace_id: Option<String>,
    pub name: Option<String>,
    pub model: Option<String>,
    pub unit: UsageUnit,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub input: Option<serde_json::Value>,
    pub output: Option<serde_json::Value>,
    pub provided_usage: UsageDetails,
    pub provided_cost: CostDetails,
    pub calculated_usage: UsageDetails,
    pub calculated_cost: CostDetails,
    pub internal_model_id: Option<ModelDefinitionId>,
    pub expected_revision: Option<i64>,
}

/// Database response for a generation
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationDBResponse {
    pub project_id: ProjectId,
    pub id: GenerationId,
    pub trace_id: Option<String>,
    pub name: Option<String>,
    pub model: Option<String>,
    pub unit: UsageUnit,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub input: Option<serde_json::Value>,
    pub output: Option<serde_json::Value>,
    pub provided_usage: UsageDetails,
    pub provided_cost: CostDetails,
    pub calculated_usage: UsageDetails,
    pub calculated_cost: CostDetails,
    pub internal_model_id: Option<ModelDefinitionId>,
    /// Incremented by every write
    pub revision: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GenerationDBResponse {
    pub fn key(&self) -> GenerationKey {
        GenerationKey::new(self.project_id.clone(), self.id.clone())
    }

    /// Usage as reported: ingested values first, inferred values for the gaps
    pub fn usage(&self) -> UsageDetails {
        self.provided_usage.or(&self.calculated_usage)
    }

    /// Cost as reported: ingested values first, inferred values for the gaps
    pub fn cost(&self) -> CostDetails {
        self.provided_cost.or(&self.calculated_cost)
    }
}

impl From<GenerationDBResponse> for GenerationUpsertDBRequest {
    fn from(generation: GenerationDBResponse) -> Self {
        Self {
            project_id: generation.project_id,
            id: generation.id,
            trace_id: generation.trace_id,
            name: generation.name,
            model: generation.model,
            unit: generation.unit,
            start_time: generation.start_time,
            end_time: generation.end_time,
            input: generation.input,
            output: generation.output,
            provided_usage: generation.provided_usage,
            provided_cost: generation.provided_cost,
            calculated_usage: generation.calculated_usage,
            calculated_cost: generation.calculated_cost,
            internal_model_id: generation.internal_model_id,
            expected_revision: Some(generation.revision),
        }
    }
}
