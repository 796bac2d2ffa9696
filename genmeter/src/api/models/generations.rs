//! API response models for generations.
//!
//! Every usage and cost field is reported with its effective value and where that value came
//! from: ingested by the client, inferred by the worker, or absent.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use super::pagination::Pagination;
use crate::db::models::generations::GenerationDBResponse;
use crate::types::ModelDefinitionId;
use crate::usage::{UsageUnit, ValueSource};

/// Query parameters for listing generations
#[derive(Debug, Deserialize, IntoParams, ToSchema)]
pub struct ListGenerationsQuery {
    #[serde(flatten)]
    #[param(inline)]
    pub pagination: Pagination,
    /// Only generations with exactly this model name
    pub model: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ReportedCount {
    pub value: Option<i64>,
    pub source: ValueSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ReportedCost {
    #[schema(value_type = Option<f64>)]
    pub value: Option<Decimal>,
    pub source: ValueSource,
}

fn reported_count(provided: Option<i64>, calculated: Option<i64>) -> ReportedCount {
    ReportedCount {
        value: provided.or(calculated),
        source: ValueSource::of(&provided, &calculated),
    }
}

fn reported_cost(provided: Option<Decimal>, calculated: Option<Decimal>) -> ReportedCost {
    ReportedCost {
        value: provided.or(calculated),
        source: ValueSource::of(&provided, &calculated),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct UsageReport {
    pub input: ReportedCount,
    pub output: ReportedCount,
    pub total: ReportedCount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct CostReport {
    pub input: ReportedCost,
    pub output: ReportedCost,
    pub total: ReportedCost,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct GenerationResponse {
    pub id: String,
    pub trace_id: Option<String>,
    pub name: Option<String>,
    pub model: Option<String>,
    pub unit: UsageUnit,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    #[schema(value_type = Option<Object>)]
    pub input: Option<serde_json::Value>,
    #[schema(value_type = Option<Object>)]
    pub output: Option<serde_json::Value>,
    pub usage: UsageReport,
    pub cost: CostReport,
    /// Model definition the generation was resolved against
    #[schema(value_type = Option<String>, format = "uuid")]
    pub model_definition_id: Option<ModelDefinitionId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<GenerationDBResponse> for GenerationResponse {
    fn from(db: GenerationDBResponse) -> Self {
        let (provided, calculated) = (db.provided_usage, db.calculated_usage);
        let usage = UsageReport {
            input: reported_count(provided.input, calculated.input),
            output: reported_count(provided.output, calculated.output),
            total: reported_count(provided.total, calculated.total),
        };
        let (provided, calculated) = (db.provided_cost, db.calculated_cost);
        let cost = CostReport {
            input: reported_cost(provided.input, calculated.input),
            output: reported_cost(provided.output, calculated.output),
            total: reported_cost(provided.total, calculated.total),
        };

        Self {
            id: db.id,
            trace_id: db.trace_id,
            name: db.name,
            model: db.model,
            unit: db.unit,
            start_time: db.start_time,
            end_time: db.end_time,
            input: db.input,
            output: db.output,
            usage,
            cost,
            model_definition_id: db.internal_model_id,
            created_at: db.created_at,
            updated_at: db.updated_at,
        }
    }
}
