//! API request/response models for generation ingestion.
//!
//! A batch is a list of events. Each event is parsed and validated on its own so that one bad
//! event does not reject the whole batch; the response reports every event individually.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_with::{DisplayFromStr, serde_as};
use utoipa::ToSchema;

use crate::usage::{CostDetails, GenerationEvent, GenerationEventKind, UsageDetails, UsageUnit};

/// A batch of ingestion events
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct IngestionBatch {
    /// Events are parsed one by one, see [`IngestionEvent`]
    #[schema(value_type = Vec<IngestionEvent>)]
    pub batch: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "kebab-case")]
pub enum IngestionEventType {
    GenerationCreate,
    GenerationUpdate,
}

impl IngestionEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestionEventType::GenerationCreate => "generation-create",
            IngestionEventType::GenerationUpdate => "generation-update",
        }
    }
}

impl From<IngestionEventType> for GenerationEventKind {
    fn from(kind: IngestionEventType) -> Self {
        match kind {
            IngestionEventType::GenerationCreate => GenerationEventKind::GenerationCreate,
            IngestionEventType::GenerationUpdate => GenerationEventKind::GenerationUpdate,
        }
    }
}

/// A single ingestion event
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct IngestionEvent {
    /// Event id, echoed back in the response
    pub id: String,
    #[serde(rename = "type")]
    pub kind: IngestionEventType,
    pub timestamp: DateTime<Utc>,
    pub body: GenerationBody,
}

/// Generation fields carried by an event. Update events only need the id.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct GenerationBody {
    /// Client-supplied generation id, unique within the project
    pub id: String,
    #[serde(alias = "trace_id")]
    pub trace_id: Option<String>,
    pub name: Option<String>,
    pub model: Option<String>,
    #[serde(alias = "start_time")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(alias = "end_time")]
    pub end_time: Option<DateTime<Utc>>,
    #[schema(value_type = Option<Object>)]
    pub input: Option<serde_json::Value>,
    #[schema(value_type = Option<Object>)]
    pub output: Option<serde_json::Value>,
    pub usage: Option<UsageInput>,
}

/// Usage and cost reported by the client.
///
/// Accepts OpenAI-style token counts (`prompt_tokens`, `completion_tokens`, `total_tokens`) as
/// aliases of `input`, `output` and `total`.
#[serde_as]
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UsageInput {
    #[serde(default, alias = "prompt_tokens", alias = "promptTokens")]
    pub input: Option<i64>,
    #[serde(default, alias = "completion_tokens", alias = "completionTokens")]
    pub output: Option<i64>,
    #[serde(default, alias = "total_tokens", alias = "totalTokens")]
    pub total: Option<i64>,
    /// Case-insensitive, defaults to TOKENS for new generations
    #[serde_as(as = "Option<DisplayFromStr>")]
    #[schema(value_type = Option<UsageUnit>)]
    pub unit: Option<UsageUnit>,
    /// Input cost in USD
    #[serde(default, alias = "input_cost")]
    #[schema(value_type = Option<f64>)]
    pub input_cost: Option<Decimal>,
    #[serde(default, alias = "output_cost")]
    #[schema(value_type = Option<f64>)]
    pub output_cost: Option<Decimal>,
    #[serde(default, alias = "total_cost")]
    #[schema(value_type = Option<f64>)]
    pub total_cost: Option<Decimal>,
}

impl UsageInput {
    fn validate(&self) -> Result<(), String> {
        let counts = [("input", self.input), ("output", self.output), ("total", self.total)];
        if let Some((name, _)) = counts.iter().find(|(_, count)| count.is_some_and(|c| c < 0)) {
            return Err(format!("usage.{name} must not be negative"));
        }
        let costs = [
            ("inputCost", self.input_cost),
            ("outputCost", self.output_cost),
            ("totalCost", self.total_cost),
        ];
        if let Some((name, _)) = costs.iter().find(|(_, cost)| cost.is_some_and(|c| c.is_sign_negative())) {
            return Err(format!("usage.{name} must not be negative"));
        }
        Ok(())
    }
}

impl IngestionEvent {
    /// Parse one raw batch entry.
    pub fn parse(value: serde_json::Value) -> Result<Self, String> {
        serde_json::from_value(value).map_err(|e| format!("Invalid event: {e}"))
    }

    /// Validate the event and turn it into what the ingestion queue carries.
    pub fn into_generation_event(self) -> Result<GenerationEvent, String> {
        let body = self.body;
        if body.id.trim().is_empty() {
            return Err("body.id must not be empty".to_string());
        }
        if let (Some(start), Some(end)) = (body.start_time, body.end_time)
            && end < start
        {
            return Err("body.endTime must not be before body.startTime".to_string());
        }

        let usage = body.usage.unwrap_or_default();
        usage.validate()?;

        Ok(GenerationEvent {
            event_id: self.id,
            kind: self.kind.into(),
            timestamp: self.timestamp,
            id: body.id,
            trace_id: body.trace_id,
            name: body.name,
            model: body.model,
            unit: usage.unit,
            start_time: body.start_time,
            end_time: body.end_time,
            input: body.input,
            output: body.output,
            usage: UsageDetails {
                input: usage.input,
                output: usage.output,
                total: usage.total,
            },
            cost: CostDetails {
                input: usage.input_cost,
                output: usage.output_cost,
                total: usage.total_cost,
            },
        })
    }
}

/// Best-effort event id of a raw entry, for reporting entries that failed to parse
pub fn raw_event_id(value: &serde_json::Value) -> String {
    value.get("id").and_then(|id| id.as_str()).unwrap_or_default().to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct IngestionSuccess {
    pub id: String,
    pub status: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct IngestionFailure {
    pub id: String,
    pub status: u16,
    pub message: String,
}

/// Per-event outcome of a batch, returned with status 207
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct IngestionResponse {
    pub successes: Vec<IngestionSuccess>,
    pub errors: Vec<IngestionFailure>,
}
