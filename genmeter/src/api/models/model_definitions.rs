//! API request/response models for model definitions.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_with::rust::double_option;
use utoipa::ToSchema;

use crate::db::models::model_definitions::{
    ModelDefinitionCreateDBRequest, ModelDefinitionDBResponse, ModelDefinitionUpdateDBRequest, TokenizerConfig,
};
use crate::types::{ModelDefinitionId, ProjectId};
use crate::usage::UsageUnit;

/// The data required to create a user-defined model definition
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ModelDefinitionCreate {
    /// Display name, e.g. "gpt-4o"
    pub model_name: String,
    /// Regular expression matched against the generation's model name. Unanchored and case
    /// sensitive unless the pattern says otherwise, e.g. `(?i)^gpt-4o$`.
    pub match_pattern: String,
    #[serde(default)]
    pub unit: UsageUnit,
    /// Prices apply to generations starting at or after this time
    pub start_time: Option<DateTime<Utc>>,
    /// USD per input unit
    #[schema(value_type = Option<f64>)]
    pub input_price: Option<Decimal>,
    /// USD per output unit
    #[schema(value_type = Option<f64>)]
    pub output_price: Option<Decimal>,
    /// USD per unit of total usage; only used when no part price is set
    #[schema(value_type = Option<f64>)]
    pub total_price: Option<Decimal>,
    /// `openai` or `huggingface`
    pub tokenizer_id: Option<String>,
    pub tokenizer_config: Option<TokenizerConfig>,
    /// Output is billed with hidden reasoning tokens; usage is never inferred
    #[serde(default)]
    pub hidden_reasoning: bool,
}

impl ModelDefinitionCreate {
    pub fn into_db_request(self, project_id: ProjectId) -> ModelDefinitionCreateDBRequest {
        ModelDefinitionCreateDBRequest {
            project_id: Some(project_id),
            model_name: self.model_name,
            match_pattern: self.match_pattern,
            unit: self.unit,
            start_time: self.start_time,
            input_price: self.input_price,
            output_price: self.output_price,
            total_price: self.total_price,
            tokenizer_id: self.tokenizer_id,
            tokenizer_config: self.tokenizer_config,
            hidden_reasoning: self.hidden_reasoning,
        }
    }
}

/// Price-only update. Matching fields cannot change; create a new definition with a later
/// `startTime` instead.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ModelDefinitionUpdate {
    /// None = no change, Some(None) = clear, Some(price) = set
    #[serde(default, skip_serializing_if = "Option::is_none", with = "double_option")]
    #[schema(value_type = Option<f64>)]
    pub input_price: Option<Option<Decimal>>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "double_option")]
    #[schema(value_type = Option<f64>)]
    pub output_price: Option<Option<Decimal>>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "double_option")]
    #[schema(value_type = Option<f64>)]
    pub total_price: Option<Option<Decimal>>,
}

impl ModelDefinitionUpdate {
    pub fn validate(&self) -> Result<(), String> {
        let prices = [
            ("inputPrice", self.input_price),
            ("outputPrice", self.output_price),
            ("totalPrice", self.total_price),
        ];
        match prices
            .iter()
            .find(|(_, price)| price.flatten().is_some_and(|p| p.is_sign_negative()))
        {
            Some((name, _)) => Err(format!("{name} must not be negative")),
            None => Ok(()),
        }
    }
}

impl From<ModelDefinitionUpdate> for ModelDefinitionUpdateDBRequest {
    fn from(update: ModelDefinitionUpdate) -> Self {
        Self {
            input_price: update.input_price,
            output_price: update.output_price,
            total_price: update.total_price,
        }
    }
}

/// Who maintains a definition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ModelDefinitionScope {
    System,
    Project,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ModelDefinitionResponse {
    #[schema(value_type = String, format = "uuid")]
    pub id: ModelDefinitionId,
    pub scope: ModelDefinitionScope,
    /// Owning project, absent for system-maintained definitions
    pub project_id: Option<ProjectId>,
    pub model_name: String,
    pub match_pattern: String,
    pub unit: UsageUnit,
    pub start_time: Option<DateTime<Utc>>,
    #[schema(value_type = Option<f64>)]
    pub input_price: Option<Decimal>,
    #[schema(value_type = Option<f64>)]
    pub output_price: Option<Decimal>,
    #[schema(value_type = Option<f64>)]
    pub total_price: Option<Decimal>,
    pub tokenizer_id: Option<String>,
    pub tokenizer_config: Option<TokenizerConfig>,
    pub hidden_reasoning: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<ModelDefinitionDBResponse> for ModelDefinitionResponse {
    fn from(db: ModelDefinitionDBResponse) -> Self {
        let scope = if db.is_system_maintained() {
            ModelDefinitionScope::System
        } else {
            ModelDefinitionScope::Project
        };
        Self {
            id: db.id,
            scope,
            project_id: db.project_id,
            model_name: db.model_name,
            match_pattern: db.match_pattern,
            unit: db.unit,
            start_time: db.start_time,
            input_price: db.input_price,
            output_price: db.output_price,
            total_price: db.total_price,
            tokenizer_id: db.tokenizer_id,
            tokenizer_config: db.tokenizer_config,
            hidden_reasoning: db.hidden_reasoning,
            created_at: db.created_at,
            updated_at: db.updated_at,
        }
    }
}

/// Result of recomputing costs after a price change
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RepriceResponse {
    #[schema(value_type = String, format = "uuid")]
    pub model_definition_id: ModelDefinitionId,
    /// Generations resolved against the definition
    pub matched: i64,
    /// Generations whose calculated cost changed
    pub updated: i64,
}
