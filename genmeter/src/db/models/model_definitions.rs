use crate::types::{ModelDefinitionId, ProjectId};
use crate::usage::{UsageUnit, tokenizer};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Settings for the tokenizer attached to a model definition.
///
/// `tokens_per_message` and `tokens_per_name` describe how chat-formatted input is framed by the
/// provider; `tokenizer_model` selects the BPE encoding; `path` points at a `tokenizer.json` for
/// HuggingFace tokenizers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TokenizerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_per_message: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_per_name: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokenizer_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Database request for creating a model definition
#[derive(Debug, Clone)]
pub struct ModelDefinitionCreateDBRequest {
    /// `None` for system-maintained definitions
    pub project_id: Option<ProjectId>,
    pub model_name: String,
    pub match_pattern: String,
    pub unit: UsageUnit,
    pub start_time: Option<DateTime<Utc>>,
    pub input_price: Option<Decimal>,
    pub output_price: Option<Decimal>,
    pub total_price: Option<Decimal>,
    pub tokenizer_id: Option<String>,
    pub tokenizer_config: Option<TokenizerConfig>,
    pub hidden_reasoning: bool,
}

impl ModelDefinitionCreateDBRequest {
    /// Check a definition before it is stored. Returns a message suitable for API clients.
    pub fn validate(&self) -> Result<(), String> {
        if self.model_name.trim().is_empty() {
            return Err("modelName must not be empty".to_string());
        }
        regex::Regex::new(&self.match_pattern).map_err(|e| format!("Invalid matchPattern: {e}"))?;

        let prices = [
            ("inputPrice", self.input_price),
            ("outputPrice", self.output_price),
            ("totalPrice", self.total_price),
        ];
        if let Some((name, _)) = prices.iter().find(|(_, price)| price.is_some_and(|p| p.is_sign_negative())) {
            return Err(format!("{name} must not be negative"));
        }

        match self.tokenizer_id.as_deref() {
            Some(_) if self.unit != UsageUnit::Tokens => {
                Err(format!("A tokenizer can only be attached to {} definitions", UsageUnit::Tokens))
            }
            Some(tokenizer_id) => tokenizer::validate(tokenizer_id, self.tokenizer_config.as_ref()).map_err(|e| e.to_string()),
            None if self.tokenizer_config.is_some() => Err("tokenizerConfig requires a tokenizerId".to_string()),
            None => Ok(()),
        }
    }
}

/// Database request for a price-only update. `Some(None)` clears a price.
#[derive(Debug, Clone, Default)]
pub struct ModelDefinitionUpdateDBRequest {
    pub input_price: Option<Option<Decimal>>,
    pub output_price: Option<Option<Decimal>>,
    pub total_price: Option<Option<Decimal>>,
}

/// Database response for a model definition
#[derive(Debug, Clone, PartialEq)]
pub struct ModelDefinitionDBResponse {
    pub id: ModelDefinitionId,
    pub project_id: Option<ProjectId>,
    pub model_name: String,
    pub match_pattern: String,
    pub unit: UsageUnit,
    pub start_time: Option<DateTime<Utc>>,
    pub input_price: Option<Decimal>,
    pub output_price: Option<Decimal>,
    pub total_price: Option<Decimal>,
    pub tokenizer_id: Option<String>,
    pub tokenizer_config: Option<TokenizerConfig>,
    pub hidden_reasoning: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ModelDefinitionDBResponse {
    pub fn is_system_maintained(&self) -> bool {
        self.project_id.is_none()
    }

    /// Whether the definition can be seen (and matched) from the given project
    pub fn is_visible_to(&self, project_id: &str) -> bool {
        match &self.project_id {
            None => true,
            Some(owner) => owner == project_id,
        }
    }

    pub fn has_prices(&self) -> bool {
        self.input_price.is_some() || self.output_price.is_some() || self.total_price.is_some()
    }
}

impl ModelDefinitionUpdateDBRequest {
    pub fn apply_to(&self, definition: &mut ModelDefinitionDBResponse) {
        if let Some(price) = self.input_price {
            definition.input_price = price;
        }
        if let Some(price) = self.output_price {
            definition.output_price = price;
        }
        if let Some(price) = self.total_price {
            definition.total_price = price;
        }
    }
}
