//! Usage and cost inference.
//!
//! Generations arrive with whatever usage and cost the client knew about. Anything missing is
//! inferred asynchronously by the ingestion worker:
//!
//! 1. [`matcher`] picks the model definition that applies to the generation (name pattern, unit,
//!    validity start date, project scope).
//! 2. [`resolver`] tokenizes the recorded input/output when no usage was ingested and prices the
//!    usage with the matched definition.
//!
//! Ingested ("provided") and inferred ("calculated") values are kept apart everywhere. The value
//! reported for a field is `provided.or(calculated)`, so inference can never replace something
//! the client sent.

pub mod matcher;
pub mod resolver;
pub mod tokenizer;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use utoipa::ToSchema;

pub use matcher::ModelCatalog;
pub use resolver::{Resolution, resolve};

/// Unit in which a generation's usage is counted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum UsageUnit {
    #[default]
    Tokens,
    Characters,
    Milliseconds,
    Seconds,
    Images,
}

impl UsageUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageUnit::Tokens => "TOKENS",
            UsageUnit::Characters => "CHARACTERS",
            UsageUnit::Milliseconds => "MILLISECONDS",
            UsageUnit::Seconds => "SECONDS",
            UsageUnit::Images => "IMAGES",
        }
    }
}

impl fmt::Display for UsageUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UsageUnit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "TOKENS" => Ok(UsageUnit::Tokens),
            "CHARACTERS" => Ok(UsageUnit::Characters),
            "MILLISECONDS" => Ok(UsageUnit::Milliseconds),
            "SECONDS" => Ok(UsageUnit::Seconds),
            "IMAGES" => Ok(UsageUnit::Images),
            other => Err(format!("unknown usage unit '{other}'")),
        }
    }
}

/// Input/output/total usage counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct UsageDetails {
    pub input: Option<i64>,
    pub output: Option<i64>,
    pub total: Option<i64>,
}

impl UsageDetails {
    pub fn is_empty(&self) -> bool {
        self.input.is_none() && self.output.is_none() && self.total.is_none()
    }

    /// Field-wise merge where `self` wins.
    pub fn or(&self, other: &UsageDetails) -> UsageDetails {
        UsageDetails {
            input: self.input.or(other.input),
            output: self.output.or(other.output),
            total: self.total.or(other.total),
        }
    }
}

/// Input/output/total cost in USD.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct CostDetails {
    pub input: Option<Decimal>,
    pub output: Option<Decimal>,
    pub total: Option<Decimal>,
}

impl CostDetails {
    pub fn is_empty(&self) -> bool {
        self.input.is_none() && self.output.is_none() && self.total.is_none()
    }

    /// Field-wise merge where `self` wins.
    pub fn or(&self, other: &CostDetails) -> CostDetails {
        CostDetails {
            input: self.input.or(other.input),
            output: self.output.or(other.output),
            total: self.total.or(other.total),
        }
    }
}

/// Where the reported value of a usage or cost field came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ValueSource {
    Ingested,
    Inferred,
    Absent,
}

impl ValueSource {
    pub fn of<T>(provided: &Option<T>, calculated: &Option<T>) -> Self {
        match (provided, calculated) {
            (Some(_), _) => ValueSource::Ingested,
            (None, Some(_)) => ValueSource::Inferred,
            (None, None) => ValueSource::Absent,
        }
    }
}

/// Whether an ingestion event creates a generation or updates an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GenerationEventKind {
    GenerationCreate,
    GenerationUpdate,
}

/// A validated generation event as carried through the ingestion queue.
///
/// Every field except the id is optional: update events only carry what changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationEvent {
    pub event_id: String,
    pub kind: GenerationEventKind,
    pub timestamp: DateTime<Utc>,
    pub id: String,
    pub trace_id: Option<String>,
    pub name: Option<String>,
    pub model: Option<String>,
    pub unit: Option<UsageUnit>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub input: Option<serde_json::Value>,
    pub output: Option<serde_json::Value>,
    #[serde(default)]
    pub usage: UsageDetails,
    #[serde(default)]
    pub cost: CostDetails,
}
