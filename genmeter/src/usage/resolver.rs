//! Usage and cost resolution for a single generation.
//!
//! [`resolve`] is pure: it takes the ingested values and the matched definition and returns the
//! inferred ("calculated") values for every gap. Fields the client provided are never part of
//! the result, so callers can store the output next to the ingested values without any risk of
//! replacing them.

use crate::db::models::model_definitions::ModelDefinitionDBResponse;
use crate::usage::tokenizer;
use crate::usage::{CostDetails, UsageDetails};
use rust_decimal::Decimal;
use serde_json::Value;
use tracing::{debug, warn};

/// What the resolver needs to know about a generation.
#[derive(Debug, Clone, Copy)]
pub struct GenerationInput<'a> {
    pub model: Option<&'a str>,
    pub input: Option<&'a Value>,
    pub output: Option<&'a Value>,
    pub provided_usage: &'a UsageDetails,
    pub provided_cost: &'a CostDetails,
}

/// Inferred values. Each field is `None` when it was ingested or could not be inferred.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    pub usage: UsageDetails,
    pub cost: CostDetails,
}

/// Fill in missing usage and cost for a generation.
pub fn resolve(generation: GenerationInput<'_>, definition: Option<&ModelDefinitionDBResponse>) -> Resolution {
    let provided = generation.provided_usage;
    let mut usage = UsageDetails::default();

    if provided.is_empty()
        && let Some(definition) = definition
    {
        if definition.hidden_reasoning {
            debug!(
                model_definition_id = %definition.id,
                "Skipping usage inference for model with hidden reasoning tokens"
            );
        } else if let Some(tokenizer_id) = definition.tokenizer_id.as_deref() {
            let model = generation.model.unwrap_or(definition.model_name.as_str());
            let count = |payload: Option<&Value>| {
                payload
                    .map(|value| tokenizer::count_tokens(tokenizer_id, definition.tokenizer_config.as_ref(), model, value))
                    .transpose()
            };
            // a total over one side only would under-count, so one failure drops both
            match (count(generation.input), count(generation.output)) {
                (Ok(input), Ok(output)) => {
                    usage.input = input;
                    usage.output = output;
                }
                (Err(e), _) | (_, Err(e)) => {
                    warn!(tokenizer = %tokenizer_id, "Token counting failed, leaving usage absent: {}", e);
                }
            }
        }
    }

    if provided.total.is_none() {
        let effective = provided.or(&usage);
        let hidden_output_missing = definition.is_some_and(|d| d.hidden_reasoning) && effective.output.is_none();
        if !hidden_output_missing {
            usage.total = sum(effective.input, effective.output);
        }
    }

    let effective_usage = provided.or(&usage);
    let cost = price(&effective_usage, generation.provided_cost, definition);

    Resolution { usage, cost }
}

/// Compute the calculated cost for already known usage.
///
/// Only gaps in `provided_cost` are filled. A missing total is `total usage x total price` when
/// the definition carries a total price and the total usage is known, otherwise the sum of the
/// known parts.
pub fn price(usage: &UsageDetails, provided_cost: &CostDetails, definition: Option<&ModelDefinitionDBResponse>) -> CostDetails {
    let mut cost = CostDetails::default();

    if let Some(definition) = definition {
        if provided_cost.input.is_none() {
            cost.input = multiply(usage.input, definition.input_price);
        }
        if provided_cost.output.is_none() {
            cost.output = multiply(usage.output, definition.output_price);
        }
    }

    if provided_cost.total.is_none() {
        let effective = provided_cost.or(&cost);
        let hidden_output_missing = definition.is_some_and(|d| d.hidden_reasoning) && effective.output.is_none();
        cost.total = match definition.and_then(|d| d.total_price) {
            Some(total_price) if usage.total.is_some() => multiply(usage.total, Some(total_price)),
            _ if hidden_output_missing => None,
            _ => sum(effective.input, effective.output),
        };
    }

    cost
}

fn multiply(units: Option<i64>, unit_price: Option<Decimal>) -> Option<Decimal> {
    Some(Decimal::from(units?) * unit_price?)
}

fn sum<T: std::ops::Add<Output = T> + Copy>(a: Option<T>, b: Option<T>) -> Option<T> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a + b),
        (Some(v), None) | (None, Some(v)) => Some(v),
        (None, None) => None,
    }
}
