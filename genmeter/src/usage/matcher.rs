//! Model definition matching.
//!
//! A generation matches a definition when the definition's `match_pattern` regex matches the
//! generation's model name and both use the same usage unit. Definitions with a `start_time` only
//! apply to generations that started at or after it.
//!
//! Among all matches the winner is picked by, in order:
//!
//! 1. scope: a project's own definitions beat system-maintained ones, whatever their dates
//! 2. recency: the latest `start_time`, with undated definitions ranking below any dated one
//! 3. id: the lowest id, so the choice never depends on catalog order
//!
//! Patterns are compiled once when a [`ModelCatalog`] is built. A pattern that fails to compile
//! only removes its own definition from matching.

use crate::db::models::model_definitions::ModelDefinitionDBResponse;
use crate::usage::UsageUnit;
use chrono::{DateTime, Utc};
use regex::Regex;
use std::cmp::Ordering;
use tracing::warn;

/// A definition with its compiled pattern.
#[derive(Debug, Clone)]
pub struct CompiledDefinition {
    pub definition: ModelDefinitionDBResponse,
    pattern: Regex,
}

impl CompiledDefinition {
    pub fn compile(definition: ModelDefinitionDBResponse) -> Result<Self, regex::Error> {
        let pattern = Regex::new(&definition.match_pattern)?;
        Ok(Self { definition, pattern })
    }

    fn applies_to(&self, project_id: &str, model: &str, unit: UsageUnit, at: DateTime<Utc>) -> bool {
        self.definition.is_visible_to(project_id)
            && self.definition.unit == unit
            && self.definition.start_time.is_none_or(|start| start <= at)
            && self.pattern.is_match(model)
    }
}

/// Immutable snapshot of all model definitions, ready for matching.
#[derive(Debug, Clone, Default)]
pub struct ModelCatalog {
    definitions: Vec<CompiledDefinition>,
}

impl ModelCatalog {
    /// Compile a catalog, skipping definitions whose pattern is not a valid regex.
    pub fn compile(definitions: impl IntoIterator<Item = ModelDefinitionDBResponse>) -> Self {
        let definitions = definitions
            .into_iter()
            .filter_map(|definition| {
                let id = definition.id;
                let pattern = definition.match_pattern.clone();
                match CompiledDefinition::compile(definition) {
                    Ok(compiled) => Some(compiled),
                    Err(e) => {
                        warn!(model_definition_id = %id, pattern = %pattern, "Skipping model definition with invalid pattern: {}", e);
                        None
                    }
                }
            })
            .collect();
        Self { definitions }
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    pub fn get(&self, id: uuid::Uuid) -> Option<&ModelDefinitionDBResponse> {
        self.definitions.iter().map(|d| &d.definition).find(|d| d.id == id)
    }

    /// Find the best definition for a generation, or `None` when nothing applies.
    pub fn find_match(
        &self,
        project_id: &str,
        model: &str,
        unit: UsageUnit,
        at: DateTime<Utc>,
    ) -> Option<&ModelDefinitionDBResponse> {
        self.definitions
            .iter()
            .filter(|candidate| candidate.applies_to(project_id, model, unit, at))
            .map(|candidate| &candidate.definition)
            .max_by(|a, b| precedence(a, b))
    }
}

/// Total order over candidates; the greatest one wins.
fn precedence(a: &ModelDefinitionDBResponse, b: &ModelDefinitionDBResponse) -> Ordering {
    let scope = a.project_id.is_some().cmp(&b.project_id.is_some());
    // Option<DateTime> orders None below Some
    let recency = a.start_time.cmp(&b.start_time);
    // lower id wins, so reverse
    let id = b.id.cmp(&a.id);
    scope.then(recency).then(id)
}
