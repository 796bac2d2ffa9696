//! In-memory storage backend.
//!
//! Suitable for tests and single-process development. All data is lost on restart.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::db::errors::{DbError, Result};
use crate::db::handlers::generations::{GenerationCostUpdateDBRequest, GenerationFilter};
use crate::db::handlers::model_definitions::ModelDefinitionFilter;
use crate::db::models::generations::{GenerationDBResponse, GenerationUpsertDBRequest};
use crate::db::models::model_definitions::{
    ModelDefinitionCreateDBRequest, ModelDefinitionDBResponse, ModelDefinitionUpdateDBRequest,
};
use crate::storage::Storage;
use crate::types::{GenerationKey, ModelDefinitionId, Operation};

#[derive(Default)]
struct Tables {
    model_definitions: HashMap<ModelDefinitionId, ModelDefinitionDBResponse>,
    generations: HashMap<GenerationKey, GenerationDBResponse>,
}

/// Maps behind a single lock, so multi-table operations (deleting a definition and unlinking its
/// generations) are atomic.
#[derive(Clone, Default)]
pub struct InMemoryStorage {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Tables {
    fn user_defined_mut(&mut self, id: ModelDefinitionId, operation: Operation) -> Result<&mut ModelDefinitionDBResponse> {
        let definition = self.model_definitions.get_mut(&id).ok_or(DbError::NotFound)?;
        if definition.is_system_maintained() {
            return Err(DbError::system_model(operation, id));
        }
        Ok(definition)
    }
}

fn paginate<T>(items: Vec<T>, skip: i64, limit: Option<i64>) -> Vec<T> {
    let skip = usize::try_from(skip).unwrap_or(0);
    let limit = limit.and_then(|l| usize::try_from(l).ok()).unwrap_or(usize::MAX);
    items.into_iter().skip(skip).take(limit).collect()
}

fn model_definition_visible(definition: &ModelDefinitionDBResponse, filter: &ModelDefinitionFilter) -> bool {
    match &filter.project_id {
        Some(project_id) => definition.is_visible_to(project_id),
        None => true,
    }
}

fn generation_matches(generation: &GenerationDBResponse, filter: &GenerationFilter) -> bool {
    generation.project_id == filter.project_id
        && filter.model.as_ref().is_none_or(|model| generation.model.as_ref() == Some(model))
        && filter
            .internal_model_id
            .is_none_or(|id| generation.internal_model_id == Some(id))
}

#[async_trait::async_trait]
impl Storage for InMemoryStorage {
    async fn create_model_definition(&self, request: &ModelDefinitionCreateDBRequest) -> Result<ModelDefinitionDBResponse> {
        let now = Utc::now();
        let definition = ModelDefinitionDBResponse {
            id: Uuid::new_v4(),
            project_id: request.project_id.clone(),
            model_name: request.model_name.clone(),
            match_pattern: request.match_pattern.clone(),
            unit: request.unit,
            start_time: request.start_time,
            input_price: request.input_price,
            output_price: request.output_price,
            total_price: request.total_price,
            tokenizer_id: request.tokenizer_id.clone(),
            tokenizer_config: request.tokenizer_config.clone(),
            hidden_reasoning: request.hidden_reasoning,
            created_at: now,
            updated_at: now,
        };
        self.tables
            .write()
            .model_definitions
            .insert(definition.id, definition.clone());
        Ok(definition)
    }

    async fn get_model_definition(&self, id: ModelDefinitionId) -> Result<Option<ModelDefinitionDBResponse>> {
        Ok(self.tables.read().model_definitions.get(&id).cloned())
    }

    async fn list_model_definitions(&self, filter: &ModelDefinitionFilter) -> Result<Vec<ModelDefinitionDBResponse>> {
        let mut definitions: Vec<_> = self
            .tables
            .read()
            .model_definitions
            .values()
            .filter(|d| model_definition_visible(d, filter))
            .cloned()
            .collect();
        definitions.sort_by(|a, b| {
            (a.project_id.is_none(), &a.model_name, a.start_time, a.id).cmp(&(
                b.project_id.is_none(),
                &b.model_name,
                b.start_time,
                b.id,
            ))
        });
        Ok(paginate(definitions, filter.skip, filter.limit))
    }

    async fn count_model_definitions(&self, filter: &ModelDefinitionFilter) -> Result<i64> {
        let tables = self.tables.read();
        let count = tables
            .model_definitions
            .values()
            .filter(|d| model_definition_visible(d, filter))
            .count();
        Ok(count as i64)
    }

    async fn update_model_definition(
        &self,
        id: ModelDefinitionId,
        request: &ModelDefinitionUpdateDBRequest,
    ) -> Result<ModelDefinitionDBResponse> {
        let mut tables = self.tables.write();
        let definition = tables.user_defined_mut(id, Operation::Update)?;
        request.apply_to(definition);
        definition.updated_at = Utc::now();
        Ok(definition.clone())
    }

    async fn delete_model_definition(&self, id: ModelDefinitionId) -> Result<bool> {
        let mut tables = self.tables.write();
        tables.user_defined_mut(id, Operation::Delete)?;
        tables.model_definitions.remove(&id);
        for generation in tables.generations.values_mut() {
            if generation.internal_model_id == Some(id) {
                generation.internal_model_id = None;
            }
        }
        Ok(true)
    }

    async fn upsert_system_model_definition(&self, request: &ModelDefinitionCreateDBRequest) -> Result<ModelDefinitionDBResponse> {
        {
            let mut tables = self.tables.write();
            let existing = tables.model_definitions.values_mut().find(|d| {
                d.is_system_maintained()
                    && d.model_name == request.model_name
                    && d.unit == request.unit
                    && d.start_time == request.start_time
            });
            if let Some(definition) = existing {
                definition.match_pattern = request.match_pattern.clone();
                definition.input_price = request.input_price;
                definition.output_price = request.output_price;
                definition.total_price = request.total_price;
                definition.tokenizer_id = request.tokenizer_id.clone();
                definition.tokenizer_config = request.tokenizer_config.clone();
                definition.hidden_reasoning = request.hidden_reasoning;
                definition.updated_at = Utc::now();
                return Ok(definition.clone());
            }
        }

        let request = ModelDefinitionCreateDBRequest {
            project_id: None,
            ..request.clone()
        };
        self.create_model_definition(&request).await
    }

    async fn get_generation(&self, key: &GenerationKey) -> Result<Option<GenerationDBResponse>> {
        Ok(self.tables.read().generations.get(key).cloned())
    }

    async fn upsert_generation(&self, request: &GenerationUpsertDBRequest) -> Result<GenerationDBResponse> {
        let mut tables = self.tables.write();
        if let Some(id) = request.internal_model_id
            && !tables.model_definitions.contains_key(&id)
        {
            return Err(DbError::ForeignKeyViolation {
                constraint: Some("generations_internal_model_id_fkey".to_string()),
                table: Some("generations".to_string()),
                message: format!("model definition {id} does not exist"),
            });
        }

        let key = GenerationKey::new(request.project_id.clone(), request.id.clone());
        let existing = tables.generations.get(&key);
        if existing.map(|g| g.revision) != request.expected_revision {
            return Err(DbError::StaleRevision {
                entity_type: "generation".to_string(),
                entity_id: key.to_string(),
            });
        }

        let now = Utc::now();
        let created_at = existing.map_or(now, |g| g.created_at);
        let revision = existing.map_or(1, |g| g.revision + 1);
        let generation = GenerationDBResponse {
            project_id: request.project_id.clone(),
            id: request.id.clone(),
            trace_id: request.trace_id.clone(),
            name: request.name.clone(),
            model: request.model.clone(),
            unit: request.unit,
            start_time: request.start_time,
            end_time: request.end_time,
            input: request.input.clone(),
            output: request.output.clone(),
            provided_usage: request.provided_usage,
            provided_cost: request.provided_cost,
            calculated_usage: request.calculated_usage,
            calculated_cost: request.calculated_cost,
            internal_model_id: request.internal_model_id,
            revision,
            created_at,
            updated_at: now,
        };
        tables.generations.insert(key, generation.clone());
        Ok(generation)
    }

    async fn list_generations(&self, filter: &GenerationFilter) -> Result<Vec<GenerationDBResponse>> {
        let mut generations: Vec<_> = self
            .tables
            .read()
            .generations
            .values()
            .filter(|g| generation_matches(g, filter))
            .cloned()
            .collect();
        generations.sort_by(|a, b| b.start_time.cmp(&a.start_time).then_with(|| a.id.cmp(&b.id)));
        Ok(paginate(generations, filter.skip, filter.limit))
    }

    async fn count_generations(&self, filter: &GenerationFilter) -> Result<i64> {
        let tables = self.tables.read();
        let count = tables.generations.values().filter(|g| generation_matches(g, filter)).count();
        Ok(count as i64)
    }

    async fn update_generation_costs(&self, updates: &[(GenerationKey, GenerationCostUpdateDBRequest)]) -> Result<u64> {
        let mut tables = self.tables.write();
        let now = Utc::now();
        let mut written = 0;
        for (key, request) in updates {
            if let Some(generation) = tables.generations.get_mut(key) {
                generation.calculated_cost = request.calculated_cost;
                generation.revision += 1;
                generation.updated_at = now;
                written += 1;
            }
        }
        Ok(written)
    }
}
