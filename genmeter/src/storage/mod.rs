//! Persistence backends for model definitions and generations.
//!
//! Everything above this module (API handlers, the ingestion worker, the model catalog) talks to
//! a [`Storage`] trait object. Two implementations exist:
//!
//! - [`postgres::PostgresStorage`]: production backend on top of the [`crate::db`] repositories.
//! - [`in_memory::InMemoryStorage`]: lock-protected maps for tests and single-process setups.
//!   Nothing survives a restart.
//!
//! Both backends enforce the same rules: system-maintained model definitions can only change
//! through [`Storage::upsert_system_model_definition`], and deleting a definition unlinks the
//! generations resolved against it.

use crate::db::errors::Result;
use crate::db::handlers::generations::{GenerationCostUpdateDBRequest, GenerationFilter};
use crate::db::handlers::model_definitions::ModelDefinitionFilter;
use crate::db::models::generations::{GenerationDBResponse, GenerationUpsertDBRequest};
use crate::db::models::model_definitions::{
    ModelDefinitionCreateDBRequest, ModelDefinitionDBResponse, ModelDefinitionUpdateDBRequest,
};
use crate::types::{GenerationKey, ModelDefinitionId};

pub mod in_memory;
pub mod postgres;

#[cfg(test)]
mod tests;

pub use in_memory::InMemoryStorage;
pub use postgres::PostgresStorage;

#[async_trait::async_trait]
pub trait Storage: Send + Sync {
    /// Create a model definition. The request decides the scope: `project_id = None` creates a
    /// system-maintained definition.
    async fn create_model_definition(&self, request: &ModelDefinitionCreateDBRequest) -> Result<ModelDefinitionDBResponse>;

    async fn get_model_definition(&self, id: ModelDefinitionId) -> Result<Option<ModelDefinitionDBResponse>>;

    /// List definitions ordered user-defined first, then by model name and start time.
    async fn list_model_definitions(&self, filter: &ModelDefinitionFilter) -> Result<Vec<ModelDefinitionDBResponse>>;

    async fn count_model_definitions(&self, filter: &ModelDefinitionFilter) -> Result<i64>;

    /// Change the prices of a user-defined definition.
    ///
    /// # Errors
    /// - `NotFound` if the definition doesn't exist
    /// - `ProtectedEntity` if it is system-maintained
    async fn update_model_definition(
        &self,
        id: ModelDefinitionId,
        request: &ModelDefinitionUpdateDBRequest,
    ) -> Result<ModelDefinitionDBResponse>;

    /// Delete a user-defined definition. Generations that resolved against it keep their values
    /// but lose the link.
    ///
    /// # Errors
    /// - `NotFound` if the definition doesn't exist
    /// - `ProtectedEntity` if it is system-maintained
    async fn delete_model_definition(&self, id: ModelDefinitionId) -> Result<bool>;

    /// Insert or refresh a system-maintained definition, keyed by model name, unit and start
    /// time. An existing definition keeps its id.
    async fn upsert_system_model_definition(&self, request: &ModelDefinitionCreateDBRequest) -> Result<ModelDefinitionDBResponse>;

    async fn get_generation(&self, key: &GenerationKey) -> Result<Option<GenerationDBResponse>>;

    /// Write the complete generation. With `expected_revision = None` the key must be new; with
    /// `Some(revision)` the stored row is replaced only if it is still at that revision.
    ///
    /// # Errors
    /// - `StaleRevision` if another writer got there first
    async fn upsert_generation(&self, request: &GenerationUpsertDBRequest) -> Result<GenerationDBResponse>;

    /// List generations of a project, newest start time first.
    async fn list_generations(&self, filter: &GenerationFilter) -> Result<Vec<GenerationDBResponse>>;

    async fn count_generations(&self, filter: &GenerationFilter) -> Result<i64>;

    /// Replace only the calculated cost of several generations, atomically. Keys that no longer
    /// exist are skipped. Returns the number of rows written.
    async fn update_generation_costs(&self, updates: &[(GenerationKey, GenerationCostUpdateDBRequest)]) -> Result<u64>;
}
