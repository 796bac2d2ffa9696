//! PostgreSQL storage backend.

use sqlx::PgPool;
use tracing::instrument;

use crate::db::errors::{DbError, Result};
use crate::db::handlers::generations::{GenerationCostUpdateDBRequest, GenerationFilter};
use crate::db::handlers::model_definitions::ModelDefinitionFilter;
use crate::db::handlers::{Generations, ModelDefinitions, Repository};
use crate::db::models::generations::{GenerationDBResponse, GenerationUpsertDBRequest};
use crate::db::models::model_definitions::{
    ModelDefinitionCreateDBRequest, ModelDefinitionDBResponse, ModelDefinitionUpdateDBRequest,
};
use crate::storage::Storage;
use crate::types::{GenerationKey, ModelDefinitionId, abbrev_uuid};

/// Storage on a postgres connection pool.
///
/// Every call checks out a connection and runs through the matching repository. Operations that
/// read before they write (protection checks, system upserts) run in a transaction.
#[derive(Clone)]
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    /// ```ignore
    /// let pool = PgPool::connect("postgresql://localhost/genmeter").await?;
    /// let storage = PostgresStorage::new(pool);
    /// ```
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl Storage for PostgresStorage {
    async fn create_model_definition(&self, request: &ModelDefinitionCreateDBRequest) -> Result<ModelDefinitionDBResponse> {
        let mut conn = self.pool.acquire().await?;
        ModelDefinitions::new(&mut conn).create(request).await
    }

    async fn get_model_definition(&self, id: ModelDefinitionId) -> Result<Option<ModelDefinitionDBResponse>> {
        let mut conn = self.pool.acquire().await?;
        ModelDefinitions::new(&mut conn).get_by_id(id).await
    }

    async fn list_model_definitions(&self, filter: &ModelDefinitionFilter) -> Result<Vec<ModelDefinitionDBResponse>> {
        let mut conn = self.pool.acquire().await?;
        ModelDefinitions::new(&mut conn).list(filter).await
    }

    async fn count_model_definitions(&self, filter: &ModelDefinitionFilter) -> Result<i64> {
        let mut conn = self.pool.acquire().await?;
        ModelDefinitions::new(&mut conn).count(filter).await
    }

    #[instrument(skip(self, request), fields(model_definition_id = %abbrev_uuid(&id)), err)]
    async fn update_model_definition(
        &self,
        id: ModelDefinitionId,
        request: &ModelDefinitionUpdateDBRequest,
    ) -> Result<ModelDefinitionDBResponse> {
        let mut tx = self.pool.begin().await?;
        let updated = ModelDefinitions::new(&mut tx).update(id, request).await?;
        tx.commit().await?;
        Ok(updated)
    }

    #[instrument(skip(self), fields(model_definition_id = %abbrev_uuid(&id)), err)]
    async fn delete_model_definition(&self, id: ModelDefinitionId) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let deleted = ModelDefinitions::new(&mut tx).delete(id).await?;
        tx.commit().await?;
        Ok(deleted)
    }

    #[instrument(skip(self, request), fields(model_name = %request.model_name), err)]
    async fn upsert_system_model_definition(&self, request: &ModelDefinitionCreateDBRequest) -> Result<ModelDefinitionDBResponse> {
        let mut tx = self.pool.begin().await?;
        let definition = ModelDefinitions::new(&mut tx).upsert_system(request).await?;
        tx.commit().await?;
        Ok(definition)
    }

    async fn get_generation(&self, key: &GenerationKey) -> Result<Option<GenerationDBResponse>> {
        let mut conn = self.pool.acquire().await?;
        Generations::new(&mut conn).get_by_id(key.clone()).await
    }

    async fn upsert_generation(&self, request: &GenerationUpsertDBRequest) -> Result<GenerationDBResponse> {
        let mut conn = self.pool.acquire().await?;
        Generations::new(&mut conn).create(request).await
    }

    async fn list_generations(&self, filter: &GenerationFilter) -> Result<Vec<GenerationDBResponse>> {
        let mut conn = self.pool.acquire().await?;
        Generations::new(&mut conn).list(filter).await
    }

    async fn count_generations(&self, filter: &GenerationFilter) -> Result<i64> {
        let mut conn = self.pool.acquire().await?;
        Generations::new(&mut conn).count(filter).await
    }

    #[instrument(skip(self, updates), fields(count = updates.len()), err)]
    async fn update_generation_costs(&self, updates: &[(GenerationKey, GenerationCostUpdateDBRequest)]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut written = 0;
        {
            let mut repo = Generations::new(&mut tx);
            for (key, request) in updates {
                match repo.update(key.clone(), request).await {
                    Ok(_) => written += 1,
                    Err(DbError::NotFound) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        tx.commit().await?;
        Ok(written)
    }
}
