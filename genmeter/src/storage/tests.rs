use chrono::{Duration, Utc};
use rstest::{fixture, rstest};
use rust_decimal::Decimal;

use crate::db::errors::DbError;
use crate::db::handlers::generations::{GenerationCostUpdateDBRequest, GenerationFilter};
use crate::db::handlers::model_definitions::ModelDefinitionFilter;
use crate::db::models::generations::GenerationUpsertDBRequest;
use crate::db::models::model_definitions::{ModelDefinitionCreateDBRequest, ModelDefinitionUpdateDBRequest};
use crate::storage::{InMemoryStorage, PostgresStorage, Storage};
use crate::types::GenerationKey;
use crate::usage::{CostDetails, UsageDetails, UsageUnit};

fn dec(s: &str) -> Decimal {
    s.parse().unwrap()
}

fn definition_request(project_id: Option<&str>, model_name: &str) -> ModelDefinitionCreateDBRequest {
    ModelDefinitionCreateDBRequest {
        project_id: project_id.map(str::to_string),
        model_name: model_name.to_string(),
        match_pattern: format!("^{model_name}$"),
        unit: UsageUnit::Tokens,
        start_time: None,
        input_price: Some(dec("0.000001")),
        output_price: Some(dec("0.000002")),
        total_price: None,
        tokenizer_id: None,
        tokenizer_config: None,
        hidden_reasoning: false,
    }
}

fn generation_request(project_id: &str, id: &str, minutes_ago: i64) -> GenerationUpsertDBRequest {
    GenerationUpsertDBRequest {
        project_id: project_id.to_string(),
        id: id.to_string(),
        trace_id: None,
        name: None,
        model: Some("gpt-4o".to_string()),
        unit: UsageUnit::Tokens,
        start_time: Utc::now() - Duration::minutes(minutes_ago),
        end_time: None,
        input: None,
        output: None,
        provided_usage: UsageDetails {
            input: Some(100),
            output: Some(50),
            total: None,
        },
        provided_cost: CostDetails::default(),
        calculated_usage: UsageDetails {
            input: None,
            output: None,
            total: Some(150),
        },
        calculated_cost: CostDetails::default(),
        internal_model_id: None,
        expected_revision: None,
    }
}

/// Fixture that returns InMemoryStorage
#[fixture]
fn in_memory_storage() -> InMemoryStorage {
    InMemoryStorage::new()
}

async fn run_test_model_definition_visibility<S: Storage>(storage: &S) {
    storage.create_model_definition(&definition_request(None, "gpt-4o")).await.unwrap();
    storage
        .create_model_definition(&definition_request(Some("p1"), "mine"))
        .await
        .unwrap();
    storage
        .create_model_definition(&definition_request(Some("p2"), "theirs"))
        .await
        .unwrap();

    let filter = ModelDefinitionFilter::new(Some("p1".to_string()), 0, 10);
    let names: Vec<_> = storage
        .list_model_definitions(&filter)
        .await
        .unwrap()
        .into_iter()
        .map(|d| d.model_name)
        .collect();
    assert_eq!(names, vec!["mine".to_string(), "gpt-4o".to_string()]);
    assert_eq!(storage.count_model_definitions(&filter).await.unwrap(), 2);
    assert_eq!(
        storage
            .count_model_definitions(&ModelDefinitionFilter::all())
            .await
            .unwrap(),
        3
    );

    let page = storage
        .list_model_definitions(&ModelDefinitionFilter::new(Some("p1".to_string()), 1, 10))
        .await
        .unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].model_name, "gpt-4o");
}

#[rstest]
#[tokio::test]
async fn test_model_definition_visibility(in_memory_storage: InMemoryStorage) {
    run_test_model_definition_visibility(&in_memory_storage).await;
}

#[sqlx::test]
#[ignore = "requires postgres"]
async fn test_model_definition_visibility_postgres(pool: sqlx::PgPool) {
    run_test_model_definition_visibility(&PostgresStorage::new(pool)).await;
}

async fn run_test_system_definitions_are_protected<S: Storage>(storage: &S) {
    let system = storage
        .upsert_system_model_definition(&definition_request(None, "gpt-4o"))
        .await
        .unwrap();

    let deleted = storage.delete_model_definition(system.id).await;
    assert!(matches!(deleted, Err(DbError::ProtectedEntity { .. })));

    let update = ModelDefinitionUpdateDBRequest {
        input_price: Some(Some(dec("1"))),
        ..Default::default()
    };
    let updated = storage.update_model_definition(system.id, &update).await;
    assert!(matches!(updated, Err(DbError::ProtectedEntity { .. })));

    let missing = storage.delete_model_definition(uuid::Uuid::new_v4()).await;
    assert!(matches!(missing, Err(DbError::NotFound)));
}

#[rstest]
#[tokio::test]
async fn test_system_definitions_are_protected(in_memory_storage: InMemoryStorage) {
    run_test_system_definitions_are_protected(&in_memory_storage).await;
}

#[sqlx::test]
#[ignore = "requires postgres"]
async fn test_system_definitions_are_protected_postgres(pool: sqlx::PgPool) {
    run_test_system_definitions_are_protected(&PostgresStorage::new(pool)).await;
}

async fn run_test_upsert_system_keeps_id<S: Storage>(storage: &S) {
    let first = storage
        .upsert_system_model_definition(&definition_request(None, "gpt-4o"))
        .await
        .unwrap();

    let mut changed = definition_request(None, "gpt-4o");
    changed.output_price = Some(dec("0.00001"));
    let second = storage.upsert_system_model_definition(&changed).await.unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(second.output_price, Some(dec("0.00001")));

    // a different start time is a different definition
    let mut scheduled = definition_request(None, "gpt-4o");
    scheduled.start_time = Some(Utc::now());
    let third = storage.upsert_system_model_definition(&scheduled).await.unwrap();
    assert_ne!(third.id, first.id);
    assert_eq!(
        storage
            .count_model_definitions(&ModelDefinitionFilter::all())
            .await
            .unwrap(),
        2
    );
}

#[rstest]
#[tokio::test]
async fn test_upsert_system_keeps_id(in_memory_storage: InMemoryStorage) {
    run_test_upsert_system_keeps_id(&in_memory_storage).await;
}

#[sqlx::test]
#[ignore = "requires postgres"]
async fn test_upsert_system_keeps_id_postgres(pool: sqlx::PgPool) {
    run_test_upsert_system_keeps_id(&PostgresStorage::new(pool)).await;
}

async fn run_test_generation_upsert_and_list<S: Storage>(storage: &S) {
    let old = storage.upsert_generation(&generation_request("p1", "old", 10)).await.unwrap();
    storage.upsert_generation(&generation_request("p1", "new", 1)).await.unwrap();
    storage.upsert_generation(&generation_request("p2", "other", 1)).await.unwrap();
    assert_eq!(old.revision, 1);

    let mut replaced = generation_request("p1", "old", 10);
    replaced.model = Some("claude".to_string());
    replaced.expected_revision = Some(old.revision);
    let stored = storage.upsert_generation(&replaced).await.unwrap();
    assert_eq!(stored.model.as_deref(), Some("claude"));
    assert_eq!(stored.revision, 2);
    assert_eq!(stored.created_at, old.created_at);

    let filter = GenerationFilter::new("p1", 0, 10);
    let ids: Vec<_> = storage
        .list_generations(&filter)
        .await
        .unwrap()
        .into_iter()
        .map(|g| g.id)
        .collect();
    assert_eq!(ids, vec!["new".to_string(), "old".to_string()]);
    assert_eq!(storage.count_generations(&filter).await.unwrap(), 2);

    let by_model = filter.with_model(Some("claude".to_string()));
    assert_eq!(storage.count_generations(&by_model).await.unwrap(), 1);

    let fetched = storage
        .get_generation(&GenerationKey::new("p1", "old"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fetched.usage().total, Some(150));
    assert!(
        storage
            .get_generation(&GenerationKey::new("p2", "old"))
            .await
            .unwrap()
            .is_none()
    );
}

#[rstest]
#[tokio::test]
async fn test_generation_upsert_and_list(in_memory_storage: InMemoryStorage) {
    run_test_generation_upsert_and_list(&in_memory_storage).await;
}

#[sqlx::test]
#[ignore = "requires postgres"]
async fn test_generation_upsert_and_list_postgres(pool: sqlx::PgPool) {
    run_test_generation_upsert_and_list(&PostgresStorage::new(pool)).await;
}

async fn run_test_deleting_definition_unlinks_generations<S: Storage>(storage: &S) {
    let definition = storage
        .create_model_definition(&definition_request(Some("p1"), "mine"))
        .await
        .unwrap();

    let mut request = generation_request("p1", "g1", 1);
    request.internal_model_id = Some(definition.id);
    request.calculated_cost = CostDetails {
        input: Some(dec("0.0001")),
        output: Some(dec("0.0001")),
        total: Some(dec("0.0002")),
    };
    storage.upsert_generation(&request).await.unwrap();

    let linked = GenerationFilter::resolved_against("p1", definition.id);
    assert_eq!(storage.count_generations(&linked).await.unwrap(), 1);

    assert!(storage.delete_model_definition(definition.id).await.unwrap());

    let generation = storage
        .get_generation(&GenerationKey::new("p1", "g1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(generation.internal_model_id, None);
    assert_eq!(generation.cost().total, Some(dec("0.0002")));
    assert_eq!(storage.count_generations(&linked).await.unwrap(), 0);
}

#[rstest]
#[tokio::test]
async fn test_deleting_definition_unlinks_generations(in_memory_storage: InMemoryStorage) {
    run_test_deleting_definition_unlinks_generations(&in_memory_storage).await;
}

#[sqlx::test]
#[ignore = "requires postgres"]
async fn test_deleting_definition_unlinks_generations_postgres(pool: sqlx::PgPool) {
    run_test_deleting_definition_unlinks_generations(&PostgresStorage::new(pool)).await;
}

async fn run_test_stale_revision_is_rejected<S: Storage>(storage: &S) {
    let first = storage.upsert_generation(&generation_request("p1", "g1", 1)).await.unwrap();

    // two writers that both saw no row: the second one loses
    let duplicate = storage.upsert_generation(&generation_request("p1", "g1", 1)).await;
    assert!(matches!(duplicate, Err(DbError::StaleRevision { .. })));

    let mut winner = generation_request("p1", "g1", 1);
    winner.provided_usage.output = Some(7);
    winner.expected_revision = Some(first.revision);
    storage.upsert_generation(&winner).await.unwrap();

    // two writers that both read revision 1: the second one loses
    let mut loser = generation_request("p1", "g1", 1);
    loser.provided_usage.input = Some(1);
    loser.expected_revision = Some(first.revision);
    let stale = storage.upsert_generation(&loser).await;
    assert!(matches!(stale, Err(DbError::StaleRevision { .. })));

    let stored = storage
        .get_generation(&GenerationKey::new("p1", "g1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.provided_usage.input, Some(100));
    assert_eq!(stored.provided_usage.output, Some(7));
}

#[rstest]
#[tokio::test]
async fn test_stale_revision_is_rejected(in_memory_storage: InMemoryStorage) {
    run_test_stale_revision_is_rejected(&in_memory_storage).await;
}

#[sqlx::test]
#[ignore = "requires postgres"]
async fn test_stale_revision_is_rejected_postgres(pool: sqlx::PgPool) {
    run_test_stale_revision_is_rejected(&PostgresStorage::new(pool)).await;
}

async fn run_test_update_generation_costs<S: Storage>(storage: &S) {
    let mut request = generation_request("p1", "g1", 1);
    request.provided_cost.input = Some(dec("5"));
    let created = storage.upsert_generation(&request).await.unwrap();
    storage.upsert_generation(&generation_request("p1", "g2", 2)).await.unwrap();

    let cost = |total: &str| GenerationCostUpdateDBRequest {
        calculated_cost: CostDetails {
            input: Some(dec("1")),
            output: Some(dec("2")),
            total: Some(dec(total)),
        },
    };
    let written = storage
        .update_generation_costs(&[
            (GenerationKey::new("p1", "g1"), cost("7")),
            (GenerationKey::new("p1", "g2"), cost("3")),
            (GenerationKey::new("p1", "nope"), cost("1")),
        ])
        .await
        .unwrap();
    assert_eq!(written, 2);

    let updated = storage
        .get_generation(&GenerationKey::new("p1", "g1"))
        .await
        .unwrap()
        .unwrap();
    // ingested cost still wins on read
    assert_eq!(updated.cost().input, Some(dec("5")));
    assert_eq!(updated.cost().output, Some(dec("2")));
    assert_eq!(updated.provided_usage, request.provided_usage);
    // a worker holding the old revision has to re-read
    assert_eq!(updated.revision, created.revision + 1);

    let other = storage
        .get_generation(&GenerationKey::new("p1", "g2"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(other.cost().total, Some(dec("3")));
}

#[rstest]
#[tokio::test]
async fn test_update_generation_costs(in_memory_storage: InMemoryStorage) {
    run_test_update_generation_costs(&in_memory_storage).await;
}

#[sqlx::test]
#[ignore = "requires postgres"]
async fn test_update_generation_costs_postgres(pool: sqlx::PgPool) {
    run_test_update_generation_costs(&PostgresStorage::new(pool)).await;
}
