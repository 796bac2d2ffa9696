//! Ingestion worker: resolves queued generation events.
//!
//! For each message the worker
//!
//! 1. merges the event into the stored generation ([`merge::merge_event`]),
//! 2. matches the merged record against the current model catalog,
//! 3. resolves missing usage and cost (tokenization runs on the blocking pool),
//! 4. writes the generation back with its calculated values and acks the message.
//!
//! The write is conditional on the revision read in step 1. When another event for the same
//! generation was written in between, the whole read-merge-resolve-write cycle starts over from
//! the newer row, so concurrent events never overwrite each other's fields.
//!
//! Any other failure nacks the message, so it is retried and eventually dead-lettered.

pub mod merge;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, trace, warn};

use crate::catalog::CatalogHandle;
use crate::db::errors::DbError;
use crate::db::models::generations::{GenerationDBResponse, GenerationUpsertDBRequest};
use crate::db::models::model_definitions::ModelDefinitionDBResponse;
use crate::metrics;
use crate::queue::{IngestionQueue, NackOutcome, QueueError, QueueMessage};
use crate::storage::Storage;
use crate::types::GenerationKey;
use crate::usage::resolver::GenerationInput;
use crate::usage::{Resolution, ValueSource, resolve};

/// Read-merge-write cycles per message before it is nacked
const MAX_WRITE_ATTEMPTS: usize = 5;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    Storage(#[from] DbError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("Resolution task failed: {0}")]
    Resolution(#[from] tokio::task::JoinError),
}

/// Configuration for the ingestion worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Messages processed at the same time
    pub concurrency: usize,

    /// How long to sleep when the queue is empty
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 16,
            poll_interval: Duration::from_millis(500),
        }
    }
}

pub struct IngestionWorker {
    queue: Arc<dyn IngestionQueue>,
    storage: Arc<dyn Storage>,
    catalog: CatalogHandle,
    config: WorkerConfig,
    in_flight: Arc<AtomicUsize>,
}

impl IngestionWorker {
    pub fn new(
        queue: Arc<dyn IngestionQueue>,
        storage: Arc<dyn Storage>,
        catalog: CatalogHandle,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            storage,
            catalog,
            config,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Messages currently being processed
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Run until cancelled, then wait for in-flight messages to finish.
    ///
    /// Messages left in this consumer's processing list by a previous run are recovered first.
    #[tracing::instrument(skip_all, fields(concurrency = self.config.concurrency))]
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<(), WorkerError> {
        self.queue.recover().await?;
        info!("Ingestion worker starting main processing loop");

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut join_set: JoinSet<()> = JoinSet::new();

        loop {
            while let Some(result) = join_set.try_join_next() {
                if let Err(join_error) = result {
                    error!(error = %join_error, "Processing task panicked");
                }
            }

            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let message = match self.queue.dequeue().await {
                Ok(Some(message)) => message,
                Ok(None) => {
                    drop(permit);
                    trace!("No pending messages, sleeping");
                    self.idle(&shutdown).await;
                    continue;
                }
                Err(e) => {
                    drop(permit);
                    error!("Failed to dequeue message: {}", e);
                    self.idle(&shutdown).await;
                    continue;
                }
            };

            let worker = self.clone();
            let span = info_span!(
                "process_message",
                message_id = %message.envelope.message_id,
                generation = %GenerationKey::new(message.envelope.project_id.clone(), message.envelope.event.id.clone()),
                attempts = message.envelope.attempts,
            );
            self.in_flight.fetch_add(1, Ordering::Relaxed);
            join_set.spawn(
                async move {
                    let _permit = permit;
                    let in_flight = worker.in_flight.clone();
                    let _guard = scopeguard::guard((), |_| {
                        in_flight.fetch_sub(1, Ordering::Relaxed);
                    });
                    worker.handle(message).await;
                }
                .instrument(span),
            );
        }

        info!(in_flight = self.in_flight(), "Ingestion worker shutting down, draining in-flight messages");
        while let Some(result) = join_set.join_next().await {
            if let Err(join_error) = result {
                error!(error = %join_error, "Processing task panicked");
            }
        }
        Ok(())
    }

    async fn idle(&self, shutdown: &CancellationToken) {
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = tokio::time::sleep(self.config.poll_interval) => {}
        }
    }

    /// Process one message and ack or nack it.
    async fn handle(&self, message: QueueMessage) {
        match self.process(&message).await {
            Ok(generation) => {
                let lag = chrono::Utc::now() - message.envelope.enqueued_at;
                metrics::record_ingestion_lag(lag.num_milliseconds() as f64 / 1000.0);
                debug!(total_cost = ?generation.cost().total, "Generation resolved");
                if let Err(e) = self.queue.ack(&message).await {
                    // a redelivered event is merged again over the stored generation
                    error!("Failed to ack message: {}", e);
                }
            }
            Err(e) => {
                warn!("Failed to process message: {}", e);
                match self.queue.nack(&message).await {
                    Ok(outcome) => {
                        metrics::record_queue_failure(outcome);
                        if outcome == NackOutcome::DeadLettered {
                            error!("Message used up its attempts and was dead-lettered");
                        }
                    }
                    Err(e) => error!("Failed to nack message: {}", e),
                }
            }
        }
    }

    /// Merge, resolve and persist the generation carried by a message.
    pub async fn process(&self, message: &QueueMessage) -> Result<GenerationDBResponse, WorkerError> {
        let envelope = &message.envelope;
        let key = GenerationKey::new(envelope.project_id.clone(), envelope.event.id.clone());

        let mut attempt = 1;
        loop {
            let existing = self.storage.get_generation(&key).await?;
            let merged = merge::merge_event(existing, &envelope.project_id, &envelope.event);

            match self.resolve_and_store(merged).await {
                Err(WorkerError::Storage(DbError::StaleRevision { .. })) if attempt < MAX_WRITE_ATTEMPTS => {
                    debug!(attempt, "Generation changed while resolving, merging again");
                }
                // the matched definition was deleted after the catalog snapshot was taken
                Err(WorkerError::Storage(DbError::ForeignKeyViolation { .. })) if attempt < MAX_WRITE_ATTEMPTS => {
                    info!("Matched model definition no longer exists, refreshing catalog");
                    self.catalog.refresh().await?;
                }
                result => return result,
            }
            attempt += 1;
        }
    }

    async fn resolve_and_store(&self, mut generation: GenerationUpsertDBRequest) -> Result<GenerationDBResponse, WorkerError> {
        let catalog = self.catalog.snapshot();
        let definition: Option<ModelDefinitionDBResponse> = generation
            .model
            .as_deref()
            .and_then(|model| catalog.find_match(&generation.project_id, model, generation.unit, generation.start_time))
            .cloned();

        // tokenizers are CPU bound
        let (mut generation, definition, resolution) = tokio::task::spawn_blocking(move || {
            let resolution = resolve(
                GenerationInput {
                    model: generation.model.as_deref(),
                    input: generation.input.as_ref(),
                    output: generation.output.as_ref(),
                    provided_usage: &generation.provided_usage,
                    provided_cost: &generation.provided_cost,
                },
                definition.as_ref(),
            );
            (generation, definition, resolution)
        })
        .await?;

        let Resolution { usage, cost } = resolution;
        generation.calculated_usage = usage;
        generation.calculated_cost = cost;
        generation.internal_model_id = definition.as_ref().map(|d| d.id);

        let stored = self.storage.upsert_generation(&generation).await?;

        metrics::record_resolution(
            definition.is_some(),
            ValueSource::of(&stored.provided_usage.total, &stored.calculated_usage.total),
            ValueSource::of(&stored.provided_cost.total, &stored.calculated_cost.total),
        );
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::model_definitions::{ModelDefinitionCreateDBRequest, TokenizerConfig};
    use crate::queue::InMemoryQueue;
    use crate::storage::InMemoryStorage;
    use crate::usage::{CostDetails, GenerationEvent, GenerationEventKind, UsageDetails, UsageUnit};
    use chrono::Utc;
    use rust_decimal::Decimal;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn definition(project_id: Option<&str>, hidden_reasoning: bool) -> ModelDefinitionCreateDBRequest {
        ModelDefinitionCreateDBRequest {
            project_id: project_id.map(str::to_string),
            model_name: "gpt-4o".to_string(),
            match_pattern: "(?i)^gpt-4o$".to_string(),
            unit: UsageUnit::Tokens,
            start_time: None,
            input_price: Some(dec("0.01")),
            output_price: Some(dec("0.02")),
            total_price: None,
            tokenizer_id: Some("openai".to_string()),
            tokenizer_config: Some(TokenizerConfig::default()),
            hidden_reasoning,
        }
    }

    fn event(id: &str, kind: GenerationEventKind) -> GenerationEvent {
        GenerationEvent {
            event_id: format!("evt-{id}"),
            kind,
            timestamp: Utc::now(),
            id: id.to_string(),
            trace_id: None,
            name: None,
            model: Some("gpt-4o".to_string()),
            unit: None,
            start_time: None,
            end_time: None,
            input: None,
            output: None,
            usage: UsageDetails::default(),
            cost: CostDetails::default(),
        }
    }

    struct Harness {
        storage: Arc<InMemoryStorage>,
        queue: Arc<InMemoryQueue>,
        worker: Arc<IngestionWorker>,
    }

    async fn harness(definitions: Vec<ModelDefinitionCreateDBRequest>) -> Harness {
        let storage = Arc::new(InMemoryStorage::new());
        for request in &definitions {
            storage.create_model_definition(request).await.unwrap();
        }
        let queue = Arc::new(InMemoryQueue::new(3));
        let catalog = CatalogHandle::load(storage.clone()).await.unwrap();
        let worker = Arc::new(IngestionWorker::new(
            queue.clone(),
            storage.clone(),
            catalog,
            WorkerConfig {
                concurrency: 4,
                poll_interval: Duration::from_millis(10),
            },
        ));
        Harness { storage, queue, worker }
    }

    async fn process_next(h: &Harness) -> GenerationDBResponse {
        let message = h.queue.dequeue().await.unwrap().unwrap();
        let generation = h.worker.process(&message).await.unwrap();
        h.queue.ack(&message).await.unwrap();
        generation
    }

    #[tokio::test]
    async fn test_ingested_usage_is_priced() {
        let h = harness(vec![definition(None, false)]).await;
        let mut create = event("g1", GenerationEventKind::GenerationCreate);
        create.usage = UsageDetails {
            input: Some(100),
            output: Some(50),
            total: None,
        };
        h.queue.enqueue("p1", create).await.unwrap();

        let generation = process_next(&h).await;

        assert!(generation.internal_model_id.is_some());
        assert_eq!(generation.calculated_usage.input, None);
        assert_eq!(generation.usage().total, Some(150));
        assert_eq!(generation.cost().input, Some(dec("1.00")));
        assert_eq!(generation.cost().output, Some(dec("1.00")));
        assert_eq!(generation.cost().total, Some(dec("2.00")));
    }

    #[tokio::test]
    async fn test_missing_usage_is_tokenized_after_update() {
        let h = harness(vec![definition(None, false)]).await;
        let mut create = event("g1", GenerationEventKind::GenerationCreate);
        create.input = Some(serde_json::json!("hello world"));
        h.queue.enqueue("p1", create).await.unwrap();
        let first = process_next(&h).await;
        assert_eq!(first.usage().input, Some(2));
        assert_eq!(first.usage().output, None);

        let mut update = event("g1", GenerationEventKind::GenerationUpdate);
        update.model = None;
        update.output = Some(serde_json::json!("hello world"));
        h.queue.enqueue("p1", update).await.unwrap();
        let second = process_next(&h).await;

        assert_eq!(second.model.as_deref(), Some("gpt-4o"));
        assert_eq!(second.usage().input, Some(2));
        assert_eq!(second.usage().output, Some(2));
        assert_eq!(second.usage().total, Some(4));
        assert_eq!(second.cost().total, Some(dec("0.06")));
        assert_eq!(second.created_at, first.created_at);
    }

    #[tokio::test]
    async fn test_ingested_cost_is_never_replaced() {
        let h = harness(vec![definition(None, false)]).await;
        let mut create = event("g1", GenerationEventKind::GenerationCreate);
        create.usage = UsageDetails {
            input: Some(100),
            output: Some(50),
            total: None,
        };
        create.cost.input = Some(dec("9"));
        h.queue.enqueue("p1", create).await.unwrap();

        let generation = process_next(&h).await;

        assert_eq!(generation.provided_cost.input, Some(dec("9")));
        assert_eq!(generation.calculated_cost.input, None);
        assert_eq!(generation.cost().total, Some(dec("10.00")));
    }

    #[tokio::test]
    async fn test_hidden_reasoning_without_usage_has_no_cost() {
        let h = harness(vec![definition(None, true)]).await;
        let mut create = event("g1", GenerationEventKind::GenerationCreate);
        create.input = Some(serde_json::json!("hello world"));
        create.output = Some(serde_json::json!("hello world"));
        h.queue.enqueue("p1", create).await.unwrap();

        let generation = process_next(&h).await;

        assert!(generation.internal_model_id.is_some());
        assert_eq!(generation.usage(), UsageDetails::default());
        assert_eq!(generation.cost(), CostDetails::default());
    }

    #[tokio::test]
    async fn test_user_defined_definition_wins() {
        let mut user = definition(Some("p1"), false);
        user.input_price = Some(dec("1"));
        let h = harness(vec![definition(None, false), user]).await;
        let mut create = event("g1", GenerationEventKind::GenerationCreate);
        create.usage.input = Some(3);
        h.queue.enqueue("p1", create.clone()).await.unwrap();
        h.queue.enqueue("p2", create).await.unwrap();

        let own = process_next(&h).await;
        let other = process_next(&h).await;

        assert_eq!(own.cost().input, Some(dec("3")));
        assert_eq!(other.cost().input, Some(dec("0.03")));
    }

    #[tokio::test]
    async fn test_deleted_definition_triggers_catalog_refresh() {
        let h = harness(vec![definition(Some("p1"), false)]).await;
        let stale = h.worker.catalog.snapshot();
        let definition_id = stale
            .find_match("p1", "gpt-4o", UsageUnit::Tokens, Utc::now())
            .unwrap()
            .id;
        h.storage.delete_model_definition(definition_id).await.unwrap();

        let mut create = event("g1", GenerationEventKind::GenerationCreate);
        create.usage.input = Some(3);
        h.queue.enqueue("p1", create).await.unwrap();
        let generation = process_next(&h).await;

        assert_eq!(generation.internal_model_id, None);
        assert_eq!(generation.cost(), CostDetails::default());
        assert_eq!(generation.usage().total, Some(3));
    }

    #[tokio::test]
    async fn test_concurrent_events_for_one_generation_keep_both_fields() {
        let h = harness(vec![definition(None, false)]).await;
        let mut create = event("g1", GenerationEventKind::GenerationCreate);
        create.usage.input = Some(100);
        let mut update = event("g1", GenerationEventKind::GenerationUpdate);
        update.usage.output = Some(50);
        h.queue.enqueue("p1", create).await.unwrap();
        h.queue.enqueue("p1", update).await.unwrap();

        // both are read before either is written
        let first = h.queue.dequeue().await.unwrap().unwrap();
        let second = h.queue.dequeue().await.unwrap().unwrap();
        let (a, b) = tokio::join!(h.worker.process(&first), h.worker.process(&second));
        a.unwrap();
        b.unwrap();

        let stored = h
            .storage
            .get_generation(&GenerationKey::new("p1", "g1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            stored.provided_usage,
            UsageDetails {
                input: Some(100),
                output: Some(50),
                total: None,
            }
        );
        assert_eq!(stored.usage().total, Some(150));
        assert_eq!(stored.cost().total, Some(dec("2.00")));
        assert_eq!(stored.revision, 2);
    }

    #[tokio::test]
    async fn test_three_concurrent_events_are_all_merged() {
        let h = harness(vec![definition(None, false)]).await;
        let mut create = event("g1", GenerationEventKind::GenerationCreate);
        create.input = Some(serde_json::json!("hello world"));
        h.queue.enqueue("p1", create).await.unwrap();
        let mut update = event("g1", GenerationEventKind::GenerationUpdate);
        update.output = Some(serde_json::json!("hello world"));
        h.queue.enqueue("p1", update).await.unwrap();
        let mut usage = event("g1", GenerationEventKind::GenerationUpdate);
        usage.cost.total = Some(dec("9"));
        h.queue.enqueue("p1", usage).await.unwrap();

        let m1 = h.queue.dequeue().await.unwrap().unwrap();
        let m2 = h.queue.dequeue().await.unwrap().unwrap();
        let m3 = h.queue.dequeue().await.unwrap().unwrap();
        let (a, b, c) = tokio::join!(h.worker.process(&m1), h.worker.process(&m2), h.worker.process(&m3));
        a.unwrap();
        b.unwrap();
        c.unwrap();

        let stored = h
            .storage
            .get_generation(&GenerationKey::new("p1", "g1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.input, Some(serde_json::json!("hello world")));
        assert_eq!(stored.output, Some(serde_json::json!("hello world")));
        assert_eq!(stored.usage().total, Some(4));
        assert_eq!(stored.cost().total, Some(dec("9")));
    }

    #[test_log::test(tokio::test)]
    async fn test_worker_loop_drains_queue() {
        let h = harness(vec![definition(None, false)]).await;
        for i in 0..10 {
            let mut create = event(&format!("g{i}"), GenerationEventKind::GenerationCreate);
            create.usage.input = Some(i);
            h.queue.enqueue("p1", create).await.unwrap();
        }

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(h.worker.clone().run(shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(300)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("worker should stop")
            .unwrap()
            .unwrap();

        let depth = h.queue.depth().await.unwrap();
        assert_eq!(depth.pending, 0);
        assert_eq!(depth.processing, 0);
        let stored = h
            .storage
            .count_generations(&crate::db::handlers::generations::GenerationFilter::new("p1", 0, 100))
            .await
            .unwrap();
        assert_eq!(stored, 10);
        assert_eq!(h.worker.in_flight(), 0);
    }
}
