//! # genmeter: generation ingestion with asynchronous usage and cost resolution
//!
//! `genmeter` accepts LLM generation records from API clients, queues them durably and resolves
//! their token usage and USD cost in the background.
//!
//! ## Overview
//!
//! Clients report generations with whatever they know: sometimes full usage and cost, often
//! only the model name and the recorded input/output. Anything missing is inferred:
//!
//! - **usage** by running the tokenizer of the matching model definition over the recorded
//!   input and output,
//! - **cost** by multiplying usage with the prices of the matching model definition.
//!
//! Ingested values always win. They are stored apart from inferred values, and inference only
//! ever writes the inferred side.
//!
//! ## Architecture
//!
//! ```text
//!  client ──► POST /api/public/ingestion ──► validate ──► IngestionQueue (Redis lists)
//!                                                              │
//!                               IngestionWorker ◄──────────────┘
//!                                 │  merge event into stored generation
//!                                 │  ModelCatalog::find_match  (usage::matcher)
//!                                 │  resolve                   (usage::resolver)
//!                                 ▼
//!                              Storage (Postgres) ──► ack
//! ```
//!
//! - [`api`]: axum handlers and request/response models
//! - [`auth`]: project authentication with HTTP Basic key pairs
//! - [`queue`]: at-least-once ingestion queue, Redis and in-memory
//! - [`worker`]: dequeues, resolves and persists generations
//! - [`usage`]: model matching, tokenizers and the usage/cost resolver
//! - [`catalog`]: hot-swappable compiled snapshot of the model definitions
//! - [`storage`] and [`db`]: persistence, Postgres and in-memory
//!
//! ## Lifecycle
//!
//! [`Application::new`] connects storage and queue, runs migrations, syncs the configured
//! system models, loads the catalog and starts the background services (worker and catalog
//! refresh). [`Application::serve`] serves HTTP until the shutdown future resolves, then stops
//! the background services and waits for in-flight messages.

pub mod api;
pub mod auth;
pub mod catalog;
pub mod config;
pub mod db;
pub mod errors;
mod metrics;
mod openapi;
pub mod queue;
pub mod storage;
pub mod telemetry;
pub mod types;
pub mod usage;
pub mod worker;

#[cfg(test)]
pub mod test_utils;

use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderValue, Method};
use axum::{
    Json, Router,
    routing::{delete, get, patch, post},
};
use axum_prometheus::PrometheusMetricLayer;
use bon::Builder;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;
use tokio_util::sync::{CancellationToken, DropGuard};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{Level, debug, error, info, instrument};
use utoipa::OpenApi;
use utoipa_scalar::{Scalar, Servable};

use crate::catalog::CatalogHandle;
use crate::config::{CorsOrigin, DatabaseConfig, QueueBackend, SystemModelConfig};
use crate::openapi::ApiDoc;
use crate::queue::redis_queue::RedisQueueSettings;
use crate::queue::{InMemoryQueue, IngestionQueue, RedisQueue};
use crate::storage::{InMemoryStorage, PostgresStorage, Storage};
use crate::worker::{IngestionWorker, WorkerConfig};
pub use config::Config;

/// Application state shared across all request handlers.
///
/// ```ignore
/// let state = AppState::builder()
///     .config(config)
///     .storage(storage)
///     .queue(queue)
///     .catalog(catalog)
///     .build();
/// ```
#[derive(Clone, Builder)]
pub struct AppState {
    pub config: Config,
    pub storage: Arc<dyn Storage>,
    pub queue: Arc<dyn IngestionQueue>,
    pub catalog: CatalogHandle,
}

/// Get the genmeter database migrator
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}

fn optional_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// Connect the configured storage backend. Runs migrations for Postgres.
async fn setup_storage(config: &Config) -> anyhow::Result<(Arc<dyn Storage>, Option<PgPool>)> {
    match &config.database {
        DatabaseConfig::External { url, pool } => {
            info!("Using external database");
            let pg_pool = PgPoolOptions::new()
                .max_connections(pool.max_connections)
                .min_connections(pool.min_connections)
                .acquire_timeout(Duration::from_secs(pool.acquire_timeout_secs))
                .idle_timeout(optional_secs(pool.idle_timeout_secs))
                .max_lifetime(optional_secs(pool.max_lifetime_secs))
                .connect(url)
                .await?;
            migrator().run(&pg_pool).await?;
            Ok((Arc::new(PostgresStorage::new(pg_pool.clone())), Some(pg_pool)))
        }
        DatabaseConfig::InMemory => {
            info!("Using in-memory storage: data will be lost on shutdown");
            Ok((Arc::new(InMemoryStorage::new()), None))
        }
    }
}

/// Connect the configured ingestion queue and check the Redis eviction policy.
async fn setup_queue(config: &Config) -> anyhow::Result<Arc<dyn IngestionQueue>> {
    match config.queue.backend {
        QueueBackend::Redis => {
            let url = config.redis.connection_url()?;
            let settings = RedisQueueSettings {
                key_prefix: config.queue.key_prefix.clone(),
                consumer_id: config.queue.consumer_id(),
                max_attempts: config.queue.max_attempts,
            };
            let queue = RedisQueue::connect(&url, settings).await?;
            queue.check_eviction_policy(config.redis.require_noeviction).await?;
            Ok(Arc::new(queue))
        }
        QueueBackend::InMemory => {
            info!("Using in-memory ingestion queue: queued events will be lost on shutdown");
            Ok(Arc::new(InMemoryQueue::new(config.queue.max_attempts)))
        }
    }
}

/// Insert or refresh the system-maintained model definitions from configuration.
///
/// Idempotent: definitions are keyed by model name, unit and start time and keep their id.
/// Definitions removed from the configuration are left in place, since generations may still
/// link to them.
#[instrument(skip_all, fields(count = models.len()))]
async fn sync_system_models(storage: &dyn Storage, models: &[SystemModelConfig]) -> anyhow::Result<()> {
    for model in models {
        let definition = storage
            .upsert_system_model_definition(&model.to_request())
            .await
            .map_err(|e| anyhow::anyhow!("Failed to sync system model '{}': {}", model.model_name, e))?;
        debug!(model_name = %definition.model_name, id = %types::abbrev_uuid(&definition.id), "Synced system model");
    }
    info!("Synced {} system model definitions", models.len());
    Ok(())
}

/// Create CORS layer from configuration
fn create_cors_layer(config: &Config) -> anyhow::Result<CorsLayer> {
    let allow_origin = if config
        .cors
        .allowed_origins
        .iter()
        .any(|origin| matches!(origin, CorsOrigin::Wildcard))
    {
        // tower-http refuses "*" inside an origin list
        AllowOrigin::any()
    } else {
        let mut origins = Vec::new();
        for origin in &config.cors.allowed_origins {
            if let CorsOrigin::Url(url) = origin {
                origins.push(url.as_str().trim_end_matches('/').parse::<HeaderValue>()?);
            }
        }
        AllowOrigin::list(origins)
    };

    let mut cors = CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE])
        .allow_headers([axum::http::header::AUTHORIZATION, axum::http::header::CONTENT_TYPE])
        .allow_credentials(config.cors.allow_credentials);

    if let Some(max_age) = config.cors.max_age {
        cors = cors.max_age(Duration::from_secs(max_age));
    }

    Ok(cors)
}

/// Build the router: public API, health and docs, plus CORS, optional metrics and tracing.
#[instrument(skip_all)]
pub fn build_router(state: &AppState) -> anyhow::Result<Router> {
    use api::handlers::{generations, health, ingestion, model_definitions};

    let api_routes = Router::new()
        .route("/ingestion", post(ingestion::ingest))
        // Model definitions
        .route("/models", get(model_definitions::list_model_definitions))
        .route("/models", post(model_definitions::create_model_definition))
        .route("/models/{id}", get(model_definitions::get_model_definition))
        .route("/models/{id}", patch(model_definitions::update_model_definition))
        .route("/models/{id}", delete(model_definitions::delete_model_definition))
        .route("/models/{id}/reprice", post(model_definitions::reprice_model_definition))
        // Generations
        .route("/generations", get(generations::list_generations))
        .route("/generations/{id}", get(generations::get_generation))
        .route("/health", get(health::health))
        .with_state(state.clone());

    let router = Router::new()
        .route("/healthz", get(|| async { "OK" }))
        .nest("/api/public", api_routes)
        .route("/api-docs/openapi.json", get(|| async { Json(ApiDoc::openapi()) }))
        .merge(Scalar::with_url("/docs", ApiDoc::openapi()));

    let mut router = router.layer(create_cors_layer(&state.config)?);

    if state.config.enable_metrics {
        let (prometheus_layer, metric_handle) = PrometheusMetricLayer::pair();

        // HTTP metrics from axum-prometheus, ingestion metrics from the default registry
        router = router
            .route(
                "/internal/metrics",
                get(|| async move {
                    use prometheus::{Encoder, TextEncoder};

                    let mut rendered = metric_handle.render();
                    let mut buffer = vec![];
                    if let Err(e) = TextEncoder::new().encode(&prometheus::gather(), &mut buffer) {
                        error!("Failed to encode ingestion metrics: {}", e);
                    }
                    rendered.push_str(&String::from_utf8_lossy(&buffer));
                    rendered
                }),
            )
            .layer(prometheus_layer);
    }

    let router = router.layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_request(DefaultOnRequest::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    );

    Ok(router)
}

/// Background tasks running next to the HTTP server: the ingestion worker and the periodic
/// catalog refresh.
///
/// Dropping the struct cancels the tasks through `drop_guard`; [`BackgroundServices::shutdown`]
/// also waits for them, letting the worker finish its in-flight messages.
pub struct BackgroundServices {
    background_tasks: Vec<tokio::task::JoinHandle<()>>,
    shutdown_token: CancellationToken,
    // Pub so that we can disarm it if we want to
    pub drop_guard: Option<DropGuard>,
}

impl BackgroundServices {
    /// Gracefully shutdown all background tasks
    pub async fn shutdown(self) {
        self.shutdown_token.cancel();
        for handle in self.background_tasks {
            let _ = handle.await;
        }
    }
}

fn setup_background_services(state: &AppState, shutdown_token: CancellationToken) -> BackgroundServices {
    let drop_guard = shutdown_token.clone().drop_guard();
    let mut background_tasks = Vec::new();

    let catalog = state.catalog.clone();
    let refresh_interval = state.config.catalog.refresh_interval;
    background_tasks.push(tokio::spawn(catalog.run_refresh(refresh_interval, shutdown_token.clone())));

    if state.config.worker.enabled {
        let worker = Arc::new(IngestionWorker::new(
            state.queue.clone(),
            state.storage.clone(),
            state.catalog.clone(),
            WorkerConfig::from(&state.config.worker),
        ));
        let token = shutdown_token.clone();
        background_tasks.push(tokio::spawn(async move {
            if let Err(e) = worker.run(token).await {
                error!("Ingestion worker stopped: {}", e);
            }
        }));
        info!("Ingestion worker started");
    } else {
        info!("Ingestion worker disabled in this process");
    }

    BackgroundServices {
        background_tasks,
        shutdown_token,
        drop_guard: Some(drop_guard),
    }
}

/// Owns the router, the backends and the background services.
///
/// 1. **Create**: [`Application::new`] connects storage and queue, syncs system models, loads
///    the model catalog and starts the background services
/// 2. **Serve**: [`Application::serve`] binds to a TCP port and handles requests
/// 3. **Shutdown**: once the shutdown future resolves, background services are stopped and the
///    database pool is closed
pub struct Application {
    router: Router,
    app_state: AppState,
    config: Config,
    pool: Option<PgPool>,
    bg_services: BackgroundServices,
}

impl Application {
    /// Create a new application instance with all resources initialized
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        debug!("Starting genmeter with configuration: {:#?}", config);

        let (storage, pool) = setup_storage(&config).await?;
        sync_system_models(storage.as_ref(), &config.system_models).await?;
        let queue = setup_queue(&config).await?;

        let catalog = CatalogHandle::load(storage.clone()).await?;
        info!(definitions = catalog.snapshot().len(), "Model catalog loaded");

        let app_state = AppState::builder()
            .config(config.clone())
            .storage(storage)
            .queue(queue)
            .catalog(catalog)
            .build();

        let bg_services = setup_background_services(&app_state, CancellationToken::new());
        let router = build_router(&app_state)?;

        Ok(Self {
            router,
            app_state,
            config,
            pool,
            bg_services,
        })
    }

    pub fn state(&self) -> &AppState {
        &self.app_state
    }

    /// Convert application into a test server (for tests)
    #[cfg(test)]
    pub fn into_test_server(self) -> (axum_test::TestServer, BackgroundServices) {
        let server = axum_test::TestServer::new(self.router).expect("Failed to create test server");
        (server, self.bg_services)
    }

    /// Start serving the application
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr).await?;
        info!(
            "genmeter listening on http://{}, API docs at http://localhost:{}/docs",
            bind_addr, self.config.port
        );

        axum::serve(listener, self.router.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await?;

        info!("Stopping background services...");
        self.bg_services.shutdown().await;

        if let Some(pool) = self.pool {
            info!("Closing database connections...");
            pool.close().await;
        }

        info!("Shutting down telemetry...");
        telemetry::shutdown_telemetry();

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::db::handlers::model_definitions::ModelDefinitionFilter;
    use crate::test_utils::*;

    #[test_log::test(tokio::test)]
    async fn test_system_model_sync_is_idempotent() {
        let config = create_test_config();
        let storage = InMemoryStorage::new();

        sync_system_models(&storage, &config.system_models).await.unwrap();
        let first = storage.list_model_definitions(&ModelDefinitionFilter::all()).await.unwrap();

        let mut changed = config.system_models.clone();
        changed[0].input_price = Some("1".parse().unwrap());
        sync_system_models(&storage, &changed).await.unwrap();
        let second = storage.list_model_definitions(&ModelDefinitionFilter::all()).await.unwrap();

        assert_eq!(first.len(), config.system_models.len());
        assert_eq!(second.len(), first.len());
        let original = first.iter().find(|d| d.model_name == changed[0].model_name).unwrap();
        let updated = second.iter().find(|d| d.model_name == changed[0].model_name).unwrap();
        assert_eq!(original.id, updated.id);
        assert_eq!(updated.input_price, Some("1".parse().unwrap()));
    }

    #[test_log::test(tokio::test)]
    async fn test_docs_routes() {
        let app = create_test_app().await;

        let response = app.server.get("/api-docs/openapi.json").await;
        response.assert_status_ok();
        assert!(response.text().contains("genmeter API"));

        app.server.get("/docs").await.assert_status_ok();
    }

    #[test_log::test(tokio::test)]
    async fn test_metrics_endpoint() {
        let app = create_test_app_with(|config| config.enable_metrics = true).await;
        app.ingest(PROJECT_A, vec![generation_create("evt-1", serde_json::json!({"id": "g1"}))])
            .await;

        let response = app.server.get("/internal/metrics").await;
        response.assert_status_ok();
        let metrics = response.text();
        assert!(metrics.contains("genmeter_ingestion_events_total"));
    }

    #[test_log::test(tokio::test)]
    async fn test_metrics_disabled() {
        let app = create_test_app().await;
        let response = app.server.get("/internal/metrics").await;
        assert!(!response.text().contains("# TYPE"));
    }

    #[test]
    fn test_cors_layer_from_config() {
        let mut config = create_test_config();
        assert!(create_cors_layer(&config).is_ok());

        config.cors.allowed_origins = vec![CorsOrigin::Url("https://app.example.com".parse().unwrap())];
        config.cors.allow_credentials = true;
        assert!(create_cors_layer(&config).is_ok());
    }
}
