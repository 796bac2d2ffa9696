//! Test utilities: an in-memory application, project credentials and event builders.

use axum_test::TestServer;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde_json::{Value, json};

use crate::{
    AppState, BackgroundServices,
    api::models::{generations::GenerationResponse, ingestion::IngestionResponse},
    config::{
        AuthConfig, Config, DatabaseConfig, ProjectCredentials, QueueBackend, QueueConfig, SystemModelConfig, WorkerSettings,
    },
    db::{handlers::model_definitions::ModelDefinitionFilter, models::model_definitions::ModelDefinitionDBResponse},
    usage::UsageUnit,
    worker::{IngestionWorker, WorkerConfig},
};

/// Credentials of a configured test project.
#[derive(Debug, Clone, Copy)]
pub struct TestProject {
    pub project_id: &'static str,
    pub public_key: &'static str,
    pub secret_key: &'static str,
}

pub const PROJECT_A: TestProject = TestProject {
    project_id: "project-a",
    public_key: "pk-a",
    secret_key: "sk-a",
};

pub const PROJECT_B: TestProject = TestProject {
    project_id: "project-b",
    public_key: "pk-b",
    secret_key: "sk-b",
};

pub fn basic_auth(public_key: &str, secret_key: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{public_key}:{secret_key}")))
}

/// Header name and value for `add_header`
pub fn auth_header(project: TestProject) -> (String, String) {
    (
        "authorization".to_string(),
        basic_auth(project.public_key, project.secret_key),
    )
}

fn event(event_id: &str, kind: &str, body: Value) -> Value {
    json!({
        "id": event_id,
        "type": kind,
        "timestamp": "2025-06-01T12:00:00Z",
        "body": body,
    })
}

pub fn generation_create(event_id: &str, body: Value) -> Value {
    event(event_id, "generation-create", body)
}

pub fn generation_update(event_id: &str, body: Value) -> Value {
    event(event_id, "generation-update", body)
}

fn system_model(model_name: &str, match_pattern: &str) -> SystemModelConfig {
    SystemModelConfig {
        model_name: model_name.to_string(),
        match_pattern: match_pattern.to_string(),
        unit: UsageUnit::Tokens,
        start_time: None,
        input_price: None,
        output_price: None,
        total_price: None,
        tokenizer_id: Some("openai".to_string()),
        tokenizer_config: None,
        hidden_reasoning: false,
    }
}

pub fn create_test_config() -> Config {
    let dec = |s: &str| s.parse().ok();

    Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        database: DatabaseConfig::InMemory,
        queue: QueueConfig {
            backend: QueueBackend::InMemory,
            max_attempts: 3,
            ..Default::default()
        },
        // tests drive the worker through `TestApp::process_pending`
        worker: WorkerSettings {
            enabled: false,
            ..Default::default()
        },
        auth: AuthConfig {
            projects: [PROJECT_A, PROJECT_B]
                .into_iter()
                .map(|p| ProjectCredentials {
                    project_id: p.project_id.to_string(),
                    public_key: p.public_key.to_string(),
                    secret_key: p.secret_key.to_string(),
                })
                .collect(),
        },
        system_models: vec![
            SystemModelConfig {
                input_price: dec("0.0000025"),
                output_price: dec("0.00001"),
                ..system_model("gpt-4o", "(?i)^(openai/)?gpt-4o$")
            },
            SystemModelConfig {
                input_price: dec("0.00000015"),
                output_price: dec("0.0000006"),
                ..system_model("gpt-4o-mini", "(?i)^(openai/)?gpt-4o-mini$")
            },
            SystemModelConfig {
                input_price: dec("0.000015"),
                output_price: dec("0.00006"),
                hidden_reasoning: true,
                ..system_model("o1", "(?i)^(openai/)?o1(-\\d{4}-\\d{2}-\\d{2})?$")
            },
        ],
        // axum-prometheus installs a global recorder, only one test may enable it
        enable_metrics: false,
        enable_otel_export: false,
        ..Default::default()
    }
}

pub struct TestApp {
    pub server: TestServer,
    pub state: AppState,
    // keeps the catalog refresh task alive for the duration of the test
    _bg_services: BackgroundServices,
}

pub async fn create_test_app() -> TestApp {
    create_test_app_with(|_| {}).await
}

pub async fn create_test_app_with(configure: impl FnOnce(&mut Config)) -> TestApp {
    let mut config = create_test_config();
    configure(&mut config);

    let app = crate::Application::new(config)
        .await
        .expect("Failed to create application");
    let state = app.state().clone();
    let (server, bg_services) = app.into_test_server();

    TestApp {
        server,
        state,
        _bg_services: bg_services,
    }
}

impl TestApp {
    /// Post a batch through the ingestion endpoint; every event must be accepted.
    pub async fn ingest(&self, project: TestProject, events: Vec<Value>) -> IngestionResponse {
        let (name, value) = auth_header(project);
        let response = self
            .server
            .post("/api/public/ingestion")
            .add_header(name, value)
            .json(&json!({ "batch": events }))
            .await;
        response.assert_status(axum::http::StatusCode::MULTI_STATUS);
        let body: IngestionResponse = response.json();
        assert!(body.errors.is_empty(), "ingestion rejected events: {:?}", body.errors);
        body
    }

    /// Process queued messages until the queue is empty. Returns the number processed.
    pub async fn process_pending(&self) -> usize {
        let worker = IngestionWorker::new(
            self.state.queue.clone(),
            self.state.storage.clone(),
            self.state.catalog.clone(),
            WorkerConfig::from(&self.state.config.worker),
        );

        let mut processed = 0;
        while let Some(message) = self.state.queue.dequeue().await.expect("Failed to dequeue") {
            worker.process(&message).await.expect("Failed to process message");
            self.state.queue.ack(&message).await.expect("Failed to ack message");
            processed += 1;
        }
        processed
    }

    pub async fn get_generation(&self, project: TestProject, id: &str) -> GenerationResponse {
        let (name, value) = auth_header(project);
        let response = self
            .server
            .get(&format!("/api/public/generations/{id}"))
            .add_header(name, value)
            .await;
        response.assert_status_ok();
        response.json()
    }

    pub async fn system_definition(&self, model_name: &str) -> ModelDefinitionDBResponse {
        self.state
            .storage
            .list_model_definitions(&ModelDefinitionFilter::all())
            .await
            .expect("Failed to list model definitions")
            .into_iter()
            .find(|d| d.model_name == model_name && d.is_system_maintained())
            .expect("System model definition not found")
    }
}

