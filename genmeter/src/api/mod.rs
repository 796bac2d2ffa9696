//! API layer for HTTP request handling and data models.
//!
//! This module contains the REST API implementation, organized into:
//!
//! - **[`handlers`]**: Axum route handlers for all API endpoints
//! - **[`models`]**: Request/response data structures for API communication
//!
//! # API Structure
//!
//! - **Ingestion** (`/api/public/ingestion`): Batched generation create/update events
//! - **Models** (`/api/public/models/*`): Model definitions used for matching and pricing
//! - **Generations** (`/api/public/generations/*`): Resolved generations with usage and cost
//! - **Health** (`/healthz`, `/api/public/health`): Liveness and ingestion queue depth
//!
//! Every `/api/public/*` route authenticates the calling project, see [`crate::auth`].
//!
//! # OpenAPI Documentation
//!
//! All endpoints are documented with `utoipa` annotations. The document is served at
//! `/api-docs/openapi.json` and rendered at `/docs`.

pub mod handlers;
pub mod models;
