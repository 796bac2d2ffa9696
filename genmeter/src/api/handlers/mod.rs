//! HTTP request handlers for all API endpoints.
//!
//! Each handler authenticates the calling project through the
//! [`AuthenticatedProject`](crate::auth::AuthenticatedProject) extractor, works on the
//! [`Storage`](crate::storage::Storage) and [`IngestionQueue`](crate::queue::IngestionQueue)
//! trait objects held by [`AppState`](crate::AppState), and converts records into
//! [`crate::api::models`] responses.
//!
//! # Handler Modules
//!
//! - [`generations`]: Reading resolved generations
//! - [`health`]: Queue depth and catalog size
//! - [`ingestion`]: Batched generation events
//! - [`model_definitions`]: Model definition CRUD and repricing
//!
//! # Error Handling
//!
//! Handlers return [`crate::errors::Error`], which converts to the matching HTTP status code
//! and a user-safe message.

pub mod generations;
pub mod health;
pub mod ingestion;
pub mod model_definitions;
