//! Request and response types of the public API.
//!
//! API types use camelCase field names and convert from the `db::models` records. They never
//! expose the provided/calculated split directly: reported values are the effective ones, each
//! tagged with its [`crate::usage::ValueSource`].

pub mod generations;
pub mod ingestion;
pub mod model_definitions;
pub mod pagination;
