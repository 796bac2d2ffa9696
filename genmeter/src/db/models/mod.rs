//! Database record structures.
//!
//! Each module holds the create/update request types passed into a repository and the response
//! type it returns. Row structs deriving `sqlx::FromRow` stay private to the repositories.

pub mod generations;
pub mod model_definitions;
