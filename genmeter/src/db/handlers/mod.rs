//! Repository implementations for database access.
//!
//! Each repository wraps a SQLx connection or transaction and implements the [`Repository`]
//! trait for its table:
//!
//! - [`ModelDefinitions`]: price/tokenizer definitions, including the system-maintained ones
//!   synced from configuration
//! - [`Generations`]: ingested generations with their provided and calculated usage and cost
//!
//! ```ignore
//! use genmeter::db::handlers::{ModelDefinitions, Repository};
//!
//! let mut tx = pool.begin().await?;
//! let mut repo = ModelDefinitions::new(&mut tx);
//! let definition = repo.create(&request).await?;
//! tx.commit().await?;
//! ```

pub mod generations;
pub mod model_definitions;
pub mod repository;

pub use generations::Generations;
pub use model_definitions::ModelDefinitions;
pub use repository::Repository;
