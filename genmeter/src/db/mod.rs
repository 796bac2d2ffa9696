//! Database layer for data persistence and access.
//!
//! This module implements the Postgres data access layer using SQLx. It follows the Repository
//! pattern; the [`crate::storage`] module builds the backend-agnostic `Storage` interface on top
//! of it.
//!
//! ```text
//! ┌─────────────┐
//! │  Storage    │  (storage::postgres - transactions, catalog loading)
//! └──────┬──────┘
//!        │
//!        ↓
//! ┌─────────────┐
//! │ Repositories│  (db::handlers - queries)
//! └──────┬──────┘
//!        │
//!        ↓
//! ┌─────────────┐
//! │   Models    │  (db::models - request/response records)
//! └──────┬──────┘
//!        │
//!        ↓
//! ┌─────────────┐
//! │  PostgreSQL │
//! └─────────────┘
//! ```
//!
//! # Migrations
//!
//! Migrations live in the `migrations/` directory and are embedded with [`crate::migrator`]:
//!
//! ```ignore
//! genmeter::migrator().run(&pool).await?;
//! ```

pub mod errors;
pub mod handlers;
pub mod models;
