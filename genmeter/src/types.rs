//! Common type definitions.
//!
//! # ID Types
//!
//! - [`ModelDefinitionId`]: model definition identifier (UUID)
//! - [`ProjectId`]: project identifier, taken from the authenticated key pair
//! - [`GenerationId`]: client-supplied generation identifier
//!
//! Generations are addressed by the pair of project and generation id, see [`GenerationKey`].
//!
//! # Utility Functions
//!
//! - [`abbrev_uuid`]: Abbreviate UUIDs to first 8 chars for logging

use std::fmt;
use uuid::Uuid;

// Type aliases for IDs
pub type ModelDefinitionId = Uuid;
pub type ProjectId = String;
pub type GenerationId = String;

/// Abbreviate a UUID to its first 8 characters for more readable logs and traces
/// Example: "550e8400-e29b-41d4-a716-446655440000" -> "550e8400"
pub fn abbrev_uuid(uuid: &Uuid) -> String {
    uuid.to_string().chars().take(8).collect()
}

/// Composite key of a generation: client ids are only unique within a project.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GenerationKey {
    pub project_id: ProjectId,
    pub id: GenerationId,
}

impl GenerationKey {
    pub fn new(project_id: impl Into<ProjectId>, id: impl Into<GenerationId>) -> Self {
        Self {
            project_id: project_id.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for GenerationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.project_id, self.id)
    }
}

// Operations that can be rejected on protected entities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Read,
    Update,
    Delete,
    Reprice,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Create => write!(f, "Create"),
            Operation::Read => write!(f, "Read"),
            Operation::Update => write!(f, "Update"),
            Operation::Delete => write!(f, "Delete"),
            Operation::Reprice => write!(f, "Reprice"),
        }
    }
}
