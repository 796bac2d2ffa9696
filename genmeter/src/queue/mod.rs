//! Durable ingestion queue between the API and the resolution worker.
//!
//! The API enqueues validated generation events and returns immediately; the worker dequeues
//! them, resolves usage and cost, persists the result and acknowledges the message. Delivery is
//! at-least-once:
//!
//! - a dequeued message stays in the consumer's processing list until it is acked,
//! - a nacked message is re-enqueued with an incremented attempt count, or moved to the
//!   dead-letter list once it has used up its attempts,
//! - messages left in the processing list by a crashed consumer are moved back to pending by
//!   [`IngestionQueue::recover`] when that consumer starts again.
//!
//! A redelivered message is merged into the stored generation again: its fields are written
//! over whatever later events set for the same generation. Concurrent messages for one
//! generation are serialized by the worker's conditional writes, not by the queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::types::ProjectId;
use crate::usage::GenerationEvent;

pub mod in_memory;
pub mod redis_queue;

#[cfg(test)]
mod tests;

pub use in_memory::InMemoryQueue;
pub use redis_queue::RedisQueue;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Invalid queue message: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The Redis server may evict queued messages
    #[error("Redis maxmemory-policy is '{0}', but the ingestion queue requires 'noeviction'")]
    EvictionPolicy(String),
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// What travels through the queue: the event plus delivery bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub message_id: Uuid,
    /// Failed processing attempts so far
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    pub project_id: ProjectId,
    pub event: GenerationEvent,
}

impl Envelope {
    pub fn new(project_id: impl Into<ProjectId>, event: GenerationEvent) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            attempts: 0,
            enqueued_at: Utc::now(),
            project_id: project_id.into(),
            event,
        }
    }

    fn retried(&self) -> Self {
        Self {
            attempts: self.attempts + 1,
            ..self.clone()
        }
    }
}

/// A dequeued message. Must be handed back through [`IngestionQueue::ack`] or
/// [`IngestionQueue::nack`].
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub envelope: Envelope,
    // exact payload as stored, needed to remove it from the processing list
    raw: String,
}

impl QueueMessage {
    fn decode(raw: String) -> Result<Self> {
        let envelope = serde_json::from_str(&raw)?;
        Ok(Self { envelope, raw })
    }
}

/// Result of giving a message back after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    Requeued { attempts: u32 },
    DeadLettered,
}

/// Number of messages per list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, utoipa::ToSchema)]
pub struct QueueDepth {
    pub pending: u64,
    /// In flight for this consumer
    pub processing: u64,
    pub dead: u64,
}

#[async_trait::async_trait]
pub trait IngestionQueue: Send + Sync {
    /// Add an event for the given project. Returns the message id.
    async fn enqueue(&self, project_id: &str, event: GenerationEvent) -> Result<Uuid>;

    /// Take the oldest pending message and move it to this consumer's processing list.
    /// Returns `None` when nothing is pending.
    async fn dequeue(&self) -> Result<Option<QueueMessage>>;

    /// Processing succeeded; drop the message.
    async fn ack(&self, message: &QueueMessage) -> Result<()>;

    /// Processing failed; retry the message later or dead-letter it.
    async fn nack(&self, message: &QueueMessage) -> Result<NackOutcome>;

    /// Move everything left in this consumer's processing list back to pending.
    /// Returns the number of recovered messages.
    async fn recover(&self) -> Result<usize>;

    async fn depth(&self) -> Result<QueueDepth>;
}
