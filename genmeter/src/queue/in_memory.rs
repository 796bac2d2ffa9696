//! In-memory queue for tests and single-process development.
//!
//! Same delivery semantics as the Redis queue, without durability: a process restart loses
//! everything.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use super::{Envelope, IngestionQueue, NackOutcome, QueueDepth, QueueMessage, Result};
use crate::usage::GenerationEvent;

#[derive(Default)]
struct Lists {
    // new messages at the front, oldest at the back
    pending: VecDeque<String>,
    processing: Vec<String>,
    dead: Vec<String>,
}

impl Lists {
    fn remove_processing(&mut self, raw: &str) -> bool {
        match self.processing.iter().position(|m| m == raw) {
            Some(index) => {
                self.processing.remove(index);
                true
            }
            None => false,
        }
    }
}

#[derive(Clone)]
pub struct InMemoryQueue {
    lists: Arc<Mutex<Lists>>,
    max_attempts: u32,
}

impl InMemoryQueue {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            lists: Arc::new(Mutex::new(Lists::default())),
            max_attempts,
        }
    }

    /// Dead-lettered envelopes, for inspection in tests
    pub fn dead_letters(&self) -> Vec<Envelope> {
        self.lists
            .lock()
            .dead
            .iter()
            .filter_map(|raw| serde_json::from_str(raw).ok())
            .collect()
    }
}

#[async_trait::async_trait]
impl IngestionQueue for InMemoryQueue {
    async fn enqueue(&self, project_id: &str, event: GenerationEvent) -> Result<Uuid> {
        let envelope = Envelope::new(project_id, event);
        let payload = serde_json::to_string(&envelope)?;
        self.lists.lock().pending.push_front(payload);
        Ok(envelope.message_id)
    }

    async fn dequeue(&self) -> Result<Option<QueueMessage>> {
        let mut lists = self.lists.lock();
        while let Some(raw) = lists.pending.pop_back() {
            match QueueMessage::decode(raw.clone()) {
                Ok(message) => {
                    lists.processing.push(raw);
                    return Ok(Some(message));
                }
                Err(e) => {
                    tracing::error!("Dead-lettering malformed queue message: {}", e);
                    lists.dead.push(raw);
                }
            }
        }
        Ok(None)
    }

    async fn ack(&self, message: &QueueMessage) -> Result<()> {
        if !self.lists.lock().remove_processing(&message.raw) {
            tracing::warn!(message_id = %message.envelope.message_id, "Acked message was not in the processing list");
        }
        Ok(())
    }

    async fn nack(&self, message: &QueueMessage) -> Result<NackOutcome> {
        let retried = message.envelope.retried();
        let payload = serde_json::to_string(&retried)?;

        let mut lists = self.lists.lock();
        lists.remove_processing(&message.raw);
        if retried.attempts >= self.max_attempts {
            lists.dead.push(message.raw.clone());
            return Ok(NackOutcome::DeadLettered);
        }
        lists.pending.push_front(payload);
        Ok(NackOutcome::Requeued {
            attempts: retried.attempts,
        })
    }

    async fn recover(&self) -> Result<usize> {
        let mut lists = self.lists.lock();
        let in_flight: Vec<String> = lists.processing.drain(..).collect();
        let recovered = in_flight.len();
        for raw in in_flight {
            lists.pending.push_back(raw);
        }
        Ok(recovered)
    }

    async fn depth(&self) -> Result<QueueDepth> {
        let lists = self.lists.lock();
        Ok(QueueDepth {
            pending: lists.pending.len() as u64,
            processing: lists.processing.len() as u64,
            dead: lists.dead.len() as u64,
        })
    }
}
