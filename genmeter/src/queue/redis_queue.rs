//! Redis list-based queue.
//!
//! Keys, with `<prefix>` from configuration:
//!
//! - `<prefix>:pending`: new and retried messages; producers `LPUSH`, consumers take from the right
//! - `<prefix>:processing:<consumer>`: messages a consumer is working on (`LMOVE` from pending)
//! - `<prefix>:dead`: messages that used up their attempts
//!
//! Messages are JSON [`Envelope`]s. Ack and nack remove the exact stored payload with `LREM`.

use std::collections::HashMap;

use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::{Envelope, IngestionQueue, NackOutcome, QueueDepth, QueueError, QueueMessage, Result};
use crate::usage::GenerationEvent;

const NOEVICTION: &str = "noeviction";

#[derive(Debug, Clone)]
pub struct RedisQueueSettings {
    pub key_prefix: String,
    /// Stable per process, so a restarted process recovers its own in-flight messages
    pub consumer_id: String,
    /// Processing attempts before a message is dead-lettered
    pub max_attempts: u32,
}

#[derive(Clone)]
pub struct RedisQueue {
    conn: ConnectionManager,
    pending_key: String,
    processing_key: String,
    dead_key: String,
    max_attempts: u32,
}

impl RedisQueue {
    /// Connect to Redis. The connection manager reconnects on its own after failures.
    pub async fn connect(url: &str, settings: RedisQueueSettings) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!(consumer_id = %settings.consumer_id, "Connected to Redis ingestion queue");
        Ok(Self::with_connection(conn, settings))
    }

    pub fn with_connection(conn: ConnectionManager, settings: RedisQueueSettings) -> Self {
        let prefix = settings.key_prefix;
        Self {
            conn,
            pending_key: format!("{prefix}:pending"),
            processing_key: format!("{prefix}:processing:{}", settings.consumer_id),
            dead_key: format!("{prefix}:dead"),
            max_attempts: settings.max_attempts,
        }
    }

    /// Make sure Redis will not evict queued messages under memory pressure.
    ///
    /// A policy other than `noeviction` is logged as an error and rejected when `required` is
    /// set. Managed Redis offerings often refuse `CONFIG`; that only produces a warning.
    pub async fn check_eviction_policy(&self, required: bool) -> Result<()> {
        let mut conn = self.conn.clone();
        let reply: redis::RedisResult<HashMap<String, String>> = redis::cmd("CONFIG")
            .arg("GET")
            .arg("maxmemory-policy")
            .query_async(&mut conn)
            .await;

        match reply {
            Ok(values) => match values.get("maxmemory-policy") {
                Some(policy) if policy == NOEVICTION => {
                    debug!("Redis maxmemory-policy is noeviction");
                    Ok(())
                }
                Some(policy) => {
                    error!(
                        policy = %policy,
                        "Redis maxmemory-policy must be 'noeviction', queued generations may be lost"
                    );
                    if required {
                        Err(QueueError::EvictionPolicy(policy.clone()))
                    } else {
                        Ok(())
                    }
                }
                None => {
                    warn!("Redis did not report a maxmemory-policy, unable to verify eviction settings");
                    Ok(())
                }
            },
            Err(e) => {
                warn!("Unable to read Redis maxmemory-policy, make sure it is 'noeviction': {}", e);
                Ok(())
            }
        }
    }

    async fn dead_letter_raw(&self, raw: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .lrem(&self.processing_key, 1, raw)
            .ignore()
            .lpush(&self.dead_key, raw)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl IngestionQueue for RedisQueue {
    #[instrument(skip(self, event), fields(generation_id = %event.id), err)]
    async fn enqueue(&self, project_id: &str, event: GenerationEvent) -> Result<Uuid> {
        let envelope = Envelope::new(project_id, event);
        let payload = serde_json::to_string(&envelope)?;

        let mut conn = self.conn.clone();
        let _: () = conn.lpush(&self.pending_key, payload).await?;
        Ok(envelope.message_id)
    }

    async fn dequeue(&self) -> Result<Option<QueueMessage>> {
        let mut conn = self.conn.clone();
        loop {
            let raw: Option<String> = redis::cmd("LMOVE")
                .arg(&self.pending_key)
                .arg(&self.processing_key)
                .arg("RIGHT")
                .arg("LEFT")
                .query_async(&mut conn)
                .await?;

            let Some(raw) = raw else {
                return Ok(None);
            };

            match QueueMessage::decode(raw.clone()) {
                Ok(message) => return Ok(Some(message)),
                Err(e) => {
                    // Undecodable payloads can never succeed
                    error!("Dead-lettering malformed queue message: {}", e);
                    self.dead_letter_raw(&raw).await?;
                }
            }
        }
    }

    #[instrument(skip(self, message), fields(message_id = %message.envelope.message_id), err)]
    async fn ack(&self, message: &QueueMessage) -> Result<()> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.lrem(&self.processing_key, 1, &message.raw).await?;
        if removed == 0 {
            warn!("Acked message was not in the processing list");
        }
        Ok(())
    }

    #[instrument(skip(self, message), fields(message_id = %message.envelope.message_id), err)]
    async fn nack(&self, message: &QueueMessage) -> Result<NackOutcome> {
        let retried = message.envelope.retried();
        let mut conn = self.conn.clone();

        if retried.attempts >= self.max_attempts {
            self.dead_letter_raw(&message.raw).await?;
            return Ok(NackOutcome::DeadLettered);
        }

        let payload = serde_json::to_string(&retried)?;
        let _: () = redis::pipe()
            .atomic()
            .lrem(&self.processing_key, 1, &message.raw)
            .ignore()
            .lpush(&self.pending_key, payload)
            .ignore()
            .query_async(&mut conn)
            .await?;

        Ok(NackOutcome::Requeued {
            attempts: retried.attempts,
        })
    }

    #[instrument(skip(self), err)]
    async fn recover(&self) -> Result<usize> {
        let mut conn = self.conn.clone();
        let mut recovered = 0;
        loop {
            let moved: Option<String> = redis::cmd("LMOVE")
                .arg(&self.processing_key)
                .arg(&self.pending_key)
                .arg("RIGHT")
                .arg("RIGHT")
                .query_async(&mut conn)
                .await?;
            if moved.is_none() {
                break;
            }
            recovered += 1;
        }

        if recovered > 0 {
            info!(recovered, "Recovered in-flight messages from a previous run");
        }
        Ok(recovered)
    }

    async fn depth(&self) -> Result<QueueDepth> {
        let mut conn = self.conn.clone();
        let (pending, processing, dead): (u64, u64, u64) = redis::pipe()
            .llen(&self.pending_key)
            .llen(&self.processing_key)
            .llen(&self.dead_key)
            .query_async(&mut conn)
            .await?;
        Ok(QueueDepth {
            pending,
            processing,
            dead,
        })
    }
}
