use chrono::Utc;
use rstest::{fixture, rstest};

use crate::queue::redis_queue::RedisQueueSettings;
use crate::queue::{InMemoryQueue, IngestionQueue, NackOutcome, QueueDepth, QueueMessage, RedisQueue};
use crate::usage::{GenerationEvent, GenerationEventKind, UsageDetails};

const MAX_ATTEMPTS: u32 = 3;

fn event(id: &str) -> GenerationEvent {
    GenerationEvent {
        event_id: format!("evt-{id}"),
        kind: GenerationEventKind::GenerationCreate,
        timestamp: Utc::now(),
        id: id.to_string(),
        trace_id: None,
        name: None,
        model: Some("gpt-4o".to_string()),
        unit: None,
        start_time: None,
        end_time: None,
        input: Some(serde_json::json!("hello")),
        output: None,
        usage: UsageDetails {
            input: Some(1),
            output: None,
            total: None,
        },
        cost: Default::default(),
    }
}

#[fixture]
fn in_memory_queue() -> InMemoryQueue {
    InMemoryQueue::new(MAX_ATTEMPTS)
}

async fn redis_queue(consumer_id: &str) -> RedisQueue {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    RedisQueue::connect(
        &url,
        RedisQueueSettings {
            key_prefix: format!("genmeter-test-{}", uuid::Uuid::new_v4()),
            consumer_id: consumer_id.to_string(),
            max_attempts: MAX_ATTEMPTS,
        },
    )
    .await
    .unwrap()
}

async fn dequeue_one<Q: IngestionQueue>(queue: &Q) -> QueueMessage {
    queue.dequeue().await.unwrap().expect("a pending message")
}

async fn run_test_fifo_and_ack<Q: IngestionQueue>(queue: &Q) {
    assert!(queue.dequeue().await.unwrap().is_none());

    let first_id = queue.enqueue("p1", event("g1")).await.unwrap();
    queue.enqueue("p1", event("g2")).await.unwrap();

    let first = dequeue_one(queue).await;
    assert_eq!(first.envelope.message_id, first_id);
    assert_eq!(first.envelope.project_id, "p1");
    assert_eq!(first.envelope.event.id, "g1");
    assert_eq!(first.envelope.event.usage.input, Some(1));
    assert_eq!(first.envelope.attempts, 0);

    assert_eq!(
        queue.depth().await.unwrap(),
        QueueDepth {
            pending: 1,
            processing: 1,
            dead: 0
        }
    );

    queue.ack(&first).await.unwrap();
    let second = dequeue_one(queue).await;
    assert_eq!(second.envelope.event.id, "g2");
    queue.ack(&second).await.unwrap();

    assert_eq!(queue.depth().await.unwrap(), QueueDepth::default());
}

#[rstest]
#[tokio::test]
async fn test_fifo_and_ack(in_memory_queue: InMemoryQueue) {
    run_test_fifo_and_ack(&in_memory_queue).await;
}

#[tokio::test]
#[ignore = "requires redis"]
async fn test_fifo_and_ack_redis() {
    run_test_fifo_and_ack(&redis_queue("consumer-a").await).await;
}

async fn run_test_nack_retries_then_dead_letters<Q: IngestionQueue>(queue: &Q) {
    queue.enqueue("p1", event("poison")).await.unwrap();

    for expected_attempts in 1..MAX_ATTEMPTS {
        let message = dequeue_one(queue).await;
        assert_eq!(message.envelope.attempts, expected_attempts - 1);
        let outcome = queue.nack(&message).await.unwrap();
        assert_eq!(
            outcome,
            NackOutcome::Requeued {
                attempts: expected_attempts
            }
        );
    }

    let last = dequeue_one(queue).await;
    assert_eq!(queue.nack(&last).await.unwrap(), NackOutcome::DeadLettered);

    assert!(queue.dequeue().await.unwrap().is_none());
    assert_eq!(
        queue.depth().await.unwrap(),
        QueueDepth {
            pending: 0,
            processing: 0,
            dead: 1
        }
    );
}

#[rstest]
#[tokio::test]
async fn test_nack_retries_then_dead_letters(in_memory_queue: InMemoryQueue) {
    run_test_nack_retries_then_dead_letters(&in_memory_queue).await;
}

#[tokio::test]
#[ignore = "requires redis"]
async fn test_nack_retries_then_dead_letters_redis() {
    run_test_nack_retries_then_dead_letters(&redis_queue("consumer-a").await).await;
}

async fn run_test_recover_unacked_messages<Q: IngestionQueue>(queue: &Q) {
    queue.enqueue("p1", event("g1")).await.unwrap();
    queue.enqueue("p1", event("g2")).await.unwrap();

    // consumer crashes with both messages in flight
    let _ = dequeue_one(queue).await;
    let _ = dequeue_one(queue).await;
    assert!(queue.dequeue().await.unwrap().is_none());

    assert_eq!(queue.recover().await.unwrap(), 2);
    assert_eq!(queue.depth().await.unwrap().pending, 2);

    let mut ids = vec![
        dequeue_one(queue).await.envelope.event.id,
        dequeue_one(queue).await.envelope.event.id,
    ];
    ids.sort();
    assert_eq!(ids, vec!["g1".to_string(), "g2".to_string()]);
}

#[rstest]
#[tokio::test]
async fn test_recover_unacked_messages(in_memory_queue: InMemoryQueue) {
    run_test_recover_unacked_messages(&in_memory_queue).await;
}

#[tokio::test]
#[ignore = "requires redis"]
async fn test_recover_unacked_messages_redis() {
    run_test_recover_unacked_messages(&redis_queue("consumer-a").await).await;
}

#[tokio::test]
async fn test_dead_letters_keep_the_event() {
    let queue = InMemoryQueue::new(1);
    queue.enqueue("p1", event("poison")).await.unwrap();
    let message = dequeue_one(&queue).await;
    assert_eq!(queue.nack(&message).await.unwrap(), NackOutcome::DeadLettered);

    let dead = queue.dead_letters();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].event.id, "poison");
}

#[tokio::test]
#[ignore = "requires redis"]
async fn test_eviction_policy_check_redis() {
    let queue = redis_queue("consumer-a").await;
    // only fails hard when required and the policy is wrong
    queue.check_eviction_policy(false).await.unwrap();
}
