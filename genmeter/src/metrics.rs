//! Prometheus metrics for ingestion and resolution.
//!
//! Registered in the default registry, which the `/internal/metrics` endpoint renders next to the
//! HTTP metrics from `axum-prometheus`.

use once_cell::sync::Lazy;
use prometheus::{Histogram, IntCounterVec, register_histogram, register_int_counter_vec};

use crate::queue::NackOutcome;
use crate::usage::ValueSource;

/// Events accepted or rejected by the ingestion endpoint
static INGESTION_EVENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "genmeter_ingestion_events_total",
        "Generation events received by the ingestion endpoint",
        &["type", "result"]
    )
    .expect("Failed to register genmeter_ingestion_events_total metric")
});

/// Resolved generations by where their total usage and cost came from
static GENERATIONS_RESOLVED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "genmeter_generations_resolved_total",
        "Generations resolved by the ingestion worker",
        &["matched", "usage_source", "cost_source"]
    )
    .expect("Failed to register genmeter_generations_resolved_total metric")
});

static QUEUE_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "genmeter_queue_failures_total",
        "Queue messages that failed processing",
        &["outcome"]
    )
    .expect("Failed to register genmeter_queue_failures_total metric")
});

/// Time between enqueueing an event and persisting its resolution
/// Buckets: 10ms, 50ms, 100ms, 500ms, 1s, 5s, 10s, 30s, 60s, 300s
static INGESTION_LAG_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "genmeter_ingestion_lag_seconds",
        "Time between enqueueing a generation event and persisting its resolution (seconds)",
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0]
    )
    .expect("Failed to register genmeter_ingestion_lag_seconds metric")
});

fn source_label(source: ValueSource) -> &'static str {
    match source {
        ValueSource::Ingested => "ingested",
        ValueSource::Inferred => "inferred",
        ValueSource::Absent => "absent",
    }
}

/// Record an ingestion event; `accepted` is false for events rejected during validation
pub fn record_ingestion_event(event_type: &str, accepted: bool) {
    let result = if accepted { "accepted" } else { "rejected" };
    INGESTION_EVENTS.with_label_values(&[event_type, result]).inc();
}

pub fn record_resolution(matched: bool, usage_source: ValueSource, cost_source: ValueSource) {
    let matched = if matched { "true" } else { "false" };
    GENERATIONS_RESOLVED
        .with_label_values(&[matched, source_label(usage_source), source_label(cost_source)])
        .inc();
}

pub fn record_queue_failure(outcome: NackOutcome) {
    let outcome = match outcome {
        NackOutcome::Requeued { .. } => "requeued",
        NackOutcome::DeadLettered => "dead_lettered",
    };
    QUEUE_FAILURES.with_label_values(&[outcome]).inc();
}

pub fn record_ingestion_lag(lag_seconds: f64) {
    INGESTION_LAG_SECONDS.observe(lag_seconds.max(0.0));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_counter_labels() {
        let counter = GENERATIONS_RESOLVED.with_label_values(&["true", "inferred", "absent"]);
        let before = counter.get();
        record_resolution(true, ValueSource::Inferred, ValueSource::Absent);
        assert_eq!(counter.get(), before + 1);
    }

    #[test]
    fn test_dead_letters_are_counted_separately() {
        let dead = QUEUE_FAILURES.with_label_values(&["dead_lettered"]);
        let before = dead.get();
        record_queue_failure(NackOutcome::DeadLettered);
        record_queue_failure(NackOutcome::Requeued { attempts: 1 });
        assert_eq!(dead.get(), before + 1);
    }
}
