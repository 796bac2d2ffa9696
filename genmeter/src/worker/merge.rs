//! Folding generation events into the stored record.

use crate::db::models::generations::{GenerationDBResponse, GenerationUpsertDBRequest};
use crate::usage::{CostDetails, GenerationEvent, UsageDetails};

fn overlay<T: Clone>(target: &mut Option<T>, value: &Option<T>) {
    if let Some(value) = value {
        *target = Some(value.clone());
    }
}

/// Merge an event into the existing generation, if any.
///
/// Fields present in the event replace stored ones, absent fields keep their stored value. A
/// generation seen for the first time without a start time starts at the event timestamp.
/// Calculated values and the model link are cleared; the caller resolves them again from the
/// merged record. The result is a conditional write against the revision that was read.
pub fn merge_event(
    existing: Option<GenerationDBResponse>,
    project_id: &str,
    event: &GenerationEvent,
) -> GenerationUpsertDBRequest {
    let mut merged = match existing {
        Some(generation) => {
            let mut merged = GenerationUpsertDBRequest::from(generation);
            if let Some(unit) = event.unit {
                merged.unit = unit;
            }
            if let Some(start_time) = event.start_time {
                merged.start_time = start_time;
            }
            merged
        }
        None => GenerationUpsertDBRequest {
            project_id: project_id.to_string(),
            id: event.id.clone(),
            trace_id: None,
            name: None,
            model: None,
            unit: event.unit.unwrap_or_default(),
            start_time: event.start_time.unwrap_or(event.timestamp),
            end_time: None,
            input: None,
            output: None,
            provided_usage: UsageDetails::default(),
            provided_cost: CostDetails::default(),
            calculated_usage: UsageDetails::default(),
            calculated_cost: CostDetails::default(),
            internal_model_id: None,
            expected_revision: None,
        },
    };

    overlay(&mut merged.trace_id, &event.trace_id);
    overlay(&mut merged.name, &event.name);
    overlay(&mut merged.model, &event.model);
    overlay(&mut merged.end_time, &event.end_time);
    overlay(&mut merged.input, &event.input);
    overlay(&mut merged.output, &event.output);
    merged.provided_usage = event.usage.or(&merged.provided_usage);
    merged.provided_cost = event.cost.or(&merged.provided_cost);

    merged.calculated_usage = UsageDetails::default();
    merged.calculated_cost = CostDetails::default();
    merged.internal_model_id = None;
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usage::{GenerationEventKind, UsageUnit};
    use chrono::{Duration, Utc};

    fn event(kind: GenerationEventKind) -> GenerationEvent {
        GenerationEvent {
            event_id: "evt".to_string(),
            kind,
            timestamp: Utc::now(),
            id: "g1".to_string(),
            trace_id: None,
            name: None,
            model: None,
            unit: None,
            start_time: None,
            end_time: None,
            input: None,
            output: None,
            usage: UsageDetails::default(),
            cost: CostDetails::default(),
        }
    }

    fn stored(request: GenerationUpsertDBRequest) -> GenerationDBResponse {
        GenerationDBResponse {
            project_id: request.project_id,
            id: request.id,
            trace_id: request.trace_id,
            name: request.name,
            model: request.model,
            unit: request.unit,
            start_time: request.start_time,
            end_time: request.end_time,
            input: request.input,
            output: request.output,
            provided_usage: request.provided_usage,
            provided_cost: request.provided_cost,
            calculated_usage: request.calculated_usage,
            calculated_cost: request.calculated_cost,
            internal_model_id: request.internal_model_id,
            revision: 3,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_new_generation_defaults() {
        let create = event(GenerationEventKind::GenerationCreate);
        let merged = merge_event(None, "p1", &create);

        assert_eq!(merged.project_id, "p1");
        assert_eq!(merged.unit, UsageUnit::Tokens);
        assert_eq!(merged.start_time, create.timestamp);
        assert_eq!(merged.expected_revision, None);
    }

    #[test]
    fn test_update_keeps_fields_it_does_not_carry() {
        let mut create = event(GenerationEventKind::GenerationCreate);
        create.model = Some("gpt-4o".to_string());
        create.input = Some(serde_json::json!("question"));
        create.start_time = Some(Utc::now() - Duration::minutes(5));
        create.usage.input = Some(10);
        let first = merge_event(None, "p1", &create);

        let mut update = event(GenerationEventKind::GenerationUpdate);
        update.output = Some(serde_json::json!("answer"));
        update.end_time = Some(Utc::now());
        update.usage.output = Some(4);
        let mut existing = stored(first.clone());
        existing.calculated_usage.total = Some(14);
        existing.internal_model_id = Some(uuid::Uuid::new_v4());

        let merged = merge_event(Some(existing), "p1", &update);

        assert_eq!(merged.model.as_deref(), Some("gpt-4o"));
        assert_eq!(merged.input, Some(serde_json::json!("question")));
        assert_eq!(merged.output, Some(serde_json::json!("answer")));
        assert_eq!(merged.start_time, first.start_time);
        assert_eq!(merged.provided_usage.input, Some(10));
        assert_eq!(merged.provided_usage.output, Some(4));
        // recomputed by the worker
        assert_eq!(merged.calculated_usage, UsageDetails::default());
        assert_eq!(merged.internal_model_id, None);
        assert_eq!(merged.expected_revision, Some(3));
    }

    #[test]
    fn test_event_values_replace_stored_ones() {
        let mut create = event(GenerationEventKind::GenerationCreate);
        create.model = Some("gpt-4o".to_string());
        create.unit = Some(UsageUnit::Characters);
        let existing = stored(merge_event(None, "p1", &create));

        let mut update = event(GenerationEventKind::GenerationUpdate);
        update.model = Some("gpt-4o-mini".to_string());
        let merged = merge_event(Some(existing), "p1", &update);

        assert_eq!(merged.model.as_deref(), Some("gpt-4o-mini"));
        assert_eq!(merged.unit, UsageUnit::Characters);
    }
}
