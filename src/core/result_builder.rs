//! Folds a final pipeline state into a `RunResult`.
//!
//! Pure and total: any state, including an empty one from a run that
//! aborted on its first step, produces a valid result.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::domain::{fields, OutputDescriptor, PipelineState, RunResult, RunStatus};

/// Build the terminal summary for a run.
///
/// `step_order` lists the pipeline's steps; completed steps are reported in
/// that order, followed by any completed step it doesn't name.
pub fn build(
    state: &PipelineState,
    status: RunStatus,
    step_order: &[&str],
    finished_at: DateTime<Utc>,
) -> RunResult {
    RunResult {
        run_id: state.run_id,
        status,
        completed_steps: completed_steps(state, step_order),
        stage_counts: stage_counts(state),
        errors: state.errors.clone(),
        outputs: outputs(state),
        email_sent: matches!(state.field(fields::EMAIL_SENT), Some(Value::Bool(true))),
        cost_usd: state.totals.cost_usd,
        tokens: state.totals.tokens,
        duration_ms: state.totals.elapsed_ms,
        finished_at,
    }
}

fn completed_steps(state: &PipelineState, step_order: &[&str]) -> Vec<String> {
    let ordered = step_order
        .iter()
        .filter(|name| state.is_completed(name))
        .map(|name| name.to_string());
    let unlisted = state
        .completed
        .iter()
        .filter(|name| !step_order.contains(&name.as_str()))
        .cloned();
    ordered.chain(unlisted).collect()
}

/// Item counts for every collection-valued field
fn stage_counts(state: &PipelineState) -> BTreeMap<String, usize> {
    state
        .fields
        .iter()
        .filter_map(|(name, value)| match value {
            Value::Array(items) => Some((name.clone(), items.len())),
            Value::Object(map) if name != fields::PROFILE && name != fields::PREFERENCES => {
                Some((name.clone(), map.len()))
            }
            _ => None,
        })
        .collect()
}

/// Output descriptors written by the aggregate step; malformed entries are skipped
fn outputs(state: &PipelineState) -> Vec<OutputDescriptor> {
    match state.field(fields::OUTPUTS) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| serde_json::from_value(item.clone()).ok())
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{StateDelta, StepError};
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn test_build_from_empty_state() {
        let mut state = PipelineState::new(Uuid::new_v4());
        state.push_error(StepError::new(Some("parse-input"), "fatal", "unreadable pdf"));

        let finished_at = Utc::now();
        let result = build(&state, RunStatus::Failed, &[], finished_at);

        assert_eq!(result.status, RunStatus::Failed);
        assert!(result.completed_steps.is_empty());
        assert!(result.stage_counts.is_empty());
        assert!(result.outputs.is_empty());
        assert!(!result.email_sent);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.finished_at, finished_at);
    }

    #[test]
    fn test_counts_and_outputs() {
        let mut state = PipelineState::new(Uuid::new_v4());
        state.merge(
            "score-items",
            &StateDelta::new()
                .with_field(fields::PROFILE, json!({"name": "Ada", "skills": ["rust"]}))
                .with_field(fields::DISCOVERED, json!(["board-a", "board-b"]))
                .with_field(fields::SCORED_ITEMS, json!([{"score": 0.9}]))
                .with_field(
                    fields::OUTPUTS,
                    json!([
                        {"format": "json", "path": "/out/jobs.json"},
                        {"unexpected": true}
                    ]),
                )
                .with_field(fields::EMAIL_SENT, json!(true)),
        );
        state.mark_completed("score-items");
        state.record_usage(1.25, 900);
        state.record_timing("score-items", 1200, 1);

        let result = build(&state, RunStatus::Success, &["score-items"], Utc::now());

        assert_eq!(result.stage_counts[fields::DISCOVERED], 2);
        assert_eq!(result.stage_counts[fields::SCORED_ITEMS], 1);
        assert!(!result.stage_counts.contains_key(fields::PROFILE));
        assert_eq!(
            result.outputs,
            vec![OutputDescriptor {
                format: "json".to_string(),
                path: "/out/jobs.json".to_string(),
            }]
        );
        assert!(result.email_sent);
        assert_eq!(result.cost_usd, 1.25);
        assert_eq!(result.tokens, 900);
        assert_eq!(result.duration_ms, 1200);
        assert_eq!(result.completed_steps, vec!["score-items".to_string()]);
    }

    #[test]
    fn test_completed_steps_follow_pipeline_order() {
        let mut state = PipelineState::new(Uuid::new_v4());
        for step in ["notify", "parse-input", "score-items", "legacy-step"] {
            state.mark_completed(step);
        }
        let order = ["parse-input", "fetch-raw-items", "score-items", "notify"];

        let result = build(&state, RunStatus::Partial, &order, Utc::now());

        assert_eq!(
            result.completed_steps,
            vec!["parse-input", "score-items", "notify", "legacy-step"]
        );
    }

    #[test]
    fn test_same_inputs_same_result() {
        let mut state = PipelineState::new(Uuid::new_v4());
        state.mark_completed("parse-input");
        state.push_error(StepError::new(Some("parse-criteria"), "recoverable", "odd criteria"));
        let finished_at = Utc::now();

        let first = build(&state, RunStatus::Partial, &["parse-input"], finished_at);
        let second = build(&state, RunStatus::Partial, &["parse-input"], finished_at);

        assert_eq!(first, second);
    }
}
