//! Mutable run state threaded through every step.
//!
//! Steps never touch `PipelineState` directly. They return a `StateDelta`
//! and the orchestrator folds it in with `merge`, which enforces that fields
//! finalized by a completed step are never rewritten.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

/// Well-known field names written by the standard job-search steps
pub mod fields {
    pub const PROFILE: &str = "profile";
    pub const PREFERENCES: &str = "preferences";
    pub const DISCOVERED: &str = "discovered";
    pub const RAW_ITEMS: &str = "raw_items";
    pub const NORMALIZED_ITEMS: &str = "normalized_items";
    pub const SCORED_ITEMS: &str = "scored_items";
    pub const OUTPUTS: &str = "outputs";
    pub const EMAIL_SENT: &str = "email_sent";
}

/// Fields produced by one step invocation, plus what it consumed
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDelta {
    /// Named fields to merge into the state
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,

    /// Spend reported by the collaborator, in USD
    #[serde(default)]
    pub cost_usd: f64,

    /// Tokens or other units consumed
    #[serde(default)]
    pub tokens: u64,

    /// Problems with a subset of inputs; the delta is still usable
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl StateDelta {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field to the delta
    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    /// Attach consumption figures
    pub fn with_usage(mut self, cost_usd: f64, tokens: u64) -> Self {
        self.cost_usd = cost_usd;
        self.tokens = tokens;
        self
    }

    /// Note a partial failure that didn't prevent a usable result
    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// A non-fatal or terminal error recorded against the run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepError {
    /// Step that produced the error (None for run-level errors)
    pub step: Option<String>,

    /// Classification, e.g. "recoverable", "fatal", "cost_exceeded"
    pub kind: String,

    pub message: String,

    pub occurred_at: DateTime<Utc>,
}

impl StepError {
    pub fn new(step: Option<&str>, kind: &str, message: impl Into<String>) -> Self {
        Self {
            step: step.map(str::to_string),
            kind: kind.to_string(),
            message: message.into(),
            occurred_at: Utc::now(),
        }
    }
}

/// Running totals for the run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Totals {
    pub cost_usd: f64,
    pub tokens: u64,
    pub elapsed_ms: u64,
}

/// The single mutable aggregate owned by the orchestrator for a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    pub run_id: Uuid,

    /// Steps whose output is final
    pub completed: BTreeSet<String>,

    /// Completed steps whose output is partial
    #[serde(default)]
    pub degraded: BTreeSet<String>,

    /// Fields accumulated by steps
    pub fields: BTreeMap<String, Value>,

    /// Which step wrote each field
    pub field_owners: BTreeMap<String, String>,

    /// Errors recorded so far, in order
    pub errors: Vec<StepError>,

    pub totals: Totals,

    /// Wall-clock time spent in each step, across attempts
    #[serde(default)]
    pub step_durations_ms: BTreeMap<String, u64>,

    /// Number of collaborator invocations per step
    #[serde(default)]
    pub step_attempts: BTreeMap<String, u32>,
}

impl PipelineState {
    /// Empty state for a fresh run
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            completed: BTreeSet::new(),
            degraded: BTreeSet::new(),
            fields: BTreeMap::new(),
            field_owners: BTreeMap::new(),
            errors: Vec::new(),
            totals: Totals::default(),
            step_durations_ms: BTreeMap::new(),
            step_attempts: BTreeMap::new(),
        }
    }

    pub fn is_completed(&self, step: &str) -> bool {
        self.completed.contains(step)
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Whether a field is missing or holds an empty value
    pub fn field_is_empty(&self, name: &str) -> bool {
        match self.fields.get(name) {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.is_empty(),
            Some(Value::Array(items)) => items.is_empty(),
            Some(Value::Object(map)) => map.is_empty(),
            Some(_) => false,
        }
    }

    /// Merge a step's delta into the state.
    ///
    /// A no-op when `step` is already completed. Fields owned by another
    /// completed step are left untouched. Returns the names of dropped fields.
    pub fn merge(&mut self, step: &str, delta: &StateDelta) -> Vec<String> {
        if self.is_completed(step) {
            warn!(step, "Step already completed, ignoring replayed delta");
            return delta.fields.keys().cloned().collect();
        }

        let mut dropped = Vec::new();
        for (name, value) in &delta.fields {
            let finalized = self
                .field_owners
                .get(name)
                .is_some_and(|owner| owner != step && self.completed.contains(owner));

            if finalized {
                warn!(step, field = %name, "Refusing to overwrite finalized field");
                dropped.push(name.clone());
                continue;
            }

            self.fields.insert(name.clone(), value.clone());
            self.field_owners.insert(name.clone(), step.to_string());
        }

        dropped
    }

    /// Account for consumption, whether or not the step succeeded
    pub fn record_usage(&mut self, cost_usd: f64, tokens: u64) {
        self.totals.cost_usd += cost_usd.max(0.0);
        self.totals.tokens += tokens;
    }

    /// Account for time spent and attempts made in a step
    pub fn record_timing(&mut self, step: &str, duration_ms: u64, attempts: u32) {
        self.totals.elapsed_ms += duration_ms;
        *self.step_durations_ms.entry(step.to_string()).or_insert(0) += duration_ms;
        *self.step_attempts.entry(step.to_string()).or_insert(0) += attempts;
    }

    pub fn mark_completed(&mut self, step: &str) {
        self.completed.insert(step.to_string());
    }

    /// Mark a completed step as having finished with partial output
    pub fn mark_degraded(&mut self, step: &str) {
        if self.is_completed(step) {
            self.degraded.insert(step.to_string());
        }
    }

    pub fn push_error(&mut self, error: StepError) {
        self.errors.push(error);
    }
}
