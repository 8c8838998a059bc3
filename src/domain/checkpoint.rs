//! Durable snapshots of run state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::PipelineState;

/// Step name used before any step has finished
pub const RUN_START: &str = "__start__";

/// An immutable snapshot taken after a step finishes.
///
/// `step_name` always names a step that truly finished (or `RUN_START`).
/// When the run halts or a step degrades without output, the snapshot still
/// names the last finished step and records the offending one in
/// `halted_at`. `sequence` and `saved_at` are assigned by the store at save
/// time; the values on a freshly built checkpoint are placeholders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: Uuid,

    /// Name of the step just finished
    pub step_name: String,

    /// Monotonic per-run sequence number (1-based once stored)
    pub sequence: u64,

    pub saved_at: DateTime<Utc>,

    /// Step that degraded or stopped the run after `step_name`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub halted_at: Option<String>,

    /// Full state at that point
    pub state: PipelineState,
}

impl Checkpoint {
    pub fn new(step_name: impl Into<String>, state: PipelineState) -> Self {
        Self {
            run_id: state.run_id,
            step_name: step_name.into(),
            sequence: 0,
            saved_at: Utc::now(),
            halted_at: None,
            state,
        }
    }

    pub fn with_halted_at(mut self, step: impl Into<String>) -> Self {
        self.halted_at = Some(step.into());
        self
    }

    /// Lightweight view used for listings
    pub fn summary(&self) -> CheckpointSummary {
        CheckpointSummary {
            run_id: self.run_id,
            step_name: self.step_name.clone(),
            sequence: self.sequence,
            saved_at: self.saved_at,
            halted_at: self.halted_at.clone(),
            completed_steps: self.state.completed.len(),
        }
    }
}

/// Where a saved checkpoint landed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointReceipt {
    pub sequence: u64,
    pub saved_at: DateTime<Utc>,
}

/// Listing entry for a stored checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointSummary {
    pub run_id: Uuid,
    pub step_name: String,
    pub sequence: u64,
    pub saved_at: DateTime<Utc>,
    pub halted_at: Option<String>,
    pub completed_steps: usize,
}
