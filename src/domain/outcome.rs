//! Result of one step execution.

use super::state::StateDelta;

/// Classified outcome of a single step.
///
/// Transient, never persisted: the orchestrator folds it into the pipeline
/// state before checkpointing.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// The step produced a delta to merge
    Success(StateDelta),

    /// Non-fatal failure. The run continues; the step is marked completed
    /// only when it still produced a usable delta.
    Recoverable {
        error: String,
        delta: Option<StateDelta>,
    },

    /// The cost ceiling was crossed before or during the step
    CostExceeded { spent_usd: f64, ceiling_usd: f64 },

    /// Unrecoverable failure; the run stops
    Fatal(String),

    /// The run was cancelled while this step was in flight
    Cancelled,
}

/// Outcome plus what the execution cost
#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    pub outcome: StepOutcome,

    /// Collaborator invocations made (0 when short-circuited)
    pub attempts: u32,

    pub duration_ms: u64,

    /// Spend across all attempts, including failed but billed ones
    pub cost_usd: f64,

    pub tokens: u64,
}

impl StepReport {
    /// Report for an outcome reached without invoking the collaborator
    pub fn without_invocation(outcome: StepOutcome) -> Self {
        Self {
            outcome,
            attempts: 0,
            duration_ms: 0,
            cost_usd: 0.0,
            tokens: 0,
        }
    }
}
