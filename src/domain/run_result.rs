//! Terminal summary handed back to the caller.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::StepError;

/// Terminal status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Partial,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// An output artifact written by the aggregate step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputDescriptor {
    pub format: String,
    pub path: String,
}

/// Read-only summary of a finished run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub status: RunStatus,

    /// Steps completed, in pipeline order
    pub completed_steps: Vec<String>,

    /// Item counts per collection field (e.g. discovered, scored_items)
    pub stage_counts: BTreeMap<String, usize>,

    pub errors: Vec<StepError>,
    pub outputs: Vec<OutputDescriptor>,
    pub email_sent: bool,

    pub cost_usd: f64,
    pub tokens: u64,
    pub duration_ms: u64,

    pub finished_at: DateTime<Utc>,
}
