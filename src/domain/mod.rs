//! Domain types for the jobscout orchestrator.
//!
//! This module contains the core data structures:
//! - RunConfig: Immutable run input
//! - PipelineState: State accumulated by steps
//! - Checkpoint: Durable state snapshots
//! - StepOutcome: Classified step results
//! - RunResult: Terminal run summary

pub mod checkpoint;
pub mod outcome;
pub mod run_config;
pub mod run_result;
pub mod state;

// Re-export commonly used types
pub use checkpoint::{Checkpoint, CheckpointReceipt, CheckpointSummary, RUN_START};
pub use outcome::{StepOutcome, StepReport};
pub use run_config::{OutputFormat, RunConfig};
pub use run_result::{OutputDescriptor, RunResult, RunStatus};
pub use state::{fields, PipelineState, StateDelta, StepError, Totals};
