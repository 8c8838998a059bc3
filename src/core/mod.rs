//! Core orchestration logic.
//!
//! This module contains:
//! - Pipeline: Step descriptors and retry policy
//! - CostGuardrail: Per-run spend ceiling
//! - StepExecutor: One step to a classified outcome
//! - CheckpointStore: Durable snapshots (file, SQLite, memory)
//! - Orchestrator: Main execution engine

pub mod checkpoint_store;
pub mod executor;
pub mod file_store;
pub mod guardrail;
pub mod idempotency;
pub mod orchestrator;
pub mod pipeline;
pub mod result_builder;
pub mod sqlite_store;

// Re-export commonly used types
pub use checkpoint_store::{CheckpointStore, MemoryCheckpointStore, RunLease};
pub use executor::{StepExecutor, DEFAULT_STEP_TIMEOUT};
pub use file_store::FileCheckpointStore;
pub use guardrail::{CostExceeded, CostGuardrail};
pub use idempotency::{generate_idempotency_key, hash_input, Claim, IdempotencyGuard};
pub use orchestrator::{Orchestrator, Step};
pub use pipeline::{
    EmptyPolicy, FailurePolicy, Pipeline, PipelineError, RetryPolicy, StepDescriptor,
};
pub use sqlite_store::SqliteCheckpointStore;
