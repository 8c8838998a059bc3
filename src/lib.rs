//! jobscout - Durable, checkpointed pipeline orchestrator
//!
//! Runs a fixed sequence of job-search steps (parse a résumé, parse search
//! criteria, discover sources, fetch postings, normalize, score, write
//! outputs, notify) with per-step retry, a per-run cost ceiling and
//! crash-safe resume.
//!
//! # Architecture
//!
//! The system is built around checkpoints:
//! - Steps never mutate state; they return a delta that the orchestrator merges
//! - A checkpoint is written after every finished step, before the next starts
//! - An interrupted run resumes from its latest checkpoint, skipping finished steps
//!
//! # Modules
//!
//! - `adapters`: Collaborator trait and the subprocess collaborator
//! - `core`: Orchestration logic (Pipeline, Executor, Guardrail, Stores)
//! - `domain`: Data structures (RunConfig, PipelineState, Checkpoint, RunResult)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Start a run
//! jobscout run --pipeline job-search.yaml --input resume.pdf
//!
//! # Inspect it
//! jobscout status <run-id>
//!
//! # Resume an interrupted run
//! jobscout resume <run-id> --pipeline job-search.yaml
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use adapters::{Collaborator, CollaboratorError, StepContext};
pub use core::{CheckpointStore, Orchestrator, Pipeline, StepDescriptor};
pub use domain::{PipelineState, RunConfig, RunResult, RunStatus, StateDelta};
