//! Pipeline and step definitions.
//!
//! A pipeline is an ordered list of step descriptors. Branching such as
//! "stop if nothing was discovered" is expressed as per-step policy flags,
//! not as a graph.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::fields;

/// Problems with a pipeline definition
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("Pipeline name cannot be empty")]
    EmptyName,

    #[error("Pipeline must have at least one step")]
    NoSteps,

    #[error("Step {0} has an empty name")]
    EmptyStepName(usize),

    #[error("Duplicate step name '{0}'")]
    DuplicateStep(String),

    #[error("Step '{0}' aborts on empty output but names no output field")]
    MissingOutputField(String),

    #[error("No collaborator registered for step '{0}'")]
    MissingCollaborator(String),
}

/// A complete pipeline definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    /// Pipeline name
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Timeout for steps that don't set their own
    pub default_timeout_seconds: Option<u64>,

    /// Ordered list of steps to execute
    pub steps: Vec<StepDescriptor>,
}

impl Pipeline {
    /// Load a pipeline from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline file: {}", path.display()))?;

        Self::from_yaml(&content)
    }

    /// Parse a pipeline from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse pipeline YAML")
    }

    /// The standard eight-step job search pipeline
    pub fn job_search() -> Self {
        Self {
            name: "job-search".to_string(),
            description: "Parse a résumé, find matching postings, score them and report".to_string(),
            default_timeout_seconds: None,
            steps: vec![
                StepDescriptor::new("parse-input").with_output_field(fields::PROFILE),
                StepDescriptor::new("parse-criteria").with_output_field(fields::PREFERENCES),
                StepDescriptor::new("discover-entities")
                    .with_output_field(fields::DISCOVERED)
                    .with_on_empty(EmptyPolicy::Abort),
                StepDescriptor::new("fetch-raw-items").with_output_field(fields::RAW_ITEMS),
                StepDescriptor::new("normalize-items").with_output_field(fields::NORMALIZED_ITEMS),
                StepDescriptor::new("score-items").with_output_field(fields::SCORED_ITEMS),
                StepDescriptor::new("aggregate-outputs")
                    .with_output_field(fields::OUTPUTS)
                    .with_on_failure(FailurePolicy::Abort),
                StepDescriptor::new("notify")
                    .with_output_field(fields::EMAIL_SENT)
                    .side_effecting()
                    .with_retry_safe(false),
            ],
        }
    }

    /// Validate the pipeline definition
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.name.is_empty() {
            return Err(PipelineError::EmptyName);
        }

        if self.steps.is_empty() {
            return Err(PipelineError::NoSteps);
        }

        let mut seen = HashSet::new();
        for (i, step) in self.steps.iter().enumerate() {
            if step.name.is_empty() {
                return Err(PipelineError::EmptyStepName(i));
            }
            if !seen.insert(step.name.as_str()) {
                return Err(PipelineError::DuplicateStep(step.name.clone()));
            }
            if step.on_empty == EmptyPolicy::Abort && step.output_field.is_none() {
                return Err(PipelineError::MissingOutputField(step.name.clone()));
            }
        }

        Ok(())
    }

    /// Step names in execution order
    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name.as_str()).collect()
    }
}

/// What a permanent failure or exhausted retries turn into
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Record the error and continue with later steps
    #[default]
    Degrade,

    /// Stop the run as failed
    Abort,
}

/// What an empty output field means for the step
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptyPolicy {
    /// Propagate the empty collection
    #[default]
    Tolerate,

    /// Treat empty output as fatal
    Abort,
}

/// A single step in a pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDescriptor {
    /// Step name (unique within pipeline)
    pub name: String,

    /// Retry policy for transient failures
    #[serde(default)]
    pub retry_policy: RetryPolicy,

    /// Override timeout for this step, in milliseconds
    pub timeout_ms: Option<u64>,

    /// Safe to re-run after a timeout
    #[serde(default = "default_true")]
    pub retry_safe: bool,

    #[serde(default)]
    pub on_failure: FailurePolicy,

    #[serde(default)]
    pub on_empty: EmptyPolicy,

    /// Field checked by `on_empty`
    pub output_field: Option<String>,

    /// Applies external side effects; skipped in dry runs
    #[serde(default)]
    pub side_effecting: bool,

    /// Command for the subprocess collaborator (CLI pipelines)
    #[serde(default)]
    pub command: Option<Vec<String>>,
}

fn default_true() -> bool {
    true
}

impl StepDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            retry_policy: RetryPolicy::default(),
            timeout_ms: None,
            retry_safe: true,
            on_failure: FailurePolicy::default(),
            on_empty: EmptyPolicy::default(),
            output_field: None,
            side_effecting: false,
            command: None,
        }
    }

    pub fn with_output_field(mut self, field: impl Into<String>) -> Self {
        self.output_field = Some(field.into());
        self
    }

    pub fn with_on_empty(mut self, policy: EmptyPolicy) -> Self {
        self.on_empty = policy;
        self
    }

    pub fn with_on_failure(mut self, policy: FailurePolicy) -> Self {
        self.on_failure = policy;
        self
    }

    pub fn with_retry_safe(mut self, retry_safe: bool) -> Self {
        self.retry_safe = retry_safe;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn side_effecting(mut self) -> Self {
        self.side_effecting = true;
        self
    }

    /// Get the effective timeout for this step
    pub fn timeout(&self, default: Duration) -> Duration {
        self.timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(default)
    }
}

/// Retry policy for failed steps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay between retries in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay() -> u64 {
    1000
}
fn default_max_delay() -> u64 {
    30000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// Calculate delay for a specific attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms.min(self.max_delay_ms));
        }

        let delay = self.initial_delay_ms as f64
            * self.backoff_multiplier.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}
