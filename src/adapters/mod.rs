//! Collaborator interfaces for step logic.
//!
//! Every step delegates its domain work (parsing, scraping, scoring,
//! delivery) to a collaborator. The orchestrator depends only on the
//! `Collaborator` trait and never on a concrete step implementation.

pub mod command;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::core::idempotency::{Claim, IdempotencyGuard};
use crate::domain::{PipelineState, RunConfig, StateDelta};

// Re-export the subprocess collaborator
pub use command::CommandCollaborator;

/// Classified failure returned by a collaborator
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CollaboratorError {
    /// Network errors, rate limits and other failures worth retrying
    #[error("transient failure: {message}")]
    Transient { message: String, cost_usd: f64 },

    /// Validation errors and malformed input; retrying will not help
    #[error("permanent failure: {message}")]
    Permanent { message: String, cost_usd: f64 },
}

impl CollaboratorError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            cost_usd: 0.0,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
            cost_usd: 0.0,
        }
    }

    /// Record that the failed call was still billed
    pub fn with_cost(mut self, cost: f64) -> Self {
        match &mut self {
            Self::Transient { cost_usd, .. } | Self::Permanent { cost_usd, .. } => {
                *cost_usd = cost;
            }
        }
        self
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn cost_usd(&self) -> f64 {
        match self {
            Self::Transient { cost_usd, .. } | Self::Permanent { cost_usd, .. } => *cost_usd,
        }
    }
}

/// Per-invocation context handed to a collaborator
pub struct StepContext<'a> {
    /// Step being executed
    pub step: &'a str,

    /// Configuration of the current run
    pub config: &'a RunConfig,

    /// Content-addressed key for deduplicating external side effects
    pub idempotency_key: &'a str,

    /// 1-based attempt number
    pub attempt: u32,

    /// Fires when the run is cancelled or the attempt is abandoned
    pub cancel: CancellationToken,

    guard: Option<Arc<dyn IdempotencyGuard>>,
}

impl<'a> StepContext<'a> {
    pub fn new(
        step: &'a str,
        config: &'a RunConfig,
        idempotency_key: &'a str,
        attempt: u32,
        cancel: CancellationToken,
        guard: Option<Arc<dyn IdempotencyGuard>>,
    ) -> Self {
        Self {
            step,
            config,
            idempotency_key,
            attempt,
            cancel,
            guard,
        }
    }

    /// Claim this step's idempotency key before applying a side effect.
    ///
    /// Without a configured guard every claim is `Fresh`.
    pub async fn claim(&self) -> Result<Claim, CollaboratorError> {
        match &self.guard {
            Some(guard) => guard
                .claim(self.idempotency_key)
                .await
                .map_err(|e| CollaboratorError::transient(format!("idempotency guard: {:#}", e))),
            None => Ok(Claim::Fresh),
        }
    }
}

/// Capability implemented once per step
#[async_trait]
pub trait Collaborator: Send + Sync {
    /// Human-readable collaborator name
    fn name(&self) -> &str;

    /// Run the step against a read-only view of the state and return a delta
    async fn execute(
        &self,
        state: &PipelineState,
        ctx: &StepContext<'_>,
    ) -> Result<StateDelta, CollaboratorError>;
}
