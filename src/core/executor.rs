//! Step executor.
//!
//! Wraps exactly one collaborator call per attempt with the cost guardrail,
//! a timeout, retry with exponential backoff, and error classification. The
//! executor never touches `PipelineState`; it returns a report carrying the
//! delta for the orchestrator to merge.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapters::{Collaborator, CollaboratorError, StepContext};
use crate::domain::{PipelineState, RunConfig, StateDelta, StepOutcome, StepReport};

use super::guardrail::CostGuardrail;
use super::idempotency::{generate_idempotency_key, IdempotencyGuard};
use super::pipeline::{FailurePolicy, StepDescriptor};

/// Default per-step timeout (5 min)
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(300);

enum Attempt {
    Finished(Result<StateDelta, CollaboratorError>),
    TimedOut,
    Cancelled,
}

/// Stateless executor for single steps
#[derive(Clone)]
pub struct StepExecutor {
    default_timeout: Duration,
    guard: Option<Arc<dyn IdempotencyGuard>>,
}

impl Default for StepExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_STEP_TIMEOUT)
    }
}

impl StepExecutor {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            default_timeout,
            guard: None,
        }
    }

    /// Hand this guard to collaborators for side-effect dedup
    pub fn with_idempotency_guard(mut self, guard: Arc<dyn IdempotencyGuard>) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Execute one step to a classified outcome
    pub async fn execute(
        &self,
        step: &StepDescriptor,
        collaborator: &dyn Collaborator,
        state: &PipelineState,
        config: &RunConfig,
        guardrail: &CostGuardrail,
        cancel: &CancellationToken,
    ) -> StepReport {
        if let Err(exceeded) = guardrail.check() {
            info!(step = %step.name, "Cost ceiling already exceeded, not invoking");
            return StepReport::without_invocation(StepOutcome::CostExceeded {
                spent_usd: exceeded.spent_usd,
                ceiling_usd: exceeded.ceiling_usd,
            });
        }

        if config.dry_run && step.side_effecting {
            info!(step = %step.name, "Dry run, skipping side-effecting step");
            return StepReport::without_invocation(StepOutcome::Success(StateDelta::new()));
        }

        let started = Instant::now();
        let timeout = step.timeout(self.default_timeout);
        let key = generate_idempotency_key(config.run_id, &step.name, &state.fields);

        let mut report = StepReport::without_invocation(StepOutcome::Cancelled);
        let mut attempt = 0u32;

        let outcome = loop {
            if cancel.is_cancelled() {
                break StepOutcome::Cancelled;
            }
            attempt += 1;
            report.attempts = attempt;

            let attempt_token = cancel.child_token();
            let ctx = StepContext::new(
                &step.name,
                config,
                &key,
                attempt,
                attempt_token.clone(),
                self.guard.clone(),
            );

            debug!(step = %step.name, attempt, collaborator = collaborator.name(), "Invoking collaborator");

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Attempt::Cancelled,
                r = tokio::time::timeout(timeout, collaborator.execute(state, &ctx)) => match r {
                    Ok(result) => Attempt::Finished(result),
                    Err(_) => Attempt::TimedOut,
                },
            };
            attempt_token.cancel();

            let failure = match result {
                Attempt::Cancelled => break StepOutcome::Cancelled,

                Attempt::Finished(Ok(delta)) => {
                    report.cost_usd += delta.cost_usd.max(0.0);
                    report.tokens += delta.tokens;
                    guardrail.record(delta.cost_usd);

                    if let Err(exceeded) = guardrail.check() {
                        break StepOutcome::CostExceeded {
                            spent_usd: exceeded.spent_usd,
                            ceiling_usd: exceeded.ceiling_usd,
                        };
                    }

                    if delta.warnings.is_empty() {
                        break StepOutcome::Success(delta);
                    }
                    break StepOutcome::Recoverable {
                        error: delta.warnings.join("; "),
                        delta: Some(delta),
                    };
                }

                Attempt::Finished(Err(e)) => {
                    report.cost_usd += e.cost_usd().max(0.0);
                    guardrail.record(e.cost_usd());

                    if let Err(exceeded) = guardrail.check() {
                        break StepOutcome::CostExceeded {
                            spent_usd: exceeded.spent_usd,
                            ceiling_usd: exceeded.ceiling_usd,
                        };
                    }

                    if !e.is_transient() {
                        break classify(step, format!("Step '{}' failed: {}", step.name, e));
                    }
                    if !step.retry_policy.should_retry(attempt) {
                        break classify(
                            step,
                            format!("Step '{}' failed after {} attempts: {}", step.name, attempt, e),
                        );
                    }
                    e.to_string()
                }

                Attempt::TimedOut => {
                    let message = format!("Step '{}' timed out after {:?}", step.name, timeout);
                    if !step.retry_safe {
                        break StepOutcome::Fatal(message);
                    }
                    if !step.retry_policy.should_retry(attempt) {
                        break StepOutcome::Recoverable {
                            error: format!("{} ({} attempts)", message, attempt),
                            delta: None,
                        };
                    }
                    message
                }
            };

            let delay = step.retry_policy.delay_for_attempt(attempt);
            warn!(
                step = %step.name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "Step failed, retrying"
            );

            let interrupted = tokio::select! {
                _ = cancel.cancelled() => true,
                _ = tokio::time::sleep(delay) => false,
            };
            if interrupted {
                break StepOutcome::Cancelled;
            }
        };

        report.outcome = outcome;
        report.duration_ms = started.elapsed().as_millis() as u64;
        report
    }
}

/// Map a non-retryable failure to the step's failure policy
fn classify(step: &StepDescriptor, message: String) -> StepOutcome {
    match step.on_failure {
        FailurePolicy::Degrade => StepOutcome::Recoverable {
            error: message,
            delta: None,
        },
        FailurePolicy::Abort => StepOutcome::Fatal(message),
    }
}
