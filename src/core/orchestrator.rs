//! Main orchestrator for pipeline execution.
//!
//! Drives the fixed step sequence as a linear state machine:
//! skip steps already completed in a hydrated checkpoint, execute the rest
//! one at a time, fold each outcome into the pipeline state, and checkpoint
//! before advancing. Every run ends in exactly one `RunResult`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::Collaborator;
use crate::domain::{
    Checkpoint, PipelineState, RunConfig, RunResult, RunStatus, StateDelta, StepError, StepOutcome,
    RUN_START,
};

use super::checkpoint_store::CheckpointStore;
use super::executor::{StepExecutor, DEFAULT_STEP_TIMEOUT};
use super::guardrail::CostGuardrail;
use super::pipeline::{EmptyPolicy, Pipeline, PipelineError, StepDescriptor};
use super::result_builder;

/// A step descriptor bound to the collaborator that implements it
#[derive(Clone)]
pub struct Step {
    pub descriptor: StepDescriptor,
    pub collaborator: Arc<dyn Collaborator>,
}

/// How the step loop ended
enum Halt {
    /// Every step was visited
    Exhausted,
    CostExceeded,
    Fatal,
    Cancelled,
}

/// Main pipeline orchestrator
pub struct Orchestrator {
    steps: Vec<Step>,
    store: Arc<dyn CheckpointStore>,
    executor: StepExecutor,
    cancel: CancellationToken,
}

impl Orchestrator {
    /// Bind each step of `pipeline` to its collaborator
    pub fn new(
        pipeline: &Pipeline,
        mut collaborators: HashMap<String, Arc<dyn Collaborator>>,
        store: Arc<dyn CheckpointStore>,
    ) -> Result<Self, PipelineError> {
        pipeline.validate()?;

        let steps = pipeline
            .steps
            .iter()
            .map(|descriptor| {
                collaborators
                    .remove(&descriptor.name)
                    .map(|collaborator| Step {
                        descriptor: descriptor.clone(),
                        collaborator,
                    })
                    .ok_or_else(|| PipelineError::MissingCollaborator(descriptor.name.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let default_timeout = pipeline
            .default_timeout_seconds
            .map(std::time::Duration::from_secs)
            .unwrap_or(DEFAULT_STEP_TIMEOUT);

        Ok(Self {
            steps,
            store,
            executor: StepExecutor::new(default_timeout),
            cancel: CancellationToken::new(),
        })
    }

    /// Replace the step executor (timeouts, idempotency guard)
    pub fn with_executor(mut self, executor: StepExecutor) -> Self {
        self.executor = executor;
        self
    }

    /// Use an externally owned cancellation token
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that cancels the run in progress
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.descriptor.name.as_str()).collect()
    }

    /// Start a fresh run
    #[instrument(skip(self, config), fields(run_id = %config.run_id))]
    pub async fn run(&self, config: RunConfig) -> RunResult {
        info!("Starting run");
        self.execute_run(config, false).await
    }

    /// Resume a run from its latest checkpoint, using its original config
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn resume(&self, run_id: Uuid) -> RunResult {
        match self.store.load_manifest(run_id).await {
            Ok(Some(config)) => {
                info!("Resuming run");
                self.execute_run(config, true).await
            }
            Ok(None) => failed_before_start(run_id, format!("No record of run {}", run_id)),
            Err(e) => failed_before_start(run_id, format!("Failed to load run manifest: {:#}", e)),
        }
    }

    /// Resume the run named by `config.run_id` with a replacement config
    #[instrument(skip(self, config), fields(run_id = %config.run_id))]
    pub async fn resume_with(&self, config: RunConfig) -> RunResult {
        info!(cost_ceiling_usd = config.cost_ceiling_usd, "Resuming run with new config");
        self.execute_run(config, true).await
    }

    async fn execute_run(&self, config: RunConfig, hydrate: bool) -> RunResult {
        let run_id = config.run_id;

        let lease = match self.store.lock_run(run_id).await {
            Ok(lease) => lease,
            Err(e) => return failed_before_start(run_id, format!("{:#}", e)),
        };
        debug!(guarded = lease.is_guarded(), "Run lease acquired");

        if let Err(e) = self.store.save_manifest(&config).await {
            return failed_before_start(run_id, format!("Failed to save run manifest: {:#}", e));
        }

        let mut state = if hydrate {
            match self.store.load_latest(run_id).await {
                Ok(Some(checkpoint)) => {
                    info!(
                        step = %checkpoint.step_name,
                        sequence = checkpoint.sequence,
                        completed = checkpoint.state.completed.len(),
                        "Hydrated from checkpoint"
                    );
                    checkpoint.state
                }
                Ok(None) => {
                    info!("No prior state, starting from the first step");
                    PipelineState::new(run_id)
                }
                Err(e) => {
                    return failed_before_start(run_id, format!("Failed to load checkpoint: {:#}", e))
                }
            }
        } else {
            PipelineState::new(run_id)
        };

        let guardrail =
            CostGuardrail::with_spent(run_id, config.cost_ceiling_usd, state.totals.cost_usd);

        let halt = self.drive(&config, &mut state, &guardrail).await;
        let status = self.status_for(&halt, &state);

        let result = result_builder::build(&state, status, &self.step_names(), Utc::now());
        info!(
            status = %result.status,
            completed = result.completed_steps.len(),
            errors = result.errors.len(),
            cost_usd = result.cost_usd,
            "Run finished"
        );
        result
    }

    /// The step loop. Returns how it ended; `state` holds everything else.
    async fn drive(
        &self,
        config: &RunConfig,
        state: &mut PipelineState,
        guardrail: &CostGuardrail,
    ) -> Halt {
        for step in &self.steps {
            let name = step.descriptor.name.as_str();

            if state.is_completed(name) {
                info!(step = name, "Step already completed, skipping");
                continue;
            }

            if self.cancel.is_cancelled() {
                return self.cancelled(state, name, 0.0).await;
            }

            info!(step = name, "Running step");
            let report = self
                .executor
                .execute(
                    &step.descriptor,
                    step.collaborator.as_ref(),
                    state,
                    config,
                    guardrail,
                    &self.cancel,
                )
                .await;

            state.record_usage(report.cost_usd, report.tokens);
            state.record_timing(name, report.duration_ms, report.attempts);

            match report.outcome {
                StepOutcome::Success(delta) => {
                    let skipped = config.dry_run && step.descriptor.side_effecting;
                    if let Err(message) = self.apply_delta(state, &step.descriptor, &delta, skipped) {
                        return self.halt_fatal(state, name, message).await;
                    }
                    if let Err(halt) = self.checkpoint(state, name, None).await {
                        return halt;
                    }
                    info!(step = name, attempts = report.attempts, "Step completed");
                }

                StepOutcome::Recoverable { error, delta } => {
                    warn!(step = name, error = %error, "Step degraded");
                    state.push_error(StepError::new(Some(name), "recoverable", error));

                    // Degraded with usable output counts as finished
                    let (finished, halted_at) = match delta {
                        Some(delta) => {
                            if let Err(message) = self.apply_delta(state, &step.descriptor, &delta, false) {
                                return self.halt_fatal(state, name, message).await;
                            }
                            state.mark_degraded(name);
                            (name, None)
                        }
                        None => (last_finished(&self.steps, state, name), Some(name)),
                    };
                    if let Err(halt) = self.checkpoint(state, finished, halted_at).await {
                        return halt;
                    }
                }

                StepOutcome::CostExceeded { spent_usd, ceiling_usd } => {
                    let message = format!(
                        "Cost ceiling exceeded at step '{}': ${:.4} spent of ${:.4}",
                        name, spent_usd, ceiling_usd
                    );
                    warn!(step = name, spent_usd, ceiling_usd, "Stopping run, cost ceiling exceeded");
                    state.push_error(StepError::new(Some(name), "cost_exceeded", message));

                    let finished = last_finished(&self.steps, state, name);
                    if let Err(halt) = self.checkpoint(state, finished, Some(name)).await {
                        return halt;
                    }
                    return Halt::CostExceeded;
                }

                StepOutcome::Fatal(message) => {
                    return self.halt_fatal(state, name, message).await;
                }

                StepOutcome::Cancelled => {
                    return self.cancelled(state, name, report.cost_usd).await;
                }
            }
        }

        Halt::Exhausted
    }

    /// Merge a delta, enforce the empty-result policy and mark the step done.
    /// Returns the fatal message when the policy rejects the output.
    fn apply_delta(
        &self,
        state: &mut PipelineState,
        step: &StepDescriptor,
        delta: &StateDelta,
        skipped: bool,
    ) -> Result<(), String> {
        let dropped = state.merge(&step.name, delta);
        if !dropped.is_empty() {
            warn!(step = %step.name, ?dropped, "Dropped writes to finalized fields");
        }

        if !skipped && step.on_empty == EmptyPolicy::Abort {
            if let Some(field) = &step.output_field {
                if state.field_is_empty(field) {
                    return Err(format!(
                        "Step '{}' produced no results in '{}'",
                        step.name, field
                    ));
                }
            }
        }

        state.mark_completed(&step.name);
        Ok(())
    }

    /// Write a checkpoint and wait for it to land. A failed write stops the
    /// run; advancing without it would make resume unsafe.
    async fn checkpoint(
        &self,
        state: &mut PipelineState,
        step_name: &str,
        halted_at: Option<&str>,
    ) -> Result<(), Halt> {
        let mut checkpoint = Checkpoint::new(step_name, state.clone());
        if let Some(halted) = halted_at {
            checkpoint = checkpoint.with_halted_at(halted);
        }

        match self.store.save(&checkpoint).await {
            Ok(receipt) => {
                info!(step = step_name, sequence = receipt.sequence, "Checkpoint saved");
                Ok(())
            }
            Err(e) => {
                error!(step = step_name, error = %e, "Checkpoint write failed");
                state.push_error(StepError::new(
                    Some(halted_at.unwrap_or(step_name)),
                    "fatal",
                    format!("Checkpoint write failed: {:#}", e),
                ));
                Err(Halt::Fatal)
            }
        }
    }

    async fn halt_fatal(&self, state: &mut PipelineState, step: &str, message: String) -> Halt {
        error!(step, error = %message, "Step failed fatally");
        state.push_error(StepError::new(Some(step), "fatal", message));

        // A failed write is recorded in state by `checkpoint`; the run fails either way
        let finished = last_finished(&self.steps, state, step);
        let _ = self.checkpoint(state, finished, Some(step)).await;
        Halt::Fatal
    }

    /// Only whole steps are persisted, so the in-flight step gets no
    /// checkpoint of its own. Spend it already billed is saved against the
    /// last finished step so a resumed guardrail starts from the true total.
    async fn cancelled(&self, state: &mut PipelineState, step: &str, billed_usd: f64) -> Halt {
        warn!(step, billed_usd, "Run cancelled");
        state.push_error(StepError::new(Some(step), "cancelled", "Run cancelled"));

        if billed_usd > 0.0 {
            let finished = last_finished(&self.steps, state, step);
            let _ = self.checkpoint(state, finished, Some(step)).await;
        }
        Halt::Cancelled
    }

    fn status_for(&self, halt: &Halt, state: &PipelineState) -> RunStatus {
        match halt {
            Halt::Exhausted => {
                let all_completed = self
                    .steps
                    .iter()
                    .all(|s| state.is_completed(&s.descriptor.name));

                // Errors from earlier attempts don't count; only output that
                // is still partial does
                if all_completed && state.degraded.is_empty() {
                    RunStatus::Success
                } else {
                    RunStatus::Partial
                }
            }
            Halt::CostExceeded | Halt::Cancelled => RunStatus::Partial,
            Halt::Fatal => RunStatus::Failed,
        }
    }
}

/// Most recent step, in pipeline order before `current`, that has finished
fn last_finished<'a>(steps: &'a [Step], state: &PipelineState, current: &str) -> &'a str {
    steps
        .iter()
        .take_while(|s| s.descriptor.name != current)
        .filter(|s| state.is_completed(&s.descriptor.name))
        .last()
        .map(|s| s.descriptor.name.as_str())
        .unwrap_or(RUN_START)
}

/// Result for a run that could not even begin
fn failed_before_start(run_id: Uuid, message: String) -> RunResult {
    error!(%run_id, error = %message, "Run could not start");
    let mut state = PipelineState::new(run_id);
    state.push_error(StepError::new(None, "fatal", message));
    result_builder::build(&state, RunStatus::Failed, &[], Utc::now())
}
