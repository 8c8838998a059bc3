//! Command-line interface for jobscout.
//!
//! Provides commands for starting runs, resuming interrupted runs,
//! inspecting checkpoints and showing the resolved configuration.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::warn;
use uuid::Uuid;

use crate::adapters::{Collaborator, CommandCollaborator};
use crate::config;
use crate::core::{Orchestrator, Pipeline, StepExecutor};
use crate::domain::{OutputFormat, RunConfig, RunResult, RunStatus};

/// jobscout - Durable, checkpointed job-search pipeline orchestrator
#[derive(Parser, Debug)]
#[command(name = "jobscout")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start a new run
    Run {
        /// Pipeline definition (YAML). Every step needs a `command`.
        #[arg(short, long)]
        pipeline: PathBuf,

        /// Résumé or profile document
        #[arg(short, long)]
        input: PathBuf,

        /// Search criteria document
        #[arg(short, long)]
        criteria: Option<PathBuf>,

        /// Use this run ID instead of a generated one
        #[arg(long)]
        run_id: Option<Uuid>,

        /// Skip side-effecting steps
        #[arg(long)]
        dry_run: bool,

        /// Cap on items processed per step
        #[arg(long)]
        max_items: Option<usize>,

        /// Output formats (json, csv, markdown)
        #[arg(short, long, value_delimiter = ',')]
        format: Vec<OutputFormat>,

        /// Spend ceiling in USD (defaults to the configured value)
        #[arg(long)]
        cost_ceiling: Option<f64>,
    },

    /// Resume a run from its latest checkpoint
    Resume {
        /// Run ID to resume
        run_id: Uuid,

        /// Pipeline definition (YAML)
        #[arg(short, long)]
        pipeline: PathBuf,

        /// Raise or lower the spend ceiling for the rest of the run
        #[arg(long)]
        cost_ceiling: Option<f64>,
    },

    /// Show the latest checkpoint of a run
    Status {
        /// Run ID (UUID)
        run_id: Uuid,
    },

    /// List every checkpoint of a run
    Checkpoints {
        /// Run ID (UUID)
        run_id: Uuid,
    },

    /// List known runs
    Runs {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run {
                pipeline,
                input,
                criteria,
                run_id,
                dry_run,
                max_items,
                format,
                cost_ceiling,
            } => {
                let settings = &config::config()?.settings;
                let mut run_config = RunConfig::new(
                    input,
                    cost_ceiling.unwrap_or(settings.cost_ceiling_usd),
                )
                .with_dry_run(dry_run);
                if let Some(run_id) = run_id {
                    run_config = run_config.with_run_id(run_id);
                }
                run_config.criteria_path = criteria;
                run_config.max_items = max_items;
                if !format.is_empty() {
                    run_config.output_formats = format.into_iter().collect::<BTreeSet<_>>();
                }

                let orchestrator = build_orchestrator(&pipeline)?;
                let result = with_ctrl_c(&orchestrator, orchestrator.run(run_config)).await;
                report(&result)
            }
            Commands::Resume {
                run_id,
                pipeline,
                cost_ceiling,
            } => {
                let orchestrator = build_orchestrator(&pipeline)?;
                let result = match cost_ceiling {
                    Some(ceiling) => {
                        let previous = orchestrator
                            .store()
                            .load_manifest(run_id)
                            .await?
                            .with_context(|| format!("No record of run {}", run_id))?;
                        let run_config = previous.with_cost_ceiling(ceiling);
                        with_ctrl_c(&orchestrator, orchestrator.resume_with(run_config)).await
                    }
                    None => with_ctrl_c(&orchestrator, orchestrator.resume(run_id)).await,
                };
                report(&result)
            }
            Commands::Status { run_id } => show_status(run_id).await,
            Commands::Checkpoints { run_id } => list_checkpoints(run_id).await,
            Commands::Runs { limit } => list_runs(limit).await,
            Commands::Config => show_config(),
        }
    }
}

/// Load a pipeline and bind each step to its subprocess collaborator
fn build_orchestrator(pipeline_path: &Path) -> Result<Orchestrator> {
    let pipeline = Pipeline::from_file(pipeline_path)?;
    pipeline.validate()?;

    let mut collaborators: HashMap<String, Arc<dyn Collaborator>> = HashMap::new();
    for step in &pipeline.steps {
        let Some(command) = &step.command else {
            bail!("Step '{}' has no command configured", step.name);
        };
        let collaborator = CommandCollaborator::new(step.name.clone(), command)
            .with_context(|| format!("Invalid command for step '{}'", step.name))?;
        collaborators.insert(step.name.clone(), Arc::new(collaborator));
    }

    let cfg = config::config()?;
    let default_timeout = pipeline
        .default_timeout_seconds
        .unwrap_or(cfg.settings.step_timeout_seconds);

    let orchestrator = Orchestrator::new(&pipeline, collaborators, cfg.open_store()?)?
        .with_executor(StepExecutor::new(Duration::from_secs(default_timeout)));
    Ok(orchestrator)
}

/// Drive `run` to completion, cancelling it on Ctrl-C
async fn with_ctrl_c<F>(orchestrator: &Orchestrator, run: F) -> RunResult
where
    F: std::future::Future<Output = RunResult>,
{
    let token = orchestrator.cancellation_token();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after the current step");
            token.cancel();
        }
    });

    let result = run.await;
    watcher.abort();
    result
}

/// Print a run result and turn failure into a non-zero exit
fn report(result: &RunResult) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(result)?);

    match result.status {
        RunStatus::Success => {
            eprintln!("\n[Run {} completed successfully]", result.run_id);
        }
        RunStatus::Partial => {
            eprintln!(
                "\n[Run {} finished partially; resume with: jobscout resume {} --pipeline <file>]",
                result.run_id, result.run_id
            );
        }
        RunStatus::Failed => {
            let reason = result
                .errors
                .last()
                .map(|e| e.message.as_str())
                .unwrap_or("unknown error");
            eprintln!("\n[Run {} failed: {}]", result.run_id, reason);
            std::process::exit(1);
        }
    }

    Ok(())
}

/// Show the latest checkpoint of a run
async fn show_status(run_id: Uuid) -> Result<()> {
    let store = config::open_store()?;

    let Some(checkpoint) = store.load_latest(run_id).await? else {
        bail!("No checkpoints for run {}", run_id);
    };
    let state = &checkpoint.state;

    println!("Run ID: {}", run_id);
    if let Some(manifest) = store.load_manifest(run_id).await? {
        println!("Input: {}", manifest.input_path.display());
        println!("Cost ceiling: ${:.2}", manifest.cost_ceiling_usd);
        println!("Dry run: {}", manifest.dry_run);
    }
    println!("Last checkpoint: #{} after '{}' at {}", checkpoint.sequence, checkpoint.step_name, checkpoint.saved_at);
    if let Some(halted) = &checkpoint.halted_at {
        println!("Halted at: {}", halted);
    }
    println!("Spent: ${:.4} ({} tokens)", state.totals.cost_usd, state.totals.tokens);
    println!("\nCompleted steps:");
    for step in &state.completed {
        let attempts = state.step_attempts.get(step).copied().unwrap_or(0);
        let ms = state.step_durations_ms.get(step).copied().unwrap_or(0);
        println!("  {}: {} attempt(s), {}ms", step, attempts, ms);
    }
    if !state.errors.is_empty() {
        println!("\nErrors:");
        for error in &state.errors {
            println!(
                "  [{}] {}: {}",
                error.kind,
                error.step.as_deref().unwrap_or("-"),
                error.message
            );
        }
    }

    Ok(())
}

/// List every checkpoint of a run
async fn list_checkpoints(run_id: Uuid) -> Result<()> {
    let store = config::open_store()?;
    let checkpoints = store.list(run_id).await?;

    if checkpoints.is_empty() {
        println!("No checkpoints for run {}", run_id);
        return Ok(());
    }

    println!("{:<6} {:<22} {:<22} {:<10} {}", "SEQ", "STEP", "HALTED AT", "COMPLETED", "SAVED AT");
    println!("{}", "-".repeat(95));

    for cp in checkpoints {
        println!(
            "{:<6} {:<22} {:<22} {:<10} {}",
            cp.sequence,
            cp.step_name,
            cp.halted_at.as_deref().unwrap_or("-"),
            cp.completed_steps,
            cp.saved_at
        );
    }

    Ok(())
}

/// List known runs with their latest checkpoint
async fn list_runs(limit: usize) -> Result<()> {
    let store = config::open_store()?;

    let mut runs = Vec::new();
    for run_id in store.list_runs().await? {
        let latest = store.load_latest(run_id).await?;
        runs.push((run_id, latest));
    }

    if runs.is_empty() {
        println!("No runs found");
        return Ok(());
    }

    // Most recently checkpointed first
    runs.sort_by(|a, b| {
        let a_ts = a.1.as_ref().map(|c| c.saved_at);
        let b_ts = b.1.as_ref().map(|c| c.saved_at);
        b_ts.cmp(&a_ts)
    });

    println!("{:<38} {:<22} {:<10} {:<10}", "RUN ID", "LAST STEP", "COMPLETED", "SPENT");
    println!("{}", "-".repeat(82));

    for (run_id, latest) in runs.into_iter().take(limit) {
        match latest {
            Some(cp) => println!(
                "{:<38} {:<22} {:<10} ${:<9.4}",
                run_id,
                cp.step_name,
                cp.state.completed.len(),
                cp.state.totals.cost_usd
            ),
            None => println!("{:<38} {:<22} {:<10} {:<10}", run_id, "(not started)", 0, "-"),
        }
    }

    Ok(())
}

/// Show resolved configuration
fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("jobscout configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home (engine state): {}", cfg.home.display());
    println!("  Checkpoints:         {} ({:?})", cfg.store.location.display(), cfg.store.backend);
    println!();
    println!("Orchestrator:");
    println!("  Cost ceiling:  ${:.2}", cfg.settings.cost_ceiling_usd);
    println!("  Step timeout:  {}s", cfg.settings.step_timeout_seconds);

    Ok(())
}
