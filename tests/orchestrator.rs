//! Orchestrator Integration Tests
//!
//! End-to-end runs of the standard eight-step pipeline against scripted
//! collaborators and an in-memory checkpoint store.

mod common;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use common::{standard_delta, test_pipeline, Behavior, Crew, Scripted, STEPS, STEP_COST};
use jobscout::core::{
    CheckpointStore, EmptyPolicy, FailurePolicy, MemoryCheckpointStore, Orchestrator, Pipeline,
};
use jobscout::domain::{
    fields, Checkpoint, CheckpointReceipt, CheckpointSummary, RunConfig, RunStatus, StateDelta,
    RUN_START,
};
use uuid::Uuid;
use serde_json::json;

fn orchestrator(pipeline: &Pipeline, crew: &Crew, store: Arc<MemoryCheckpointStore>) -> Orchestrator {
    Orchestrator::new(pipeline, crew.collaborators(), store).unwrap()
}

fn config(ceiling: f64) -> RunConfig {
    RunConfig::new("/tmp/resume.pdf", ceiling)
}

async fn checkpoint_steps(store: &MemoryCheckpointStore, config: &RunConfig) -> BTreeSet<String> {
    store
        .list(config.run_id)
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.step_name)
        .collect()
}

#[tokio::test]
async fn test_all_steps_succeed() {
    let crew = Crew::standard();
    let store = Arc::new(MemoryCheckpointStore::new());
    let config = config(10.0);

    let result = orchestrator(&test_pipeline(), &crew, store.clone())
        .run(config.clone())
        .await;

    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(result.completed_steps, STEPS.to_vec());
    assert!(result.errors.is_empty());
    assert!(result.email_sent);
    assert_eq!(result.outputs.len(), 1);
    assert_eq!(result.stage_counts[fields::SCORED_ITEMS], 3);
    assert!((result.cost_usd - 8.0 * STEP_COST).abs() < 1e-9);
    assert_eq!(result.tokens, 800);

    // One checkpoint per step, in order, the last one naming the last step
    let listed = store.list(config.run_id).await.unwrap();
    assert_eq!(listed.len(), 8);
    let names: Vec<&str> = listed.iter().map(|c| c.step_name.as_str()).collect();
    assert_eq!(names, STEPS.to_vec());

    let latest = store.load_latest(config.run_id).await.unwrap().unwrap();
    assert_eq!(latest.step_name, "notify");
    assert_eq!(latest.sequence, 8);
    assert!(latest.halted_at.is_none());
}

#[tokio::test]
async fn test_fatal_at_step_three_keeps_earlier_checkpoints_only() {
    let mut pipeline = test_pipeline();
    pipeline.steps[3].on_failure = FailurePolicy::Abort;

    let crew = Crew::standard().with(
        "fetch-raw-items",
        Scripted::new("fetch-raw-items", Behavior::permanent("board returned 403")),
    );
    let store = Arc::new(MemoryCheckpointStore::new());
    let config = config(10.0);

    let result = orchestrator(&pipeline, &crew, store.clone()).run(config.clone()).await;

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].step.as_deref(), Some("fetch-raw-items"));
    assert_eq!(result.errors[0].kind, "fatal");
    assert_eq!(result.completed_steps, STEPS[..3].to_vec());

    let expected: BTreeSet<String> = STEPS[..3].iter().map(|s| s.to_string()).collect();
    assert_eq!(checkpoint_steps(&store, &config).await, expected);

    let latest = store.load_latest(config.run_id).await.unwrap().unwrap();
    assert_eq!(latest.step_name, "discover-entities");
    assert_eq!(latest.halted_at.as_deref(), Some("fetch-raw-items"));

    // Permanent failures are not retried; nothing after the failure runs
    assert_eq!(crew.calls("fetch-raw-items"), 1);
    assert_eq!(crew.calls("normalize-items"), 0);
}

#[tokio::test]
async fn test_fatal_on_first_step_still_yields_result() {
    let mut pipeline = test_pipeline();
    pipeline.steps[0].on_failure = FailurePolicy::Abort;

    let crew = Crew::standard().with(
        "parse-input",
        Scripted::new("parse-input", Behavior::permanent("unreadable pdf")),
    );
    let store = Arc::new(MemoryCheckpointStore::new());
    let config = config(10.0);

    let result = orchestrator(&pipeline, &crew, store.clone()).run(config.clone()).await;

    assert_eq!(result.status, RunStatus::Failed);
    assert!(result.completed_steps.is_empty());
    assert!(result.stage_counts.is_empty());
    assert_eq!(result.errors.len(), 1);

    let latest = store.load_latest(config.run_id).await.unwrap().unwrap();
    assert_eq!(latest.step_name, RUN_START);
    assert_eq!(latest.halted_at.as_deref(), Some("parse-input"));
    assert!(latest.state.completed.is_empty());
}

#[tokio::test]
async fn test_cost_exceeded_at_step_four() {
    // Steps 0-3 spend 1.00; step 4 pushes the total to 1.25
    let crew = Crew::standard();
    let store = Arc::new(MemoryCheckpointStore::new());
    let config = config(1.1);

    let result = orchestrator(&test_pipeline(), &crew, store.clone())
        .run(config.clone())
        .await;

    assert_eq!(result.status, RunStatus::Partial);
    assert_eq!(result.completed_steps, STEPS[..4].to_vec());
    assert!(!result.completed_steps.contains(&"normalize-items".to_string()));
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].kind, "cost_exceeded");

    // The billed spend of step 4 is still accounted for
    assert!((result.cost_usd - 5.0 * STEP_COST).abs() < 1e-9);

    let latest = store.load_latest(config.run_id).await.unwrap().unwrap();
    assert_eq!(latest.step_name, "fetch-raw-items");
    assert_eq!(latest.halted_at.as_deref(), Some("normalize-items"));
    for step in &STEPS[..4] {
        let delta = standard_delta(step);
        for (name, value) in &delta.fields {
            assert_eq!(latest.state.field(name), Some(value), "{} lost", name);
        }
    }
    assert!(latest.state.field(fields::NORMALIZED_ITEMS).is_none());

    // No step runs once the ceiling is crossed
    assert_eq!(crew.calls("score-items"), 0);
}

#[tokio::test]
async fn test_degraded_step_does_not_block_later_steps() {
    let crew = Crew::standard().with(
        "fetch-raw-items",
        Scripted::new("fetch-raw-items", Behavior::transient("connection reset")),
    );
    let store = Arc::new(MemoryCheckpointStore::new());
    let config = config(10.0);

    let result = orchestrator(&test_pipeline(), &crew, store.clone())
        .run(config.clone())
        .await;

    assert_eq!(result.status, RunStatus::Partial);
    assert_eq!(crew.calls("fetch-raw-items"), 3);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].kind, "recoverable");
    assert!(!result.completed_steps.contains(&"fetch-raw-items".to_string()));
    assert_eq!(result.completed_steps.len(), 7);
    assert_eq!(crew.calls("notify"), 1);

    // Checkpoints only ever name finished steps
    let listed = store.list(config.run_id).await.unwrap();
    assert!(listed.iter().all(|c| c.step_name != "fetch-raw-items"));
    assert!(listed
        .iter()
        .any(|c| c.halted_at.as_deref() == Some("fetch-raw-items")));
}

#[tokio::test]
async fn test_partial_delta_marks_step_completed() {
    let delta = standard_delta("fetch-raw-items").with_warning("board-b timed out");
    let crew = Crew::standard().with(
        "fetch-raw-items",
        Scripted::succeeding("fetch-raw-items", delta),
    );
    let store = Arc::new(MemoryCheckpointStore::new());

    let result = orchestrator(&test_pipeline(), &crew, store).run(config(10.0)).await;

    assert_eq!(result.status, RunStatus::Partial);
    assert_eq!(result.completed_steps.len(), 8);
    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].message.contains("board-b timed out"));
    assert_eq!(result.stage_counts[fields::RAW_ITEMS], 3);
}

#[tokio::test]
async fn test_empty_discovery_aborts() {
    let crew = Crew::standard().with(
        "discover-entities",
        Scripted::succeeding(
            "discover-entities",
            StateDelta::new().with_field(fields::DISCOVERED, json!([])),
        ),
    );
    let store = Arc::new(MemoryCheckpointStore::new());
    let config = config(10.0);

    let result = orchestrator(&test_pipeline(), &crew, store.clone())
        .run(config.clone())
        .await;

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.completed_steps, STEPS[..2].to_vec());
    assert!(result.errors[0].message.contains("produced no results"));
    assert_eq!(crew.calls("fetch-raw-items"), 0);
}

#[tokio::test]
async fn test_empty_output_tolerated_when_policy_allows() {
    let mut pipeline = test_pipeline();
    pipeline.steps[2].on_empty = EmptyPolicy::Tolerate;

    let crew = Crew::standard().with(
        "discover-entities",
        Scripted::succeeding(
            "discover-entities",
            StateDelta::new().with_field(fields::DISCOVERED, json!([])),
        ),
    );
    let store = Arc::new(MemoryCheckpointStore::new());

    let result = orchestrator(&pipeline, &crew, store).run(config(10.0)).await;

    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(result.stage_counts[fields::DISCOVERED], 0);
}

#[tokio::test]
async fn test_dry_run_skips_side_effects() {
    let crew = Crew::standard();
    let store = Arc::new(MemoryCheckpointStore::new());

    let result = orchestrator(&test_pipeline(), &crew, store)
        .run(config(10.0).with_dry_run(true))
        .await;

    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(result.completed_steps.len(), 8);
    assert_eq!(crew.calls("notify"), 0);
    assert!(!result.email_sent);
}

#[tokio::test]
async fn test_timeout_on_unsafe_step_is_fatal() {
    let mut pipeline = test_pipeline();
    pipeline.steps[7].timeout_ms = Some(20);

    let crew = Crew::standard().with("notify", Scripted::new("notify", Behavior::Hang));
    let store = Arc::new(MemoryCheckpointStore::new());

    let result = orchestrator(&pipeline, &crew, store).run(config(10.0)).await;

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(crew.calls("notify"), 1);
    assert!(result.errors[0].message.contains("timed out"));
    assert_eq!(result.completed_steps.len(), 7);
}

#[tokio::test]
async fn test_cancellation_writes_no_checkpoint_for_in_flight_step() {
    let notify = Arc::new(tokio::sync::Notify::new());
    let crew = Crew::standard().with(
        "score-items",
        Scripted::new("score-items", Behavior::SignalAndHang(notify.clone())),
    );
    let store = Arc::new(MemoryCheckpointStore::new());
    let config = config(10.0);

    let orchestrator = orchestrator(&test_pipeline(), &crew, store.clone());
    let token = orchestrator.cancellation_token();
    tokio::spawn(async move {
        notify.notified().await;
        token.cancel();
    });

    let result = tokio::time::timeout(Duration::from_secs(5), orchestrator.run(config.clone()))
        .await
        .expect("cancelled run must not wait out the step timeout");

    assert_eq!(result.status, RunStatus::Partial);
    assert_eq!(result.completed_steps, STEPS[..5].to_vec());
    assert_eq!(result.errors.last().unwrap().kind, "cancelled");

    let listed = store.list(config.run_id).await.unwrap();
    assert_eq!(listed.len(), 5);
    assert!(listed.iter().all(|c| c.halted_at.is_none()));
}

#[tokio::test]
async fn test_pre_cancelled_run_invokes_nothing() {
    let crew = Crew::standard();
    let store = Arc::new(MemoryCheckpointStore::new());
    let orchestrator = orchestrator(&test_pipeline(), &crew, store);
    orchestrator.cancellation_token().cancel();

    let result = orchestrator.run(config(10.0)).await;

    assert_eq!(result.status, RunStatus::Partial);
    assert!(result.completed_steps.is_empty());
    assert!(STEPS.iter().all(|s| crew.calls(s) == 0));
}

#[tokio::test]
async fn test_concurrent_runs_are_independent() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let crew_a = Crew::standard();
    let crew_b = Crew::standard();
    let a = orchestrator(&test_pipeline(), &crew_a, store.clone());
    let b = orchestrator(&test_pipeline(), &crew_b, store.clone());
    let config_a = config(10.0);
    let config_b = config(1.1);

    let (result_a, result_b) = tokio::join!(a.run(config_a.clone()), b.run(config_b.clone()));

    assert_eq!(result_a.status, RunStatus::Success);
    assert_eq!(result_b.status, RunStatus::Partial);
    assert_eq!(store.list(config_a.run_id).await.unwrap().len(), 8);
    assert_eq!(store.list(config_b.run_id).await.unwrap().len(), 5);
}

/// Memory store whose Nth save fails
struct FailingSaveStore {
    inner: MemoryCheckpointStore,
    fail_on: u32,
    saves: AtomicU32,
}

#[async_trait]
impl CheckpointStore for FailingSaveStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<CheckpointReceipt> {
        if self.saves.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_on {
            bail!("disk full");
        }
        self.inner.save(checkpoint).await
    }

    async fn load_latest(&self, run_id: Uuid) -> Result<Option<Checkpoint>> {
        self.inner.load_latest(run_id).await
    }

    async fn list(&self, run_id: Uuid) -> Result<Vec<CheckpointSummary>> {
        self.inner.list(run_id).await
    }

    async fn save_manifest(&self, config: &RunConfig) -> Result<()> {
        self.inner.save_manifest(config).await
    }

    async fn load_manifest(&self, run_id: Uuid) -> Result<Option<RunConfig>> {
        self.inner.load_manifest(run_id).await
    }

    async fn list_runs(&self) -> Result<Vec<Uuid>> {
        self.inner.list_runs().await
    }
}

#[tokio::test]
async fn test_failed_checkpoint_write_stops_the_run() {
    let crew = Crew::standard();
    let store = Arc::new(FailingSaveStore {
        inner: MemoryCheckpointStore::new(),
        fail_on: 3,
        saves: AtomicU32::new(0),
    });
    let config = config(10.0);

    let result = Orchestrator::new(&test_pipeline(), crew.collaborators(), store.clone())
        .unwrap()
        .run(config.clone())
        .await;

    assert_eq!(result.status, RunStatus::Failed);
    let last = result.errors.last().unwrap();
    assert_eq!(last.kind, "fatal");
    assert!(last.message.contains("Checkpoint write failed"));
    assert!(last.message.contains("disk full"));

    // The step whose checkpoint didn't land ran; nothing after it did
    assert_eq!(crew.calls("discover-entities"), 1);
    assert!(STEPS[3..].iter().all(|s| crew.calls(s) == 0));

    let listed = store.list(config.run_id).await.unwrap();
    let names: Vec<&str> = listed.iter().map(|c| c.step_name.as_str()).collect();
    assert_eq!(names, STEPS[..2].to_vec());
}
