//! Shared fixtures: scripted collaborators and the standard pipeline.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use jobscout::adapters::{Collaborator, CollaboratorError, StepContext};
use jobscout::core::{Pipeline, RetryPolicy};
use jobscout::domain::{fields, PipelineState, StateDelta};
use serde_json::json;
use tokio::sync::Notify;

/// What a scripted collaborator does on one invocation
#[derive(Clone)]
pub enum Behavior {
    Succeed(StateDelta),
    Transient { message: String, cost_usd: f64 },
    Permanent { message: String, cost_usd: f64 },
    /// Never return
    Hang,
    /// Signal, then never return
    SignalAndHang(Arc<Notify>),
    Sleep(Duration, StateDelta),
}

impl Behavior {
    pub fn transient(message: &str) -> Self {
        Self::Transient {
            message: message.to_string(),
            cost_usd: 0.0,
        }
    }

    pub fn permanent(message: &str) -> Self {
        Self::Permanent {
            message: message.to_string(),
            cost_usd: 0.0,
        }
    }
}

/// Collaborator that replays a script, then repeats a fallback behavior
pub struct Scripted {
    name: String,
    script: Mutex<VecDeque<Behavior>>,
    fallback: Behavior,
    calls: AtomicU32,
    keys: Mutex<Vec<String>>,
}

impl Scripted {
    pub fn new(name: &str, fallback: Behavior) -> Self {
        Self {
            name: name.to_string(),
            script: Mutex::new(VecDeque::new()),
            fallback,
            calls: AtomicU32::new(0),
            keys: Mutex::new(Vec::new()),
        }
    }

    pub fn succeeding(name: &str, delta: StateDelta) -> Self {
        Self::new(name, Behavior::Succeed(delta))
    }

    /// Queue behaviors to play before the fallback
    pub fn then(self, behavior: Behavior) -> Self {
        self.script.lock().unwrap().push_back(behavior);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Idempotency keys seen, one per call
    pub fn keys(&self) -> Vec<String> {
        self.keys.lock().unwrap().clone()
    }
}

#[async_trait]
impl Collaborator for Scripted {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        _state: &PipelineState,
        ctx: &StepContext<'_>,
    ) -> Result<StateDelta, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.keys.lock().unwrap().push(ctx.idempotency_key.to_string());

        let behavior = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        match behavior {
            Behavior::Succeed(delta) => Ok(delta),
            Behavior::Transient { message, cost_usd } => {
                Err(CollaboratorError::transient(message).with_cost(cost_usd))
            }
            Behavior::Permanent { message, cost_usd } => {
                Err(CollaboratorError::permanent(message).with_cost(cost_usd))
            }
            Behavior::Hang => std::future::pending().await,
            Behavior::SignalAndHang(notify) => {
                notify.notify_one();
                std::future::pending().await
            }
            Behavior::Sleep(duration, delta) => {
                tokio::time::sleep(duration).await;
                Ok(delta)
            }
        }
    }
}

pub const STEPS: [&str; 8] = [
    "parse-input",
    "parse-criteria",
    "discover-entities",
    "fetch-raw-items",
    "normalize-items",
    "score-items",
    "aggregate-outputs",
    "notify",
];

/// Cost charged by every standard step
pub const STEP_COST: f64 = 0.25;

/// Deterministic output of each standard step
pub fn standard_delta(step: &str) -> StateDelta {
    let (field, value) = match step {
        "parse-input" => (fields::PROFILE, json!({"name": "Ada", "skills": ["rust", "sql"]})),
        "parse-criteria" => (fields::PREFERENCES, json!({"remote": true, "min_salary": 120000})),
        "discover-entities" => (fields::DISCOVERED, json!(["board-a", "board-b"])),
        "fetch-raw-items" => (
            fields::RAW_ITEMS,
            json!([{"id": 1}, {"id": 2}, {"id": 3}]),
        ),
        "normalize-items" => (
            fields::NORMALIZED_ITEMS,
            json!([{"id": 1, "title": "Rust engineer"}, {"id": 2, "title": "SRE"}, {"id": 3, "title": "DBA"}]),
        ),
        "score-items" => (
            fields::SCORED_ITEMS,
            json!([{"id": 1, "score": 0.92}, {"id": 2, "score": 0.61}, {"id": 3, "score": 0.2}]),
        ),
        "aggregate-outputs" => (
            fields::OUTPUTS,
            json!([{"format": "json", "path": "/tmp/jobscout/jobs.json"}]),
        ),
        "notify" => (fields::EMAIL_SENT, json!(true)),
        other => panic!("no standard delta for {}", other),
    };

    StateDelta::new()
        .with_field(field, value)
        .with_usage(STEP_COST, 100)
}

/// Retry fast enough for tests
pub fn fast_retries() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_delay_ms: 1,
        max_delay_ms: 5,
        backoff_multiplier: 2.0,
    }
}

/// The standard pipeline with millisecond backoff
pub fn test_pipeline() -> Pipeline {
    let mut pipeline = Pipeline::job_search();
    for step in &mut pipeline.steps {
        step.retry_policy = fast_retries();
    }
    pipeline
}

/// A set of collaborators, with handles kept for inspecting call counts
pub struct Crew {
    pub members: HashMap<String, Arc<Scripted>>,
}

impl Crew {
    /// Every standard step succeeds with its deterministic delta
    pub fn standard() -> Self {
        let members = STEPS
            .iter()
            .map(|step| (step.to_string(), Arc::new(Scripted::succeeding(step, standard_delta(step)))))
            .collect();
        Self { members }
    }

    /// Replace one step's collaborator
    pub fn with(mut self, step: &str, collaborator: Scripted) -> Self {
        self.members.insert(step.to_string(), Arc::new(collaborator));
        self
    }

    pub fn calls(&self, step: &str) -> u32 {
        self.members[step].calls()
    }

    pub fn get(&self, step: &str) -> &Scripted {
        &self.members[step]
    }

    /// Collaborator map in the form the orchestrator takes
    pub fn collaborators(&self) -> HashMap<String, Arc<dyn Collaborator>> {
        self.members
            .iter()
            .map(|(name, c)| (name.clone(), Arc::clone(c) as Arc<dyn Collaborator>))
            .collect()
    }
}
