//! Append-only checkpoint storage.
//!
//! A store keeps every checkpoint written for a run and hands back the most
//! recent one on `load_latest`. Each save gets the next per-run sequence
//! number and a `saved_at` that never goes backwards within a run, so
//! ordering by `(saved_at, sequence)` is the same as ordering by sequence
//! even when several steps finish inside one clock tick.

use std::collections::HashMap;
use std::fs::File;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use uuid::Uuid;

use crate::domain::{Checkpoint, CheckpointReceipt, CheckpointSummary, RunConfig};

/// Durable storage for checkpoints and run manifests
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist a new checkpoint. Never overwrites an earlier one; the write
    /// is either fully visible or not visible at all.
    async fn save(&self, checkpoint: &Checkpoint) -> Result<CheckpointReceipt>;

    /// The most recent checkpoint for a run, or `None` for an unknown run
    async fn load_latest(&self, run_id: Uuid) -> Result<Option<Checkpoint>>;

    /// Every checkpoint of a run in sequence order
    async fn list(&self, run_id: Uuid) -> Result<Vec<CheckpointSummary>>;

    /// Persist the configuration a run was started with
    async fn save_manifest(&self, config: &RunConfig) -> Result<()>;

    async fn load_manifest(&self, run_id: Uuid) -> Result<Option<RunConfig>>;

    /// All runs known to the store
    async fn list_runs(&self) -> Result<Vec<Uuid>>;

    /// Claim exclusive use of a run for this process.
    ///
    /// Stores without cross-process locking hand out an unguarded lease.
    async fn lock_run(&self, _run_id: Uuid) -> Result<RunLease> {
        Ok(RunLease::unguarded())
    }
}

/// Exclusive claim on a run, released on drop
#[derive(Debug)]
pub struct RunLease {
    lock_file: Option<File>,
}

impl RunLease {
    pub fn unguarded() -> Self {
        Self { lock_file: None }
    }

    pub(crate) fn with_lock_file(file: File) -> Self {
        Self {
            lock_file: Some(file),
        }
    }

    pub fn is_guarded(&self) -> bool {
        self.lock_file.is_some()
    }
}

impl Drop for RunLease {
    fn drop(&mut self) {
        if let Some(file) = self.lock_file.take() {
            let _ = fs2::FileExt::unlock(&file);
        }
    }
}

/// Timestamp for a new checkpoint: now, but never earlier than the previous one
pub(crate) fn next_saved_at(previous: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now().trunc_subsecs(6);
    match previous {
        Some(prev) if prev > now => prev,
        _ => now,
    }
}

#[derive(Default)]
struct RunRecord {
    manifest: Option<RunConfig>,
    checkpoints: Vec<Checkpoint>,
}

/// Process-local store, for embedding and tests
#[derive(Default)]
pub struct MemoryCheckpointStore {
    runs: Mutex<HashMap<Uuid, RunRecord>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn runs(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, RunRecord>> {
        self.runs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<CheckpointReceipt> {
        let mut runs = self.runs();
        let record = runs.entry(checkpoint.run_id).or_default();

        let last = record.checkpoints.last();
        let sequence = last.map_or(1, |c| c.sequence + 1);
        let saved_at = next_saved_at(last.map(|c| c.saved_at));

        let mut stored = checkpoint.clone();
        stored.sequence = sequence;
        stored.saved_at = saved_at;
        record.checkpoints.push(stored);

        Ok(CheckpointReceipt { sequence, saved_at })
    }

    async fn load_latest(&self, run_id: Uuid) -> Result<Option<Checkpoint>> {
        let runs = self.runs();
        Ok(runs.get(&run_id).and_then(|record| {
            record
                .checkpoints
                .iter()
                .max_by_key(|c| (c.saved_at, c.sequence))
                .cloned()
        }))
    }

    async fn list(&self, run_id: Uuid) -> Result<Vec<CheckpointSummary>> {
        let runs = self.runs();
        Ok(runs
            .get(&run_id)
            .map(|record| record.checkpoints.iter().map(Checkpoint::summary).collect())
            .unwrap_or_default())
    }

    async fn save_manifest(&self, config: &RunConfig) -> Result<()> {
        self.runs().entry(config.run_id).or_default().manifest = Some(config.clone());
        Ok(())
    }

    async fn load_manifest(&self, run_id: Uuid) -> Result<Option<RunConfig>> {
        Ok(self.runs().get(&run_id).and_then(|r| r.manifest.clone()))
    }

    async fn list_runs(&self) -> Result<Vec<Uuid>> {
        Ok(self.runs().keys().copied().collect())
    }
}
