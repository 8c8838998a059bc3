//! File-based checkpoint store.
//!
//! Layout under the base directory:
//!
//! ```text
//! <run_id>/run.json                       run manifest
//! <run_id>/.lock                          held while a process drives the run
//! <run_id>/checkpoints/000000000001.json  one file per checkpoint
//! ```
//!
//! Checkpoints are written to a temp file in the same directory, synced and
//! renamed into place, so a reader sees either the whole file or nothing.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tempfile::NamedTempFile;
use tracing::debug;
use uuid::Uuid;

use super::checkpoint_store::{next_saved_at, CheckpointStore, RunLease};
use crate::domain::{Checkpoint, CheckpointReceipt, CheckpointSummary, RunConfig};

const CHECKPOINTS_DIR: &str = "checkpoints";
const MANIFEST_FILE: &str = "run.json";
const LOCK_FILE: &str = ".lock";

/// Checkpoint store backed by one JSON file per checkpoint
#[derive(Clone)]
pub struct FileCheckpointStore {
    base_dir: PathBuf,

    /// Serializes sequence assignment within this process
    write_lock: Arc<Mutex<()>>,
}

impl FileCheckpointStore {
    /// Open a store rooted at `base_dir`, creating it if needed
    pub fn open(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir)
            .with_context(|| format!("Failed to create checkpoint directory: {}", base_dir.display()))?;

        Ok(Self {
            base_dir,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn run_dir(&self, run_id: Uuid) -> PathBuf {
        self.base_dir.join(run_id.to_string())
    }

    fn checkpoints_dir(&self, run_id: Uuid) -> PathBuf {
        self.run_dir(run_id).join(CHECKPOINTS_DIR)
    }
}

fn checkpoint_file_name(sequence: u64) -> String {
    format!("{:012}.json", sequence)
}

/// Sequence numbers present in a checkpoints directory, ascending.
/// Temp files and anything else that isn't `<digits>.json` are ignored.
fn stored_sequences(dir: &Path) -> Result<Vec<u64>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut sequences = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("Failed to list {}", dir.display()))? {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            if let Some(seq) = name.strip_suffix(".json").and_then(|s| s.parse::<u64>().ok()) {
                sequences.push(seq);
            }
        }
    }

    sequences.sort_unstable();
    Ok(sequences)
}

fn read_checkpoint(path: &Path) -> Result<Checkpoint> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open checkpoint: {}", path.display()))?;
    serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("Failed to parse checkpoint: {}", path.display()))
}

/// Write `value` as JSON to `path` via temp file + rename
fn write_atomically<T: serde::Serialize>(dir: &Path, path: &Path, value: &T) -> Result<()> {
    let tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
    {
        let mut writer = BufWriter::new(tmp.as_file());
        serde_json::to_writer(&mut writer, value).context("Failed to serialize")?;
        writer.flush().context("Failed to flush")?;
    }
    tmp.as_file().sync_all().context("Failed to sync")?;
    tmp.persist(path)
        .with_context(|| format!("Failed to move file into place: {}", path.display()))?;
    Ok(())
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<CheckpointReceipt> {
        let dir = self.checkpoints_dir(checkpoint.run_id);
        let write_lock = Arc::clone(&self.write_lock);
        let mut stored = checkpoint.clone();

        tokio::task::spawn_blocking(move || {
            let _guard = write_lock.lock().unwrap_or_else(|e| e.into_inner());

            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;

            let previous = match stored_sequences(&dir)?.last() {
                Some(&seq) => Some(read_checkpoint(&dir.join(checkpoint_file_name(seq)))?),
                None => None,
            };

            stored.sequence = previous.as_ref().map_or(1, |c| c.sequence + 1);
            stored.saved_at = next_saved_at(previous.map(|c| c.saved_at));

            let path = dir.join(checkpoint_file_name(stored.sequence));
            write_atomically(&dir, &path, &stored)?;

            debug!(
                run_id = %stored.run_id,
                step = %stored.step_name,
                sequence = stored.sequence,
                "Checkpoint written"
            );

            Ok(CheckpointReceipt {
                sequence: stored.sequence,
                saved_at: stored.saved_at,
            })
        })
        .await?
    }

    async fn load_latest(&self, run_id: Uuid) -> Result<Option<Checkpoint>> {
        let dir = self.checkpoints_dir(run_id);

        tokio::task::spawn_blocking(move || {
            // saved_at is non-decreasing in sequence order, so the highest
            // sequence is also the greatest (saved_at, sequence)
            match stored_sequences(&dir)?.last() {
                Some(&seq) => read_checkpoint(&dir.join(checkpoint_file_name(seq))).map(Some),
                None => Ok(None),
            }
        })
        .await?
    }

    async fn list(&self, run_id: Uuid) -> Result<Vec<CheckpointSummary>> {
        let dir = self.checkpoints_dir(run_id);

        tokio::task::spawn_blocking(move || {
            stored_sequences(&dir)?
                .into_iter()
                .map(|seq| read_checkpoint(&dir.join(checkpoint_file_name(seq))).map(|c| c.summary()))
                .collect()
        })
        .await?
    }

    async fn save_manifest(&self, config: &RunConfig) -> Result<()> {
        let run_dir = self.run_dir(config.run_id);
        let config = config.clone();

        tokio::task::spawn_blocking(move || {
            fs::create_dir_all(&run_dir)
                .with_context(|| format!("Failed to create {}", run_dir.display()))?;
            write_atomically(&run_dir, &run_dir.join(MANIFEST_FILE), &config)
        })
        .await?
    }

    async fn load_manifest(&self, run_id: Uuid) -> Result<Option<RunConfig>> {
        let path = self.run_dir(run_id).join(MANIFEST_FILE);

        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(None);
        }

        let content = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read manifest: {}", path.display()))?;
        let config = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse manifest: {}", path.display()))?;

        Ok(Some(config))
    }

    async fn list_runs(&self) -> Result<Vec<Uuid>> {
        let mut runs = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.base_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    if let Ok(uuid) = Uuid::parse_str(name) {
                        runs.push(uuid);
                    }
                }
            }
        }

        Ok(runs)
    }

    async fn lock_run(&self, run_id: Uuid) -> Result<RunLease> {
        let run_dir = self.run_dir(run_id);

        tokio::task::spawn_blocking(move || {
            fs::create_dir_all(&run_dir)
                .with_context(|| format!("Failed to create {}", run_dir.display()))?;

            let lock_path = run_dir.join(LOCK_FILE);
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&lock_path)
                .with_context(|| format!("Failed to open lock file: {}", lock_path.display()))?;

            fs2::FileExt::try_lock_exclusive(&file)
                .with_context(|| format!("Run {} is already active in another process", run_id))?;

            Ok(RunLease::with_lock_file(file))
        })
        .await?
    }
}
